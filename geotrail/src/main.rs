//! geotrail - offline-resilient location trail recorder
//!
//! Terminal UI that records the device position every minute, shows the
//! history in a table, and keeps capturing into a durable local queue when
//! the terminal is unfocused or the remote store is unreachable.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/geotrail/queue.db (~/.local/share/geotrail/queue.db)
//! - Identity: $XDG_DATA_HOME/geotrail/identity.json
//! - Logs: $XDG_STATE_HOME/geotrail/geotrail.log (~/.local/state/geotrail/geotrail.log)
//! - Config: $XDG_CONFIG_HOME/geotrail/config.toml (~/.config/geotrail/config.toml)

mod app;
mod process_lock;
mod ui;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{self, DisableFocusChange, EnableFocusChange, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use geotrail_core::agent::{AgentEvent, AgentHandle, CaptureAgent};
use geotrail_core::capture::{relay_agent_events, CaptureLoop, HistoryRefresher};
use geotrail_core::connectivity::{ConnectivityProbe, NetworkStatus};
use geotrail_core::display::{DisplayRow, HEADERS};
use geotrail_core::geo::haversine_distance;
use geotrail_core::identity::{IdentityStore, JsonFileIdentityStore, USER_ID_KEY};
use geotrail_core::lifecycle::{LifecycleEvent, LifecycleMonitor, NoWakeLock, Visibility};
use geotrail_core::{
    AppContext, Config, LocationQueue, LocationStore, RestLocationStore, Sampler, SyncCoordinator,
    SyncOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};

use crate::app::{App, KeyAction, TableSurface};
use crate::process_lock::{
    acquire_agent_guard, is_agent_running, try_acquire_agent_guard, ForegroundWakeLock,
};

#[derive(Parser)]
#[command(name = "geotrail")]
#[command(about = "Record a location trail that survives going offline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show the live location table and capture while focused (default)
    Run,
    /// Run the headless background agent until Ctrl+C
    Agent,
    /// Capture one location through the agent path
    Record,
    /// Push pending locations to the remote store
    Sync,
    /// Show configuration, identity and queue state
    Status,
    /// List locations waiting to be synced
    Queue,
    /// Print the location history from the remote store
    History,
    /// Great-circle distance between two points in decimal degrees
    Distance {
        #[arg(allow_negative_numbers = true)]
        lat1: f64,
        #[arg(allow_negative_numbers = true)]
        lon1: f64,
        #[arg(allow_negative_numbers = true)]
        lat2: f64,
        #[arg(allow_negative_numbers = true)]
        lon2: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Pure computation; no config, logging or storage needed
    if let Some(Command::Distance {
        lat1,
        lon1,
        lat2,
        lon2,
    }) = cli.command
    {
        print_distance((lat1, lon1), (lat2, lon2));
        return Ok(());
    }

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging (to file, not stdout since we have a TUI)
    let _log_guard =
        geotrail_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("geotrail starting up");

    let runtime = Runtime::new().context("failed to start async runtime")?;

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_foreground(&runtime, &config),
        Command::Agent => run_agent(&runtime, &config),
        Command::Record => run_record(&runtime, &config),
        Command::Sync => run_sync(&runtime, &config),
        Command::Status => print_status(&config),
        Command::Queue => print_queue(),
        Command::History => print_history(&runtime, &config),
        Command::Distance { .. } => Ok(()),
    };

    runtime.shutdown_timeout(Duration::from_secs(2));
    tracing::info!("geotrail shutting down");

    result
}

// ============================================
// Shared setup
// ============================================

/// Open and migrate the queue; `None` disables background capture only
fn open_queue() -> Option<Arc<LocationQueue>> {
    let path = Config::queue_path();
    tracing::info!(path = %path.display(), "Opening location queue");

    let queue = match LocationQueue::open(&path) {
        Ok(queue) => queue,
        Err(e) => {
            tracing::error!(error = %e, "Location queue unavailable; background capture disabled");
            return None;
        }
    };
    if let Err(e) = queue.migrate() {
        tracing::error!(error = %e, "Location queue migration failed; background capture disabled");
        return None;
    }
    Some(Arc::new(queue))
}

/// Remote store, or `None` when no remote is configured (queue-only mode)
fn remote_store(config: &Config) -> Result<Option<Arc<dyn LocationStore>>> {
    if !config.remote.is_ready() {
        tracing::info!("Remote store not configured; records stay in the local queue");
        return Ok(None);
    }
    let store = RestLocationStore::new(&config.remote).context("failed to create remote client")?;
    Ok(Some(Arc::new(store)))
}

fn require_remote(config: &Config) -> Result<Arc<dyn LocationStore>> {
    remote_store(config)?.with_context(|| {
        format!(
            "remote store is not configured: set [remote] base_url and api_key in {}",
            Config::config_path().display()
        )
    })
}

fn app_context(store: Option<&Arc<dyn LocationStore>>, runtime: &Runtime) -> Result<AppContext> {
    let identity = JsonFileIdentityStore::new(Config::identity_path());
    let online = match store {
        Some(store) => runtime.block_on(store.is_reachable()),
        None => false,
    };
    let ctx = AppContext::initialize(&identity, online).context("failed to load user id")?;
    tracing::info!(user_id = %ctx.user_id(), online, "Context initialized");
    Ok(ctx)
}

fn sampler(config: &Config) -> Result<Arc<Sampler>> {
    let sampler = Sampler::from_config(&config.sampler).context("invalid sampler configuration")?;
    if !sampler.has_provider() {
        tracing::warn!("No position provider configured; every sample will be unavailable");
    }
    Ok(Arc::new(sampler))
}

fn coordinator(
    queue: Option<&Arc<LocationQueue>>,
    store: Option<&Arc<dyn LocationStore>>,
    network: &NetworkStatus,
) -> Option<Arc<SyncCoordinator>> {
    Some(Arc::new(SyncCoordinator::new(
        queue?.clone(),
        store?.clone(),
        network.clone(),
    )))
}

/// Shutdown signal raised by Ctrl+C
fn ctrlc_shutdown() -> Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        let _ = tx.send(true);
    })
    .context("failed to set Ctrl+C handler")?;
    Ok(rx)
}

// ============================================
// geotrail run
// ============================================

fn run_foreground(runtime: &Runtime, config: &Config) -> Result<()> {
    let queue_path = Config::queue_path();
    let store = remote_store(config)?;
    let ctx = app_context(store.as_ref(), runtime)?;
    let sampler = sampler(config)?;
    let queue = open_queue();
    let sync = coordinator(queue.as_ref(), store.as_ref(), ctx.network());

    // A running `geotrail agent` already owns periodic capture
    let agent_guard =
        try_acquire_agent_guard(&queue_path).context("failed to acquire process lock")?;
    if agent_guard.is_none() {
        println!("geotrail agent is running; background capture stays with it.");
        tracing::info!("Agent lock held elsewhere; in-process agent serves requests only");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

    let surface = Arc::new(TableSurface::default());

    let (agent, handle) = CaptureAgent::new(
        ctx.clone(),
        sampler.clone(),
        queue.clone(),
        sync,
        config.agent.wake_interval(),
    );
    let agent = if agent_guard.is_some() {
        agent
    } else {
        agent.without_periodic_wake()
    };
    runtime.spawn(agent.run(shutdown_rx.clone()));

    if let Err(e) = runtime.block_on(handle.store_user_id(ctx.user_id().clone())) {
        tracing::warn!(error = %e, "Could not register user id with the capture agent");
    }

    runtime.spawn(relay_agent_events(
        handle.subscribe(),
        surface.clone(),
        shutdown_rx.clone(),
    ));

    let refresher = store
        .as_ref()
        .map(|store| {
            Arc::new(
                HistoryRefresher::new(store.clone(), surface.clone())
                    .with_network(ctx.network().clone()),
            )
        });
    if let Some(refresher) = refresher.clone() {
        runtime.spawn(async move {
            if let Err(e) = refresher.refresh().await {
                tracing::warn!(error = %e, "Initial history load failed");
            }
        });
    }

    if let Some(store) = &store {
        let probe = ConnectivityProbe::new(
            store.clone(),
            config.connectivity.probe_interval(),
            lifecycle_tx.clone(),
        );
        runtime.spawn(probe.run(ctx.network().is_online(), shutdown_rx.clone()));
    }

    let monitor = LifecycleMonitor::new(
        Visibility::Visible,
        ctx.network().clone(),
        Some(handle.clone()),
        Box::new(ForegroundWakeLock::new(queue_path)),
        refresher.clone(),
    );
    let visibility = monitor.visibility();
    runtime.spawn(monitor.run(lifecycle_rx, shutdown_rx.clone()));

    let capture = CaptureLoop::new(
        ctx.clone(),
        sampler,
        store.clone(),
        Some(handle.clone()),
        surface.clone(),
    )
    .with_period(config.capture.period())
    .with_minute_alignment(config.capture.align_to_minute);
    runtime.spawn(capture.run(visibility.clone(), shutdown_rx));

    let mut app = App::new(
        surface,
        ctx.user_id().clone(),
        ctx.network().clone(),
        visibility,
        queue,
    );

    // Setup terminal
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)
        .context("failed to enter alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal")?;

    // Run the main loop
    let result = run_app(
        &mut terminal,
        &mut app,
        runtime,
        &handle,
        refresher.as_ref(),
        &lifecycle_tx,
    );

    // Stop pipeline tasks before tearing down the terminal
    let _ = shutdown_tx.send(true);

    // Restore terminal
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(
        terminal.backend_mut(),
        DisableFocusChange,
        LeaveAlternateScreen
    )
    .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;

    drop(agent_guard);
    result
}

/// Run the TUI loop on the main thread; pipeline tasks run on the runtime.
fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    runtime: &Runtime,
    agent: &AgentHandle,
    refresher: Option<&Arc<HistoryRefresher>>,
    lifecycle: &mpsc::UnboundedSender<LifecycleEvent>,
) -> Result<()> {
    // Pending count is re-read every 10 ticks (~1 second)
    let mut poll_counter = 0u32;

    loop {
        poll_counter += 1;
        if poll_counter >= 10 {
            poll_counter = 0;
            app.refresh_pending();
        }

        app.sync_selection();

        // Render
        terminal.draw(|frame| ui::render(frame, app))?;

        // Handle events
        if event::poll(Duration::from_millis(100))? {
            match event::read()? {
                Event::Key(key) => match app.handle_key(key) {
                    KeyAction::Refresh => match refresher {
                        Some(refresher) => {
                            let refresher = refresher.clone();
                            runtime.spawn(async move {
                                if let Err(e) = refresher.refresh().await {
                                    tracing::warn!(error = %e, "History refresh failed");
                                }
                            });
                        }
                        None => app.notice = Some("No remote store configured".to_string()),
                    },
                    KeyAction::SyncNow => {
                        agent.request_sync();
                    }
                    KeyAction::Flush => {
                        agent.flush_now();
                    }
                    KeyAction::None => {}
                },
                Event::FocusGained => {
                    let _ = lifecycle.send(LifecycleEvent::Visible);
                }
                Event::FocusLost => {
                    let _ = lifecycle.send(LifecycleEvent::Hidden);
                }
                _ => {}
            }
        }

        // Check if we should quit
        if app.should_quit {
            break;
        }
    }

    Ok(())
}

// ============================================
// geotrail agent
// ============================================

fn run_agent(runtime: &Runtime, config: &Config) -> Result<()> {
    let queue_path = Config::queue_path();
    let _agent_guard = acquire_agent_guard(&queue_path).context("failed to acquire process lock")?;

    let queue = open_queue().context("the background agent needs the location queue")?;
    let store = remote_store(config)?;
    let ctx = app_context(store.as_ref(), runtime)?;
    let sampler = sampler(config)?;
    let sync = coordinator(Some(&queue), store.as_ref(), ctx.network());

    let shutdown = ctrlc_shutdown()?;
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

    let wake_interval = config.agent.wake_interval();
    let (agent, handle) = CaptureAgent::new(
        ctx.clone(),
        sampler,
        Some(queue.clone()),
        sync,
        wake_interval,
    );

    if let Some(store) = &store {
        let probe = ConnectivityProbe::new(
            store.clone(),
            config.connectivity.probe_interval(),
            lifecycle_tx,
        );
        runtime.spawn(probe.run(ctx.network().is_online(), shutdown.clone()));
    } else {
        drop(lifecycle_tx);
    }

    // Headless: the surface is never visible
    let monitor = LifecycleMonitor::new(
        Visibility::Hidden,
        ctx.network().clone(),
        Some(handle.clone()),
        Box::new(NoWakeLock),
        None,
    );
    runtime.spawn(monitor.run(lifecycle_rx, shutdown.clone()));

    println!("Queue: {}", queue_path.display());
    println!("User:  {}", ctx.user_id());
    println!(
        "Agent running (wake every {}s, {} pending). Press Ctrl+C to stop.",
        wake_interval.as_secs(),
        queue.len().unwrap_or(0)
    );

    let mut events = handle.subscribe();
    runtime.spawn(async move {
        while let Ok(AgentEvent::NewLocationRecorded(record)) = events.recv().await {
            let row = DisplayRow::from_record(&record);
            println!(
                "[{}] Recorded {}, {} ({})",
                chrono::Local::now().format("%H:%M:%S"),
                row.latitude,
                row.longitude,
                row.elevation
            );
        }
    });

    // Drain whatever an earlier session left behind
    handle.request_sync();

    runtime.block_on(agent.run(shutdown));

    println!("Agent stopped.");
    Ok(())
}

// ============================================
// One-shot commands
// ============================================

fn run_record(runtime: &Runtime, config: &Config) -> Result<()> {
    let queue = open_queue().context("cannot record without the location queue")?;
    let store = remote_store(config)?;
    let ctx = app_context(store.as_ref(), runtime)?;
    let sync = coordinator(Some(&queue), store.as_ref(), ctx.network());

    let (agent, handle) = CaptureAgent::new(
        ctx.clone(),
        sampler(config)?,
        Some(queue.clone()),
        sync,
        config.agent.wake_interval(),
    );
    let agent = agent.without_periodic_wake();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = runtime.spawn(agent.run(shutdown_rx));

    let recorded = runtime.block_on(async {
        let recorded = handle.record_now().await;
        // Let the pass started by the capture finish before shutting down
        if let Err(e) = handle.sync_now().await {
            tracing::warn!(error = %e, "Sync after record did not complete");
        }
        recorded
    });
    let _ = shutdown_tx.send(true);
    let _ = runtime.block_on(task);

    if !recorded.context("capture agent did not respond")? {
        anyhow::bail!("no location recorded: position unavailable or queue write failed (see log)");
    }

    let pending = queue.len().context("failed to read queue")?;
    if pending == 0 {
        println!("Recorded location and synced it.");
    } else {
        println!("Recorded location ({} pending).", pending);
    }
    Ok(())
}

fn run_sync(runtime: &Runtime, config: &Config) -> Result<()> {
    let store = require_remote(config)?;
    let queue = open_queue().context("location queue unavailable")?;

    let online = runtime.block_on(store.is_reachable());
    let coordinator = SyncCoordinator::new(queue.clone(), store, NetworkStatus::new(online));

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .context("invalid progress template")?,
    );
    pb.set_message(format!("Syncing {} pending location(s)...", queue.len().unwrap_or(0)));
    pb.enable_steady_tick(Duration::from_millis(100));

    let outcome = runtime.block_on(coordinator.sync_pending());
    pb.finish_and_clear();

    match outcome.context("sync failed")? {
        SyncOutcome::Deferred => {
            println!(
                "Remote unreachable; sync deferred ({} pending).",
                queue.len().unwrap_or(0)
            );
        }
        SyncOutcome::Synced { count, .. } => {
            println!("Synced {} location(s).", count);
        }
    }

    tracing::info!(stats = ?coordinator.stats(), "geotrail sync complete");
    Ok(())
}

fn print_status(config: &Config) -> Result<()> {
    let queue_path = Config::queue_path();

    println!("Config:   {}", Config::config_path().display());
    println!("Queue:    {}", queue_path.display());
    println!("Log:      {}", geotrail_core::logging::log_file_path().display());

    let identity = JsonFileIdentityStore::new(Config::identity_path());
    let user_id = identity
        .get(USER_ID_KEY)
        .context("failed to read identity store")?;
    println!(
        "User:     {}",
        user_id.as_deref().unwrap_or("(not assigned yet)")
    );

    match &config.remote.base_url {
        Some(url) if config.remote.is_ready() => println!("Remote:   {}", url),
        Some(url) => println!("Remote:   {} (missing api key)", url),
        None => println!("Remote:   not configured"),
    }
    println!("Provider: {:?}", config.sampler.provider);

    match open_queue().map(|q| q.len()) {
        Some(Ok(n)) => println!("Pending:  {}", n),
        Some(Err(e)) => println!("Pending:  unknown ({})", e),
        None => println!("Pending:  queue unavailable"),
    }

    let agent = if is_agent_running(&queue_path).context("failed to probe agent lock")? {
        "running"
    } else {
        "not running"
    };
    println!("Agent:    {}", agent);

    Ok(())
}

fn print_queue() -> Result<()> {
    let queue = open_queue().context("location queue unavailable")?;
    let pending = queue.list_all().context("failed to read queue")?;

    if pending.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} pending location(s):", pending.len());
    print_rows(pending.iter().map(|q| DisplayRow::from_record(&q.record)));
    Ok(())
}

fn print_history(runtime: &Runtime, config: &Config) -> Result<()> {
    let store = require_remote(config)?;
    let records = runtime
        .block_on(store.fetch_all())
        .context("failed to fetch history")?;

    if records.is_empty() {
        println!("No locations stored yet.");
        return Ok(());
    }
    print_rows(records.iter().map(DisplayRow::from_record));
    Ok(())
}

fn print_rows(rows: impl Iterator<Item = DisplayRow>) {
    println!("{}", HEADERS.join("\t"));
    for row in rows {
        println!("{}", row.cells().join("\t"));
    }
}

fn print_distance(a: (f64, f64), b: (f64, f64)) {
    let meters = haversine_distance(a, b);
    println!("Distance: {:.2} meters", meters);
    println!("Distance: {:.2} kilometers", meters / 1000.0);
}
