//! Position sampling
//!
//! [`Sampler`] wraps a [`PositionProvider`] with the request policy:
//! a hard timeout, an optional reuse window for the previous fix, and the
//! mapping of "no provider at all" to [`SampleError::Unavailable`].

use crate::config::{ProviderKind, SamplerConfig};
use crate::error::{Error, Result, SampleError};
use crate::types::Position;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Exit status a command provider uses to signal denied permission (EACCES)
pub const PERMISSION_DENIED_EXIT: i32 = 13;

/// Per-request sampling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleOptions {
    /// Ask for the most accurate fix the provider can give
    pub high_accuracy: bool,
    /// Give up after this long
    pub timeout: Duration,
    /// Accept a previous fix no older than this (zero disables reuse)
    pub max_cache_age: Duration,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_millis(5000),
            max_cache_age: Duration::ZERO,
        }
    }
}

/// Source of position fixes (GPS daemon, platform API, fixture)
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    async fn current_position(&self, options: &SampleOptions) -> std::result::Result<Position, SampleError>;
}

/// Produces one reading or a typed failure.
pub struct Sampler {
    provider: Option<Arc<dyn PositionProvider>>,
    options: SampleOptions,
    last_fix: Mutex<Option<(Instant, Position)>>,
}

impl Sampler {
    pub fn new(provider: Option<Arc<dyn PositionProvider>>, options: SampleOptions) -> Self {
        Self {
            provider,
            options,
            last_fix: Mutex::new(None),
        }
    }

    /// Build a sampler from configuration
    pub fn from_config(config: &SamplerConfig) -> Result<Self> {
        config.validate()?;

        let provider: Option<Arc<dyn PositionProvider>> = match config.provider {
            ProviderKind::None => None,
            ProviderKind::Static => {
                let (Some(latitude), Some(longitude)) = (config.latitude, config.longitude) else {
                    return Err(Error::Config(
                        "static provider requires coordinates".to_string(),
                    ));
                };
                Some(Arc::new(StaticProvider::new(Position {
                    latitude,
                    longitude,
                    elevation: config.elevation,
                })))
            }
            ProviderKind::Command => Some(Arc::new(CommandProvider::new(config.command.clone()))),
        };

        Ok(Self::new(provider, config.options()))
    }

    pub fn options(&self) -> &SampleOptions {
        &self.options
    }

    /// Whether any provider is configured
    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Take one reading
    pub async fn sample(&self) -> std::result::Result<Position, SampleError> {
        let Some(provider) = &self.provider else {
            return Err(SampleError::Unavailable);
        };

        if let Some(position) = self.cached_fix() {
            tracing::debug!("Reusing cached position fix");
            return Ok(position);
        }

        let result =
            match tokio::time::timeout(self.options.timeout, provider.current_position(&self.options))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(SampleError::Timeout),
            };

        match &result {
            Ok(position) => {
                if let Ok(mut last) = self.last_fix.lock() {
                    *last = Some((Instant::now(), *position));
                }
            }
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "Position sample failed");
            }
        }

        result
    }

    fn cached_fix(&self) -> Option<Position> {
        if self.options.max_cache_age.is_zero() {
            return None;
        }
        let last = self.last_fix.lock().ok()?;
        let (taken_at, position) = (*last)?;
        (taken_at.elapsed() <= self.options.max_cache_age).then_some(position)
    }
}

// ============================================
// Providers
// ============================================

/// Always reports the same fix (fixed installations, demos)
pub struct StaticProvider {
    position: Position,
}

impl StaticProvider {
    pub fn new(position: Position) -> Self {
        Self { position }
    }
}

#[async_trait]
impl PositionProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn current_position(&self, _options: &SampleOptions) -> std::result::Result<Position, SampleError> {
        Ok(self.position)
    }
}

/// Runs an external command that prints one JSON fix on stdout:
///
/// ```json
/// {"latitude": 14.5995, "longitude": 120.9842, "elevation": 12.0}
/// ```
///
/// Exit status 13 means permission denied; any other failure means the
/// position is unavailable. `GEOTRAIL_HIGH_ACCURACY` is set to `1` or `0`.
pub struct CommandProvider {
    argv: Vec<String>,
}

#[derive(Deserialize)]
struct CommandFix {
    latitude: f64,
    longitude: f64,
    #[serde(default, alias = "altitude")]
    elevation: Option<f64>,
}

impl CommandProvider {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl PositionProvider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    async fn current_position(&self, options: &SampleOptions) -> std::result::Result<Position, SampleError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(SampleError::Unavailable);
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .env(
                "GEOTRAIL_HIGH_ACCURACY",
                if options.high_accuracy { "1" } else { "0" },
            )
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                tracing::debug!(program = %program, error = %e, "Failed to spawn position command");
                SampleError::Unavailable
            })?;

        if !output.status.success() {
            return Err(match output.status.code() {
                Some(PERMISSION_DENIED_EXIT) => SampleError::PermissionDenied,
                _ => SampleError::Unavailable,
            });
        }

        parse_fix(&output.stdout)
    }
}

fn parse_fix(stdout: &[u8]) -> std::result::Result<Position, SampleError> {
    let fix: CommandFix = serde_json::from_slice(stdout).map_err(|e| {
        tracing::debug!(error = %e, "Position command printed invalid JSON");
        SampleError::Unavailable
    })?;

    let valid = fix.latitude.is_finite()
        && fix.longitude.is_finite()
        && (-90.0..=90.0).contains(&fix.latitude)
        && (-180.0..=180.0).contains(&fix.longitude);
    if !valid {
        return Err(SampleError::Unavailable);
    }

    Ok(Position {
        latitude: fix.latitude,
        longitude: fix.longitude,
        elevation: fix.elevation.filter(|e| e.is_finite()),
    })
}
