//! Explicit process context
//!
//! The stable user id and the shared connectivity flag are created once at
//! startup and handed to every component, instead of living in globals.

use crate::connectivity::NetworkStatus;
use crate::error::Result;
use crate::identity::{load_or_create_user_id, IdentityStore};
use crate::types::UserId;

#[derive(Clone, Debug)]
pub struct AppContext {
    user_id: UserId,
    network: NetworkStatus,
}

impl AppContext {
    pub fn new(user_id: UserId, network: NetworkStatus) -> Self {
        Self { user_id, network }
    }

    /// Load (or generate and persist) the user id and set the initial
    /// connectivity state
    pub fn initialize(identity: &dyn IdentityStore, online: bool) -> Result<Self> {
        let user_id = load_or_create_user_id(identity)?;
        Ok(Self::new(user_id, NetworkStatus::new(online)))
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn network(&self) -> &NetworkStatus {
        &self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;

    #[test]
    fn test_initialize_reuses_identity() {
        let store = MemoryIdentityStore::default();
        let first = AppContext::initialize(&store, false).unwrap();
        let second = AppContext::initialize(&store, true).unwrap();

        assert_eq!(first.user_id(), second.user_id());
        assert!(!first.network().is_online());
        assert!(second.network().is_online());
    }
}
