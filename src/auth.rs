use tracing::debug;

use crate::engine::EngineError;
use crate::model::ReservationId;

/// Owner-based access control for reservation mutations.
///
/// When disabled every caller is allowed. When enabled only the recorded
/// owner may update or delete a reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessControl {
    enabled: bool,
}

impl AccessControl {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether `caller` may act on the reservation `id` owned by `owner`.
    pub fn check_access(&self, caller: &str, id: ReservationId, owner: &str) -> Result<bool, EngineError> {
        debug!(caller, %id, owner, enabled = self.enabled, "verifying reservation access");
        if !self.enabled {
            return Ok(true);
        }
        if owner.is_empty() {
            return Err(EngineError::OwnerInformationCorrupted(id));
        }
        Ok(caller == owner)
    }

    /// Like [`AccessControl::check_access`], but a refusal is an error.
    pub fn authorize(&self, caller: &str, id: ReservationId, owner: &str) -> Result<(), EngineError> {
        if self.check_access(caller, id, owner)? {
            Ok(())
        } else {
            Err(EngineError::AccessDenied {
                user: caller.to_string(),
                id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_allows_everyone() {
        let acl = AccessControl::new(false);
        let id = ReservationId::new();
        assert_eq!(acl.check_access("mallory", id, "alice"), Ok(true));
        assert_eq!(acl.check_access("mallory", id, ""), Ok(true));
    }

    #[test]
    fn enabled_allows_only_owner() {
        let acl = AccessControl::new(true);
        let id = ReservationId::new();
        assert_eq!(acl.check_access("alice", id, "alice"), Ok(true));
        assert_eq!(acl.check_access("bob", id, "alice"), Ok(false));
        assert_eq!(
            acl.authorize("bob", id, "alice"),
            Err(EngineError::AccessDenied {
                user: "bob".into(),
                id
            })
        );
    }

    #[test]
    fn missing_owner_is_corruption() {
        let acl = AccessControl::new(true);
        let id = ReservationId::new();
        assert_eq!(
            acl.check_access("alice", id, ""),
            Err(EngineError::OwnerInformationCorrupted(id))
        );
    }
}
