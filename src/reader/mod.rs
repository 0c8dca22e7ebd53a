//! Reader presence and availability
//!
//! Readers are the responders for emergency calls. Their availability state
//! (online, emergency opt-in, call capacity) is the only mutable resource
//! shared across sessions; the [`registry`] guards it with atomic
//! conditional updates at the storage layer.

pub mod registry;

pub use registry::{ReaderRegistry, ReaderStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to a reader (the user entity is owned externally)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReaderId(pub String);

impl ReaderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reader's current availability snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderAvailability {
    pub reader_id: ReaderId,
    pub is_online: bool,
    pub is_available_for_emergency: bool,
    pub max_concurrent_calls: u32,
    pub current_call_count: u32,
    pub last_seen: DateTime<Utc>,
    pub status_message: Option<String>,
}

impl ReaderAvailability {
    /// Whether the matcher may consider this reader for a new emergency
    pub fn is_eligible(&self) -> bool {
        self.is_online
            && self.is_available_for_emergency
            && self.current_call_count < self.max_concurrent_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(online: bool, available: bool, current: u32, max: u32) -> ReaderAvailability {
        ReaderAvailability {
            reader_id: ReaderId("r1".to_string()),
            is_online: online,
            is_available_for_emergency: available,
            max_concurrent_calls: max,
            current_call_count: current,
            last_seen: Utc::now(),
            status_message: None,
        }
    }

    #[test]
    fn eligibility_requires_all_three_conditions() {
        assert!(reader(true, true, 0, 1).is_eligible());
        assert!(!reader(false, true, 0, 1).is_eligible());
        assert!(!reader(true, false, 0, 1).is_eligible());
        assert!(!reader(true, true, 1, 1).is_eligible());
        assert!(reader(true, true, 1, 2).is_eligible());
    }
}
