//! Configuration for the call engine
//!
//! All knobs are loaded at startup. Escalation timeouts can be overridden
//! per `(trigger, level)` pair; everything else falls back to defaults.

use serde::Deserialize;
use std::time::Duration;

use crate::escalation::EscalationReason;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallEngineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub readers: ReaderConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Bind address for the REST API
    pub api_bind_addr: String,
    /// Logical domain used in notification payloads
    pub domain: String,
    /// How long ended and failed sessions stay queryable in memory before
    /// the monitor evicts them (their durable rows remain)
    pub terminal_retention_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            api_bind_addr: "127.0.0.1:8080".to_string(),
            domain: "call-engine.local".to_string(),
            terminal_retention_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// Capacity assigned when a presence report omits one
    pub default_max_concurrent_calls: u32,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent_calls: 1,
        }
    }
}

/// One `(trigger, level)` timeout override
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationRuleOverride {
    pub trigger: EscalationReason,
    pub level: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscalationConfig {
    /// Escalation depth cap; beyond this the session fails and is handed
    /// to the human administrator tier
    pub max_escalation_level: u32,
    /// Ring timeout before an unanswered call escalates
    pub ring_timeout_secs: u64,
    /// Retry delay while a session is escalated with no reader available
    pub no_reader_retry_secs: u64,
    /// Recipient of needs-human-intervention notifications
    pub admin_recipient: String,
    /// Per-(trigger, level) timeout overrides
    #[serde(default)]
    pub overrides: Vec<EscalationRuleOverride>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_escalation_level: 3,
            ring_timeout_secs: 30,
            no_reader_retry_secs: 5,
            admin_recipient: "admin-tier".to_string(),
            overrides: Vec::new(),
        }
    }
}

impl EscalationConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn no_reader_retry_delay(&self) -> Duration {
        Duration::from_secs(self.no_reader_retry_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path; overridden by an explicit path or in-memory
    /// choice at server build time
    pub database_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_path: "call_engine.db".to_string(),
        }
    }
}
