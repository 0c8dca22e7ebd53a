//! Common imports for working with the call engine

pub use crate::config::{CallEngineConfig, EscalationConfig};
pub use crate::error::{CallEngineError, Result};
pub use crate::escalation::{EscalationKind, EscalationReason, EscalationRecord, EscalationStatus};
pub use crate::matcher::{MatchOutcome, Matcher};
pub use crate::notify::{NotificationDispatcher, NotificationEvent};
pub use crate::orchestrator::{CallEngine, EngineStats};
pub use crate::reader::{ReaderAvailability, ReaderId, ReaderRegistry};
pub use crate::server::{CallEngineServer, CallEngineServerBuilder};
pub use crate::session::{CallSession, CallStatus, CallType, ClientId, SessionId};
