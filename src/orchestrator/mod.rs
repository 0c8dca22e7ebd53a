//! Call orchestration
//!
//! The [`CallEngine`] coordinates the reader registry, matcher, escalation
//! scheduler, notification adapter and audit log to run the emergency call
//! lifecycle. It is the sole writer of session status.
//!
//! Control flow: an emergency request enters through [`CallEngine::create_call`],
//! which asks the matcher for a reader and moves the session `pending →
//! ringing`. The scheduler arms a ring timer against the session; an
//! `answer` cancels it, a fire escalates it. Escalation re-matches against
//! readers not yet tried, up to a bounded depth, after which the session
//! fails and the human administrator tier is sirened.
//!
//! Concurrency: transitions for one session are serialized behind a
//! per-session `tokio::sync::Mutex`; reader capacity is guarded by the
//! storage layer's conditional updates; notifications are dispatched only
//! after a transition has been persisted and the session lock dropped.

pub mod calls;
pub mod core;

pub use core::{CallEngine, EngineStats};
