// Kernel - engine infrastructure.
//
// Everything here is mechanism (storage, dispatch, telemetry, logs);
// task semantics live in the handlers clients register.

pub mod escalation;
pub mod event_log;
pub mod governor;
pub mod tasks;
pub mod telemetry;
