// Licensed under the Apache-2.0 license

//! Shared infrastructure used by both bus roles.

/// Minimal logging facade.
///
/// Long-lived driver structs carry a `Logger` as a defaulted generic
/// parameter so that production builds can run with [`NoOpLogger`] at zero
/// cost while tests or debug builds plug in a recording implementation.
pub trait Logger {
    /// Diagnostic message, safe to drop.
    fn debug(&self, _msg: &str) {}
    /// Fault worth surfacing.
    fn error(&self, _msg: &str) {}
}

/// Logger that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {}
