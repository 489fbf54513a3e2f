//! Error interface for this crate.
//!
//! Every error this crate produces implements [`Error`], which extends
//! [`std::error::Error`] with a short hint that a user interface can show
//! next to the message.
//!
//! The concrete error types are:
//! - [`ExecErr`]: fatal errors raised while a machine executes.
//! - [`ValidationErr`]: errors raised while a machine description is validated.
//! - [`InputErr`]: errors raised while reading values from an IO channel.
//!
//! [`ExecErr`]: crate::machine::ExecErr
//! [`ValidationErr`]: crate::machine::ValidationErr
//! [`InputErr`]: crate::machine::io::InputErr
use std::borrow::Cow;

/// Unified error interface for all errors in this crate.
pub trait Error: std::error::Error {
    /// A clarifying message to help the user fix the problem, if one exists.
    fn help(&self) -> Option<Cow<str>>;
}
