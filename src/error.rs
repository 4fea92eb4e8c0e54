use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

/// The cause carried by a cancelled [`Context`][crate::Context].
///
/// Any error type can be used as a cause; the plain [`Canceled`][crate::Canceled]
/// sentinel marks expected, graceful shutdown.
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors reported by runners and groups on API misuse.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The runner or group no longer accepts submissions.
    ///
    /// Also reported by a second `close()` call.
    Closed,
    /// A [`Limiter`][crate::Limiter] was constructed with a zero limit.
    InvalidLimit(usize),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Closed => write!(f, "The runner is closed to new submissions"),
            Error::InvalidLimit(limit) => {
                write!(f, "Invalid concurrency limit: {}, must be at least 1", limit)
            }
        }
    }
}

impl StdError for Error {}

/// A cause recording a panic captured in a supervised task.
///
/// Carries the panic message if one could be recovered from the payload.
#[derive(Debug)]
pub struct Panicked(pub String);

impl Panicked {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        Self(msg)
    }

    /// The panic message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Display for Panicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The task panicked: {}", self.0)
    }
}

impl StdError for Panicked {}
