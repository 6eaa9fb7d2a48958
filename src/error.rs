//! Error types for pipeline stages.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

/// The main error type carried through error channels.
///
/// Errors are cheap to clone so they can be relayed unchanged from one stage
/// to the next.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A producer reported a failure
    #[error("Producer error: {0}")]
    Producer(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A datapack handler reported a failure
    #[error("Handler error: {0}")]
    Handler(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A stage task panicked; the panic was caught at the task boundary
    #[error("{stage} panicked, panic info = {message}")]
    Panicked { stage: String, message: String },

    /// Reading a datapack body failed
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// A transform stage was started without upstream channels
    #[error("Upstream channels were never provided")]
    MissingUpstream,

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

// Convenience constructors
impl Error {
    /// Create a producer error from any error type
    pub fn producer<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Producer(Arc::new(error))
    }

    /// Create a handler error from any error type
    pub fn handler<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Handler(Arc::new(error))
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Wrap a caught panic payload.
    pub fn panicked<S: Into<String>>(stage: S, payload: &(dyn Any + Send)) -> Self {
        Error::Panicked {
            stage: stage.into(),
            message: panic_message(payload),
        }
    }

    /// Whether this error came from a caught panic rather than being returned.
    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panicked { .. })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting foreign errors into our Error type
pub trait IntoError<T> {
    fn into_producer_error(self) -> Result<T>;
    fn into_handler_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_producer_error(self) -> Result<T> {
        self.map_err(Error::producer)
    }

    fn into_handler_error(self) -> Result<T> {
        self.map_err(Error::handler)
    }
}
