//! The unit of transport moved through data channels.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A readable byte stream. Dropping it closes the underlying reader.
pub type Body = Pin<Box<dyn AsyncRead + Send>>;

/// Context carried alongside a datapack body.
///
/// Stages never inspect it; it is handed to handlers so they can observe
/// cancellation and per-item metadata.
#[derive(Debug, Clone, Default)]
pub struct PackContext {
    cancel: CancellationToken,
    values: Arc<HashMap<String, String>>,
}

impl PackContext {
    /// Create an empty context with a fresh cancellation token
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context bound to an existing cancellation token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            values: Arc::default(),
        }
    }

    /// Return a copy of this context with an extra metadata entry
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            cancel: self.cancel.clone(),
            values: Arc::new(values),
        }
    }

    /// Look up a metadata entry
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The cancellation token shared with whoever created this context
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A body plus its context.
///
/// A datapack without a body is a no-op item: transform stages skip it.
pub struct Datapack {
    context: PackContext,
    body: Option<Body>,
}

impl Datapack {
    /// Create a datapack from any async reader
    pub fn new<R>(context: PackContext, reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            context,
            body: Some(Box::pin(reader)),
        }
    }

    /// Create a datapack over an in-memory buffer with an empty context
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(PackContext::new(), Cursor::new(bytes.into()))
    }

    /// Create a datapack that carries a context but no body
    pub fn empty(context: PackContext) -> Self {
        Self {
            context,
            body: None,
        }
    }

    /// Replace the context, keeping the body
    pub fn with_context(mut self, context: PackContext) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self) -> &PackContext {
        &self.context
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn body_mut(&mut self) -> Option<&mut Body> {
        self.body.as_mut()
    }

    /// Take the body out, leaving the datapack empty
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Borrow the context and the body at the same time
    pub fn parts_mut(&mut self) -> (&PackContext, Option<&mut Body>) {
        (&self.context, self.body.as_mut())
    }

    /// Read whatever remains of the body. Returns an empty buffer if there is no body.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(body) = self.body.as_mut() {
            body.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    }
}

impl fmt::Debug for Datapack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datapack")
            .field("context", &self.context)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}
