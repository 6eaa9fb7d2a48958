//! Traits implemented by the code a pipeline wraps.
//!
//! Stages never decide what a datapack means. They drive a [`Producer`] to
//! fill a data channel and hand each datapack to a [`DatapackHandler`].

use async_trait::async_trait;

use crate::datapack::{Body, Datapack, PackContext};
use crate::error::Result;

/// What a producer yielded on one call.
#[derive(Debug)]
pub struct Produced {
    /// The datapack, or `None` for "nothing this round"
    pub datapack: Option<Datapack>,
    /// Whether the producer should be called again
    pub has_more: bool,
}

impl Produced {
    /// A datapack, with more to follow
    pub fn item(datapack: Datapack) -> Self {
        Self {
            datapack: Some(datapack),
            has_more: true,
        }
    }

    /// The final datapack
    pub fn last(datapack: Datapack) -> Self {
        Self {
            datapack: Some(datapack),
            has_more: false,
        }
    }

    /// Nothing this round, call again
    pub fn skip() -> Self {
        Self {
            datapack: None,
            has_more: true,
        }
    }

    /// Exhausted without a final datapack
    pub fn done() -> Self {
        Self {
            datapack: None,
            has_more: false,
        }
    }
}

/// A stateful source of datapacks.
///
/// Once `produce` returns an error or `has_more == false` it is not called
/// again.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use streamguard::datapack::Datapack;
/// use streamguard::error::Result;
/// use streamguard::traits::{Produced, Producer};
///
/// struct Lines {
///     lines: Vec<String>,
/// }
///
/// #[async_trait]
/// impl Producer for Lines {
///     async fn produce(&mut self) -> Result<Produced> {
///         match self.lines.pop() {
///             Some(line) if self.lines.is_empty() => Ok(Produced::last(Datapack::from_bytes(line))),
///             Some(line) => Ok(Produced::item(Datapack::from_bytes(line))),
///             None => Ok(Produced::done()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Producer: Send {
    async fn produce(&mut self) -> Result<Produced>;
}

/// Per-datapack logic run inside a transform stage.
///
/// The handler borrows the body; whatever it leaves unread travels on to the
/// next stage together with the context.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use streamguard::datapack::{Body, PackContext};
/// use streamguard::error::Result;
/// use streamguard::traits::DatapackHandler;
///
/// struct RejectCancelled;
///
/// #[async_trait]
/// impl DatapackHandler for RejectCancelled {
///     async fn handle(&mut self, context: &PackContext, _body: &mut Body) -> Result<()> {
///         if context.is_cancelled() {
///             return Err("datapack was cancelled".into());
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait DatapackHandler: Send {
    async fn handle(&mut self, context: &PackContext, body: &mut Body) -> Result<()>;
}

#[async_trait]
impl<H: DatapackHandler + ?Sized> DatapackHandler for Box<H> {
    async fn handle(&mut self, context: &PackContext, body: &mut Body) -> Result<()> {
        (**self).handle(context, body).await
    }
}
