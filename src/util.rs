//! Utility functions and helper types.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use tokio_stream::StreamExt;

use crate::channel::{DataChannel, ErrorChannel};
use crate::datapack::{Body, Datapack, PackContext};
use crate::error::{Error, Result};
use crate::traits::{DatapackHandler, Produced, Producer};

/// Helper function to create a producer from an async function
pub fn from_fn<F, Fut>(f: F) -> FnProducer<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Produced>> + Send,
{
    FnProducer { f }
}

/// A producer created from a function
pub struct FnProducer<F> {
    pub f: F,
}

#[async_trait]
impl<F, Fut> Producer for FnProducer<F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Produced>> + Send,
{
    async fn produce(&mut self) -> Result<Produced> {
        (self.f)().await
    }
}

/// A producer that yields datapacks from a vector, then finishes
pub struct VecProducer {
    items: VecDeque<Datapack>,
}

impl VecProducer {
    pub fn new(items: Vec<Datapack>) -> Self {
        Self {
            items: items.into(),
        }
    }

    /// Number of datapacks not yet produced
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl Producer for VecProducer {
    async fn produce(&mut self) -> Result<Produced> {
        Ok(match self.items.pop_front() {
            Some(datapack) if self.items.is_empty() => Produced::last(datapack),
            Some(datapack) => Produced::item(datapack),
            None => Produced::done(),
        })
    }
}

/// Helper function to create a datapack handler from a closure returning a
/// boxed future
///
/// ```rust
/// use streamguard::util::handler_fn;
/// use tokio::io::AsyncReadExt;
///
/// let handler = handler_fn(|_context, body| {
///     Box::pin(async move {
///         let mut sink = Vec::new();
///         body.read_to_end(&mut sink).await?;
///         Ok(())
///     })
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: for<'a> FnMut(&'a PackContext, &'a mut Body) -> BoxFuture<'a, Result<()>> + Send,
{
    FnHandler { f }
}

/// A datapack handler created from a function
pub struct FnHandler<F> {
    pub f: F,
}

#[async_trait]
impl<F> DatapackHandler for FnHandler<F>
where
    F: for<'a> FnMut(&'a PackContext, &'a mut Body) -> BoxFuture<'a, Result<()>> + Send,
{
    async fn handle(&mut self, context: &PackContext, body: &mut Body) -> Result<()> {
        (self.f)(context, body).await
    }
}

/// Read a data channel until it closes
pub async fn collect_datapacks(data: DataChannel) -> Vec<Datapack> {
    data.into_stream().collect().await
}

/// Drain an error channel until it is closed and empty
pub async fn collect_errors(errors: ErrorChannel) -> Vec<Error> {
    errors.into_stream().collect().await
}

/// Consume a terminal channel pair: read every datapack body to the end, then
/// drain the errors. Returns the bodies in order alongside the errors.
pub async fn drain_pipeline(
    data: DataChannel,
    errors: ErrorChannel,
) -> (Vec<Vec<u8>>, Vec<Error>) {
    let mut bodies = Vec::new();
    let mut read_errors = Vec::new();
    while let Some(mut datapack) = data.read().await {
        match datapack.read_to_end().await {
            Ok(body) => bodies.push(body),
            Err(error) => read_errors.push(error),
        }
    }
    let mut errors = collect_errors(errors).await;
    errors.extend(read_errors);
    (bodies, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_producer() {
        let mut producer =
            VecProducer::new(vec![Datapack::from_bytes("a"), Datapack::from_bytes("b")]);
        assert_eq!(producer.len(), 2);

        let first = producer.produce().await.unwrap();
        assert!(first.datapack.is_some() && first.has_more);
        let second = producer.produce().await.unwrap();
        assert!(second.datapack.is_some() && !second.has_more);
        let third = producer.produce().await.unwrap();
        assert!(third.datapack.is_none() && !third.has_more);
        assert!(producer.is_empty());
    }

    #[tokio::test]
    async fn test_handler_fn_reads_body() {
        use tokio::io::AsyncReadExt;

        let mut handler = handler_fn(|context, body| {
            Box::pin(async move {
                let mut buf = Vec::new();
                body.read_to_end(&mut buf).await?;
                if context.value("expect").map(str::as_bytes) != Some(buf.as_slice()) {
                    return Err(Error::custom("unexpected body"));
                }
                Ok(())
            })
        });

        let context = PackContext::new().with_value("expect", "payload");
        let mut pack = Datapack::from_bytes("payload").with_context(context);
        let (context, body) = pack.parts_mut();
        handler.handle(context, body.unwrap()).await.unwrap();

        let mut pack = Datapack::from_bytes("other").with_context(PackContext::new());
        let (context, body) = pack.parts_mut();
        assert!(handler.handle(context, body.unwrap()).await.is_err());
    }
}
