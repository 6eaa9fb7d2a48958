use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;

use super::{CleanupGuard, Lifecycle, StageConfig, StageMonitor};
use crate::channel::{DataChannel, ErrorChannel};
use crate::error::Error;
use crate::telemetry;
use crate::traits::{Produced, Producer};

const DEFAULT_NAME: &str = "SafeProducerStage";

/// Drives a [`Producer`] on its own task and turns its output into a data
/// channel and an error channel.
///
/// The producer is called until it is exhausted, returns an error, or the
/// reader closes the data channel. Dropping every handle to the returned data
/// channel counts as closing it. A panic inside the producer is reported on
/// the error channel instead of tearing down the process.
pub struct SafeProducerStage<P> {
    producer: P,
    config: StageConfig,
    lifecycle: Lifecycle,
}

impl<P> SafeProducerStage<P>
where
    P: Producer + 'static,
{
    pub fn new(producer: P) -> Self {
        Self::with_config(producer, StageConfig::default())
    }

    pub fn with_config(producer: P, config: StageConfig) -> Self {
        Self {
            producer,
            config,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Set the stage name used in logs and panic errors
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the capacity of the output error channel
    pub fn error_capacity(mut self, capacity: usize) -> Self {
        self.config.error_capacity = capacity;
        self
    }

    /// Set the poll interval of the output error channel
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn monitor(&self) -> StageMonitor {
        self.lifecycle.monitor()
    }

    /// Create the output channels and spawn the driving task.
    ///
    /// Returns immediately; the caller may start reading before the producer
    /// has been called. Must be called within a tokio runtime.
    pub fn start(self) -> (DataChannel, ErrorChannel) {
        let SafeProducerStage {
            mut producer,
            config,
            lifecycle,
        } = self;

        let name = config.stage_name(DEFAULT_NAME);
        let data = DataChannel::new();
        let errors =
            ErrorChannel::with_capacity(config.error_capacity).poll_interval(config.poll_interval);
        let (output, output_errors) = (data.clone(), errors.clone());
        let data = data.writer();

        tokio::spawn(async move {
            let mut guard = CleanupGuard::new(
                name.clone(),
                errors.clone(),
                data.clone(),
                None,
                lifecycle,
            );
            tracing::debug!(stage = %name, "stage started");

            let run = AssertUnwindSafe(drive(&name, &mut producer, &data, &errors))
                .catch_unwind()
                .await;

            match run {
                Ok(()) => guard.completed(),
                Err(payload) => {
                    let error = Error::panicked(name.as_str(), &*payload);
                    tracing::error!(stage = %name, %error, "producer panicked");
                    telemetry::panic_caught(&name);
                    guard.faulted();
                    errors.put(error).await;
                }
            }
        });

        (output, output_errors)
    }
}

async fn drive<P: Producer>(
    stage: &str,
    producer: &mut P,
    data: &DataChannel,
    errors: &ErrorChannel,
) {
    loop {
        let Produced { datapack, has_more } = match producer.produce().await {
            Ok(produced) => produced,
            Err(error) => {
                tracing::debug!(stage, %error, "producer returned an error");
                telemetry::error_reported(stage);
                errors.put(error).await;
                return;
            }
        };

        let Some(datapack) = datapack else {
            if has_more {
                continue;
            }
            break;
        };

        tracing::trace!(stage, ?datapack, "writing datapack");
        if data.write(datapack).await {
            tracing::debug!(stage, "data channel closed by reader; stopping producer");
            break;
        }
        telemetry::datapack_written(stage);

        if !has_more {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapack::Datapack;
    use crate::stage::StageState;
    use crate::util::{collect_errors, from_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_skip_then_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let producer = from_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Ok(match n {
                    0 | 1 => Produced::skip(),
                    2 => Produced::item(Datapack::from_bytes("x")),
                    _ => Produced::done(),
                })
            }
        });

        let stage = SafeProducerStage::new(producer);
        let monitor = stage.monitor();
        assert_eq!(monitor.state(), StageState::NotStarted);

        let (data, errors) = stage.start();
        let mut count = 0;
        while data.read().await.is_some() {
            count += 1;
        }

        assert_eq!(count, 1);
        assert!(collect_errors(errors).await.is_empty());
        assert_eq!(monitor.closed().await, StageState::Closed { faulted: false });
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let producer = from_fn(|| async {
            if true {
                panic!("producer exploded");
            }
            Ok(Produced::done())
        });

        let stage = SafeProducerStage::new(producer).name("exploding");
        let monitor = stage.monitor();
        let (data, errors) = stage.start();

        assert!(data.read().await.is_none());
        let errors = collect_errors(errors).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_panic());
        assert_eq!(
            errors[0].to_string(),
            "exploding panicked, panic info = producer exploded"
        );
        assert_eq!(monitor.closed().await, StageState::Closed { faulted: true });
    }

    #[tokio::test]
    async fn test_dropped_reader_stops_producer() {
        let producer = from_fn(|| async { Ok(Produced::item(Datapack::from_bytes("tick"))) });

        let stage = SafeProducerStage::new(producer);
        let monitor = stage.monitor();
        let (data, errors) = stage.start();

        assert!(data.read().await.is_some());
        drop(data);
        drop(errors);

        let state = tokio::time::timeout(Duration::from_secs(5), monitor.closed())
            .await
            .expect("stage should close once its reader is gone");
        assert_eq!(state, StageState::Closed { faulted: false });
    }
}
