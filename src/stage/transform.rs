use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;

use super::{CleanupGuard, Lifecycle, StageConfig, StageMonitor, StageState};
use crate::channel::{DataChannel, ErrorChannel, ErrorCheck};
use crate::error::{Error, Result};
use crate::telemetry;
use crate::traits::DatapackHandler;

const DEFAULT_NAME: &str = "SafeTransformStage";

/// Extra error slots a transform stage reserves on top of its upstream
/// capacity: one for a handler error and one for a caught panic.
const LOCAL_ERROR_SLOTS: usize = 2;

type Finalizer = Box<dyn FnOnce() + Send>;

/// Consumes an upstream channel pair, runs a [`DatapackHandler`] on every
/// datapack and forwards it to a new channel pair.
///
/// Upstream errors are relayed after the stage's own work ends. A panic
/// closes the upstream data channel at once, which releases an upstream stage
/// blocked on a write.
///
/// Without a handler the stage is a pass-through: it hands back the upstream
/// pair and never spawns a task.
pub struct SafeTransformStage {
    upstream: Option<(DataChannel, ErrorChannel)>,
    output: Option<(DataChannel, ErrorChannel)>,
    handler: Option<Box<dyn DatapackHandler>>,
    finalizer: Option<Finalizer>,
    config: StageConfig,
    lifecycle: Lifecycle,
}

impl Default for SafeTransformStage {
    fn default() -> Self {
        Self {
            upstream: None,
            output: None,
            handler: None,
            finalizer: None,
            config: StageConfig::default(),
            lifecycle: Lifecycle::new(),
        }
    }
}

impl SafeTransformStage {
    /// Create a stage reading from an upstream pair
    pub fn new(data: DataChannel, errors: ErrorChannel) -> Self {
        Self::default().upstream(data, errors)
    }

    /// Set the pair to read from. Ignored once [`build_stream`](Self::build_stream)
    /// has handed out an output pair.
    pub fn upstream(mut self, data: DataChannel, errors: ErrorChannel) -> Self {
        if self.output.is_some() {
            tracing::warn!("upstream set after build_stream; keeping the built stream");
            return self;
        }
        self.upstream = Some((data, errors));
        self
    }

    pub fn handler<H>(mut self, handler: H) -> Self
    where
        H: DatapackHandler + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Callback run once after the stage has closed its outputs
    pub fn finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Replace the stage configuration. Transform stages size their error
    /// channel from upstream, so `error_capacity` is not used here.
    pub fn config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the stage name used in logs and panic errors
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set the poll interval used when draining upstream errors and on the
    /// returned error channel. Takes effect at [`start`](Self::start).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn monitor(&self) -> StageMonitor {
        self.lifecycle.monitor()
    }

    /// Return the channel pair downstream stages should read from.
    ///
    /// `None` if no upstream was given. The upstream pair itself if there is
    /// no handler. Otherwise a fresh pair whose error channel holds two more
    /// errors than upstream's, so relaying never blocks on the stage's own
    /// handler or panic error. Repeated calls return the same pair, and
    /// [`start`](Self::start) runs the stage on it even if a handler is set
    /// afterwards.
    pub fn build_stream(&mut self) -> Option<(DataChannel, ErrorChannel)> {
        let (_, upstream_errors) = self.upstream.as_ref()?;

        if self.handler.is_none() {
            return self.upstream.clone();
        }

        if self.output.is_none() {
            let capacity = upstream_errors.capacity() + LOCAL_ERROR_SLOTS;
            self.output = Some((
                DataChannel::new(),
                ErrorChannel::with_capacity(capacity).poll_interval(self.config.poll_interval),
            ));
        }
        self.output.clone()
    }

    /// Spawn the stage task and return its output pair.
    ///
    /// Fails with [`Error::MissingUpstream`] if no upstream was given. A
    /// pass-through stage spawns nothing and runs its finalizer right away.
    /// Must be called within a tokio runtime.
    pub fn start(mut self) -> Result<(DataChannel, ErrorChannel)> {
        let (output, output_errors) = self.build_stream().ok_or(Error::MissingUpstream)?;
        let name = self.config.stage_name(DEFAULT_NAME);
        let poll_interval = self.config.poll_interval;

        let SafeTransformStage {
            upstream,
            handler,
            finalizer,
            lifecycle,
            ..
        } = self;

        let Some(mut handler) = handler else {
            tracing::debug!(stage = %name, "no handler configured; passing upstream through");
            if let Some(finalizer) = finalizer {
                finalizer();
            }
            lifecycle.set(StageState::Closed { faulted: false });
            return Ok((output, output_errors));
        };
        let (input, input_errors) = upstream.ok_or(Error::MissingUpstream)?;
        let input_errors = input_errors.poll_interval(poll_interval);
        let output_errors = output_errors.poll_interval(poll_interval);

        let (data, errors) = (output.writer(), output_errors.clone());
        tokio::spawn(async move {
            let mut guard =
                CleanupGuard::new(name.clone(), errors.clone(), data.clone(), finalizer, lifecycle);
            tracing::debug!(stage = %name, "stage started");

            let run = AssertUnwindSafe(async {
                process(&name, handler.as_mut(), &input, &data, &errors).await;
                relay_errors(&input_errors, &errors).await;
            })
            .catch_unwind()
            .await;

            match run {
                Ok(()) => guard.completed(),
                Err(payload) => {
                    // Release whatever upstream is blocked writing to us
                    input.close();
                    let error = Error::panicked(name.as_str(), &*payload);
                    tracing::error!(stage = %name, %error, "stage panicked; upstream closed");
                    telemetry::panic_caught(&name);
                    guard.faulted();
                    errors.put(error).await;
                    relay_errors(&input_errors, &errors).await;
                }
            }
        });

        Ok((output, output_errors))
    }
}

/// Main loop: handle and forward datapacks until upstream closes, the
/// handler fails or downstream stops reading.
async fn process(
    stage: &str,
    handler: &mut dyn DatapackHandler,
    input: &DataChannel,
    output: &DataChannel,
    errors: &ErrorChannel,
) {
    while let Some(mut datapack) = input.read().await {
        let (context, body) = datapack.parts_mut();
        let Some(body) = body else {
            continue;
        };

        if let Err(error) = handler.handle(context, body).await {
            tracing::debug!(stage, %error, "handler returned an error");
            telemetry::error_reported(stage);
            errors.put(error).await;
            break;
        }

        if output.write(datapack).await {
            tracing::debug!(stage, "output closed by reader; stopping");
            break;
        }
        telemetry::datapack_written(stage);
    }

    // No-op if upstream finished on its own; otherwise tells it to stop.
    input.close();
}

async fn relay_errors(upstream: &ErrorChannel, errors: &ErrorChannel) {
    loop {
        match upstream.check().await {
            ErrorCheck::Error(error) => errors.put(error).await,
            ErrorCheck::Empty => continue,
            ErrorCheck::Done => break,
        }
    }
}
