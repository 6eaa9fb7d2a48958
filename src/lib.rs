//! # Fault-isolated pipeline stages for Rust
//!
//! This crate provides the building blocks of multi-stage streaming
//! pipelines where every stage runs on its own tokio task, survives its own
//! panics, and passes both data and errors downstream without deadlocking or
//! leaking tasks.
//!
//! ## Core Concepts
//!
//! - **Datapack**: a readable body plus a context, the unit moved between stages
//! - **DataChannel**: a closable single-slot hand-off of datapacks
//! - **ErrorChannel**: a closable bounded queue of errors
//! - **SafeProducerStage**: drives a producer into a channel pair
//! - **SafeTransformStage**: handles each datapack of an upstream pair,
//!   forwards it, and relays upstream errors
//!
//! A consumer at the end of a pipeline reads the data channel until it
//! closes, then drains the error channel. A closed error channel without
//! errors means the run completed cleanly.
//!
//! ## Example
//!
//! ```rust
//! use streamguard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let producer = VecProducer::new(vec![
//!         Datapack::from_bytes("hello"),
//!         Datapack::from_bytes("world"),
//!     ]);
//!     let (data, errors) = SafeProducerStage::new(producer).start();
//!
//!     let (data, errors) = SafeTransformStage::new(data, errors)
//!         .handler(handler_fn(|_context, _body| Box::pin(async { Ok(()) })))
//!         .start()?;
//!
//!     let (bodies, errors) = drain_pipeline(data, errors).await;
//!     assert_eq!(bodies, vec![b"hello".to_vec(), b"world".to_vec()]);
//!     assert!(errors.is_empty());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod datapack;
pub mod error;
pub mod stage;
pub mod traits;
pub mod util;

mod telemetry;

// Re-export commonly used items
pub mod prelude {
    pub use crate::channel::{DataChannel, ErrorChannel, ErrorCheck};
    pub use crate::datapack::{Body, Datapack, PackContext};
    pub use crate::error::{Error, Result};
    pub use crate::stage::{
        SafeProducerStage, SafeTransformStage, StageConfig, StageMonitor, StageState,
    };
    pub use crate::traits::{DatapackHandler, Produced, Producer};
    pub use crate::util::{
        collect_datapacks, collect_errors, drain_pipeline, from_fn, handler_fn, VecProducer,
    };
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
