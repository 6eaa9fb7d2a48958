//! Closable hand-off channels connecting pipeline stages.
//!
//! Every stage boundary is a pair of channels: a [`DataChannel`] carrying
//! datapacks one at a time, and an [`ErrorChannel`] carrying errors. Both have
//! exactly one writer and one reader, and both can be closed from either side
//! any number of times.

mod data;
mod errors;

pub use data::DataChannel;
pub use errors::{ErrorChannel, ErrorCheck, DEFAULT_ERROR_CAPACITY, DEFAULT_POLL_INTERVAL};
