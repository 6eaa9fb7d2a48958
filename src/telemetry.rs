//! Stage counters. They compile to nothing unless the `metrics` feature is on.

pub(crate) const DATAPACKS_WRITTEN: &str = "streamguard_datapacks_written_total";
pub(crate) const ERRORS: &str = "streamguard_errors_total";
pub(crate) const PANICS: &str = "streamguard_panics_total";

#[cfg(feature = "metrics")]
fn increment(name: &'static str, stage: &str) {
    ::metrics::counter!(name, "stage" => stage.to_string()).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn increment(_name: &'static str, _stage: &str) {}

pub(crate) fn datapack_written(stage: &str) {
    increment(DATAPACKS_WRITTEN, stage);
}

pub(crate) fn error_reported(stage: &str) {
    increment(ERRORS, stage);
}

pub(crate) fn panic_caught(stage: &str) {
    increment(PANICS, stage);
}
