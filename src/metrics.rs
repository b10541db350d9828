//! In-process metrics recording.

pub mod logging_recorder;
