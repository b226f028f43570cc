//! Core functionality for the motion-tracker recorder
//! This module contains the radio side, the decoders and the recording pipeline.

pub mod bluetooth;
pub mod decoder;
pub mod pipeline;
pub mod stream;

// Re-export commonly used types
pub use decoder::{DecoderKind, Row};
pub use stream::{SessionError, Stream, StreamEvent};
