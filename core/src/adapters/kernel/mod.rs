//! Kernel event stream adapters: record decoding, line source, tracer process.

mod decode;
mod source;
mod tracer;

pub use decode::{decode_record, DecodeError};
pub use source::{KernelEventSource, StreamItem};
pub use tracer::{TracerProcess, TracerStream};
