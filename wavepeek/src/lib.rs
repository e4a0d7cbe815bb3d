//! Inspect VCD and FST waveform traces: list signals, report the time range
//! and extract value changes in a time window, formatted as binary, hex or
//! decimal. Also converts between floats and their half, single and bfloat16
//! bit patterns.

pub mod error;
pub mod float;
pub mod format;
pub mod fst;
pub mod query;
pub mod render;
pub mod session;
pub mod trace;
pub mod vcd;

pub use error::{Error, Result};
pub use session::Session;
pub use trace::{Signal, SignalRef, TraceKind, TraceSource};
