//! GTKWave FST format support
//!
//! # Format Specification
//!
//! The block layout is described here:
//! https://blog.timhutt.co.uk/fst_spec/

pub mod fst;
mod values;
pub mod varint;

#[cfg(any(test, feature = "fixture"))]
pub mod fixture;
