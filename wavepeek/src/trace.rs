//! The interface shared by the VCD and FST trace readers.

use std::{
    fmt,
    fs::File,
    io::{self, Read},
    ops::ControlFlow,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{
    error::{Error, Result},
    fst::FstTrace,
    vcd::VcdTrace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Vcd,
    Fst,
}

impl TraceKind {
    /// Guess the kind of a trace file from its first byte. FST files start
    /// with the header block, whose type is 0; VCD files are text.
    pub fn detect(path: &Path) -> Result<Self> {
        let mut file = open_file(path)?;
        let mut first = [0u8; 1];
        let read = file.read(&mut first)?;
        Ok(if read == 1 && first[0] == 0 {
            Self::Fst
        } else {
            Self::Vcd
        })
    }
}

impl FromStr for TraceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vcd" => Ok(Self::Vcd),
            "fst" => Ok(Self::Fst),
            _ => Err(Error::Validation(format!(
                "Unknown trace kind '{s}'. Must be 'vcd' or 'fst'."
            ))),
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Vcd => "VCD",
            Self::Fst => "FST",
        })
    }
}

/// Index of a signal in its trace's signal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalRef(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Scope names and the signal name joined with `.`.
    pub path: String,
    pub width: u32,
    /// Declared variable type, e.g. `wire` or `reg`.
    pub kind: String,
}

impl Signal {
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// The time unit of a trace: `factor * 10^exponent` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timescale {
    pub factor: u32,
    pub exponent: i16,
}

impl Timescale {
    /// Move powers of ten into the factor until the exponent names a unit.
    pub fn from_exponent(exponent: i16) -> Self {
        let mut factor = 1;
        let mut exponent = exponent;
        while exponent.rem_euclid(3) != 0 {
            factor *= 10;
            exponent -= 1;
        }
        Self { factor, exponent }
    }
}

impl fmt::Display for Timescale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.exponent {
            0 => "s",
            -3 => "ms",
            -6 => "us",
            -9 => "ns",
            -12 => "ps",
            -15 => "fs",
            exponent => return write!(f, "{}e{exponent}s", self.factor),
        };
        write!(f, "{}{unit}", self.factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blackout {
    pub time: u64,
    /// Dumping resumed at `time` if true, otherwise it was suspended.
    pub dump_on: bool,
}

/// Descriptive metadata from the trace header. Nothing here affects queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInfo {
    pub timescale: Option<Timescale>,
    /// The simulator or writer that produced the file.
    pub version: Option<String>,
    pub date: Option<String>,
    pub blackouts: Vec<Blackout>,
}

/// Receives `(signal, time, raw value)` for each value change. Returning
/// `ControlFlow::Break` stops the iteration.
pub type ValueSink<'a> = dyn FnMut(SignalRef, u64, &str) -> ControlFlow<()> + 'a;

/// A loaded trace file.
pub trait TraceSource {
    fn kind(&self) -> TraceKind;

    fn path(&self) -> &Path;

    fn info(&self) -> &TraceInfo;

    /// All signals in declaration order. `SignalRef(i)` refers to the `i`th.
    fn signals(&self) -> &[Signal];

    /// First and last time in the trace, inclusive.
    fn time_range(&self) -> (u64, u64);

    /// Report the changes of `signals` with times in `start..=end`. Changes of
    /// one signal arrive in non-decreasing time order.
    fn iterate_values(
        &mut self,
        signals: &[SignalRef],
        start: u64,
        end: u64,
        sink: &mut ValueSink<'_>,
    ) -> Result<()>;

    /// Release the file and in-memory tables. Calling it twice is fine.
    fn close(&mut self);
}

pub fn open_trace(kind: TraceKind, path: &Path) -> Result<Box<dyn TraceSource>> {
    Ok(match kind {
        TraceKind::Vcd => Box::new(VcdTrace::open(path)?),
        TraceKind::Fst => Box::new(FstTrace::open(path)?),
    })
}

pub(crate) fn open_file(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(PathBuf::from(path)),
        _ => Error::Io(e),
    })
}
