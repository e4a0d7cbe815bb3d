//! VCD traces. The whole file is tokenized by the `vcd` crate up front and
//! the value history of every id code is kept in memory.

use std::{
    collections::{HashMap, HashSet},
    io::{self, BufRead, BufReader},
    ops::ControlFlow,
    path::{Path, PathBuf},
};

use log::{info, warn};
use vcd::{Command, IdCode, ScopeItem};

use crate::{
    error::{Error, Result},
    trace::{open_file, Signal, SignalRef, Timescale, TraceInfo, TraceKind, TraceSource, ValueSink},
};

fn parse_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            Error::Format(format!("[vcd] {e}"))
        }
        _ => Error::Io(e),
    }
}

pub struct VcdTrace {
    path: PathBuf,
    info: TraceInfo,
    signals: Vec<Signal>,
    /// Index into `histories` for each signal. Vars with the same id code
    /// share a history.
    history_of: Vec<usize>,
    histories: Vec<Vec<(u64, String)>>,
    time_range: (u64, u64),
    closed: bool,
}

/// Collects signals and id codes while walking the scope tree.
#[derive(Default)]
struct SignalTable {
    signals: Vec<Signal>,
    history_of: Vec<usize>,
    paths: HashSet<String>,
    ids: HashMap<IdCode, usize>,
    /// Declared width of each history, used to extend short vectors.
    widths: Vec<u32>,
}

impl SignalTable {
    fn add_items(&mut self, items: &[ScopeItem], scopes: &mut Vec<String>) {
        for item in items {
            match item {
                ScopeItem::Scope(scope) => {
                    scopes.push(scope.identifier.clone());
                    self.add_items(&scope.items, scopes);
                    scopes.pop();
                }
                ScopeItem::Var(var) => {
                    let mut path = scopes.join(".");
                    if !path.is_empty() {
                        path.push('.');
                    }
                    path.push_str(&var.reference);
                    if let Some(index) = &var.index {
                        path.push_str(&index.to_string());
                    }

                    if !self.paths.insert(path.clone()) {
                        warn!("Skipping duplicate signal path {path:?}");
                        continue;
                    }

                    let width = var.size.max(1);
                    let next_history = self.widths.len();
                    let history = *self.ids.entry(var.code).or_insert(next_history);
                    if history == next_history {
                        self.widths.push(width);
                    }

                    self.signals.push(Signal {
                        path,
                        width,
                        kind: var.var_type.to_string(),
                    });
                    self.history_of.push(history);
                }
                _ => {}
            }
        }
    }
}

/// Extend a vector shorter than its declared width: `x` and `z` extend
/// themselves, anything else extends with `0`. Longer vectors are kept whole.
fn extend_vector(value: String, width: u32, id: IdCode) -> String {
    let width = width as usize;
    let length = value.chars().count();
    if length >= width {
        if length > width {
            warn!("Value {value:?} for {id} is wider than the declared {width} bits");
        }
        return value;
    }
    let fill = match value.chars().next() {
        Some(c @ ('x' | 'X' | 'z' | 'Z')) => c,
        _ => '0',
    };
    let mut extended: String = std::iter::repeat(fill).take(width - length).collect();
    extended.push_str(&value);
    extended
}

impl VcdTrace {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_file(path)?;
        let trace = Self::read(BufReader::new(file), path)?;
        info!(
            "Loaded VCD {path:?}: {} signals, time range {:?}",
            trace.signals.len(),
            trace.time_range
        );
        Ok(trace)
    }

    fn read(reader: impl BufRead, path: &Path) -> Result<Self> {
        let mut parser = vcd::Parser::new(reader);
        let header = parser.parse_header().map_err(parse_error)?;

        let mut table = SignalTable::default();
        table.add_items(&header.items, &mut Vec::new());

        let mut histories: Vec<Vec<(u64, String)>> = vec![Vec::new(); table.widths.len()];
        let mut time = 0;
        let mut time_range: Option<(u64, u64)> = None;

        for command in parser {
            let command = command.map_err(parse_error)?;
            let (id, value, is_bits) = match command {
                Command::Timestamp(t) => {
                    time = t;
                    time_range = Some(time_range.map_or((t, t), |(lo, hi)| (lo.min(t), hi.max(t))));
                    continue;
                }
                Command::ChangeScalar(id, value) => (id, value.to_string(), true),
                Command::ChangeVector(id, value) => (id, value.to_string(), true),
                Command::ChangeReal(id, value) => (id, value.to_string(), false),
                Command::ChangeString(id, value) => (id, value, false),
                _ => continue,
            };

            let &history = table.ids.get(&id).ok_or_else(|| {
                Error::Format(format!("[vcd] value change for undeclared id code {id}"))
            })?;
            let value = if is_bits {
                extend_vector(value, table.widths[history], id)
            } else {
                value
            };
            if time_range.is_none() {
                // Changes before the first timestamp happen at time 0.
                time_range = Some((0, 0));
            }
            histories[history].push((time, value));
        }

        let timescale = header.timescale.map(|(factor, unit)| Timescale {
            factor,
            exponent: -(unit.divisor().ilog10() as i16),
        });

        Ok(Self {
            path: path.to_owned(),
            info: TraceInfo {
                timescale,
                version: header.version.map(|v| v.trim().to_string()),
                date: header.date.map(|d| d.trim().to_string()),
                blackouts: Vec::new(),
            },
            signals: table.signals,
            history_of: table.history_of,
            histories,
            time_range: time_range.unwrap_or((0, 0)),
            closed: false,
        })
    }
}

impl TraceSource for VcdTrace {
    fn kind(&self) -> TraceKind {
        TraceKind::Vcd
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn info(&self) -> &TraceInfo {
        &self.info
    }

    fn signals(&self) -> &[Signal] {
        &self.signals
    }

    fn time_range(&self) -> (u64, u64) {
        self.time_range
    }

    fn iterate_values(
        &mut self,
        signals: &[SignalRef],
        start: u64,
        end: u64,
        sink: &mut ValueSink<'_>,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::NotLoaded(TraceKind::Vcd));
        }
        for &signal in signals {
            let &history = self.history_of.get(signal.0).ok_or_else(|| {
                Error::Validation(format!("No signal with index {}", signal.0))
            })?;
            let changes = self.histories[history]
                .iter()
                .filter(|(time, _)| (start..=end).contains(time));
            for (time, value) in changes {
                if sink(signal, *time, value).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.signals.clear();
        self.history_of.clear();
        self.histories.clear();
    }
}
