//! FST traces, read lazily block by block through `wavepeek_fst`.

use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::BufReader,
    ops::ControlFlow,
    path::{Path, PathBuf},
};

use log::{info, warn};
use wavepeek_fst::fst::{BlackoutType, FstReader, VarId};

use crate::{
    error::{Error, Result},
    trace::{
        open_file, Blackout, Signal, SignalRef, Timescale, TraceInfo, TraceKind, TraceSource,
        ValueSink,
    },
};

fn format_error(e: anyhow::Error) -> Error {
    Error::Format(format!("{e:#}"))
}

pub struct FstTrace {
    path: PathBuf,
    info: TraceInfo,
    signals: Vec<Signal>,
    /// The var each signal reads its values from. Aliases share a var.
    handles: Vec<VarId>,
    start_time: u64,
    end_time: u64,
    /// None once closed.
    reader: Option<FstReader<BufReader<File>>>,
}

impl FstTrace {
    pub fn open(path: &Path) -> Result<Self> {
        let file = open_file(path)?;
        let reader = FstReader::new(BufReader::new(file)).map_err(format_error)?;

        let mut signals = Vec::with_capacity(reader.hierarchy.vars.len());
        let mut handles = Vec::with_capacity(reader.hierarchy.vars.len());
        let mut seen = HashSet::new();
        for var in &reader.hierarchy.vars {
            if !seen.insert(var.path.as_str()) {
                warn!("Skipping duplicate signal path {:?}", var.path);
                continue;
            }
            let kind = var
                .var_type()
                .map_or("unknown", |var_type| var_type.keyword());
            signals.push(Signal {
                path: var.path.clone(),
                width: u32::try_from(var.length).unwrap_or(u32::MAX).max(1),
                kind: kind.to_string(),
            });
            handles.push(var.id);
        }

        let header = &reader.header;
        let writer = header.writer_string();
        let date = header.date_string();
        let info = TraceInfo {
            timescale: Some(Timescale::from_exponent(header.timescale.into())),
            version: (!writer.is_empty()).then_some(writer),
            date: (!date.is_empty()).then_some(date),
            blackouts: reader
                .blackouts
                .iter()
                .map(|&(blackout_type, time)| Blackout {
                    time,
                    dump_on: blackout_type == BlackoutType::DumpOn,
                })
                .collect(),
        };

        info!(
            "Loaded FST {path:?}: {} signals, {} value change blocks",
            signals.len(),
            reader.blocks.len()
        );

        Ok(Self {
            path: path.to_owned(),
            info,
            signals,
            handles,
            start_time: header.start_time,
            end_time: header.end_time,
            reader: Some(reader),
        })
    }
}

impl TraceSource for FstTrace {
    fn kind(&self) -> TraceKind {
        TraceKind::Fst
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
        (self.start_time, self.end_time)
    }

    fn iterate_values(
        &mut self,
        signals: &[SignalRef],
        start: u64,
        end: u64,
        sink: &mut ValueSink<'_>,
    ) -> Result<()> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(Error::NotLoaded(TraceKind::Fst))?;

        let mut fan_out: HashMap<VarId, Vec<SignalRef>> = HashMap::new();
        for &signal in signals {
            let handle = *self.handles.get(signal.0).ok_or_else(|| {
                Error::Validation(format!("No signal with index {}", signal.0))
            })?;
            fan_out.entry(handle).or_default().push(signal);
        }

        reader.clear_process_mask_all();
        for &handle in fan_out.keys() {
            reader.set_process_mask(handle).map_err(format_error)?;
        }

        reader
            .read_value_changes(start, end, |time, handle, value| {
                let Some(targets) = fan_out.get(&handle) else {
                    return ControlFlow::Continue(());
                };
                let value = String::from_utf8_lossy(value);
                for &signal in targets {
                    if sink(signal, time, &value).is_break() {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })
            .map_err(format_error)
    }

    fn close(&mut self) {
        if self.reader.take().is_some() {
            info!("Closed FST {:?}", self.path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use wavepeek_fst::{
        fixture::{FixtureOptions, FixtureWriter},
        fst::VarType,
    };

    fn write_trace(dir: &Path) -> PathBuf {
        let mut writer = FixtureWriter::new(FixtureOptions::default());
        writer.scope("top");
        let clk = writer.var("clk", VarType::FST_VT_VCD_WIRE, 1);
        let data = writer.var("data", VarType::FST_VT_VCD_REG, 4);
        writer.alias("data_alias", VarType::FST_VT_VCD_WIRE, data);
        writer.upscope();
        for t in 0..4 {
            writer.change(t * 10, clk, if t % 2 == 0 { "0" } else { "1" });
        }
        writer.change(0, data, "0000");
        writer.change(20, data, "1x01");
        writer.blackout(false, 15);

        let path = dir.join("trace.fst");
        writer.write_to(&path).unwrap();
        path
    }

    fn collect(trace: &mut FstTrace, signals: &[SignalRef]) -> Vec<(usize, u64, String)> {
        let mut changes = Vec::new();
        trace
            .iterate_values(signals, 0, u64::MAX, &mut |signal, time, value| {
                changes.push((signal.0, time, value.to_string()));
                ControlFlow::Continue(())
            })
            .unwrap();
        changes
    }

    #[test]
    fn test_signals_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let trace = FstTrace::open(&write_trace(dir.path())).unwrap();

        let paths: Vec<_> = trace.signals().iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, ["top.clk", "top.data", "top.data_alias"]);
        assert_eq!(trace.signals()[1].width, 4);
        assert_eq!(trace.signals()[1].kind, "reg");
        assert_eq!(trace.signals()[2].kind, "wire");
        assert_eq!(trace.time_range(), (0, 30));
        assert_eq!(trace.info().version.as_deref(), Some("wavepeek fixture"));
        assert_eq!(trace.info().timescale.map(|t| t.to_string()).as_deref(), Some("1ns"));
        assert_eq!(
            trace.info().blackouts,
            [Blackout {
                time: 15,
                dump_on: false
            }]
        );
    }

    #[test]
    fn test_aliases_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = FstTrace::open(&write_trace(dir.path())).unwrap();

        let changes = collect(&mut trace, &[SignalRef(1), SignalRef(2)]);
        assert_eq!(
            changes,
            [
                (1, 0, "0000".to_string()),
                (2, 0, "0000".to_string()),
                (1, 20, "1x01".to_string()),
                (2, 20, "1x01".to_string()),
            ]
        );

        // The mask is reset for each query.
        let changes = collect(&mut trace, &[SignalRef(0)]);
        assert_eq!(changes.len(), 4);
        assert!(changes.iter().all(|(signal, _, _)| *signal == 0));
    }

    #[test]
    fn test_open_errors_and_close() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FstTrace::open(&dir.path().join("missing.fst")),
            Err(Error::FileNotFound(_))
        ));

        let garbage = dir.path().join("garbage.fst");
        std::fs::write(&garbage, b"$date\nnot an fst\n$end\n").unwrap();
        assert!(matches!(FstTrace::open(&garbage), Err(Error::Format(_))));

        let mut trace = FstTrace::open(&write_trace(dir.path())).unwrap();
        trace.close();
        trace.close();
        let result = trace.iterate_values(&[SignalRef(0)], 0, 10, &mut |_, _, _| {
            ControlFlow::Continue(())
        });
        assert!(matches!(result, Err(Error::NotLoaded(TraceKind::Fst))));
    }
}
