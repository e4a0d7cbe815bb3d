//! Holds the currently loaded trace of each kind.

use std::path::{Path, PathBuf};

use log::info;

use crate::{
    error::{Error, Result},
    query::{self, ListOptions, SignalListing, ValueQuery, ValueReport},
    trace::{open_trace, TraceKind, TraceSource},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub path: PathBuf,
    pub kind: TraceKind,
    pub num_signals: usize,
}

/// At most one VCD and one FST trace are loaded at a time. Loading replaces
/// and closes the previous trace of the same kind.
#[derive(Default)]
pub struct Session {
    vcd: Option<Box<dyn TraceSource>>,
    fst: Option<Box<dyn TraceSource>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: TraceKind) -> &mut Option<Box<dyn TraceSource>> {
        match kind {
            TraceKind::Vcd => &mut self.vcd,
            TraceKind::Fst => &mut self.fst,
        }
    }

    /// Open `path` and make it current. If opening fails the previous trace
    /// stays loaded.
    pub fn load(&mut self, kind: TraceKind, path: &Path) -> Result<LoadSummary> {
        let trace = open_trace(kind, path)?;
        let summary = LoadSummary {
            path: path.to_owned(),
            kind,
            num_signals: trace.signals().len(),
        };
        self.set_current(kind, Some(trace))?;
        Ok(summary)
    }

    pub fn current(&self, kind: TraceKind) -> Result<&dyn TraceSource> {
        let trace = match kind {
            TraceKind::Vcd => &self.vcd,
            TraceKind::Fst => &self.fst,
        };
        trace.as_deref().ok_or(Error::NotLoaded(kind))
    }

    pub fn get_current(&mut self, kind: TraceKind) -> Result<&mut (dyn TraceSource + 'static)> {
        self.slot(kind)
            .as_deref_mut()
            .ok_or(Error::NotLoaded(kind))
    }

    /// Replace the current trace of `kind`, closing the previous one.
    pub fn set_current(
        &mut self,
        kind: TraceKind,
        trace: Option<Box<dyn TraceSource>>,
    ) -> Result<()> {
        if let Some(trace) = &trace {
            if trace.kind() != kind {
                return Err(Error::Validation(format!(
                    "Can't use a {} trace as the current {kind} trace",
                    trace.kind()
                )));
            }
        }
        let slot = self.slot(kind);
        if let Some(mut previous) = slot.take() {
            previous.close();
        }
        if let Some(trace) = &trace {
            info!("Current {kind} trace is now {:?}", trace.path());
        }
        *slot = trace;
        Ok(())
    }

    /// Returns false if nothing of that kind was loaded.
    pub fn close(&mut self, kind: TraceKind) -> bool {
        match self.slot(kind).take() {
            Some(mut trace) => {
                trace.close();
                true
            }
            None => false,
        }
    }

    pub fn list_signals(&self, kind: TraceKind, options: &ListOptions) -> Result<SignalListing> {
        query::list_signals(self.current(kind)?, options)
    }

    pub fn time_range(&self, kind: TraceKind) -> Result<(u64, u64)> {
        Ok(self.current(kind)?.time_range())
    }

    pub fn get_values(&mut self, kind: TraceKind, query: &ValueQuery) -> Result<ValueReport> {
        query::get_values(self.get_current(kind)?, query)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{format::ValueFormat, query::test::MemoryTrace};

    fn write_vcd(dir: &Path, name: &str, signals: &[&str]) -> PathBuf {
        let mut text = String::from("$timescale 1ps $end\n$scope module top $end\n");
        let ids = ['!', '"', '#', '$'];
        for (signal, id) in signals.iter().zip(ids) {
            text.push_str(&format!("$var wire 1 {id} {signal} $end\n"));
        }
        text.push_str("$upscope $end\n$enddefinitions $end\n#0\n");
        for id in ids.iter().take(signals.len()) {
            text.push_str(&format!("1{id}\n"));
        }
        text.push_str("#7\n");
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_not_loaded() {
        let mut session = Session::new();
        assert!(matches!(
            session.time_range(TraceKind::Vcd),
            Err(Error::NotLoaded(TraceKind::Vcd))
        ));
        assert!(matches!(
            session.list_signals(TraceKind::Fst, &ListOptions::default()),
            Err(Error::NotLoaded(TraceKind::Fst))
        ));
        let query = ValueQuery {
            patterns: vec!["a".to_string()],
            start: 0,
            end: 1,
            format: ValueFormat::Bin,
            limit: None,
        };
        assert!(matches!(
            session.get_values(TraceKind::Vcd, &query),
            Err(Error::NotLoaded(TraceKind::Vcd))
        ));
        assert!(!session.close(TraceKind::Vcd));
    }

    #[test]
    fn test_load_replace_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_vcd(dir.path(), "first.vcd", &["a", "b"]);
        let second = write_vcd(dir.path(), "second.vcd", &["c"]);

        let mut session = Session::new();
        let summary = session.load(TraceKind::Vcd, &first).unwrap();
        assert_eq!(summary.num_signals, 2);
        assert_eq!(session.time_range(TraceKind::Vcd).unwrap(), (0, 7));

        // A failed load keeps the current trace.
        assert!(matches!(
            session.load(TraceKind::Vcd, &dir.path().join("missing.vcd")),
            Err(Error::FileNotFound(_))
        ));
        assert_eq!(session.current(TraceKind::Vcd).unwrap().path(), first);

        session.load(TraceKind::Vcd, &second).unwrap();
        let listing = session
            .list_signals(TraceKind::Vcd, &ListOptions::default())
            .unwrap();
        assert_eq!(listing.total, 1);
        assert_eq!(listing.signals[0].path, "top.c");

        // The kinds are independent.
        assert!(session.current(TraceKind::Fst).is_err());

        assert!(session.close(TraceKind::Vcd));
        assert!(matches!(
            session.current(TraceKind::Vcd),
            Err(Error::NotLoaded(TraceKind::Vcd))
        ));
    }

    #[test]
    fn test_set_current() {
        let mut session = Session::new();
        let trace = MemoryTrace::new(vec![("top.x", 1, vec![(0, "1")])]);
        session.set_current(TraceKind::Vcd, Some(Box::new(trace))).unwrap();
        assert_eq!(session.current(TraceKind::Vcd).unwrap().signals().len(), 1);

        let trace = MemoryTrace::new(vec![]);
        assert!(matches!(
            session.set_current(TraceKind::Fst, Some(Box::new(trace))),
            Err(Error::Validation(_))
        ));

        session.set_current(TraceKind::Vcd, None).unwrap();
        assert!(session.current(TraceKind::Vcd).is_err());
    }
}
