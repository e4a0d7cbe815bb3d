//! Signal listing and value extraction on top of any `TraceSource`.

use std::{collections::HashMap, ops::ControlFlow};

use log::debug;
use regex::Regex;

use crate::{
    error::{Error, Result},
    format::{format_value, ValueFormat},
    trace::{Signal, SignalRef, TraceSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternMode {
    /// Case-insensitive substring of the path.
    #[default]
    Substring,
    /// Regular expression found in the path or the name.
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    /// Only list signals below this scope. Empty for all.
    pub module_path: String,
    /// Maximum depth below `module_path`; 1 lists its direct children.
    pub max_depth: Option<usize>,
    /// Empty matches everything.
    pub pattern: String,
    pub pattern_mode: PatternMode,
    /// 0 for no limit.
    pub limit: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            module_path: String::new(),
            max_depth: None,
            pattern: String::new(),
            pattern_mode: PatternMode::Substring,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalInfo {
    pub path: String,
    pub name: String,
    pub kind: String,
    pub width: u32,
}

impl From<&Signal> for SignalInfo {
    fn from(signal: &Signal) -> Self {
        Self {
            path: signal.path.clone(),
            name: signal.name().to_string(),
            kind: signal.kind.clone(),
            width: signal.width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalListing {
    pub signals: Vec<SignalInfo>,
    /// Number of matches before the limit was applied.
    pub total: usize,
}

fn segments(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('.').count()
    }
}

pub fn list_signals(source: &dyn TraceSource, options: &ListOptions) -> Result<SignalListing> {
    let prefix = format!("{}.", options.module_path);
    let module_depth = segments(&options.module_path);

    let regex = match options.pattern_mode {
        PatternMode::Regex if !options.pattern.is_empty() => {
            Some(Regex::new(&options.pattern).map_err(|e| {
                Error::Validation(format!("Invalid regex pattern '{}': {e}", options.pattern))
            })?)
        }
        _ => None,
    };
    let needle = options.pattern.to_lowercase();

    let matches = |signal: &&Signal| {
        if !options.module_path.is_empty() && !signal.path.starts_with(&prefix) {
            return false;
        }
        if let Some(max_depth) = options.max_depth {
            if segments(&signal.path).saturating_sub(module_depth) > max_depth {
                return false;
            }
        }
        match &regex {
            Some(regex) => regex.is_match(&signal.path) || regex.is_match(signal.name()),
            None => signal.path.to_lowercase().contains(&needle),
        }
    };

    let mut listing = SignalListing::default();
    for signal in source.signals().iter().filter(matches) {
        listing.total += 1;
        if options.limit == 0 || listing.signals.len() < options.limit {
            listing.signals.push(signal.into());
        }
    }
    Ok(listing)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueQuery {
    /// A signal is selected if its path contains any of these, ignoring case.
    pub patterns: Vec<String>,
    pub start: u64,
    pub end: u64,
    pub format: ValueFormat,
    /// Maximum number of changes reported per signal.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalValues {
    pub path: String,
    /// Formatted values in time order.
    pub changes: Vec<(u64, String)>,
    /// More changes in the window were dropped because of the limit.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueReport {
    pub signals: Vec<SignalValues>,
    /// `path@time: reason` for values shown in binary instead of the
    /// requested format.
    pub warnings: Vec<String>,
}

pub fn matching_signals(source: &dyn TraceSource, patterns: &[String]) -> Vec<SignalRef> {
    let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
    source
        .signals()
        .iter()
        .enumerate()
        .filter(|(_, signal)| {
            let path = signal.path.to_lowercase();
            patterns.iter().any(|pattern| path.contains(pattern.as_str()))
        })
        .map(|(i, _)| SignalRef(i))
        .collect()
}

pub fn get_values(source: &mut dyn TraceSource, query: &ValueQuery) -> Result<ValueReport> {
    if query.start > query.end {
        return Err(Error::Validation(format!(
            "start time {} must be less than or equal to end time {}",
            query.start, query.end
        )));
    }

    let selected = matching_signals(source, &query.patterns);
    if selected.is_empty() {
        return Ok(ValueReport::default());
    }
    debug!("Reading values of {} signals", selected.len());

    let slot_of: HashMap<SignalRef, usize> =
        selected.iter().enumerate().map(|(slot, &signal)| (signal, slot)).collect();
    let mut raw: Vec<Vec<(u64, String)>> = vec![Vec::new(); selected.len()];
    let mut truncated = vec![false; selected.len()];
    let mut untruncated = selected.len();

    source.iterate_values(&selected, query.start, query.end, &mut |signal, time, value| {
        let Some(&slot) = slot_of.get(&signal) else {
            return ControlFlow::Continue(());
        };
        if truncated[slot] {
            return ControlFlow::Continue(());
        }
        if query.limit.is_some_and(|limit| raw[slot].len() >= limit) {
            truncated[slot] = true;
            untruncated -= 1;
            return if untruncated == 0 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            };
        }
        raw[slot].push((time, value.to_string()));
        ControlFlow::Continue(())
    })?;

    let mut report = ValueReport::default();
    for ((signal, changes), truncated) in selected.iter().zip(raw).zip(truncated) {
        let path = source.signals()[signal.0].path.clone();
        let mut formatted = Vec::with_capacity(changes.len());
        for (time, value) in changes {
            let (rendered, warning) = format_value(&value, query.format);
            if let Some(warning) = warning {
                report.warnings.push(format!("{path}@{time}: {warning}"));
            }
            formatted.push((time, rendered));
        }
        report.signals.push(SignalValues {
            path,
            changes: formatted,
            truncated,
        });
    }
    Ok(report)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::trace::{TraceInfo, TraceKind, ValueSink};
    use std::path::Path;

    /// An in-memory trace with a fixed list of changes per signal.
    pub(crate) struct MemoryTrace {
        pub signals: Vec<Signal>,
        pub changes: Vec<Vec<(u64, String)>>,
        pub info: TraceInfo,
    }

    impl MemoryTrace {
        pub fn new(signals: Vec<(&str, u32, Vec<(u64, &str)>)>) -> Self {
            Self {
                signals: signals
                    .iter()
                    .map(|(path, width, _)| Signal {
                        path: path.to_string(),
                        width: *width,
                        kind: "wire".to_string(),
                    })
                    .collect(),
                changes: signals
                    .iter()
                    .map(|(_, _, changes)| {
                        changes.iter().map(|(t, v)| (*t, v.to_string())).collect()
                    })
                    .collect(),
                info: TraceInfo::default(),
            }
        }
    }

    impl TraceSource for MemoryTrace {
        fn kind(&self) -> TraceKind {
            TraceKind::Vcd
        }
        fn path(&self) -> &Path {
            Path::new("memory")
        }
        fn info(&self) -> &TraceInfo {
            &self.info
        }
        fn signals(&self) -> &[Signal] {
            &self.signals
        }
        fn time_range(&self) -> (u64, u64) {
            (0, 100)
        }
        fn iterate_values(
            &mut self,
            signals: &[SignalRef],
            start: u64,
            end: u64,
            sink: &mut ValueSink<'_>,
        ) -> Result<()> {
            for signal in signals {
                for (time, value) in &self.changes[signal.0] {
                    if (start..=end).contains(time) && sink(*signal, *time, value).is_break() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn design() -> MemoryTrace {
        MemoryTrace::new(vec![
            ("top.clk", 1, vec![(0, "0"), (5, "1"), (10, "0")]),
            ("top.cpu.pc", 8, vec![(0, "00000000"), (10, "00010000")]),
            ("top.cpu.alu.result", 4, vec![(0, "xxxx"), (5, "1010")]),
            ("top.mem.data", 4, vec![]),
            ("other.CLK_GEN", 1, vec![(3, "1")]),
        ])
    }

    fn paths(listing: &SignalListing) -> Vec<&str> {
        listing.signals.iter().map(|s| s.path.as_str()).collect()
    }

    #[test]
    fn test_list_module_and_depth() {
        let trace = design();
        let options = ListOptions {
            module_path: "top.cpu".to_string(),
            ..Default::default()
        };
        let listing = list_signals(&trace, &options).unwrap();
        assert_eq!(paths(&listing), ["top.cpu.pc", "top.cpu.alu.result"]);

        let options = ListOptions {
            module_path: "top".to_string(),
            max_depth: Some(1),
            ..Default::default()
        };
        let listing = list_signals(&trace, &options).unwrap();
        assert_eq!(paths(&listing), ["top.clk"]);

        let options = ListOptions {
            max_depth: Some(2),
            ..Default::default()
        };
        let listing = list_signals(&trace, &options).unwrap();
        assert_eq!(paths(&listing), ["top.clk", "other.CLK_GEN"]);
        assert_eq!(listing.signals[0].name, "clk");

        // A scope name that merely starts with the module path doesn't match.
        let options = ListOptions {
            module_path: "top.cp".to_string(),
            ..Default::default()
        };
        assert_eq!(list_signals(&trace, &options).unwrap().total, 0);
    }

    #[test]
    fn test_list_patterns_and_limit() {
        let trace = design();
        let options = ListOptions {
            pattern: "clk".to_string(),
            ..Default::default()
        };
        let listing = list_signals(&trace, &options).unwrap();
        assert_eq!(paths(&listing), ["top.clk", "other.CLK_GEN"]);

        let options = ListOptions {
            pattern: "^(clk|pc)$".to_string(),
            pattern_mode: PatternMode::Regex,
            ..Default::default()
        };
        let listing = list_signals(&trace, &options).unwrap();
        assert_eq!(paths(&listing), ["top.clk", "top.cpu.pc"]);

        let options = ListOptions {
            pattern: "(".to_string(),
            pattern_mode: PatternMode::Regex,
            ..Default::default()
        };
        assert!(matches!(
            list_signals(&trace, &options),
            Err(Error::Validation(_))
        ));

        let options = ListOptions {
            limit: 2,
            ..Default::default()
        };
        let listing = list_signals(&trace, &options).unwrap();
        assert_eq!(paths(&listing), ["top.clk", "top.cpu.pc"]);
        assert_eq!(listing.total, 5);

        let options = ListOptions {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(list_signals(&trace, &options).unwrap().signals.len(), 5);
    }

    fn query(patterns: &[&str], start: u64, end: u64, format: ValueFormat) -> ValueQuery {
        ValueQuery {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            start,
            end,
            format,
            limit: None,
        }
    }

    #[test]
    fn test_values_and_warnings() {
        let mut trace = design();
        let report = get_values(&mut trace, &query(&["CPU", "mem"], 0, 7, ValueFormat::Hex)).unwrap();

        let summary: Vec<_> = report
            .signals
            .iter()
            .map(|s| (s.path.as_str(), s.changes.clone()))
            .collect();
        assert_eq!(
            summary,
            [
                ("top.cpu.pc", vec![(0, "0x0".to_string())]),
                (
                    "top.cpu.alu.result",
                    vec![(0, "bxxxx".to_string()), (5, "0xA".to_string())]
                ),
                ("top.mem.data", vec![]),
            ]
        );
        assert_eq!(
            report.warnings,
            ["top.cpu.alu.result@0: Value 'xxxx' contains x/z states, falling back to binary format"]
        );
    }

    #[test]
    fn test_values_limit() {
        let mut trace = design();
        let mut q = query(&["clk"], 0, 100, ValueFormat::Bin);
        q.limit = Some(1);
        let report = get_values(&mut trace, &q).unwrap();
        assert_eq!(report.signals.len(), 2);
        assert_eq!(report.signals[0].changes, [(0, "b0".to_string())]);
        assert!(report.signals[0].truncated);
        assert_eq!(report.signals[1].changes, [(3, "b1".to_string())]);
        assert!(!report.signals[1].truncated);
    }

    #[test]
    fn test_values_edge_cases() {
        let mut trace = design();
        assert!(matches!(
            get_values(&mut trace, &query(&["clk"], 10, 5, ValueFormat::Bin)),
            Err(Error::Validation(_))
        ));
        let report = get_values(&mut trace, &query(&["nothing"], 0, 10, ValueFormat::Bin)).unwrap();
        assert_eq!(report, ValueReport::default());
        let report = get_values(&mut trace, &query(&[], 0, 10, ValueFormat::Bin)).unwrap();
        assert!(report.signals.is_empty());

        // Inclusive bounds.
        let report = get_values(&mut trace, &query(&["top.clk"], 5, 5, ValueFormat::Dec)).unwrap();
        assert_eq!(report.signals[0].changes, [(5, "1".to_string())]);
    }
}
