//! Plain text rendering of query results for the command line.

use crate::{
    query::{SignalListing, ValueQuery, ValueReport},
    session::LoadSummary,
    trace::{TraceInfo, TraceKind},
};

/// Warnings beyond this many are summarised in a single line.
const MAX_WARNINGS_SHOWN: usize = 10;

pub fn render_load(summary: &LoadSummary) -> String {
    format!(
        "Successfully loaded {} file: {}\nFound {} signals.",
        summary.kind,
        summary.path.display(),
        summary.num_signals
    )
}

pub fn render_info(info: &TraceInfo) -> String {
    let mut lines = Vec::new();
    if let Some(timescale) = info.timescale {
        lines.push(format!("Timescale: {timescale}"));
    }
    if let Some(version) = &info.version {
        lines.push(format!("Version: {version}"));
    }
    if let Some(date) = &info.date {
        lines.push(format!("Date: {date}"));
    }
    for blackout in &info.blackouts {
        let state = if blackout.dump_on { "on" } else { "off" };
        lines.push(format!("Dump {state} at {}", blackout.time));
    }
    lines.join("\n")
}

pub fn render_signals(kind: TraceKind, listing: &SignalListing) -> String {
    if listing.signals.is_empty() {
        return format!("No signals found in {kind} file.");
    }
    let mut lines = vec![format!("Signals in {kind} file:")];
    for signal in &listing.signals {
        lines.push(format!(
            "  {:<40} type={:<4} size={}",
            signal.path, signal.kind, signal.width
        ));
    }
    if listing.total > listing.signals.len() {
        lines.push(format!(
            "Showing {} of {} signals.",
            listing.signals.len(),
            listing.total
        ));
    }
    lines.join("\n")
}

pub fn render_time_range((start, end): (u64, u64)) -> String {
    format!(
        "Time range: {start} to {end} (total: {} time units)",
        end.saturating_sub(start)
    )
}

fn pattern_list(patterns: &[String]) -> String {
    let quoted: Vec<String> = patterns.iter().map(|p| format!("'{p}'")).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn render_values(query: &ValueQuery, report: &ValueReport) -> String {
    let (start, end) = (query.start, query.end);
    if report.signals.is_empty() {
        return format!(
            "No matching signals found or no values in time range [{start}, {end}] for patterns: {}",
            pattern_list(&query.patterns)
        );
    }

    let mut lines = vec![format!("Signal values in time range [{start}, {end}]:")];

    if !report.warnings.is_empty() {
        lines.push("\nWarnings:".to_string());
        for warning in report.warnings.iter().take(MAX_WARNINGS_SHOWN) {
            lines.push(format!("  {warning}"));
        }
        if report.warnings.len() > MAX_WARNINGS_SHOWN {
            lines.push(format!(
                "  ... and {} more warnings",
                report.warnings.len() - MAX_WARNINGS_SHOWN
            ));
        }
        lines.push(String::new());
    }

    for signal in &report.signals {
        lines.push(format!("\n{}:", signal.path));
        if signal.changes.is_empty() {
            lines.push("  (no changes in this range)".to_string());
        }
        for (time, value) in &signal.changes {
            lines.push(format!("  {time:>10}: {value}"));
        }
        if signal.truncated {
            lines.push("  ... (limit reached)".to_string());
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        format::ValueFormat,
        query::SignalValues,
        trace::{Blackout, Timescale},
    };

    fn query(patterns: &[&str]) -> ValueQuery {
        ValueQuery {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            start: 0,
            end: 100,
            format: ValueFormat::Hex,
            limit: None,
        }
    }

    #[test]
    fn test_render_values() {
        let report = ValueReport {
            signals: vec![
                SignalValues {
                    path: "top.a".to_string(),
                    changes: vec![(0, "0x1".to_string()), (25, "bx".to_string())],
                    truncated: false,
                },
                SignalValues {
                    path: "top.b".to_string(),
                    changes: vec![],
                    truncated: false,
                },
            ],
            warnings: vec!["top.a@25: Value 'x' contains x/z states, falling back to binary format"
                .to_string()],
        };
        let expected = [
            "Signal values in time range [0, 100]:".to_string(),
            "\nWarnings:".to_string(),
            "  top.a@25: Value 'x' contains x/z states, falling back to binary format".to_string(),
            String::new(),
            "\ntop.a:".to_string(),
            format!("  {:>10}: 0x1", 0),
            format!("  {:>10}: bx", 25),
            "\ntop.b:".to_string(),
            "  (no changes in this range)".to_string(),
        ]
        .join("\n");
        assert_eq!(render_values(&query(&["top"]), &report), expected);
    }

    #[test]
    fn test_render_many_warnings() {
        let report = ValueReport {
            signals: vec![SignalValues {
                path: "top.a".to_string(),
                changes: vec![],
                truncated: true,
            }],
            warnings: (0..13).map(|i| format!("w{i}")).collect(),
        };
        let text = render_values(&query(&["a"]), &report);
        assert!(text.contains("  w9\n  ... and 3 more warnings\n"));
        assert!(!text.contains("w10"));
        assert!(text.ends_with("  ... (limit reached)"));
    }

    #[test]
    fn test_render_other() {
        assert_eq!(
            render_values(&query(&["x", "y"]), &ValueReport::default()),
            "No matching signals found or no values in time range [0, 100] for patterns: ['x', 'y']"
        );
        assert_eq!(
            render_time_range((10, 990)),
            "Time range: 10 to 990 (total: 980 time units)"
        );

        let info = TraceInfo {
            timescale: Some(Timescale::from_exponent(-12)),
            version: Some("sim 1.0".to_string()),
            ..Default::default()
        };
        assert_eq!(render_info(&info), "Timescale: 1ps\nVersion: sim 1.0");
        assert_eq!(render_info(&TraceInfo::default()), "");

        let info = TraceInfo {
            date: Some("today".to_string()),
            blackouts: vec![
                Blackout {
                    time: 15,
                    dump_on: false,
                },
                Blackout {
                    time: 40,
                    dump_on: true,
                },
            ],
            ..Default::default()
        };
        assert_eq!(
            render_info(&info),
            "Date: today\nDump off at 15\nDump on at 40"
        );

        let listing = SignalListing {
            signals: vec![crate::query::SignalInfo {
                path: "top.clk".to_string(),
                name: "clk".to_string(),
                kind: "wire".to_string(),
                width: 1,
            }],
            total: 3,
        };
        assert_eq!(
            render_signals(TraceKind::Fst, &listing),
            format!(
                "Signals in FST file:\n  {:<40} type=wire size=1\nShowing 1 of 3 signals.",
                "top.clk"
            )
        );
        assert_eq!(
            render_signals(TraceKind::Vcd, &SignalListing::default()),
            "No signals found in VCD file."
        );
    }
}
