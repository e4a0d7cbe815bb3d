use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use wavepeek::{
    float::{self, FloatKind},
    format::ValueFormat,
    query::{ListOptions, PatternMode, ValueQuery},
    render, Session, TraceKind,
};

#[derive(Parser, Debug)]
#[command(name = "wavepeek")]
#[command(version)]
#[command(about = "Inspect signals and value changes in VCD and FST waveform files.", long_about = None)]
struct Cli {
    /// More logging; repeat for debug output.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct TraceArgs {
    #[arg(value_name = "TRACE")]
    path: PathBuf,

    /// Trace format. Detected from the file contents if not given.
    #[arg(long)]
    kind: Option<TraceKind>,
}

impl TraceArgs {
    fn kind(&self) -> Result<TraceKind> {
        Ok(match self.kind {
            Some(kind) => kind,
            None => TraceKind::detect(&self.path)?,
        })
    }

    fn load(&self, session: &mut Session) -> Result<TraceKind> {
        let kind = self.kind()?;
        session.load(kind, &self.path)?;
        Ok(kind)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a trace and report how many signals it has.
    Load {
        #[command(flatten)]
        trace: TraceArgs,
    },
    /// List signals, optionally below a scope or matching a pattern.
    Signals {
        #[command(flatten)]
        trace: TraceArgs,
        /// Only signals below this scope, e.g. `top.cpu`.
        #[arg(long, default_value = "")]
        module: String,
        /// Maximum depth below the scope; negative for unlimited.
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        max_depth: i64,
        /// Substring of the path, or a regex with `--regex`.
        #[arg(long, default_value = "")]
        pattern: String,
        #[arg(long)]
        regex: bool,
        /// Maximum number of signals shown; 0 for all.
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Show the first and last time in the trace.
    TimeRange {
        #[command(flatten)]
        trace: TraceArgs,
    },
    /// Show the value changes of matching signals in a time window.
    Values {
        #[command(flatten)]
        trace: TraceArgs,
        /// Case-insensitive substring of the signal path. Repeatable.
        #[arg(short, long = "signal", required = true)]
        signals: Vec<String>,
        /// Defaults to the start of the trace.
        #[arg(long)]
        start: Option<u64>,
        /// Defaults to the end of the trace.
        #[arg(long)]
        end: Option<u64>,
        #[arg(long, default_value = "bin")]
        format: ValueFormat,
        /// Maximum number of changes per signal; 0 for all.
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Decode a hex bit pattern as a float.
    HexToFloat {
        value: String,
        #[arg(long = "type", default_value = "float32")]
        kind: FloatKind,
    },
    /// Encode a float as a hex bit pattern.
    FloatToHex {
        #[arg(allow_negative_numbers = true)]
        value: f64,
        #[arg(long = "type", default_value = "float32")]
        kind: FloatKind,
    },
    /// Decode a binary bit pattern as a float.
    BinToFloat {
        value: String,
        #[arg(long = "type", default_value = "float32")]
        kind: FloatKind,
    },
    /// Encode a float as a binary bit pattern.
    FloatToBin {
        #[arg(allow_negative_numbers = true)]
        value: f64,
        #[arg(long = "type", default_value = "float32")]
        kind: FloatKind,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut session = Session::new();

    match cli.command {
        Command::Load { trace } => {
            let kind = trace.kind()?;
            let summary = session.load(kind, &trace.path)?;
            println!("{}", render::render_load(&summary));
            let info = render::render_info(session.current(kind)?.info());
            if !info.is_empty() {
                println!("{info}");
            }
        }
        Command::Signals {
            trace,
            module,
            max_depth,
            pattern,
            regex,
            limit,
        } => {
            let kind = trace.load(&mut session)?;
            let options = ListOptions {
                module_path: module,
                max_depth: usize::try_from(max_depth).ok(),
                pattern,
                pattern_mode: if regex {
                    PatternMode::Regex
                } else {
                    PatternMode::Substring
                },
                limit,
            };
            let listing = session.list_signals(kind, &options)?;
            println!("{}", render::render_signals(kind, &listing));
        }
        Command::TimeRange { trace } => {
            let kind = trace.load(&mut session)?;
            println!("{}", render::render_time_range(session.time_range(kind)?));
        }
        Command::Values {
            trace,
            signals,
            start,
            end,
            format,
            limit,
        } => {
            let kind = trace.load(&mut session)?;
            let (trace_start, trace_end) = session.time_range(kind)?;
            let query = ValueQuery {
                patterns: signals,
                start: start.unwrap_or(trace_start),
                end: end.unwrap_or(trace_end),
                format,
                limit: (limit > 0).then_some(limit),
            };
            let report = session.get_values(kind, &query)?;
            println!("{}", render::render_values(&query, &report));
        }
        Command::HexToFloat { value, kind } => {
            println!("{:?}", float::hex_to_float(&value, kind)?);
        }
        Command::FloatToHex { value, kind } => {
            println!("{}", float::float_to_hex(value, kind)?);
        }
        Command::BinToFloat { value, kind } => {
            println!("{:?}", float::bin_to_float(&value, kind)?);
        }
        Command::FloatToBin { value, kind } => {
            println!("{}", float::float_to_bin(value, kind)?);
        }
    }

    Ok(())
}
