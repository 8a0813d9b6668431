use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "oxprof",
    version,
    about = r#"
oxprof reads recorded sample databases and produces reports.

EXAMPLES:
    # Symbol summary of the current session:
    oxprof report --symbols

    # Side-by-side per-CPU columns:
    oxprof report --symbols cpu:0,1,2,3

    # Annotated output with line numbers:
    oxprof annotate --debug-info image:/bin/myprog

    # gprof-compatible histogram for one binary:
    oxprof gprof image:/bin/myprog -o gmon.out
"#
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Summarize samples per symbol or per binary image.
    Report(ReportArgs),

    /// Show per-address detail with source locations.
    Annotate(ReportArgs),

    /// Write a gmon.out histogram for a single image.
    Gprof(GprofArgs),

    /// Show the recorded callgraph arcs.
    Stack(StackArgs),

    /// Compare two profiles symbol by symbol.
    Diff(DiffArgs),
}

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Session base directory holding samples/current.
    #[arg(long, default_value = "/var/lib/oxprof")]
    pub session_dir: PathBuf,

    /// Merge these axes instead of splitting classes: cpu, lib, tid,
    /// tgid, unitmask, all (comma separated).
    #[arg(short, long, default_value = "")]
    pub merge: String,

    /// Drop symbols below this percentage of total samples.
    #[arg(short, long, default_value = "0")]
    pub threshold: f64,

    /// Write the report here instead of stdout.
    #[arg(short, long)]
    pub output_file: Option<PathBuf>,

    /// Resolve and show source file and line numbers.
    #[arg(short = 'g', long)]
    pub debug_info: bool,

    /// Show full paths instead of basenames.
    #[arg(short, long)]
    pub long_filenames: bool,

    /// Show accumulated counts and percentages.
    #[arg(short, long)]
    pub accumulated: bool,

    /// Reverse the sort order.
    #[arg(short, long)]
    pub reverse_sort: bool,

    /// Percentages relative to the whole profile, not the selection.
    #[arg(long)]
    pub global_percent: bool,

    /// Sort keys: sample, vma, symbol, image, app-name, debug.
    #[arg(short, long, default_value = "sample")]
    pub sort: String,

    /// Only report these symbols (comma separated).
    #[arg(long)]
    pub include_symbols: Option<String>,

    /// Hide these symbols (comma separated).
    #[arg(long)]
    pub exclude_symbols: Option<String>,

    /// Leave out dependent images (shared libraries, kernel).
    #[arg(long)]
    pub exclude_dependent: bool,

    /// Do not demangle symbol names.
    #[arg(long)]
    pub no_demangle: bool,

    /// Profile specification: event:NAME count:N unitmask:M tid:T
    /// tgid:T cpu:C session:S image:PATTERN image-exclude:PATTERN.
    #[arg(trailing_var_arg = true)]
    pub spec: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// List per-symbol counts rather than per-image totals.
    #[arg(long)]
    pub symbols: bool,

    /// Add per-address detail rows under each symbol.
    #[arg(long)]
    pub details: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct GprofArgs {
    /// Output filename.
    #[arg(long, default_value = "gmon.out")]
    pub output: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct StackArgs {
    /// Prune entries below this percentage of total samples.
    #[arg(long, default_value = "0")]
    pub prune: f64,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct DiffArgs {
    /// Session base directory of the reference (old) profile.
    #[arg(long)]
    pub base_session_dir: PathBuf,

    #[command(flatten)]
    pub common: CommonArgs,
}
