use std::path::PathBuf;

use clap::Parser;
use log::error;

use oxprof_jitconv::convert::convert_all;

#[derive(Debug, Parser)]
#[command(
    name = "oxprof-jitconv",
    version,
    about = "Convert per-process JIT dump files into ELF objects."
)]
struct Opt {
    /// Directory holding <pid>.dump files.
    #[arg(long, default_value = "/tmp/.oxprof/jitdump")]
    jitdump_dir: PathBuf,

    /// Where the <pid>.jo objects are placed.
    #[arg(long)]
    output_dir: PathBuf,

    /// Only keep code loaded at or after this timestamp.
    #[arg(long, default_value = "0")]
    start_time: u64,

    /// Only keep code loaded before this timestamp.
    #[arg(long, default_value = "18446744073709551615")]
    end_time: u64,

    /// Delete dump files after conversion (non-root owners only).
    #[arg(long)]
    delete_jitdumps: bool,
}

fn main() {
    env_logger::init();
    let opt = Opt::parse();
    match convert_all(
        &opt.jitdump_dir,
        &opt.output_dir,
        opt.start_time,
        opt.end_time,
        opt.delete_jitdumps,
    ) {
        Ok(count) => {
            if count == 0 {
                log::info!("no dump files converted");
            }
        }
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}
