use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{alarm, chdir, fork, setsid, ForkResult};

use oxprof_db::{SampleFileHeader, SeparationFlags};

use oxprofd::cli::Opt;
use oxprofd::config::{self, Config, EventConfig};
use oxprofd::decoder::{process_samples, EventDecoder, SampleSink};
use oxprofd::device::Device;
use oxprofd::images::ImageRegistry;
use oxprofd::kernel::{parse_kernel_range, KernelRegistry};
use oxprofd::lockfile;
use oxprofd::notes::process_notes;
use oxprofd::proc_scan;
use oxprofd::procs::ProcessTable;
use oxprofd::session;
use oxprofd::sfiles::{SampleFiles, SfileContext};
use oxprofd::stats::Stats;

/// Sync, reap and dump stats every ten minutes.
const ALARM_SECS: u32 = 600;

fn main() {
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    let mut builder = env_logger::Builder::from_default_env();
    if opt.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let config = match build_config(&opt) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(&opt, config) {
        error!("{err}");
        std::process::exit(1);
    }
}

fn build_config(opt: &Opt) -> Result<Config, String> {
    let events = match &opt.events {
        Some(arg) => config::parse_events_arg(arg).map_err(|e| e.to_string())?,
        None => {
            let events = config::read_fs_events(&opt.mount);
            if events.is_empty() {
                return Err("no enabled events found; pass --events".to_string());
            }
            events
        }
    };

    let kernel_range = match (&opt.kernel_range, opt.no_vmlinux) {
        (Some(arg), _) => {
            parse_kernel_range(arg).ok_or_else(|| format!("bad kernel range: {arg}"))?
        }
        (None, true) => (0, 0),
        (None, false) => return Err("no kernel VMA range specified".to_string()),
    };

    let mut separation = SeparationFlags::empty();
    if opt.separate_lib != 0 {
        separation |= SeparationFlags::LIB;
    }
    if opt.separate_kernel != 0 {
        // Separating the kernel implies separating libraries: both split
        // dependent images per application.
        separation |= SeparationFlags::KERNEL | SeparationFlags::LIB;
    }
    if opt.separate_thread != 0 {
        separation |= SeparationFlags::THREAD;
    }
    if opt.separate_cpu != 0 {
        separation |= SeparationFlags::CPU;
    }

    let pointer_size = opt
        .kernel_pointer_size
        .or_else(|| config::read_fs_int(&opt.mount, "pointer_size").map(|v| v as usize))
        .unwrap_or(std::mem::size_of::<usize>());
    if pointer_size != 4 && pointer_size != 8 {
        return Err(format!("bad kernel pointer size {pointer_size}"));
    }

    let buffer_size = config::read_fs_int(&opt.mount, "buffer_size").unwrap_or(65536) as usize;
    let kernel_only = config::read_fs_int(&opt.mount, "kernel_only").unwrap_or(0) != 0;

    Ok(Config {
        session_dir: opt.session_dir.clone(),
        samples_dir: opt.session_dir.join("samples").join("current"),
        vmlinux: if opt.no_vmlinux { None } else { opt.vmlinux.clone() },
        kernel_range,
        separation,
        events,
        cpu_type: 0,
        cpu_speed_mhz: config::cpu_speed_mhz(),
        kernel_only,
        buffer_size,
        kernel_pointer_size: pointer_size,
    })
}

/// The session signature a sample file written now would carry; existing
/// files that disagree force a rotation.
fn session_signature(config: &Config, event: &EventConfig) -> SampleFileHeader {
    SampleFileHeader {
        event_id: event.id,
        unit_mask: event.unit_mask,
        reset_count: event.count,
        cpu_type: config.cpu_type,
        separation: config.separation.bits(),
        ..Default::default()
    }
}

fn open_logfile(path: &Path) -> std::io::Result<()> {
    let log = OpenOptions::new().create(true).append(true).open(path)?;
    let fd = log.as_raw_fd();
    // stdout and stderr both go to the logfile; the descriptor stays
    // open through the duplicated fds.
    unsafe {
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
    Ok(())
}

fn go_daemon(config: &Config) -> Result<(), String> {
    match unsafe { fork() }.map_err(|e| e.to_string())? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    chdir(&config.session_dir).map_err(|e| e.to_string())?;
    setsid().map_err(|e| e.to_string())?;
    match unsafe { fork() }.map_err(|e| e.to_string())? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    open_logfile(&config.log_path()).map_err(|e| e.to_string())?;
    Ok(())
}

fn run(opt: &Opt, config: Config) -> Result<(), String> {
    std::fs::create_dir_all(&config.samples_dir).map_err(|e| e.to_string())?;

    // Rotate a previous session out before anything opens sample files.
    let signature = session_signature(&config, &config.events[0]);
    if session::needs_backup(&config.samples_dir, &signature) {
        session::backup_samples(&config.samples_dir).map_err(|e| e.to_string())?;
    }

    if !opt.foreground {
        go_daemon(&config)?;
    }

    lockfile::write_lockfile(&config.lock_path()).map_err(|e| e.to_string())?;

    let mut images = ImageRegistry::new();
    let mut kernel =
        KernelRegistry::new(config.vmlinux.as_deref(), config.kernel_range, &mut images);
    kernel.reread_modules(&mut images);
    let mut procs = ProcessTable::new();
    let mut sfiles = SampleFiles::new(config.events.len());
    let mut stats = Stats::default();

    let mut device = Device::open(&opt.device)
        .map_err(|e| format!("failed to open {}: {e}", opt.device.display()))?;
    let mut note_device = match &opt.note_device {
        Some(path) => {
            let device = Device::open(path)
                .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
            device.set_nonblocking().map_err(|e| e.to_string())?;
            Some(device)
        }
        None => None,
    };

    let term = Arc::new(AtomicBool::new(false));
    let hup = Arc::new(AtomicBool::new(false));
    let alrm = Arc::new(AtomicBool::new(false));
    for (signal, flag) in [
        (signal_hook::consts::SIGTERM, &term),
        (signal_hook::consts::SIGINT, &term),
        (signal_hook::consts::SIGHUP, &hup),
        (signal_hook::consts::SIGALRM, &alrm),
    ] {
        signal_hook::flag::register(signal, Arc::clone(flag))
            .map_err(|e| format!("cannot register signal handler: {e}"))?;
    }

    // Everything between a buffer read and the end of its processing runs
    // with these blocked; handler work is deferred to the loop top.
    let mut blockset = SigSet::empty();
    for signal in [
        Signal::SIGALRM,
        Signal::SIGHUP,
        Signal::SIGTERM,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
    ] {
        blockset.add(signal);
    }

    let _ = alarm::set(ALARM_SECS);
    if let Some(interrupts) = config::read_fs_int(&opt.mount, "nr_interrupts") {
        info!("nr_interrupts at startup: {interrupts}");
    }
    info!("oxprofd started");

    let ctx = SfileContext {
        samples_dir: &config.samples_dir,
        separation: config.separation,
        events: &config.events,
        cpu_type: config.cpu_type,
        cpu_speed_mhz: config.cpu_speed_mhz,
    };
    let decoder = EventDecoder::new(config.kernel_pointer_size);
    let mut buf = vec![0u8; config.buffer_size * config.kernel_pointer_size];
    let mut note_buf = vec![0u8; config.buffer_size];

    {
        let mut sink = SampleSink {
            images: &mut images,
            kernel: &mut kernel,
            procs: &mut procs,
            sfiles: &mut sfiles,
            stats: &mut stats,
            ctx: &ctx,
            kernel_only: config.kernel_only,
        };
        proc_scan::bootstrap(&mut sink);
    }

    loop {
        if term.load(Ordering::SeqCst) {
            break;
        }
        if alrm.swap(false, Ordering::SeqCst) {
            sfiles.sync_all();
            procs.age();
            stats.log_summary();
            let _ = alarm::set(ALARM_SECS);
        }
        if hup.swap(false, Ordering::SeqCst) {
            if !opt.foreground {
                if let Err(err) = open_logfile(&config.log_path()) {
                    warn!("failed to reopen log file: {err}");
                }
            }
            // Closed files reopen lazily on the next sample.
            sfiles.close_all();
        }

        let count = match device.read_buffer(&mut buf) {
            Ok(Some(0)) => {
                // End of stream: the producer is gone; drain and stop.
                term.store(true, Ordering::SeqCst);
                continue;
            }
            Ok(Some(count)) => count,
            Ok(None) => continue,
            Err(err) => return Err(format!("device read failed: {err}")),
        };

        let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blockset), None);
        let mut sink = SampleSink {
            images: &mut images,
            kernel: &mut kernel,
            procs: &mut procs,
            sfiles: &mut sfiles,
            stats: &mut stats,
            ctx: &ctx,
            kernel_only: config.kernel_only,
        };
        if let Some(notes) = &mut note_device {
            let _ = notes.drain(&mut note_buf, |bytes| process_notes(&mut sink, bytes));
        }
        sink.stats.dump_count += 1;
        process_samples(&decoder, &mut sink, &buf[..count]);
        let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&blockset), None);
    }

    // Graceful shutdown: switch non-blocking and drain what is left.
    {
        let mut sink = SampleSink {
            images: &mut images,
            kernel: &mut kernel,
            procs: &mut procs,
            sfiles: &mut sfiles,
            stats: &mut stats,
            ctx: &ctx,
            kernel_only: config.kernel_only,
        };
        if let Some(notes) = &mut note_device {
            let _ = notes.drain(&mut note_buf, |bytes| process_notes(&mut sink, bytes));
        }
        let _ = device.drain(&mut buf, |bytes| process_samples(&decoder, &mut sink, bytes));
    }

    sfiles.sync_all();
    stats.log_summary();
    lockfile::remove_lockfile(&config.lock_path());
    info!("oxprofd stopped");
    Ok(())
}
