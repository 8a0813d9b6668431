use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "oxprofd",
    version,
    about = "\
oxprofd drains the kernel's sample buffer into per-image sample databases.

It is normally started by the profiler control scripts; all mandatory
state (events, kernel range) must be given up front."
)]
pub struct Opt {
    /// Session base directory; samples land under <dir>/samples/current.
    #[arg(long, default_value = "/var/lib/oxprof")]
    pub session_dir: PathBuf,

    /// Kernel image for kernel-space samples.
    #[arg(long, required_unless_present = "no_vmlinux")]
    pub vmlinux: Option<String>,

    /// Profile without a kernel image; kernel samples keep absolute
    /// addresses.
    #[arg(long, conflicts_with = "vmlinux")]
    pub no_vmlinux: bool,

    /// Kernel text range as start-end (hex).
    #[arg(long, value_name = "START-END", required_unless_present = "no_vmlinux")]
    pub kernel_range: Option<String>,

    /// Separate shared-library samples per application.
    #[arg(long, value_name = "0|1", default_value = "0")]
    pub separate_lib: u8,

    /// Separate kernel samples per application.
    #[arg(long, value_name = "0|1", default_value = "0")]
    pub separate_kernel: u8,

    /// Separate samples per thread (tgid/tid).
    #[arg(long, value_name = "0|1", default_value = "0")]
    pub separate_thread: u8,

    /// Separate samples per CPU.
    #[arg(long, value_name = "0|1", default_value = "0")]
    pub separate_cpu: u8,

    /// Counter setup: ev1:val:ctr:count:um:kernel:user,ev2:...
    /// Overrides the control-plane files.
    #[arg(long)]
    pub events: Option<String>,

    /// Mounted control-plane directory.
    #[arg(long, default_value = "/dev/oprofile")]
    pub mount: PathBuf,

    /// Sample buffer device.
    #[arg(long, default_value = "/dev/oprofile/buffer")]
    pub device: PathBuf,

    /// Notification buffer device.
    #[arg(long)]
    pub note_device: Option<PathBuf>,

    /// Buffer word width in bytes (4 or 8); defaults to the control
    /// plane's pointer_size, then to the native width.
    #[arg(long)]
    pub kernel_pointer_size: Option<usize>,

    /// Stay in the foreground and log to stderr.
    #[arg(long)]
    pub foreground: bool,

    /// Log every decoded event.
    #[arg(long)]
    pub verbose: bool,
}
