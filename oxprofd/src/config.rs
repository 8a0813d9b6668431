use std::path::{Path, PathBuf};

use oxprof_db::SeparationFlags;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("bad event specification: {0}")]
    BadEventSpec(String),

    #[error("bad kernel range: {0}")]
    BadKernelRange(String),

    #[error("no events are enabled")]
    NoEvents,
}

/// One configured counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventConfig {
    pub name: String,
    /// Numeric event id, as persisted in sample-file headers.
    pub id: u32,
    pub counter: u32,
    pub count: u32,
    pub unit_mask: u32,
    pub kernel: bool,
    pub user: bool,
}

/// Fully resolved daemon configuration.
#[derive(Debug)]
pub struct Config {
    pub session_dir: PathBuf,
    pub samples_dir: PathBuf,
    pub vmlinux: Option<String>,
    pub kernel_range: (u64, u64),
    pub separation: SeparationFlags,
    pub events: Vec<EventConfig>,
    pub cpu_type: u32,
    pub cpu_speed_mhz: f64,
    pub kernel_only: bool,
    pub buffer_size: usize,
    /// Width of a buffer word, 4 or 8; decides the escape sentinel.
    pub kernel_pointer_size: usize,
}

impl Config {
    pub fn lock_path(&self) -> PathBuf {
        self.session_dir.join("lock")
    }

    pub fn log_path(&self) -> PathBuf {
        self.session_dir.join("oprofiled.log")
    }
}

/// Read a decimal ASCII integer (newline-terminated) from a control-plane
/// file, the way every oprofilefs value is exposed.
pub fn read_fs_int(mount: &Path, name: &str) -> Option<u64> {
    let text = std::fs::read_to_string(mount.join(name)).ok()?;
    text.trim().parse().ok()
}

/// Read the per-counter integer `<mount>/<ctr>/<name>`.
pub fn read_fs_int_counter(mount: &Path, ctr: u32, name: &str) -> Option<u64> {
    read_fs_int(mount, &format!("{ctr}/{name}"))
}

/// Read counter setup from the control plane: for each counter directory,
/// `event`, `count`, `unit_mask` and `enabled`.
pub fn read_fs_events(mount: &Path) -> Vec<EventConfig> {
    let mut events = Vec::new();
    for ctr in 0.. {
        let Some(enabled) = read_fs_int_counter(mount, ctr, "enabled") else {
            break;
        };
        if enabled == 0 {
            continue;
        }
        let id = read_fs_int_counter(mount, ctr, "event").unwrap_or(0) as u32;
        let count = read_fs_int_counter(mount, ctr, "count").unwrap_or(0) as u32;
        let unit_mask = read_fs_int_counter(mount, ctr, "unit_mask").unwrap_or(0) as u32;
        events.push(EventConfig {
            name: format!("EVENT_{id}"),
            id,
            counter: ctr,
            count,
            unit_mask,
            kernel: true,
            user: true,
        });
    }
    events
}

/// Parse `--events=ev1:val:ctr:count:um:kernel:user,ev2:...`.
pub fn parse_events_arg(arg: &str) -> Result<Vec<EventConfig>, ConfigError> {
    let mut events = Vec::new();
    for spec in arg.split(',') {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 7 || parts[0].is_empty() {
            return Err(ConfigError::BadEventSpec(spec.to_string()));
        }
        let num = |s: &str| -> Result<u32, ConfigError> {
            s.parse().map_err(|_| ConfigError::BadEventSpec(spec.to_string()))
        };
        events.push(EventConfig {
            name: parts[0].to_string(),
            id: num(parts[1])?,
            counter: num(parts[2])?,
            count: num(parts[3])?,
            unit_mask: num(parts[4])?,
            kernel: num(parts[5])? != 0,
            user: num(parts[6])? != 0,
        });
    }
    if events.is_empty() {
        return Err(ConfigError::NoEvents);
    }
    Ok(events)
}

/// Extract the first `cpu MHz` value from /proc/cpuinfo text.
pub fn parse_cpu_mhz(cpuinfo: &str) -> Option<f64> {
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        if key.trim() == "cpu MHz" {
            return value.trim().parse().ok();
        }
    }
    None
}

pub fn cpu_speed_mhz() -> f64 {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|text| parse_cpu_mhz(&text))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arg_parses() {
        let events =
            parse_events_arg("CPU_CLK_UNHALTED:60:0:100000:0:1:1,DATA_MEM_REFS:67:1:500:3:0:1")
                .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "CPU_CLK_UNHALTED");
        assert_eq!(events[0].id, 60);
        assert_eq!(events[0].count, 100_000);
        assert!(events[0].kernel);
        assert_eq!(events[1].counter, 1);
        assert_eq!(events[1].unit_mask, 3);
        assert!(!events[1].kernel);
    }

    #[test]
    fn malformed_event_specs_fail() {
        assert!(parse_events_arg("CLK:60:0:100000:0:1").is_err());
        assert!(parse_events_arg(":60:0:100000:0:1:1").is_err());
        assert!(parse_events_arg("CLK:x:0:100000:0:1:1").is_err());
    }

    #[test]
    fn cpu_mhz_comes_from_cpuinfo() {
        let text = "processor\t: 0\nmodel name\t: Foo\ncpu MHz\t\t: 2394.230\n";
        assert_eq!(parse_cpu_mhz(text), Some(2394.23));
    }

    #[test]
    fn fs_ints_are_newline_terminated_decimal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("buffer_size"), "65536\n").unwrap();
        assert_eq!(read_fs_int(dir.path(), "buffer_size"), Some(65536));
        assert_eq!(read_fs_int(dir.path(), "missing"), None);

        std::fs::create_dir(dir.path().join("0")).unwrap();
        std::fs::write(dir.path().join("0/event"), "60\n").unwrap();
        std::fs::write(dir.path().join("0/count"), "100000\n").unwrap();
        std::fs::write(dir.path().join("0/unit_mask"), "0\n").unwrap();
        std::fs::write(dir.path().join("0/enabled"), "1\n").unwrap();
        let events = read_fs_events(dir.path());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 60);
        assert_eq!(events[0].count, 100_000);
    }
}
