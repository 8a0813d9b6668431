use log::debug;

use crate::decoder::SampleSink;
use crate::procs::Mapping;

/// One parsed line of a `/proc/<pid>/maps` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsRegion {
    pub start: u64,
    pub end: u64,
    pub is_executable: bool,
    pub file_offset: u64,
    pub path: String,
}

/// Parse the text of a maps file. Lines that do not follow the expected
/// shape are skipped; the bootstrap scan has to survive processes that
/// vanish mid-read.
pub fn parse_maps(text: &str) -> Vec<MapsRegion> {
    let mut regions = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_ascii_whitespace();
        let (Some(range), Some(perms), Some(offset)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else { continue };
        let (Ok(start), Ok(end)) =
            (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        let Ok(file_offset) = u64::from_str_radix(offset, 16) else { continue };
        let is_executable = perms.as_bytes().get(2) == Some(&b'x');
        // Skip device and inode; the rest of the line is the path.
        let path = fields.nth(2).unwrap_or("").to_string();
        regions.push(MapsRegion { start, end, is_executable, file_offset, path });
    }
    regions
}

/// Seed the process table from the live system so samples arriving before
/// any notification still resolve. Only executable file-backed regions
/// become mappings.
pub fn bootstrap(sink: &mut SampleSink) {
    let Ok(entries) = std::fs::read_dir("/proc") else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else { continue };
        let Ok(text) = std::fs::read_to_string(entry.path().join("maps")) else {
            continue;
        };
        seed_process(sink, pid, &text);
    }
}

pub fn seed_process(sink: &mut SampleSink, pid: u32, maps_text: &str) {
    let mut count = 0;
    for region in parse_maps(maps_text) {
        if !region.is_executable || !region.path.starts_with('/') {
            continue;
        }
        let image = sink.images.find_or_create(&region.path, None, false);
        sink.procs.handle_mmap(
            pid,
            Mapping {
                image,
                start: region.start,
                end: region.end,
                offset: region.file_offset,
            },
        );
        count += 1;
    }
    if count > 0 {
        debug!("seeded pid {pid} with {count} mappings");
    }
}
