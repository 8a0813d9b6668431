use std::io;
use std::path::{Path, PathBuf};

use log::info;
use zerocopy::FromBytes;

use oxprof_db::{SampleFileHeader, ODB_MAGIC};

/// Read just the persisted header of a sample file, without mapping it.
fn read_header(path: &Path) -> Option<SampleFileHeader> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() < SampleFileHeader::SIZE {
        return None;
    }
    let header = SampleFileHeader::read_from_bytes(&bytes[..SampleFileHeader::SIZE]).ok()?;
    if header.magic != ODB_MAGIC {
        return None;
    }
    Some(header)
}

fn visit_sample_files(dir: &Path, f: &mut impl FnMut(&Path)) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            // Rotated sessions are not part of the current one.
            if name.starts_with("session-") {
                continue;
            }
            visit_sample_files(&path, f)?;
        } else if path.is_file() {
            f(&path);
        }
    }
    Ok(())
}

/// Check whether any existing sample file was written with a different
/// session signature than `current`. This runs eagerly at startup: a lazy
/// check could mix old and new configurations once some files have
/// already been written.
pub fn needs_backup(samples_dir: &Path, current: &SampleFileHeader) -> bool {
    if !samples_dir.is_dir() {
        return false;
    }
    let mut mismatch = false;
    let _ = visit_sample_files(samples_dir, &mut |path| {
        if mismatch {
            return;
        }
        if let Some(header) = read_header(path) {
            if !header.same_session_signature(current) {
                mismatch = true;
            }
        }
    });
    mismatch
}

/// Rotate the current samples into `session-N/`, choosing the first free
/// generation number.
pub fn backup_samples(samples_dir: &Path) -> io::Result<PathBuf> {
    let mut gen = 0;
    let backup_dir = loop {
        gen += 1;
        let candidate = samples_dir.join(format!("session-{gen}"));
        if !candidate.exists() {
            break candidate;
        }
    };
    std::fs::create_dir_all(&backup_dir)?;
    info!("backing up samples to {}", backup_dir.display());

    for entry in std::fs::read_dir(samples_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("session-") {
            continue;
        }
        std::fs::rename(entry.path(), backup_dir.join(&name))?;
    }
    Ok(backup_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxprof_db::{Odb, OdbMode};

    fn write_sample_file(dir: &Path, rel: &str, header: &SampleFileHeader) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut odb = Odb::open(&path, OdbMode::ReadWrite).unwrap();
        odb.set_header(header).unwrap();
    }

    #[test]
    fn matching_headers_need_no_backup() {
        let dir = tempfile::tempdir().unwrap();
        let header = SampleFileHeader { event_id: 60, created_at: 1, ..Default::default() };
        write_sample_file(dir.path(), "{root}/bin/A/CLK.100.0.all.all.all", &header);
        assert!(!needs_backup(dir.path(), &header));
    }

    #[test]
    fn changed_configuration_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let old = SampleFileHeader { event_id: 60, created_at: 1, ..Default::default() };
        write_sample_file(dir.path(), "{root}/bin/A/CLK.100.0.all.all.all", &old);

        let new = SampleFileHeader { event_id: 61, created_at: 2, ..Default::default() };
        assert!(needs_backup(dir.path(), &new));

        let backup = backup_samples(dir.path()).unwrap();
        assert_eq!(backup, dir.path().join("session-1"));
        assert!(backup.join("{root}/bin/A/CLK.100.0.all.all.all").is_file());
        assert!(!needs_backup(dir.path(), &new));

        // A second rotation picks the next generation.
        write_sample_file(dir.path(), "{root}/bin/B/CLK.100.0.all.all.all", &old);
        let backup2 = backup_samples(dir.path()).unwrap();
        assert_eq!(backup2, dir.path().join("session-2"));
    }
}
