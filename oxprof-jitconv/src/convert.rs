use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use object::write::{Object, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};

use crate::jitdump::{lock_with_retry, JitDump, JitRecord};
use crate::JitConvError;

/// One JIT function surviving record selection.
#[derive(Debug)]
struct SelectedFunction {
    vma: u64,
    name: String,
    code: Vec<u8>,
}

fn overlaps(a_start: u64, a_len: u64, b_start: u64, b_len: u64) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}

/// Choose the code_load records that describe the address space during
/// [start, end): loads outside the window are dropped, and a later load
/// at an overlapping address shadows the earlier one.
fn select_functions(dump: &JitDump, start: u64, end: u64) -> Vec<SelectedFunction> {
    let mut selected: Vec<SelectedFunction> = Vec::new();
    for record in &dump.records {
        let JitRecord::CodeLoad { timestamp, vma, name, code } = record else {
            continue;
        };
        if *timestamp < start || *timestamp >= end {
            continue;
        }
        selected.retain(|f| !overlaps(f.vma, f.code.len() as u64, *vma, code.len() as u64));
        selected.push(SelectedFunction { vma: *vma, name: name.clone(), code: code.clone() });
    }
    selected
}

fn architecture(elf_arch: u32) -> Architecture {
    match elf_arch {
        3 => Architecture::I386,
        40 => Architecture::Arm,
        62 => Architecture::X86_64,
        183 => Architecture::Aarch64,
        _ => {
            if cfg!(target_pointer_width = "64") {
                Architecture::X86_64
            } else {
                Architecture::I386
            }
        }
    }
}

/// Build an ELF object whose text section holds the selected code and
/// whose symbols carry the JIT function names at their recorded VMAs.
fn build_elf(dump: &JitDump, functions: &[SelectedFunction]) -> Result<Vec<u8>, JitConvError> {
    let mut obj = Object::new(
        BinaryFormat::Elf,
        architecture(dump.header.elf_arch),
        Endianness::Little,
    );
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);

    for function in functions {
        obj.append_section_data(text, &function.code, 16);
        obj.add_symbol(Symbol {
            name: function.name.clone().into_bytes(),
            value: function.vma,
            size: function.code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    obj.write().map_err(|e| JitConvError::ElfWrite(e.to_string()))
}

/// Convert one dump file into `<out_dir>/<pid>.jo`.
///
/// The source is locked (bounded retry), copied into a private temporary
/// directory, and unlocked before any real work happens; the output is
/// written to a temporary path and atomically renamed into place.
pub fn convert_dumpfile(
    dump_path: &Path,
    out_dir: &Path,
    start_time: u64,
    end_time: u64,
) -> Result<PathBuf, JitConvError> {
    let file = File::open(dump_path)
        .map_err(|e| JitConvError::Io { path: dump_path.to_owned(), source: e })?;
    lock_with_retry(&file, dump_path)?;

    let work_dir = tempfile::tempdir()
        .map_err(|e| JitConvError::Io { path: dump_path.to_owned(), source: e })?;
    let private_copy = work_dir.path().join("copy.dump");
    let copy_result = std::fs::copy(dump_path, &private_copy);
    drop(file); // releases the lock
    copy_result.map_err(|e| JitConvError::Io { path: dump_path.to_owned(), source: e })?;

    let data = std::fs::read(&private_copy)
        .map_err(|e| JitConvError::Io { path: private_copy.clone(), source: e })?;
    let dump = JitDump::parse(&private_copy, &data)?;

    let functions = select_functions(&dump, start_time, end_time);
    debug!(
        "{}: {} of {} records selected",
        dump_path.display(),
        functions.len(),
        dump.records.len()
    );
    let elf = build_elf(&dump, &functions)?;

    std::fs::create_dir_all(out_dir)
        .map_err(|e| JitConvError::Io { path: out_dir.to_owned(), source: e })?;
    let out_path = out_dir.join(format!("{}.jo", dump.header.pid));
    let tmp_path = out_dir.join(format!("{}.jo.part", dump.header.pid));
    std::fs::write(&tmp_path, &elf)
        .map_err(|e| JitConvError::Io { path: tmp_path.clone(), source: e })?;
    std::fs::rename(&tmp_path, &out_path)
        .map_err(|e| JitConvError::Io { path: out_path.clone(), source: e })?;
    info!("wrote {}", out_path.display());
    Ok(out_path)
}

/// Whether `pid` still has `path` open, judged by its /proc fd table.
fn pid_has_open(pid: u32, path: &Path) -> bool {
    let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
    let Ok(entries) = std::fs::read_dir(&fd_dir) else { return false };
    for entry in entries.flatten() {
        if let Ok(target) = std::fs::read_link(entry.path()) {
            if target == path {
                return true;
            }
        }
    }
    false
}

/// Remove a converted dump file, but only for a non-root caller that owns
/// it and only once the producing process no longer holds it open.
pub fn delete_dumpfile(dump_path: &Path, pid: u32) -> Result<(), JitConvError> {
    let uid = unsafe { libc::getuid() };
    if uid == 0 {
        return Err(JitConvError::RootMayNotDelete);
    }
    let meta = std::fs::metadata(dump_path)
        .map_err(|e| JitConvError::Io { path: dump_path.to_owned(), source: e })?;
    if meta.uid() != uid {
        return Err(JitConvError::NotOwner { path: dump_path.to_owned() });
    }
    if pid_has_open(pid, dump_path) {
        return Err(JitConvError::StillInUse { path: dump_path.to_owned() });
    }
    std::fs::remove_file(dump_path)
        .map_err(|e| JitConvError::Io { path: dump_path.to_owned(), source: e })
}

/// Convert every `<pid>.dump` in a directory. Failures on individual
/// dumps are logged and skipped; a JIT process crashing mid-write must
/// not sink the whole report run.
pub fn convert_all(
    jitdump_dir: &Path,
    out_dir: &Path,
    start_time: u64,
    end_time: u64,
    delete_dumps: bool,
) -> Result<usize, JitConvError> {
    let entries = std::fs::read_dir(jitdump_dir)
        .map_err(|e| JitConvError::Io { path: jitdump_dir.to_owned(), source: e })?;
    let mut converted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        if path.extension().and_then(|e| e.to_str()) != Some("dump") {
            continue;
        }
        let Ok(pid) = stem.parse::<u32>() else { continue };
        match convert_dumpfile(&path, out_dir, start_time, end_time) {
            Ok(_) => {
                converted += 1;
                if delete_dumps {
                    if let Err(err) = delete_dumpfile(&path, pid) {
                        warn!("not deleting {}: {err}", path.display());
                    }
                }
            }
            Err(err) => warn!("skipping {}: {err}", path.display()),
        }
    }
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitdump::JitDumpWriter;
    use object::{Object as _, ObjectSymbol};

    fn write_dump(dir: &Path) -> PathBuf {
        let mut writer = JitDumpWriter::create(dir, 4242, 62, 0).unwrap();
        writer.code_load(10, 0x7f00_0000, "early_fn", &[0x90; 16]).unwrap();
        writer.code_load(20, 0x7f00_4000, "kept_fn", &[0x90; 32]).unwrap();
        // Shadows early_fn's range inside the window.
        writer.code_load(30, 0x7f00_0008, "recompiled_fn", &[0xcc; 16]).unwrap();
        writer.code_load(99, 0x7f00_8000, "too_late_fn", &[0x90; 8]).unwrap();
        writer.code_close(100).unwrap();
        writer.path().to_owned()
    }

    #[test]
    fn conversion_filters_by_time_and_shadows_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dump = write_dump(dir.path());

        let jo = convert_dumpfile(&dump, out.path(), 5, 50).unwrap();
        assert_eq!(jo, out.path().join("4242.jo"));

        let bytes = std::fs::read(&jo).unwrap();
        let obj = object::File::parse(&bytes[..]).unwrap();
        let names: Vec<String> = obj
            .symbols()
            .filter(|s| s.name().map(|n| !n.is_empty()).unwrap_or(false))
            .map(|s| s.name().unwrap().to_string())
            .collect();
        assert!(names.contains(&"kept_fn".to_string()));
        assert!(names.contains(&"recompiled_fn".to_string()));
        assert!(!names.contains(&"early_fn".to_string()), "shadowed by recompile");
        assert!(!names.contains(&"too_late_fn".to_string()), "outside the window");

        let kept = obj.symbols().find(|s| s.name() == Ok("kept_fn")).unwrap();
        assert_eq!(kept.address(), 0x7f00_4000);
        assert_eq!(kept.size(), 32);
    }

    #[test]
    fn converter_waits_out_a_held_lock() {
        use fs4::fs_std::FileExt;

        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let dump = write_dump(dir.path());

        let holder = File::open(&dump).unwrap();
        holder.lock_exclusive().unwrap();

        let dump_clone = dump.clone();
        let out_dir = out.path().to_owned();
        let worker = std::thread::spawn(move || convert_dumpfile(&dump_clone, &out_dir, 0, 1000));

        // Hold the lock well past the converter's retry budget, then let
        // it through on a fresh attempt.
        std::thread::sleep(std::time::Duration::from_millis(50));
        FileExt::unlock(&holder).unwrap();

        match worker.join().unwrap() {
            Ok(path) => assert!(path.is_file()),
            // The bounded retry may legitimately give up first.
            Err(JitConvError::DumpLockTimeout { .. }) => {
                let retried = convert_dumpfile(&dump, out.path(), 0, 1000).unwrap();
                assert!(retried.is_file());
            }
            Err(other) => panic!("{other}"),
        }
    }

    #[test]
    fn convert_all_walks_the_dump_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_dump(dir.path());
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let converted = convert_all(dir.path(), out.path(), 0, 1000, false).unwrap();
        assert_eq!(converted, 1);
        assert!(out.path().join("4242.jo").is_file());
    }
}
