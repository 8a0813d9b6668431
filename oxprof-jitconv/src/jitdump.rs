//! The JIT dump file format: what the in-process agent writes and the
//! converter reads.
//!
//! A dump file is a fixed header followed by variable-length records,
//! each 8-byte aligned with explicit zero padding. Every record write is
//! framed by an exclusive advisory lock on the file so a concurrently
//! running converter never observes a partial record.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::JitConvError;

pub const JITDUMP_MAGIC: [u8; 4] = *b"OxJD";
pub const JITDUMP_VERSION: u32 = 2;

pub const JIT_CODE_LOAD: u32 = 0;
pub const JIT_CODE_UNLOAD: u32 = 1;
pub const JIT_CODE_CLOSE: u32 = 2;
pub const JIT_CODE_DEBUG_INFO: u32 = 3;

/// Bounded lock retry: 100 microseconds, ten attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_micros(100);
const LOCK_RETRY_ATTEMPTS: u32 = 10;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct JitDumpHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Size of this header in bytes.
    pub total_size: u32,
    /// ELF machine tag of the generated code (EM_*).
    pub elf_arch: u32,
    pub pad: u32,
    pub pid: u32,
    pub timestamp: u64,
}

pub const JITDUMP_HEADER_SIZE: usize = 32;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct JitRecordHeader {
    pub id: u32,
    /// Total record size including this header and padding.
    pub total_size: u32,
    pub timestamp: u64,
}

pub const JIT_RECORD_HEADER_SIZE: usize = 16;

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct CodeLoadPayload {
    pub vma: u64,
    pub code_addr: u64,
    pub code_size: u64,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct CodeUnloadPayload {
    pub vma: u64,
}

fn padded(len: usize) -> usize {
    (len + 7) & !7
}

/// Acquire the dump-file lock with the bounded retry both sides of the
/// contract use.
pub fn lock_with_retry(file: &File, path: &Path) -> Result<(), JitConvError> {
    for _ in 0..LOCK_RETRY_ATTEMPTS {
        match file.try_lock_exclusive() {
            Ok(true) => return Ok(()),
            Ok(false) => {
                std::thread::sleep(LOCK_RETRY_DELAY);
            }
            Err(e) => return Err(JitConvError::Io { path: path.to_owned(), source: e }),
        }
    }
    Err(JitConvError::DumpLockTimeout { path: path.to_owned() })
}

fn unlock(file: &File) {
    let _ = FileExt::unlock(file);
}

/// The producer side: what the agent library loaded into a managed
/// runtime does. Each record write holds the file lock for exactly the
/// duration of that record.
pub struct JitDumpWriter {
    file: File,
    path: PathBuf,
}

impl JitDumpWriter {
    pub fn create(dir: &Path, pid: u32, elf_arch: u32, timestamp: u64) -> Result<Self, JitConvError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| JitConvError::Io { path: dir.to_owned(), source: e })?;
        let path = dir.join(format!("{pid}.dump"));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| JitConvError::Io { path: path.clone(), source: e })?;
        let mut writer = JitDumpWriter { file, path };
        let header = JitDumpHeader {
            magic: JITDUMP_MAGIC,
            version: JITDUMP_VERSION,
            total_size: JITDUMP_HEADER_SIZE as u32,
            elf_arch,
            pad: 0,
            pid,
            timestamp,
        };
        writer.write_locked(header.as_bytes())?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_locked(&mut self, bytes: &[u8]) -> Result<(), JitConvError> {
        lock_with_retry(&self.file, &self.path)?;
        let result = self
            .file
            .write_all(bytes)
            .and_then(|()| self.file.flush())
            .map_err(|e| JitConvError::Io { path: self.path.clone(), source: e });
        unlock(&self.file);
        result
    }

    pub fn code_load(
        &mut self,
        timestamp: u64,
        vma: u64,
        name: &str,
        code: &[u8],
    ) -> Result<(), JitConvError> {
        let body_len = JIT_RECORD_HEADER_SIZE
            + std::mem::size_of::<CodeLoadPayload>()
            + name.len()
            + 1
            + code.len();
        let total = padded(body_len);
        let header = JitRecordHeader { id: JIT_CODE_LOAD, total_size: total as u32, timestamp };
        let payload =
            CodeLoadPayload { vma, code_addr: vma, code_size: code.len() as u64 };

        let mut record = Vec::with_capacity(total);
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(payload.as_bytes());
        record.extend_from_slice(name.as_bytes());
        record.push(0);
        record.extend_from_slice(code);
        record.resize(total, 0);
        self.write_locked(&record)
    }

    pub fn code_unload(&mut self, timestamp: u64, vma: u64) -> Result<(), JitConvError> {
        let total = JIT_RECORD_HEADER_SIZE + std::mem::size_of::<CodeUnloadPayload>();
        let header = JitRecordHeader { id: JIT_CODE_UNLOAD, total_size: total as u32, timestamp };
        let payload = CodeUnloadPayload { vma };
        let mut record = Vec::with_capacity(total);
        record.extend_from_slice(header.as_bytes());
        record.extend_from_slice(payload.as_bytes());
        self.write_locked(&record)
    }

    pub fn code_close(&mut self, timestamp: u64) -> Result<(), JitConvError> {
        let header = JitRecordHeader {
            id: JIT_CODE_CLOSE,
            total_size: JIT_RECORD_HEADER_SIZE as u32,
            timestamp,
        };
        self.write_locked(header.as_bytes())
    }
}

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitRecord {
    CodeLoad { timestamp: u64, vma: u64, name: String, code: Vec<u8> },
    CodeUnload { timestamp: u64, vma: u64 },
    CodeClose { timestamp: u64 },
    /// Parsed for alignment, otherwise ignored by the converter.
    DebugInfo { timestamp: u64 },
}

/// Parse a whole dump image (the converter works on a private copy, so
/// in-memory parsing is fine).
pub struct JitDump {
    pub header: JitDumpHeader,
    pub records: Vec<JitRecord>,
}

impl JitDump {
    pub fn parse(path: &Path, data: &[u8]) -> Result<JitDump, JitConvError> {
        if data.len() < JITDUMP_HEADER_SIZE {
            return Err(JitConvError::BadFormat {
                path: path.to_owned(),
                reason: "file shorter than header",
            });
        }
        let header = JitDumpHeader::read_from_bytes(&data[..JITDUMP_HEADER_SIZE]).unwrap();
        if header.magic != JITDUMP_MAGIC {
            return Err(JitConvError::BadFormat { path: path.to_owned(), reason: "bad magic" });
        }
        if header.version != JITDUMP_VERSION {
            return Err(JitConvError::BadFormat {
                path: path.to_owned(),
                reason: "unsupported version",
            });
        }

        let mut records = Vec::new();
        let mut rest = &data[header.total_size as usize..];
        while !rest.is_empty() {
            if rest.len() < JIT_RECORD_HEADER_SIZE {
                return Err(JitConvError::BadFormat {
                    path: path.to_owned(),
                    reason: "truncated record header",
                });
            }
            let rec = JitRecordHeader::read_from_bytes(&rest[..JIT_RECORD_HEADER_SIZE]).unwrap();
            let total = rec.total_size as usize;
            if total < JIT_RECORD_HEADER_SIZE || total % 8 != 0 || rest.len() < total {
                return Err(JitConvError::BadFormat {
                    path: path.to_owned(),
                    reason: "bad record size",
                });
            }
            let body = &rest[JIT_RECORD_HEADER_SIZE..total];
            rest = &rest[total..];

            match rec.id {
                JIT_CODE_LOAD => {
                    let payload_size = std::mem::size_of::<CodeLoadPayload>();
                    if body.len() < payload_size {
                        return Err(JitConvError::BadFormat {
                            path: path.to_owned(),
                            reason: "short code_load",
                        });
                    }
                    let payload =
                        CodeLoadPayload::read_from_bytes(&body[..payload_size]).unwrap();
                    let tail = &body[payload_size..];
                    let name_end = memchr::memchr(0, tail).ok_or_else(|| {
                        JitConvError::BadFormat {
                            path: path.to_owned(),
                            reason: "unterminated symbol name",
                        }
                    })?;
                    let name = String::from_utf8_lossy(&tail[..name_end]).into_owned();
                    let code_start = name_end + 1;
                    let code_end = code_start + payload.code_size as usize;
                    if code_end > tail.len() {
                        return Err(JitConvError::BadFormat {
                            path: path.to_owned(),
                            reason: "short code bytes",
                        });
                    }
                    records.push(JitRecord::CodeLoad {
                        timestamp: rec.timestamp,
                        vma: payload.vma,
                        name,
                        code: tail[code_start..code_end].to_vec(),
                    });
                }
                JIT_CODE_UNLOAD => {
                    let payload_size = std::mem::size_of::<CodeUnloadPayload>();
                    if body.len() < payload_size {
                        return Err(JitConvError::BadFormat {
                            path: path.to_owned(),
                            reason: "short code_unload",
                        });
                    }
                    let payload =
                        CodeUnloadPayload::read_from_bytes(&body[..payload_size]).unwrap();
                    records
                        .push(JitRecord::CodeUnload { timestamp: rec.timestamp, vma: payload.vma });
                }
                JIT_CODE_CLOSE => {
                    records.push(JitRecord::CodeClose { timestamp: rec.timestamp });
                }
                JIT_CODE_DEBUG_INFO => {
                    records.push(JitRecord::DebugInfo { timestamp: rec.timestamp });
                }
                _ => {
                    // Unknown record types are skippable by design: the
                    // total_size field frames them.
                }
            }
        }
        Ok(JitDump { header, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_record_sizes_are_pinned() {
        assert_eq!(std::mem::size_of::<JitDumpHeader>(), JITDUMP_HEADER_SIZE);
        assert_eq!(std::mem::size_of::<JitRecordHeader>(), JIT_RECORD_HEADER_SIZE);
    }

    #[test]
    fn write_then_parse_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JitDumpWriter::create(dir.path(), 1234, 62, 10).unwrap();
        writer.code_load(20, 0x7f00_0000, "jit_fn_a", &[0x90; 31]).unwrap();
        writer.code_unload(30, 0x7f00_0000).unwrap();
        writer.code_load(40, 0x7f00_1000, "jit_fn_b", &[0xcc; 8]).unwrap();
        writer.code_close(50).unwrap();

        let data = std::fs::read(writer.path()).unwrap();
        assert_eq!(data.len() % 8, 0, "all records are 8-byte aligned");

        let dump = JitDump::parse(writer.path(), &data).unwrap();
        assert_eq!(dump.header.pid, 1234);
        assert_eq!(dump.header.elf_arch, 62);
        assert_eq!(dump.records.len(), 4);
        match &dump.records[0] {
            JitRecord::CodeLoad { timestamp, vma, name, code } => {
                assert_eq!(*timestamp, 20);
                assert_eq!(*vma, 0x7f00_0000);
                assert_eq!(name, "jit_fn_a");
                assert_eq!(code.len(), 31);
            }
            other => panic!("{other:?}"),
        }
        assert_eq!(dump.records[1], JitRecord::CodeUnload { timestamp: 30, vma: 0x7f00_0000 });
        assert_eq!(dump.records[3], JitRecord::CodeClose { timestamp: 50 });
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dump");
        assert!(JitDump::parse(&path, b"nope").is_err());
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            JitDumpHeader {
                magic: *b"WRNG",
                version: JITDUMP_VERSION,
                total_size: JITDUMP_HEADER_SIZE as u32,
                elf_arch: 62,
                pad: 0,
                pid: 1,
                timestamp: 0,
            }
            .as_bytes(),
        );
        assert!(JitDump::parse(&path, &bytes).is_err());
    }
}
