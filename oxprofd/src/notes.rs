use log::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::decoder::SampleSink;
use crate::procs::Mapping;

pub const NOTE_FORK: u32 = 1;
pub const NOTE_MAP: u32 = 2;
pub const NOTE_EXEC: u32 = 3;
pub const NOTE_DROP_MODULES: u32 = 4;
pub const NOTE_EXIT: u32 = 5;

/// Fixed head of one notification record. `MAP` notes carry `path_len`
/// bytes of image path after the head, zero-padded to 8 bytes; all other
/// note types have `path_len == 0`.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct NoteHeader {
    pub code: u32,
    pub pid: u32,
    pub addr: u64,
    pub len: u64,
    pub offset: u64,
    /// Kernel file cookie for the mapped image, 0 when unavailable.
    pub cookie: u64,
    pub path_len: u32,
    pub pad: u32,
}

pub const NOTE_HEADER_SIZE: usize = 48;

fn padded(len: usize) -> usize {
    (len + 7) & !7
}

/// Serialize one note; the producer side of the contract, also used by
/// the tests and the bootstrap /proc scan.
pub fn encode_note(header: &mut NoteHeader, path: Option<&str>) -> Vec<u8> {
    let path = path.unwrap_or("");
    header.path_len = path.len() as u32;
    let mut out = Vec::with_capacity(NOTE_HEADER_SIZE + padded(path.len()));
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(path.as_bytes());
    out.resize(NOTE_HEADER_SIZE + padded(path.len()), 0);
    out
}

/// Apply a buffer of notification records to the process and image
/// tables. Notifications always precede the sample batch that follows
/// them, so mappings are in place before samples arrive.
pub fn process_notes(sink: &mut SampleSink, buffer: &[u8]) {
    let mut data = buffer;
    while data.len() >= NOTE_HEADER_SIZE {
        let header = NoteHeader::read_from_bytes(&data[..NOTE_HEADER_SIZE]).unwrap();
        let total = NOTE_HEADER_SIZE + padded(header.path_len as usize);
        if data.len() < total {
            warn!("truncated notification record");
            break;
        }
        let path_bytes = &data[NOTE_HEADER_SIZE..NOTE_HEADER_SIZE + header.path_len as usize];
        data = &data[total..];

        sink.stats.notifications += 1;
        match header.code {
            NOTE_FORK => {
                debug!("FORK: from {} to {}", header.pid, header.addr);
                sink.procs.handle_fork(header.pid, header.addr as u32);
            }
            NOTE_EXEC => {
                debug!("EXEC: pid {}", header.pid);
                sink.procs.handle_exec(header.pid);
            }
            NOTE_EXIT => {
                debug!("EXIT: pid {}", header.pid);
                sink.procs.handle_exit(header.pid);
            }
            NOTE_DROP_MODULES => {
                debug!("DROP_MODULES");
                sink.kernel.reread_modules(sink.images);
                sink.sfiles.clear_kernel();
            }
            NOTE_MAP => {
                let Ok(path) = std::str::from_utf8(path_bytes) else {
                    warn!("mapping notification with non-utf8 path");
                    continue;
                };
                if path.is_empty() {
                    continue;
                }
                let image = sink.images.find_or_create(path, None, false);
                if header.cookie != 0 {
                    sink.images.bind_cookie(header.cookie, image);
                }
                debug!(
                    "MAP: pid {} {:#x}-{:#x} off {:#x} {path}",
                    header.pid,
                    header.addr,
                    header.addr + header.len,
                    header.offset
                );
                sink.procs.handle_mmap(
                    header.pid,
                    Mapping {
                        image,
                        start: header.addr,
                        end: header.addr + header.len,
                        offset: header.offset,
                    },
                );
            }
            other => warn!("unknown notification code {other}"),
        }
    }
}
