use bitflags::bitflags;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// File magic at offset 0 of every sample database.
pub const ODB_MAGIC: [u8; 4] = *b"OPRF";

/// Bumped whenever the on-disk layout changes. Files with a different
/// version are never read or merged.
pub const ODB_VERSION: u32 = 3;

bitflags! {
    /// Which axes the owning session separated samples on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SeparationFlags: u32 {
        const LIB    = 1 << 0;
        const KERNEL = 1 << 1;
        const THREAD = 1 << 2;
        const CPU    = 1 << 3;
    }
}

/// Persisted header of a sample database, 128 bytes at file offset 0.
///
/// The layout is stable: field order is chosen so that `repr(C)` produces
/// no implicit padding, and the reserved tail absorbs future additions.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug, PartialEq)]
pub struct SampleFileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// Numeric id of the hardware event this file counts.
    pub event_id: u32,
    pub unit_mask: u32,
    /// Counter reset value ("count" in sample-file names).
    pub reset_count: u32,
    pub cpu_type: u32,
    pub is_kernel: u32,
    pub is_cg_to_kernel: u32,
    /// `SeparationFlags` bits of the recording session.
    pub separation: u32,
    pub pad: u32,
    pub cpu_speed_mhz: f64,
    /// mtime of the image this file holds samples for.
    pub image_mtime: i64,
    pub created_at: i64,
    pub reserved: [u32; 16],
}

impl Default for SampleFileHeader {
    fn default() -> Self {
        SampleFileHeader {
            magic: ODB_MAGIC,
            version: ODB_VERSION,
            event_id: 0,
            unit_mask: 0,
            reset_count: 0,
            cpu_type: 0,
            is_kernel: 0,
            is_cg_to_kernel: 0,
            separation: 0,
            pad: 0,
            cpu_speed_mhz: 0.0,
            image_mtime: 0,
            created_at: 0,
            reserved: [0; 16],
        }
    }
}

impl SampleFileHeader {
    pub const SIZE: usize = 128;

    pub fn separation_flags(&self) -> SeparationFlags {
        SeparationFlags::from_bits_truncate(self.separation)
    }

    /// True if two sample files may be merged: same format version and the
    /// same (event, unit mask, reset count, cpu type).
    pub fn compatible_with(&self, other: &SampleFileHeader) -> bool {
        self.version == other.version
            && self.event_id == other.event_id
            && self.unit_mask == other.unit_mask
            && self.reset_count == other.reset_count
            && self.cpu_type == other.cpu_type
    }

    /// True if a file written with `self` belongs to a session configured
    /// like `other`. Stricter than [`compatible_with`]: separation flags
    /// participate, so changing the separation setup rotates the session.
    ///
    /// [`compatible_with`]: SampleFileHeader::compatible_with
    pub fn same_session_signature(&self, other: &SampleFileHeader) -> bool {
        self.compatible_with(other) && self.separation == other.separation
    }
}
