//! Accumulated samples of one image across the sample files of one
//! profile class.

use std::collections::BTreeMap;
use std::path::Path;

use log::warn;

use oxprof_db::{Odb, OdbMode, SampleFileHeader};

use crate::error::PpError;

/// A sorted `offset -> count` map merged from any number of compatible
/// sample files. `start_offset` shifts between the on-disk key domain and
/// the display VMA domain for kernel images.
#[derive(Default)]
pub struct ProfileData {
    ordered_samples: BTreeMap<u64, u32>,
    header: Option<SampleFileHeader>,
    start_offset: u64,
}

impl ProfileData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total sample count of a single file, without building a profile.
    pub fn sample_count(path: &Path) -> Result<u64, PpError> {
        let odb = Odb::open(path, OdbMode::ReadOnly)?;
        Ok(odb.iter().map(|(_, value)| value as u64).sum())
    }

    pub fn header(&self) -> Option<&SampleFileHeader> {
        self.header.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_samples.is_empty()
    }

    /// Merge one sample file in. All files added to one profile must
    /// agree on (event, unit mask, reset count, cpu type); `offset` is
    /// the owning image's start offset, applied for kernel images only.
    pub fn add_sample_file(&mut self, path: &Path, offset: u64) -> Result<(), PpError> {
        let odb = Odb::open(path, OdbMode::ReadOnly)?;
        let header = odb.header();

        if let Some(first) = &self.header {
            if !first.compatible_with(&header) {
                return Err(PpError::HeaderMismatch { path: path.to_owned() });
            }
        }

        for (key, value) in odb.iter() {
            let slot = self.ordered_samples.entry(key).or_insert(0);
            *slot = slot.saturating_add(value);
        }

        let is_kernel = header.is_kernel != 0;
        self.header = Some(header);
        if is_kernel {
            self.start_offset = offset;
        }
        Ok(())
    }

    /// Warn when the image changed since the samples were taken; the
    /// report still runs, the attribution is just suspect.
    pub fn check_mtime(&self, image_path: &str, image_mtime: i64) {
        if let Some(header) = &self.header {
            if header.image_mtime != 0 && image_mtime != 0 && header.image_mtime != image_mtime {
                warn!("{image_path} was modified after the profile was taken");
            }
        }
    }

    /// Iterate samples whose display address lies in `[start, end)`,
    /// yielding `(address, count)` with `start_offset` added back.
    pub fn samples_range(
        &self,
        start: u64,
        end: u64,
    ) -> Result<impl Iterator<Item = (u64, u32)> + '_, PpError> {
        // An image without symbols queries [0, filesize); subtracting the
        // offset from a zero start would underflow into an empty range.
        let key_start = if start > 0 { start.wrapping_sub(self.start_offset) } else { 0 };
        let key_end = end.wrapping_sub(self.start_offset);
        if key_start > key_end {
            return Err(PpError::BadSampleRange);
        }
        let offset = self.start_offset;
        Ok(self
            .ordered_samples
            .range(key_start..key_end)
            .map(move |(&key, &value)| (key + offset, value)))
    }

    /// All samples, in key order, in the display address domain.
    pub fn samples(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        let offset = self.start_offset;
        self.ordered_samples.iter().map(move |(&key, &value)| (key + offset, value))
    }

    pub fn total(&self) -> u64 {
        self.ordered_samples.values().map(|&v| v as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxprof_db::OdbMode;

    fn write_odb(path: &Path, header: &SampleFileHeader, entries: &[(u64, u32)]) {
        let mut odb = Odb::open(path, OdbMode::ReadWrite).unwrap();
        odb.set_header(header).unwrap();
        for &(key, value) in entries {
            odb.insert(key, value).unwrap();
        }
    }

    fn header(event: u32) -> SampleFileHeader {
        SampleFileHeader { event_id: event, created_at: 1, ..Default::default() }
    }

    #[test]
    fn files_merge_by_adding_counts() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_odb(&a, &header(60), &[(0x100, 3), (0x200, 1)]);
        write_odb(&b, &header(60), &[(0x100, 2), (0x300, 5)]);

        let mut profile = ProfileData::new();
        profile.add_sample_file(&a, 0).unwrap();
        profile.add_sample_file(&b, 0).unwrap();

        let samples: Vec<_> = profile.samples().collect();
        assert_eq!(samples, vec![(0x100, 5), (0x200, 1), (0x300, 5)]);
        assert_eq!(profile.total(), 11);
    }

    #[test]
    fn incompatible_headers_refuse_to_merge() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        write_odb(&a, &header(60), &[(0x100, 1)]);
        write_odb(&b, &header(61), &[(0x100, 1)]);

        let mut profile = ProfileData::new();
        profile.add_sample_file(&a, 0).unwrap();
        match profile.add_sample_file(&b, 0) {
            Err(PpError::HeaderMismatch { .. }) => {}
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn kernel_offset_shifts_the_address_domain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k");
        let mut h = header(60);
        h.is_kernel = 1;
        write_odb(&path, &h, &[(0x420, 2)]);

        let mut profile = ProfileData::new();
        profile.add_sample_file(&path, 0xc010_0000).unwrap();

        let samples: Vec<_> = profile.samples().collect();
        assert_eq!(samples, vec![(0xc010_0420, 2)]);

        let in_range: Vec<_> =
            profile.samples_range(0xc010_0000, 0xc010_1000).unwrap().collect();
        assert_eq!(in_range, vec![(0xc010_0420, 2)]);

        // A zero start with a positive offset must not underflow.
        let all: Vec<_> = profile.samples_range(0, 0xffff_ffff_ffff_ffff).unwrap().collect();
        assert_eq!(all.len(), 1);
    }
}
