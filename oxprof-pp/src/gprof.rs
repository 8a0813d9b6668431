//! `gmon.out` emission: a flat-profile histogram gprof can read.

use std::io::{self, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::binary::BinaryImage;
use crate::container::{ProfileContainer, SymbolEntry};

const GMON_VERSION: u32 = 1;
const GMON_TAG_TIME_HIST: u8 = 0;

fn write_vma(out: &mut impl Write, bits_per_address: u32, vma: u64) -> io::Result<()> {
    match bits_per_address {
        32 => out.write_u32::<LittleEndian>(vma as u32),
        _ => out.write_u64::<LittleEndian>(vma),
    }
}

fn vma_range(samples: &[(u64, u32)]) -> (u64, u64) {
    let mut min = u64::MAX;
    let mut max = 0;
    for &(vma, _) in samples {
        if vma < min {
            min = vma;
        }
        if vma > max {
            max = vma;
        }
    }
    if min == u64::MAX {
        min = 0;
    }
    // A half-open range [min, max).
    if max != 0 {
        max += 1;
    }
    (min, max)
}

fn aligned_samples(samples: &[(u64, u32)], gap: u64) -> bool {
    samples.iter().all(|&(vma, _)| vma % gap == 0)
}

/// Emit a gmon.out histogram over one image's selected symbols. The bin
/// width is 8 bytes when every sampled address is 4-aligned (fixed-size
/// instruction sets), 2 bytes otherwise; preserved verbatim for
/// bit-exact output.
pub fn output_gprof(
    out: &mut impl Write,
    container: &ProfileContainer,
    symbols: &[&SymbolEntry],
    image: &BinaryImage,
) -> io::Result<()> {
    let mut samples: Vec<(u64, u32)> = Vec::new();
    for symbol in symbols {
        for (vma, _loc, counts) in container.details_for(symbol) {
            samples.push((vma, counts.get(0)));
        }
    }

    let multiplier: u64 = if aligned_samples(&samples, 4) { 8 } else { 2 };
    let (mut low_pc, mut high_pc) = vma_range(&samples);

    // Round low down and high up so bin numbers stay in range.
    low_pc = (low_pc / multiplier) * multiplier;
    high_pc = high_pc.div_ceil(multiplier) * multiplier;

    let histsize = ((high_pc - low_pc) / multiplier) as usize;
    let mut hist = vec![0u16; histsize];
    for (vma, count) in samples {
        let pos = ((vma - low_pc) / multiplier) as usize;
        if pos >= histsize {
            continue;
        }
        let capped = count.min(u16::MAX as u32) as u16;
        hist[pos] = hist[pos].saturating_add(capped);
    }

    // Header: cookie, version, three spare words.
    out.write_all(b"gmon")?;
    out.write_u32::<LittleEndian>(GMON_VERSION)?;
    out.write_all(&[0u8; 12])?;

    out.write_u8(GMON_TAG_TIME_HIST)?;
    write_vma(out, image.bits_per_address(), low_pc)?;
    write_vma(out, image.bits_per_address(), high_pc)?;
    out.write_u32::<LittleEndian>(histsize as u32)?;
    // Profiling rate.
    out.write_u32::<LittleEndian>(1)?;
    out.write_all(b"samples\0\0\0\0\0\0\0\0")?;
    // Dimension abbreviation.
    out.write_u8(b'1')?;

    for bin in hist {
        out.write_u16::<LittleEndian>(bin)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_heuristic_picks_the_multiplier() {
        assert!(aligned_samples(&[(0x1000, 1), (0x1004, 1)], 4));
        assert!(!aligned_samples(&[(0x1000, 1), (0x1002, 1)], 4));
        assert!(aligned_samples(&[], 4), "no samples counts as aligned");
    }

    #[test]
    fn vma_range_is_half_open() {
        assert_eq!(vma_range(&[(0x100, 1), (0x1f0, 2)]), (0x100, 0x1f1));
        assert_eq!(vma_range(&[]), (0, 0));
    }
}
