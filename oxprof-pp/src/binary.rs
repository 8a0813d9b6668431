//! Reading images: symbol tables, text layout and line numbers. This is
//! the pipeline's only view of a binary; everything else works on the
//! extracted tables.

use std::path::{Path, PathBuf};

use log::warn;
use object::{Object, ObjectSection, ObjectSymbol, SectionKind};
use rustc_hash::FxHashSet;

use crate::error::PpError;

/// One symbol extracted from an image, in VMA order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinarySymbol {
    pub name: String,
    pub vma: u64,
    pub size: u64,
    /// Where the symbol's first byte sits in the sample-key domain: the
    /// file position for user images, `vma - start_offset` for kernel
    /// images (whose sample keys are text-relative).
    pub key_start: u64,
}

/// An opened image: the mapped file plus the tables the containers need.
pub struct BinaryImage {
    path: PathBuf,
    data: memmap2::Mmap,
    symbols: Vec<BinarySymbol>,
    start_offset: u64,
    bits_per_address: u32,
    mtime: i64,
    has_debug_info: bool,
}

impl BinaryImage {
    /// Open and index an image. `is_kernel` selects the text-relative
    /// sample-key domain.
    pub fn open(path: &Path, is_kernel: bool) -> Result<BinaryImage, PpError> {
        let unreadable = |source: std::io::Error| {
            if source.kind() == std::io::ErrorKind::NotFound {
                PpError::ImageNotFound(path.display().to_string())
            } else {
                PpError::ImageUnreadable { path: path.to_owned(), source }
            }
        };
        let file = std::fs::File::open(path).map_err(unreadable)?;
        let metadata = file.metadata().map_err(unreadable)?;
        if metadata.len() == 0 {
            return Err(PpError::ImageFormatFailure {
                path: path.to_owned(),
                reason: "empty file".to_string(),
            });
        }
        let data = unsafe { memmap2::Mmap::map(&file) }.map_err(unreadable)?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let object = object::File::parse(&data[..]).map_err(|e| PpError::ImageFormatFailure {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;

        let bits_per_address = if object.is_64() { 64 } else { 32 };

        // The text start: address of the first executable section.
        let text_start = object
            .sections()
            .filter(|s| s.kind() == SectionKind::Text)
            .map(|s| s.address())
            .min()
            .unwrap_or(0);
        let start_offset = if is_kernel { text_start } else { 0 };

        let mut symbols = Vec::new();
        for symbol in object.symbols() {
            if !symbol.is_definition() {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let Some(section_index) = symbol.section_index() else { continue };
            let Ok(section) = object.section_by_index(section_index) else { continue };
            if section.kind() != SectionKind::Text {
                continue;
            }
            let vma = symbol.address();
            let key_start = if is_kernel {
                vma.wrapping_sub(start_offset)
            } else {
                // File position of the symbol's first byte.
                let (file_offset, _) = section.file_range().unwrap_or((0, 0));
                vma - section.address() + file_offset
            };
            symbols.push(BinarySymbol { name: name.to_string(), vma, size: symbol.size(), key_start });
        }
        symbols.sort_by_key(|s| s.vma);

        // Symbol sizes are often zero in ELF; extend each symbol to the
        // next one, or to its section end for the last.
        for i in 0..symbols.len() {
            if symbols[i].size == 0 {
                let end = symbols
                    .get(i + 1)
                    .map(|next| next.vma)
                    .unwrap_or_else(|| {
                        object
                            .sections()
                            .filter(|s| s.kind() == SectionKind::Text)
                            .map(|s| s.address() + s.size())
                            .max()
                            .unwrap_or(symbols[i].vma)
                    });
                symbols[i].size = end.saturating_sub(symbols[i].vma);
            }
        }

        // A stripped image still reports against one synthetic symbol
        // spanning its whole text.
        if symbols.is_empty() {
            if let Some(text) = object.sections().find(|s| s.kind() == SectionKind::Text) {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "anonymous".to_string());
                let vma = text.address();
                let key_start = if is_kernel {
                    0
                } else {
                    text.file_range().map(|(off, _)| off).unwrap_or(0)
                };
                symbols.push(BinarySymbol { name, vma, size: text.size(), key_start });
            }
        }

        let has_debug_info = object
            .sections()
            .any(|s| s.name().map(|n| n == ".debug_info" || n == ".debug_line").unwrap_or(false));

        Ok(BinaryImage {
            path: path.to_owned(),
            data,
            symbols,
            start_offset,
            bits_per_address,
            mtime,
            has_debug_info,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbols(&self) -> &[BinarySymbol] {
        &self.symbols
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn bits_per_address(&self) -> u32 {
        self.bits_per_address
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn has_debug_info(&self) -> bool {
        self.has_debug_info
    }

    /// Find the symbol whose VMA range contains `vma`.
    pub fn find_by_vma(&self, vma: u64) -> Option<&BinarySymbol> {
        let idx = match self.symbols.binary_search_by_key(&vma, |s| s.vma) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let symbol = &self.symbols[idx];
        (vma < symbol.vma + symbol.size.max(1)).then_some(symbol)
    }

    /// Find the symbol containing a sample-key-domain offset.
    pub fn find_by_key(&self, key: u64) -> Option<&BinarySymbol> {
        self.symbols
            .iter()
            .find(|s| key >= s.key_start && key < s.key_start + s.size.max(1))
    }

    /// Build a line-number resolver over this image's DWARF data, if any.
    /// Debug sections are read in place, so the resolver borrows the
    /// image rather than copying its sections.
    pub fn line_resolver(&self) -> Option<LineResolver<'_>> {
        let object = object::File::parse(&self.data[..]).ok()?;
        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        fn section_data<'data>(
            object: &object::File<'data, &'data [u8]>,
            id: gimli::SectionId,
        ) -> &'data [u8] {
            object
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[])
        }
        let dwarf = gimli::Dwarf::load(|id| {
            Ok::<_, gimli::Error>(gimli::EndianSlice::new(section_data(&object, id), endian))
        })
        .ok()?;
        let context = addr2line::Context::from_dwarf(dwarf).ok()?;
        Some(LineResolver { context })
    }
}

type Slice<'a> = gimli::EndianSlice<'a, gimli::RunTimeEndian>;

pub struct LineResolver<'a> {
    context: addr2line::Context<Slice<'a>>,
}

impl LineResolver<'_> {
    /// Look up `(file, line)` for a VMA. `None` when there is no debug
    /// info covering it.
    pub fn lookup(&self, vma: u64) -> Option<(String, u32)> {
        let location = self.context.find_location(vma).ok()??;
        let file = location.file?;
        Some((file.to_string(), location.line.unwrap_or(0)))
    }
}

/// Remembers which images already produced a warning so each distinct
/// image complains once, then goes quiet.
#[derive(Default)]
pub struct ImageErrors {
    seen: FxHashSet<String>,
}

impl ImageErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report an image error, once per image name. Returns true when the
    /// warning was actually emitted.
    pub fn report(&mut self, image: &str, error: &PpError) -> bool {
        if !self.seen.insert(image.to_string()) {
            return false;
        }
        warn!("{error}; continuing with address-only output for {image}");
        true
    }
}
