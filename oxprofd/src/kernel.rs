use log::{debug, warn};

use crate::images::{ImageId, ImageRegistry};

/// A loaded kernel module's text range. `image` is `None` until samples
/// force resolution; a `negative` entry records a range known to have no
/// module so repeat misses stay O(1).
#[derive(Debug)]
pub struct KernelModule {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub image: Option<ImageId>,
    pub negative: bool,
}

/// Where a kernel-space PC landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelHit {
    /// Main kernel image; offset relative to the text start.
    Vmlinux { image: ImageId, offset: u64, start: u64, end: u64 },
    Module { image: ImageId, offset: u64, start: u64, end: u64 },
    Lost,
}

pub struct KernelRegistry {
    vmlinux_path: String,
    vmlinux_image: Option<ImageId>,
    pub kernel_start: u64,
    pub kernel_end: u64,
    no_vmlinux: bool,
    modules: Vec<KernelModule>,
    modules_path: String,
}

/// Parse `--kernel-range=start-end` (hex, no 0x prefix).
pub fn parse_kernel_range(arg: &str) -> Option<(u64, u64)> {
    let (start, end) = arg.split_once('-')?;
    let start = u64::from_str_radix(start.trim_start_matches("0x"), 16).ok()?;
    let end = u64::from_str_radix(end.trim_start_matches("0x"), 16).ok()?;
    if start == 0 || end == 0 || start >= end {
        return None;
    }
    Some((start, end))
}

/// Parse `/proc/modules`: `name size refcount deps state address` per
/// line, no embedded blanks. Returns (name, start, end) triples. Module
/// names are single path components, which is what routes their sample
/// files under the `{kern}` marker.
pub fn parse_proc_modules(text: &str) -> Vec<(String, u64, u64)> {
    let mut modules = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_ascii_whitespace();
        let (Some(name), Some(size)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(size) = size.parse::<u64>() else { continue };
        // deps and state sit between the size and the load address.
        let Some(addr) = fields.nth(3) else { continue };
        let Ok(start) = u64::from_str_radix(addr.trim_start_matches("0x"), 16) else {
            continue;
        };
        modules.push((name.to_string(), start, start + size));
    }
    modules
}

/// Legacy fallback: extract module text ranges from `/proc/ksyms` symbols
/// of the form `__insmod_<mod>_S.text_L<len>`, whose value is the text
/// start address.
pub fn parse_ksyms(text: &str) -> Vec<(String, u64, u64)> {
    let mut modules = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_ascii_whitespace();
        let (Some(addr), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some(rest) = name.strip_prefix("__insmod_") else { continue };
        let Some(section_at) = rest.find("_S.text_L") else { continue };
        let module = &rest[..section_at];
        let len = &rest[section_at + "_S.text_L".len()..];
        let Ok(len) = len.parse::<u64>() else { continue };
        let Ok(start) = u64::from_str_radix(addr, 16) else { continue };
        modules.push((module.to_string(), start, start + len));
    }
    modules
}

impl KernelRegistry {
    pub fn new(
        vmlinux: Option<&str>,
        kernel_range: (u64, u64),
        images: &mut ImageRegistry,
    ) -> Self {
        let no_vmlinux = vmlinux.is_none();
        let vmlinux_path = vmlinux.unwrap_or("/no-vmlinux").to_string();
        let vmlinux_image = Some(images.find_or_create(&vmlinux_path, None, true));
        KernelRegistry {
            vmlinux_path,
            vmlinux_image,
            kernel_start: kernel_range.0,
            kernel_end: kernel_range.1,
            no_vmlinux,
            modules: Vec::new(),
            modules_path: "/proc/modules".to_string(),
        }
    }

    #[cfg(test)]
    pub fn set_modules_path(&mut self, path: &str) {
        self.modules_path = path.to_string();
    }

    pub fn clear_modules(&mut self) {
        self.modules.clear();
    }

    /// True once any module range (including negative entries) is known.
    pub fn has_modules(&self) -> bool {
        !self.modules.is_empty()
    }

    /// Drop and re-read module information; called for the
    /// `module_loaded` control code and on a missed module sample.
    /// /proc/modules is preferred; old kernels only expose the module
    /// text ranges through /proc/ksyms.
    pub fn reread_modules(&mut self, images: &mut ImageRegistry) {
        self.clear_modules();
        if self.no_vmlinux {
            return;
        }
        let parsed = match std::fs::read_to_string(&self.modules_path) {
            Ok(text) => parse_proc_modules(&text),
            Err(err) => match std::fs::read_to_string("/proc/ksyms") {
                Ok(text) => parse_ksyms(&text),
                Err(_) => {
                    warn!(
                        "{} not readable, can't process module samples: {err}",
                        self.modules_path
                    );
                    return;
                }
            },
        };
        for (name, start, end) in parsed {
            let image = images.find_or_create(&name, None, true);
            debug!("module {name} start {start:#x} end {end:#x}");
            self.modules.push(KernelModule { name, start, end, image: Some(image), negative: false });
        }
    }

    #[cfg(test)]
    pub fn add_module(&mut self, name: &str, start: u64, end: u64, image: Option<ImageId>) {
        self.modules.push(KernelModule { name: name.to_string(), start, end, image, negative: false });
    }

    fn find_module(&self, pc: u64) -> Option<&KernelModule> {
        self.modules
            .iter()
            .find(|m| m.start != 0 && m.end != 0 && m.start <= pc && m.end > pc)
    }

    /// Resolve a kernel-space PC. `kernel_start <= pc < kernel_end` is the
    /// main image; a PC exactly at `kernel_end` is not. Outside that
    /// range the module table is consulted; one miss re-reads module info
    /// and retries, a second miss records a negative page entry.
    pub fn resolve(&mut self, pc: u64, images: &mut ImageRegistry) -> KernelHit {
        let vmlinux = self.vmlinux_image.unwrap();

        if self.no_vmlinux {
            // Without a kernel image everything lands in the placeholder
            // at its absolute address.
            return KernelHit::Vmlinux { image: vmlinux, offset: pc, start: 0, end: u64::MAX };
        }

        if pc >= self.kernel_start && pc < self.kernel_end {
            return KernelHit::Vmlinux {
                image: vmlinux,
                offset: pc - self.kernel_start,
                start: self.kernel_start,
                end: self.kernel_end,
            };
        }

        if let Some(module) = self.find_module(pc) {
            if module.negative {
                return KernelHit::Lost;
            }
            if let Some(image) = module.image {
                return KernelHit::Module { image, offset: pc - module.start, start: module.start, end: module.end };
            }
            return KernelHit::Lost;
        }

        self.reread_modules(images);

        if let Some(module) = self.find_module(pc) {
            if let Some(image) = module.image {
                return KernelHit::Module { image, offset: pc - module.start, start: module.start, end: module.end };
            }
            return KernelHit::Lost;
        }

        debug!("no module found for kernel PC {pc:#x}, caching negative entry");
        let page = pc & !0xfff;
        self.modules.push(KernelModule {
            name: String::new(),
            start: page,
            end: page + 0x1000,
            image: None,
            negative: true,
        });
        KernelHit::Lost
    }

    pub fn vmlinux_path(&self) -> &str {
        &self.vmlinux_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_modules_lines_parse() {
        let text = "ext4 16480 1 - Live 0xe091e000\n\
                    snd_hda 8192 2 snd,soundcore Live 0xffffffffc0a00000\n\
                    bogus line\n";
        let mods = parse_proc_modules(text);
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0], ("ext4".to_string(), 0xe091e000, 0xe091e000 + 16480));
        assert_eq!(mods[1].0, "snd_hda");
        assert_eq!(mods[1].1, 0xffffffffc0a00000);
    }

    #[test]
    fn ksyms_insmod_symbols_parse() {
        let text = "c88d9000 __insmod_ext4_S.text_L59248\n\
                    c0100000 printk\n\
                    c9000000 __insmod_nfs_S.data_L1024\n";
        let mods = parse_ksyms(text);
        assert_eq!(mods, vec![("ext4".to_string(), 0xc88d9000, 0xc88d9000 + 59248)]);
    }

    fn registry(images: &mut ImageRegistry) -> KernelRegistry {
        let mut k = KernelRegistry::new(Some("/boot/vmlinux"), (0xc0100000, 0xc0400000), images);
        k.set_modules_path("/nonexistent/modules");
        k
    }

    #[test]
    fn kernel_range_is_half_open() {
        let mut images = ImageRegistry::new();
        let mut k = registry(&mut images);
        match k.resolve(0xc0100000, &mut images) {
            KernelHit::Vmlinux { offset, .. } => assert_eq!(offset, 0),
            other => panic!("{other:?}"),
        }
        // One past the end is not the kernel; with no modules it is lost.
        assert_eq!(k.resolve(0xc0400000, &mut images), KernelHit::Lost);
    }

    #[test]
    fn module_hits_are_offset_from_module_start() {
        let mut images = ImageRegistry::new();
        let mut k = registry(&mut images);
        let ext4 = images.find_or_create("ext4", None, true);
        k.add_module("ext4", 0xe0000000, 0xe0010000, Some(ext4));
        match k.resolve(0xe0000420, &mut images) {
            KernelHit::Module { image, offset, .. } => {
                assert_eq!(image, ext4);
                assert_eq!(offset, 0x420);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn repeated_misses_hit_the_negative_cache() {
        let mut images = ImageRegistry::new();
        let mut k = registry(&mut images);
        assert_eq!(k.resolve(0xe0000400, &mut images), KernelHit::Lost);
        assert_eq!(k.modules.len(), 1);
        assert!(k.modules[0].negative);
        // Same page: no table growth, still lost.
        assert_eq!(k.resolve(0xe0000800, &mut images), KernelHit::Lost);
        assert_eq!(k.modules.len(), 1);
    }

    #[test]
    fn bad_kernel_ranges_are_rejected() {
        assert_eq!(parse_kernel_range("c0100000-c0400000"), Some((0xc0100000, 0xc0400000)));
        assert_eq!(parse_kernel_range("0xc0100000-0xc0400000"), Some((0xc0100000, 0xc0400000)));
        assert!(parse_kernel_range("0-c0400000").is_none());
        assert!(parse_kernel_range("c0400000").is_none());
        assert!(parse_kernel_range("c0400000-c0100000").is_none());
    }
}
