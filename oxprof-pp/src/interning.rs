//! Process-wide interning of the names a report juggles. Comparing and
//! hashing ids instead of strings keeps the containers cheap; ids are
//! stable for the lifetime of the store.

use rustc_hash::FxHashMap;

use crate::demangle::demangle_any;

#[derive(Default)]
struct NameStore {
    names: Vec<String>,
    index: FxHashMap<String, u32>,
}

impl NameStore {
    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    fn get(&self, id: u32) -> &str {
        &self.names[id as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageNameId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolNameId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileNameId(pub u32);

/// The three name domains of a report: images (and apps), symbols, and
/// source files. Symbol names also cache their demangled form, computed
/// on first display.
#[derive(Default)]
pub struct Names {
    images: NameStore,
    symbols: NameStore,
    demangled: Vec<Option<String>>,
    files: NameStore,
}

impl Names {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_image(&mut self, name: &str) -> ImageNameId {
        ImageNameId(self.images.intern(name))
    }

    pub fn image(&self, id: ImageNameId) -> &str {
        self.images.get(id.0)
    }

    /// The basename, which most report columns show.
    pub fn image_basename(&self, id: ImageNameId) -> &str {
        let name = self.image(id);
        name.rsplit('/').next().unwrap_or(name)
    }

    pub fn intern_symbol(&mut self, name: &str) -> SymbolNameId {
        let id = self.symbols.intern(name);
        if id as usize >= self.demangled.len() {
            self.demangled.resize(id as usize + 1, None);
        }
        SymbolNameId(id)
    }

    pub fn symbol(&self, id: SymbolNameId) -> &str {
        self.symbols.get(id.0)
    }

    pub fn symbol_demangled(&mut self, id: SymbolNameId) -> &str {
        if self.demangled[id.0 as usize].is_none() {
            let demangled = demangle_any(self.symbols.get(id.0));
            self.demangled[id.0 as usize] = Some(demangled);
        }
        self.demangled[id.0 as usize].as_deref().unwrap()
    }

    pub fn intern_file(&mut self, name: &str) -> FileNameId {
        FileNameId(self.files.intern(name))
    }

    pub fn file(&self, id: FileNameId) -> &str {
        self.files.get(id.0)
    }

    pub fn file_basename(&self, id: FileNameId) -> &str {
        let name = self.file(id);
        name.rsplit('/').next().unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut names = Names::new();
        let a = names.intern_image("/bin/A");
        let b = names.intern_image("/bin/A");
        let c = names.intern_image("/bin/B");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(names.image(a), "/bin/A");
        assert_eq!(names.image_basename(a), "A");
    }

    #[test]
    fn demangled_names_are_cached() {
        let mut names = Names::new();
        let id = names.intern_symbol("_ZN3foo3barEv");
        assert_eq!(names.symbol_demangled(id), "foo::bar()");
        assert_eq!(names.symbol(id), "_ZN3foo3barEv");
    }
}
