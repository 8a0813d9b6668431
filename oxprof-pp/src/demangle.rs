/// Attempt to demangle a symbol name, trying the schemes that occur in
/// Linux binaries.
pub fn demangle_any(name: &str) -> String {
    if let Ok(demangled_symbol) = rustc_demangle::try_demangle(name) {
        return format!("{demangled_symbol:#}");
    }

    if name.starts_with('_') {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled_string) = symbol.demangle_with_options(&options) {
                return demangled_string;
            }
        }
    }

    name.to_owned()
}

#[cfg(test)]
mod tests {
    use crate::demangle::demangle_any;

    #[test]
    fn cpp_demangling() {
        assert_eq!(
            demangle_any("_ZNK8KxVectorI16KxfArcFileRecordjEixEj"),
            "KxVector<KxfArcFileRecord, unsigned int>::operator[](unsigned int) const"
        )
    }

    #[test]
    fn rust_demangling() {
        assert_eq!(
            demangle_any("_RNvMsr_NtCs3ssYzQotkvD_3std4pathNtB5_7PathBuf3newCs15kBYyAo9fc_7mycrate"),
            "<std::path::PathBuf>::new"
        )
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(demangle_any("main"), "main");
        assert_eq!(demangle_any("do_sys_open"), "do_sys_open");
    }
}
