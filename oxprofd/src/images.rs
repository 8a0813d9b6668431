use std::time::UNIX_EPOCH;

use rustc_hash::FxHashMap;

/// Index into the image arena. Images are never removed during a session,
/// so ids stay valid for the daemon's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub u32);

#[derive(Debug)]
pub struct Image {
    pub path: String,
    /// Owning application path, when samples are separated per app.
    pub app_name: Option<String>,
    pub mtime: i64,
    pub is_kernel: bool,
}

/// Deduplicated set of images. Identity is the kernel-provided cookie
/// when one exists, else the (path, app-owner) pair. Two notifications
/// for the same identity must yield the same instance; a duplicate would
/// open the same sample database twice and corrupt its chains.
#[derive(Default)]
pub struct ImageRegistry {
    images: Vec<Image>,
    by_cookie: FxHashMap<u64, ImageId>,
    by_name: FxHashMap<(String, Option<String>), ImageId>,
}

fn image_mtime(path: &str) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ImageId) -> &Image {
        &self.images[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn find_or_create(&mut self, path: &str, app_name: Option<&str>, is_kernel: bool) -> ImageId {
        let key = (path.to_string(), app_name.map(str::to_string));
        if let Some(&id) = self.by_name.get(&key) {
            return id;
        }
        let id = ImageId(self.images.len() as u32);
        self.images.push(Image {
            path: path.to_string(),
            app_name: app_name.map(str::to_string),
            mtime: image_mtime(path),
            is_kernel,
        });
        self.by_name.insert(key, id);
        id
    }

    /// O(1) lookup by kernel cookie.
    pub fn find_by_cookie(&self, cookie: u64) -> Option<ImageId> {
        self.by_cookie.get(&cookie).copied()
    }

    /// Associate a cookie with an image. Later notifications may carry
    /// only the cookie.
    pub fn bind_cookie(&mut self, cookie: u64, id: ImageId) {
        self.by_cookie.insert(cookie, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_identity_resolves_to_same_image() {
        let mut registry = ImageRegistry::new();
        let a = registry.find_or_create("/bin/A", None, false);
        let b = registry.find_or_create("/bin/A", None, false);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn app_owner_is_part_of_identity() {
        let mut registry = ImageRegistry::new();
        let plain = registry.find_or_create("/lib/libc.so", None, false);
        let owned = registry.find_or_create("/lib/libc.so", Some("/bin/A"), false);
        assert_ne!(plain, owned);
    }

    #[test]
    fn cookies_bind_to_images() {
        let mut registry = ImageRegistry::new();
        let id = registry.find_or_create("/bin/A", None, false);
        registry.bind_cookie(0xdead, id);
        assert_eq!(registry.find_by_cookie(0xdead), Some(id));
        assert_eq!(registry.find_by_cookie(0xbeef), None);
    }
}
