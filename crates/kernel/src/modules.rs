//! Programs handed to the kernel as boot modules.

use alloc::{string::String, vec::Vec};

use pmm::{PAGE_SIZE, PhysicalAddress};

/// A flat program image resident in physical memory.
///
/// The image is copied verbatim to the user image base and entered at its
/// first byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramImage {
    name: String,
    start: PhysicalAddress,
    size: u32,
}

impl ProgramImage {
    pub fn new(name: impl Into<String>, start: PhysicalAddress, size: u32) -> Self {
        Self {
            name: name.into(),
            start,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> PhysicalAddress {
        self.start
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the number of pages the image occupies once loaded.
    pub fn pages(&self) -> usize {
        (self.size as usize).div_ceil(PAGE_SIZE)
    }
}

/// The programs `exec` can load, looked up by path.
#[derive(Debug, Default)]
pub struct ProgramRegistry {
    images: Vec<ProgramImage>,
}

impl ProgramRegistry {
    pub const fn new() -> Self {
        Self { images: Vec::new() }
    }

    /// Adds `image`, replacing any image already registered under its name.
    pub fn register(&mut self, image: ProgramImage) {
        if let Some(existing) = self.images.iter_mut().find(|i| i.name == image.name) {
            log::warn!("program {} registered twice; keeping the later image", image.name);
            *existing = image;
        } else {
            log::debug!(
                "program {} at {} ({} bytes)",
                image.name,
                image.start,
                image.size
            );
            self.images.push(image);
        }
    }

    pub fn get(&self, path: &str) -> Option<&ProgramImage> {
        self.images.iter().find(|image| image.name == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProgramImage> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_path() {
        let mut registry = ProgramRegistry::new();
        registry.register(ProgramImage::new("/bin/init", PhysicalAddress::new(0x20_0000), 100));
        registry.register(ProgramImage::new("/bin/spin", PhysicalAddress::new(0x20_1000), 4097));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("/bin/spin").map(ProgramImage::pages), Some(2));
        assert_eq!(registry.get("/bin/init").map(ProgramImage::pages), Some(1));
        assert!(registry.get("/bin/missing").is_none());
        assert!(registry.get("/bin/init ").is_none());
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = ProgramRegistry::new();
        registry.register(ProgramImage::new("init", PhysicalAddress::new(0x1000), 1));
        registry.register(ProgramImage::new("init", PhysicalAddress::new(0x2000), 2));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("init").map(ProgramImage::start), Some(PhysicalAddress::new(0x2000)));
    }
}
