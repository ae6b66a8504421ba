//! The multiboot (version 1) handoff.
//!
//! The bootloader leaves an information structure in physical memory and its
//! address in EBX. Everything the kernel needs from it (the memory map, the
//! command line and the modules) is copied out through [`PhysicalMemory`]
//! before the frame allocator exists, so none of it has to stay mapped.

use alloc::{format, string::String, vec::Vec};
use core::fmt;

use bitflags::bitflags;
use pmm::{BootMemoryRegion, MemoryMap, PhysicalAddress, PhysicalMemory};

use crate::modules::ProgramImage;

/// The value a multiboot-compliant loader leaves in EAX.
pub const MAGIC: u32 = 0x2BAD_B002;

/// Everything below this address is left to the firmware.
const LOW_MEMORY_END: u32 = 0x0010_0000;

/// Bytes of the information structure the kernel reads.
const INFO_SIZE: u32 = 52;
const MODULE_ENTRY_SIZE: u32 = 16;
/// Longest string read out of boot memory.
const MAX_STRING: usize = 4096;

/// Type of memory map entries that describe usable RAM.
const REGION_AVAILABLE: u32 = 1;

mod offset {
    pub const FLAGS: u32 = 0;
    pub const MEM_LOWER: u32 = 4;
    pub const MEM_UPPER: u32 = 8;
    pub const CMDLINE: u32 = 16;
    pub const MODS_COUNT: u32 = 20;
    pub const MODS_ADDR: u32 = 24;
    pub const MMAP_LENGTH: u32 = 44;
    pub const MMAP_ADDR: u32 = 48;
}

bitflags! {
    /// Which fields of the information structure are valid.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InfoFlags: u32 {
        const MEMORY = 1 << 0;
        const COMMAND_LINE = 1 << 2;
        const MODULES = 1 << 3;
        const MEMORY_MAP = 1 << 6;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// EAX did not hold [`MAGIC`].
    BadMagic { found: u32 },
    /// The loader described no memory at all.
    NoMemoryMap,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::BadMagic { found } => {
                write!(f, "not loaded by a multiboot loader (magic {found:#010x})")
            }
            BootError::NoMemoryMap => f.write_str("the bootloader supplied no memory map"),
        }
    }
}

/// One entry of the loader's memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegion {
    pub base: u64,
    pub size: u64,
    pub kind: u32,
}

impl BootMemoryRegion for BootRegion {
    fn base(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_usable(&self) -> bool {
        self.kind == REGION_AVAILABLE
    }
}

/// A file the loader placed in memory next to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootModule {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    /// The module's command line, as given in the loader configuration.
    pub command_line: String,
}

impl BootModule {
    pub fn size(&self) -> u32 {
        self.end.as_u32().saturating_sub(self.start.as_u32())
    }

    /// The path the module is registered under: the first word of its
    /// command line.
    pub fn name(&self) -> Option<&str> {
        self.command_line.split_whitespace().next()
    }
}

/// What the kernel keeps of the multiboot information structure.
#[derive(Debug, Clone)]
pub struct BootInfo {
    address: PhysicalAddress,
    flags: InfoFlags,
    command_line: String,
    regions: Vec<BootRegion>,
    modules: Vec<BootModule>,
    module_table: Option<(PhysicalAddress, u32)>,
    region_table: Option<(PhysicalAddress, u32)>,
}

impl BootInfo {
    /// Reads the information structure at `info`.
    ///
    /// A loader that gives no memory map but does give the lower and upper
    /// memory sizes gets a map built from those.
    pub fn parse<M: PhysicalMemory>(
        memory: &mut M,
        magic: u32,
        info: PhysicalAddress,
    ) -> Result<Self, BootError> {
        if magic != MAGIC {
            return Err(BootError::BadMagic { found: magic });
        }

        let field = |memory: &mut M, at: u32| memory.read_u32(info + at);
        let flags = InfoFlags::from_bits_truncate(field(memory, offset::FLAGS));
        log::debug!("multiboot info at {info}, flags {flags:?}");

        let command_line = if flags.contains(InfoFlags::COMMAND_LINE) {
            let address = PhysicalAddress::new(field(memory, offset::CMDLINE));
            read_string(memory, address)
        } else {
            String::new()
        };

        let mut region_table = None;
        let regions = if flags.contains(InfoFlags::MEMORY_MAP) {
            let length = field(memory, offset::MMAP_LENGTH);
            let address = PhysicalAddress::new(field(memory, offset::MMAP_ADDR));
            region_table = Some((address, length));
            read_regions(memory, address, length)
        } else if flags.contains(InfoFlags::MEMORY) {
            let lower = field(memory, offset::MEM_LOWER) as u64 * 1024;
            let upper = field(memory, offset::MEM_UPPER) as u64 * 1024;
            log::warn!("no memory map; using {lower} bytes low and {upper} bytes high");
            Vec::from([
                BootRegion {
                    base: 0,
                    size: lower,
                    kind: REGION_AVAILABLE,
                },
                BootRegion {
                    base: LOW_MEMORY_END as u64,
                    size: upper,
                    kind: REGION_AVAILABLE,
                },
            ])
        } else {
            return Err(BootError::NoMemoryMap);
        };
        if regions.is_empty() {
            return Err(BootError::NoMemoryMap);
        }

        let mut module_table = None;
        let mut modules = Vec::new();
        if flags.contains(InfoFlags::MODULES) {
            let count = field(memory, offset::MODS_COUNT);
            let table = PhysicalAddress::new(field(memory, offset::MODS_ADDR));
            module_table = Some((table, count.saturating_mul(MODULE_ENTRY_SIZE)));
            for index in 0..count {
                let entry = table + index * MODULE_ENTRY_SIZE;
                let start = PhysicalAddress::new(memory.read_u32(entry));
                let end = PhysicalAddress::new(memory.read_u32(entry + 4));
                let string = memory.read_u32(entry + 8);
                let command_line = if string == 0 {
                    String::new()
                } else {
                    read_string(memory, PhysicalAddress::new(string))
                };
                modules.push(BootModule {
                    start,
                    end,
                    command_line,
                });
            }
        }

        Ok(Self {
            address: info,
            flags,
            command_line,
            regions,
            modules,
            module_table,
            region_table,
        })
    }

    pub fn flags(&self) -> InfoFlags {
        self.flags
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn regions(&self) -> &[BootRegion] {
        &self.regions
    }

    pub fn modules(&self) -> &[BootModule] {
        &self.modules
    }

    /// Builds the set of frames the allocator may hand out.
    ///
    /// Low memory, the kernel image, the boot structures and every module are
    /// taken out of the usable regions.
    pub fn memory_map(&self, kernel_start: PhysicalAddress, kernel_size: u32) -> MemoryMap {
        let mut map = MemoryMap::from_boot_map(&self.regions);
        map.reserve(PhysicalAddress::new(0), LOW_MEMORY_END);
        map.reserve(kernel_start, kernel_size);
        map.reserve(self.address, INFO_SIZE);
        for (address, size) in self.region_table.iter().chain(self.module_table.iter()) {
            map.reserve(*address, *size);
        }
        for module in &self.modules {
            map.reserve(module.start, module.size());
        }
        log::info!(
            "{} usable frames below {}",
            map.usable_frame_count(),
            map.frame_limit().start()
        );
        map
    }

    /// Describes each module as a program `exec` can load.
    ///
    /// Modules with an empty command line are named after their position.
    pub fn programs(&self) -> impl Iterator<Item = ProgramImage> + '_ {
        self.modules.iter().enumerate().map(|(index, module)| {
            let name = match module.name() {
                Some(name) => String::from(name),
                None => format!("module{index}"),
            };
            ProgramImage::new(name, module.start, module.size())
        })
    }
}

fn read_regions<M: PhysicalMemory>(
    memory: &mut M,
    table: PhysicalAddress,
    length: u32,
) -> Vec<BootRegion> {
    let mut regions = Vec::new();
    let mut offset = 0;
    // Each entry is prefixed by its own size, which does not count itself.
    while offset + 24 <= length {
        let entry = table + offset;
        let size = memory.read_u32(entry);
        let mut raw = [0u8; 20];
        memory.read(entry + 4, &mut raw);
        let [b0, b1, b2, b3, b4, b5, b6, b7, l0, l1, l2, l3, l4, l5, l6, l7, k0, k1, k2, k3] = raw;
        let region = BootRegion {
            base: u64::from_le_bytes([b0, b1, b2, b3, b4, b5, b6, b7]),
            size: u64::from_le_bytes([l0, l1, l2, l3, l4, l5, l6, l7]),
            kind: u32::from_le_bytes([k0, k1, k2, k3]),
        };
        log::trace!(
            "boot region {:#x}..{:#x} type {}",
            region.base,
            region.base.saturating_add(region.size),
            region.kind
        );
        regions.push(region);
        offset += size + 4;
    }
    regions
}

fn read_string<M: PhysicalMemory>(memory: &mut M, address: PhysicalAddress) -> String {
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 64];
    let mut cursor = address;
    'read: while bytes.len() < MAX_STRING {
        // Stop at the page end so a read never touches a frame past the string.
        let count = chunk.len().min(pmm::PAGE_SIZE - cursor.page_offset() as usize);
        memory.read(cursor, &mut chunk[..count]);
        for &byte in &chunk[..count] {
            if byte == 0 {
                break 'read;
            }
            bytes.push(byte);
        }
        cursor = cursor + count as u32;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmm::{EmulatedMemory, FrameNumber};

    const INFO: u32 = 0x9000;
    const MMAP: u32 = 0x9100;
    const CMDLINE: u32 = 0x9200;
    const MODS: u32 = 0x9300;
    const MOD_STRINGS: u32 = 0x9400;

    fn put(memory: &mut EmulatedMemory, address: u32, value: u32) {
        memory.write(PhysicalAddress::new(address), &value.to_le_bytes());
    }

    fn put_region(memory: &mut EmulatedMemory, address: u32, base: u64, size: u64, kind: u32) {
        put(memory, address, 20);
        memory.write(PhysicalAddress::new(address + 4), &base.to_le_bytes());
        memory.write(PhysicalAddress::new(address + 12), &size.to_le_bytes());
        put(memory, address + 20, kind);
    }

    fn put_str(memory: &mut EmulatedMemory, address: u32, text: &str) {
        memory.write(PhysicalAddress::new(address), text.as_bytes());
        memory.write(PhysicalAddress::new(address + text.len() as u32), &[0]);
    }

    /// A GRUB-like handoff: 8 MiB of RAM with the usual hole below 1 MiB, a
    /// region above 4 GiB and two modules.
    fn handoff() -> EmulatedMemory {
        let mut memory = EmulatedMemory::new(16);
        let flags = InfoFlags::MEMORY | InfoFlags::COMMAND_LINE | InfoFlags::MODULES | InfoFlags::MEMORY_MAP;
        put(&mut memory, INFO, flags.bits());
        put(&mut memory, INFO + offset::MEM_LOWER, 639);
        put(&mut memory, INFO + offset::MEM_UPPER, 7 * 1024);
        put(&mut memory, INFO + offset::CMDLINE, CMDLINE);
        put(&mut memory, INFO + offset::MODS_COUNT, 2);
        put(&mut memory, INFO + offset::MODS_ADDR, MODS);
        put(&mut memory, INFO + offset::MMAP_LENGTH, 4 * 24);
        put(&mut memory, INFO + offset::MMAP_ADDR, MMAP);

        put_region(&mut memory, MMAP, 0, 0x9_F000, 1);
        put_region(&mut memory, MMAP + 24, 0x9_F000, 0x6_1000, 2);
        put_region(&mut memory, MMAP + 48, 0x10_0000, 0x70_0000, 1);
        put_region(&mut memory, MMAP + 72, 0x1_0000_0000, 0x10_0000, 1);

        put_str(&mut memory, CMDLINE, "/boot/ringlet timer_ms=10 log=debug");

        put(&mut memory, MODS, 0x18_0000);
        put(&mut memory, MODS + 4, 0x18_1800);
        put(&mut memory, MODS + 8, MOD_STRINGS);
        put(&mut memory, MODS + 16, 0x20_0000);
        put(&mut memory, MODS + 20, 0x20_0100);
        put(&mut memory, MODS + 24, 0);
        put_str(&mut memory, MOD_STRINGS, "/bin/init quiet");
        memory
    }

    fn usable(map: &MemoryMap, address: u32) -> bool {
        map.is_usable(FrameNumber::new(address / pmm::PAGE_SIZE as u32))
    }

    #[test]
    fn parses_a_full_handoff() {
        let mut memory = handoff();
        let info = BootInfo::parse(&mut memory, MAGIC, PhysicalAddress::new(INFO)).expect("info");

        assert_eq!(info.command_line(), "/boot/ringlet timer_ms=10 log=debug");
        assert_eq!(info.regions().len(), 4);
        assert_eq!(
            info.regions()[2],
            BootRegion {
                base: 0x10_0000,
                size: 0x70_0000,
                kind: 1
            }
        );
        assert_eq!(info.modules().len(), 2);
        assert_eq!(info.modules()[0].name(), Some("/bin/init"));
        assert_eq!(info.modules()[0].size(), 0x1800);
        assert_eq!(info.modules()[1].name(), None);

        let programs: Vec<ProgramImage> = info.programs().collect();
        assert_eq!(programs[0].name(), "/bin/init");
        assert_eq!(programs[0].start(), PhysicalAddress::new(0x18_0000));
        assert_eq!(programs[0].pages(), 2);
        assert_eq!(programs[1].name(), "module1");
    }

    #[test]
    fn memory_map_excludes_boot_data() {
        let mut memory = handoff();
        let info = BootInfo::parse(&mut memory, MAGIC, PhysicalAddress::new(INFO)).expect("info");
        let map = info.memory_map(PhysicalAddress::new(0x10_0000), 0x2_0000);

        assert!(!usable(&map, 0x1000));
        assert!(!usable(&map, INFO));
        assert!(!usable(&map, 0x10_0000));
        assert!(!usable(&map, 0x11_F000));
        assert!(usable(&map, 0x12_0000));
        assert!(!usable(&map, 0x18_0000));
        assert!(!usable(&map, 0x18_1000));
        assert!(usable(&map, 0x18_2000));
        assert!(!usable(&map, 0x20_0000));
        assert!(usable(&map, 0x7F_F000));
        assert!(!usable(&map, 0x80_0000));
    }

    #[test]
    fn rejects_a_bad_magic() {
        let mut memory = handoff();
        assert_eq!(
            BootInfo::parse(&mut memory, 0x36D7_6289, PhysicalAddress::new(INFO)).err(),
            Some(BootError::BadMagic { found: 0x36D7_6289 })
        );
    }

    #[test]
    fn falls_back_to_memory_sizes() {
        let mut memory = handoff();
        put(&mut memory, INFO, InfoFlags::MEMORY.bits());
        let info = BootInfo::parse(&mut memory, MAGIC, PhysicalAddress::new(INFO)).expect("info");

        assert_eq!(info.command_line(), "");
        assert!(info.modules().is_empty());
        assert_eq!(info.regions()[1].base, 0x10_0000);
        assert_eq!(info.regions()[1].size, 7 * 1024 * 1024);

        let map = info.memory_map(PhysicalAddress::new(0x10_0000), 0x1000);
        assert!(usable(&map, 0x7F_F000));
        assert!(!usable(&map, 0x80_0000));
    }

    #[test]
    fn requires_some_memory_description() {
        let mut memory = handoff();
        put(&mut memory, INFO, InfoFlags::COMMAND_LINE.bits());
        assert_eq!(
            BootInfo::parse(&mut memory, MAGIC, PhysicalAddress::new(INFO)).err(),
            Some(BootError::NoMemoryMap)
        );
    }
}
