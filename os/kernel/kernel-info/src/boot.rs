//! # Kernel Boot Information
//!
//! The bootloader (GRUB, Multiboot v1) hands the kernel a pointer to
//! [`MultibootInfo`]. The only part consumed by memory management is the
//! BIOS-provided memory map, read through [`MemoryMap`].

use core::fmt;

/// `flags` bit announcing that `mmap_length`/`mmap_addr` are valid.
pub const MULTIBOOT_INFO_MEM_MAP: u32 = 1 << 6;

/// Multiboot v1 information structure, as laid out by the bootloader.
///
/// Only the fields up to the memory map are described; later fields are not
/// read by the kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MultibootInfo {
    /// Bit set telling which of the following fields are valid.
    pub flags: u32,
    /// KiB of lower memory (below 1 MiB).
    pub mem_lower: u32,
    /// KiB of upper memory (above 1 MiB).
    pub mem_upper: u32,
    pub boot_device: u32,
    /// Physical address of the command line string.
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    /// a.out symbol table or ELF section header table.
    pub syms: [u32; 4],
    /// Length of the memory map buffer in **bytes**.
    pub mmap_length: u32,
    /// Physical address of the memory map buffer.
    pub mmap_addr: u32,
}

impl MultibootInfo {
    /// Whether the bootloader provided a memory map.
    #[inline]
    #[must_use]
    pub const fn has_memory_map(&self) -> bool {
        self.flags & MULTIBOOT_INFO_MEM_MAP != 0
    }
}

/// Type of a memory map entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Usable RAM.
    Available,
    Reserved,
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    Nvs,
    BadRam,
    Other(u32),
}

impl From<u32> for MemoryKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::Nvs,
            5 => Self::BadRam,
            other => Self::Other(other),
        }
    }
}

/// One entry of the memory map. Addresses are 64 bits wide even on i386.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MemoryRegion {
    pub kind: MemoryKind,
    pub base: u64,
    pub len: u64,
}

impl MemoryRegion {
    /// Exclusive end of the region, saturated at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion({:?}, [0x{:X}, 0x{:X}))",
            self.kind,
            self.base,
            self.end()
        )
    }
}

/// Reader over the raw Multiboot memory map.
///
/// Every entry is prefixed with its own `size` (which does not count the
/// prefix itself), followed by a 64-bit base, a 64-bit length and a 32-bit
/// type, all little-endian:
///
/// ```text
/// +0   size: u32
/// +4   base: u64
/// +12  len:  u64
/// +20  type: u32
/// +size+4  next entry
/// ```
///
/// A truncated trailing entry ends the iteration.
#[derive(Clone, Copy)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
}

impl<'a> MemoryMap<'a> {
    /// Byte length of an entry including its size prefix.
    pub const ENTRY_LEN: usize = 24;

    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub const fn iter(&self) -> MemoryMapIter<'a> {
        MemoryMapIter {
            bytes: self.bytes,
            offset: 0,
        }
    }
}

impl<'a> IntoIterator for MemoryMap<'a> {
    type Item = MemoryRegion;
    type IntoIter = MemoryMapIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Debug for MemoryMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

pub struct MemoryMapIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl MemoryMapIter<'_> {
    fn read_u32(&self, at: usize) -> Option<u32> {
        let raw = self.bytes.get(at..at.checked_add(4)?)?;
        Some(u32::from_le_bytes(raw.try_into().ok()?))
    }

    fn read_u64(&self, at: usize) -> Option<u64> {
        let raw = self.bytes.get(at..at.checked_add(8)?)?;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }
}

impl Iterator for MemoryMapIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        let at = self.offset;
        let size = self.read_u32(at)? as usize;
        let base = self.read_u64(at + 4)?;
        let len = self.read_u64(at + 12)?;
        let kind = self.read_u32(at + 20)?;

        // The entry's own size may exceed the fields we know about.
        self.offset = at.saturating_add(size.max(MemoryMap::ENTRY_LEN - 4) + 4);

        Some(MemoryRegion {
            kind: kind.into(),
            base,
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(base: u64, len: u64, kind: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&20u32.to_le_bytes());
        v.extend_from_slice(&base.to_le_bytes());
        v.extend_from_slice(&len.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v
    }

    #[test]
    fn parses_consecutive_entries() {
        let mut raw = entry(0, 0x9_FC00, 1);
        raw.extend(entry(0x10_0000, 0x7EE_0000, 1));
        raw.extend(entry(0xFFFC_0000, 0x4_0000, 2));

        let regions: Vec<_> = MemoryMap::new(&raw).iter().collect();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].kind, MemoryKind::Available);
        assert_eq!(regions[1].base, 0x10_0000);
        assert_eq!(regions[1].end(), 0x7FE_0000);
        assert_eq!(regions[2].kind, MemoryKind::Reserved);
    }

    #[test]
    fn honours_larger_entry_size() {
        let mut raw = entry(0x1000, 0x1000, 1);
        raw[0..4].copy_from_slice(&24u32.to_le_bytes());
        raw.extend_from_slice(&[0xAA; 4]);
        raw.extend(entry(0x5000, 0x2000, 3));

        let regions: Vec<_> = MemoryMap::new(&raw).into_iter().collect();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[1].base, 0x5000);
        assert_eq!(regions[1].kind, MemoryKind::AcpiReclaimable);
    }

    #[test]
    fn truncated_entry_ends_iteration() {
        let mut raw = entry(0x1000, 0x1000, 1);
        raw.extend_from_slice(&entry(0x2000, 0x1000, 1)[..10]);
        assert_eq!(MemoryMap::new(&raw).iter().count(), 1);
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let raw = entry(0, 0x1000, 42);
        let region = MemoryMap::new(&raw).iter().next().unwrap();
        assert_eq!(region.kind, MemoryKind::Other(42));
    }

    #[test]
    fn memory_map_flag() {
        let mut info = MultibootInfo {
            flags: 0,
            mem_lower: 0,
            mem_upper: 0,
            boot_device: 0,
            cmdline: 0,
            mods_count: 0,
            mods_addr: 0,
            syms: [0; 4],
            mmap_length: 0,
            mmap_addr: 0,
        };
        assert!(!info.has_memory_map());
        info.flags |= MULTIBOOT_INFO_MEM_MAP;
        assert!(info.has_memory_map());
    }
}
