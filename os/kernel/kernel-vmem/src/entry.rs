use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 32-bit i386 paging entry in its raw bitfield form.
///
/// Page-directory entries (PDE) and page-table entries (PTE) share this
/// layout. The per-level wrappers [`PdEntry`](crate::PdEntry) and
/// [`PtEntry`](crate::PtEntry) decide which bits are meaningful.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (PTE only) |
/// | 7     | `PS` / `PAT`    | 4 MiB page in a PDE, PAT in a PTE |
/// | 8     | `G`             | Global (PTE only) |
/// | 9–11  | OS avail        | Reserved for OS use |
/// | 12–31 | `addr`          | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new_kernel_rw(PhysicalAddress::new(0x0012_3000));
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Set if the entry points to a valid page table or page. A clear bit
    /// makes every other field available to software.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Clear for read-only. Supervisor writes honour it only with `CR0.WP` set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on the first write through a PTE.
    pub dirty: bool,

    /// Page Size in a PDE (4 MiB page), PAT in a PTE (bit 7).
    ///
    /// This kernel never creates 4 MiB pages, so the bit stays clear.
    pub large_page: bool,

    /// Global (G, bit 8). Survives CR3 reloads when `CR4.PGE` is set.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical address bits [31:12].
    #[bits(20)]
    frame_4k: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_frame_4k(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_4k() << 12)
    }

    /// Present, writable, supervisor-only entry pointing at `phys`.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw(phys: PhysicalAddress) -> Self {
        let mut bits = Self::new().with_present(true).with_writable(true);
        bits.set_physical_address(phys);
        bits
    }
}
