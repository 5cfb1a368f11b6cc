//! Memory management: address types, permission bits, layout constants
//!
//! The address space is the classic two-level 32-bit layout: a 1024-entry
//! page directory whose entries point at 1024-entry page tables, 4 KiB
//! pages throughout. Page tables live in ordinary physical frames.

pub mod ager;
pub mod frame;
pub mod page_table;
pub mod phys;
pub mod rmap;

pub use frame::{FrameNumber, FrameTable};
pub use phys::{PhysMem, PteSlot};
pub use rmap::RmapArena;

use bitflags::bitflags;

/// Size of a page (and of a physical frame)
pub const PGSIZE: usize = 4096;
/// log2(PGSIZE)
pub const PGSHIFT: u32 = 12;
/// Bytes mapped by one page-directory entry (4 MiB)
pub const PTSIZE: usize = PGSIZE * NPTENTRIES;
/// Entries per page directory
pub const NPDENTRIES: usize = 1024;
/// Entries per page table
pub const NPTENTRIES: usize = 1024;

/// Top of the user-controllable address space
pub const UTOP: u32 = 0xeec0_0000;
/// Top of the user exception stack (one page ending here)
pub const UXSTACKTOP: u32 = UTOP;
/// Top of the normal user stack; the page between the two stacks is a guard
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE as u32;
/// Root page of the user mapping directory
pub const UMAPDIR: u32 = 0xe000_0000;
/// Ceiling of program text and static data; the user allocator and the
/// victim chooser never touch anything below this
pub const UTEXT: u32 = 0x0080_0000;
/// Scratch va used when poking another environment's pages
pub const UTEMP: u32 = 0x0040_0000;
/// Scratch va used by the copy-on-write fault handler
pub const PFTEMP: u32 = UTEMP + PTSIZE as u32 - PGSIZE as u32;

/// Maximum value of a frame age counter
pub const MAX_PAGE_AGE: u8 = 254;
/// Added to a frame's age when the accessed bit is observed
pub const PAGE_AGE_INCREMENT_ON_ACCESS: u8 = 100;
/// Subtracted from a frame's age on an idle tick
pub const PAGE_AGE_DECREMENT_ON_CLOCK: u8 = 1;
/// Age assigned when a frame is first handed out
pub const PAGE_AGE_INITIAL: u8 = MAX_PAGE_AGE;

/// Free-page count under which the ager works hardest
pub const NPAGESFREE_LOW_THRESHOLD: usize = 1 << 4;
/// Free-page count under which the ager starts working harder
pub const NPAGESFREE_HIGH_THRESHOLD: usize = 1 << 8;
/// Scale factor for the per-tick aging budget
pub const NPAGEUPDATES_FACTOR: usize = 50;

/// Below this many free frames, environments over their fair share are
/// refused new allocations
pub const SOFT_MIN_FREE_PAGES: usize = 1 << 6;
/// Below this many free frames, all user allocations are refused
pub const HARD_MIN_FREE_PAGES: usize = 1 << 3;

bitflags! {
    /// Page-table entry permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT  = 0x001;
        const WRITABLE = 0x002;
        const USER     = 0x004;
        const ACCESSED = 0x020;
        const DIRTY    = 0x040;
        /// Do-not-evict marker: the page holds paging metadata
        const NO_PAGE  = 0x200;
        /// Deliberately shared between environments; never made CoW
        const SHARED   = 0x400;
        /// Copy-on-write marker
        const COW      = 0x800;
    }
}

impl PteFlags {
    /// The three bits ignored by the hardware and owned by user space
    pub const AVAIL: PteFlags = PteFlags::NO_PAGE.union(PteFlags::SHARED).union(PteFlags::COW);

    /// Bits user code may pass across the system-call boundary
    pub const SYSCALL: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER)
        .union(PteFlags::AVAIL);
}

/// Page-fault error bit: the faulting access was a write
pub const FEC_WR: u32 = 0x2;
/// Page-fault error bit: the page was present (protection violation)
pub const FEC_PR: u32 = 0x1;

/// A virtual address in some environment's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Page-directory index (top 10 bits)
    pub const fn pdx(&self) -> usize {
        (self.0 >> 22) as usize & 0x3ff
    }

    /// Page-table index (middle 10 bits)
    pub const fn ptx(&self) -> usize {
        (self.0 >> PGSHIFT) as usize & 0x3ff
    }

    /// Linear page number
    pub const fn pgnum(&self) -> usize {
        (self.0 >> PGSHIFT) as usize
    }

    /// Offset within the page
    pub const fn page_offset(&self) -> usize {
        (self.0 as usize) & (PGSIZE - 1)
    }

    /// Round down to the containing page boundary
    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PGSIZE as u32 - 1))
    }

    /// Round up to the next page boundary
    pub const fn page_round_up(&self) -> Self {
        Self((self.0.wrapping_add(PGSIZE as u32 - 1)) & !(PGSIZE as u32 - 1))
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & (PGSIZE as u32 - 1) == 0
    }

    /// Virtual address of linear page number `pgnum`
    pub const fn of_pgnum(pgnum: usize) -> Self {
        Self((pgnum as u32) << PGSHIFT)
    }
}

/// Frame number and flag bits packed into one PTE word
pub const fn make_pte(frame: FrameNumber, flags: PteFlags) -> u32 {
    (frame.as_u32() << PGSHIFT) | flags.bits()
}

/// Frame a PTE points at (meaningful only when PRESENT)
pub const fn pte_frame(pte: u32) -> FrameNumber {
    FrameNumber::new(pte >> PGSHIFT)
}

/// Flag bits of a PTE
pub fn pte_flags(pte: u32) -> PteFlags {
    PteFlags::from_bits_truncate(pte & 0xfff)
}
