// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space (GMMU) page table.
//!
//! Maps GPU virtual addresses to device addresses using a 2-level table of
//! 4 KiB entries. Big-page mappings are stored as runs of small entries
//! tagged with the big-page flag. Each entry is free, reserved (sparse), or
//! mapped.
//!
//! Layout: `[L0: address_space_bits - 26][L1: 14 bits][Offset: 12 bits]`.

use parking_lot::RwLock;

use nvas_common::{DAddr, GPUVAddr, SMALL_PAGE_BITS};

const PAGE_BITS: u32 = SMALL_PAGE_BITS;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const PAGE_MASK: u64 = PAGE_SIZE - 1;
const L1_BITS: u32 = 14;
const L1_SIZE: usize = 1 << L1_BITS;

/// Memory kind tag carried by a page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PteKind(pub u8);

impl PteKind {
    pub const PITCH: Self = Self(0x00);
    pub const GENERIC_16BX2: Self = Self(0xFE);
    pub const INVALID: Self = Self(0xFF);
}

impl From<u32> for PteKind {
    fn from(raw: u32) -> Self {
        Self((raw & 0xFF) as u8)
    }
}

/// State of a single 4 KiB GPU page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Free,
    /// Sparse: reserved but not backed. Accesses read zero and drop writes.
    Reserved { big_page: bool },
    Mapped {
        dev_addr: DAddr,
        kind: PteKind,
        big_page: bool,
    },
}

/// Geometry of an address space, fixed when it is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    pub address_space_bits: u32,
    /// First address of the big-page region.
    pub split_address: GPUVAddr,
    pub big_page_bits: u32,
    pub page_bits: u32,
}

impl AddressSpaceLayout {
    pub const fn address_space_size(&self) -> u64 {
        1 << self.address_space_bits
    }
}

/// Page table operations the address-space device drives.
///
/// Shared between the address-space device and every channel bound to it,
/// so implementations use interior mutability.
pub trait GpuPageTable: Send + Sync {
    /// Map `[gpu_addr, gpu_addr + size)` to device memory at `dev_addr`.
    fn map(&self, gpu_addr: GPUVAddr, dev_addr: DAddr, size: u64, kind: PteKind, big_pages: bool);

    /// Mark `[gpu_addr, gpu_addr + size)` as sparse (reserved, unbacked).
    fn map_sparse(&self, gpu_addr: GPUVAddr, size: u64, big_pages: bool);

    /// Fully unmap `[gpu_addr, gpu_addr + size)`.
    fn unmap(&self, gpu_addr: GPUVAddr, size: u64);
}

/// Software GMMU with a 2-level page table.
pub struct GpuMemoryManager {
    layout: AddressSpaceLayout,
    /// L0 table: each entry is an optional L1 page table.
    page_table: RwLock<Vec<Option<Box<[PageState]>>>>,
}

impl GpuMemoryManager {
    pub fn new(layout: AddressSpaceLayout) -> Self {
        let l0_bits = layout
            .address_space_bits
            .saturating_sub(L1_BITS + PAGE_BITS);
        let l0_size = 1usize << l0_bits;
        let mut page_table = Vec::with_capacity(l0_size);
        page_table.resize_with(l0_size, || None);
        Self {
            layout,
            page_table: RwLock::new(page_table),
        }
    }

    pub fn layout(&self) -> AddressSpaceLayout {
        self.layout
    }

    /// Translate a GPU VA to a device address.
    /// Returns `None` if the page is free or only reserved.
    pub fn translate(&self, gpu_va: GPUVAddr) -> Option<DAddr> {
        match self.page_state(gpu_va) {
            PageState::Mapped { dev_addr, .. } => Some(dev_addr + (gpu_va & PAGE_MASK)),
            _ => None,
        }
    }

    pub fn page_state(&self, gpu_va: GPUVAddr) -> PageState {
        if !self.in_range(gpu_va) {
            return PageState::Free;
        }
        let table = self.page_table.read();
        match &table[Self::l0_index(gpu_va)] {
            Some(l1) => l1[Self::l1_index(gpu_va)],
            None => PageState::Free,
        }
    }

    pub fn page_kind(&self, gpu_va: GPUVAddr) -> PteKind {
        match self.page_state(gpu_va) {
            PageState::Mapped { kind, .. } => kind,
            _ => PteKind::INVALID,
        }
    }

    /// Whether every page in `[gpu_va, gpu_va + size)` is mapped.
    pub fn is_fully_mapped(&self, gpu_va: GPUVAddr, size: u64) -> bool {
        self.pages(gpu_va, size)
            .all(|va| matches!(self.page_state(va), PageState::Mapped { .. }))
    }

    /// Whether every page in `[gpu_va, gpu_va + size)` is free (neither
    /// mapped nor reserved).
    pub fn is_fully_free(&self, gpu_va: GPUVAddr, size: u64) -> bool {
        self.pages(gpu_va, size)
            .all(|va| self.page_state(va) == PageState::Free)
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn in_range(&self, gpu_va: GPUVAddr) -> bool {
        gpu_va < self.layout.address_space_size()
    }

    fn pages(&self, gpu_va: GPUVAddr, size: u64) -> impl Iterator<Item = GPUVAddr> {
        let start = gpu_va & !PAGE_MASK;
        let end = gpu_va.saturating_add(size);
        (start..end).step_by(PAGE_SIZE as usize)
    }

    fn l0_index(gpu_va: GPUVAddr) -> usize {
        (gpu_va >> (L1_BITS + PAGE_BITS)) as usize
    }

    fn l1_index(gpu_va: GPUVAddr) -> usize {
        ((gpu_va >> PAGE_BITS) & ((1 << L1_BITS) - 1)) as usize
    }

    /// Apply `entry_for(offset)` to every page of the range.
    fn write_range(&self, gpu_va: GPUVAddr, size: u64, entry_for: impl Fn(u64) -> PageState) {
        let mut table = self.page_table.write();
        let mut offset = 0u64;
        while offset < size {
            let va = gpu_va + offset;
            if !self.in_range(va) {
                log::warn!("gpu_mm: write past end of address space at 0x{:X}", va);
                break;
            }
            let entry = entry_for(offset);
            let l0 = &mut table[Self::l0_index(va)];
            if l0.is_none() {
                if entry == PageState::Free {
                    offset += PAGE_SIZE;
                    continue; // No L1 table, nothing to unmap.
                }
                *l0 = Some(vec![PageState::Free; L1_SIZE].into_boxed_slice());
            }
            if let Some(l1) = l0.as_mut() {
                l1[Self::l1_index(va)] = entry;
            }
            offset += PAGE_SIZE;
        }
    }
}

impl GpuPageTable for GpuMemoryManager {
    fn map(&self, gpu_addr: GPUVAddr, dev_addr: DAddr, size: u64, kind: PteKind, big_pages: bool) {
        self.write_range(gpu_addr, size, |offset| PageState::Mapped {
            dev_addr: (dev_addr + offset) & !PAGE_MASK,
            kind,
            big_page: big_pages,
        });
        log::trace!(
            "gpu_mm: map GPU 0x{:X}..0x{:X} -> 0x{:X} (kind={:?}, big={})",
            gpu_addr,
            gpu_addr + size,
            dev_addr,
            kind,
            big_pages
        );
    }

    fn map_sparse(&self, gpu_addr: GPUVAddr, size: u64, big_pages: bool) {
        self.write_range(gpu_addr, size, |_| PageState::Reserved { big_page: big_pages });
        log::trace!("gpu_mm: sparse GPU 0x{:X}..0x{:X}", gpu_addr, gpu_addr + size);
    }

    fn unmap(&self, gpu_addr: GPUVAddr, size: u64) {
        self.write_range(gpu_addr, size, |_| PageState::Free);
        log::trace!("gpu_mm: unmap GPU 0x{:X}..0x{:X}", gpu_addr, gpu_addr + size);
    }
}
