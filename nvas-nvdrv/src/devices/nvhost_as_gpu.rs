// SPDX-FileCopyrightText: 2025 nvas contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! `/dev/nvhost-as-gpu`: GPU address space management.
//!
//! Each instance owns one GPU virtual address space split into a small-page
//! region `[va_range_start, va_range_split)` and a big-page region
//! `[va_range_split, va_range_end)`. VA bookkeeping lives in two
//! [`Allocator`]s (in page units), an allocation table for reserved regions
//! and a mapping table for buffers mapped into them. The page table itself is
//! an external [`GpuPageTable`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use wasmtime_slab::{Id, Slab};

use nvas_common::{
    align_up, checked_align_up, is_aligned, log2_ceil, Allocator, DAddr, GPUVAddr, NvResult, Settings, SMALL_PAGE_BITS,
    SMALL_PAGE_SIZE,
};
use nvas_gpu::{AddressSpaceLayout, GpuHost, GpuPageTable, PteKind};

use super::{DeviceFd, NvDevice};
use crate::ioctl::{
    wrap_fixed, wrap_fixed_inline_out, wrap_variable, Ioctl, IoctlAllocAsEx, IoctlAllocSpace,
    IoctlBindChannel, IoctlFreeSpace, IoctlGetVaRegions, IoctlMapBufferEx, IoctlRecord,
    IoctlRemapEntry, IoctlUnmapBuffer, MappingFlags, VaRegion,
};
use crate::nvmap::{HandleId, HandleProvider};

const DEVICE_NAME: &str = "/dev/nvhost-as-gpu";
const IOCTL_GROUP: u8 = b'A';

/// The default VA start is the big page size shifted up by this much.
const VA_START_SHIFT: u32 = 10;
/// Widest address space the GMMU supports.
const MAX_ADDRESS_SPACE_BITS: u32 = 40;

// ── Bookkeeping records ─────────────────────────────────────────────────────

/// A buffer mapped into the address space.
struct Mapping {
    handle: HandleId,
    /// Device address the start of the mapping points at.
    ptr: DAddr,
    offset: GPUVAddr,
    size: u64,
    /// Placed by the guest inside an allocation rather than by the allocator.
    fixed: bool,
    big_page: bool,
    /// Unmapping returns the range to sparse instead of unmapping it.
    sparse_alloc: bool,
    /// Key of the allocation this mapping was carved from.
    owner: Option<GPUVAddr>,
}

/// A VA region reserved by AllocateSpace.
struct Allocation {
    size: u64,
    page_size: u32,
    sparse: bool,
    big_pages: bool,
    mappings: Vec<Id>,
}

/// Address space configuration, fixed at AllocAsEx.
struct Vm {
    big_page_size: u32,
    big_page_size_bits: u32,
    va_range_start: u64,
    va_range_split: u64,
    va_range_end: u64,
    small_page_allocator: Allocator,
    big_page_allocator: Allocator,
    gmmu: Arc<dyn GpuPageTable>,
}

impl Vm {
    fn page_bits(&self, big_pages: bool) -> u32 {
        if big_pages {
            self.big_page_size_bits
        } else {
            SMALL_PAGE_BITS
        }
    }

    fn allocator(&self, big_pages: bool) -> &Allocator {
        if big_pages {
            &self.big_page_allocator
        } else {
            &self.small_page_allocator
        }
    }

    /// Return `[offset, offset + size)` to the matching allocator.
    fn release_range(&self, big_pages: bool, offset: GPUVAddr, size: u64) {
        let bits = self.page_bits(big_pages);
        let pages = align_up(size, 1 << bits) >> bits;
        if let Err(err) = self.allocator(big_pages).free(offset >> bits, pages) {
            log::error!(
                "nvhost-as-gpu: failed to release 0x{:X}+0x{:X}: {}",
                offset,
                size,
                err
            );
        }
    }

    fn release_mapping(&self, mapping: &Mapping, nvmap: &dyn HandleProvider) {
        if !mapping.fixed {
            self.release_range(mapping.big_page, mapping.offset, mapping.size);
        }

        nvmap.unpin_handle(mapping.handle);

        // Only FreeSpace fully unmaps a sparse region.
        if mapping.sparse_alloc {
            self.gmmu
                .map_sparse(mapping.offset, mapping.size, mapping.big_page);
        } else {
            self.gmmu.unmap(mapping.offset, mapping.size);
        }
    }

    fn va_regions(&self) -> [VaRegion; 2] {
        [
            VaRegion {
                offset: self.va_range_start,
                page_size: SMALL_PAGE_SIZE,
                pad: 0,
                pages: (self.va_range_split - self.va_range_start) >> SMALL_PAGE_BITS,
            },
            VaRegion {
                offset: self.va_range_split,
                page_size: self.big_page_size,
                pad: 0,
                pages: (self.va_range_end - self.va_range_split) >> self.big_page_size_bits,
            },
        ]
    }
}

struct AsState {
    vm: Option<Vm>,
    allocations: BTreeMap<GPUVAddr, Allocation>,
    mappings: BTreeMap<GPUVAddr, Id>,
    arena: Slab<Mapping>,
}

impl AsState {
    fn new() -> Self {
        Self {
            vm: None,
            allocations: BTreeMap::new(),
            mappings: BTreeMap::new(),
            arena: Slab::new(),
        }
    }

    /// Remove the mapping at `offset` and undo its effects.
    /// Returns `false` if there is none.
    fn free_mapping(&mut self, offset: GPUVAddr, nvmap: &dyn HandleProvider) -> bool {
        let Some(id) = self.mappings.remove(&offset) else {
            return false;
        };
        let mapping = self.arena.dealloc(id);

        if let Some(allocation) = mapping
            .owner
            .and_then(|owner| self.allocations.get_mut(&owner))
        {
            allocation.mappings.retain(|&other| other != id);
        }

        if let Some(vm) = &self.vm {
            vm.release_mapping(&mapping, nvmap);
        }
        true
    }
}

fn not_initialised() -> NvResult {
    log::error!("nvhost-as-gpu: address space is not initialised");
    NvResult::BadValue
}

/// Allocation containing all of `[va, va + size)`, with its key.
fn containing_allocation(
    allocations: &BTreeMap<GPUVAddr, Allocation>,
    va: GPUVAddr,
    size: u64,
) -> Option<(GPUVAddr, &Allocation)> {
    let (&start, allocation) = allocations.range(..=va).next_back()?;
    let end = (va - start).checked_add(size)?;
    (end <= allocation.size).then_some((start, allocation))
}

// ── Device ──────────────────────────────────────────────────────────────────

/// `/dev/nvhost-as-gpu` device instance.
pub struct NvHostAsGpu {
    gpu: Arc<dyn GpuHost>,
    nvmap: Arc<dyn HandleProvider>,
    settings: Settings,
    state: Mutex<AsState>,
}

impl NvHostAsGpu {
    pub fn new(gpu: Arc<dyn GpuHost>, nvmap: Arc<dyn HandleProvider>, settings: Settings) -> Self {
        Self {
            gpu,
            nvmap,
            settings,
            state: Mutex::new(AsState::new()),
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.state.lock().vm.is_some()
    }

    fn invariant_violation(&self, args: fmt::Arguments<'_>) {
        if self.settings.fatal_invariant_violations {
            panic!("nvhost-as-gpu: {}", args);
        }
        log::error!("nvhost-as-gpu: {}", args);
    }

    // ── AllocAsEx ───────────────────────────────────────────────────────

    /// Initialise the address space. Only valid once per instance.
    pub fn alloc_as_ex(&self, params: &mut IoctlAllocAsEx) -> NvResult {
        self.try_alloc_as_ex(params).into()
    }

    fn try_alloc_as_ex(&self, params: &IoctlAllocAsEx) -> Result<(), NvResult> {
        log::debug!(
            "nvhost-as-gpu: AllocAsEx big_page_size=0x{:X}, flags=0x{:X}, va_range=[0x{:X}, 0x{:X}, 0x{:X})",
            params.big_page_size,
            params.flags,
            params.va_range_start,
            params.va_range_split,
            params.va_range_end
        );

        let mut state = self.state.lock();
        if state.vm.is_some() {
            self.invariant_violation(format_args!("cannot initialise an address space twice"));
            return Err(NvResult::InvalidState);
        }

        let big_page_size = match params.big_page_size {
            0 => self.settings.default_big_page_size,
            size => size,
        };
        if !Settings::is_supported_big_page_size(big_page_size) {
            log::error!("nvhost-as-gpu: unsupported big page size 0x{:X}", big_page_size);
            return Err(NvResult::BadValue);
        }
        let big_page_size_bits = big_page_size.trailing_zeros();

        let (va_range_start, va_range_split, va_range_end) = if params.va_range_start != 0 {
            (params.va_range_start, params.va_range_split, params.va_range_end)
        } else {
            (
                (big_page_size as u64) << VA_START_SHIFT,
                self.settings.default_va_split,
                self.settings.default_va_end,
            )
        };

        let big = big_page_size as u64;
        let ordered = va_range_start < va_range_split && va_range_split < va_range_end;
        let aligned = is_aligned(va_range_start, SMALL_PAGE_SIZE as u64)
            && is_aligned(va_range_split, big)
            && is_aligned(va_range_end, big);
        let address_space_bits = log2_ceil(va_range_end);
        if !ordered || !aligned || address_space_bits > MAX_ADDRESS_SPACE_BITS {
            log::error!(
                "nvhost-as-gpu: invalid VA layout [0x{:X}, 0x{:X}, 0x{:X})",
                va_range_start,
                va_range_split,
                va_range_end
            );
            return Err(NvResult::BadValue);
        }

        let gmmu = self.gpu.create_address_space(AddressSpaceLayout {
            address_space_bits,
            split_address: va_range_split,
            big_page_bits: big_page_size_bits,
            page_bits: SMALL_PAGE_BITS,
        });

        state.vm = Some(Vm {
            big_page_size,
            big_page_size_bits,
            va_range_start,
            va_range_split,
            va_range_end,
            small_page_allocator: Allocator::new(
                va_range_start >> SMALL_PAGE_BITS,
                va_range_split >> SMALL_PAGE_BITS,
            ),
            big_page_allocator: Allocator::new(
                va_range_split >> big_page_size_bits,
                va_range_end >> big_page_size_bits,
            ),
            gmmu,
        });
        Ok(())
    }

    // ── AllocateSpace / FreeSpace ───────────────────────────────────────

    /// Reserve a VA region. On success `params.offset` holds its start.
    pub fn allocate_space(&self, params: &mut IoctlAllocSpace) -> NvResult {
        self.try_allocate_space(params).into()
    }

    fn try_allocate_space(&self, params: &mut IoctlAllocSpace) -> Result<(), NvResult> {
        log::debug!(
            "nvhost-as-gpu: AllocateSpace pages=0x{:X}, page_size=0x{:X}, flags={:?}, offset=0x{:X}",
            params.pages,
            params.page_size,
            params.flags,
            params.offset
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let vm = state.vm.as_ref().ok_or_else(not_initialised)?;

        let big_pages = if params.page_size == SMALL_PAGE_SIZE {
            false
        } else if params.page_size == vm.big_page_size {
            true
        } else {
            log::error!("nvhost-as-gpu: unsupported page size 0x{:X}", params.page_size);
            return Err(NvResult::BadValue);
        };

        let sparse = params.flags.contains(MappingFlags::SPARSE);
        if sparse && !big_pages {
            log::error!("nvhost-as-gpu: sparse small pages are not implemented");
            return Err(NvResult::NotImplemented);
        }

        if params.pages == 0 {
            log::error!("nvhost-as-gpu: zero-sized allocation");
            return Err(NvResult::BadValue);
        }

        let bits = vm.page_bits(big_pages);
        let allocator = vm.allocator(big_pages);
        let pages = params.pages as u64;

        if params.flags.contains(MappingFlags::FIXED) {
            let first = params.offset >> bits;
            let in_range = is_aligned(params.offset, 1 << bits)
                && first >= allocator.va_start()
                && first + pages <= allocator.va_limit();
            if !in_range || !allocator.is_free(first, pages) {
                log::error!(
                    "nvhost-as-gpu: cannot reserve fixed region 0x{:X}+0x{:X}",
                    params.offset,
                    pages << bits
                );
                return Err(NvResult::BadValue);
            }
            allocator.allocate_fixed(first, pages).map_err(|err| {
                log::error!("nvhost-as-gpu: fixed reservation failed: {}", err);
                NvResult::BadValue
            })?;
        } else {
            let first = allocator.allocate(pages).ok_or_else(|| {
                log::error!("nvhost-as-gpu: failed to allocate free space in the GPU AS");
                NvResult::InsufficientMemory
            })?;
            params.offset = first << bits;
        }

        let size = pages << bits;
        if sparse {
            vm.gmmu.map_sparse(params.offset, size, big_pages);
        }

        state.allocations.insert(
            params.offset,
            Allocation {
                size,
                page_size: params.page_size,
                sparse,
                big_pages,
                mappings: Vec::new(),
            },
        );
        Ok(())
    }

    /// Release a region reserved by AllocateSpace and every mapping in it.
    pub fn free_space(&self, params: &mut IoctlFreeSpace) -> NvResult {
        self.try_free_space(params).into()
    }

    fn try_free_space(&self, params: &IoctlFreeSpace) -> Result<(), NvResult> {
        log::debug!(
            "nvhost-as-gpu: FreeSpace offset=0x{:X}, pages=0x{:X}, page_size=0x{:X}",
            params.offset,
            params.pages,
            params.page_size
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.vm.is_none() {
            return Err(not_initialised());
        }

        let Some(allocation) = state.allocations.get(&params.offset) else {
            log::error!("nvhost-as-gpu: no allocation at 0x{:X}", params.offset);
            return Err(NvResult::BadValue);
        };
        let size = params.pages as u64 * params.page_size as u64;
        if allocation.page_size != params.page_size || allocation.size != size {
            log::error!(
                "nvhost-as-gpu: free of 0x{:X} does not match allocation (size=0x{:X}, page_size=0x{:X})",
                params.offset,
                allocation.size,
                allocation.page_size
            );
            return Err(NvResult::BadValue);
        }

        let offsets: Vec<GPUVAddr> = allocation
            .mappings
            .iter()
            .filter_map(|&id| state.arena.get(id))
            .map(|mapping| mapping.offset)
            .collect();
        for offset in offsets {
            state.free_mapping(offset, &*self.nvmap);
        }

        let (Some(allocation), Some(vm)) = (state.allocations.remove(&params.offset), &state.vm) else {
            return Err(NvResult::BadValue);
        };
        if allocation.sparse {
            vm.gmmu.unmap(params.offset, allocation.size);
        }
        vm.release_range(allocation.big_pages, params.offset, allocation.size);
        Ok(())
    }

    // ── MapBufferEx / UnmapBuffer ───────────────────────────────────────

    /// Map a handle. On success `params.offset` holds the GPU VA.
    pub fn map_buffer_ex(&self, params: &mut IoctlMapBufferEx) -> NvResult {
        self.try_map_buffer_ex(params).into()
    }

    fn try_map_buffer_ex(&self, params: &mut IoctlMapBufferEx) -> Result<(), NvResult> {
        log::debug!(
            "nvhost-as-gpu: MapBufferEx flags={:?}, kind=0x{:X}, handle={}, buffer_offset=0x{:X}, mapping_size=0x{:X}, offset=0x{:X}",
            params.flags,
            params.kind,
            params.handle,
            params.buffer_offset,
            params.mapping_size,
            params.offset
        );

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.vm.is_none() {
            return Err(not_initialised());
        }

        if params.buffer_offset < 0 {
            log::error!("nvhost-as-gpu: negative buffer offset {}", params.buffer_offset);
            return Err(NvResult::BadValue);
        }
        let buffer_offset = params.buffer_offset as u64;
        let kind = PteKind::from(params.kind);

        if params.flags.contains(MappingFlags::REMAP) {
            return self.remap_mapping(state, params.offset as GPUVAddr, buffer_offset, params.mapping_size, kind);
        }

        let handle = self.nvmap.get_handle(params.handle).ok_or_else(|| {
            log::error!("nvhost-as-gpu: unknown handle {}", params.handle);
            NvResult::BadValue
        })?;
        let size = match params.mapping_size {
            0 => handle.orig_size,
            size => size,
        };

        let big_page = {
            let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
            if is_aligned(handle.align, vm.big_page_size as u64) {
                true
            } else if is_aligned(handle.align, SMALL_PAGE_SIZE as u64) {
                false
            } else {
                self.invariant_violation(format_args!(
                    "handle {} has unexpected alignment 0x{:X}",
                    params.handle, handle.align
                ));
                return Err(NvResult::BadValue);
            }
        };

        if params.flags.contains(MappingFlags::FIXED) {
            let offset = params.offset as GPUVAddr;
            let Some((owner, allocation)) = containing_allocation(&state.allocations, offset, size) else {
                log::error!(
                    "nvhost-as-gpu: cannot perform a fixed mapping into an unallocated region 0x{:X}+0x{:X}",
                    offset,
                    size
                );
                return Err(NvResult::BadValue);
            };
            let use_big_pages = allocation.big_pages && big_page;
            let sparse_alloc = allocation.sparse;

            let ptr = self.pin_at(params.handle, buffer_offset, size)?;
            if state.free_mapping(offset, &*self.nvmap) {
                log::warn!("nvhost-as-gpu: replacing existing mapping at 0x{:X}", offset);
            }
            let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
            vm.gmmu.map(offset, ptr, size, kind, use_big_pages);

            let id = state.arena.alloc(Mapping {
                handle: params.handle,
                ptr,
                offset,
                size,
                fixed: true,
                big_page: use_big_pages,
                sparse_alloc,
                owner: Some(owner),
            });
            state.mappings.insert(offset, id);
            if let Some(allocation) = state.allocations.get_mut(&owner) {
                allocation.mappings.push(id);
            }
        } else {
            let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
            let bits = vm.page_bits(big_page);
            let first_and_size = checked_align_up(size, 1 << bits).and_then(|aligned_size| {
                let first = vm.allocator(big_page).allocate(aligned_size >> bits)?;
                Some((first, aligned_size))
            });
            let Some((first, aligned_size)) = first_and_size else {
                log::error!(
                    "nvhost-as-gpu: failed to allocate 0x{:X} bytes of free space in the GPU AS",
                    size
                );
                return Err(NvResult::InsufficientMemory);
            };
            let offset = first << bits;

            let ptr = match self.pin_at(params.handle, buffer_offset, aligned_size) {
                Ok(ptr) => ptr,
                Err(err) => {
                    vm.release_range(big_page, offset, aligned_size);
                    return Err(err);
                }
            };
            vm.gmmu.map(offset, ptr, aligned_size, kind, big_page);

            let id = state.arena.alloc(Mapping {
                handle: params.handle,
                ptr,
                offset,
                size: aligned_size,
                fixed: false,
                big_page,
                sparse_alloc: false,
                owner: None,
            });
            state.mappings.insert(offset, id);
            params.offset = offset as i64;
        }
        Ok(())
    }

    /// Re-point part of an existing mapping at a different device address.
    fn remap_mapping(
        &self,
        state: &AsState,
        offset: GPUVAddr,
        buffer_offset: u64,
        mapping_size: u64,
        kind: PteKind,
    ) -> Result<(), NvResult> {
        let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
        let Some(mapping) = state.mappings.get(&offset).and_then(|&id| state.arena.get(id)) else {
            log::warn!("nvhost-as-gpu: cannot remap an unmapped GPU address space region: 0x{:X}", offset);
            return Err(NvResult::BadValue);
        };
        let covered = buffer_offset
            .checked_add(mapping_size)
            .is_some_and(|end| end <= mapping.size);
        if !covered {
            log::warn!(
                "nvhost-as-gpu: cannot remap a partially mapped GPU address space region: 0x{:X}",
                offset
            );
            return Err(NvResult::BadValue);
        }

        vm.gmmu.map(
            offset + buffer_offset,
            mapping.ptr + buffer_offset,
            mapping_size,
            kind,
            mapping.big_page,
        );
        Ok(())
    }

    /// Unmap a buffer. An offset with no mapping is tolerated.
    pub fn unmap_buffer(&self, params: &mut IoctlUnmapBuffer) -> NvResult {
        self.try_unmap_buffer(params).into()
    }

    fn try_unmap_buffer(&self, params: &IoctlUnmapBuffer) -> Result<(), NvResult> {
        log::debug!("nvhost-as-gpu: UnmapBuffer offset=0x{:X}", params.offset);

        let mut state = self.state.lock();
        if state.vm.is_none() {
            return Err(not_initialised());
        }
        let offset = params.offset as GPUVAddr;
        if !state.free_mapping(offset, &*self.nvmap) {
            log::warn!("nvhost-as-gpu: couldn't find region to unmap at 0x{:X}", offset);
        }
        Ok(())
    }

    /// Pin `handle`, returning the device address `buffer_offset` bytes into it.
    /// Fails without leaving a pin if `[address, address + len)` would overflow.
    fn pin_at(&self, handle: HandleId, buffer_offset: u64, len: u64) -> Result<DAddr, NvResult> {
        let base = self.nvmap.pin_handle(handle).ok_or_else(|| {
            log::error!("nvhost-as-gpu: failed to pin handle {}", handle);
            NvResult::BadValue
        })?;
        match base.checked_add(buffer_offset) {
            Some(ptr) if ptr.checked_add(len).is_some() => Ok(ptr),
            _ => {
                log::error!(
                    "nvhost-as-gpu: buffer offset 0x{:X} overflows handle {} at 0x{:X}",
                    buffer_offset,
                    handle,
                    base
                );
                self.nvmap.unpin_handle(handle);
                Err(NvResult::BadValue)
            }
        }
    }

    // ── Remap ───────────────────────────────────────────────────────────

    /// Back or clear big-page ranges of sparse allocations.
    pub fn remap(&self, entries: &mut [IoctlRemapEntry]) -> NvResult {
        self.try_remap(entries).into()
    }

    fn try_remap(&self, entries: &[IoctlRemapEntry]) -> Result<(), NvResult> {
        log::debug!("nvhost-as-gpu: Remap num_entries={}", entries.len());

        let state = self.state.lock();
        let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
        let bits = vm.big_page_size_bits;

        for entry in entries {
            let va = (entry.as_offset_big_pages as u64) << bits;
            let size = (entry.big_pages as u64) << bits;

            let Some((_, allocation)) = containing_allocation(&state.allocations, va, size) else {
                log::warn!("nvhost-as-gpu: cannot remap into an unallocated region 0x{:X}+0x{:X}", va, size);
                return Err(NvResult::BadValue);
            };
            if !allocation.sparse {
                log::warn!("nvhost-as-gpu: cannot remap a non-sparse mapping at 0x{:X}", va);
                return Err(NvResult::BadValue);
            }

            if entry.handle == 0 {
                vm.gmmu.map_sparse(va, size, allocation.big_pages);
            } else {
                let dev_addr = self.pin_at(entry.handle, (entry.handle_offset_big_pages as u64) << bits, size)?;
                vm.gmmu.map(
                    va,
                    dev_addr,
                    size,
                    PteKind::from(entry.kind as u32),
                    allocation.big_pages,
                );
            }
        }
        Ok(())
    }

    // ── BindChannel / GetVARegions ──────────────────────────────────────

    /// Make a GPU channel execute in this address space.
    pub fn bind_channel(&self, params: &mut IoctlBindChannel) -> NvResult {
        self.try_bind_channel(params).into()
    }

    fn try_bind_channel(&self, params: &IoctlBindChannel) -> Result<(), NvResult> {
        log::debug!("nvhost-as-gpu: BindChannel fd={}", params.fd);

        let state = self.state.lock();
        let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
        if !self.gpu.bind_channel(params.fd, Arc::clone(&vm.gmmu)) {
            log::error!("nvhost-as-gpu: no GPU channel with fd={}", params.fd);
            return Err(NvResult::BadValue);
        }
        Ok(())
    }

    pub fn get_va_regions1(&self, params: &mut IoctlGetVaRegions) -> NvResult {
        self.try_get_va_regions(params).into()
    }

    /// Like [`Self::get_va_regions1`], also copying the regions to `regions`.
    pub fn get_va_regions3(&self, params: &mut IoctlGetVaRegions, regions: &mut [VaRegion]) -> NvResult {
        if let Err(err) = self.try_get_va_regions(params) {
            return err;
        }
        for (dst, src) in regions.iter_mut().zip(params.regions.iter()) {
            *dst = *src;
        }
        NvResult::Success
    }

    fn try_get_va_regions(&self, params: &mut IoctlGetVaRegions) -> Result<(), NvResult> {
        log::debug!(
            "nvhost-as-gpu: GetVARegions buf_addr=0x{:X}, buf_size=0x{:X}",
            params.buf_addr,
            params.buf_size
        );

        let state = self.state.lock();
        let vm = state.vm.as_ref().ok_or_else(not_initialised)?;
        params.buf_size = (params.regions.len() * VaRegion::SIZE) as u32;
        params.regions = vm.va_regions();
        Ok(())
    }

    fn log_ioctl(&self, kind: &str, command: Ioctl, input_len: usize, output_len: usize) {
        if self.settings.log_ioctls {
            log::debug!(
                "nvhost-as-gpu: {} {:?}, input={} bytes, output={} bytes",
                kind,
                command,
                input_len,
                output_len
            );
        }
    }
}

impl NvDevice for NvHostAsGpu {
    fn name(&self) -> &str {
        DEVICE_NAME
    }

    fn handle_fixed_request(&self, command: Ioctl, input: &[u8], output: &mut [u8]) -> NvResult {
        self.log_ioctl("fixed", command, input.len(), output.len());

        if command.group() == IOCTL_GROUP {
            match command.nr() {
                0x1 => return wrap_fixed(input, output, |p: &mut IoctlBindChannel| self.bind_channel(p)),
                0x2 => return wrap_fixed(input, output, |p: &mut IoctlAllocSpace| self.allocate_space(p)),
                0x3 => return wrap_fixed(input, output, |p: &mut IoctlFreeSpace| self.free_space(p)),
                0x5 => return wrap_fixed(input, output, |p: &mut IoctlUnmapBuffer| self.unmap_buffer(p)),
                0x6 => return wrap_fixed(input, output, |p: &mut IoctlMapBufferEx| self.map_buffer_ex(p)),
                0x8 => return wrap_fixed(input, output, |p: &mut IoctlGetVaRegions| self.get_va_regions1(p)),
                0x9 => return wrap_fixed(input, output, |p: &mut IoctlAllocAsEx| self.alloc_as_ex(p)),
                0x14 => return wrap_variable(input, output, |e: &mut [IoctlRemapEntry]| self.remap(e)),
                _ => {}
            }
        }

        log::error!("nvhost-as-gpu: unimplemented fixed ioctl {:?}", command);
        NvResult::NotImplemented
    }

    fn handle_variable_request(
        &self,
        command: Ioctl,
        input: &[u8],
        inline_input: &[u8],
        output: &mut [u8],
    ) -> NvResult {
        self.log_ioctl("variable", command, input.len() + inline_input.len(), output.len());
        log::error!("nvhost-as-gpu: unimplemented variable ioctl {:?}", command);
        NvResult::NotImplemented
    }

    fn handle_inline_request(
        &self,
        command: Ioctl,
        input: &[u8],
        output: &mut [u8],
        inline_output: &mut [u8],
    ) -> NvResult {
        self.log_ioctl("inline", command, input.len(), output.len() + inline_output.len());

        if command.group() == IOCTL_GROUP && command.nr() == 0x8 {
            return wrap_fixed_inline_out(
                input,
                output,
                inline_output,
                |p: &mut IoctlGetVaRegions, regions: &mut [VaRegion]| self.get_va_regions3(p, regions),
            );
        }

        log::error!("nvhost-as-gpu: unimplemented inline ioctl {:?}", command);
        NvResult::NotImplemented
    }

    fn on_open(&self, fd: DeviceFd) {
        log::debug!("nvhost-as-gpu: opened as fd={}", fd);
    }

    fn on_close(&self, fd: DeviceFd) {
        log::debug!("nvhost-as-gpu: closed fd={}", fd);
    }

    fn query_event(&self, event_id: u32) -> Option<u32> {
        log::error!("nvhost-as-gpu: unknown event id {}", event_id);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvmap::NvMap;
    use nvas_gpu::{GpuContext, GpuMemoryManager, PageState};

    const SMALL_VA_START: u64 = 0x20000 << VA_START_SHIFT;
    const BIG_VA_START: u64 = 1 << 34;
    const TINY_VA_START: u64 = 0x1_0000;
    const TINY_VA_SPLIT: u64 = 0x2_0000;
    const TINY_VA_END: u64 = 0x4_0000;

    fn settings() -> Settings {
        Settings {
            fatal_invariant_violations: false,
            ..Settings::default()
        }
    }

    struct Fixture {
        dev: NvHostAsGpu,
        gpu: Arc<GpuContext>,
        nvmap: Arc<NvMap>,
    }

    impl Fixture {
        fn new() -> Self {
            let gpu = Arc::new(GpuContext::new());
            let nvmap = Arc::new(NvMap::new());
            let dev = NvHostAsGpu::new(gpu.clone(), nvmap.clone(), settings());
            Self { dev, gpu, nvmap }
        }

        fn initialised() -> Self {
            let fixture = Self::new();
            let mut params = IoctlAllocAsEx {
                big_page_size: 0x20000,
                ..Default::default()
            };
            assert_eq!(fixture.dev.alloc_as_ex(&mut params), NvResult::Success);
            fixture
        }

        /// 16 small pages at [0x10000, 0x20000), 2 big pages of 64 KiB above.
        fn tiny() -> Self {
            let fixture = Self::new();
            let mut params = IoctlAllocAsEx {
                big_page_size: 0x10000,
                va_range_start: TINY_VA_START,
                va_range_split: TINY_VA_SPLIT,
                va_range_end: TINY_VA_END,
                ..Default::default()
            };
            assert_eq!(fixture.dev.alloc_as_ex(&mut params), NvResult::Success);
            fixture
        }

        fn gmmu(&self) -> Arc<GpuMemoryManager> {
            self.gpu.address_space(0).unwrap()
        }

        fn handle(&self, size: u64, align: u64, address: u64) -> HandleId {
            let id = self.nvmap.create_handle(size).unwrap();
            self.nvmap.alloc_handle(id, align, 0, address).unwrap();
            id
        }

        fn allocate(&self, pages: u32, page_size: u32, flags: MappingFlags) -> (NvResult, u64) {
            let mut params = IoctlAllocSpace {
                pages,
                page_size,
                flags,
                ..Default::default()
            };
            let result = self.dev.allocate_space(&mut params);
            (result, params.offset)
        }

        fn free(&self, offset: u64, pages: u32, page_size: u32) -> NvResult {
            self.dev.free_space(&mut IoctlFreeSpace {
                offset,
                pages,
                page_size,
            })
        }

        fn map(&self, params: IoctlMapBufferEx) -> (NvResult, u64) {
            let mut params = params;
            let result = self.dev.map_buffer_ex(&mut params);
            (result, params.offset as u64)
        }

        fn unmap(&self, offset: u64) -> NvResult {
            self.dev.unmap_buffer(&mut IoctlUnmapBuffer {
                offset: offset as i64,
            })
        }
    }

    // ── Initialisation ──────────────────────────────────────────────────

    #[test]
    fn test_operations_before_init_fail() {
        let f = Fixture::new();
        assert!(!f.dev.is_initialised());
        assert_eq!(f.allocate(1, 0x1000, MappingFlags::empty()).0, NvResult::BadValue);
        assert_eq!(f.free(0, 1, 0x1000), NvResult::BadValue);
        assert_eq!(f.unmap(0), NvResult::BadValue);
        assert_eq!(f.map(IoctlMapBufferEx::default()).0, NvResult::BadValue);
        assert_eq!(f.dev.remap(&mut []), NvResult::BadValue);
        assert_eq!(
            f.dev.bind_channel(&mut IoctlBindChannel { fd: 1 }),
            NvResult::BadValue
        );
        assert_eq!(
            f.dev.get_va_regions1(&mut IoctlGetVaRegions::default()),
            NvResult::BadValue
        );
    }

    #[test]
    fn test_init_default_layout() {
        let f = Fixture::initialised();
        assert!(f.dev.is_initialised());
        assert_eq!(f.gpu.address_space_count(), 1);

        let layout = f.gmmu().layout();
        assert_eq!(layout.address_space_bits, 37);
        assert_eq!(layout.split_address, BIG_VA_START);
        assert_eq!(layout.big_page_bits, 17);
        assert_eq!(layout.page_bits, 12);
    }

    #[test]
    fn test_init_zero_big_page_size_uses_default() {
        let f = Fixture::new();
        assert_eq!(
            f.dev.alloc_as_ex(&mut IoctlAllocAsEx::default()),
            NvResult::Success
        );
        assert_eq!(f.gmmu().layout().big_page_bits, 17);
    }

    #[test]
    fn test_init_rejects_unsupported_big_page_size() {
        let f = Fixture::new();
        for size in [0x1000, 0x30000, 0x40000] {
            let mut params = IoctlAllocAsEx {
                big_page_size: size,
                ..Default::default()
            };
            assert_eq!(f.dev.alloc_as_ex(&mut params), NvResult::BadValue);
        }
        assert!(!f.dev.is_initialised());
    }

    #[test]
    fn test_double_init_is_invalid_state() {
        let f = Fixture::initialised();
        let mut params = IoctlAllocAsEx::default();
        assert_eq!(f.dev.alloc_as_ex(&mut params), NvResult::InvalidState);
        assert_eq!(f.gpu.address_space_count(), 1);
    }

    #[test]
    #[should_panic(expected = "twice")]
    fn test_double_init_is_fatal_when_configured() {
        let gpu = Arc::new(GpuContext::new());
        let settings = Settings {
            fatal_invariant_violations: true,
            ..Settings::default()
        };
        let dev = NvHostAsGpu::new(gpu, Arc::new(NvMap::new()), settings);
        dev.alloc_as_ex(&mut IoctlAllocAsEx::default());
        dev.alloc_as_ex(&mut IoctlAllocAsEx::default());
    }

    #[test]
    fn test_init_custom_range() {
        let f = Fixture::new();
        let mut params = IoctlAllocAsEx {
            big_page_size: 0x10000,
            va_range_start: 0x100_0000,
            va_range_split: 1 << 32,
            va_range_end: 1 << 36,
            ..Default::default()
        };
        assert_eq!(f.dev.alloc_as_ex(&mut params), NvResult::Success);

        let mut regions = IoctlGetVaRegions::default();
        assert_eq!(f.dev.get_va_regions1(&mut regions), NvResult::Success);
        assert_eq!(regions.regions[0].offset, 0x100_0000);
        assert_eq!(regions.regions[0].pages, ((1u64 << 32) - 0x100_0000) >> 12);
        assert_eq!(regions.regions[1].offset, 1 << 32);
        assert_eq!(regions.regions[1].page_size, 0x10000);
        assert_eq!(regions.regions[1].pages, ((1u64 << 36) - (1 << 32)) >> 16);
        assert_eq!(f.gmmu().layout().address_space_bits, 36);
    }

    #[test]
    fn test_init_rejects_bad_custom_range() {
        let f = Fixture::new();
        let bad = [
            // start >= split
            (1u64 << 34, 1u64 << 34, 1u64 << 37),
            // split not big-page aligned
            (0x800_0000, (1 << 34) + 0x1000, 1 << 37),
            // wider than the GMMU
            (0x800_0000, 1 << 34, 1 << 41),
        ];
        for (start, split, end) in bad {
            let mut params = IoctlAllocAsEx {
                big_page_size: 0x20000,
                va_range_start: start,
                va_range_split: split,
                va_range_end: end,
                ..Default::default()
            };
            assert_eq!(f.dev.alloc_as_ex(&mut params), NvResult::BadValue);
        }
        assert!(!f.dev.is_initialised());
    }

    // ── AllocateSpace / FreeSpace ───────────────────────────────────────

    #[test]
    fn test_allocate_free_reallocate_same_offset() {
        let f = Fixture::initialised();
        let (result, a) = f.allocate(16, 0x1000, MappingFlags::empty());
        assert_eq!(result, NvResult::Success);
        assert_eq!(a, SMALL_VA_START);

        assert_eq!(f.free(a, 16, 0x1000), NvResult::Success);
        let (result, again) = f.allocate(16, 0x1000, MappingFlags::empty());
        assert_eq!(result, NvResult::Success);
        assert_eq!(again, a);
    }

    #[test]
    fn test_allocations_are_disjoint() {
        let f = Fixture::initialised();
        let (_, a) = f.allocate(16, 0x1000, MappingFlags::empty());
        let (_, b) = f.allocate(4, 0x1000, MappingFlags::empty());
        assert_eq!(b, a + 16 * 0x1000);

        let (_, big) = f.allocate(2, 0x20000, MappingFlags::empty());
        assert_eq!(big, BIG_VA_START);
    }

    #[test]
    fn test_allocate_rejects_unsupported_page_size() {
        let f = Fixture::initialised();
        assert_eq!(f.allocate(1, 0x2000, MappingFlags::empty()).0, NvResult::BadValue);
        assert_eq!(f.allocate(1, 0x10000, MappingFlags::empty()).0, NvResult::BadValue);
    }

    #[test]
    fn test_sparse_small_pages_not_implemented() {
        let f = Fixture::initialised();
        assert_eq!(
            f.allocate(1, 0x1000, MappingFlags::SPARSE).0,
            NvResult::NotImplemented
        );
    }

    #[test]
    fn test_allocate_zero_pages_rejected() {
        let f = Fixture::initialised();
        assert_eq!(f.allocate(0, 0x1000, MappingFlags::empty()).0, NvResult::BadValue);
    }

    #[test]
    fn test_allocate_fixed() {
        let f = Fixture::initialised();
        let offset = SMALL_VA_START + 0x10_0000;
        let mut params = IoctlAllocSpace {
            pages: 4,
            page_size: 0x1000,
            flags: MappingFlags::FIXED,
            offset,
            ..Default::default()
        };
        assert_eq!(f.dev.allocate_space(&mut params), NvResult::Success);
        assert_eq!(params.offset, offset);

        // Overlap, misalignment and out-of-range requests are rejected.
        for bad in [offset + 0x2000, offset + 0x800, SMALL_VA_START - 0x1000, BIG_VA_START - 0x1000] {
            let mut params = IoctlAllocSpace {
                pages: 4,
                page_size: 0x1000,
                flags: MappingFlags::FIXED,
                offset: bad,
                ..Default::default()
            };
            assert_eq!(f.dev.allocate_space(&mut params), NvResult::BadValue, "offset 0x{:X}", bad);
        }

        assert_eq!(f.free(offset, 4, 0x1000), NvResult::Success);
    }

    #[test]
    fn test_dynamic_allocation_skips_fixed() {
        let f = Fixture::initialised();
        let mut fixed = IoctlAllocSpace {
            pages: 4,
            page_size: 0x1000,
            flags: MappingFlags::FIXED,
            offset: SMALL_VA_START,
            ..Default::default()
        };
        assert_eq!(f.dev.allocate_space(&mut fixed), NvResult::Success);

        let (_, dynamic) = f.allocate(4, 0x1000, MappingFlags::empty());
        assert_eq!(dynamic, SMALL_VA_START + 0x4000);
    }

    #[test]
    fn test_free_space_mismatch_and_missing() {
        let f = Fixture::initialised();
        let (_, a) = f.allocate(16, 0x1000, MappingFlags::empty());
        assert_eq!(f.free(a, 8, 0x1000), NvResult::BadValue);
        assert_eq!(f.free(a + 0x1000, 16, 0x1000), NvResult::BadValue);
        assert_eq!(f.free(a, 16, 0x1000), NvResult::Success);
        assert_eq!(f.free(a, 16, 0x1000), NvResult::BadValue);
    }

    #[test]
    fn test_sparse_lifecycle_leaves_region_unmapped() {
        let f = Fixture::initialised();
        let (result, offset) = f.allocate(4, 0x20000, MappingFlags::SPARSE);
        assert_eq!(result, NvResult::Success);
        let size = 4 * 0x20000;
        let gmmu = f.gmmu();
        assert_eq!(gmmu.page_state(offset), PageState::Reserved { big_page: true });

        let handle = f.handle(0x20000, 0x20000, 0x8000_0000);
        let (result, _) = f.map(IoctlMapBufferEx {
            flags: MappingFlags::FIXED,
            handle,
            offset: (offset + 0x20000) as i64,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);
        assert_eq!(gmmu.translate(offset + 0x20000), Some(0x8000_0000));
        assert_eq!(f.nvmap.pin_count(handle), Some(1));

        assert_eq!(f.free(offset, 4, 0x20000), NvResult::Success);
        assert!(gmmu.is_fully_free(offset, size));
        assert_eq!(f.nvmap.pin_count(handle), Some(0));
    }

    // ── MapBufferEx / UnmapBuffer ───────────────────────────────────────

    #[test]
    fn test_map_dynamic_small_pages() {
        let f = Fixture::initialised();
        let handle = f.handle(0x2800, 0x1000, 0x4000_0000);
        let (result, offset) = f.map(IoctlMapBufferEx {
            handle,
            kind: 0xFE,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);
        assert_eq!(offset, SMALL_VA_START);

        let gmmu = f.gmmu();
        assert_eq!(gmmu.translate(offset + 0x2100), Some(0x4000_2100));
        assert!(gmmu.is_fully_mapped(offset, 0x3000));
        assert_eq!(gmmu.page_kind(offset), PteKind::GENERIC_16BX2);
        assert_eq!(f.nvmap.pin_count(handle), Some(1));

        assert_eq!(f.unmap(offset), NvResult::Success);
        assert!(gmmu.is_fully_free(offset, 0x3000));
        assert_eq!(f.nvmap.pin_count(handle), Some(0));

        // The VA range was returned to the allocator.
        let (_, again) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });
        assert_eq!(again, offset);
    }

    #[test]
    fn test_map_big_aligned_handle_uses_big_pages() {
        let f = Fixture::initialised();
        let handle = f.handle(0x30000, 0x20000, 0x1_0000_0000);
        let (result, offset) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);
        assert_eq!(offset, BIG_VA_START);
        assert_eq!(
            f.gmmu().page_state(offset + 0x30000),
            PageState::Mapped {
                dev_addr: 0x1_0003_0000,
                kind: PteKind::PITCH,
                big_page: true
            }
        );
    }

    #[test]
    fn test_map_with_buffer_offset_and_size() {
        let f = Fixture::initialised();
        let handle = f.handle(0x8000, 0x1000, 0x4000_0000);
        let (result, offset) = f.map(IoctlMapBufferEx {
            handle,
            buffer_offset: 0x2000,
            mapping_size: 0x1000,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);
        let gmmu = f.gmmu();
        assert_eq!(gmmu.translate(offset), Some(0x4000_2000));
        assert_eq!(gmmu.page_state(offset + 0x1000), PageState::Free);
    }

    #[test]
    fn test_map_unknown_or_unallocated_handle() {
        let f = Fixture::initialised();
        assert_eq!(
            f.map(IoctlMapBufferEx {
                handle: 42,
                ..Default::default()
            })
            .0,
            NvResult::BadValue
        );

        let unallocated = f.nvmap.create_handle(0x1000).unwrap();
        assert_eq!(
            f.map(IoctlMapBufferEx {
                handle: unallocated,
                ..Default::default()
            })
            .0,
            NvResult::BadValue
        );
        // The reserved range was released again.
        let (_, offset) = f.allocate(1, 0x1000, MappingFlags::empty());
        assert_eq!(offset, SMALL_VA_START);
    }

    #[test]
    fn test_allocate_space_exhausted() {
        let f = Fixture::tiny();
        assert_eq!(f.allocate(17, 0x1000, MappingFlags::empty()), (NvResult::InsufficientMemory, 0));
        assert_eq!(f.allocate(3, 0x10000, MappingFlags::SPARSE), (NvResult::InsufficientMemory, 0));
        assert!(f.gmmu().is_fully_free(TINY_VA_START, TINY_VA_END - TINY_VA_START));

        // Failed requests reserved nothing.
        assert_eq!(f.allocate(16, 0x1000, MappingFlags::empty()), (NvResult::Success, TINY_VA_START));
        assert_eq!(f.allocate(2, 0x10000, MappingFlags::empty()), (NvResult::Success, TINY_VA_SPLIT));
        assert_eq!(f.allocate(1, 0x1000, MappingFlags::empty()).0, NvResult::InsufficientMemory);
        assert_eq!(f.allocate(1, 0x10000, MappingFlags::empty()).0, NvResult::InsufficientMemory);

        assert_eq!(f.free(TINY_VA_START, 16, 0x1000), NvResult::Success);
        assert_eq!(f.free(TINY_VA_SPLIT, 2, 0x10000), NvResult::Success);
    }

    #[test]
    fn test_map_dynamic_exhausted() {
        let f = Fixture::tiny();
        let too_big = f.handle(0x1_1000, 0x1000, 0x4000_0000);
        let (result, offset) = f.map(IoctlMapBufferEx {
            handle: too_big,
            ..Default::default()
        });
        assert_eq!((result, offset), (NvResult::InsufficientMemory, 0));
        assert_eq!(f.nvmap.pin_count(too_big), Some(0));
        assert!(f.gmmu().is_fully_free(TINY_VA_START, TINY_VA_END - TINY_VA_START));

        let fits = f.handle(0x1_0000, 0x1000, 0x5000_0000);
        let (result, offset) = f.map(IoctlMapBufferEx {
            handle: fits,
            ..Default::default()
        });
        assert_eq!((result, offset), (NvResult::Success, TINY_VA_START));
        assert_eq!(f.nvmap.pin_count(fits), Some(1));

        let (result, _) = f.map(IoctlMapBufferEx {
            handle: too_big,
            mapping_size: 0x1000,
            ..Default::default()
        });
        assert_eq!(result, NvResult::InsufficientMemory);
        assert_eq!(f.nvmap.pin_count(too_big), Some(0));
        assert_eq!(f.gmmu().translate(TINY_VA_START), Some(0x5000_0000));
    }

    #[test]
    fn test_map_huge_size_is_insufficient_memory() {
        let f = Fixture::initialised();
        let handle = f.handle(0x1000, 0x1000, 0x4000_0000);
        for mapping_size in [u64::MAX, u64::MAX - 0xFFE, 1 << 62] {
            let (result, _) = f.map(IoctlMapBufferEx {
                handle,
                mapping_size,
                ..Default::default()
            });
            assert_eq!(result, NvResult::InsufficientMemory);
        }
        assert_eq!(f.nvmap.pin_count(handle), Some(0));

        // Nothing was reserved by the failed attempts.
        let (_, offset) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });
        assert_eq!(offset, SMALL_VA_START);
    }

    #[test]
    fn test_map_buffer_offset_overflow_releases_pin() {
        let f = Fixture::initialised();
        let high = f.handle(0x1000, 0x1000, 0xFFFF_FFFF_0000_0000);
        let (result, _) = f.map(IoctlMapBufferEx {
            handle: high,
            buffer_offset: 0x1_0000_0000,
            ..Default::default()
        });
        assert_eq!(result, NvResult::BadValue);
        assert_eq!(f.nvmap.pin_count(high), Some(0));

        let handle = f.handle(0x1000, 0x1000, 0x4000_0000);
        let (_, offset) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });
        assert_eq!(offset, SMALL_VA_START);
    }

    #[test]
    fn test_fixed_map_outside_allocation_is_bad_value() {
        let f = Fixture::initialised();
        let handle = f.handle(0x1000, 0x1000, 0x4000_0000);
        let (_, a) = f.allocate(4, 0x1000, MappingFlags::empty());

        for offset in [a + 0x10_0000, a - 0x1000, a + 0x3000] {
            let (result, _) = f.map(IoctlMapBufferEx {
                flags: MappingFlags::FIXED,
                handle,
                mapping_size: 0x2000,
                offset: offset as i64,
                ..Default::default()
            });
            assert_eq!(result, NvResult::BadValue, "offset 0x{:X}", offset);
        }
        assert_eq!(f.nvmap.pin_count(handle), Some(0));
    }

    #[test]
    fn test_fixed_map_inside_allocation() {
        let f = Fixture::initialised();
        let (_, a) = f.allocate(16, 0x1000, MappingFlags::empty());
        let handle = f.handle(0x2000, 0x1000, 0x4000_0000);

        let (result, offset) = f.map(IoctlMapBufferEx {
            flags: MappingFlags::FIXED,
            handle,
            offset: (a + 0x4000) as i64,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);
        assert_eq!(offset, a + 0x4000);
        assert_eq!(f.gmmu().translate(offset + 0x1000), Some(0x4000_1000));

        // Unmapping a fixed mapping keeps the allocation's VA reserved.
        assert_eq!(f.unmap(offset), NvResult::Success);
        assert_eq!(f.gmmu().page_state(offset), PageState::Free);
        let (_, next) = f.allocate(1, 0x1000, MappingFlags::empty());
        assert_eq!(next, a + 16 * 0x1000);

        // The allocation no longer references the mapping.
        assert_eq!(f.free(a, 16, 0x1000), NvResult::Success);
        assert_eq!(f.nvmap.pin_count(handle), Some(0));
    }

    #[test]
    fn test_fixed_map_at_same_offset_replaces() {
        let f = Fixture::initialised();
        let (_, a) = f.allocate(4, 0x1000, MappingFlags::empty());
        let first = f.handle(0x1000, 0x1000, 0x4000_0000);
        let second = f.handle(0x1000, 0x1000, 0x5000_0000);

        for handle in [first, second] {
            let (result, _) = f.map(IoctlMapBufferEx {
                flags: MappingFlags::FIXED,
                handle,
                offset: a as i64,
                ..Default::default()
            });
            assert_eq!(result, NvResult::Success);
        }
        assert_eq!(f.gmmu().translate(a), Some(0x5000_0000));
        assert_eq!(f.nvmap.pin_count(first), Some(0));
        assert_eq!(f.nvmap.pin_count(second), Some(1));
    }

    #[test]
    fn test_failed_fixed_map_keeps_existing_mapping() {
        let f = Fixture::initialised();
        let (_, a) = f.allocate(4, 0x1000, MappingFlags::empty());
        let mapped = f.handle(0x1000, 0x1000, 0x4000_0000);
        let (result, _) = f.map(IoctlMapBufferEx {
            flags: MappingFlags::FIXED,
            handle: mapped,
            offset: a as i64,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);

        let unallocated = f.nvmap.create_handle(0x1000).unwrap();
        let (result, _) = f.map(IoctlMapBufferEx {
            flags: MappingFlags::FIXED,
            handle: unallocated,
            offset: a as i64,
            ..Default::default()
        });
        assert_eq!(result, NvResult::BadValue);
        assert_eq!(f.gmmu().translate(a), Some(0x4000_0000));
        assert_eq!(f.nvmap.pin_count(mapped), Some(1));
        assert_eq!(f.nvmap.pin_count(unallocated), Some(0));

        assert_eq!(f.unmap(a), NvResult::Success);
        assert_eq!(f.nvmap.pin_count(mapped), Some(0));
    }

    #[test]
    fn test_handle_freed_after_unmap() {
        let f = Fixture::initialised();
        let handle = f.handle(0x2000, 0x1000, 0x4000_0000);
        let (_, offset) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });
        assert_eq!(f.unmap(offset), NvResult::Success);

        let info = f.nvmap.free_handle(handle).unwrap();
        assert_eq!(info.address, 0x4000_0000);
        assert_eq!(f.nvmap.pin_count(handle), None);

        let (result, _) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });
        assert_eq!(result, NvResult::BadValue);
        assert!(f.gmmu().is_fully_free(offset, 0x2000));
    }

    #[test]
    fn test_unmap_unknown_offset_is_tolerated() {
        let f = Fixture::initialised();
        assert_eq!(f.unmap(0xDEAD_0000), NvResult::Success);
    }

    #[test]
    fn test_unmap_in_sparse_allocation_restores_sparse() {
        let f = Fixture::initialised();
        let (_, offset) = f.allocate(2, 0x20000, MappingFlags::SPARSE);
        let handle = f.handle(0x20000, 0x20000, 0x8000_0000);
        f.map(IoctlMapBufferEx {
            flags: MappingFlags::FIXED,
            handle,
            offset: offset as i64,
            ..Default::default()
        });

        assert_eq!(f.unmap(offset), NvResult::Success);
        assert_eq!(
            f.gmmu().page_state(offset),
            PageState::Reserved { big_page: true }
        );
    }

    #[test]
    fn test_remap_flag_repoints_subrange() {
        let f = Fixture::initialised();
        let handle = f.handle(0x4000, 0x1000, 0x4000_0000);
        let (_, offset) = f.map(IoctlMapBufferEx {
            handle,
            ..Default::default()
        });

        let (result, _) = f.map(IoctlMapBufferEx {
            flags: MappingFlags::REMAP,
            kind: 0xFE,
            buffer_offset: 0x1000,
            mapping_size: 0x1000,
            offset: offset as i64,
            ..Default::default()
        });
        assert_eq!(result, NvResult::Success);
        let gmmu = f.gmmu();
        assert_eq!(gmmu.page_kind(offset + 0x1000), PteKind::GENERIC_16BX2);
        assert_eq!(gmmu.page_kind(offset), PteKind::PITCH);

        // Larger than the mapping, or no mapping at all.
        for (target, size) in [(offset, 0x5000), (offset + 0x1000, 0x1000)] {
            let (result, _) = f.map(IoctlMapBufferEx {
                flags: MappingFlags::REMAP,
                mapping_size: size,
                offset: target as i64,
                ..Default::default()
            });
            assert_eq!(result, NvResult::BadValue);
        }
    }

    // ── Remap ───────────────────────────────────────────────────────────

    #[test]
    fn test_remap_backs_and_clears_sparse_pages() {
        let f = Fixture::initialised();
        let (_, offset) = f.allocate(4, 0x20000, MappingFlags::SPARSE);
        let handle = f.handle(0x40000, 0x20000, 0x9000_0000);
        let first_big_page = (offset >> 17) as u32;

        let mut entries = [IoctlRemapEntry {
            handle,
            kind: 0xFE,
            handle_offset_big_pages: 1,
            as_offset_big_pages: first_big_page + 1,
            big_pages: 1,
            ..Default::default()
        }];
        assert_eq!(f.dev.remap(&mut entries), NvResult::Success);
        let gmmu = f.gmmu();
        assert_eq!(gmmu.translate(offset + 0x20000), Some(0x9002_0000));
        assert_eq!(gmmu.page_kind(offset + 0x20000), PteKind::GENERIC_16BX2);
        assert_eq!(gmmu.page_state(offset), PageState::Reserved { big_page: true });

        let mut clear = [IoctlRemapEntry {
            as_offset_big_pages: first_big_page + 1,
            big_pages: 1,
            ..Default::default()
        }];
        assert_eq!(f.dev.remap(&mut clear), NvResult::Success);
        assert_eq!(
            gmmu.page_state(offset + 0x20000),
            PageState::Reserved { big_page: true }
        );
    }

    #[test]
    fn test_remap_rejects_unallocated_and_non_sparse() {
        let f = Fixture::initialised();
        let (_, dense) = f.allocate(2, 0x20000, MappingFlags::empty());
        let (_, sparse) = f.allocate(2, 0x20000, MappingFlags::SPARSE);

        let cases = [
            // Not sparse.
            ((dense >> 17) as u32, 1),
            // Runs past the end of the sparse allocation.
            ((sparse >> 17) as u32 + 1, 2),
            // Nothing allocated there.
            ((sparse >> 17) as u32 + 64, 1),
        ];
        for (as_offset_big_pages, big_pages) in cases {
            let mut entries = [IoctlRemapEntry {
                as_offset_big_pages,
                big_pages,
                ..Default::default()
            }];
            assert_eq!(f.dev.remap(&mut entries), NvResult::BadValue);
        }
    }

    // ── BindChannel / GetVARegions ──────────────────────────────────────

    #[test]
    fn test_bind_channel() {
        let f = Fixture::initialised();
        f.gpu.open_channel(5);
        assert_eq!(
            f.dev.bind_channel(&mut IoctlBindChannel { fd: 5 }),
            NvResult::Success
        );
        let bound = f.gpu.channel_memory_manager(5).unwrap();
        assert_eq!(
            Arc::as_ptr(&bound) as *const (),
            Arc::as_ptr(&f.gmmu()) as *const ()
        );

        assert_eq!(
            f.dev.bind_channel(&mut IoctlBindChannel { fd: 6 }),
            NvResult::BadValue
        );

        f.gpu.close_channel(5);
        assert!(f.gpu.channel_memory_manager(5).is_none());
        assert_eq!(
            f.dev.bind_channel(&mut IoctlBindChannel { fd: 5 }),
            NvResult::BadValue
        );
    }

    #[test]
    fn test_get_va_regions_default_layout() {
        let f = Fixture::initialised();
        let mut params = IoctlGetVaRegions::default();
        assert_eq!(f.dev.get_va_regions1(&mut params), NvResult::Success);
        assert_eq!(params.buf_size, 48);
        assert_eq!(
            params.regions[0],
            VaRegion {
                offset: SMALL_VA_START,
                page_size: 0x1000,
                pad: 0,
                pages: 0x3F_8000,
            }
        );
        assert_eq!(
            params.regions[1],
            VaRegion {
                offset: BIG_VA_START,
                page_size: 0x20000,
                pad: 0,
                pages: 0xE_0000,
            }
        );

        let mut inline = [VaRegion::default(); 1];
        let mut params3 = IoctlGetVaRegions::default();
        assert_eq!(f.dev.get_va_regions3(&mut params3, &mut inline), NvResult::Success);
        assert_eq!(inline[0], params.regions[0]);
    }

    // ── Ioctl dispatch ──────────────────────────────────────────────────

    fn encode<T: IoctlRecord>(record: &T) -> Vec<u8> {
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_dispatch_fixed_requests() {
        let f = Fixture::new();
        let init = encode(&IoctlAllocAsEx {
            big_page_size: 0x20000,
            ..Default::default()
        });
        let mut out = vec![0u8; IoctlAllocAsEx::SIZE];
        let cmd = Ioctl::build(b'A', 0x9, IoctlAllocAsEx::SIZE as u16, true, true);
        assert_eq!(f.dev.handle_fixed_request(cmd, &init, &mut out), NvResult::Success);

        let alloc = encode(&IoctlAllocSpace {
            pages: 16,
            page_size: 0x1000,
            ..Default::default()
        });
        let mut out = vec![0u8; IoctlAllocSpace::SIZE];
        let cmd = Ioctl::build(b'A', 0x2, IoctlAllocSpace::SIZE as u16, true, true);
        assert_eq!(f.dev.handle_fixed_request(cmd, &alloc, &mut out), NvResult::Success);
        let result = IoctlAllocSpace::decode(&out).unwrap();
        assert_eq!(result.offset, SMALL_VA_START);
    }

    #[test]
    fn test_dispatch_unknown_is_not_implemented() {
        let f = Fixture::initialised();
        let mut out = [0u8; 8];
        for cmd in [
            Ioctl::build(b'A', 0x4, 8, true, true),
            Ioctl::build(b'H', 0x1, 8, true, true),
        ] {
            assert_eq!(f.dev.handle_fixed_request(cmd, &[], &mut out), NvResult::NotImplemented);
        }
        assert_eq!(
            f.dev.handle_variable_request(Ioctl::build(b'A', 0x1, 0, true, false), &[], &[], &mut out),
            NvResult::NotImplemented
        );
        assert!(f.dev.query_event(0).is_none());
    }

    #[test]
    fn test_dispatch_remap_and_inline_regions() {
        let f = Fixture::initialised();
        let (_, offset) = f.allocate(2, 0x20000, MappingFlags::SPARSE);
        let entry = encode(&IoctlRemapEntry {
            as_offset_big_pages: (offset >> 17) as u32,
            big_pages: 2,
            ..Default::default()
        });
        let mut out = vec![0u8; entry.len()];
        let cmd = Ioctl::build(b'A', 0x14, IoctlRemapEntry::SIZE as u16, true, false);
        assert_eq!(f.dev.handle_fixed_request(cmd, &entry, &mut out), NvResult::Success);

        let mut output = vec![0u8; IoctlGetVaRegions::SIZE];
        let mut inline = vec![0u8; 2 * VaRegion::SIZE];
        let cmd = Ioctl::build(b'A', 0x8, IoctlGetVaRegions::SIZE as u16, true, true);
        assert_eq!(
            f.dev.handle_inline_request(cmd, &[], &mut output, &mut inline),
            NvResult::Success
        );
        let big = VaRegion::decode(&inline[VaRegion::SIZE..]).unwrap();
        assert_eq!(big.offset, BIG_VA_START);
        assert_eq!(big.page_size, 0x20000);
    }

    // ── Collaborator call sequence ──────────────────────────────────────

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Map(u64, u64, u64, PteKind, bool),
        MapSparse(u64, u64, bool),
        Unmap(u64, u64),
    }

    #[derive(Default)]
    struct RecordingPageTable {
        calls: Mutex<Vec<Call>>,
    }

    impl GpuPageTable for RecordingPageTable {
        fn map(&self, gpu_addr: GPUVAddr, dev_addr: DAddr, size: u64, kind: PteKind, big_pages: bool) {
            self.calls
                .lock()
                .push(Call::Map(gpu_addr, dev_addr, size, kind, big_pages));
        }

        fn map_sparse(&self, gpu_addr: GPUVAddr, size: u64, big_pages: bool) {
            self.calls.lock().push(Call::MapSparse(gpu_addr, size, big_pages));
        }

        fn unmap(&self, gpu_addr: GPUVAddr, size: u64) {
            self.calls.lock().push(Call::Unmap(gpu_addr, size));
        }
    }

    struct RecordingHost {
        table: Arc<RecordingPageTable>,
    }

    impl GpuHost for RecordingHost {
        fn create_address_space(&self, _layout: AddressSpaceLayout) -> Arc<dyn GpuPageTable> {
            self.table.clone()
        }

        fn bind_channel(&self, _channel_fd: i32, _page_table: Arc<dyn GpuPageTable>) -> bool {
            true
        }
    }

    #[test]
    fn test_sparse_lifecycle_call_sequence() {
        let table = Arc::new(RecordingPageTable::default());
        let nvmap = Arc::new(NvMap::new());
        let host = Arc::new(RecordingHost {
            table: table.clone(),
        });
        let dev = NvHostAsGpu::new(host, nvmap.clone(), settings());
        dev.alloc_as_ex(&mut IoctlAllocAsEx::default());

        let mut alloc = IoctlAllocSpace {
            pages: 2,
            page_size: 0x20000,
            flags: MappingFlags::SPARSE,
            ..Default::default()
        };
        assert_eq!(dev.allocate_space(&mut alloc), NvResult::Success);
        let base = alloc.offset;

        let handle = nvmap.create_handle(0x20000).unwrap();
        nvmap.alloc_handle(handle, 0x20000, 0, 0x7000_0000).unwrap();
        let mut map = IoctlMapBufferEx {
            flags: MappingFlags::FIXED,
            kind: 0xFE,
            handle,
            offset: (base + 0x20000) as i64,
            ..Default::default()
        };
        assert_eq!(dev.map_buffer_ex(&mut map), NvResult::Success);

        let mut free = IoctlFreeSpace {
            offset: base,
            pages: 2,
            page_size: 0x20000,
        };
        assert_eq!(dev.free_space(&mut free), NvResult::Success);

        assert_eq!(
            *table.calls.lock(),
            vec![
                Call::MapSparse(base, 0x40000, true),
                Call::Map(base + 0x20000, 0x7000_0000, 0x20000, PteKind::GENERIC_16BX2, true),
                Call::MapSparse(base + 0x20000, 0x20000, true),
                Call::Unmap(base, 0x40000),
            ]
        );
    }
}
