use std::collections::VecDeque;
use std::ops::Range;

use tracing::{debug, trace};

use crate::backend::CacheBackend;
use crate::buffer::CacheBuffer;
use crate::config::CacheConfig;
use crate::engine::{ComputeLaunch, GraphicsRegs, PrimitiveTopology};
use crate::memory::{CpuMemory, GpuMemory};
use crate::page_table::{PageTable, PAGE_BITS, PAGE_SIZE};
use crate::ring::DelayedDestructionRing;
use crate::runtime::{BufferCopy, BufferRuntime, StagingMemory};
use crate::slot::SlotTable;
use crate::{
    BufferId, NUM_COMPUTE_UNIFORM_BUFFERS, NUM_GRAPHICS_UNIFORM_BUFFERS, NUM_STAGES,
    NUM_STORAGE_BUFFERS, NUM_TRANSFORM_FEEDBACK_BUFFERS, NUM_VERTEX_BUFFERS,
};

/// Uniform bindings at or below this size may skip the cached backing buffer
/// when the tick heuristic decides the cache is not earning its keep.
pub const DEFAULT_SKIP_CACHE_SIZE: u32 = 4096;

/// Frames a deleted buffer's host resources stay alive to outlast in-flight
/// GPU work.
const DESTRUCTION_RING_DEPTH: usize = 8;

/// Rolling window, in frames, of the uniform cache hit/shot counters.
const UNIFORM_CACHE_WINDOW: usize = 16;

/// Accumulated stream score beyond which a creation is treated as a
/// streaming arena and over-allocated. Empirically tuned together with
/// [`STREAM_LEAP_PAGES`].
const STREAM_LEAP_SCORE_THRESHOLD: u32 = 16;

/// Pages (16 MiB) appended past the requested end on a stream leap, to stop
/// a streaming region from being recreated over and over.
const STREAM_LEAP_PAGES: u64 = 256;

/// Bytes bound past a storage buffer's declared size. Some titles read out
/// of bounds; binding the whole remaining mapping would be correct but too
/// expensive, this much slack covers the known offenders.
const STORAGE_OVERBIND_BYTES: u32 = 0xc000;

/// A register-slot to guest-memory association, realized as a host bind
/// call once resolved. `buffer_id` is filled in lazily by the update pass;
/// null means unresolved or intentionally null.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Binding {
    pub cpu_addr: u64,
    pub size: u32,
    pub buffer_id: BufferId,
}

impl Binding {
    pub const NULL: Binding = Binding {
        cpu_addr: 0,
        size: 0,
        buffer_id: BufferId::NULL,
    };
}

/// Result of an overlap walk: the minimal span covering the request and
/// every transitively-touching registered buffer.
struct OverlapResult {
    ids: Vec<BufferId>,
    begin: u64,
    end: u64,
    has_stream_leap: bool,
}

/// Iterate the set bits of `mask`, low to high.
fn for_each_enabled_bit(mut mask: u32, mut f: impl FnMut(u32)) {
    while mask != 0 {
        f(mask.trailing_zeros());
        mask &= mask - 1;
    }
}

/// Replace `old` with `new` in a download list, coalescing duplicates of
/// `new` down to the first occurrence.
fn replace_download_id(list: &mut Vec<BufferId>, old: BufferId, new: BufferId) {
    for id in list.iter_mut() {
        if *id == old {
            *id = new;
        }
    }
    let mut seen = false;
    list.retain(|&id| id != new || !std::mem::replace(&mut seen, true));
}

/// Guest-memory-backed buffer cache.
///
/// Owns the page-indexed buffer directory, the per-draw binding state and
/// the upload/download machinery for one rasterizer. All entry points take
/// `&mut self`: the cache is single-threaded and cooperatively scheduled,
/// and exclusive access is the caller's contract (callers sharing it across
/// threads serialize behind their own lock).
pub struct BufferCache<B: CacheBackend> {
    runtime: B::Runtime,
    gpu_memory: B::GpuMemory,
    cpu_memory: B::CpuMemory,
    config: CacheConfig,

    graphics: GraphicsRegs,
    compute: ComputeLaunch,

    slot_buffers: SlotTable<B::Buffer>,
    delayed_destruction_ring: DelayedDestructionRing<B::Buffer, DESTRUCTION_RING_DEPTH>,
    page_table: PageTable,

    /// Guests change the index count without raising the index-buffer dirty
    /// flag; the update pass compares against this to catch it.
    last_index_count: u32,

    index_buffer: Binding,
    vertex_buffers: [Binding; NUM_VERTEX_BUFFERS],
    uniform_buffers: [[Binding; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_STAGES],
    storage_buffers: [[Binding; NUM_STORAGE_BUFFERS]; NUM_STAGES],
    transform_feedback_buffers: [Binding; NUM_TRANSFORM_FEEDBACK_BUFFERS],
    compute_uniform_buffers: [Binding; NUM_COMPUTE_UNIFORM_BUFFERS],
    compute_storage_buffers: [Binding; NUM_STORAGE_BUFFERS],

    enabled_uniform_buffers: [u32; NUM_STAGES],
    enabled_compute_uniform_buffers: u32,

    enabled_storage_buffers: [u32; NUM_STAGES],
    written_storage_buffers: [u32; NUM_STAGES],
    enabled_compute_storage_buffers: u32,
    written_compute_storage_buffers: u32,

    fast_bound_uniform_buffers: [u32; NUM_STAGES],

    uniform_cache_hits: [u32; UNIFORM_CACHE_WINDOW],
    uniform_cache_shots: [u32; UNIFORM_CACHE_WINDOW],
    uniform_buffer_skip_cache_size: u32,

    has_deleted_buffers: bool,

    /// Only consulted on backends with persistent uniform bindings.
    dirty_uniform_buffers: [u32; NUM_STAGES],

    cached_write_buffer_ids: Vec<BufferId>,

    uncommitted_downloads: Vec<BufferId>,
    committed_downloads: VecDeque<Vec<BufferId>>,

    /// Growable scratch for immediate copies and non-contiguous reads.
    immediate_buffer: Vec<u8>,
}

impl<B: CacheBackend> BufferCache<B> {
    pub fn new(
        mut runtime: B::Runtime,
        gpu_memory: B::GpuMemory,
        cpu_memory: B::CpuMemory,
        config: CacheConfig,
    ) -> Self {
        let mut slot_buffers = SlotTable::new();
        // Slot 0 is the null buffer every unresolved binding points at.
        let null_id = slot_buffers.insert(runtime.create_null_buffer());
        debug_assert!(null_id.is_null());
        Self {
            runtime,
            gpu_memory,
            cpu_memory,
            config,
            graphics: GraphicsRegs::default(),
            compute: ComputeLaunch::default(),
            slot_buffers,
            delayed_destruction_ring: DelayedDestructionRing::new(),
            page_table: PageTable::new(),
            last_index_count: 0,
            index_buffer: Binding::NULL,
            vertex_buffers: [Binding::NULL; NUM_VERTEX_BUFFERS],
            uniform_buffers: [[Binding::NULL; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_STAGES],
            storage_buffers: [[Binding::NULL; NUM_STORAGE_BUFFERS]; NUM_STAGES],
            transform_feedback_buffers: [Binding::NULL; NUM_TRANSFORM_FEEDBACK_BUFFERS],
            compute_uniform_buffers: [Binding::NULL; NUM_COMPUTE_UNIFORM_BUFFERS],
            compute_storage_buffers: [Binding::NULL; NUM_STORAGE_BUFFERS],
            enabled_uniform_buffers: [0; NUM_STAGES],
            enabled_compute_uniform_buffers: 0,
            enabled_storage_buffers: [0; NUM_STAGES],
            written_storage_buffers: [0; NUM_STAGES],
            enabled_compute_storage_buffers: 0,
            written_compute_storage_buffers: 0,
            fast_bound_uniform_buffers: [0; NUM_STAGES],
            uniform_cache_hits: [0; UNIFORM_CACHE_WINDOW],
            uniform_cache_shots: [0; UNIFORM_CACHE_WINDOW],
            uniform_buffer_skip_cache_size: DEFAULT_SKIP_CACHE_SIZE,
            has_deleted_buffers: false,
            dirty_uniform_buffers: [0; NUM_STAGES],
            cached_write_buffer_ids: Vec::new(),
            uncommitted_downloads: Vec::new(),
            committed_downloads: VecDeque::new(),
            immediate_buffer: Vec::new(),
        }
    }

    /// Advance one frame: age the uniform cache counters, re-evaluate the
    /// skip-cache policy and tick the destruction ring.
    pub fn tick_frame(&mut self) {
        let hits: u32 = self.uniform_cache_hits.iter().sum();
        let shots: u32 = self.uniform_cache_shots.iter().sum();
        self.uniform_cache_hits.copy_within(0..UNIFORM_CACHE_WINDOW - 1, 1);
        self.uniform_cache_shots.copy_within(0..UNIFORM_CACHE_WINDOW - 1, 1);
        self.uniform_cache_hits[0] = 0;
        self.uniform_cache_shots[0] = 0;

        // Prefer the skip path when fewer than ~98% of uniform uploads avoid
        // work. An empty window is no evidence either way; keep skipping.
        let skip_preferred = shots == 0 || hits * 256 < shots * 251;
        self.uniform_buffer_skip_cache_size = if skip_preferred {
            DEFAULT_SKIP_CACHE_SIZE
        } else {
            0
        };

        self.delayed_destruction_ring.tick();
    }

    /// Note a guest CPU write so affected ranges re-upload before their next
    /// GPU use.
    pub fn write_memory(&mut self, cpu_addr: u64, size: u64) {
        let page_end = (cpu_addr + size).div_ceil(PAGE_SIZE);
        let mut page = cpu_addr >> PAGE_BITS;
        while page < page_end {
            let buffer_id = self.page_table.get(page);
            if buffer_id.is_null() {
                page += 1;
                continue;
            }
            let buffer = &mut self.slot_buffers[buffer_id];
            buffer.mark_region_as_cpu_modified(cpu_addr, size);
            page = (buffer.cpu_addr() + buffer.size_bytes()).div_ceil(PAGE_SIZE);
        }
    }

    /// Note a guest CPU write the rasterizer classified as cached: the dirty
    /// bits are batched until [`flush_cached_writes`](Self::flush_cached_writes).
    pub fn cached_write_memory(&mut self, cpu_addr: u64, size: u64) {
        let page_end = (cpu_addr + size).div_ceil(PAGE_SIZE);
        let mut page = cpu_addr >> PAGE_BITS;
        while page < page_end {
            let buffer_id = self.page_table.get(page);
            if buffer_id.is_null() {
                page += 1;
                continue;
            }
            let buffer = &mut self.slot_buffers[buffer_id];
            if !buffer.has_cached_writes() {
                self.cached_write_buffer_ids.push(buffer_id);
            }
            buffer.cached_cpu_write(cpu_addr, size);
            page = (buffer.cpu_addr() + buffer.size_bytes()).div_ceil(PAGE_SIZE);
        }
    }

    /// Synchronously retrieve every GPU-written range intersecting
    /// `[cpu_addr, cpu_addr + size)` back into guest memory.
    pub fn download_memory(&mut self, cpu_addr: u64, size: u64) {
        let page_end = (cpu_addr + size).div_ceil(PAGE_SIZE);
        let mut page = cpu_addr >> PAGE_BITS;
        while page < page_end {
            let buffer_id = self.page_table.get(page);
            if buffer_id.is_null() {
                page += 1;
                continue;
            }
            let buffer = &mut self.slot_buffers[buffer_id];
            let next_page = (buffer.cpu_addr() + buffer.size_bytes()).div_ceil(PAGE_SIZE);

            let mut copies = Vec::new();
            let mut total_size_bytes = 0u64;
            let mut largest_copy = 0u64;
            buffer.for_each_download_range_in(cpu_addr, size, |range_offset, range_size| {
                copies.push(BufferCopy {
                    src_offset: range_offset,
                    dst_offset: total_size_bytes,
                    size: range_size,
                });
                total_size_bytes += range_size;
                largest_copy = largest_copy.max(range_size);
            });
            if total_size_bytes != 0 {
                self.download_buffer_copies(buffer_id, copies, total_size_bytes, largest_copy);
            }
            page = next_page;
        }
    }

    /// Record a uniform buffer binding for `(stage, index)`. The buffer id is
    /// resolved lazily by the next update pass.
    pub fn bind_graphics_uniform_buffer(&mut self, stage: usize, index: u32, gpu_addr: u64, size: u32) {
        let cpu_addr = self.gpu_memory.gpu_to_cpu_address(gpu_addr).unwrap_or(0);
        self.uniform_buffers[stage][index as usize] = Binding {
            cpu_addr,
            size,
            buffer_id: BufferId::NULL,
        };
    }

    pub fn disable_graphics_uniform_buffer(&mut self, stage: usize, index: u32) {
        self.uniform_buffers[stage][index as usize] = Binding::NULL;
    }

    /// Resolve every graphics binding to a buffer id, retrying until a full
    /// pass completes without deleting a buffer: resolving one binding can
    /// absorb a buffer another binding already resolved to.
    pub fn update_graphics_buffers(&mut self, is_indexed: bool) {
        loop {
            self.has_deleted_buffers = false;
            self.do_update_graphics_buffers(is_indexed);
            if !self.has_deleted_buffers {
                break;
            }
        }
    }

    /// Compute mirror of [`update_graphics_buffers`](Self::update_graphics_buffers).
    pub fn update_compute_buffers(&mut self) {
        loop {
            self.has_deleted_buffers = false;
            self.do_update_compute_buffers();
            if !self.has_deleted_buffers {
                break;
            }
        }
    }

    /// Synchronize and bind index, vertex and transform feedback buffers for
    /// the current draw.
    pub fn bind_host_geometry_buffers(&mut self, is_indexed: bool) {
        if is_indexed {
            self.bind_host_index_buffer();
        } else if !B::HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT
            && self.graphics.topology == PrimitiveTopology::Quads
        {
            self.runtime.bind_quad_array_index_buffer(
                self.graphics.vertex_buffer_first,
                self.graphics.vertex_buffer_count,
            );
        }
        self.bind_host_vertex_buffers();
        self.bind_host_transform_feedback_buffers();
    }

    /// Synchronize and bind the uniform and storage buffers of one stage.
    pub fn bind_host_stage_buffers(&mut self, stage: usize) {
        self.bind_host_graphics_uniform_buffers(stage);
        self.bind_host_graphics_storage_buffers(stage);
    }

    /// Synchronize and bind the compute uniform and storage buffers.
    pub fn bind_host_compute_buffers(&mut self) {
        self.bind_host_compute_uniform_buffers();
        self.bind_host_compute_storage_buffers();
    }

    pub fn set_enabled_uniform_buffers(&mut self, stage: usize, enabled: u32) {
        if B::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS
            && self.enabled_uniform_buffers[stage] != enabled
        {
            self.dirty_uniform_buffers[stage] = !0;
        }
        self.enabled_uniform_buffers[stage] = enabled;
    }

    pub fn set_enabled_compute_uniform_buffers(&mut self, enabled: u32) {
        self.enabled_compute_uniform_buffers = enabled;
    }

    pub fn unbind_graphics_storage_buffers(&mut self, stage: usize) {
        self.enabled_storage_buffers[stage] = 0;
        self.written_storage_buffers[stage] = 0;
    }

    /// Declare a storage buffer slot, dereferencing its descriptor through
    /// the stage's const buffer.
    pub fn bind_graphics_storage_buffer(
        &mut self,
        stage: usize,
        ssbo_index: usize,
        cbuf_index: u32,
        cbuf_offset: u32,
        is_written: bool,
    ) {
        self.enabled_storage_buffers[stage] |= 1 << ssbo_index;
        self.written_storage_buffers[stage] |= u32::from(is_written) << ssbo_index;

        let cbuf_addr = self.graphics.const_buffer_addresses[stage][cbuf_index as usize];
        let ssbo_addr = cbuf_addr + u64::from(cbuf_offset);
        self.storage_buffers[stage][ssbo_index] = self.storage_buffer_binding(ssbo_addr);
    }

    pub fn unbind_compute_storage_buffers(&mut self) {
        self.enabled_compute_storage_buffers = 0;
        self.written_compute_storage_buffers = 0;
    }

    /// Compute mirror of [`bind_graphics_storage_buffer`](Self::bind_graphics_storage_buffer),
    /// sourced from the launch descriptor.
    pub fn bind_compute_storage_buffer(
        &mut self,
        ssbo_index: usize,
        cbuf_index: u32,
        cbuf_offset: u32,
        is_written: bool,
    ) {
        self.enabled_compute_storage_buffers |= 1 << ssbo_index;
        self.written_compute_storage_buffers |= u32::from(is_written) << ssbo_index;

        debug_assert!(
            (self.compute.const_buffer_enable_mask >> cbuf_index) & 1 != 0,
            "storage buffer descriptor dereferenced through a disabled const buffer"
        );
        let cbuf_addr = self.compute.const_buffers[cbuf_index as usize].address;
        let ssbo_addr = cbuf_addr + u64::from(cbuf_offset);
        self.compute_storage_buffers[ssbo_index] = self.storage_buffer_binding(ssbo_addr);
    }

    /// Apply every batched cached write to the dirty planes.
    pub fn flush_cached_writes(&mut self) {
        for buffer_id in std::mem::take(&mut self.cached_write_buffer_ids) {
            self.slot_buffers[buffer_id].flush_cached_writes();
        }
    }

    /// True when there are written buffers waiting for
    /// [`commit_async_flushes`](Self::commit_async_flushes).
    pub fn has_uncommitted_flushes(&self) -> bool {
        !self.uncommitted_downloads.is_empty()
    }

    /// True when the caller should wait for deferred downloads to pop.
    pub fn should_wait_async_flushes(&self) -> bool {
        self.committed_downloads
            .front()
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Seal the current batch of deferred downloads. Batches pop in FIFO
    /// order relative to commits.
    pub fn commit_async_flushes(&mut self) {
        let batch = std::mem::take(&mut self.uncommitted_downloads);
        self.committed_downloads.push_front(batch);
    }

    /// Execute the oldest committed download batch.
    pub fn pop_async_flushes(&mut self) {
        let Some(download_ids) = self.committed_downloads.pop_back() else {
            return;
        };
        if download_ids.is_empty() {
            return;
        }
        let mut downloads = Vec::new();
        let mut total_size_bytes = 0u64;
        let mut largest_copy = 0u64;
        for &buffer_id in &download_ids {
            self.slot_buffers[buffer_id].for_each_download_range(|range_offset, range_size| {
                downloads.push((
                    BufferCopy {
                        src_offset: range_offset,
                        dst_offset: total_size_bytes,
                        size: range_size,
                    },
                    buffer_id,
                ));
                total_size_bytes += range_size;
                largest_copy = largest_copy.max(range_size);
            });
        }
        if downloads.is_empty() {
            return;
        }
        trace!(
            buffers = download_ids.len(),
            bytes = total_size_bytes,
            "popping deferred downloads"
        );
        if B::USE_MEMORY_MAPS {
            let mut staging = self.runtime.download_staging_buffer(total_size_bytes);
            let staging_offset = staging.offset();
            for (copy, buffer_id) in &mut downloads {
                copy.dst_offset += staging_offset;
                let buffer = &self.slot_buffers[*buffer_id];
                self.runtime
                    .copy_to_staging(&mut staging, buffer, std::slice::from_ref(copy));
            }
            self.runtime.finish();
            for (copy, buffer_id) in &downloads {
                let buffer = &self.slot_buffers[*buffer_id];
                let cpu_addr = buffer.cpu_addr() + copy.src_offset;
                let mapped_offset = (copy.dst_offset - staging_offset) as usize;
                let bytes = &staging.mapped()[mapped_offset..mapped_offset + copy.size as usize];
                self.cpu_memory.write_block_unsafe(cpu_addr, bytes);
            }
        } else {
            if self.immediate_buffer.len() < largest_copy as usize {
                self.immediate_buffer.resize(largest_copy as usize, 0);
            }
            for (copy, buffer_id) in &downloads {
                let size = copy.size as usize;
                let buffer = &self.slot_buffers[*buffer_id];
                buffer.immediate_download(copy.src_offset, &mut self.immediate_buffer[..size]);
                let cpu_addr = buffer.cpu_addr() + copy.src_offset;
                self.cpu_memory
                    .write_block_unsafe(cpu_addr, &self.immediate_buffer[..size]);
            }
        }
    }

    /// True when any buffer overlapping the range holds GPU writes that have
    /// not been downloaded.
    pub fn is_region_gpu_modified(&self, cpu_addr: u64, size: u64) -> bool {
        let page_end = (cpu_addr + size).div_ceil(PAGE_SIZE);
        let mut page = cpu_addr >> PAGE_BITS;
        while page < page_end {
            let buffer_id = self.page_table.get(page);
            if buffer_id.is_null() {
                page += 1;
                continue;
            }
            let buffer = &self.slot_buffers[buffer_id];
            if buffer.is_region_gpu_modified(cpu_addr, size) {
                return true;
            }
            page = (buffer.cpu_addr() + buffer.size_bytes()).div_ceil(PAGE_SIZE);
        }
        false
    }

    pub fn graphics(&self) -> &GraphicsRegs {
        &self.graphics
    }

    /// The 3D register mirror; the command decoder updates it and raises the
    /// matching dirty flags.
    pub fn graphics_mut(&mut self) -> &mut GraphicsRegs {
        &mut self.graphics
    }

    pub fn compute(&self) -> &ComputeLaunch {
        &self.compute
    }

    /// The compute launch descriptor mirror.
    pub fn compute_mut(&mut self) -> &mut ComputeLaunch {
        &mut self.compute
    }

    pub fn runtime(&self) -> &B::Runtime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut B::Runtime {
        &mut self.runtime
    }

    /// Current skip-cache threshold chosen by the tick heuristic.
    pub fn uniform_buffer_skip_cache_size(&self) -> u32 {
        self.uniform_buffer_skip_cache_size
    }

    // Diagnostic surface, used by debuggers and the test-suite.

    /// Registered buffers as `(id, cpu_addr, size_bytes)`, excluding the
    /// null buffer.
    pub fn registered_buffers(&self) -> Vec<(BufferId, u64, u64)> {
        self.slot_buffers
            .ids()
            .filter(|id| !id.is_null())
            .map(|id| {
                let buffer = &self.slot_buffers[id];
                (id, buffer.cpu_addr(), buffer.size_bytes())
            })
            .collect()
    }

    /// Directory entry for one page.
    pub fn buffer_id_for_page(&self, page: u64) -> BufferId {
        self.page_table.get(page)
    }

    pub fn index_buffer_binding(&self) -> Binding {
        self.index_buffer
    }

    pub fn vertex_buffer_binding(&self, index: usize) -> Binding {
        self.vertex_buffers[index]
    }

    pub fn graphics_uniform_binding(&self, stage: usize, index: usize) -> Binding {
        self.uniform_buffers[stage][index]
    }

    pub fn graphics_storage_binding(&self, stage: usize, index: usize) -> Binding {
        self.storage_buffers[stage][index]
    }

    pub fn transform_feedback_binding(&self, index: usize) -> Binding {
        self.transform_feedback_buffers[index]
    }

    pub fn compute_uniform_binding(&self, index: usize) -> Binding {
        self.compute_uniform_buffers[index]
    }

    pub fn compute_storage_binding(&self, index: usize) -> Binding {
        self.compute_storage_buffers[index]
    }

    pub fn uncommitted_download_ids(&self) -> &[BufferId] {
        &self.uncommitted_downloads
    }

    /// Committed download batches, oldest (next to pop) last.
    pub fn committed_download_batches(&self) -> impl Iterator<Item = &[BufferId]> {
        self.committed_downloads.iter().map(Vec::as_slice)
    }

    fn bind_host_index_buffer(&mut self) {
        let binding = self.index_buffer;
        self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);
        let buffer = &self.slot_buffers[binding.buffer_id];
        let offset = buffer.offset(binding.cpu_addr);
        if B::HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT {
            self.runtime.bind_index_buffer(buffer, offset, binding.size);
        } else {
            let index_array = self.graphics.index_array;
            self.runtime.bind_converted_index_buffer(
                self.graphics.topology,
                index_array.format,
                index_array.first,
                index_array.count,
                buffer,
                offset,
                binding.size,
            );
        }
    }

    fn bind_host_vertex_buffers(&mut self) {
        for index in 0..NUM_VERTEX_BUFFERS {
            let binding = self.vertex_buffers[index];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);
            if !self.graphics.dirty.vertex_buffer[index] {
                continue;
            }
            self.graphics.dirty.vertex_buffer[index] = false;

            let stride = self.graphics.vertex_arrays[index].stride;
            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            self.runtime
                .bind_vertex_buffer(index as u32, buffer, offset, binding.size, stride);
        }
    }

    fn bind_host_graphics_uniform_buffers(&mut self, stage: usize) {
        let mut dirty = !0u32;
        if B::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
            dirty = std::mem::take(&mut self.dirty_uniform_buffers[stage]);
        }
        let mut binding_index = 0u32;
        for_each_enabled_bit(self.enabled_uniform_buffers[stage], |index| {
            let needs_bind = (dirty >> index) & 1 != 0;
            self.bind_host_graphics_uniform_buffer(stage, index, binding_index, needs_bind);
            if B::NEEDS_BIND_UNIFORM_INDEX {
                binding_index += 1;
            }
        });
    }

    fn bind_host_graphics_uniform_buffer(
        &mut self,
        stage: usize,
        index: u32,
        binding_index: u32,
        needs_bind: bool,
    ) {
        let binding = self.uniform_buffers[stage][index as usize];
        let cpu_addr = binding.cpu_addr;
        let size = binding.size;
        let use_fast_buffer = !binding.buffer_id.is_null()
            && size <= self.uniform_buffer_skip_cache_size
            && !self.slot_buffers[binding.buffer_id].is_region_gpu_modified(cpu_addr, u64::from(size));
        if use_fast_buffer {
            if B::IS_OPENGL && self.runtime.has_fast_buffer_sub_data() {
                // Driver-side inline path: bind once, then push payloads.
                if !self.has_fast_uniform_buffer_bound(stage, binding_index) {
                    self.fast_bound_uniform_buffers[stage] |= 1 << binding_index;
                    self.runtime.bind_fast_uniform_buffer(stage, binding_index, size);
                }
                self.push_fast_uniform_bytes(stage, binding_index, cpu_addr, size);
                return;
            }
            self.fast_bound_uniform_buffers[stage] |= 1 << binding_index;

            // Stream buffer path for hosts that stall on inline sub-data.
            let span = self.runtime.bind_mapped_uniform_buffer(stage, binding_index, size);
            self.cpu_memory.read_block_unsafe(cpu_addr, span);
            return;
        }
        // Cached path.
        let hit = self.synchronize_buffer(binding.buffer_id, cpu_addr, size);
        if hit {
            self.uniform_cache_hits[0] += 1;
        }
        self.uniform_cache_shots[0] += 1;

        if !needs_bind && !self.has_fast_uniform_buffer_bound(stage, binding_index) {
            // Nothing changed and the slot does not hold the fast buffer; a
            // fast-bound slot must be rebound even when clean, the host still
            // has the fast version bound.
            return;
        }
        self.fast_bound_uniform_buffers[stage] &= !(1 << binding_index);

        let buffer = &self.slot_buffers[binding.buffer_id];
        let offset = buffer.offset(cpu_addr);
        self.runtime
            .bind_uniform_buffer(stage, binding_index, buffer, offset, size);
    }

    /// Feed guest bytes to the driver fast-uniform path, directly when the
    /// range is contiguous and through scratch otherwise.
    fn push_fast_uniform_bytes(&mut self, stage: usize, binding_index: u32, cpu_addr: u64, size: u32) {
        let pushed = self
            .cpu_memory
            .with_contiguous(cpu_addr, u64::from(size), |span| {
                self.runtime.push_fast_uniform_buffer(stage, binding_index, span);
            })
            .is_some();
        if !pushed {
            let size = size as usize;
            if self.immediate_buffer.len() < size {
                self.immediate_buffer.resize(size, 0);
            }
            self.cpu_memory
                .read_block_unsafe(cpu_addr, &mut self.immediate_buffer[..size]);
            self.runtime
                .push_fast_uniform_buffer(stage, binding_index, &self.immediate_buffer[..size]);
        }
    }

    fn bind_host_graphics_storage_buffers(&mut self, stage: usize) {
        let written_mask = self.written_storage_buffers[stage];
        let mut binding_index = 0u32;
        for_each_enabled_bit(self.enabled_storage_buffers[stage], |index| {
            let binding = self.storage_buffers[stage][index as usize];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);

            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            let is_written = (written_mask >> index) & 1 != 0;
            self.runtime
                .bind_storage_buffer(stage, binding_index, buffer, offset, binding.size, is_written);
            if B::NEEDS_BIND_STORAGE_INDEX {
                binding_index += 1;
            }
        });
    }

    fn bind_host_transform_feedback_buffers(&mut self) {
        if !self.graphics.tfb_enabled {
            return;
        }
        for index in 0..NUM_TRANSFORM_FEEDBACK_BUFFERS {
            let binding = self.transform_feedback_buffers[index];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);

            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            self.runtime
                .bind_transform_feedback_buffer(index as u32, buffer, offset, binding.size);
        }
    }

    fn bind_host_compute_uniform_buffers(&mut self) {
        if B::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
            // Compute binds clobber the persistent graphics binding points.
            self.dirty_uniform_buffers = [!0; NUM_STAGES];
        }
        let mut binding_index = 0u32;
        for_each_enabled_bit(self.enabled_compute_uniform_buffers, |index| {
            let binding = self.compute_uniform_buffers[index as usize];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);

            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            self.runtime
                .bind_compute_uniform_buffer(binding_index, buffer, offset, binding.size);
            if B::NEEDS_BIND_UNIFORM_INDEX {
                binding_index += 1;
            }
        });
    }

    fn bind_host_compute_storage_buffers(&mut self) {
        let written_mask = self.written_compute_storage_buffers;
        let mut binding_index = 0u32;
        for_each_enabled_bit(self.enabled_compute_storage_buffers, |index| {
            let binding = self.compute_storage_buffers[index as usize];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);

            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            let is_written = (written_mask >> index) & 1 != 0;
            self.runtime
                .bind_compute_storage_buffer(binding_index, buffer, offset, binding.size, is_written);
            if B::NEEDS_BIND_STORAGE_INDEX {
                binding_index += 1;
            }
        });
    }

    fn do_update_graphics_buffers(&mut self, is_indexed: bool) {
        if is_indexed {
            self.update_index_buffer();
        }
        self.update_vertex_buffers();
        self.update_transform_feedback_buffers();
        for stage in 0..NUM_STAGES {
            self.update_uniform_buffers(stage);
            self.update_storage_buffers(stage);
        }
    }

    fn do_update_compute_buffers(&mut self) {
        self.update_compute_uniform_buffers();
        self.update_compute_storage_buffers();
    }

    fn update_index_buffer(&mut self) {
        // Check the count as well as the dirty flag: guests mutate the count
        // without raising the flag.
        let index_array = self.graphics.index_array;
        if !self.graphics.dirty.index_buffer && self.last_index_count == index_array.count {
            return;
        }
        self.graphics.dirty.index_buffer = false;
        self.last_index_count = index_array.count;

        let cpu_addr = self.gpu_memory.gpu_to_cpu_address(index_array.start_address);
        let address_size = (index_array.end_address - index_array.start_address) as u32;
        let draw_size = index_array.count * index_array.format.size_bytes();
        let size = address_size.min(draw_size);
        let Some(cpu_addr) = cpu_addr else {
            self.index_buffer = Binding::NULL;
            return;
        };
        if size == 0 {
            self.index_buffer = Binding::NULL;
            return;
        }
        self.index_buffer = Binding {
            cpu_addr,
            size,
            buffer_id: self.find_buffer(cpu_addr, size),
        };
    }

    fn update_vertex_buffers(&mut self) {
        if !self.graphics.dirty.vertex_buffers {
            return;
        }
        self.graphics.dirty.vertex_buffers = false;

        for index in 0..NUM_VERTEX_BUFFERS {
            self.update_vertex_buffer(index);
        }
    }

    fn update_vertex_buffer(&mut self, index: usize) {
        if !self.graphics.dirty.vertex_buffer[index] {
            return;
        }
        let array = self.graphics.vertex_arrays[index];
        let gpu_addr_begin = array.start_address;
        let gpu_addr_end = array.limit_address + 1;
        let cpu_addr = self.gpu_memory.gpu_to_cpu_address(gpu_addr_begin);
        // TODO: Tighten the size from the stride and vertex count instead of
        // trusting the limit register.
        let size = (gpu_addr_end - gpu_addr_begin) as u32;
        if !array.enable || size == 0 {
            self.vertex_buffers[index] = Binding::NULL;
            return;
        }
        let Some(cpu_addr) = cpu_addr else {
            self.vertex_buffers[index] = Binding::NULL;
            return;
        };
        self.vertex_buffers[index] = Binding {
            cpu_addr,
            size,
            buffer_id: self.find_buffer(cpu_addr, size),
        };
    }

    fn update_uniform_buffers(&mut self, stage: usize) {
        for_each_enabled_bit(self.enabled_uniform_buffers[stage], |index| {
            let binding = self.uniform_buffers[stage][index as usize];
            if !binding.buffer_id.is_null() {
                // Already resolved in this pass.
                return;
            }
            if B::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
                self.dirty_uniform_buffers[stage] |= 1 << index;
            }
            let buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.uniform_buffers[stage][index as usize].buffer_id = buffer_id;
        });
    }

    fn update_storage_buffers(&mut self, stage: usize) {
        let written_mask = self.written_storage_buffers[stage];
        for_each_enabled_bit(self.enabled_storage_buffers[stage], |index| {
            let binding = self.storage_buffers[stage][index as usize];
            let buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.storage_buffers[stage][index as usize].buffer_id = buffer_id;

            if (written_mask >> index) & 1 != 0 {
                self.mark_written_buffer(buffer_id, binding.cpu_addr, binding.size);
            }
        });
    }

    fn update_transform_feedback_buffers(&mut self) {
        if !self.graphics.tfb_enabled {
            return;
        }
        for index in 0..NUM_TRANSFORM_FEEDBACK_BUFFERS {
            self.update_transform_feedback_buffer(index);
        }
    }

    fn update_transform_feedback_buffer(&mut self, index: usize) {
        let regs = self.graphics.transform_feedback[index];
        let gpu_addr = regs.address + u64::from(regs.offset);
        let size = regs.size;
        if !regs.enable || size == 0 {
            self.transform_feedback_buffers[index] = Binding::NULL;
            return;
        }
        let Some(cpu_addr) = self.gpu_memory.gpu_to_cpu_address(gpu_addr) else {
            self.transform_feedback_buffers[index] = Binding::NULL;
            return;
        };
        let buffer_id = self.find_buffer(cpu_addr, size);
        self.transform_feedback_buffers[index] = Binding {
            cpu_addr,
            size,
            buffer_id,
        };
        self.mark_written_buffer(buffer_id, cpu_addr, size);
    }

    fn update_compute_uniform_buffers(&mut self) {
        for_each_enabled_bit(self.enabled_compute_uniform_buffers, |index| {
            let mut binding = Binding::NULL;
            if (self.compute.const_buffer_enable_mask >> index) & 1 != 0 {
                let cbuf = self.compute.const_buffers[index as usize];
                if let Some(cpu_addr) = self.gpu_memory.gpu_to_cpu_address(cbuf.address) {
                    binding.cpu_addr = cpu_addr;
                    binding.size = cbuf.size;
                }
            }
            binding.buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.compute_uniform_buffers[index as usize] = binding;
        });
    }

    fn update_compute_storage_buffers(&mut self) {
        let written_mask = self.written_compute_storage_buffers;
        for_each_enabled_bit(self.enabled_compute_storage_buffers, |index| {
            let binding = self.compute_storage_buffers[index as usize];
            let buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.compute_storage_buffers[index as usize].buffer_id = buffer_id;

            if (written_mask >> index) & 1 != 0 {
                self.mark_written_buffer(buffer_id, binding.cpu_addr, binding.size);
            }
        });
    }

    /// Mark a bound range as GPU-written; under high-accuracy asynchronous
    /// emulation, also queue the buffer for deferred download. Queueing is
    /// idempotent per buffer.
    fn mark_written_buffer(&mut self, buffer_id: BufferId, cpu_addr: u64, size: u32) {
        self.slot_buffers[buffer_id].mark_region_as_gpu_modified(cpu_addr, u64::from(size));

        if !self.config.gpu_accuracy.is_high() || !self.config.use_asynchronous_gpu_emulation {
            return;
        }
        if self.uncommitted_downloads.contains(&buffer_id) {
            return;
        }
        self.uncommitted_downloads.push(buffer_id);
    }

    /// Resolve an address range to its backing buffer, creating (and
    /// absorbing overlaps) as needed.
    fn find_buffer(&mut self, cpu_addr: u64, size: u32) -> BufferId {
        if cpu_addr == 0 {
            return BufferId::NULL;
        }
        let page = cpu_addr >> PAGE_BITS;
        let buffer_id = self.page_table.get(page);
        if buffer_id.is_null() {
            return self.create_buffer(cpu_addr, size);
        }
        if self.slot_buffers[buffer_id].is_in_bounds(cpu_addr, u64::from(size)) {
            return buffer_id;
        }
        self.create_buffer(cpu_addr, size)
    }

    fn resolve_overlaps(&mut self, cpu_addr: u64, wanted_size: u32) -> OverlapResult {
        let mut ids = Vec::new();
        let mut begin = cpu_addr;
        let mut end = cpu_addr + u64::from(wanted_size);
        let mut stream_score = 0u32;
        let mut has_stream_leap = false;

        // The bound tracks `end`, which can grow mid-scan and reveal further
        // overlaps.
        let mut addr = cpu_addr;
        while addr >> PAGE_BITS < end.div_ceil(PAGE_SIZE) {
            let overlap_id = self.page_table.get(addr >> PAGE_BITS);
            if overlap_id.is_null() {
                addr += PAGE_SIZE;
                continue;
            }
            let overlap = &mut self.slot_buffers[overlap_id];
            if overlap.is_picked() {
                addr += PAGE_SIZE;
                continue;
            }
            ids.push(overlap_id);
            overlap.pick();
            let overlap_cpu_addr = overlap.cpu_addr();
            if overlap_cpu_addr < begin {
                // Rescan from the extended left edge; picked buffers are
                // skipped on the way back.
                begin = overlap_cpu_addr;
                addr = overlap_cpu_addr;
            }
            end = end.max(overlap_cpu_addr + overlap.size_bytes());

            stream_score += overlap.stream_score();
            if stream_score > STREAM_LEAP_SCORE_THRESHOLD && !has_stream_leap {
                // A region joined this many times is behaving like a stream
                // buffer; over-allocate now instead of recreating it on every
                // wraparound.
                has_stream_leap = true;
                end += PAGE_SIZE * STREAM_LEAP_PAGES;
                debug!(begin, end, "stream leap while resolving overlaps");
            }
            addr += PAGE_SIZE;
        }
        OverlapResult {
            ids,
            begin,
            end,
            has_stream_leap,
        }
    }

    /// Absorb `overlap_id` into `new_buffer_id`: carry its GPU-written data
    /// and tracking over, rewrite the download queues, then delete it.
    fn join_overlap(&mut self, new_buffer_id: BufferId, overlap_id: BufferId, accumulate_stream_score: bool) {
        let mut copies = Vec::new();
        {
            let (new_buffer, overlap) = self.slot_buffers.get2_mut(new_buffer_id, overlap_id);
            if accumulate_stream_score {
                new_buffer.increase_stream_score(overlap.stream_score() + 1);
            }
            let overlap_addr = overlap.cpu_addr();
            let dst_base_offset = overlap_addr - new_buffer.cpu_addr();
            overlap.for_each_download_range(|begin, range_size| {
                copies.push(BufferCopy {
                    src_offset: begin,
                    dst_offset: dst_base_offset + begin,
                    size: range_size,
                });
                // The transferred range is GPU-owned in the new buffer too.
                new_buffer.unmark_region_as_cpu_modified(overlap_addr + begin, range_size);
                new_buffer.mark_region_as_gpu_modified(overlap_addr + begin, range_size);
            });
        }
        if !copies.is_empty() {
            let new_buffer = &self.slot_buffers[new_buffer_id];
            let overlap = &self.slot_buffers[overlap_id];
            self.runtime.copy_buffer(new_buffer, overlap, &copies);
        }
        self.replace_buffer_downloads(overlap_id, new_buffer_id);
        self.delete_buffer(overlap_id);
    }

    fn create_buffer(&mut self, cpu_addr: u64, wanted_size: u32) -> BufferId {
        let overlap = self.resolve_overlaps(cpu_addr, wanted_size);
        let size = overlap.end - overlap.begin;
        let buffer = self.runtime.create_buffer(overlap.begin, size);
        let new_buffer_id = self.slot_buffers.insert(buffer);
        trace!(
            id = new_buffer_id.index(),
            cpu_addr = overlap.begin,
            size,
            absorbed = overlap.ids.len(),
            "created buffer"
        );
        for &overlap_id in &overlap.ids {
            self.join_overlap(new_buffer_id, overlap_id, !overlap.has_stream_leap);
        }
        self.register(new_buffer_id);
        new_buffer_id
    }

    fn register(&mut self, buffer_id: BufferId) {
        let pages = self.buffer_pages(buffer_id);
        self.page_table.fill(pages, buffer_id);
    }

    fn unregister(&mut self, buffer_id: BufferId) {
        let pages = self.buffer_pages(buffer_id);
        self.page_table.clear(pages);
    }

    fn buffer_pages(&self, buffer_id: BufferId) -> Range<u64> {
        let buffer = &self.slot_buffers[buffer_id];
        let begin = buffer.cpu_addr();
        let end = begin + buffer.size_bytes();
        (begin >> PAGE_BITS)..end.div_ceil(PAGE_SIZE)
    }

    /// Upload every CPU-modified range intersecting the binding before the
    /// host reads it. Returns true when there was nothing to upload.
    fn synchronize_buffer(&mut self, buffer_id: BufferId, cpu_addr: u64, size: u32) -> bool {
        let buffer = &mut self.slot_buffers[buffer_id];
        if buffer.cpu_addr() == 0 {
            // The null buffer has no backing to synchronize.
            return true;
        }
        let mut copies = Vec::new();
        let mut total_size_bytes = 0u64;
        let mut largest_copy = 0u64;
        buffer.for_each_upload_range(cpu_addr, u64::from(size), |range_offset, range_size| {
            copies.push(BufferCopy {
                src_offset: total_size_bytes,
                dst_offset: range_offset,
                size: range_size,
            });
            total_size_bytes += range_size;
            largest_copy = largest_copy.max(range_size);
        });
        if total_size_bytes == 0 {
            return true;
        }
        if B::USE_MEMORY_MAPS {
            self.mapped_upload_memory(buffer_id, total_size_bytes, copies);
        } else {
            self.immediate_upload_memory(buffer_id, largest_copy, &copies);
        }
        false
    }

    fn immediate_upload_memory(&mut self, buffer_id: BufferId, largest_copy: u64, copies: &[BufferCopy]) {
        if self.immediate_buffer.len() < largest_copy as usize {
            self.immediate_buffer.resize(largest_copy as usize, 0);
        }
        for copy in copies {
            let size = copy.size as usize;
            let buffer = &mut self.slot_buffers[buffer_id];
            let cpu_addr = buffer.cpu_addr() + copy.dst_offset;
            let uploaded = self
                .cpu_memory
                .with_contiguous(cpu_addr, copy.size, |span| {
                    buffer.immediate_upload(copy.dst_offset, span);
                })
                .is_some();
            if !uploaded {
                self.cpu_memory
                    .read_block_unsafe(cpu_addr, &mut self.immediate_buffer[..size]);
                self.slot_buffers[buffer_id]
                    .immediate_upload(copy.dst_offset, &self.immediate_buffer[..size]);
            }
        }
    }

    fn mapped_upload_memory(&mut self, buffer_id: BufferId, total_size_bytes: u64, mut copies: Vec<BufferCopy>) {
        let mut staging = self.runtime.upload_staging_buffer(total_size_bytes);
        let staging_offset = staging.offset();
        {
            let buffer = &self.slot_buffers[buffer_id];
            let mapped = staging.mapped_mut();
            for copy in &mut copies {
                let span = &mut mapped[copy.src_offset as usize..(copy.src_offset + copy.size) as usize];
                self.cpu_memory
                    .read_block_unsafe(buffer.cpu_addr() + copy.dst_offset, span);
                // Source offsets are staging-buffer absolute from here on.
                copy.src_offset += staging_offset;
            }
        }
        let buffer = &self.slot_buffers[buffer_id];
        self.runtime.copy_from_staging(buffer, &staging, &copies);
    }

    /// Execute gathered download copies for one buffer and write them back
    /// to guest memory.
    fn download_buffer_copies(
        &mut self,
        buffer_id: BufferId,
        mut copies: Vec<BufferCopy>,
        total_size_bytes: u64,
        largest_copy: u64,
    ) {
        if B::USE_MEMORY_MAPS {
            let mut staging = self.runtime.download_staging_buffer(total_size_bytes);
            let staging_offset = staging.offset();
            for copy in &mut copies {
                copy.dst_offset += staging_offset;
            }
            let buffer = &self.slot_buffers[buffer_id];
            self.runtime.copy_to_staging(&mut staging, buffer, &copies);
            self.runtime.finish();
            let buffer = &self.slot_buffers[buffer_id];
            for copy in &copies {
                let cpu_addr = buffer.cpu_addr() + copy.src_offset;
                let mapped_offset = (copy.dst_offset - staging_offset) as usize;
                let bytes = &staging.mapped()[mapped_offset..mapped_offset + copy.size as usize];
                self.cpu_memory.write_block_unsafe(cpu_addr, bytes);
            }
        } else {
            if self.immediate_buffer.len() < largest_copy as usize {
                self.immediate_buffer.resize(largest_copy as usize, 0);
            }
            for copy in &copies {
                let size = copy.size as usize;
                let buffer = &self.slot_buffers[buffer_id];
                buffer.immediate_download(copy.src_offset, &mut self.immediate_buffer[..size]);
                let cpu_addr = buffer.cpu_addr() + copy.src_offset;
                self.cpu_memory
                    .write_block_unsafe(cpu_addr, &self.immediate_buffer[..size]);
            }
        }
    }

    /// Remove a buffer: scrub every binding referencing it, hand its host
    /// resources to the destruction ring and force the update loop to
    /// re-resolve.
    fn delete_buffer(&mut self, buffer_id: BufferId) {
        let scrub = |binding: &mut Binding| {
            if binding.buffer_id == buffer_id {
                binding.buffer_id = BufferId::NULL;
            }
        };
        scrub(&mut self.index_buffer);
        self.vertex_buffers.iter_mut().for_each(scrub);
        self.uniform_buffers.iter_mut().flatten().for_each(scrub);
        self.storage_buffers.iter_mut().flatten().for_each(scrub);
        self.transform_feedback_buffers.iter_mut().for_each(scrub);
        self.compute_uniform_buffers.iter_mut().for_each(scrub);
        self.compute_storage_buffers.iter_mut().for_each(scrub);
        self.cached_write_buffer_ids.retain(|&id| id != buffer_id);

        // Stop tracking CPU writes over the span; whatever reallocates the
        // range will re-upload it wholesale.
        let buffer = &mut self.slot_buffers[buffer_id];
        let cpu_addr = buffer.cpu_addr();
        let size = buffer.size_bytes();
        buffer.mark_region_as_cpu_modified(cpu_addr, size);

        self.unregister(buffer_id);
        let buffer = self.slot_buffers.remove(buffer_id);
        self.delayed_destruction_ring.push(buffer);

        self.notify_buffer_deletion();
    }

    /// Rewrite queued download references from an absorbed buffer to its
    /// absorber, coalescing duplicates.
    fn replace_buffer_downloads(&mut self, old_buffer_id: BufferId, new_buffer_id: BufferId) {
        replace_download_id(&mut self.uncommitted_downloads, old_buffer_id, new_buffer_id);
        for batch in &mut self.committed_downloads {
            replace_download_id(batch, old_buffer_id, new_buffer_id);
        }
    }

    fn notify_buffer_deletion(&mut self) {
        if B::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
            self.dirty_uniform_buffers = [!0; NUM_STAGES];
        }
        self.graphics.dirty.index_buffer = true;
        self.graphics.dirty.mark_all_vertex_buffers();
        self.has_deleted_buffers = true;
    }

    /// Resolve a storage buffer descriptor (`u64` GPU address, `u32` size)
    /// read through a const buffer.
    fn storage_buffer_binding(&self, ssbo_addr: u64) -> Binding {
        let gpu_addr = self.gpu_memory.read_object::<u64>(ssbo_addr);
        let size = self.gpu_memory.read_object::<u32>(ssbo_addr + 8);
        let Some(cpu_addr) = self.gpu_memory.gpu_to_cpu_address(gpu_addr) else {
            return Binding::NULL;
        };
        if size == 0 {
            return Binding::NULL;
        }
        // Bind slack past the declared size for titles that read out of
        // bounds, clamped so the binding never leaves the GPU mapping.
        let bytes_to_map_end =
            u32::try_from(self.gpu_memory.bytes_to_map_end(gpu_addr)).unwrap_or(u32::MAX);
        Binding {
            cpu_addr,
            size: size.saturating_add(STORAGE_OVERBIND_BYTES).min(bytes_to_map_end),
            buffer_id: BufferId::NULL,
        }
    }

    fn has_fast_uniform_buffer_bound(&self, stage: usize, binding_index: u32) -> bool {
        if B::IS_OPENGL {
            (self.fast_bound_uniform_buffers[stage] >> binding_index) & 1 != 0
        } else {
            // Only OpenGL runtimes have fast uniform buffers.
            false
        }
    }
}
