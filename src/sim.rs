//! Fully software backend: a recording runtime, tracked buffers and linear
//! guest memories.
//!
//! The real emulator provides implementations backed by its graphics runtime
//! and memory system; this one exists so the cache can be exercised
//! end-to-end without a GPU, and doubles as a template for real
//! integrations. Every host call is recorded as a [`HostEvent`] and copies
//! are byte-accurate, so tests can assert on both the call stream and the
//! data that moved.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::backend::CacheBackend;
use crate::buffer::CacheBuffer;
use crate::engine::{IndexFormat, PrimitiveTopology};
use crate::memory::{CpuMemory, GpuMemory};
use crate::runtime::{BufferCopy, BufferRuntime, StagingMemory};
use crate::tracking::BufferTracker;

/// One recorded host call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    CopyBuffer {
        dst_addr: u64,
        src_addr: u64,
        copies: Vec<BufferCopy>,
    },
    CopyFromStaging {
        dst_addr: u64,
        copies: Vec<BufferCopy>,
    },
    CopyToStaging {
        src_addr: u64,
        copies: Vec<BufferCopy>,
    },
    Finish,
    BindIndexBuffer {
        buffer_addr: u64,
        offset: u32,
        size: u32,
    },
    BindConvertedIndexBuffer {
        topology: PrimitiveTopology,
        format: IndexFormat,
        first: u32,
        count: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
    },
    BindQuadArrayIndexBuffer {
        first: u32,
        count: u32,
    },
    BindVertexBuffer {
        index: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
        stride: u32,
    },
    BindUniformBuffer {
        stage: usize,
        binding_index: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
    },
    BindStorageBuffer {
        stage: usize,
        binding_index: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
        is_written: bool,
    },
    BindTransformFeedbackBuffer {
        index: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
    },
    BindComputeUniformBuffer {
        binding_index: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
    },
    BindComputeStorageBuffer {
        binding_index: u32,
        buffer_addr: u64,
        offset: u32,
        size: u32,
        is_written: bool,
    },
    BindFastUniformBuffer {
        stage: usize,
        binding_index: u32,
        size: u32,
    },
    PushFastUniformBuffer {
        stage: usize,
        binding_index: u32,
        data: Vec<u8>,
    },
    BindMappedUniformBuffer {
        stage: usize,
        binding_index: u32,
        size: u32,
    },
}

/// Simulated guest RAM: a shared byte window starting at `base`.
///
/// Clones share the same storage, so the CPU-emulator side of a test and the
/// cache observe each other's writes.
#[derive(Clone)]
pub struct SimCpuMemory {
    inner: Rc<SimCpuMemoryInner>,
    base: u64,
}

struct SimCpuMemoryInner {
    ram: RefCell<Vec<u8>>,
    direct_access: Cell<bool>,
}

impl SimCpuMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            inner: Rc::new(SimCpuMemoryInner {
                ram: RefCell::new(vec![0; size]),
                direct_access: Cell::new(true),
            }),
            base,
        }
    }

    /// When disabled, [`CpuMemory::with_contiguous`] reports every range as
    /// non-contiguous, forcing callers through their scratch paths.
    pub fn set_direct_access(&self, enabled: bool) {
        self.inner.direct_access.set(enabled);
    }

    /// Test-side write, bypassing the cache entirely.
    pub fn write(&self, cpu_addr: u64, data: &[u8]) {
        let range = self.range(cpu_addr, data.len());
        self.inner.ram.borrow_mut()[range].copy_from_slice(data);
    }

    /// Test-side read.
    pub fn read_vec(&self, cpu_addr: u64, len: usize) -> Vec<u8> {
        let range = self.range(cpu_addr, len);
        self.inner.ram.borrow()[range].to_vec()
    }

    fn range(&self, cpu_addr: u64, len: usize) -> std::ops::Range<usize> {
        let start = (cpu_addr - self.base) as usize;
        start..start + len
    }
}

impl CpuMemory for SimCpuMemory {
    fn read_block_unsafe(&self, cpu_addr: u64, dst: &mut [u8]) {
        let range = self.range(cpu_addr, dst.len());
        dst.copy_from_slice(&self.inner.ram.borrow()[range]);
    }

    fn write_block_unsafe(&self, cpu_addr: u64, src: &[u8]) {
        let range = self.range(cpu_addr, src.len());
        self.inner.ram.borrow_mut()[range].copy_from_slice(src);
    }

    fn with_contiguous<R>(&self, cpu_addr: u64, size: u64, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        if !self.inner.direct_access.get() {
            return None;
        }
        let range = self.range(cpu_addr, size as usize);
        let ram = self.inner.ram.borrow();
        Some(f(&ram[range]))
    }
}

/// Simulated GPU address space: one linear window mapped onto guest RAM.
#[derive(Clone)]
pub struct SimGpuMemory {
    cpu_memory: SimCpuMemory,
    gpu_base: u64,
    cpu_base: u64,
    size: u64,
}

impl SimGpuMemory {
    pub fn new(cpu_memory: SimCpuMemory, gpu_base: u64, cpu_base: u64, size: u64) -> Self {
        Self {
            cpu_memory,
            gpu_base,
            cpu_base,
            size,
        }
    }
}

impl GpuMemory for SimGpuMemory {
    fn gpu_to_cpu_address(&self, gpu_addr: u64) -> Option<u64> {
        if gpu_addr < self.gpu_base || gpu_addr >= self.gpu_base + self.size {
            return None;
        }
        Some(self.cpu_base + (gpu_addr - self.gpu_base))
    }

    fn bytes_to_map_end(&self, gpu_addr: u64) -> u64 {
        (self.gpu_base + self.size).saturating_sub(gpu_addr)
    }

    fn read_block(&self, gpu_addr: u64, dst: &mut [u8]) {
        match self.gpu_to_cpu_address(gpu_addr) {
            Some(cpu_addr) => self.cpu_memory.read_block_unsafe(cpu_addr, dst),
            // Unmapped reads observe zeroes.
            None => dst.fill(0),
        }
    }
}

/// A cached buffer with a plain byte vector as its "host" backing.
#[derive(Debug)]
pub struct SimBuffer {
    tracker: BufferTracker,
    backing: RefCell<Vec<u8>>,
}

impl SimBuffer {
    fn new(cpu_addr: u64, size: u64) -> Self {
        Self {
            tracker: BufferTracker::new(cpu_addr, size),
            backing: RefCell::new(vec![0; size as usize]),
        }
    }

    /// Test-side view of the host backing.
    pub fn read_backing(&self, offset: u64, len: usize) -> Vec<u8> {
        let start = offset as usize;
        self.backing.borrow()[start..start + len].to_vec()
    }
}

impl CacheBuffer for SimBuffer {
    fn tracker(&self) -> &BufferTracker {
        &self.tracker
    }

    fn tracker_mut(&mut self) -> &mut BufferTracker {
        &mut self.tracker
    }

    fn immediate_upload(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        self.backing.get_mut()[start..start + data.len()].copy_from_slice(data);
    }

    fn immediate_download(&self, offset: u64, out: &mut [u8]) {
        let start = offset as usize;
        out.copy_from_slice(&self.backing.borrow()[start..start + out.len()]);
    }
}

/// A staging allocation carved from the simulated belt. The reported
/// `offset` is the allocation's position inside the belt, so offset
/// arithmetic in callers is exercised for real.
pub struct SimStaging {
    offset: u64,
    data: Vec<u8>,
}

impl StagingMemory for SimStaging {
    fn offset(&self) -> u64 {
        self.offset
    }

    fn mapped(&self) -> &[u8] {
        &self.data
    }

    fn mapped_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Recording host runtime.
#[derive(Default)]
pub struct SimRuntime {
    events: Vec<HostEvent>,
    fast_buffer_sub_data: bool,
    staging_cursor: u64,
    mapped_uniform: Vec<u8>,
}

impl SimRuntime {
    pub fn new() -> Self {
        Self {
            // Start the belt at a non-zero offset so a caller that forgets
            // to apply staging offsets corrupts data visibly.
            staging_cursor: 0x40,
            ..Self::default()
        }
    }

    pub fn with_fast_buffer_sub_data() -> Self {
        Self {
            fast_buffer_sub_data: true,
            ..Self::new()
        }
    }

    pub fn events(&self) -> &[HostEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.events)
    }

    /// Contents of the most recent mapped uniform binding.
    pub fn mapped_uniform(&self) -> &[u8] {
        &self.mapped_uniform
    }

    fn allocate_staging(&mut self, size: u64) -> SimStaging {
        let offset = self.staging_cursor;
        self.staging_cursor += (size.max(1) + 0x3f) & !0x3f;
        SimStaging {
            offset,
            data: vec![0; size as usize],
        }
    }
}

impl BufferRuntime for SimRuntime {
    type Buffer = SimBuffer;
    type Staging = SimStaging;

    fn create_buffer(&mut self, cpu_addr: u64, size: u64) -> SimBuffer {
        SimBuffer::new(cpu_addr, size)
    }

    fn create_null_buffer(&mut self) -> SimBuffer {
        SimBuffer::new(0, 0)
    }

    fn upload_staging_buffer(&mut self, size: u64) -> SimStaging {
        self.allocate_staging(size)
    }

    fn download_staging_buffer(&mut self, size: u64) -> SimStaging {
        self.allocate_staging(size)
    }

    fn copy_from_staging(&mut self, dst: &SimBuffer, staging: &SimStaging, copies: &[BufferCopy]) {
        let mut backing = dst.backing.borrow_mut();
        for copy in copies {
            let src = (copy.src_offset - staging.offset) as usize;
            let dst_offset = copy.dst_offset as usize;
            let size = copy.size as usize;
            backing[dst_offset..dst_offset + size].copy_from_slice(&staging.data[src..src + size]);
        }
        self.events.push(HostEvent::CopyFromStaging {
            dst_addr: dst.cpu_addr(),
            copies: copies.to_vec(),
        });
    }

    fn copy_to_staging(&mut self, staging: &mut SimStaging, src: &SimBuffer, copies: &[BufferCopy]) {
        let backing = src.backing.borrow();
        for copy in copies {
            let dst = (copy.dst_offset - staging.offset) as usize;
            let src_offset = copy.src_offset as usize;
            let size = copy.size as usize;
            staging.data[dst..dst + size].copy_from_slice(&backing[src_offset..src_offset + size]);
        }
        self.events.push(HostEvent::CopyToStaging {
            src_addr: src.cpu_addr(),
            copies: copies.to_vec(),
        });
    }

    fn copy_buffer(&mut self, dst: &SimBuffer, src: &SimBuffer, copies: &[BufferCopy]) {
        let mut dst_backing = dst.backing.borrow_mut();
        let src_backing = src.backing.borrow();
        for copy in copies {
            let src_offset = copy.src_offset as usize;
            let dst_offset = copy.dst_offset as usize;
            let size = copy.size as usize;
            dst_backing[dst_offset..dst_offset + size]
                .copy_from_slice(&src_backing[src_offset..src_offset + size]);
        }
        self.events.push(HostEvent::CopyBuffer {
            dst_addr: dst.cpu_addr(),
            src_addr: src.cpu_addr(),
            copies: copies.to_vec(),
        });
    }

    fn finish(&mut self) {
        self.events.push(HostEvent::Finish);
    }

    fn bind_index_buffer(&mut self, buffer: &SimBuffer, offset: u32, size: u32) {
        self.events.push(HostEvent::BindIndexBuffer {
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
        });
    }

    fn bind_converted_index_buffer(
        &mut self,
        topology: PrimitiveTopology,
        format: IndexFormat,
        first: u32,
        count: u32,
        buffer: &SimBuffer,
        offset: u32,
        size: u32,
    ) {
        self.events.push(HostEvent::BindConvertedIndexBuffer {
            topology,
            format,
            first,
            count,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
        });
    }

    fn bind_quad_array_index_buffer(&mut self, first: u32, count: u32) {
        self.events
            .push(HostEvent::BindQuadArrayIndexBuffer { first, count });
    }

    fn bind_vertex_buffer(&mut self, index: u32, buffer: &SimBuffer, offset: u32, size: u32, stride: u32) {
        self.events.push(HostEvent::BindVertexBuffer {
            index,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
            stride,
        });
    }

    fn bind_uniform_buffer(&mut self, stage: usize, binding_index: u32, buffer: &SimBuffer, offset: u32, size: u32) {
        self.events.push(HostEvent::BindUniformBuffer {
            stage,
            binding_index,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
        });
    }

    fn bind_storage_buffer(
        &mut self,
        stage: usize,
        binding_index: u32,
        buffer: &SimBuffer,
        offset: u32,
        size: u32,
        is_written: bool,
    ) {
        self.events.push(HostEvent::BindStorageBuffer {
            stage,
            binding_index,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
            is_written,
        });
    }

    fn bind_transform_feedback_buffer(&mut self, index: u32, buffer: &SimBuffer, offset: u32, size: u32) {
        self.events.push(HostEvent::BindTransformFeedbackBuffer {
            index,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
        });
    }

    fn bind_compute_uniform_buffer(&mut self, binding_index: u32, buffer: &SimBuffer, offset: u32, size: u32) {
        self.events.push(HostEvent::BindComputeUniformBuffer {
            binding_index,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
        });
    }

    fn bind_compute_storage_buffer(
        &mut self,
        binding_index: u32,
        buffer: &SimBuffer,
        offset: u32,
        size: u32,
        is_written: bool,
    ) {
        self.events.push(HostEvent::BindComputeStorageBuffer {
            binding_index,
            buffer_addr: buffer.cpu_addr(),
            offset,
            size,
            is_written,
        });
    }

    fn has_fast_buffer_sub_data(&self) -> bool {
        self.fast_buffer_sub_data
    }

    fn bind_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) {
        self.events.push(HostEvent::BindFastUniformBuffer {
            stage,
            binding_index,
            size,
        });
    }

    fn push_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, data: &[u8]) {
        self.events.push(HostEvent::PushFastUniformBuffer {
            stage,
            binding_index,
            data: data.to_vec(),
        });
    }

    fn bind_mapped_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) -> &mut [u8] {
        self.events.push(HostEvent::BindMappedUniformBuffer {
            stage,
            binding_index,
            size,
        });
        self.mapped_uniform.clear();
        self.mapped_uniform.resize(size as usize, 0);
        &mut self.mapped_uniform
    }
}

/// Parameter pack shaped like a desktop OpenGL runtime: explicit binding
/// indices, persistent uniform bindings, immediate uploads and the fast
/// uniform machinery.
pub struct SimOpenGl;

impl CacheBackend for SimOpenGl {
    const IS_OPENGL: bool = true;
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool = true;
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool = true;
    const NEEDS_BIND_UNIFORM_INDEX: bool = true;
    const NEEDS_BIND_STORAGE_INDEX: bool = true;
    const USE_MEMORY_MAPS: bool = false;

    type Buffer = SimBuffer;
    type Runtime = SimRuntime;
    type GpuMemory = SimGpuMemory;
    type CpuMemory = SimCpuMemory;
}

/// Parameter pack shaped like a Vulkan runtime: descriptor-managed binding
/// points, staged uploads through mapped memory, no driver fast paths,
/// converted index binds.
pub struct SimVulkan;

impl CacheBackend for SimVulkan {
    const IS_OPENGL: bool = false;
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool = false;
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool = false;
    const NEEDS_BIND_UNIFORM_INDEX: bool = false;
    const NEEDS_BIND_STORAGE_INDEX: bool = false;
    const USE_MEMORY_MAPS: bool = true;

    type Buffer = SimBuffer;
    type Runtime = SimRuntime;
    type GpuMemory = SimGpuMemory;
    type CpuMemory = SimCpuMemory;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_allocations_have_distinct_nonzero_offsets() {
        let mut runtime = SimRuntime::new();
        let a = runtime.upload_staging_buffer(0x100);
        let b = runtime.download_staging_buffer(0x20);
        assert_ne!(a.offset(), 0);
        assert!(b.offset() >= a.offset() + 0x100);
    }

    #[test]
    fn staging_copies_respect_belt_offsets() {
        let mut runtime = SimRuntime::new();
        let buffer = SimBuffer::new(0x1_0000, 0x100);

        let mut staging = runtime.upload_staging_buffer(0x10);
        staging.mapped_mut().copy_from_slice(&[7u8; 0x10]);
        let copies = [BufferCopy {
            src_offset: staging.offset(),
            dst_offset: 0x20,
            size: 0x10,
        }];
        runtime.copy_from_staging(&buffer, &staging, &copies);
        assert_eq!(buffer.read_backing(0x20, 0x10), vec![7u8; 0x10]);

        let mut readback = runtime.download_staging_buffer(0x10);
        let copies = [BufferCopy {
            src_offset: 0x20,
            dst_offset: readback.offset(),
            size: 0x10,
        }];
        runtime.copy_to_staging(&mut readback, &buffer, &copies);
        assert_eq!(readback.mapped(), &[7u8; 0x10]);
    }

    #[test]
    fn gpu_memory_translates_inside_window_only() {
        let cpu = SimCpuMemory::new(0, 0x1000);
        let gpu = SimGpuMemory::new(cpu, 0x10_0000, 0x200, 0x800);
        assert_eq!(gpu.gpu_to_cpu_address(0x10_0000), Some(0x200));
        assert_eq!(gpu.gpu_to_cpu_address(0x10_0400), Some(0x600));
        assert_eq!(gpu.gpu_to_cpu_address(0x10_0800), None);
        assert_eq!(gpu.gpu_to_cpu_address(0xf_ffff), None);
        assert_eq!(gpu.bytes_to_map_end(0x10_0600), 0x200);
    }

    #[test]
    fn gpu_read_object_reads_descriptor_words() {
        let cpu = SimCpuMemory::new(0, 0x1000);
        cpu.write(0x100, &0x1234_5678_9abc_def0u64.to_le_bytes());
        cpu.write(0x108, &0xc0de_cafeu32.to_le_bytes());
        let gpu = SimGpuMemory::new(cpu, 0, 0, 0x1000);
        assert_eq!(gpu.read_object::<u64>(0x100), 0x1234_5678_9abc_def0);
        assert_eq!(gpu.read_object::<u32>(0x108), 0xc0de_cafe);
    }
}
