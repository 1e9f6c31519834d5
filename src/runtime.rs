use crate::engine::{IndexFormat, PrimitiveTopology};

/// One staged copy between two buffers, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// A host-visible staging allocation, typically sub-allocated from a larger
/// mapped belt. `offset` is the allocation's position inside the backing
/// buffer; copy records that target staging memory must account for it.
pub trait StagingMemory {
    fn offset(&self) -> u64;

    /// The mapped span of this allocation (readback side).
    fn mapped(&self) -> &[u8];

    /// The mapped span of this allocation (fill side).
    fn mapped_mut(&mut self) -> &mut [u8];
}

/// Host graphics API surface consumed by the cache.
///
/// Binding methods always receive a `binding_index`; runtimes that allocate
/// their own binding points (descriptor-set style hosts) ignore it. The
/// corresponding `NEEDS_BIND_*_INDEX` flags on
/// [`CacheBackend`](crate::CacheBackend) only control whether the cache
/// advances the index between slots.
///
/// Staging, copy and bind calls are infallible at this layer; a host error
/// is fatal to the emulation step above.
pub trait BufferRuntime {
    type Buffer;
    type Staging: StagingMemory;

    /// Allocate a host buffer backing the guest span `[cpu_addr,
    /// cpu_addr + size)`. The returned buffer reports its whole range as
    /// CPU-modified so its first use uploads everything.
    fn create_buffer(&mut self, cpu_addr: u64, size: u64) -> Self::Buffer;

    /// The zero-sized sentinel buffer occupying slot 0.
    fn create_null_buffer(&mut self) -> Self::Buffer;

    fn upload_staging_buffer(&mut self, size: u64) -> Self::Staging;

    fn download_staging_buffer(&mut self, size: u64) -> Self::Staging;

    /// Execute `copies` reading from `staging` (source offsets are absolute,
    /// staging-base included) into `dst`.
    fn copy_from_staging(&mut self, dst: &Self::Buffer, staging: &Self::Staging, copies: &[BufferCopy]);

    /// Execute `copies` reading from `src` into `staging` (destination
    /// offsets are absolute, staging-base included).
    fn copy_to_staging(&mut self, staging: &mut Self::Staging, src: &Self::Buffer, copies: &[BufferCopy]);

    /// Host-to-host copy between two cached buffers.
    fn copy_buffer(&mut self, dst: &Self::Buffer, src: &Self::Buffer, copies: &[BufferCopy]);

    /// Block until every submitted host copy has completed.
    fn finish(&mut self);

    fn bind_index_buffer(&mut self, buffer: &Self::Buffer, offset: u32, size: u32);

    /// Index bind on hosts without full index-format/primitive support; the
    /// runtime converts formats or topologies as needed.
    #[allow(clippy::too_many_arguments)]
    fn bind_converted_index_buffer(
        &mut self,
        topology: PrimitiveTopology,
        format: IndexFormat,
        first: u32,
        count: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
    );

    /// Bind a generated index buffer turning a quad array draw into
    /// triangles.
    fn bind_quad_array_index_buffer(&mut self, first: u32, count: u32);

    fn bind_vertex_buffer(&mut self, index: u32, buffer: &Self::Buffer, offset: u32, size: u32, stride: u32);

    fn bind_uniform_buffer(&mut self, stage: usize, binding_index: u32, buffer: &Self::Buffer, offset: u32, size: u32);

    #[allow(clippy::too_many_arguments)]
    fn bind_storage_buffer(
        &mut self,
        stage: usize,
        binding_index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
        is_written: bool,
    );

    fn bind_transform_feedback_buffer(&mut self, index: u32, buffer: &Self::Buffer, offset: u32, size: u32);

    fn bind_compute_uniform_buffer(&mut self, binding_index: u32, buffer: &Self::Buffer, offset: u32, size: u32);

    fn bind_compute_storage_buffer(
        &mut self,
        binding_index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
        is_written: bool,
    );

    /// Whether the driver exposes an inline uniform upload path (an OpenGL
    /// extension on some vendors).
    fn has_fast_buffer_sub_data(&self) -> bool {
        false
    }

    /// Bind the driver-side fast uniform buffer for `(stage, binding_index)`.
    fn bind_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32);

    /// Push uniform payload inline through the driver fast path. Only called
    /// after [`bind_fast_uniform_buffer`](Self::bind_fast_uniform_buffer)
    /// established the binding.
    fn push_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, data: &[u8]);

    /// Bind a stream-buffer uniform range and return its mapped span for the
    /// caller to fill.
    fn bind_mapped_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) -> &mut [u8];
}
