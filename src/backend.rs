use crate::buffer::CacheBuffer;
use crate::memory::{CpuMemory, GpuMemory};
use crate::runtime::BufferRuntime;

/// Compile-time description of one host API integration.
///
/// The flags select bind shapes and fast paths inside
/// [`BufferCache`](crate::BufferCache); every branch on them folds away
/// under monomorphization, so a backend pays only for the paths it
/// declares.
pub trait CacheBackend {
    /// The host is OpenGL; enables the driver fast-uniform machinery.
    const IS_OPENGL: bool;
    /// Uniform bindings persist across draws on the host, so the cache
    /// tracks per-slot dirtiness instead of rebinding every draw.
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool;
    /// The host consumes every guest index format and primitive topology
    /// natively; otherwise index binds go through the converting path and
    /// quad array draws need a generated index buffer.
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool;
    /// Uniform bind calls consume an explicit binding index.
    const NEEDS_BIND_UNIFORM_INDEX: bool;
    /// Storage bind calls consume an explicit binding index.
    const NEEDS_BIND_STORAGE_INDEX: bool;
    /// Uploads and downloads go through mapped staging memory instead of
    /// per-copy immediate transfers.
    const USE_MEMORY_MAPS: bool;

    type Buffer: CacheBuffer;
    type Runtime: BufferRuntime<Buffer = Self::Buffer>;
    type GpuMemory: GpuMemory;
    type CpuMemory: CpuMemory;
}
