//! `gpu-buffer-cache` mediates between a guest GPU's view of memory (a
//! virtual address space written by guest programs) and a host graphics
//! API's view (discrete buffer objects bound to draw/compute pipelines).
//!
//! On every draw and dispatch the cache discovers which guest regions the
//! GPU reads or writes, backs them with host buffer objects, keeps both
//! sides synchronized, and emits the index/vertex/uniform/storage/transform-
//! feedback bindings the host expects.
//!
//! The crate provides:
//! - The cache itself (see [`BufferCache`]), generic over a
//!   [`CacheBackend`] parameter pack describing a host API's shape.
//! - The capability traits a backend implements: [`BufferRuntime`],
//!   [`CacheBuffer`], [`GpuMemory`], [`CpuMemory`].
//! - Reusable CPU-side buffer state ([`tracking::BufferTracker`]) that real
//!   backends embed in their buffer objects.
//! - A fully software backend (see [`sim`]) used by the test-suite and as a
//!   template for real integrations.

mod backend;
mod buffer;
mod cache;
mod config;
mod engine;
mod memory;
mod page_table;
mod ring;
mod runtime;
mod slot;

pub mod sim;
pub mod tracking;

pub use backend::CacheBackend;
pub use buffer::CacheBuffer;
pub use cache::{Binding, BufferCache, DEFAULT_SKIP_CACHE_SIZE};
pub use config::{CacheConfig, GpuAccuracy};
pub use engine::{
    ComputeLaunch, DirtyFlags, GraphicsRegs, IndexBufferRegs, IndexFormat, LaunchConstBuffer,
    PrimitiveTopology, TransformFeedbackRegs, VertexArrayRegs,
};
pub use memory::{CpuMemory, GpuMemory};
pub use page_table::{PageTable, PAGE_BITS, PAGE_SIZE};
pub use ring::DelayedDestructionRing;
pub use runtime::{BufferCopy, BufferRuntime, StagingMemory};
pub use slot::{SlotId, SlotTable};

/// Stable dense identifier of a cached buffer. Id 0 is permanently reserved
/// for the null buffer used as a binding sentinel.
pub type BufferId = SlotId;

/// Number of vertex buffer binding slots exposed by the guest GPU.
pub const NUM_VERTEX_BUFFERS: usize = 32;
/// Number of transform feedback binding slots.
pub const NUM_TRANSFORM_FEEDBACK_BUFFERS: usize = 4;
/// Uniform buffer slots per graphics shader stage.
pub const NUM_GRAPHICS_UNIFORM_BUFFERS: usize = 18;
/// Uniform buffer slots available to compute dispatches.
pub const NUM_COMPUTE_UNIFORM_BUFFERS: usize = 8;
/// Storage buffer slots per stage (graphics and compute alike).
pub const NUM_STORAGE_BUFFERS: usize = 16;
/// Guest shader stages: vertex A, vertex B, tessellation, geometry, fragment.
pub const NUM_STAGES: usize = 5;
