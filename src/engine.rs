//! Register mirrors of the guest GPU engines, as seen by the cache.
//!
//! The command decoder owns filling these in; the cache reads them during
//! update passes and flips the dirty flags both ways (consuming them when a
//! binding is re-resolved, setting them when a deletion invalidates host
//! state).

use crate::{
    NUM_COMPUTE_UNIFORM_BUFFERS, NUM_GRAPHICS_UNIFORM_BUFFERS, NUM_STAGES,
    NUM_TRANSFORM_FEEDBACK_BUFFERS, NUM_VERTEX_BUFFERS,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrimitiveTopology {
    Points,
    Lines,
    #[default]
    Triangles,
    TriangleStrip,
    Quads,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IndexFormat {
    U8,
    #[default]
    U16,
    U32,
}

impl IndexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::U8 => 1,
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Guest index-array registers: a GPU address window plus the draw's element
/// count and format.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexBufferRegs {
    pub start_address: u64,
    pub end_address: u64,
    pub first: u32,
    pub count: u32,
    pub format: IndexFormat,
}

/// One guest vertex-array slot. The usable size is bounded by the limit
/// address, which points at the last addressable byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct VertexArrayRegs {
    pub enable: bool,
    pub start_address: u64,
    pub limit_address: u64,
    pub stride: u32,
}

/// One guest transform-feedback binding slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransformFeedbackRegs {
    pub enable: bool,
    pub address: u64,
    pub offset: u32,
    pub size: u32,
}

/// Dirty bits the decoder raises when the mirrored registers change. The
/// cache consumes them during update/bind passes and re-raises them when a
/// buffer deletion invalidates previously bound host state.
#[derive(Clone, Copy, Debug)]
pub struct DirtyFlags {
    pub index_buffer: bool,
    pub vertex_buffers: bool,
    pub vertex_buffer: [bool; NUM_VERTEX_BUFFERS],
}

impl Default for DirtyFlags {
    /// Everything starts dirty so the first draw resolves and binds every
    /// slot.
    fn default() -> Self {
        Self {
            index_buffer: true,
            vertex_buffers: true,
            vertex_buffer: [true; NUM_VERTEX_BUFFERS],
        }
    }
}

impl DirtyFlags {
    pub fn mark_all_vertex_buffers(&mut self) {
        self.vertex_buffers = true;
        self.vertex_buffer = [true; NUM_VERTEX_BUFFERS];
    }
}

/// Mirror of the 3D engine state the cache consumes.
#[derive(Clone, Debug, Default)]
pub struct GraphicsRegs {
    pub index_array: IndexBufferRegs,
    pub vertex_arrays: [VertexArrayRegs; NUM_VERTEX_BUFFERS],
    pub transform_feedback: [TransformFeedbackRegs; NUM_TRANSFORM_FEEDBACK_BUFFERS],
    /// Transform feedback master enable; when clear the binding slots are
    /// not even resolved.
    pub tfb_enabled: bool,
    pub topology: PrimitiveTopology,
    /// First vertex and vertex count of the current non-indexed draw.
    pub vertex_buffer_first: u32,
    pub vertex_buffer_count: u32,
    /// Per-stage const-buffer base GPU addresses; storage buffer descriptors
    /// are fetched indirectly through these.
    pub const_buffer_addresses: [[u64; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_STAGES],
    pub dirty: DirtyFlags,
}

/// One const-buffer slot of a compute launch descriptor.
#[derive(Clone, Copy, Debug, Default)]
pub struct LaunchConstBuffer {
    pub address: u64,
    pub size: u32,
}

/// Mirror of the compute launch descriptor the cache consumes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ComputeLaunch {
    pub const_buffer_enable_mask: u32,
    pub const_buffers: [LaunchConstBuffer; NUM_COMPUTE_UNIFORM_BUFFERS],
}
