//! Guest address-space collaborators.
//!
//! Implementations are expected to be cheap handles (the CPU emulator owns
//! the actual RAM), typically using interior mutability; every method takes
//! `&self`.

use bytemuck::Pod;

/// The guest GPU's virtual address space, as programmed through the guest
/// driver's page tables.
pub trait GpuMemory {
    /// Translate a GPU virtual address to a CPU address, or `None` when the
    /// page is unmapped.
    fn gpu_to_cpu_address(&self, gpu_addr: u64) -> Option<u64>;

    /// Remaining bytes from `gpu_addr` to the end of its mapping.
    fn bytes_to_map_end(&self, gpu_addr: u64) -> u64;

    /// Read guest memory through the GPU address space.
    fn read_block(&self, gpu_addr: u64, dst: &mut [u8]);

    /// Read one plain-old-data value, e.g. a storage buffer descriptor word.
    fn read_object<T: Pod>(&self, gpu_addr: u64) -> T
    where
        Self: Sized,
    {
        let mut value = T::zeroed();
        self.read_block(gpu_addr, bytemuck::bytes_of_mut(&mut value));
        value
    }
}

/// Guest RAM, addressed by CPU virtual address.
///
/// The `_unsafe` suffix is contractual, not `unsafe` in the Rust sense:
/// these accessors bypass the rasterizer's write-invalidation tracking
/// because the caller already holds the cache exclusively and sits inside
/// the invalidation path. Routing them through the tracking entry points
/// would deadlock or recurse.
pub trait CpuMemory {
    fn read_block_unsafe(&self, cpu_addr: u64, dst: &mut [u8]);

    fn write_block_unsafe(&self, cpu_addr: u64, src: &[u8]);

    /// Run `f` over a direct view of guest RAM when `[cpu_addr,
    /// cpu_addr + size)` is contiguous in host memory. Returning `None`
    /// sends the caller through its scratch-copy path instead.
    fn with_contiguous<R>(&self, cpu_addr: u64, size: u64, f: impl FnOnce(&[u8]) -> R) -> Option<R>
    where
        Self: Sized;
}
