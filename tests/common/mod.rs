//! Shared harness: caches wired to the simulated backend over one linear
//! guest RAM window, identity-mapped into the GPU address space.
#![allow(dead_code)]

use gpu_buffer_cache::sim::{SimBuffer, SimCpuMemory, SimGpuMemory, SimRuntime};
use gpu_buffer_cache::{BufferCache, CacheBackend, CacheConfig, GpuAccuracy, VertexArrayRegs};

pub const RAM_SIZE: u64 = 64 << 20;

/// Backends wired to the simulated collaborator types.
pub trait SimBackend:
    CacheBackend<
    Runtime = SimRuntime,
    Buffer = SimBuffer,
    GpuMemory = SimGpuMemory,
    CpuMemory = SimCpuMemory,
>
{
}

impl<T> SimBackend for T where
    T: CacheBackend<
        Runtime = SimRuntime,
        Buffer = SimBuffer,
        GpuMemory = SimGpuMemory,
        CpuMemory = SimCpuMemory,
    >
{
}

/// Cache over 64 MiB of guest RAM at address 0, GPU addresses identity
/// mapped onto it.
pub fn new_cache<B: SimBackend>(config: CacheConfig) -> (BufferCache<B>, SimCpuMemory) {
    new_cache_with_runtime(SimRuntime::new(), config)
}

pub fn new_cache_with_runtime<B: SimBackend>(
    runtime: SimRuntime,
    config: CacheConfig,
) -> (BufferCache<B>, SimCpuMemory) {
    let cpu = SimCpuMemory::new(0, RAM_SIZE as usize);
    let gpu = SimGpuMemory::new(cpu.clone(), 0, 0, RAM_SIZE);
    let cache = BufferCache::new(runtime, gpu, cpu.clone(), config);
    (cache, cpu)
}

/// Config with the deferred-download gate closed, for tests that are not
/// about the async queue.
pub fn sync_config() -> CacheConfig {
    CacheConfig {
        gpu_accuracy: GpuAccuracy::High,
        use_asynchronous_gpu_emulation: false,
    }
}

/// Config with deferred downloads enabled.
pub fn async_config() -> CacheConfig {
    CacheConfig {
        gpu_accuracy: GpuAccuracy::High,
        use_asynchronous_gpu_emulation: true,
    }
}

/// Program one vertex array slot and raise its dirty flags.
pub fn bind_vertex_array<B: SimBackend>(
    cache: &mut BufferCache<B>,
    index: usize,
    cpu_addr: u64,
    size: u64,
    stride: u32,
) {
    let regs = cache.graphics_mut();
    regs.vertex_arrays[index] = VertexArrayRegs {
        enable: true,
        start_address: cpu_addr,
        limit_address: cpu_addr + size - 1,
        stride,
    };
    regs.dirty.vertex_buffers = true;
    regs.dirty.vertex_buffer[index] = true;
}

/// Write a storage buffer descriptor (`u64` GPU address + `u32` size) into
/// guest memory.
pub fn write_storage_descriptor(cpu: &SimCpuMemory, desc_addr: u64, gpu_addr: u64, size: u32) {
    cpu.write(desc_addr, &gpu_addr.to_le_bytes());
    cpu.write(desc_addr + 8, &size.to_le_bytes());
}

/// Deterministic byte pattern for filling and comparing regions.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i as u8).wrapping_mul(31)))
        .collect()
}

pub fn fill_pattern(cpu: &SimCpuMemory, cpu_addr: u64, seed: u8, len: usize) {
    cpu.write(cpu_addr, &pattern(seed, len));
}
