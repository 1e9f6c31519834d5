//! Upload/download engines, the cached-write channel and the deferred
//! download queue.

mod common;

use common::{
    async_config, bind_vertex_array, fill_pattern, new_cache, pattern, sync_config,
    write_storage_descriptor,
};
use gpu_buffer_cache::sim::{HostEvent, SimCpuMemory, SimOpenGl, SimVulkan};
use gpu_buffer_cache::{BufferCache, CacheBackend};
use pretty_assertions::assert_eq;

/// Point a written compute storage buffer at `data_addr` through a
/// descriptor at `desc_addr`, and resolve it.
fn bind_written_compute_storage<B>(
    cache: &mut BufferCache<B>,
    cpu: &SimCpuMemory,
    desc_addr: u64,
    data_addr: u64,
    size: u32,
) where
    B: CacheBackend<CpuMemory = SimCpuMemory>,
{
    cache.compute_mut().const_buffer_enable_mask = 1;
    cache.compute_mut().const_buffers[0].address = desc_addr;
    write_storage_descriptor(cpu, desc_addr, data_addr, size);
    cache.bind_compute_storage_buffer(0, 0, 0, true);
    cache.update_compute_buffers();
}

#[test]
fn deferred_downloads_commit_and_pop() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(async_config());
    let data_addr = 0xb_0000;
    let desc_addr = 0xc_0000;
    bind_written_compute_storage(&mut cache, &cpu, desc_addr, data_addr, 0x100);

    let id = cache.compute_storage_binding(0).buffer_id;
    assert!(!id.is_null());
    assert_eq!(cache.uncommitted_download_ids(), &[id]);
    assert!(cache.has_uncommitted_flushes());

    cache.commit_async_flushes();
    assert!(!cache.has_uncommitted_flushes());
    assert!(cache.should_wait_async_flushes());
    let batches: Vec<_> = cache.committed_download_batches().collect();
    assert_eq!(batches, vec![&[id][..]]);

    // Upload known data, then clobber guest memory behind the cache's back;
    // the pop must restore what the "GPU" had.
    let payload = pattern(0xd1, 0x100);
    fill_pattern(&cpu, data_addr, 0xd1, 0x100);
    cache.bind_host_compute_buffers();
    cpu.write(data_addr, &[0u8; 0x100]);

    cache.pop_async_flushes();
    assert_eq!(cpu.read_vec(data_addr, 0x100), payload);
    assert!(!cache.should_wait_async_flushes());
    assert_eq!(cache.committed_download_batches().count(), 0);

    let events = cache.runtime_mut().take_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, HostEvent::CopyToStaging { .. })));
    assert!(events.contains(&HostEvent::Finish));

    // Popping with nothing committed is a no-op.
    cache.pop_async_flushes();
    assert!(cache.runtime_mut().take_events().is_empty());
}

#[test]
fn mark_written_buffer_is_idempotent() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(async_config());
    bind_written_compute_storage(&mut cache, &cpu, 0xc_0000, 0xb_0000, 0x100);
    assert_eq!(cache.uncommitted_download_ids().len(), 1);

    // Re-resolving the same written binding over and over enqueues once.
    cache.update_compute_buffers();
    cache.update_compute_buffers();
    assert_eq!(cache.uncommitted_download_ids().len(), 1);
}

#[test]
fn pops_execute_oldest_commit_first() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(async_config());
    let first_addr = 0xb_0000;
    let second_addr = 0x20_0000;

    bind_written_compute_storage(&mut cache, &cpu, 0xc_0000, first_addr, 0x100);
    cache.commit_async_flushes();
    bind_written_compute_storage(&mut cache, &cpu, 0xc_0000, second_addr, 0x100);
    cache.commit_async_flushes();

    cache.bind_host_compute_buffers();
    cache.runtime_mut().take_events();

    cache.pop_async_flushes();
    let events = cache.runtime_mut().take_events();
    let sources: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            HostEvent::CopyToStaging { src_addr, .. } => Some(*src_addr),
            _ => None,
        })
        .collect();
    assert_eq!(sources, vec![first_addr]);

    cache.pop_async_flushes();
    let events = cache.runtime_mut().take_events();
    let sources: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            HostEvent::CopyToStaging { src_addr, .. } => Some(*src_addr),
            _ => None,
        })
        .collect();
    assert_eq!(sources, vec![second_addr]);
}

#[test]
fn join_rewrites_download_queues() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(async_config());
    let data_addr = 0xd_0000;
    bind_written_compute_storage(&mut cache, &cpu, 0xc_0000, data_addr, 0x100);
    let old_id = cache.compute_storage_binding(0).buffer_id;

    cache.commit_async_flushes();
    // Mark it written again into a fresh uncommitted list.
    cache.update_compute_buffers();
    assert_eq!(cache.uncommitted_download_ids(), &[old_id]);

    // A vertex request crossing the buffer's end absorbs it.
    bind_vertex_array(&mut cache, 0, data_addr + 0x8000, 0x1_0000, 16);
    cache.update_graphics_buffers(false);

    let new_id = cache.vertex_buffer_binding(0).buffer_id;
    assert_ne!(new_id, old_id);
    assert_eq!(cache.uncommitted_download_ids(), &[new_id]);
    let batches: Vec<_> = cache.committed_download_batches().collect();
    assert_eq!(batches, vec![&[new_id][..]]);

    // The GPU-modified state moved with the join, and the data was copied
    // host-to-host.
    assert!(cache.is_region_gpu_modified(data_addr, 0x100));
    let events = cache.runtime_mut().take_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, HostEvent::CopyBuffer { .. })));

    // The scrubbed compute binding is re-resolved by its next update.
    assert!(cache.compute_storage_binding(0).buffer_id.is_null());
    cache.update_compute_buffers();
    assert_eq!(cache.compute_storage_binding(0).buffer_id, new_id);
}

#[test]
fn synchronous_download_writes_gpu_data_back() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(async_config());
    let data_addr = 0xb_0000;
    bind_written_compute_storage(&mut cache, &cpu, 0xc_0000, data_addr, 0x100);

    let payload = pattern(0x42, 0x100);
    fill_pattern(&cpu, data_addr, 0x42, 0x100);
    cache.bind_host_compute_buffers();
    cpu.write(data_addr, &[0u8; 0x100]);
    cache.runtime_mut().take_events();

    cache.download_memory(data_addr, 0x100);
    assert_eq!(cpu.read_vec(data_addr, 0x100), payload);
    let events = cache.runtime_mut().take_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, HostEvent::CopyToStaging { .. })));
    assert!(events.contains(&HostEvent::Finish));

    // Consumed by the download: the region is clean again.
    assert!(!cache.is_region_gpu_modified(data_addr, 0x100));
}

#[test]
fn synchronous_download_uses_immediate_copies_without_maps() {
    let (mut cache, cpu) = new_cache::<SimOpenGl>(sync_config());
    let data_addr = 0xb_0000;
    bind_written_compute_storage(&mut cache, &cpu, 0xc_0000, data_addr, 0x100);

    let payload = pattern(0x9c, 0x100);
    fill_pattern(&cpu, data_addr, 0x9c, 0x100);
    cache.bind_host_compute_buffers();
    cpu.write(data_addr, &[0u8; 0x100]);
    cache.runtime_mut().take_events();

    cache.download_memory(data_addr, 0x100);
    assert_eq!(cpu.read_vec(data_addr, 0x100), payload);
    // The immediate path never touches staging memory or blocks.
    let events = cache.runtime_mut().take_events();
    assert!(events.is_empty());
}

#[test]
fn write_memory_uploads_only_the_dirty_range() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(sync_config());
    let addr = 0xe_0000;
    fill_pattern(&cpu, addr, 5, 0x1000);

    bind_vertex_array(&mut cache, 0, addr, 0x1000, 16);
    cache.update_graphics_buffers(false);
    cache.bind_host_geometry_buffers(false);
    cache.runtime_mut().take_events();

    // A small CPU write re-uploads exactly its range on the next draw.
    cpu.write(addr + 0x100, &pattern(6, 0x40));
    cache.write_memory(addr + 0x100, 0x40);
    cache.bind_host_geometry_buffers(false);

    let events = cache.runtime_mut().take_events();
    let uploads: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            HostEvent::CopyFromStaging { copies, .. } => Some(copies.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].len(), 1);
    assert_eq!(uploads[0][0].dst_offset, 0x100);
    assert_eq!(uploads[0][0].size, 0x40);
}

#[test]
fn cached_writes_batch_until_flush() {
    let (mut cache, cpu) = new_cache::<SimVulkan>(sync_config());
    let addr = 0xe_0000;
    fill_pattern(&cpu, addr, 7, 0x1000);

    bind_vertex_array(&mut cache, 0, addr, 0x1000, 16);
    cache.update_graphics_buffers(false);
    cache.bind_host_geometry_buffers(false);
    cache.runtime_mut().take_events();

    // A cached write does not reach the upload engine until flushed.
    cpu.write(addr + 0x200, &pattern(8, 0x40));
    cache.cached_write_memory(addr + 0x200, 0x40);
    cache.bind_host_geometry_buffers(false);
    let events = cache.runtime_mut().take_events();
    assert!(!events
        .iter()
        .any(|event| matches!(event, HostEvent::CopyFromStaging { .. })));

    cache.flush_cached_writes();
    cache.bind_host_geometry_buffers(false);
    let events = cache.runtime_mut().take_events();
    let uploads: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            HostEvent::CopyFromStaging { copies, .. } => Some(copies.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0][0].dst_offset, 0x200);
    assert_eq!(uploads[0][0].size, 0x40);

    // Flushing twice is harmless.
    cache.flush_cached_writes();
}
