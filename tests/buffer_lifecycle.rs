//! Buffer creation, overlap absorption, stream leaps and the directory
//! invariants that hold them together.

mod common;

use common::{bind_vertex_array, new_cache, sync_config};
use gpu_buffer_cache::sim::SimOpenGl;
use gpu_buffer_cache::{BufferCache, PAGE_SIZE};
use pretty_assertions::assert_eq;

#[test]
fn creates_buffer_without_overlap() {
    let (mut cache, _cpu) = new_cache::<SimOpenGl>(sync_config());

    bind_vertex_array(&mut cache, 0, 0x1_0000, 0x8000, 16);
    cache.update_graphics_buffers(false);

    let buffers = cache.registered_buffers();
    assert_eq!(buffers.len(), 1);
    let (id, cpu_addr, size) = buffers[0];
    assert_eq!((cpu_addr, size), (0x1_0000, 0x8000));
    assert_eq!(cache.vertex_buffer_binding(0).buffer_id, id);

    assert!(cache.buffer_id_for_page(0).is_null());
    assert_eq!(cache.buffer_id_for_page(1), id);
    assert!(cache.buffer_id_for_page(2).is_null());
}

#[test]
fn absorbs_overlapping_buffers_into_one_span() {
    let (mut cache, _cpu) = new_cache::<SimOpenGl>(sync_config());

    bind_vertex_array(&mut cache, 0, 0x1_0000, 0x1_0000, 16);
    cache.update_graphics_buffers(false);
    bind_vertex_array(&mut cache, 1, 0x3_0000, 0x1_0000, 16);
    cache.update_graphics_buffers(false);
    assert_eq!(cache.registered_buffers().len(), 2);

    // A request crossing both buffers replaces them with one covering span.
    bind_vertex_array(&mut cache, 2, 0x1_8000, 0x2_0000, 16);
    cache.update_graphics_buffers(false);

    let buffers = cache.registered_buffers();
    assert_eq!(buffers.len(), 1);
    let (id, cpu_addr, size) = buffers[0];
    assert_eq!((cpu_addr, size), (0x1_0000, 0x3_0000));
    for page in 1..4 {
        assert_eq!(cache.buffer_id_for_page(page), id);
    }
    assert!(cache.buffer_id_for_page(4).is_null());

    // Every binding that referenced a predecessor was re-resolved to the
    // new buffer.
    assert_eq!(cache.vertex_buffer_binding(0).buffer_id, id);
    assert_eq!(cache.vertex_buffer_binding(1).buffer_id, id);
    assert_eq!(cache.vertex_buffer_binding(2).buffer_id, id);
}

/// Grow the buffer at `base` through several absorptions until its stream
/// score reaches 3.
fn grow_stream_score(cache: &mut BufferCache<SimOpenGl>, base: u64) {
    for size in [0x8000, 0x1_0000, 0x2_0000, 0x3_0000] {
        bind_vertex_array(cache, 0, base, size, 16);
        cache.update_graphics_buffers(false);
    }
}

#[test]
fn stream_leap_overallocates_streaming_regions() {
    let (mut cache, _cpu) = new_cache::<SimOpenGl>(sync_config());

    // Seven disjoint buffers, each with stream score 3.
    let arena = 0x10_0000;
    for k in 0..7u64 {
        grow_stream_score(&mut cache, arena + k * 0x4_0000);
    }
    assert_eq!(cache.registered_buffers().len(), 7);

    // One creation absorbing all of them crosses the leap threshold and
    // over-allocates by 256 pages.
    let request_end = arena + 6 * 0x4_0000 + 0x3_0000;
    bind_vertex_array(&mut cache, 1, arena, request_end - arena, 16);
    cache.update_graphics_buffers(false);

    let buffers = cache.registered_buffers();
    assert_eq!(buffers.len(), 1);
    let (_, cpu_addr, size) = buffers[0];
    assert_eq!(cpu_addr, arena);
    assert_eq!(size, (request_end - arena) + 256 * PAGE_SIZE);

    // The leaped buffer did not inherit the absorbed stream scores, so the
    // next growth does not leap again.
    bind_vertex_array(&mut cache, 1, arena, size + 0x1_0000, 16);
    cache.update_graphics_buffers(false);
    let buffers = cache.registered_buffers();
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].2, size + 0x1_0000);
}

#[test]
fn directory_and_disjointness_hold_under_random_traffic() {
    let (mut cache, _cpu) = new_cache::<SimOpenGl>(sync_config());

    let arena = 0x40_0000u64;
    let arena_pages = 32u64;
    let mut state = 0x243f_6a88_85a3_08d3u64;
    let mut rng = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        state >> 33
    };

    for _ in 0..64 {
        let slot = (rng() % 8) as usize;
        let page = rng() % (arena_pages - 4);
        let cpu_addr = arena + page * PAGE_SIZE + (rng() % 0x400) * 4;
        let size = PAGE_SIZE + rng() % (3 * PAGE_SIZE);
        bind_vertex_array(&mut cache, slot, cpu_addr, size, 16);
        cache.update_graphics_buffers(false);

        let mut buffers = cache.registered_buffers();
        buffers.sort_by_key(|&(_, addr, _)| addr);

        // No two registered buffers overlap.
        for pair in buffers.windows(2) {
            let (_, a_addr, a_size) = pair[0];
            let (_, b_addr, _) = pair[1];
            assert!(a_addr + a_size <= b_addr);
        }

        // The directory is exact: pages inside a buffer map to its id,
        // pages outside every buffer are empty.
        for check_page in 0..(arena_pages + 64) {
            let page_index = (arena >> 16) + check_page;
            let entry = cache.buffer_id_for_page(page_index);
            let owner = buffers.iter().find(|&&(_, addr, size)| {
                let first = addr >> 16;
                let last = (addr + size).div_ceil(PAGE_SIZE);
                (first..last).contains(&page_index)
            });
            match owner {
                Some(&(id, _, _)) => assert_eq!(entry, id),
                None => assert!(entry.is_null()),
            }
        }
    }
}
