//! End-to-end scenarios exercising the public `VTSystem` façade: the
//! whole-system behaviors (bounded per-frame work, LRU eviction, texture
//! teardown, shutdown) that a complete-system test should verify, as
//! opposed to a single component's unit tests.

use vtpe::{PhysicalSpace, VTSystem, VirtualPageAddress, VtpeConfig, VtpeError};

fn config(num_pages: u32) -> VtpeConfig {
    let _ = env_logger::try_init();
    VtpeConfig::builder()
        .physical_page_size(128)
        .num_physical_pages(num_pages)
        .num_async_workers(1)
        .build()
}

#[test]
fn uninitialized_use_returns_logged_error_not_a_panic() {
    let system = VTSystem::new();
    assert!(matches!(system.stats(), Err(VtpeError::UninitializedUse)));
    assert_eq!(system.stats().unwrap_or_default().num_physical_pages, 0);
}

#[test]
fn double_init_is_idempotent() {
    let system = VTSystem::new();
    assert!(system.init(config(16)).is_ok());
    assert!(system.init(config(16)).is_ok()); // logged warning, not re-initialized
    system.shutdown();
}

#[test]
fn bounded_tick_satisfies_exactly_the_per_frame_cap() {
    let system = VTSystem::new();
    system.init(config(256)).unwrap();

    let vt = system
        .create_virtual_texture(1 << 20, 1 << 20, 1)
        .unwrap();
    for i in 0..100u32 {
        system.record_access(&vt, i, 0, 0).unwrap();
    }
    system.update(1.0 / 60.0).unwrap();

    let stats = system.stats().unwrap();
    assert_eq!(stats.total_page_requests, 100);
    assert_eq!(stats.num_page_faults, 100);

    let resident = (0..100u32).filter(|&i| vt.lock().unwrap().is_resident(i, 0, 0)).count();
    assert_eq!(resident, 32);

    system.shutdown();
}

#[test]
fn dropping_last_virtual_texture_reference_frees_its_pages() {
    let system = VTSystem::new();
    system.init(config(64)).unwrap();

    let vt = system
        .create_virtual_texture(4096, 4096, 1)
        .unwrap();
    for i in 0..10u32 {
        system.record_access(&vt, i, 0, 0).unwrap();
    }
    system.update(0.0).unwrap();
    assert_eq!(system.stats().unwrap().num_free_pages, 54);

    drop(vt);
    assert_eq!(system.stats().unwrap().num_free_pages, 64);

    system.shutdown();
}

#[test]
fn lru_eviction_picks_the_oldest_unpinned_page_across_a_full_system() {
    let system = VTSystem::new();
    system.init(config(4)).unwrap();

    let vt = system.create_virtual_texture(4096, 4096, 1).unwrap();

    // One tick per access so each page's `last_used_frame` is distinct;
    // (0, 0, 0) is the oldest once all four physical pages are full.
    for i in 0..4u32 {
        system.record_access(&vt, i, 0, 0).unwrap();
        system.update(0.0).unwrap();
    }
    assert_eq!(system.stats().unwrap().num_free_pages, 0);

    // A fifth request must evict page (0, 0, 0), the oldest resident one.
    system.record_access(&vt, 100, 0, 0).unwrap();
    system.update(0.0).unwrap();

    assert!(!vt.lock().unwrap().is_resident(0, 0, 0));
    assert!(vt.lock().unwrap().is_resident(100, 0, 0));
    assert_eq!(system.stats().unwrap().num_page_evictions, 1);

    system.shutdown();
}

#[test]
fn virtual_address_round_trips_through_the_whole_stack() {
    for (x, y, m) in [(0, 0, 0), (42, 7, 3), (16383, 16383, 15)] {
        let addr = VirtualPageAddress::encode(x, y, m);
        assert_eq!(addr.decode(), (x, y, m));
    }
}

#[test]
fn shutdown_returns_every_physical_page_to_the_free_list() {
    let system = VTSystem::new();
    system.init(config(32)).unwrap();

    let vt = system.create_virtual_texture(4096, 4096, 1).unwrap();
    for i in 0..20u32 {
        system.record_access(&vt, i, 0, 0).unwrap();
    }
    system.update(0.0).unwrap();
    drop(vt);

    assert_eq!(system.stats().unwrap().num_free_pages, 32);
    system.shutdown();
}

#[test]
fn physical_space_pin_survives_a_concurrent_competing_request() {
    let physical = PhysicalSpace::new(64, 2).unwrap();
    let a = physical.map(VirtualPageAddress::encode(1, 0, 0), 0).unwrap();
    physical.lock_page(a);

    let b = physical.map(VirtualPageAddress::encode(2, 0, 0), 0).unwrap();
    physical.lock_page(b);

    // Both pages pinned: a third distinct address can't be satisfied.
    assert_eq!(
        physical.map(VirtualPageAddress::encode(3, 0, 0), 0),
        None
    );

    physical.unlock_page(a);
    let c = physical.map(VirtualPageAddress::encode(3, 0, 0), 0).unwrap();
    assert_eq!(c, a);
}
