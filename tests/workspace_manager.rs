use opcheck::{Device, Workspace, WorkspaceManager};

#[test]
fn zero_size_request_allocates_nothing() {
    let manager = WorkspaceManager::new(&Device::cpu());
    let workspace = manager.acquire(0).expect("empty workspace");
    assert!(workspace.is_empty());
    assert!(workspace.buffer().is_none());
    assert_eq!(manager.stats().allocations, 0);
    assert!(Workspace::empty().buffer().is_none());
}

#[test]
fn workspaces_are_tracked_until_dropped() {
    let manager = WorkspaceManager::new(&Device::cpu());
    let first = manager.acquire(2048).expect("first");
    let second = manager.acquire(512).expect("second");
    assert_eq!(first.size(), 2048);
    assert_eq!(first.buffer().expect("buffer").len(), 2048);
    assert!(!first
        .buffer()
        .expect("buffer")
        .same_region(second.buffer().expect("buffer")));

    let stats = manager.stats();
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.live_bytes, 2560);
    assert_eq!(stats.peak_bytes, 2560);

    drop(second);
    drop(first);
    let stats = manager.stats();
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(stats.peak_bytes, 2560);

    let _third = manager.acquire(100).expect("third");
    assert_eq!(manager.stats().peak_bytes, 2560);
}

#[test]
fn workspace_memory_starts_zeroed() {
    let manager = WorkspaceManager::new(&Device::cpu_stream(0));
    let workspace = manager.acquire(64).expect("workspace");
    let bytes = workspace.buffer().expect("buffer").to_vec().expect("bytes");
    assert!(bytes.iter().all(|byte| *byte == 0));
    assert_eq!(manager.device().name(), "cpu-stream:0");
}
