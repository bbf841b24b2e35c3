use std::sync::Arc;
use std::time::Duration;

use crate::host::LOCK_PRIORITY_BLOCKED_UPLOAD;
use crate::testutil::{pattern_data, test_config, test_contracts, test_env, wait_for};
use crate::upload::RedundancySettings;

const RS: RedundancySettings = RedundancySettings {
    min_shards: 2,
    total_shards: 4,
};

#[test]
fn drains_the_packed_slab_queue() {
    let env = test_env(test_config());
    let contracts = test_contracts(4);
    env.bus.set_contracts(contracts.clone());

    let first = env.bus.push_packed_slab(pattern_data(1024));
    let second = env.bus.push_packed_slab(pattern_data(2048));

    let uploaded = env
        .manager
        .upload_packed_slabs(RS, "autopilot", LOCK_PRIORITY_BLOCKED_UPLOAD)
        .unwrap();
    assert_eq!(uploaded, 2);

    let marked = env.bus.packed_uploaded();
    assert_eq!(marked.len(), 2);
    let mut buffer_ids: Vec<u64> = marked.iter().map(|s| s.buffer_id).collect();
    buffer_ids.sort_unstable();
    assert_eq!(buffer_ids, vec![first, second]);
    for slab in &marked {
        assert_eq!(slab.shards.len(), RS.total_shards as usize);
        assert!(slab.shards.iter().all(|s| !s.root.is_zero()));
    }

    // Each packed upload was tracked and finished.
    assert_eq!(env.bus.tracked().len(), 2);
    assert_eq!(env.bus.finished().len(), 2);

    let memory = Arc::clone(env.manager.memory());
    assert!(
        wait_for(Duration::from_secs(2), || memory.available()
            == memory.limit()),
        "memory not fully released"
    );
}

#[test]
fn empty_queue_is_a_noop() {
    let env = test_env(test_config());
    env.bus.set_contracts(test_contracts(4));

    let uploaded = env
        .manager
        .upload_packed_slabs(RS, "autopilot", LOCK_PRIORITY_BLOCKED_UPLOAD)
        .unwrap();
    assert_eq!(uploaded, 0);
    assert!(env.bus.packed_uploaded().is_empty());
}

#[test]
fn host_failures_surface_and_nothing_is_marked() {
    let env = test_env(test_config());
    let contracts = test_contracts(4);
    env.bus.set_contracts(contracts.clone());
    for c in &contracts {
        env.hosts.host(c.host_key).fail_next(u32::MAX);
    }
    env.bus.push_packed_slab(pattern_data(1024));

    let err = env
        .manager
        .upload_packed_slabs(RS, "autopilot", LOCK_PRIORITY_BLOCKED_UPLOAD)
        .unwrap_err();
    assert!(err.to_string().contains("failed to upload slab"));
    assert!(env.bus.packed_uploaded().is_empty());

    let memory = Arc::clone(env.manager.memory());
    assert!(
        wait_for(Duration::from_secs(2), || memory.available()
            == memory.limit()),
        "memory not fully released"
    );
}
