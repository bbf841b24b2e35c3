use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use caravel_types::Hash256;

use crate::bus::ContractMetadata;
use crate::cancel::CancelToken;
use crate::error::UploadError;
use crate::host::LOCK_PRIORITY_UPLOAD;
use crate::object::{sector_root, SECTOR_SIZE};
use crate::testutil::{test_config, test_contracts, test_env, TestEnv};
use crate::upload::Uploader;

/// Candidates in the same order as `contracts`, so tests can predict which
/// host serves which shard index.
fn ordered_candidates(env: &TestEnv, contracts: &[ContractMetadata]) -> Vec<Arc<Uploader>> {
    let snapshot = env.manager.uploaders_snapshot();
    contracts
        .iter()
        .map(|c| {
            snapshot
                .iter()
                .find(|u| u.host_key() == c.host_key)
                .expect("uploader for contract")
                .clone()
        })
        .collect()
}

fn shard_batch(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| vec![i as u8 + 1; 1024]).collect()
}

#[test]
fn upload_shards_uploads_every_index() {
    let env = test_env(test_config());
    let contracts = test_contracts(5);
    let upload = env
        .manager
        .new_upload(4, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let candidates = ordered_candidates(&env, &contracts);

    let shards = shard_batch(4);
    let roots: Vec<Hash256> = shards.iter().map(|s| sector_root(s)).collect();

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(4 * SECTOR_SIZE, &ctx).unwrap();
    let (sectors, overdrive_pct, _speed) = upload
        .upload_shards(&ctx, shards, candidates, &mut mem, 0, Duration::ZERO)
        .unwrap();

    assert_eq!(sectors.len(), 4);
    for (i, sector) in sectors.iter().enumerate() {
        assert_eq!(sector.root, roots[i], "sector {i} root mismatch");
        assert!(!sector.root.is_zero());
    }
    // One host per shard index.
    let hosts: HashSet<_> = sectors.iter().map(|s| s.latest_host).collect();
    assert_eq!(hosts.len(), 4);
    assert_eq!(overdrive_pct, 0.0);

    // Every granted byte was progressively released.
    assert_eq!(mem.remaining(), 0);
    drop(mem);
    assert_eq!(
        env.manager.memory().available(),
        env.manager.memory().limit()
    );
}

#[test]
fn upload_shards_without_candidates_fails() {
    let env = test_env(test_config());
    let contracts = test_contracts(2);
    let upload = env
        .manager
        .new_upload(2, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(2 * SECTOR_SIZE, &ctx).unwrap();
    let err = upload
        .upload_shards(&ctx, shard_batch(2), Vec::new(), &mut mem, 0, Duration::ZERO)
        .unwrap_err();
    assert!(matches!(err, UploadError::NoCandidateUploader));
}

#[test]
fn failed_attempt_is_redispatched_to_next_candidate() {
    let env = test_env(test_config());
    let contracts = test_contracts(3);
    // First candidate always fails.
    env.hosts.host(contracts[0].host_key).fail_next(u32::MAX);

    let upload = env
        .manager
        .new_upload(2, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let candidates = ordered_candidates(&env, &contracts);

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(2 * SECTOR_SIZE, &ctx).unwrap();
    let (sectors, _, _) = upload
        .upload_shards(&ctx, shard_batch(2), candidates, &mut mem, 0, Duration::ZERO)
        .unwrap();

    assert_eq!(sectors.len(), 2);
    assert_eq!(env.hosts.host(contracts[0].host_key).upload_count(), 0);
    // The spare host picked up the failed shard.
    assert_eq!(env.hosts.host(contracts[2].host_key).upload_count(), 1);

    // The failure penalty pushes the bad host to the back of the candidate
    // order once stats recompute.
    std::thread::sleep(Duration::from_millis(3));
    let upload = env
        .manager
        .new_upload(2, &contracts, 2, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let candidates = env.manager.candidates(&upload.allowed);
    assert_eq!(
        candidates.last().unwrap().host_key(),
        contracts[0].host_key
    );
    let estimates: Vec<f64> = candidates.iter().map(|u| u.estimate()).collect();
    assert!(
        estimates.windows(2).all(|w| w[0] <= w[1]),
        "candidates not sorted by estimate: {estimates:?}"
    );
}

#[test]
fn exhausted_candidates_fail_with_aggregated_errors() {
    let env = test_env(test_config());
    let contracts = test_contracts(3);
    for c in &contracts {
        env.hosts.host(c.host_key).fail_next(u32::MAX);
    }

    let upload = env
        .manager
        .new_upload(2, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let candidates = ordered_candidates(&env, &contracts);

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(2 * SECTOR_SIZE, &ctx).unwrap();
    let err = upload
        .upload_shards(&ctx, shard_batch(2), candidates, &mut mem, 0, Duration::ZERO)
        .unwrap_err();

    match err {
        UploadError::SlabUpload(e) => {
            assert_eq!(e.uploaded, 0);
            assert_eq!(e.remaining, 2);
            assert_eq!(e.candidates, 3);
            assert!(!e.errors.is_empty());
        }
        other => panic!("expected SlabUpload error, got {other}"),
    }
}

#[test]
fn overdrive_rescues_a_slow_host() {
    let env = test_env(test_config());
    let contracts = test_contracts(5);
    // Shard 1 lands on the second candidate, which stalls well past the
    // overdrive timeout.
    let slow = contracts[1].host_key;
    env.hosts.host(slow).set_delay(Duration::from_millis(600));

    let upload = env
        .manager
        .new_upload(4, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let candidates = ordered_candidates(&env, &contracts);

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(4 * SECTOR_SIZE, &ctx).unwrap();
    let (sectors, overdrive_pct, _) = upload
        .upload_shards(
            &ctx,
            shard_batch(4),
            candidates,
            &mut mem,
            3,
            Duration::from_millis(50),
        )
        .unwrap();

    assert_eq!(sectors.len(), 4);
    // The slow host's eventual response is discarded; the spare host carried
    // its index.
    assert_eq!(sectors[1].latest_host, contracts[4].host_key);
    assert!(sectors.iter().all(|s| s.latest_host != slow));
    assert!(overdrive_pct > 0.0, "expected at least one overdrive");
}

#[test]
fn max_revision_requeues_on_the_same_uploader() {
    let env = test_env(test_config());
    let contracts = test_contracts(1);
    let contract = contracts[0].clone();
    env.locker.set_max_revision(contract.id);

    let upload = env
        .manager
        .new_upload(1, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let candidates = ordered_candidates(&env, &contracts);

    // Lift the ceiling shortly; until then the request bounces on the same
    // uploader.
    let locker = Arc::clone(&env.locker);
    let contract_id = contract.id;
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        locker.clear_max_revision(contract_id);
    });

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(SECTOR_SIZE, &ctx).unwrap();
    let (sectors, _, _) = upload
        .upload_shards(&ctx, shard_batch(1), candidates, &mut mem, 0, Duration::ZERO)
        .unwrap();

    assert_eq!(sectors.len(), 1);
    assert_eq!(sectors[0].latest_host, contract.host_key);
    assert_eq!(env.hosts.host(contract.host_key).upload_count(), 1);
    assert!(
        env.locker.call_count(contract.id) >= 2,
        "expected a requeued attempt on the same contract"
    );
}

#[test]
fn gouging_host_is_skipped() {
    use crate::testutil::{RejectHosts, TestBus, TestHostProvider, TestRevisionLocker};
    use crate::upload::UploadManager;

    let contracts = test_contracts(3);
    let rejected = contracts[0].host_key;

    let bus = TestBus::new();
    let hosts = TestHostProvider::new();
    let locker = TestRevisionLocker::new();
    let manager = UploadManager::new(
        bus.clone(),
        hosts.clone(),
        locker.clone(),
        Arc::new(RejectHosts(HashSet::from([rejected]))),
        test_config(),
    )
    .unwrap();

    let upload = manager
        .new_upload(2, &contracts, 1, LOCK_PRIORITY_UPLOAD)
        .unwrap();
    let snapshot = manager.uploaders_snapshot();
    let candidates: Vec<Arc<Uploader>> = contracts
        .iter()
        .map(|c| {
            snapshot
                .iter()
                .find(|u| u.host_key() == c.host_key)
                .unwrap()
                .clone()
        })
        .collect();

    let ctx = CancelToken::new();
    let mut mem = manager.memory().acquire(2 * SECTOR_SIZE, &ctx).unwrap();
    let (sectors, _, _) = upload
        .upload_shards(&ctx, shard_batch(2), candidates, &mut mem, 0, Duration::ZERO)
        .unwrap();

    assert_eq!(sectors.len(), 2);
    assert!(sectors.iter().all(|s| s.latest_host != rejected));
    assert_eq!(hosts.host(rejected).upload_count(), 0);
}
