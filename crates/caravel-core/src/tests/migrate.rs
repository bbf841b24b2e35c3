use std::collections::BTreeMap;

use caravel_types::{FileContractId, Hash256, PublicKey};

use crate::cancel::CancelToken;
use crate::host::LOCK_PRIORITY_UPLOAD;
use crate::object::{Sector, Slab, SECTOR_SIZE};
use crate::testutil::{test_config, test_contracts, test_env};

fn existing_sector(tag: &[u8]) -> (Sector, PublicKey, FileContractId) {
    let host = PublicKey::generate();
    let contract = FileContractId::generate();
    let mut contracts = BTreeMap::new();
    contracts.insert(host, vec![contract]);
    (
        Sector {
            root: Hash256::compute(tag),
            latest_host: host,
            contracts,
        },
        host,
        contract,
    )
}

#[test]
fn migrate_merges_new_sectors_into_the_slab() {
    let env = test_env(test_config());
    let contracts = test_contracts(4);
    let new_hosts: Vec<PublicKey> = contracts.iter().map(|c| c.host_key).collect();

    let (keep, keep_host, _) = existing_sector(b"keep");
    let (stale_a, _, stale_a_contract) = existing_sector(b"stale-a");
    let (stale_b, _, stale_b_contract) = existing_sector(b"stale-b");

    let mut slab = Slab::new(2);
    slab.shards = vec![keep, stale_a, stale_b];

    let shards = vec![vec![0xA1u8; 1024], vec![0xB2u8; 1024]];
    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(2 * SECTOR_SIZE, &ctx).unwrap();
    env.manager
        .migrate_shards(
            &ctx,
            &mut slab,
            &[1, 2],
            shards,
            "autopilot",
            &contracts,
            7,
            LOCK_PRIORITY_UPLOAD,
            &mut mem,
        )
        .unwrap();

    // Position 0 untouched.
    assert_eq!(slab.shards[0].latest_host, keep_host);

    // Migrated positions point at fresh hosts and keep their old bindings.
    for (index, old_contract) in [(1usize, stale_a_contract), (2, stale_b_contract)] {
        let sector = &slab.shards[index];
        assert!(
            new_hosts.contains(&sector.latest_host),
            "shard {index} not re-homed"
        );
        let all_contracts: Vec<FileContractId> =
            sector.contracts.values().flatten().copied().collect();
        assert!(
            all_contracts.contains(&old_contract),
            "shard {index} lost its old contract binding"
        );
        assert!(
            all_contracts.len() >= 2,
            "shard {index} gained no new contract"
        );
    }

    // The merged descriptor was persisted.
    let updated = env.bus.updated_slabs();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].1, "autopilot");
    assert_eq!(updated[0].0.shards.len(), 3);

    assert_eq!(env.bus.tracked().len(), 1);
    assert_eq!(env.bus.finished().len(), 1);
}

#[test]
fn migrate_rejects_mismatched_batch() {
    let env = test_env(test_config());
    let contracts = test_contracts(2);

    let mut slab = Slab::new(1);
    slab.shards = vec![existing_sector(b"only").0];

    let ctx = CancelToken::new();
    let mut mem = env.manager.memory().acquire(SECTOR_SIZE, &ctx).unwrap();
    let err = env
        .manager
        .migrate_shards(
            &ctx,
            &mut slab,
            &[0, 1],
            vec![vec![1u8; 128]],
            "autopilot",
            &contracts,
            7,
            LOCK_PRIORITY_UPLOAD,
            &mut mem,
        )
        .unwrap_err();
    assert!(err.to_string().contains("mismatch"));
    assert!(env.bus.updated_slabs().is_empty());
}
