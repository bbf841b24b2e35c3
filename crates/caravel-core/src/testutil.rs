use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use caravel_types::{FileContractId, Hash256, PublicKey, UploadId};

use crate::bus::{
    AddObjectOptions, ContractMetadata, GougingParams, MetadataService, PackedSlab, UploadParams,
    UploadedPackedSlab,
};
use crate::cancel::CancelToken;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::host::{
    ContractRevision, GougingChecker, HostProvider, HostSession, RevisionLockRequest,
    RevisionLocker,
};
use crate::object::{sector_root, EncryptionKey, Object, Slab, SlabSlice};
use crate::upload::UploadManager;

/// Deterministic byte pattern for upload payloads.
pub fn pattern_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_contracts(n: usize) -> Vec<ContractMetadata> {
    (0..n)
        .map(|i| ContractMetadata {
            id: FileContractId::generate(),
            host_key: PublicKey::generate(),
            host_address: format!("host{i}.test:9982"),
            window_end: 1000 + i as u64,
            renewed_from: None,
        })
        .collect()
}

/// Config for tests: overdrive off unless a test enables it, a small memory
/// ceiling, and an effectively unthrottled stats recompute.
pub fn test_config() -> UploadConfig {
    UploadConfig {
        max_overdrive: 0,
        overdrive_timeout_ms: 0,
        stats_recompute_min_interval_ms: Some(1),
        max_memory_mib: Some(64),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// In-memory metadata service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    tracked: Vec<UploadId>,
    finished: Vec<UploadId>,
    uploading_sectors: Vec<(UploadId, FileContractId, Hash256)>,
    objects: HashMap<String, (Object, AddObjectOptions)>,
    parts: Vec<(String, String, u64, Vec<SlabSlice>)>,
    partial_buffers: Vec<Vec<u8>>,
    packed_queue: VecDeque<PackedSlab>,
    packed_uploaded: Vec<UploadedPackedSlab>,
    updated_slabs: Vec<(Slab, String)>,
    contracts: Vec<ContractMetadata>,
    next_buffer_id: u64,
    buffer_limit_reached: bool,
}

/// In-memory `MetadataService` recording every call for assertions.
#[derive(Default)]
pub struct TestBus {
    state: Mutex<BusState>,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(TestBus::default())
    }

    pub fn set_contracts(&self, contracts: Vec<ContractMetadata>) {
        lock(&self.state).contracts = contracts;
    }

    pub fn set_buffer_limit_reached(&self, reached: bool) {
        lock(&self.state).buffer_limit_reached = reached;
    }

    pub fn tracked(&self) -> Vec<UploadId> {
        lock(&self.state).tracked.clone()
    }

    pub fn finished(&self) -> Vec<UploadId> {
        lock(&self.state).finished.clone()
    }

    pub fn uploading_sector_count(&self) -> usize {
        lock(&self.state).uploading_sectors.len()
    }

    pub fn object(&self, bucket: &str, path: &str) -> Option<(Object, AddObjectOptions)> {
        lock(&self.state).objects.get(&format!("{bucket}{path}")).cloned()
    }

    pub fn parts(&self) -> Vec<(String, String, u64, Vec<SlabSlice>)> {
        lock(&self.state).parts.clone()
    }

    pub fn partial_buffers(&self) -> Vec<Vec<u8>> {
        lock(&self.state).partial_buffers.clone()
    }

    pub fn packed_uploaded(&self) -> Vec<UploadedPackedSlab> {
        lock(&self.state).packed_uploaded.clone()
    }

    pub fn updated_slabs(&self) -> Vec<(Slab, String)> {
        lock(&self.state).updated_slabs.clone()
    }

    pub fn push_packed_slab(&self, data: Vec<u8>) -> u64 {
        let mut state = lock(&self.state);
        let buffer_id = state.next_buffer_id;
        state.next_buffer_id += 1;
        state.packed_queue.push_back(PackedSlab {
            buffer_id,
            data,
            key: EncryptionKey::generate(),
        });
        buffer_id
    }
}

impl MetadataService for TestBus {
    fn track_upload(&self, upload_id: UploadId) -> Result<()> {
        lock(&self.state).tracked.push(upload_id);
        Ok(())
    }

    fn finish_upload(&self, upload_id: UploadId) -> Result<()> {
        lock(&self.state).finished.push(upload_id);
        Ok(())
    }

    fn add_uploading_sector(
        &self,
        upload_id: UploadId,
        contract: FileContractId,
        root: Hash256,
    ) -> Result<()> {
        lock(&self.state)
            .uploading_sectors
            .push((upload_id, contract, root));
        Ok(())
    }

    fn packed_slabs_for_upload(
        &self,
        _lock_duration: Duration,
        _min_shards: u8,
        _total_shards: u8,
        _contract_set: &str,
        limit: usize,
    ) -> Result<Vec<PackedSlab>> {
        let mut state = lock(&self.state);
        let mut out = Vec::new();
        while out.len() < limit {
            match state.packed_queue.pop_front() {
                Some(ps) => out.push(ps),
                None => break,
            }
        }
        Ok(out)
    }

    fn mark_packed_slabs_uploaded(&self, slabs: &[UploadedPackedSlab]) -> Result<()> {
        lock(&self.state).packed_uploaded.extend_from_slice(slabs);
        Ok(())
    }

    fn contract_set_contracts(&self, _contract_set: &str) -> Result<Vec<ContractMetadata>> {
        Ok(lock(&self.state).contracts.clone())
    }

    fn upload_params(&self) -> Result<UploadParams> {
        Ok(UploadParams {
            current_height: 10,
            gouging: GougingParams::default(),
        })
    }

    fn add_partial_slab(
        &self,
        data: &[u8],
        min_shards: u8,
        _total_shards: u8,
        _contract_set: &str,
    ) -> Result<(Vec<SlabSlice>, bool)> {
        let mut state = lock(&self.state);
        state.partial_buffers.push(data.to_vec());
        let buffer_id = state.next_buffer_id;
        state.next_buffer_id += 1;
        let key = EncryptionKey::generate();
        state.packed_queue.push_back(PackedSlab {
            buffer_id,
            data: data.to_vec(),
            key: key.clone(),
        });
        let slice = SlabSlice {
            slab: Slab {
                key,
                min_shards,
                shards: Vec::new(),
            },
            offset: 0,
            length: data.len() as u32,
        };
        Ok((vec![slice], state.buffer_limit_reached))
    }

    fn add_object(
        &self,
        bucket: &str,
        path: &str,
        _contract_set: &str,
        object: Object,
        opts: AddObjectOptions,
    ) -> Result<()> {
        lock(&self.state)
            .objects
            .insert(format!("{bucket}{path}"), (object, opts));
        Ok(())
    }

    fn add_multipart_part(
        &self,
        _bucket: &str,
        _path: &str,
        _contract_set: &str,
        etag: &str,
        upload_id: &str,
        part_number: u64,
        slabs: Vec<SlabSlice>,
    ) -> Result<()> {
        lock(&self.state)
            .parts
            .push((upload_id.to_string(), etag.to_string(), part_number, slabs));
        Ok(())
    }

    fn update_slab(&self, slab: Slab, contract_set: &str) -> Result<()> {
        lock(&self.state)
            .updated_slabs
            .push((slab, contract_set.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake hosts
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HostBehavior {
    delay: Duration,
    fail_remaining: u32,
}

/// One fake host; per-host behavior is configurable by key.
pub struct TestHost {
    behavior: Mutex<HostBehavior>,
    uploads: Mutex<Vec<(FileContractId, Hash256)>>,
}

impl TestHost {
    fn new() -> Arc<Self> {
        Arc::new(TestHost {
            behavior: Mutex::new(HostBehavior::default()),
            uploads: Mutex::new(Vec::new()),
        })
    }

    /// Delay every subsequent upload by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.behavior).delay = delay;
    }

    /// Fail the next `n` uploads.
    pub fn fail_next(&self, n: u32) {
        lock(&self.behavior).fail_remaining = n;
    }

    pub fn upload_count(&self) -> usize {
        lock(&self.uploads).len()
    }

    pub fn uploads(&self) -> Vec<(FileContractId, Hash256)> {
        lock(&self.uploads).clone()
    }
}

impl HostSession for TestHost {
    fn upload_sector(
        &self,
        _ctx: &CancelToken,
        sector: &[u8],
        revision: &ContractRevision,
    ) -> Result<Hash256> {
        let (delay, fail) = {
            let mut behavior = lock(&self.behavior);
            let fail = behavior.fail_remaining > 0;
            if fail {
                behavior.fail_remaining -= 1;
            }
            (behavior.delay, fail)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if fail {
            return Err(UploadError::Host("induced failure".into()));
        }
        let root = sector_root(sector);
        lock(&self.uploads).push((revision.contract_id, root));
        Ok(root)
    }
}

/// Hands out `TestHost` sessions keyed by host key, creating them on demand.
#[derive(Default)]
pub struct TestHostProvider {
    hosts: Mutex<HashMap<PublicKey, Arc<TestHost>>>,
}

impl TestHostProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(TestHostProvider::default())
    }

    /// The fake host for `key`, created if it does not exist yet.
    pub fn host(&self, key: PublicKey) -> Arc<TestHost> {
        Arc::clone(lock(&self.hosts).entry(key).or_insert_with(TestHost::new))
    }
}

impl HostProvider for TestHostProvider {
    fn new_session(
        &self,
        _contract: FileContractId,
        host_key: PublicKey,
        _host_address: &str,
    ) -> Arc<dyn HostSession> {
        self.host(host_key)
    }
}

// ---------------------------------------------------------------------------
// Fake revision locker and gouging checker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LockerState {
    calls: HashMap<FileContractId, u64>,
    max_revision: HashSet<FileContractId>,
}

/// Revision locker with monotonically increasing revision numbers per
/// contract and an optional max-revision trigger.
#[derive(Default)]
pub struct TestRevisionLocker {
    state: Mutex<LockerState>,
}

impl TestRevisionLocker {
    pub fn new() -> Arc<Self> {
        Arc::new(TestRevisionLocker::default())
    }

    /// Make every lock on `contract` yield a revision at its ceiling until
    /// [`clear_max_revision`] is called.
    ///
    /// [`clear_max_revision`]: TestRevisionLocker::clear_max_revision
    pub fn set_max_revision(&self, contract: FileContractId) {
        lock(&self.state).max_revision.insert(contract);
    }

    pub fn clear_max_revision(&self, contract: FileContractId) {
        lock(&self.state).max_revision.remove(&contract);
    }

    pub fn call_count(&self, contract: FileContractId) -> u64 {
        lock(&self.state).calls.get(&contract).copied().unwrap_or(0)
    }
}

impl RevisionLocker for TestRevisionLocker {
    fn with_revision(
        &self,
        ctx: &CancelToken,
        req: RevisionLockRequest<'_>,
        f: &mut dyn FnMut(&ContractRevision) -> Result<Hash256>,
    ) -> Result<Hash256> {
        if ctx.is_canceled() {
            return Err(UploadError::Canceled);
        }
        // Keep the requeue-on-max-revision path from spinning hot.
        std::thread::sleep(Duration::from_millis(1));
        let revision_number = {
            let mut state = lock(&self.state);
            let count = state.calls.entry(req.contract).or_insert(0);
            *count += 1;
            let count = *count;
            if state.max_revision.contains(&req.contract) {
                u64::MAX
            } else {
                count
            }
        };
        f(&ContractRevision {
            contract_id: req.contract,
            revision_number,
        })
    }
}

/// Gouging checker that accepts every host.
pub struct NoGouging;

impl GougingChecker for NoGouging {
    fn check_upload(&self, _host_key: &PublicKey) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Gouging checker that rejects a fixed set of hosts.
pub struct RejectHosts(pub HashSet<PublicKey>);

impl GougingChecker for RejectHosts {
    fn check_upload(&self, host_key: &PublicKey) -> std::result::Result<(), String> {
        if self.0.contains(host_key) {
            Err("sector price exceeds maximum".into())
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Assembled environment
// ---------------------------------------------------------------------------

pub struct TestEnv {
    pub bus: Arc<TestBus>,
    pub hosts: Arc<TestHostProvider>,
    pub locker: Arc<TestRevisionLocker>,
    pub manager: Arc<UploadManager>,
}

pub fn test_env(config: UploadConfig) -> TestEnv {
    let bus = TestBus::new();
    let hosts = TestHostProvider::new();
    let locker = TestRevisionLocker::new();
    let manager = UploadManager::new(
        bus.clone(),
        hosts.clone(),
        locker.clone(),
        Arc::new(NoGouging),
        config,
    )
    .expect("valid test config");
    TestEnv {
        bus,
        hosts,
        locker,
        manager,
    }
}
