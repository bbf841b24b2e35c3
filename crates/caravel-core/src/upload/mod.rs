mod params;
mod session;
mod slab;
mod uploader;

pub use params::{RedundancySettings, UploadParameters};

pub(crate) use session::Upload;
pub(crate) use uploader::Uploader;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, select, unbounded, Sender};
use tracing::{debug, error};

use caravel_types::{FileContractId, PublicKey, UploadId};

use crate::bus::{
    AddObjectOptions, ContractMetadata, MetadataService, PackedSlab, UploadedPackedSlab,
};
use crate::cancel::CancelToken;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::host::{
    GougingChecker, HostProvider, RevisionLocker, LOCK_PRIORITY_BACKGROUND_UPLOAD,
    LOCK_PRIORITY_BLOCKED_UPLOAD, LOCK_PRIORITY_UPLOAD,
};
use crate::memory::{MemoryGrant, MemoryManager};
use crate::object::reader::{CipherReader, HashReader};
use crate::object::{erasure, EncryptionKey, Object, Slab, SlabSlice};
use crate::stats::DataPoints;
use crate::upload::session::SlabUploadResponse;

/// Snapshot of upload-side performance counters.
#[derive(Debug, Clone)]
pub struct UploadManagerStats {
    pub avg_slab_upload_speed_mbps: f64,
    pub avg_overdrive_pct: f64,
    pub healthy_uploaders: u64,
    pub num_uploaders: u64,
    pub upload_speeds_mbps: BTreeMap<PublicKey, f64>,
}

// ---------------------------------------------------------------------------
// UploadManager
// ---------------------------------------------------------------------------

/// Owns the per-host uploader pool and drives object, packed-slab, and
/// migration uploads across it.
pub struct UploadManager {
    bus: Arc<dyn MetadataService>,
    host_provider: Arc<dyn HostProvider>,
    revision_locker: Arc<dyn RevisionLocker>,
    gouging: Arc<dyn GougingChecker>,
    memory: Arc<MemoryManager>,
    config: UploadConfig,
    shutdown: CancelToken,

    stats_overdrive_pct: DataPoints,
    stats_slab_speed: DataPoints,

    uploaders: Mutex<Vec<Arc<Uploader>>>,
    /// Keys of packed-slab background loops currently draining; at most one
    /// loop runs per `(redundancy, contract set)`.
    packed_slab_uploads: Mutex<HashSet<String>>,
}

impl UploadManager {
    pub fn new(
        bus: Arc<dyn MetadataService>,
        host_provider: Arc<dyn HostProvider>,
        revision_locker: Arc<dyn RevisionLocker>,
        gouging: Arc<dyn GougingChecker>,
        config: UploadConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let memory = MemoryManager::new(config.max_memory_bytes());
        Ok(Arc::new(UploadManager {
            bus,
            host_provider,
            revision_locker,
            gouging,
            memory,
            config,
            shutdown: CancelToken::new(),
            stats_overdrive_pct: DataPoints::no_decay(),
            stats_slab_speed: DataPoints::no_decay(),
            uploaders: Mutex::new(Vec::new()),
            packed_slab_uploads: Mutex::new(HashSet::new()),
        }))
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Stream `reader` into erasure-coded slabs across the given contracts
    /// and persist the resulting object. Returns the content hash (etag).
    pub fn upload<R: Read + Send + 'static>(
        self: &Arc<Self>,
        ctx: &CancelToken,
        reader: R,
        contracts: Vec<ContractMetadata>,
        params: UploadParameters,
    ) -> Result<String> {
        params.redundancy.validate()?;
        let (buffer_limit_reached, etag) = self.upload_object(ctx, reader, &contracts, &params)?;

        // Packed slabs accumulate in the metadata service; flush them, and
        // block on one pass when the buffer hit its size limit.
        if params.packing {
            self.try_upload_packed_slabs(
                params.redundancy,
                params.contract_set.clone(),
                buffer_limit_reached,
            );
        }
        Ok(etag)
    }

    fn upload_object<R: Read + Send + 'static>(
        self: &Arc<Self>,
        ctx: &CancelToken,
        reader: R,
        contracts: &[ContractMetadata],
        params: &UploadParameters,
    ) -> Result<(bool, String)> {
        // Cancel in-flight slab and sector work once this object settles.
        let ctx = ctx.child();
        let _cancel = ctx.drop_guard();

        let mut object = Object::new();
        let rs = params.redundancy;

        let upload = self.new_upload(
            rs.total_shards as usize,
            contracts,
            params.block_height,
            LOCK_PRIORITY_UPLOAD,
        )?;

        self.bus.track_upload(upload.id)?;
        let _finish = FinishUploadGuard {
            bus: Arc::clone(&self.bus),
            upload_id: upload.id,
        };

        let (response_tx, response_rx) = unbounded::<SlabUploadResponse>();
        let (summary_tx, summary_rx) = bounded::<ProducerSummary>(1);

        {
            let mgr = Arc::clone(self);
            let ctx = ctx.clone();
            let upload = upload.clone();
            let key = object.key.clone();
            let encryption_offset = params.encryption_offset;
            let packing = params.packing;
            std::thread::spawn(move || {
                mgr.produce_slabs(
                    ctx,
                    upload,
                    reader,
                    key,
                    encryption_offset,
                    rs,
                    packing,
                    response_tx,
                    summary_tx,
                );
            });
        }

        // Collect slab responses until the producer has announced how many
        // full slabs to wait for and they have all arrived. The summary arm
        // is only selected while the announcement is outstanding; afterwards
        // its closed channel would spin the loop.
        let mut slabs: Vec<(usize, SlabSlice)> = Vec::new();
        let mut num_slabs: Option<usize> = None;
        let mut partial_slab: Option<Vec<u8>> = None;
        let mut etag = String::new();
        while num_slabs.map_or(true, |n| slabs.len() < n) {
            if num_slabs.is_none() {
                select! {
                    recv(self.shutdown.done()) -> _ => return Err(UploadError::ManagerStopped),
                    recv(summary_rx) -> msg => {
                        let summary = msg.map_err(|_| self.interrupt_error())?;
                        num_slabs = Some(summary.num_slabs);
                        partial_slab = summary.partial_slab;
                        etag = summary.etag;
                    }
                    recv(response_rx) -> msg => {
                        let resp = msg.map_err(|_| self.interrupt_error())?;
                        let result = resp.result?;
                        self.stats_overdrive_pct.track(result.overdrive_pct);
                        self.stats_slab_speed.track(result.speed_bytes_per_ms as f64);
                        slabs.push((resp.index, result.slab_slice));
                    }
                }
            } else {
                select! {
                    recv(self.shutdown.done()) -> _ => return Err(UploadError::ManagerStopped),
                    recv(response_rx) -> msg => {
                        let resp = msg.map_err(|_| self.interrupt_error())?;
                        let result = resp.result?;
                        self.stats_overdrive_pct.track(result.overdrive_pct);
                        self.stats_slab_speed.track(result.speed_bytes_per_ms as f64);
                        slabs.push((resp.index, result.slab_slice));
                    }
                }
            }
        }

        // Responses arrive in completion order; the object wants index order.
        slabs.sort_by_key(|(index, _)| *index);
        object.slabs = slabs.into_iter().map(|(_, slice)| slice).collect();

        let mut buffer_limit_reached = false;
        if let Some(data) = partial_slab {
            let (slices, reached) = self.bus.add_partial_slab(
                &data,
                rs.min_shards,
                rs.total_shards,
                &params.contract_set,
            )?;
            buffer_limit_reached = reached;
            object.slabs.extend(slices);
        }

        if params.multipart {
            let slabs = std::mem::take(&mut object.slabs);
            self.bus.add_multipart_part(
                &params.bucket,
                &params.path,
                &params.contract_set,
                &etag,
                &params.multipart_upload_id,
                params.part_number,
                slabs,
            )?;
        } else {
            self.bus.add_object(
                &params.bucket,
                &params.path,
                &params.contract_set,
                object,
                AddObjectOptions {
                    mime_type: params.mime_type.clone(),
                    etag: etag.clone(),
                },
            )?;
        }

        Ok((buffer_limit_reached, etag))
    }

    /// Producer side of a streaming upload: read slab-sized chunks under the
    /// memory arbiter and spawn one upload per full slab.
    #[allow(clippy::too_many_arguments)]
    fn produce_slabs<R: Read>(
        self: Arc<Self>,
        ctx: CancelToken,
        upload: Upload,
        reader: R,
        key: EncryptionKey,
        encryption_offset: u64,
        rs: RedundancySettings,
        packing: bool,
        response_tx: Sender<SlabUploadResponse>,
        summary_tx: Sender<ProducerSummary>,
    ) {
        let mut hash_reader = HashReader::new(reader);
        let mut cipher_reader = CipherReader::new(&mut hash_reader, &key, encryption_offset);

        let slab_size = rs.slab_size();
        let redundant_size = rs.redundant_size();
        let mut num_spawned = 0usize;
        let mut partial_slab: Option<Vec<u8>> = None;

        loop {
            if ctx.is_canceled() || self.shutdown.is_canceled() {
                return;
            }

            // One redundant slab worth of memory per in-flight slab.
            let Some(mut mem) = self.memory.acquire(redundant_size, &ctx) else {
                return;
            };

            let mut data = vec![0u8; slab_size];
            let length = match read_full(&mut cipher_reader, &mut data) {
                Ok(n) => n,
                Err(err) => {
                    drop(mem);
                    let _ = response_tx.send(SlabUploadResponse {
                        index: num_spawned,
                        result: Err(err.into()),
                    });
                    return;
                }
            };

            if length == 0 {
                drop(mem);
                drop(cipher_reader);
                let _ = summary_tx.send(ProducerSummary {
                    num_slabs: num_spawned,
                    partial_slab: partial_slab.take(),
                    etag: hash_reader.digest().to_hex(),
                });
                return;
            }

            if length < slab_size && packing {
                // Stash the tail as a partial slab; the next read hits EOF
                // and publishes the summary.
                data.truncate(length);
                partial_slab = Some(data);
                drop(mem);
                continue;
            }

            // Full slab, or an unpacked tail padded up to one.
            let mgr = Arc::clone(&self);
            let upload = upload.clone();
            let ctx = ctx.clone();
            let response_tx = response_tx.clone();
            let index = num_spawned;
            std::thread::spawn(move || {
                let candidates = mgr.candidates(&upload.allowed);
                upload.upload_slab(
                    &ctx,
                    rs,
                    data,
                    length,
                    index,
                    &response_tx,
                    candidates,
                    &mut mem,
                    mgr.config.max_overdrive,
                    mgr.config.overdrive_timeout(),
                );
                // `mem` drops here, returning whatever the slab kept.
            });
            num_spawned += 1;
        }
    }

    /// Upload one locked packed slab and mark it uploaded.
    pub(crate) fn upload_packed_slab(
        self: &Arc<Self>,
        ps: PackedSlab,
        rs: RedundancySettings,
        contract_set: &str,
        lock_priority: i32,
        mem: &mut MemoryGrant,
    ) -> Result<()> {
        let ctx = self
            .shutdown
            .child_with_timeout(self.config.packed_slab_upload_timeout());
        let _cancel = ctx.drop_guard();

        let contracts = self.bus.contract_set_contracts(contract_set)?;
        let up = self.bus.upload_params()?;

        let shards = erasure::encode_partial_slab(&ps.data, &ps.key, &rs)?;

        let upload = self.new_upload(
            rs.total_shards as usize,
            &contracts,
            up.current_height,
            lock_priority,
        )?;
        self.bus.track_upload(upload.id)?;
        let _finish = FinishUploadGuard {
            bus: Arc::clone(&self.bus),
            upload_id: upload.id,
        };

        let candidates = self.candidates(&upload.allowed);
        let (sectors, overdrive_pct, speed) = upload.upload_shards(
            &ctx,
            shards,
            candidates,
            mem,
            self.config.max_overdrive,
            self.config.overdrive_timeout(),
        )?;

        self.stats_overdrive_pct.track(overdrive_pct);
        self.stats_slab_speed.track(speed as f64);

        self.bus.mark_packed_slabs_uploaded(&[UploadedPackedSlab {
            buffer_id: ps.buffer_id,
            shards: sectors,
        }])
    }

    /// Drain packed slabs for one redundancy/contract-set pair, uploading
    /// them concurrently under the memory arbiter. Returns how many were
    /// uploaded; stops at the first error or when the service has no more.
    pub fn upload_packed_slabs(
        self: &Arc<Self>,
        rs: RedundancySettings,
        contract_set: &str,
        lock_priority: i32,
    ) -> Result<usize> {
        rs.validate()?;
        let redundant_size = rs.redundant_size();
        let lock_duration = self.config.packed_slab_lock_duration();

        // Canceled on the first failure so no new uploads launch.
        let interrupt = self.shutdown.child();

        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();
        let mut errs: Vec<String> = Vec::new();

        loop {
            let Some(mem) = self.memory.acquire(redundant_size, &interrupt) else {
                break;
            };

            let packed = match self.bus.packed_slabs_for_upload(
                lock_duration,
                rs.min_shards,
                rs.total_shards,
                contract_set,
                1,
            ) {
                Ok(slabs) => slabs,
                Err(err) => {
                    drop(mem);
                    errs.push(format!("couldn't fetch packed slabs: {err}"));
                    break;
                }
            };
            let Some(ps) = packed.into_iter().next() else {
                drop(mem);
                break;
            };

            let mgr = Arc::clone(self);
            let set = contract_set.to_string();
            let interrupt = interrupt.clone();
            handles.push(std::thread::spawn(move || {
                let mut mem = mem;
                let result = mgr.upload_packed_slab(ps, rs, &set, lock_priority, &mut mem);
                if result.is_err() {
                    interrupt.cancel();
                }
                result
            }));
        }

        let mut uploaded = 0;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => uploaded += 1,
                Ok(Err(err)) => errs.push(err.to_string()),
                Err(_) => errs.push("packed slab upload thread panicked".into()),
            }
        }

        if errs.is_empty() {
            Ok(uploaded)
        } else {
            Err(UploadError::Other(errs.join("; ")))
        }
    }

    fn try_upload_packed_slabs(
        self: &Arc<Self>,
        rs: RedundancySettings,
        contract_set: String,
        block: bool,
    ) {
        // The buffer hit its limit: flush one pass synchronously at a raised
        // priority before handing off to the background loop.
        if block {
            if let Err(err) =
                self.upload_packed_slabs(rs, &contract_set, LOCK_PRIORITY_BLOCKED_UPLOAD)
            {
                error!(%err, "blocking packed slab upload failed");
            }
        }
        self.spawn_packed_slab_loop(rs, contract_set);
    }

    /// Start the background drain for `(rs, contract_set)` unless one is
    /// already running.
    fn spawn_packed_slab_loop(self: &Arc<Self>, rs: RedundancySettings, contract_set: String) {
        let key = format!("{}-{}_{}", rs.min_shards, rs.total_shards, contract_set);
        {
            let mut in_progress = self.lock_packed();
            if !in_progress.insert(key.clone()) {
                return;
            }
        }

        let mgr = Arc::clone(self);
        std::thread::spawn(move || {
            loop {
                if mgr.shutdown.is_canceled() {
                    break;
                }
                match mgr.upload_packed_slabs(rs, &contract_set, LOCK_PRIORITY_BACKGROUND_UPLOAD)
                {
                    Ok(0) => break,
                    Ok(n) => debug!(uploaded = n, "uploaded packed slabs"),
                    Err(err) => {
                        error!(%err, "background packed slab upload failed");
                        break;
                    }
                }
            }
            mgr.lock_packed().remove(&key);
        });
    }

    /// Re-upload selected shards of an existing slab to fresh hosts and merge
    /// the results into its descriptor.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate_shards(
        self: &Arc<Self>,
        ctx: &CancelToken,
        slab: &mut Slab,
        shard_indices: &[usize],
        shards: Vec<Vec<u8>>,
        contract_set: &str,
        contracts: &[ContractMetadata],
        block_height: u64,
        lock_priority: i32,
        mem: &mut MemoryGrant,
    ) -> Result<()> {
        if shard_indices.len() != shards.len() {
            return Err(UploadError::Other(format!(
                "shard index count mismatch: {} indices, {} shards",
                shard_indices.len(),
                shards.len()
            )));
        }

        let upload = self.new_upload(shards.len(), contracts, block_height, lock_priority)?;
        self.bus.track_upload(upload.id)?;
        let _finish = FinishUploadGuard {
            bus: Arc::clone(&self.bus),
            upload_id: upload.id,
        };

        let ctx = ctx.child();
        let _cancel = ctx.drop_guard();

        let candidates = self.candidates(&upload.allowed);
        let (uploaded, overdrive_pct, speed) = upload.upload_shards(
            &ctx,
            shards,
            candidates,
            mem,
            self.config.max_overdrive,
            self.config.overdrive_timeout(),
        )?;

        self.stats_overdrive_pct.track(overdrive_pct);
        self.stats_slab_speed.track(speed as f64);

        // Overwrite the migrated positions, keeping contracts already known.
        for (sector, &index) in uploaded.iter().zip(shard_indices) {
            let target = slab.shards.get_mut(index).ok_or_else(|| {
                UploadError::Other(format!("shard index {index} out of range"))
            })?;
            target.latest_host = sector.latest_host;

            let known: HashSet<FileContractId> =
                target.contracts.values().flatten().copied().collect();
            for (host, contract_ids) in &sector.contracts {
                for contract_id in contract_ids {
                    if !known.contains(contract_id) {
                        target.contracts.entry(*host).or_default().push(*contract_id);
                    }
                }
            }
        }

        self.bus.update_slab(slab.clone(), contract_set)
    }

    pub fn stats(&self) -> UploadManagerStats {
        self.stats_overdrive_pct.recompute();
        self.stats_slab_speed.recompute();

        let uploaders = self.lock_uploaders();
        let mut healthy = 0u64;
        let mut speeds = BTreeMap::new();
        for uploader in uploaders.iter() {
            uploader.try_recompute_stats();
            // bytes/ms to MB/s
            speeds.insert(uploader.host_key(), uploader.speed_bytes_per_ms() * 0.008);
            if uploader.healthy() {
                healthy += 1;
            }
        }

        UploadManagerStats {
            avg_slab_upload_speed_mbps: self.stats_slab_speed.average() * 0.008,
            avg_overdrive_pct: self.stats_overdrive_pct.average(),
            healthy_uploaders: healthy,
            num_uploaders: speeds.len() as u64,
            upload_speeds_mbps: speeds,
        }
    }

    /// Stop every uploader and fail whatever work is still queued.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let uploaders = self.lock_uploaders();
        for uploader in uploaders.iter() {
            uploader.stop();
        }
    }

    /// Create an object-level upload session, refreshing the uploader pool
    /// against the live contract set first.
    pub(crate) fn new_upload(
        &self,
        total_shards: usize,
        contracts: &[ContractMetadata],
        block_height: u64,
        lock_priority: i32,
    ) -> Result<Upload> {
        let mut uploaders = self.lock_uploaders();
        self.refresh_uploaders(&mut uploaders, contracts, block_height);

        if contracts.len() < total_shards {
            return Err(UploadError::NotEnoughContracts {
                have: contracts.len(),
                need: total_shards,
            });
        }

        Ok(Upload {
            id: UploadId::generate(),
            allowed: contracts.iter().map(|c| c.host_key).collect(),
            lock_priority,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Reconcile the uploader pool with the current contract set: drop
    /// uploaders whose contract vanished, swap renewed contracts in place,
    /// spawn uploaders for contracts not yet served.
    fn refresh_uploaders(
        &self,
        uploaders: &mut Vec<Arc<Uploader>>,
        contracts: &[ContractMetadata],
        block_height: u64,
    ) {
        let mut to_keep: HashMap<FileContractId, &ContractMetadata> =
            contracts.iter().map(|c| (c.id, c)).collect();
        let renewed_to: HashMap<FileContractId, &ContractMetadata> = contracts
            .iter()
            .filter_map(|c| c.renewed_from.map(|from| (from, c)))
            .collect();

        let mut kept = Vec::with_capacity(uploaders.len());
        for uploader in uploaders.drain(..) {
            let contract_id = uploader.contract_id();
            let renewal = renewed_to.get(&contract_id).copied();

            if to_keep.remove(&contract_id).is_none() && renewal.is_none() {
                debug!(host = %uploader.host_key(), contract = %contract_id,
                    "stopping uploader, contract no longer in set");
                uploader.stop();
                continue;
            }

            if let Some(renewal) = renewal {
                // The renewal is now served by this uploader.
                to_keep.remove(&renewal.id);
                uploader.renew(self.host_provider.as_ref(), renewal, block_height);
            } else {
                uploader.update_block_height(block_height);
            }
            uploader.try_recompute_stats();
            kept.push(uploader);
        }

        for contract in to_keep.values().copied() {
            let uploader = Uploader::new(
                Arc::clone(&self.bus),
                Arc::clone(&self.gouging),
                self.host_provider.as_ref(),
                contract,
                block_height,
                self.config.stats_recompute_min_interval(),
                &self.shutdown,
            );
            uploader.start(Arc::clone(&self.revision_locker));
            kept.push(uploader);
        }

        *uploaders = kept;
    }

    /// Snapshot of uploaders serving `allowed` hosts, best estimate first.
    pub(crate) fn candidates(&self, allowed: &HashSet<PublicKey>) -> Vec<Arc<Uploader>> {
        let uploaders = self.lock_uploaders();
        let mut candidates: Vec<Arc<Uploader>> = uploaders
            .iter()
            .filter(|u| allowed.contains(&u.host_key()))
            .cloned()
            .collect();
        drop(uploaders);
        candidates.sort_by(|a, b| a.estimate().total_cmp(&b.estimate()));
        candidates
    }

    #[cfg(test)]
    pub(crate) fn uploaders_snapshot(&self) -> Vec<Arc<Uploader>> {
        self.lock_uploaders().clone()
    }

    /// Why a producer channel closed without delivering: manager shutdown or
    /// object-context cancellation.
    fn interrupt_error(&self) -> UploadError {
        if self.shutdown.is_canceled() {
            UploadError::ManagerStopped
        } else {
            UploadError::Canceled
        }
    }

    fn lock_uploaders(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Uploader>>> {
        match self.uploaders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_packed(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.packed_slab_uploads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// What the producer hands the collector once the reader is exhausted.
struct ProducerSummary {
    num_slabs: usize,
    partial_slab: Option<Vec<u8>>,
    etag: String,
}

/// Marks the upload finished in the metadata service when the operation
/// leaves scope. Best-effort: failures are logged, never propagated.
struct FinishUploadGuard {
    bus: Arc<dyn MetadataService>,
    upload_id: UploadId,
}

impl Drop for FinishUploadGuard {
    fn drop(&mut self) {
        if let Err(err) = self.bus.finish_upload(self.upload_id) {
            error!(upload_id = %self.upload_id, %err, "failed to mark upload as finished");
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
