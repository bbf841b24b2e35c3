use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use caravel_types::{FileContractId, Hash256, PublicKey, UploadId};

use crate::cancel::CancelToken;
use crate::error::{HostErrorSet, Result, SlabUploadError, UploadError};
use crate::memory::MemoryGrant;
use crate::object::{sector_root, Sector, SECTOR_SIZE};
use crate::upload::uploader::Uploader;

// ---------------------------------------------------------------------------
// Sector upload state
// ---------------------------------------------------------------------------

/// Shared state of one shard position while its upload is in flight. The
/// cancellation token fires once some host has definitively stored the shard;
/// uploaders that pop a request for a canceled sector drop it.
pub(crate) struct SectorUpload {
    pub(crate) index: usize,
    pub(crate) root: Hash256,
    ctx: CancelToken,
    data: Mutex<Option<Arc<Vec<u8>>>>,
}

impl SectorUpload {
    fn new(index: usize, shard: Vec<u8>, ctx: CancelToken) -> Self {
        SectorUpload {
            index,
            root: sector_root(&shard),
            ctx,
            data: Mutex::new(Some(Arc::new(shard))),
        }
    }

    /// The shard bytes, or `None` once the sector completed and was freed.
    pub(crate) fn data(&self) -> Option<Arc<Vec<u8>>> {
        self.lock_data().clone()
    }

    fn take_data(&self) {
        self.lock_data().take();
    }

    pub(crate) fn ctx(&self) -> &CancelToken {
        &self.ctx
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.ctx.is_canceled()
    }

    fn cancel(&self) {
        self.ctx.cancel();
    }

    fn lock_data(&self) -> std::sync::MutexGuard<'_, Option<Arc<Vec<u8>>>> {
        match self.data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One attempt to upload a shard; consumed by whichever uploader pops it.
pub(crate) struct SectorUploadReq {
    pub(crate) lock_priority: i32,
    pub(crate) overdrive: bool,
    pub(crate) response_tx: Sender<SectorUploadResp>,
    pub(crate) sector: Arc<SectorUpload>,
    pub(crate) upload_id: UploadId,
}

impl SectorUploadReq {
    /// Whether the shard is already definitively uploaded (or abandoned).
    pub(crate) fn is_done(&self) -> bool {
        self.sector.is_canceled()
    }

    /// Deliver the outcome of this attempt. A response for a done sector is
    /// dropped; the receiver no longer cares.
    pub(crate) fn respond(
        self,
        host_key: PublicKey,
        contract: FileContractId,
        result: Result<Hash256>,
    ) {
        if self.is_done() {
            return;
        }
        let tx = self.response_tx.clone();
        let _ = tx.send(SectorUploadResp {
            host_key,
            contract,
            result,
            req: self,
        });
    }
}

/// Outcome of one sector upload attempt, carrying its request back to the
/// slab coordinator for relaunch bookkeeping.
pub(crate) struct SectorUploadResp {
    pub(crate) req: SectorUploadReq,
    pub(crate) host_key: PublicKey,
    pub(crate) contract: FileContractId,
    pub(crate) result: Result<Hash256>,
}

// ---------------------------------------------------------------------------
// Slab upload state machine
// ---------------------------------------------------------------------------

pub(crate) enum LaunchResult {
    Launched,
    /// No unused candidate. Fatal when the request was a regular attempt and
    /// no overdrive covers its index; soft otherwise.
    NoCandidate { fatal: bool },
}

pub(crate) struct ReceiveOutcome {
    pub(crate) done: bool,
    /// Failed regular request handed back for relaunch on another candidate.
    pub(crate) retry: Option<SectorUploadReq>,
}

/// Coordinates the `N` shard uploads of one slab. Owned by the single
/// coordinator loop in `upload_shards`, so no locking is needed; uploaders
/// only ever touch their own queues and the response channel.
pub(crate) struct SlabUpload<'a> {
    upload_id: UploadId,
    lock_priority: i32,
    created: Instant,
    max_overdrive: u64,
    overdrive_timeout: Duration,
    mem: &'a mut MemoryGrant,

    candidates: Vec<Arc<Uploader>>,
    sectors: Vec<Arc<SectorUpload>>,
    uploaded: Vec<Option<Sector>>,

    used: HashSet<PublicKey>,
    overdriving: HashMap<usize, HashSet<PublicKey>>,
    last_overdrive: Instant,

    num_inflight: u64,
    num_launched: u64,
    num_uploaded: u64,
    num_overdriving: u64,

    errs: HostErrorSet,
}

impl<'a> SlabUpload<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        upload_id: UploadId,
        lock_priority: i32,
        shards: Vec<Vec<u8>>,
        candidates: Vec<Arc<Uploader>>,
        mem: &'a mut MemoryGrant,
        max_overdrive: u64,
        overdrive_timeout: Duration,
        ctx: &CancelToken,
        response_tx: &Sender<SectorUploadResp>,
    ) -> (Self, Vec<SectorUploadReq>) {
        let mut sectors = Vec::with_capacity(shards.len());
        let mut requests = Vec::with_capacity(shards.len());
        for (index, shard) in shards.into_iter().enumerate() {
            let sector = Arc::new(SectorUpload::new(index, shard, ctx.child()));
            requests.push(SectorUploadReq {
                lock_priority,
                overdrive: false,
                response_tx: response_tx.clone(),
                sector: Arc::clone(&sector),
                upload_id,
            });
            sectors.push(sector);
        }

        let num_sectors = sectors.len();
        let slab = SlabUpload {
            upload_id,
            lock_priority,
            created: Instant::now(),
            max_overdrive,
            overdrive_timeout,
            mem,
            candidates,
            sectors,
            uploaded: (0..num_sectors).map(|_| None).collect(),
            used: HashSet::new(),
            overdriving: HashMap::new(),
            last_overdrive: Instant::now(),
            num_inflight: 0,
            num_launched: 0,
            num_uploaded: 0,
            num_overdriving: 0,
            errs: HostErrorSet::default(),
        };
        (slab, requests)
    }

    pub(crate) fn inflight(&self) -> u64 {
        self.num_inflight
    }

    /// Enqueue `req` on the best candidate not yet serving this slab.
    pub(crate) fn launch(&mut self, req: SectorUploadReq) -> LaunchResult {
        let candidate = self
            .candidates
            .iter()
            .find(|u| !self.used.contains(&u.host_key()))
            .cloned();

        let Some(candidate) = candidate else {
            let covered = self
                .overdriving
                .get(&req.sector.index)
                .is_some_and(|hosts| !hosts.is_empty());
            return LaunchResult::NoCandidate {
                fatal: !req.overdrive && !covered,
            };
        };

        let host = candidate.host_key();
        self.used.insert(host);
        self.num_inflight += 1;
        self.num_launched += 1;

        if req.overdrive {
            self.last_overdrive = Instant::now();
            self.num_overdriving += 1;
            self.overdriving
                .entry(req.sector.index)
                .or_default()
                .insert(host);
        }

        candidate.enqueue(req);
        LaunchResult::Launched
    }

    /// Whether the overdrive timer firing right now should launch an attempt.
    pub(crate) fn can_overdrive(&self) -> bool {
        if self.overdrive_timeout.is_zero() {
            return false;
        }
        let remaining = self.sectors.len() as u64 - self.num_uploaded;
        if remaining >= self.max_overdrive {
            return false;
        }
        if self.last_overdrive.elapsed() < self.overdrive_timeout {
            return false;
        }
        // Cap on concurrently in-flight overdrives.
        if self.num_inflight.saturating_sub(remaining) >= self.max_overdrive {
            return false;
        }
        true
    }

    /// Build the next overdrive request: the not-yet-uploaded index with the
    /// fewest overdrives, lowest index on ties.
    pub(crate) fn next_request(
        &self,
        response_tx: &Sender<SectorUploadResp>,
    ) -> Option<SectorUploadReq> {
        let mut best: Option<(usize, usize)> = None; // (overdrives, index)
        for (index, _) in self.sectors.iter().enumerate() {
            if self.uploaded[index].is_some() {
                continue;
            }
            let overdrives = self.overdriving.get(&index).map_or(0, |hosts| hosts.len());
            if best.map_or(true, |(n, _)| overdrives < n) {
                best = Some((overdrives, index));
            }
        }
        let (_, index) = best?;
        Some(SectorUploadReq {
            lock_priority: self.lock_priority,
            overdrive: true,
            response_tx: response_tx.clone(),
            sector: Arc::clone(&self.sectors[index]),
            upload_id: self.upload_id,
        })
    }

    /// Fold one response into the slab state.
    pub(crate) fn receive(&mut self, resp: SectorUploadResp) -> ReceiveOutcome {
        let SectorUploadResp {
            req,
            host_key,
            contract,
            result,
        } = resp;

        if req.overdrive {
            self.num_overdriving -= 1;
        }
        self.num_inflight -= 1;

        let root = match result {
            Err(err) => {
                self.errs.insert(host_key, err.to_string());
                let retry = (!req.overdrive).then_some(req);
                return ReceiveOutcome { done: false, retry };
            }
            Ok(root) => root,
        };

        let index = req.sector.index;

        // A late duplicate for an index that already completed; the first
        // successful response stays authoritative.
        if self.uploaded[index].is_some() {
            return ReceiveOutcome {
                done: false,
                retry: None,
            };
        }

        let mut contracts = BTreeMap::new();
        contracts.insert(host_key, vec![contract]);
        self.uploaded[index] = Some(Sector {
            root,
            latest_host: host_key,
            contracts,
        });
        self.num_uploaded += 1;

        // Cancel the other in-flight attempts for this index and drop the
        // shard bytes; the arbiter gets its share back immediately.
        req.sector.cancel();
        req.sector.take_data();
        self.mem.release_some(SECTOR_SIZE);

        // Hosts that were overdriving this index may serve other indices now.
        if let Some(hosts) = self.overdriving.get(&index) {
            for host in hosts {
                self.used.remove(host);
            }
        }

        ReceiveOutcome {
            done: self.num_uploaded == self.sectors.len() as u64,
            retry: None,
        }
    }

    pub(crate) fn overdrive_pct(&self) -> f64 {
        let overdrive = self.num_launched as i64 - self.sectors.len() as i64;
        if overdrive <= 0 {
            return 0.0;
        }
        overdrive as f64 / self.sectors.len() as f64
    }

    /// Bytes per millisecond across the slab so far.
    pub(crate) fn upload_speed(&self) -> u64 {
        let bytes = self.num_uploaded * SECTOR_SIZE as u64;
        let ms = self.created.elapsed().as_millis().max(1) as u64;
        bytes / ms
    }

    /// The completed sector list, or the aggregated failure.
    pub(crate) fn finish(self) -> Result<Vec<Sector>> {
        let num_sectors = self.sectors.len() as u64;
        if self.num_uploaded < num_sectors {
            return Err(UploadError::SlabUpload(Box::new(SlabUploadError {
                launched: self.num_launched,
                uploaded: self.num_uploaded,
                remaining: num_sectors - self.num_uploaded,
                inflight: self.num_inflight,
                candidates: self.candidates.len(),
                errors: self.errs,
            })));
        }
        Ok(self.uploaded.into_iter().flatten().collect())
    }
}
