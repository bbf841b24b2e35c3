use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::debug;

use caravel_types::{FileContractId, Hash256, PublicKey};

use crate::bus::{ContractMetadata, MetadataService};
use crate::cancel::CancelToken;
use crate::error::{Result, UploadError};
use crate::host::{
    GougingChecker, HostProvider, HostSession, RevisionLockRequest, RevisionLocker,
    REVISION_FETCH_TIMEOUT,
};
use crate::object::SECTOR_SIZE;
use crate::stats::DataPoints;
use crate::upload::slab::SectorUploadReq;

/// Half-life of the per-host latency estimator, so penalized hosts drift
/// back into contention.
const ESTIMATE_HALF_LIFE: Duration = Duration::from_secs(10 * 60);

/// Latency sample recorded for a failed upload: one hour, which sinks the
/// host to the back of the candidate order.
const FAILURE_PENALTY_MS: f64 = 60.0 * 60.0 * 1000.0;

// ---------------------------------------------------------------------------
// Uploader — per-host worker with a FIFO of sector requests
// ---------------------------------------------------------------------------

/// The worker serving one host, one contract at a time. Requests are queued
/// FIFO and executed by a dedicated thread inside a revision-locked session.
pub(crate) struct Uploader {
    host_key: PublicKey,
    bus: Arc<dyn MetadataService>,
    gouging: Arc<dyn GougingChecker>,
    stop_token: CancelToken,
    signal_tx: Sender<()>,
    signal_rx: Receiver<()>,
    recompute_min_interval: Duration,

    stats_estimate_ms: DataPoints,
    stats_speed_bytes_per_ms: DataPoints,

    state: Mutex<State>,
}

struct State {
    host_address: String,
    contract: FileContractId,
    window_end: u64,
    block_height: u64,
    session: Arc<dyn HostSession>,
    queue: VecDeque<SectorUploadReq>,
    consecutive_failures: u64,
    last_recompute: Option<Instant>,
}

impl Uploader {
    pub(crate) fn new(
        bus: Arc<dyn MetadataService>,
        gouging: Arc<dyn GougingChecker>,
        host_provider: &dyn HostProvider,
        contract: &ContractMetadata,
        block_height: u64,
        recompute_min_interval: Duration,
        shutdown: &CancelToken,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = bounded(1);
        Arc::new(Uploader {
            host_key: contract.host_key,
            bus,
            gouging,
            stop_token: shutdown.child(),
            signal_tx,
            signal_rx,
            recompute_min_interval,
            stats_estimate_ms: DataPoints::with_half_life(ESTIMATE_HALF_LIFE),
            stats_speed_bytes_per_ms: DataPoints::no_decay(),
            state: Mutex::new(State {
                host_address: contract.host_address.clone(),
                contract: contract.id,
                window_end: contract.window_end,
                block_height,
                session: host_provider.new_session(
                    contract.id,
                    contract.host_key,
                    &contract.host_address,
                ),
                queue: VecDeque::new(),
                consecutive_failures: 0,
                last_recompute: None,
            }),
        })
    }

    /// Spawn the worker thread.
    pub(crate) fn start(self: &Arc<Self>, revision_locker: Arc<dyn RevisionLocker>) {
        let uploader = Arc::clone(self);
        std::thread::spawn(move || uploader.run(revision_locker));
    }

    fn run(self: Arc<Self>, revision_locker: Arc<dyn RevisionLocker>) {
        'outer: loop {
            // Wait for work.
            select! {
                recv(self.signal_rx) -> msg => {
                    if msg.is_err() {
                        return;
                    }
                }
                recv(self.stop_token.done()) -> _ => return,
            }

            loop {
                if self.stop_token.is_canceled() {
                    return;
                }

                let Some(req) = self.pop() else {
                    continue 'outer;
                };

                // The sector completed elsewhere while the request sat queued.
                if req.is_done() {
                    continue;
                }

                let start = Instant::now();
                let (contract, result) = self.execute(&revision_locker, &req);

                // The contract hit its revision ceiling, presumably because it
                // is being renewed. Requeue on this same uploader; the renewed
                // contract will serve it.
                if matches!(result, Err(UploadError::MaxRevisionReached)) {
                    self.enqueue(req);
                    continue 'outer;
                }

                let failed = result.is_err();
                let canceled_overdrive = failed && req.overdrive && req.is_done();
                let stream_closed = matches!(result, Err(UploadError::StreamClosed));

                req.respond(self.host_key, contract, result);

                if !canceled_overdrive && !stream_closed {
                    self.track_sector_upload(failed, start.elapsed());
                }
            }
        }
    }

    fn execute(
        &self,
        revision_locker: &Arc<dyn RevisionLocker>,
        req: &SectorUploadReq,
    ) -> (FileContractId, Result<Hash256>) {
        let (session, contract, host_address, block_height) = {
            let state = self.lock_state();
            (
                Arc::clone(&state.session),
                state.contract,
                state.host_address.clone(),
                state.block_height,
            )
        };

        let result = revision_locker.with_revision(
            req.sector.ctx(),
            RevisionLockRequest {
                contract,
                host_key: self.host_key,
                host_address: &host_address,
                priority: req.lock_priority,
                block_height,
                fetch_timeout: REVISION_FETCH_TIMEOUT,
            },
            &mut |revision| {
                if revision.revision_number == u64::MAX {
                    return Err(UploadError::MaxRevisionReached);
                }
                self.gouging
                    .check_upload(&self.host_key)
                    .map_err(UploadError::Gouging)?;
                self.bus
                    .add_uploading_sector(req.upload_id, revision.contract_id, req.sector.root)?;
                let Some(data) = req.sector.data() else {
                    return Err(UploadError::Canceled);
                };
                session.upload_sector(req.sector.ctx(), &data, revision)
            },
        );

        (contract, result)
    }

    /// O(1) append; wakes the worker. Requests enqueued after the uploader
    /// stopped are failed right away so the slab can redispatch them.
    pub(crate) fn enqueue(&self, req: SectorUploadReq) {
        if self.stop_token.is_canceled() {
            let contract = self.contract_id();
            req.respond(
                self.host_key,
                contract,
                Err(UploadError::UploaderStopped),
            );
            return;
        }
        self.lock_state().queue.push_back(req);
        self.signal_work();
    }

    fn signal_work(&self) {
        let _ = self.signal_tx.try_send(());
    }

    fn pop(&self) -> Option<SectorUploadReq> {
        self.lock_state().queue.pop_front()
    }

    /// Estimated time to drain the queue plus one more sector, in
    /// milliseconds. Lower is better; candidates are ordered by this.
    pub(crate) fn estimate(&self) -> f64 {
        let num_sectors = (self.lock_state().queue.len() + 1) as f64;
        num_sectors * self.stats_estimate_ms.p90().max(1.0)
    }

    pub(crate) fn healthy(&self) -> bool {
        self.lock_state().consecutive_failures == 0
    }

    pub(crate) fn host_key(&self) -> PublicKey {
        self.host_key
    }

    pub(crate) fn contract_id(&self) -> FileContractId {
        self.lock_state().contract
    }

    pub(crate) fn window_end(&self) -> u64 {
        self.lock_state().window_end
    }

    pub(crate) fn speed_bytes_per_ms(&self) -> f64 {
        self.stats_speed_bytes_per_ms.average()
    }

    /// Swap to a renewed contract, keeping queue and statistics.
    pub(crate) fn renew(
        &self,
        host_provider: &dyn HostProvider,
        contract: &ContractMetadata,
        block_height: u64,
    ) {
        debug!(host = %self.host_key, contract = %contract.id, "uploader renewed");
        let mut state = self.lock_state();
        state.block_height = block_height;
        state.session =
            host_provider.new_session(contract.id, contract.host_key, &contract.host_address);
        state.contract = contract.id;
        state.host_address = contract.host_address.clone();
        state.window_end = contract.window_end;
    }

    pub(crate) fn update_block_height(&self, block_height: u64) {
        self.lock_state().block_height = block_height;
    }

    /// Recompute both estimators, at most once per recompute interval.
    pub(crate) fn try_recompute_stats(&self) {
        {
            let mut state = self.lock_state();
            if let Some(last) = state.last_recompute {
                if last.elapsed() < self.recompute_min_interval {
                    return;
                }
            }
            state.last_recompute = Some(Instant::now());
        }
        self.stats_estimate_ms.recompute();
        self.stats_speed_bytes_per_ms.recompute();
    }

    /// Stop the worker and fail every queued request that is not already done.
    pub(crate) fn stop(&self) {
        self.stop_token.cancel();
        while let Some(req) = self.pop() {
            if !req.is_done() {
                let contract = self.contract_id();
                req.respond(
                    self.host_key,
                    contract,
                    Err(UploadError::UploaderStopped),
                );
            }
        }
    }

    fn track_sector_upload(&self, failed: bool, elapsed: Duration) {
        if failed {
            self.lock_state().consecutive_failures += 1;
            self.stats_estimate_ms.track(FAILURE_PENALTY_MS);
        } else {
            self.lock_state().consecutive_failures = 0;
            let ms = elapsed.as_millis().max(1) as f64;
            self.stats_estimate_ms.track(ms);
            self.stats_speed_bytes_per_ms.track(SECTOR_SIZE as f64 / ms);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
