use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{after, select, unbounded, Sender};

use caravel_types::{PublicKey, UploadId};

use crate::cancel::CancelToken;
use crate::error::{Result, UploadError};
use crate::memory::MemoryGrant;
use crate::object::{erasure, Sector, Slab, SlabSlice};
use crate::upload::slab::{LaunchResult, SectorUploadResp, SlabUpload};
use crate::upload::uploader::Uploader;
use crate::upload::RedundancySettings;

/// Outcome of one slab's encode-encrypt-upload pipeline.
pub(crate) struct SlabResult {
    pub(crate) slab_slice: SlabSlice,
    pub(crate) overdrive_pct: f64,
    pub(crate) speed_bytes_per_ms: u64,
}

pub(crate) struct SlabUploadResponse {
    pub(crate) index: usize,
    pub(crate) result: Result<SlabResult>,
}

/// One object-level upload operation: its identity, the frozen set of hosts
/// it may use, and the contexts every shard attempt derives from.
#[derive(Clone)]
pub(crate) struct Upload {
    pub(crate) id: UploadId,
    pub(crate) allowed: HashSet<PublicKey>,
    pub(crate) lock_priority: i32,
    pub(crate) shutdown: CancelToken,
}

impl Upload {
    /// Encode `data` into a slab, encrypt its shards, upload them, and send
    /// the resulting slice on `response_tx`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn upload_slab(
        &self,
        ctx: &CancelToken,
        rs: RedundancySettings,
        data: Vec<u8>,
        length: usize,
        index: usize,
        response_tx: &Sender<SlabUploadResponse>,
        candidates: Vec<Arc<Uploader>>,
        mem: &mut MemoryGrant,
        max_overdrive: u64,
        overdrive_timeout: Duration,
    ) {
        let result = self.build_and_upload_slab(
            ctx,
            rs,
            data,
            length,
            candidates,
            mem,
            max_overdrive,
            overdrive_timeout,
        );
        // The receiver may be gone if the object upload already failed.
        let _ = response_tx.send(SlabUploadResponse { index, result });
    }

    #[allow(clippy::too_many_arguments)]
    fn build_and_upload_slab(
        &self,
        ctx: &CancelToken,
        rs: RedundancySettings,
        data: Vec<u8>,
        length: usize,
        candidates: Vec<Arc<Uploader>>,
        mem: &mut MemoryGrant,
        max_overdrive: u64,
        overdrive_timeout: Duration,
    ) -> Result<SlabResult> {
        let mut slab = Slab::new(rs.min_shards);
        let mut shards = erasure::encode_shards(&data, &rs)?;
        drop(data);
        slab.key.encrypt_shards(&mut shards);

        let (sectors, overdrive_pct, speed) = self.upload_shards(
            ctx,
            shards,
            candidates,
            mem,
            max_overdrive,
            overdrive_timeout,
        )?;
        slab.shards = sectors;

        Ok(SlabResult {
            slab_slice: SlabSlice {
                slab,
                offset: 0,
                length: length as u32,
            },
            overdrive_pct,
            speed_bytes_per_ms: speed,
        })
    }

    /// Upload a batch of ready shards, driving the slab state machine to
    /// completion. Returns the sector list plus overdrive percentage and
    /// upload speed in bytes per millisecond.
    pub(crate) fn upload_shards(
        &self,
        ctx: &CancelToken,
        shards: Vec<Vec<u8>>,
        candidates: Vec<Arc<Uploader>>,
        mem: &mut MemoryGrant,
        max_overdrive: u64,
        overdrive_timeout: Duration,
    ) -> Result<(Vec<Sector>, f64, u64)> {
        // Everything still in flight when we leave is canceled.
        let ctx = ctx.child();
        let _cancel = ctx.drop_guard();

        let (response_tx, response_rx) = unbounded::<SectorUploadResp>();
        let (mut slab, requests) = SlabUpload::new(
            self.id,
            self.lock_priority,
            shards,
            candidates,
            mem,
            max_overdrive,
            overdrive_timeout,
            &ctx,
            &response_tx,
        );

        for req in requests {
            if let LaunchResult::NoCandidate { .. } = slab.launch(req) {
                return Err(UploadError::NoCandidateUploader);
            }
        }

        let overdrive_enabled = max_overdrive > 0 && !overdrive_timeout.is_zero();

        let mut done = false;
        while slab.inflight() > 0 && !done {
            let resp = if overdrive_enabled {
                select! {
                    recv(self.shutdown.done()) -> _ => return Err(UploadError::ManagerStopped),
                    recv(ctx.done()) -> _ => return Err(UploadError::Canceled),
                    recv(response_rx) -> msg => match msg {
                        Ok(resp) => resp,
                        Err(_) => return Err(UploadError::Canceled),
                    },
                    // The timer arm is recreated each iteration, so it resets
                    // on every response and after every fire.
                    recv(after(overdrive_timeout)) -> _ => {
                        if slab.can_overdrive() {
                            if let Some(req) = slab.next_request(&response_tx) {
                                let _ = slab.launch(req);
                            }
                        }
                        continue;
                    }
                }
            } else {
                select! {
                    recv(self.shutdown.done()) -> _ => return Err(UploadError::ManagerStopped),
                    recv(ctx.done()) -> _ => return Err(UploadError::Canceled),
                    recv(response_rx) -> msg => match msg {
                        Ok(resp) => resp,
                        Err(_) => return Err(UploadError::Canceled),
                    },
                }
            };

            let outcome = slab.receive(resp);
            done = outcome.done;

            // Relaunch failed regular attempts on the next candidate.
            if !done {
                if let Some(req) = outcome.retry {
                    match slab.launch(req) {
                        LaunchResult::Launched => {}
                        // No candidate and nothing covering the index.
                        LaunchResult::NoCandidate { fatal: true } => break,
                        // An in-flight overdrive still covers the index.
                        LaunchResult::NoCandidate { fatal: false } => {}
                    }
                }
            }
        }

        let overdrive_pct = slab.overdrive_pct();
        let speed = slab.upload_speed();
        let sectors = slab.finish()?;
        Ok((sectors, overdrive_pct, speed))
    }
}
