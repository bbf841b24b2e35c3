use std::sync::Arc;
use std::time::Duration;

use caravel_types::{FileContractId, Hash256, PublicKey};

use crate::cancel::CancelToken;
use crate::error::Result;

/// Bounded wait for a contract revision before a sector upload fails retryably.
pub const REVISION_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

// Revision-lock priorities; higher wins. Blocking packed-slab flushes outrank
// interactive uploads so they cannot starve behind them, background drains
// yield to everything else.
pub const LOCK_PRIORITY_BLOCKED_UPLOAD: i32 = 8;
pub const LOCK_PRIORITY_UPLOAD: i32 = 5;
pub const LOCK_PRIORITY_BACKGROUND_UPLOAD: i32 = 2;

/// A locked contract revision handed to the sector-upload closure.
#[derive(Debug, Clone)]
pub struct ContractRevision {
    pub contract_id: FileContractId,
    pub revision_number: u64,
}

/// A revision-locked session to one host.
pub trait HostSession: Send + Sync {
    /// Upload one sector under `revision`, returning its root.
    /// Exactly one call is made per accepted sector request.
    fn upload_sector(
        &self,
        ctx: &CancelToken,
        sector: &[u8],
        revision: &ContractRevision,
    ) -> Result<Hash256>;
}

/// Opens revision-locked sessions against hosts.
pub trait HostProvider: Send + Sync {
    fn new_session(
        &self,
        contract: FileContractId,
        host_key: PublicKey,
        host_address: &str,
    ) -> Arc<dyn HostSession>;
}

/// Parameters for acquiring a contract revision lock.
#[derive(Debug, Clone)]
pub struct RevisionLockRequest<'a> {
    pub contract: FileContractId,
    pub host_key: PublicKey,
    pub host_address: &'a str,
    pub priority: i32,
    pub block_height: u64,
    pub fetch_timeout: Duration,
}

/// Mediates the exclusive right to submit one revision of a contract at a time.
pub trait RevisionLocker: Send + Sync {
    /// Run `f` while holding the revision lock for `req.contract`. A lock
    /// acquisition that exceeds `req.fetch_timeout` fails with
    /// `RevisionLockTimeout`.
    fn with_revision(
        &self,
        ctx: &CancelToken,
        req: RevisionLockRequest<'_>,
        f: &mut dyn FnMut(&ContractRevision) -> Result<Hash256>,
    ) -> Result<Hash256>;
}

/// Per-request price sanity against the current gouging parameters.
pub trait GougingChecker: Send + Sync {
    fn check_upload(&self, host_key: &PublicKey) -> std::result::Result<(), String>;
}
