use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use caravel_types::PublicKey;

pub type Result<T> = std::result::Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("not enough contracts to support requested redundancy: {have} < {need}")]
    NotEnoughContracts { have: usize, need: usize },

    #[error("no candidate uploader found")]
    NoCandidateUploader,

    #[error("upload manager stopped")]
    ManagerStopped,

    #[error("uploader stopped")]
    UploaderStopped,

    #[error("max revision reached on contract")]
    MaxRevisionReached,

    #[error("revision lock timed out")]
    RevisionLockTimeout,

    #[error("host stream closed")]
    StreamClosed,

    #[error("operation canceled")]
    Canceled,

    #[error("price gouging detected: {0}")]
    Gouging(String),

    #[error("host error: {0}")]
    Host(String),

    #[error("metadata service error: {0}")]
    Bus(String),

    #[error("erasure coding error: {0}")]
    Erasure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SlabUpload(#[from] Box<SlabUploadError>),

    #[error("{0}")]
    Other(String),
}

/// Per-host errors accumulated while uploading one slab. Individual host
/// failures never surface on their own; they are reported as a set.
#[derive(Debug, Default, Clone)]
pub struct HostErrorSet(pub BTreeMap<PublicKey, String>);

impl HostErrorSet {
    pub fn insert(&mut self, host: PublicKey, err: String) {
        self.0.insert(host, err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for HostErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (host, err)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{host}: {err}")?;
        }
        Ok(())
    }
}

/// Aggregated failure of one slab upload, with counters for diagnosis.
#[derive(Debug, Error)]
#[error(
    "failed to upload slab: launched={launched} uploaded={uploaded} remaining={remaining} \
     inflight={inflight} uploaders={candidates} errors={num_errors} ({errors})",
    num_errors = .errors.len()
)]
pub struct SlabUploadError {
    pub launched: u64,
    pub uploaded: u64,
    pub remaining: u64,
    pub inflight: u64,
    pub candidates: usize,
    pub errors: HostErrorSet,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_set_display() {
        let mut errs = HostErrorSet::default();
        errs.insert(PublicKey([0xAA; 32]), "connection refused".into());
        errs.insert(PublicKey([0xBB; 32]), "timeout".into());
        let rendered = errs.to_string();
        assert!(rendered.contains("connection refused"));
        assert!(rendered.contains("; "));
    }

    #[test]
    fn slab_upload_error_carries_counters() {
        let err = SlabUploadError {
            launched: 5,
            uploaded: 3,
            remaining: 1,
            inflight: 1,
            candidates: 4,
            errors: HostErrorSet::default(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("launched=5"));
        assert!(rendered.contains("remaining=1"));
        assert!(rendered.contains("errors=0"));
    }
}
