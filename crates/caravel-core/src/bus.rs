use std::time::Duration;

use serde::{Deserialize, Serialize};

use caravel_types::{FileContractId, Hash256, PublicKey, UploadId};

use crate::error::Result;
use crate::object::{EncryptionKey, Object, Sector, Slab, SlabSlice};

/// One funded contract from the current contract set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub id: FileContractId,
    pub host_key: PublicKey,
    pub host_address: String,
    pub window_end: u64,
    /// Set when this contract renewed an older one.
    #[serde(default)]
    pub renewed_from: Option<FileContractId>,
}

/// Price ceilings the gouging checker enforces per request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GougingParams {
    pub max_sector_upload_price: u64,
    pub max_rpc_price: u64,
}

/// Chain and pricing context for uploads started from background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadParams {
    pub current_height: u64,
    pub gouging: GougingParams,
}

/// A buffered partial slab handed out for background upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedSlab {
    pub buffer_id: u64,
    pub data: Vec<u8>,
    pub key: EncryptionKey,
}

/// The uploaded sector set for one packed slab buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedPackedSlab {
    pub buffer_id: u64,
    pub shards: Vec<Sector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddObjectOptions {
    pub mime_type: String,
    pub etag: String,
}

/// The metadata store the engine persists into. In the daemon this is an
/// HTTP/JSON client; tests substitute a deterministic in-memory fake.
pub trait MetadataService: Send + Sync {
    fn track_upload(&self, upload_id: UploadId) -> Result<()>;

    /// Called exactly once per tracked operation, during cleanup. Runs
    /// best-effort: implementations must bound it (about a minute) rather
    /// than hang, since the engine only logs a failure here.
    fn finish_upload(&self, upload_id: UploadId) -> Result<()>;

    /// Bind an in-flight sector root to the contract it is being uploaded on.
    fn add_uploading_sector(
        &self,
        upload_id: UploadId,
        contract: FileContractId,
        root: Hash256,
    ) -> Result<()>;

    fn packed_slabs_for_upload(
        &self,
        lock_duration: Duration,
        min_shards: u8,
        total_shards: u8,
        contract_set: &str,
        limit: usize,
    ) -> Result<Vec<PackedSlab>>;

    fn mark_packed_slabs_uploaded(&self, slabs: &[UploadedPackedSlab]) -> Result<()>;

    fn contract_set_contracts(&self, contract_set: &str) -> Result<Vec<ContractMetadata>>;

    fn upload_params(&self) -> Result<UploadParams>;

    /// Buffer the tail of an object that is too short for a full slab.
    /// Returns the slices referencing the buffer and whether the buffer size
    /// limit was reached (a signal to flush packed slabs synchronously).
    fn add_partial_slab(
        &self,
        data: &[u8],
        min_shards: u8,
        total_shards: u8,
        contract_set: &str,
    ) -> Result<(Vec<SlabSlice>, bool)>;

    fn add_object(
        &self,
        bucket: &str,
        path: &str,
        contract_set: &str,
        object: Object,
        opts: AddObjectOptions,
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn add_multipart_part(
        &self,
        bucket: &str,
        path: &str,
        contract_set: &str,
        etag: &str,
        upload_id: &str,
        part_number: u64,
        slabs: Vec<SlabSlice>,
    ) -> Result<()>;

    /// Persist a slab whose shards were migrated to new hosts.
    fn update_slab(&self, slab: Slab, contract_set: &str) -> Result<()>;
}
