use serde::{Deserialize, Serialize};

use crate::error::{Result, UploadError};
use crate::object::SECTOR_SIZE;

/// Erasure-code shape: any `min_shards` of `total_shards` reconstruct a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancySettings {
    pub min_shards: u8,
    pub total_shards: u8,
}

impl RedundancySettings {
    pub fn validate(&self) -> Result<()> {
        if self.min_shards == 0 {
            return Err(UploadError::Config("min_shards must be non-zero".into()));
        }
        if self.total_shards < self.min_shards {
            return Err(UploadError::Config(format!(
                "total_shards ({}) must be >= min_shards ({})",
                self.total_shards, self.min_shards
            )));
        }
        Ok(())
    }

    /// Bytes of object data per slab.
    pub fn slab_size(&self) -> usize {
        self.min_shards as usize * SECTOR_SIZE
    }

    /// Bytes of shard data per slab after encoding.
    pub fn redundant_size(&self) -> usize {
        self.total_shards as usize * SECTOR_SIZE
    }
}

/// Per-call parameters of an object upload.
#[derive(Debug, Clone)]
pub struct UploadParameters {
    pub bucket: String,
    pub path: String,
    pub contract_set: String,
    pub redundancy: RedundancySettings,
    pub block_height: u64,
    pub packing: bool,
    pub mime_type: String,
    pub encryption_offset: u64,
    pub multipart: bool,
    /// Multipart upload identifier assigned by the metadata service.
    pub multipart_upload_id: String,
    pub part_number: u64,
}

impl UploadParameters {
    pub fn new(
        bucket: impl Into<String>,
        path: impl Into<String>,
        contract_set: impl Into<String>,
        redundancy: RedundancySettings,
        block_height: u64,
    ) -> Self {
        UploadParameters {
            bucket: bucket.into(),
            path: path.into(),
            contract_set: contract_set.into(),
            redundancy,
            block_height,
            packing: false,
            mime_type: String::new(),
            encryption_offset: 0,
            multipart: false,
            multipart_upload_id: String::new(),
            part_number: 0,
        }
    }

    pub fn with_packing(mut self, packing: bool) -> Self {
        self.packing = packing;
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_encryption_offset(mut self, offset: u64) -> Self {
        self.encryption_offset = offset;
        self
    }

    pub fn with_multipart(mut self, upload_id: impl Into<String>, part_number: u64) -> Self {
        self.multipart = true;
        self.multipart_upload_id = upload_id.into();
        self.part_number = part_number;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundancy_validation() {
        assert!(RedundancySettings {
            min_shards: 0,
            total_shards: 4
        }
        .validate()
        .is_err());
        assert!(RedundancySettings {
            min_shards: 5,
            total_shards: 4
        }
        .validate()
        .is_err());
        assert!(RedundancySettings {
            min_shards: 2,
            total_shards: 4
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn sizes_scale_with_shards() {
        let rs = RedundancySettings {
            min_shards: 2,
            total_shards: 6,
        };
        assert_eq!(rs.slab_size(), 2 * SECTOR_SIZE);
        assert_eq!(rs.redundant_size(), 6 * SECTOR_SIZE);
    }
}
