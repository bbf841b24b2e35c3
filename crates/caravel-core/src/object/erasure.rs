use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Result, UploadError};
use crate::object::{EncryptionKey, SECTOR_SIZE};
use crate::upload::RedundancySettings;

/// Erasure-encode slab data into `total_shards` sector-size shards.
///
/// `data` may be shorter than `min_shards * SECTOR_SIZE`; the tail is
/// zero-padded. Data shards come first, parity shards follow.
pub fn encode_shards(data: &[u8], rs: &RedundancySettings) -> Result<Vec<Vec<u8>>> {
    rs.validate()?;
    let min = rs.min_shards as usize;
    let total = rs.total_shards as usize;
    if data.len() > min * SECTOR_SIZE {
        return Err(UploadError::Erasure(format!(
            "slab data too large: {} > {}",
            data.len(),
            min * SECTOR_SIZE
        )));
    }

    let mut shards = vec![vec![0u8; SECTOR_SIZE]; total];
    for (i, shard) in shards.iter_mut().enumerate().take(min) {
        let start = i * SECTOR_SIZE;
        if start >= data.len() {
            break;
        }
        let end = (start + SECTOR_SIZE).min(data.len());
        shard[..end - start].copy_from_slice(&data[start..end]);
    }

    if total > min {
        let codec = ReedSolomon::new(min, total - min)
            .map_err(|e| UploadError::Erasure(e.to_string()))?;
        codec
            .encode(&mut shards)
            .map_err(|e| UploadError::Erasure(e.to_string()))?;
    }

    Ok(shards)
}

/// Encode and encrypt a buffered partial slab with its stored key, producing
/// the shard set for a packed-slab upload.
pub fn encode_partial_slab(
    data: &[u8],
    key: &EncryptionKey,
    rs: &RedundancySettings,
) -> Result<Vec<Vec<u8>>> {
    let mut shards = encode_shards(data, rs)?;
    key.encrypt_shards(&mut shards);
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(min: u8, total: u8) -> RedundancySettings {
        RedundancySettings {
            min_shards: min,
            total_shards: total,
        }
    }

    #[test]
    fn encode_produces_total_shards_of_sector_size() {
        let data = vec![0x42u8; SECTOR_SIZE + 17];
        let shards = encode_shards(&data, &rs(2, 4)).unwrap();
        assert_eq!(shards.len(), 4);
        for shard in &shards {
            assert_eq!(shard.len(), SECTOR_SIZE);
        }
        // First data shard is the raw prefix.
        assert_eq!(&shards[0][..], &data[..SECTOR_SIZE]);
        // Second data shard carries the padded tail.
        assert_eq!(&shards[1][..17], &data[SECTOR_SIZE..]);
        assert!(shards[1][17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parity_shards_are_not_zero() {
        let data = vec![0x42u8; 1024];
        let shards = encode_shards(&data, &rs(2, 4)).unwrap();
        assert!(shards[2].iter().any(|&b| b != 0));
        assert!(shards[3].iter().any(|&b| b != 0));
    }

    #[test]
    fn no_parity_is_a_plain_split() {
        let data = vec![0x11u8; 100];
        let shards = encode_shards(&data, &rs(2, 2)).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(&shards[0][..100], &data[..]);
    }

    #[test]
    fn oversized_data_rejected() {
        let data = vec![0u8; 2 * SECTOR_SIZE + 1];
        assert!(encode_shards(&data, &rs(2, 4)).is_err());
    }

    #[test]
    fn partial_slab_shards_are_encrypted() {
        let data = vec![0x42u8; 1024];
        let key = EncryptionKey::generate();
        let plain = encode_shards(&data, &rs(2, 3)).unwrap();
        let encrypted = encode_partial_slab(&data, &key, &rs(2, 3)).unwrap();
        assert_eq!(encrypted.len(), 3);
        assert_ne!(encrypted[0], plain[0]);
        // Same keystream decrypts back to the encoded shard.
        let mut back = encrypted[0].clone();
        key.apply_to_shard(0, &mut back);
        assert_eq!(back, plain[0]);
    }
}
