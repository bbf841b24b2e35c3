pub mod erasure;
pub mod reader;

use std::collections::BTreeMap;
use std::fmt;

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use caravel_types::{FileContractId, Hash256, PublicKey};

/// Size of one stored sector: 4 MiB.
pub const SECTOR_SIZE: usize = 1 << 22;

/// Root of a sector as the hosts compute it over the (encrypted) shard bytes.
pub fn sector_root(sector: &[u8]) -> Hash256 {
    Hash256::compute(sector)
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// A 32-byte XChaCha20 key. Objects carry one for the byte stream, each slab
/// carries its own for the encoded shards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut buf = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut buf);
        EncryptionKey(buf)
    }

    /// Apply the keystream for `shard_index` to `data`. XChaCha20 is its own
    /// inverse, so the same call decrypts.
    pub fn apply_to_shard(&self, shard_index: usize, data: &mut [u8]) {
        let mut nonce = [0u8; 24];
        nonce[..8].copy_from_slice(&(shard_index as u64).to_le_bytes());
        let mut cipher = XChaCha20::new(&self.0.into(), &nonce.into());
        cipher.apply_keystream(data);
    }

    /// Encrypt every shard of a slab in place, nonce derived per index.
    pub fn encrypt_shards(&self, shards: &mut [Vec<u8>]) {
        for (i, shard) in shards.iter_mut().enumerate() {
            self.apply_to_shard(i, shard);
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        write!(f, "EncryptionKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Object model
// ---------------------------------------------------------------------------

/// A sector stored on hosts: its root, the host that most recently stored it,
/// and every contract known to hold it, keyed by host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub root: Hash256,
    pub latest_host: PublicKey,
    pub contracts: BTreeMap<PublicKey, Vec<FileContractId>>,
}

/// A fixed-size erasure-coded unit: `total_shards` sectors of which any
/// `min_shards` suffice to reconstruct the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slab {
    pub key: EncryptionKey,
    pub min_shards: u8,
    pub shards: Vec<Sector>,
}

impl Slab {
    pub fn new(min_shards: u8) -> Self {
        Slab {
            key: EncryptionKey::generate(),
            min_shards,
            shards: Vec::new(),
        }
    }
}

/// A contiguous byte range of one slab, as referenced by an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabSlice {
    pub slab: Slab,
    pub offset: u32,
    pub length: u32,
}

/// One stored object: an encryption key for the byte stream plus the slabs
/// holding its data, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub key: EncryptionKey,
    pub slabs: Vec<SlabSlice>,
}

impl Object {
    pub fn new() -> Self {
        Object {
            key: EncryptionKey::generate(),
            slabs: Vec::new(),
        }
    }

    /// Total logical length of the object in bytes.
    pub fn total_length(&self) -> u64 {
        self.slabs.iter().map(|s| s.length as u64).sum()
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}
