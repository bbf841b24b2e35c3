use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte file contract identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileContractId(pub [u8; 32]);

impl FileContractId {
    /// Generate a random contract ID, for tests and fixtures.
    pub fn generate() -> Self {
        let mut buf = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut buf);
        FileContractId(buf)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> std::result::Result<Self, String> {
        let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
        if bytes.len() != 32 {
            return Err(format!("expected 32 bytes, got {}", bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(FileContractId(arr))
    }
}

impl fmt::Debug for FileContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileContractId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for FileContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fcid:{}", &self.to_hex()[..16])
    }
}
