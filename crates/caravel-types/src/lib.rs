pub mod contract_id;
pub mod hash_256;
pub mod public_key;
pub mod upload_id;

pub use contract_id::FileContractId;
pub use hash_256::Hash256;
pub use public_key::PublicKey;
pub use upload_id::UploadId;
