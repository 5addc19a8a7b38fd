mod digest;
mod signature;

pub use digest::{sha256_file_hex, sha256_hex, short_digest};
pub use signature::{require_valid_signature, verify_ed25519_signature_hex};
