use sha2::{Digest, Sha256};

/// Inline result reference for jobs whose output is not uploaded anywhere.
///
/// SHA-256 of the exact output bytes, `0x`-prefixed lowercase hex (66 chars).
/// This is a proof pointer for settlement, not a signature: anyone holding
/// the output can reproduce it.
pub fn result_hash(output: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output);
    format!("0x{:x}", hasher.finalize())
}
