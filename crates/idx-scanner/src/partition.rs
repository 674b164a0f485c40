use sha2::{Digest, Sha256};

/// Deterministic partition key for an address (I6/Q6): a pure function of
/// the lowercased address and the deployment-wide shard count, so every
/// event for a given address always routes to the same partition.
///
/// `shard_count <= 1` yields the bare 16-hex-char digest prefix. For
/// `shard_count > 1` the key is prefixed `"{shard}:"` where `shard` is the
/// first 32 bits of the digest reduced mod `shard_count`.
pub fn partition_key(address: &str, shard_count: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.to_ascii_lowercase().as_bytes());
    let digest = hasher.finalize();
    let hex_digest = hex::encode(&digest[..8]);

    if shard_count > 1 {
        let leading = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let shard = leading % shard_count;
        format!("{shard}:{hex_digest}")
    } else {
        hex_digest
    }
}

/// `event_id = block_hash ":" block_number ":" tx_index ":" log_index`, with
/// `block_number` zero-padded to 20 digits so the total order coincides with
/// numeric block order (load-bearing for the Publisher's `event_id ASC` scan).
pub fn event_id(block_hash: &str, block_number: u64, tx_index: u64, log_index: u64) -> String {
    format!("{block_hash}:{block_number:020}:{tx_index}:{log_index}")
}
