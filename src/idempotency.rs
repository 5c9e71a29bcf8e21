//! 128-bit random hex idempotency keys.
//!
//! Every CEX-facing side effect (`marketTrade`, `fundsTransfer`, `withdraw`, deposit-address
//! issuance) is called with one of these, minted once per state entry and persisted before the
//! first attempt so retries within that state reuse it and let the CEX deduplicate.

use hex::DisplayHex;
use rand::RngCore;

pub fn new_idempotency_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.to_lower_hex_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_32_hex_chars_and_distinct() {
        let a = new_idempotency_key();
        let b = new_idempotency_key();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
