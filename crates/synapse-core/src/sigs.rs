//! Signed-message canonicalization and recovery.
//!
//! Canonical messages are built by explicit formatting, never by
//! serializing a map, so key order is fixed and both sides agree on the
//! exact bytes. Addresses are always lowercased before they enter a
//! message.

use ethers::types::Signature;
use synapse_chain::canonical_address;

/// Canonical signed message for a telemetry report
pub fn canonical_metrics_message(address: &str, processed_tokens: u64, timestamp: i64) -> String {
    format!(
        r#"{{"agent":"{}","processed_tokens":{},"timestamp":{}}}"#,
        address.to_lowercase(),
        processed_tokens,
        timestamp
    )
}

/// Canonical signed message for node registration
pub fn canonical_node_register_message(address: &str, endpoint: &str, timestamp: i64) -> String {
    format!(
        r#"{{"address":"{}","endpoint":"{}","timestamp":{}}}"#,
        address.to_lowercase(),
        endpoint,
        timestamp
    )
}

/// Canonical signed message for pipeline registration and readiness
pub fn canonical_pipeline_message(address: &str, model: &str, timestamp: i64) -> String {
    format!(
        r#"{{"address":"{}","model":"{}","timestamp":{}}}"#,
        address.to_lowercase(),
        model,
        timestamp
    )
}

/// Recover the EIP-191 personal-message signer and require it to be
/// `expected` (lowercase hex). Returns the failure reason on mismatch.
pub fn verify_signed(message: &str, signature: &str, expected: &str) -> Result<(), String> {
    let raw = signature.trim_start_matches("0x");
    let sig: Signature = raw
        .parse()
        .map_err(|e| format!("malformed signature: {e}"))?;

    let recovered = sig
        .recover(message)
        .map_err(|e| format!("recovery failed: {e}"))?;

    let recovered = canonical_address(&recovered);
    if recovered != expected.to_lowercase() {
        return Err(format!("signer {recovered} does not match {expected}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    #[test]
    fn metrics_message_is_stable() {
        let msg = canonical_metrics_message("0xAABBccddEEff00112233445566778899aabbccdd", 550, 1060);
        assert_eq!(
            msg,
            r#"{"agent":"0xaabbccddeeff00112233445566778899aabbccdd","processed_tokens":550,"timestamp":1060}"#
        );
    }

    #[tokio::test]
    async fn signed_message_roundtrip() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let address = format!("{:#x}", wallet.address());

        let message = canonical_metrics_message(&address, 100, 1000);
        let signature = wallet.sign_message(&message).await.unwrap();

        assert!(verify_signed(&message, &signature.to_string(), &address).is_ok());
    }

    #[tokio::test]
    async fn wrong_signer_is_rejected() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let other = LocalWallet::new(&mut rand::thread_rng());
        let address = format!("{:#x}", wallet.address());

        let message = canonical_metrics_message(&address, 100, 1000);
        let signature = other.sign_message(&message).await.unwrap();

        assert!(verify_signed(&message, &signature.to_string(), &address).is_err());
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let address = format!("{:#x}", wallet.address());

        let message = canonical_metrics_message(&address, 100, 1000);
        let signature = wallet.sign_message(&message).await.unwrap();

        let tampered = canonical_metrics_message(&address, 101, 1000);
        assert!(verify_signed(&tampered, &signature.to_string(), &address).is_err());
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(verify_signed("msg", "0xzz", "0xaa").is_err());
        assert!(verify_signed("msg", "", "0xaa").is_err());
    }
}
