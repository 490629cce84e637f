//! Inference proof store.
//!
//! Proofs are stored and plausibility-checked only; true verification of
//! `outputHash = hash(model(inputHash))` is deferred to a future on-chain
//! verifier, which calls back through `mark_verified`.

use crate::error::{CoreError, Result};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use synapse_storage::models::ProofRow;
use synapse_storage::Store;
use uuid::Uuid;

/// Proof payload attached to a telemetry report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofSubmission {
    pub model_hash: String,
    pub input_hash: String,
    pub output_hash: String,
    pub token_count: u64,
}

/// 0x-prefixed 32-byte hex
pub fn is_hash32(s: &str) -> bool {
    let Some(hex_part) = s.strip_prefix("0x") else {
        return false;
    };
    hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

/// Save-time plausibility check. `epoch_tokens` is the accumulated token
/// count for the proof's `(address, epoch)`.
pub fn is_plausible(proof: &ProofSubmission, epoch_tokens: i64) -> bool {
    if !is_hash32(&proof.model_hash)
        || !is_hash32(&proof.input_hash)
        || !is_hash32(&proof.output_hash)
    {
        return false;
    }
    if proof.token_count as i64 > epoch_tokens {
        return false;
    }
    // Trivially-equal hashes are spam
    if proof.input_hash == proof.output_hash || proof.model_hash == proof.input_hash {
        return false;
    }
    true
}

pub struct ProofStore {
    store: Arc<Store>,
}

impl ProofStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Persist a proof for `(address, epoch)`. Proofs failing plausibility
    /// are kept unverified rather than dropped.
    pub async fn submit(
        &self,
        address: &str,
        epoch: i64,
        proof: &ProofSubmission,
        now: i64,
    ) -> Result<ProofRow> {
        let epoch_tokens = self
            .store
            .get_epoch_metrics(address, epoch)
            .await?
            .map(|m| m.tokens_processed)
            .unwrap_or(0);

        let verified = is_plausible(proof, epoch_tokens);
        let verification_tx_hash = verified.then(|| local_digest(address, epoch, proof));

        let row = ProofRow {
            id: Uuid::new_v4().to_string(),
            address: address.to_lowercase(),
            epoch,
            model_hash: proof.model_hash.clone(),
            input_hash: proof.input_hash.clone(),
            output_hash: proof.output_hash.clone(),
            token_count: proof.token_count as i64,
            verified,
            verification_tx_hash,
            created_at: now,
            verified_at: verified.then_some(now),
        };

        self.store.insert_proof(&row).await?;
        Ok(row)
    }

    /// Sum of token counts over verified proofs, consumed by the scorer
    pub async fn verified_token_count(&self, address: &str, epoch: i64) -> Result<i64> {
        Ok(self.store.verified_token_count(address, epoch).await?)
    }

    /// Callback for an external verifier confirming a proof on-chain
    pub async fn mark_verified(&self, id: &str, tx_hash: &str, now: i64) -> Result<()> {
        self.store
            .mark_proof_verified(id, tx_hash, now)
            .await
            .map_err(CoreError::from)
    }
}

/// Local digest recorded in place of an on-chain verification tx
fn local_digest(address: &str, epoch: i64, proof: &ProofSubmission) -> String {
    let preimage = format!(
        "{}:{}:{}:{}:{}",
        address.to_lowercase(),
        epoch,
        proof.model_hash,
        proof.input_hash,
        proof.output_hash
    );
    format!("0x{}", hex::encode(keccak256(preimage.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proof(tokens: u64) -> ProofSubmission {
        ProofSubmission {
            model_hash: format!("0x{}", "11".repeat(32)),
            input_hash: format!("0x{}", "22".repeat(32)),
            output_hash: format!("0x{}", "33".repeat(32)),
            token_count: tokens,
        }
    }

    #[test]
    fn hash_format_checks() {
        assert!(is_hash32(&format!("0x{}", "ab".repeat(32))));
        assert!(!is_hash32(&"ab".repeat(32)));
        assert!(!is_hash32("0x1234"));
        assert!(!is_hash32(&format!("0x{}", "zz".repeat(32))));
    }

    #[test]
    fn plausible_proof_passes() {
        assert!(is_plausible(&proof(100), 500));
    }

    #[test]
    fn token_count_cannot_exceed_epoch_metrics() {
        assert!(!is_plausible(&proof(501), 500));
        assert!(is_plausible(&proof(500), 500));
    }

    #[test]
    fn trivially_equal_hashes_are_spam() {
        let mut p = proof(10);
        p.output_hash = p.input_hash.clone();
        assert!(!is_plausible(&p, 100));

        let mut p = proof(10);
        p.model_hash = p.input_hash.clone();
        assert!(!is_plausible(&p, 100));
    }

    #[test]
    fn malformed_hashes_are_implausible() {
        let mut p = proof(10);
        p.model_hash = "0xdead".to_string();
        assert!(!is_plausible(&p, 100));
    }

    #[test]
    fn local_digest_is_deterministic() {
        let p = proof(10);
        assert_eq!(local_digest("0xAA", 1, &p), local_digest("0xaa", 1, &p));
        assert_ne!(local_digest("0xaa", 1, &p), local_digest("0xaa", 2, &p));
    }
}
