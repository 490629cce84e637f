//! Precompile addresses and calldata codecs.
//!
//! The chain exposes four fixed-address entries the watcher decodes and the
//! oracle writes to. Calldata is a sequence of 32-byte blocks with addresses
//! right-aligned in their block. All decoding is defensive: malformed
//! lengths return `None` and the caller logs and skips.

use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;

pub const PRECOMPILE_VERIFY_INFERENCE: u64 = 0x20;
pub const PRECOMPILE_AGENT_REGISTER: u64 = 0x21;
pub const PRECOMPILE_AGENT_HEARTBEAT: u64 = 0x22;
pub const PRECOMPILE_CLAIM_REWARD: u64 = 0x23;

const WORD: usize = 32;

/// Fixed precompile address from its low byte
pub fn precompile_address(low: u64) -> Address {
    Address::from_low_u64_be(low)
}

/// Decoded agent-register calldata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPayload {
    pub name: String,
    pub model_hash: H256,
    pub capabilities: Vec<String>,
    pub beneficiary: Option<Address>,
}

fn word(input: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * WORD;
    input.get(start..start + WORD)
}

fn address_from_word(block: &[u8]) -> Address {
    Address::from_slice(&block[12..])
}

fn string_from_word(block: &[u8]) -> String {
    let end = block.iter().position(|&b| b == 0).unwrap_or(WORD);
    String::from_utf8_lossy(&block[..end]).into_owned()
}

/// Decode `(name[32], modelHash[32], capCount[32], caps[32]..., beneficiary[32]?)`
pub fn decode_register(input: &[u8]) -> Option<RegisterPayload> {
    if input.len() < 3 * WORD || input.len() % WORD != 0 {
        return None;
    }

    let name = string_from_word(word(input, 0)?);
    let model_hash = H256::from_slice(word(input, 1)?);
    let cap_count = {
        let block = word(input, 2)?;
        // Counts beyond one word's worth of caps are malformed
        if block[..24].iter().any(|&b| b != 0) {
            return None;
        }
        u64::from_be_bytes(block[24..].try_into().ok()?) as usize
    };

    let expected_min = 3 + cap_count;
    let total_words = input.len() / WORD;
    if total_words < expected_min || cap_count > 64 {
        return None;
    }

    let mut capabilities = Vec::with_capacity(cap_count);
    for i in 0..cap_count {
        capabilities.push(string_from_word(word(input, 3 + i)?));
    }

    let beneficiary = if total_words > expected_min {
        let block = word(input, expected_min)?;
        let addr = address_from_word(block);
        if addr == Address::zero() { None } else { Some(addr) }
    } else {
        None
    };

    Some(RegisterPayload { name, model_hash, capabilities, beneficiary })
}

/// Decode the agent address from the first word of verify-inference calldata
pub fn decode_agent_slot(input: &[u8]) -> Option<Address> {
    let block = input.get(..WORD)?;
    if block[..12].iter().any(|&b| b != 0) {
        return None;
    }
    Some(address_from_word(block))
}

/// Encode a sponsored heartbeat: one word, agent address right-aligned
pub fn encode_heartbeat(agent: Address) -> Bytes {
    let mut data = [0u8; WORD];
    data[12..].copy_from_slice(agent.as_bytes());
    Bytes::from(data.to_vec())
}

/// Topic hash of the `RewardClaimed(address)` log
pub fn reward_claimed_topic() -> H256 {
    H256::from(keccak256(b"RewardClaimed(address)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad_string(s: &str) -> [u8; 32] {
        let mut block = [0u8; 32];
        block[..s.len()].copy_from_slice(s.as_bytes());
        block
    }

    fn pad_address(addr: Address) -> [u8; 32] {
        let mut block = [0u8; 32];
        block[12..].copy_from_slice(addr.as_bytes());
        block
    }

    fn pad_count(n: u64) -> [u8; 32] {
        let mut block = [0u8; 32];
        block[24..].copy_from_slice(&n.to_be_bytes());
        block
    }

    #[test]
    fn decode_register_with_caps_and_beneficiary() {
        let beneficiary = Address::from_low_u64_be(0xBEEF);
        let mut input = Vec::new();
        input.extend_from_slice(&pad_string("worker-1"));
        input.extend_from_slice(&[0xAB; 32]);
        input.extend_from_slice(&pad_count(2));
        input.extend_from_slice(&pad_string("gpu"));
        input.extend_from_slice(&pad_string("fp16"));
        input.extend_from_slice(&pad_address(beneficiary));

        let payload = decode_register(&input).unwrap();
        assert_eq!(payload.name, "worker-1");
        assert_eq!(payload.model_hash, H256::from([0xAB; 32]));
        assert_eq!(payload.capabilities, vec!["gpu".to_string(), "fp16".to_string()]);
        assert_eq!(payload.beneficiary, Some(beneficiary));
    }

    #[test]
    fn decode_register_without_beneficiary() {
        let mut input = Vec::new();
        input.extend_from_slice(&pad_string("worker-2"));
        input.extend_from_slice(&[0x01; 32]);
        input.extend_from_slice(&pad_count(0));

        let payload = decode_register(&input).unwrap();
        assert_eq!(payload.name, "worker-2");
        assert!(payload.capabilities.is_empty());
        assert_eq!(payload.beneficiary, None);
    }

    #[test]
    fn decode_register_rejects_truncated_input() {
        let mut input = Vec::new();
        input.extend_from_slice(&pad_string("worker-3"));
        input.extend_from_slice(&[0x01; 32]);
        input.extend_from_slice(&pad_count(4));
        // Claims 4 caps but provides none
        assert!(decode_register(&input).is_none());
    }

    #[test]
    fn decode_register_rejects_odd_length() {
        assert!(decode_register(&[0u8; 33]).is_none());
        assert!(decode_register(&[]).is_none());
    }

    #[test]
    fn decode_agent_slot_roundtrip() {
        let agent = Address::from_low_u64_be(0xAA01);
        let encoded = encode_heartbeat(agent);
        assert_eq!(decode_agent_slot(&encoded).unwrap(), agent);
    }

    #[test]
    fn decode_agent_slot_rejects_garbage_padding() {
        let mut block = [0xFFu8; 32];
        block[12..].copy_from_slice(Address::zero().as_bytes());
        assert!(decode_agent_slot(&block).is_none());
    }

    #[test]
    fn precompile_addresses_are_fixed() {
        assert_eq!(
            precompile_address(PRECOMPILE_AGENT_HEARTBEAT),
            Address::from_low_u64_be(0x22)
        );
    }
}
