//! Request payloads for the signed write endpoints.

use serde::Deserialize;
use synapse_core::sigs;

/// Signed node registration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegisterPayload {
    pub address: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub benchmark_tok_per_sec: f64,
    #[serde(default)]
    pub lan_ip: Option<String>,
    #[serde(default)]
    pub can_distribute: bool,
    pub timestamp: i64,
    pub signature: String,
}

impl NodeRegisterPayload {
    pub fn canonical_message(&self) -> String {
        sigs::canonical_node_register_message(&self.address, &self.endpoint, self.timestamp)
    }
}

/// Signed pipeline registration or update
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRegisterPayload {
    pub address: String,
    pub model: String,
    pub grpc_endpoint: String,
    pub http_endpoint: String,
    #[serde(default)]
    pub ram_mb: i64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub vram_mb: i64,
    #[serde(default)]
    pub benchmark_tok_per_sec: f64,
    #[serde(default)]
    pub rpc_port: i32,
    #[serde(default)]
    pub lan_ip: Option<String>,
    pub timestamp: i64,
    pub signature: String,
}

fn default_device() -> String {
    "cpu".to_string()
}

impl PipelineRegisterPayload {
    pub fn canonical_message(&self) -> String {
        sigs::canonical_pipeline_message(&self.address, &self.model, self.timestamp)
    }
}

/// Signed pipeline readiness confirmation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReadyPayload {
    pub address: String,
    pub model: String,
    pub timestamp: i64,
    pub signature: String,
}

impl PipelineReadyPayload {
    pub fn canonical_message(&self) -> String {
        sigs::canonical_pipeline_message(&self.address, &self.model, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_deserialize_from_camel_case() {
        let payload: PipelineRegisterPayload = serde_json::from_str(
            r#"{
                "address": "0xBB01000000000000000000000000000000000001",
                "model": "llama-3-8b",
                "grpcEndpoint": "grpc://10.0.0.1:9000",
                "httpEndpoint": "http://10.0.0.1:8000",
                "ramMb": 8000,
                "device": "cuda",
                "vramMb": 9000,
                "benchmarkTokPerSec": 120.5,
                "rpcPort": 50052,
                "lanIp": "192.168.0.11",
                "timestamp": 1000,
                "signature": "0xdead"
            }"#,
        )
        .unwrap();

        assert_eq!(payload.model, "llama-3-8b");
        assert_eq!(payload.vram_mb, 9000);
        assert_eq!(payload.lan_ip.as_deref(), Some("192.168.0.11"));
    }

    #[test]
    fn canonical_message_lowercases_address() {
        let payload = PipelineReadyPayload {
            address: "0xBB01000000000000000000000000000000000001".to_string(),
            model: "llama-3-8b".to_string(),
            timestamp: 1000,
            signature: String::new(),
        };
        assert_eq!(
            payload.canonical_message(),
            r#"{"address":"0xbb01000000000000000000000000000000000001","model":"llama-3-8b","timestamp":1000}"#
        );
    }
}
