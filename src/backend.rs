//! Local execution backend
//!
//! Nothing is provisioned. Every node gets a stable id derived from its
//! address, and its configuration is echoed back as attributes, so plans can
//! be exercised end to end against local state files.

use anyhow::{Result, bail};
use stackgraph::{Attributes, ExecutionBackend, NodeKey};

#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    /// Node addresses that fail on apply
    failing: Vec<String>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `address` (`stack.node`) fail when applied
    pub fn failing(mut self, address: impl Into<String>) -> Self {
        self.failing.push(address.into());
        self
    }

    /// `<kind>-<first 12 hex digits of blake3(address)>`
    pub fn id_for(key: &NodeKey, kind: &str) -> String {
        let hash = blake3::hash(key.to_string().as_bytes()).to_hex();
        format!("{}-{}", kind, &hash[..12])
    }
}

impl ExecutionBackend for SimulatedBackend {
    fn apply(&self, key: &NodeKey, kind: &str, config: &serde_json::Value) -> Result<Attributes> {
        let address = key.to_string();
        if self.failing.contains(&address) {
            bail!("simulated failure for {address}");
        }

        let mut attributes = match config {
            serde_json::Value::Object(entries) => entries.clone().into_iter().collect(),
            _ => Attributes::new(),
        };
        let id = Self::id_for(key, kind);
        attributes.insert("arn".into(), format!("arn:sim:{kind}:{id}").into());
        attributes.insert("id".into(), id.into());

        log::debug!("simulated apply of {address} ({kind})");
        Ok(attributes)
    }

    fn destroy(&self, key: &NodeKey, kind: &str) -> Result<()> {
        log::debug!("simulated destroy of {key} ({kind})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_stable() {
        let key = NodeKey::new("network", "vpc");
        let first = SimulatedBackend::id_for(&key, "aws_vpc");
        assert_eq!(first, SimulatedBackend::id_for(&key, "aws_vpc"));
        assert!(first.starts_with("aws_vpc-"));
        assert_eq!(first.len(), "aws_vpc-".len() + 12);
        assert_ne!(first, SimulatedBackend::id_for(&NodeKey::new("cluster", "vpc"), "aws_vpc"));
    }

    #[test]
    fn test_apply_echoes_config() {
        let backend = SimulatedBackend::new();
        let key = NodeKey::new("network", "vpc");
        let attributes = backend
            .apply(&key, "aws_vpc", &json!({ "cidr_block": "10.0.0.0/16" }))
            .unwrap();
        assert_eq!(attributes["cidr_block"], json!("10.0.0.0/16"));
        assert_eq!(attributes["id"], json!(SimulatedBackend::id_for(&key, "aws_vpc")));
        assert!(attributes["arn"].as_str().unwrap().starts_with("arn:sim:aws_vpc:"));
    }

    #[test]
    fn test_failing_node() {
        let backend = SimulatedBackend::new().failing("cluster.eks");
        let err = backend
            .apply(&NodeKey::new("cluster", "eks"), "aws_eks_cluster", &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("cluster.eks"));
        assert!(backend.destroy(&NodeKey::new("cluster", "eks"), "aws_eks_cluster").is_ok());
    }
}
