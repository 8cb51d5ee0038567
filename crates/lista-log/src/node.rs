//! Signed log entries.

use crate::error::{LogError, Result};
use crate::key::WriterKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One entry in a writer's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Author
    pub writer: WriterKey,
    /// Position in the author's log
    pub seq: u64,
    /// Entries of other writers the author had merged when appending
    pub clock: BTreeMap<WriterKey, u64>,
    /// Operation payload
    pub value: Value,
    /// Hex ed25519 signature over the fields above
    pub signature: String,
}

/// Total order over nodes. Sorting by this key is a linear extension of causality:
/// every dependency of a node has a strictly smaller weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderKey {
    pub weight: u64,
    pub writer: WriterKey,
    pub seq: u64,
}

impl Node {
    /// Create and sign a node.
    pub fn signed(
        key: &SigningKey,
        seq: u64,
        clock: BTreeMap<WriterKey, u64>,
        value: Value,
    ) -> Result<Self> {
        let writer = WriterKey(key.verifying_key().to_bytes());
        let payload = signing_payload(&writer, seq, &clock, &value)?;
        let signature = key.sign(&payload);
        Ok(Self {
            writer,
            seq,
            clock,
            value,
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// Check the signature against the writer key.
    pub fn verify(&self) -> Result<()> {
        let verifying = VerifyingKey::from_bytes(self.writer.as_bytes())?;
        let bytes: [u8; 64] = hex::decode(&self.signature)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| LogError::Corruption("malformed signature".into()))?;
        let signature = Signature::from_bytes(&bytes);
        let payload = signing_payload(&self.writer, self.seq, &self.clock, &self.value)?;
        verifying.verify(&payload, &signature)?;
        Ok(())
    }

    /// Position of this node in the merged order.
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            weight: self.seq + self.clock.values().sum::<u64>(),
            writer: self.writer,
            seq: self.seq,
        }
    }
}

fn signing_payload(
    writer: &WriterKey,
    seq: u64,
    clock: &BTreeMap<WriterKey, u64>,
    value: &Value,
) -> Result<Vec<u8>> {
    let encoded = serde_json::to_vec(&(writer, seq, clock, value))?;
    Ok(blake3::hash(&encoded).as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> SigningKey {
        SigningKey::generate(&mut rand::thread_rng())
    }

    #[test]
    fn sign_and_verify() {
        let node = Node::signed(&key(), 0, BTreeMap::new(), json!({"type": "add"})).unwrap();
        node.verify().unwrap();
    }

    #[test]
    fn tampered_value_fails_verification() {
        let mut node = Node::signed(&key(), 0, BTreeMap::new(), json!({"type": "add"})).unwrap();
        node.value = json!({"type": "delete"});
        assert!(matches!(node.verify(), Err(LogError::Corruption(_))));
    }

    #[test]
    fn dependencies_sort_first() {
        let a = key();
        let b = key();
        let a0 = Node::signed(&a, 0, BTreeMap::new(), json!(null)).unwrap();
        let a1 = Node::signed(&a, 1, BTreeMap::new(), json!(null)).unwrap();

        let mut clock = BTreeMap::new();
        clock.insert(a0.writer, 2);
        let b0 = Node::signed(&b, 0, clock, json!(null)).unwrap();

        assert!(a0.order_key() < a1.order_key());
        assert!(a1.order_key() < b0.order_key());
    }
}
