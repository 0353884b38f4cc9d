//! Message signature policies
//!
//! Policies are kept in an ordered list; the head is the active one and is
//! used for both signing and verification. Signatures travel inside JSON
//! payloads under the `signatures` key and cover the canonical serialization
//! of the payload without that key.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Payload key carrying the signatures
pub const SIGNATURES_KEY: &str = "signatures";

/// One signature over a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "keyId")]
    pub key_id: String,
    #[serde(rename = "signature")]
    pub value: String,
    #[serde(rename = "signingMethod", default, skip_serializing_if = "Option::is_none")]
    pub signing_method: Option<String>,
}

/// Result of checking one signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Valid,
    Invalid,
    UnknownKey,
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Malformed signatures: {0}")]
    Malformed(String),
}

/// Signs and verifies payload bytes
pub trait SignaturePolicy: Send + Sync {
    fn name(&self) -> &str;

    fn sign(&self, action: &str, payload: &[u8]) -> Result<Vec<Signature>, SignatureError>;

    fn verify(&self, action: &str, payload: &[u8], signatures: &[Signature]) -> Vec<VerificationStatus>;
}

/// Ordered set of policies; the first one is active
#[derive(Default)]
pub struct SignaturePolicies {
    policies: RwLock<Vec<Arc<dyn SignaturePolicy>>>,
}

impl SignaturePolicies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `policy` the active one
    pub fn activate(&self, policy: Arc<dyn SignaturePolicy>) {
        info!("Activating signature policy {}", policy.name());
        self.policies.write().insert(0, policy);
    }

    /// Append a standby policy
    pub fn add(&self, policy: Arc<dyn SignaturePolicy>) {
        self.policies.write().push(policy);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut policies = self.policies.write();
        let before = policies.len();
        policies.retain(|p| p.name() != name);
        policies.len() != before
    }

    pub fn active(&self) -> Option<Arc<dyn SignaturePolicy>> {
        self.policies.read().first().cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.policies.read().iter().map(|p| p.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.read().is_empty()
    }

    /// Attach signatures to an object payload; returns whether it was signed
    pub fn sign_payload(&self, action: &str, payload: &mut Value) -> Result<bool, SignatureError> {
        let Some(policy) = self.active() else {
            return Ok(false);
        };
        let Some(object) = payload.as_object_mut() else {
            return Ok(false);
        };

        object.remove(SIGNATURES_KEY);
        let canonical = serde_json::to_vec(object)?;
        let signatures = policy.sign(action, &canonical)?;
        object.insert(SIGNATURES_KEY.to_string(), serde_json::to_value(signatures)?);
        Ok(true)
    }

    /// Verify the signatures carried by a payload.
    ///
    /// `Ok(None)` when the payload is unsigned or no policy is active.
    pub fn verify_payload(
        &self,
        action: &str,
        payload: &Value,
    ) -> Result<Option<Vec<VerificationStatus>>, SignatureError> {
        let Some(object) = payload.as_object() else {
            return Ok(None);
        };
        let Some(raw) = object.get(SIGNATURES_KEY) else {
            return Ok(None);
        };
        let Some(policy) = self.active() else {
            debug!("Signed {} payload but no active policy", action);
            return Ok(None);
        };

        let signatures: Vec<Signature> =
            serde_json::from_value(raw.clone()).map_err(|e| SignatureError::Malformed(e.to_string()))?;
        let mut unsigned = object.clone();
        unsigned.remove(SIGNATURES_KEY);
        let canonical = serde_json::to_vec(&unsigned)?;

        Ok(Some(policy.verify(action, &canonical, &signatures)))
    }
}

impl std::fmt::Debug for SignaturePolicies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignaturePolicies").field("policies", &self.names()).finish()
    }
}
