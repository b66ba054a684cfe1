use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXEC_CREDENTIAL_KIND: &str = "ExecCredential";
pub const EXEC_CREDENTIAL_API_VERSION: &str = "client.authentication.k8s.io/v1";

/// A short-lived bearer token together with its expiration instant.
///
/// A token without an expiration is treated as already expired, so a
/// half-decoded cache entry can never be served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecCredentialStatus {
    #[serde(rename = "expirationTimestamp", skip_serializing_if = "Option::is_none")]
    pub expiration_timestamp: Option<DateTime<Utc>>,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecCredential {
    pub kind: String,
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(default)]
    pub spec: HashMap<String, serde_json::Value>,
    pub status: ExecCredentialStatus,
}

impl Token {
    pub fn expired(&self) -> bool {
        match self.expiration {
            Some(expiration) => expiration <= Utc::now(),
            None => true,
        }
    }

    /// Encodes the token for cache storage.
    pub fn to_binary(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes a token from its cache encoding.
    pub fn from_binary(entry: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(entry)
    }

    pub fn to_exec_credential(&self) -> ExecCredential {
        ExecCredential {
            kind: EXEC_CREDENTIAL_KIND.to_string(),
            api_version: EXEC_CREDENTIAL_API_VERSION.to_string(),
            spec: HashMap::new(),
            status: ExecCredentialStatus {
                expiration_timestamp: self.expiration,
                token: self.value.clone(),
            },
        }
    }

    pub fn to_exec_credential_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_exec_credential())
    }
}
