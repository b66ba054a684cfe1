use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{expand_hosted, TokenProvider, ValidationError};
use crate::token::Token;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
];

#[derive(Debug, Clone, Default)]
pub struct GcpOptions {
    pub client_id: String,
    pub client_secret: String,
    pub region: String,
    pub cluster: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[async_trait]
impl TokenProvider for GcpOptions {
    const NAMESPACE: &'static str = "gcp";

    fn validate(&mut self) -> Result<(), ValidationError> {
        let mut hosted = expand_hosted(&mut self.client_id);
        if self.client_id.is_empty() {
            return Err(ValidationError::required(if hosted {
                "hosted client ID"
            } else {
                "client ID"
            }));
        }

        hosted |= expand_hosted(&mut self.client_secret);
        if self.client_secret.is_empty() {
            return Err(ValidationError::required(if hosted {
                "hosted client secret"
            } else {
                "client secret"
            }));
        }

        if self.region.is_empty() {
            return Err(ValidationError::required("region"));
        }

        if self.cluster.is_empty() {
            return Err(ValidationError::required("cluster"));
        }

        Ok(())
    }

    fn cache_key(&self) -> String {
        [
            Self::NAMESPACE,
            &self.client_id,
            &self.region,
            &self.cluster,
        ]
        .join("_")
    }

    fn identity(&self) -> (&str, &str) {
        (&self.client_id, &self.client_secret)
    }

    fn route(&self) -> Vec<&str> {
        vec![&self.region, &self.cluster]
    }

    async fn mint(&self) -> anyhow::Result<Token> {
        let response = reqwest::Client::new()
            .post(TOKEN_ENDPOINT)
            // Credentials go in the header, not the form body.
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", SCOPES.join(" ").as_str()),
            ])
            .send()
            .await
            .context("error requesting token")?;

        let status = response.status();
        anyhow::ensure!(status.is_success(), "token endpoint returned {status}");

        let token: TokenResponse = response
            .json()
            .await
            .context("error decoding token response")?;
        anyhow::ensure!(!token.access_token.is_empty(), "no token found");

        Ok(Token {
            expiration: Some(Utc::now() + chrono::Duration::seconds(token.expires_in)),
            value: token.access_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> GcpOptions {
        GcpOptions {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            region: "us-central1".to_string(),
            cluster: "c1".to_string(),
        }
    }

    #[test]
    fn key_covers_identifying_fields_only() {
        assert_eq!(options().cache_key(), "gcp_client_us-central1_c1");

        let mut other = options();
        other.client_secret = "rotated".to_string();
        assert_eq!(options().cache_key(), other.cache_key());
    }

    #[test]
    fn validation_messages() {
        let mut missing_id = options();
        missing_id.client_id = String::new();
        assert_eq!(
            missing_id.validate().unwrap_err().to_string(),
            "client ID is required",
        );

        let mut missing_cluster = options();
        missing_cluster.cluster = String::new();
        assert_eq!(
            missing_cluster.validate().unwrap_err().to_string(),
            "cluster is required",
        );
    }
}
