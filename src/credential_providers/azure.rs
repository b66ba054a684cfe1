use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::{expand_hosted, TokenProvider, ValidationError};
use crate::token::Token;

#[derive(Debug, Clone, Default)]
pub struct AzureOptions {
    pub client_id: String,
    pub client_secret: String,
    pub tenant: String,
    pub resource: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

fn valid_resource(resource: &str) -> bool {
    resource
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '/'))
}

#[async_trait]
impl TokenProvider for AzureOptions {
    const NAMESPACE: &'static str = "azure";

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

        if self.tenant.is_empty() {
            return Err(ValidationError::required("tenant"));
        }

        if self.resource.is_empty() {
            return Err(ValidationError::required("resource"));
        }

        if !valid_resource(&self.resource) {
            return Err(ValidationError::invalid(
                "resource ID must be alphanumeric and contain only '.', ':', '-', and '/' characters",
            ));
        }

        Ok(())
    }

    fn cache_key(&self) -> String {
        [
            Self::NAMESPACE,
            &self.client_id,
            &self.tenant,
            &self.resource,
        ]
        .join("_")
    }

    fn identity(&self) -> (&str, &str) {
        (&self.client_id, &self.client_secret)
    }

    fn route(&self) -> Vec<&str> {
        vec![&self.tenant, &self.resource]
    }

    async fn mint(&self) -> anyhow::Result<Token> {
        let endpoint = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant,
        );

        let response = reqwest::Client::new()
            .post(&endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.resource.as_str()),
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
