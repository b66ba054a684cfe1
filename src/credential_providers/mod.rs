//! Per-provider token acquisition.
//!
//! Every provider supplies an options record implementing
//! [`TokenProvider`]; the shared [`get_token`] pipeline validates it, tries
//! the cache, mints on a miss and stores the result best-effort. Cache
//! failures never fail the call, only minting failures do.

pub mod aws;
pub mod azure;
pub mod gcp;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::cache::{Cache, CacheError};
use crate::token::Token;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ValidationError(String);

impl ValidationError {
    fn required(what: &str) -> Self {
        Self(format!("{what} is required"))
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum GetTokenError {
    #[error("invalid options: {0}")]
    InvalidOptions(#[from] ValidationError),
    #[error("error getting credential token")]
    Minting(#[source] anyhow::Error),
}

/// The provider seam: options validation, the cache key scheme, the daemon
/// route and the actual minting call.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Provider label used as cache-key prefix, URL prefix and log scope.
    const NAMESPACE: &'static str;

    /// Checks required fields, expanding `$`-prefixed values from the
    /// environment first.
    fn validate(&mut self) -> Result<(), ValidationError>;

    /// Cache key derived from the identifying fields only.
    fn cache_key(&self) -> String;

    /// Username/password pair carried as HTTP Basic-Auth when delegating.
    fn identity(&self) -> (&str, &str);

    /// Positional path segments of the daemon route.
    fn route(&self) -> Vec<&str>;

    async fn mint(&self) -> anyhow::Result<Token>;
}

/// Retrieves a token from the cache or mints a fresh one.
pub async fn get_token<P: TokenProvider>(
    options: &mut P,
    cache: Option<&dyn Cache>,
) -> Result<Token, GetTokenError> {
    options.validate()?;

    let key = options.cache_key();

    if let Some(cache) = cache {
        match cache.get(&key).await {
            Ok(entry) => match Token::from_binary(&entry) {
                Ok(token) if !token.expired() => return Ok(token),
                Ok(_) => {}
                Err(err) => {
                    warn!(namespace = P::NAMESPACE, error = %err, "error decoding cached token");
                }
            },
            Err(CacheError::EntryNotFound) => {}
            Err(err) => {
                warn!(namespace = P::NAMESPACE, error = %err, "error retrieving token from cache");
            }
        }
    }

    let token = options.mint().await.map_err(GetTokenError::Minting)?;

    if let Some(cache) = cache {
        match token.to_binary() {
            Ok(entry) => {
                if let Err(err) = cache.set(&key, &entry).await {
                    warn!(namespace = P::NAMESPACE, error = %err, "error saving token to cache");
                }
            }
            Err(err) => {
                warn!(namespace = P::NAMESPACE, error = %err, "error encoding minted token");
            }
        }
    }

    Ok(token)
}

/// Expands a `$NAME` or `${NAME}` reference against the environment; an
/// unset variable expands to empty, which validation then reports.
fn expand_env(value: &str) -> String {
    let name = value.trim_start_matches('$');
    let name = name
        .strip_prefix('{')
        .and_then(|name| name.strip_suffix('}'))
        .unwrap_or(name);

    std::env::var(name).unwrap_or_default()
}

/// Applies hosted-mode expansion to an identity field in place, reporting
/// whether the field was indirected through the environment.
fn expand_hosted(field: &mut String) -> bool {
    if field.starts_with('$') {
        *field = expand_env(field);
        return true;
    }

    false
}
