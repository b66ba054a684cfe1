//! Client-side token acquisition with daemon delegation.
//!
//! One-shot invocations probe the daemon socket first and delegate over
//! HTTP when it is up. Only transport failures fall back to in-process
//! minting; a non-200 daemon verdict is authoritative and surfaces as-is.

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use crate::cache::{Cache, FileCache, FileConfig};
use crate::consts;
use crate::credential_providers::{get_token, TokenProvider};
use crate::token::Token;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
enum DelegateError {
    /// The daemon transport failed; the caller may retry locally.
    #[error("error calling token service")]
    Call(#[source] anyhow::Error),
    /// The daemon answered and refused; its verdict stands.
    #[error("error response from token service: {0}")]
    Refused(StatusCode),
}

/// Retrieves a token through the daemon when its socket is live, minting
/// in-process over the filesystem cache otherwise.
pub async fn get_client_token<P: TokenProvider>(socket: &Path, options: &mut P) -> Result<Token> {
    if is_socket(socket) {
        debug!(namespace = P::NAMESPACE, "getting from central service");

        match delegate(socket, options).await {
            Ok(token) => {
                debug!(namespace = P::NAMESPACE, "got from central service");
                return Ok(token);
            }
            Err(DelegateError::Refused(status)) => {
                return Err(anyhow!("error response from remote: {status}"));
            }
            Err(err) => {
                let chain = format!("{:#}", anyhow::Error::new(err));
                warn!(
                    namespace = P::NAMESPACE,
                    error = %chain,
                    "error getting from central service, try getting locally",
                );
            }
        }
    } else {
        debug!(namespace = P::NAMESPACE, "getting locally");
    }

    get_local_token(options)
        .await
        .context("error getting token locally")
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|metadata| metadata.file_type().is_socket())
        .unwrap_or(false)
}

async fn delegate<P: TokenProvider>(socket: &Path, options: &P) -> Result<Token, DelegateError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket))
        .await
        .map_err(|_| DelegateError::Call(anyhow!("connect timed out")))?
        .map_err(|err| DelegateError::Call(anyhow!(err).context("error connecting to socket")))?;

    let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|err| DelegateError::Call(anyhow!(err).context("error in http handshake")))?;

    tokio::spawn(async move {
        let _ = connection.await;
    });

    let mut path = format!("/{}", P::NAMESPACE);
    for segment in options.route() {
        path.push('/');
        path.push_str(segment);
    }

    let (username, password) = options.identity();
    let authorization = format!("Basic {}", STANDARD.encode(format!("{username}:{password}")));

    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::HOST, "localhost")
        .header(header::AUTHORIZATION, authorization)
        .header(header::USER_AGENT, consts::USER_AGENT)
        .header(consts::DECAPSULED_HEADER, "true")
        .body(Empty::<Bytes>::new())
        .map_err(|err| DelegateError::Call(anyhow!(err).context("error creating remote request")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|err| DelegateError::Call(anyhow!(err).context("error making remote request")))?;

    if response.status() != StatusCode::OK {
        return Err(DelegateError::Refused(response.status()));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| DelegateError::Call(anyhow!(err).context("error reading response body")))?
        .to_bytes();

    serde_json::from_slice(&body)
        .map_err(|err| DelegateError::Call(anyhow!(err).context("error decoding requested token")))
}

async fn get_local_token<P: TokenProvider>(options: &mut P) -> Result<Token> {
    let cache = FileCache::new(FileConfig::default()).context("error creating cache")?;

    let token = get_token(options, Some(&cache)).await;
    cache.close().await;

    Ok(token?)
}
