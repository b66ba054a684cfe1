//! The daemon surface: per-provider token routes on a Unix socket.

use std::fs::{DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path as RoutePath, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, MemoryCache, MemoryConfig, SingleFlightCache};
use crate::consts;
use crate::credential_providers::aws::AwsOptions;
use crate::credential_providers::azure::AzureOptions;
use crate::credential_providers::gcp::GcpOptions;
use crate::credential_providers::{get_token, TokenProvider};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) cache: Arc<dyn Cache>,
}

/// Binds the socket, mounts one router per provider and serves until the
/// shutdown token fires.
pub async fn serve(socket: &Path, shutdown: CancellationToken) -> Result<()> {
    let listener = bind_unix_listener(socket)
        .with_context(|| format!("error creating unix listener {}", socket.display()))?;

    let cache = MemoryCache::new(MemoryConfig::default()).context("error creating cache")?;
    let state = ServerState {
        cache: Arc::new(SingleFlightCache::new(cache)),
    };

    info!("serving aws: /aws/{{region}}/{{cluster}}[/{{assume-role-arn}}]");
    info!("serving azure: /azure/{{tenant}}/{{resource}}");
    info!("serving gcp: /gcp/{{region}}/{{cluster}}");

    let result = serve_connections(listener, router(state.clone()), shutdown).await;

    state.cache.close().await;
    let _ = std::fs::remove_file(socket);

    result
}

fn bind_unix_listener(socket: &Path) -> Result<UnixListener> {
    if let Some(dir) = socket.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .context("error creating unix socket dir")?;
    }

    match std::fs::remove_file(socket) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("error unlinking unix socket"),
    }

    let listener = UnixListener::bind(socket).context("error creating unix socket listener")?;

    std::fs::set_permissions(socket, Permissions::from_mode(0o777))
        .context("error chmoding unix socket")?;

    Ok(listener)
}

pub(crate) async fn serve_connections(
    listener: UnixListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!(error = %err, "error accepting connection");
                    continue;
                }
            },
        };

        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let connection = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(READ_TIMEOUT)
                .serve_connection(TokioIo::new(stream), service);

            if let Err(err) = connection.await {
                debug!(error = %err, "connection error");
            }
        });
    }

    Ok(())
}

pub(crate) fn router(state: ServerState) -> Router {
    Router::new()
        .nest("/aws", aws_routes())
        .nest("/azure", azure_routes())
        .nest("/gcp", gcp_routes())
        .layer(middleware::from_fn(deadline))
        .with_state(state)
}

fn aws_routes() -> Router<ServerState> {
    Router::new()
        .route("/{region}/{cluster}", get(aws_token))
        .route("/{region}/{cluster}/{*assume_role_arn}", get(aws_assume_role_token))
        .fallback(incomplete_route)
}

fn azure_routes() -> Router<ServerState> {
    Router::new()
        // The wildcard keeps slashes embedded in the resource, and a
        // trailing one, intact.
        .route("/{tenant}/{*resource}", get(azure_token))
        .fallback(incomplete_route)
}

fn gcp_routes() -> Router<ServerState> {
    Router::new()
        .route("/{region}/{cluster}", get(gcp_token))
        .fallback(incomplete_route)
}

async fn aws_token(
    State(state): State<ServerState>,
    RoutePath((region, cluster)): RoutePath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some((access_key_id, secret_access_key)) = basic_auth(&headers) else {
        return unauthorized();
    };

    let options = AwsOptions {
        access_key_id,
        secret_access_key,
        region,
        cluster,
        assume_role_arn: None,
    };

    respond(&state, options, &headers).await
}

async fn aws_assume_role_token(
    State(state): State<ServerState>,
    RoutePath((region, cluster, assume_role_arn)): RoutePath<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some((access_key_id, secret_access_key)) = basic_auth(&headers) else {
        return unauthorized();
    };

    let options = AwsOptions {
        access_key_id,
        secret_access_key,
        region,
        cluster,
        assume_role_arn: Some(assume_role_arn),
    };

    respond(&state, options, &headers).await
}

async fn azure_token(
    State(state): State<ServerState>,
    RoutePath((tenant, resource)): RoutePath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some((client_id, client_secret)) = basic_auth(&headers) else {
        return unauthorized();
    };

    let options = AzureOptions {
        client_id,
        client_secret,
        tenant,
        resource,
    };

    respond(&state, options, &headers).await
}

async fn gcp_token(
    State(state): State<ServerState>,
    RoutePath((region, cluster)): RoutePath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some((client_id, client_secret)) = basic_auth(&headers) else {
        return unauthorized();
    };

    let options = GcpOptions {
        client_id,
        client_secret,
        region,
        cluster,
    };

    respond(&state, options, &headers).await
}

async fn respond<P: TokenProvider>(
    state: &ServerState,
    mut options: P,
    headers: &HeaderMap,
) -> Response {
    let token = match get_token(&mut options, Some(state.cache.as_ref())).await {
        Ok(token) => token,
        Err(err) => {
            let chain = format!("{:#}", anyhow::Error::new(err));
            error!(namespace = P::NAMESPACE, error = %chain, "error getting token");

            return (StatusCode::INTERNAL_SERVER_ERROR, chain).into_response();
        }
    };

    let body = if decapsuled(headers) {
        serde_json::to_string(&token)
    } else {
        token.to_exec_credential_json()
    };

    match body {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            error!(namespace = P::NAMESPACE, error = %err, "error encoding token");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some((username.to_string(), password.to_string()))
}

fn decapsuled(headers: &HeaderMap) -> bool {
    headers
        .get(consts::DECAPSULED_HEADER)
        .and_then(|value| value.to_str().ok())
        == Some("true")
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

async fn incomplete_route() -> Response {
    (StatusCode::BAD_REQUEST, "Bad Request").into_response()
}

async fn deadline(request: Request, next: Next) -> Response {
    match tokio::time::timeout(WRITE_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "request deadline exceeded").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;
    use axum::body::Body;
    use chrono::{Duration as ChronoDuration, Utc};
    use http::{Method, Request as HttpRequest};
    use tower::ServiceExt;

    fn test_state() -> ServerState {
        let cache = MemoryCache::new(MemoryConfig {
            lazy_entry_eviction: true,
            ..MemoryConfig::default()
        })
        .unwrap();

        ServerState {
            cache: Arc::new(SingleFlightCache::new(cache)),
        }
    }

    fn authorization(username: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
    }

    async fn seed(state: &ServerState, key: &str, value: &str) {
        let token = Token {
            expiration: Some(Utc::now() + ChronoDuration::minutes(10)),
            value: value.to_string(),
        };
        state
            .cache
            .set(key, &token.to_binary().unwrap())
            .await
            .unwrap();
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn non_get_is_rejected() {
        let app = router(test_state());

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/aws/us-east-1/c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn missing_basic_auth_is_rejected() {
        let app = router(test_state());

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/gcp/us-central1/c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn short_route_is_a_bad_request() {
        let app = router(test_state());

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/aws/us-east-1")
                    .header(header::AUTHORIZATION, authorization("AKIA", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_options_surface_as_internal_error() {
        let app = router(test_state());

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/aws/us-east-1/c1")
                    .header(header::AUTHORIZATION, authorization("", ""))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("access key ID is required"));
    }

    #[tokio::test]
    async fn cached_token_is_wrapped_as_exec_credential() {
        let state = test_state();

        let options = AwsOptions {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            region: "us-east-1".to_string(),
            cluster: "c1".to_string(),
            assume_role_arn: None,
        };
        seed(&state, &options.cache_key(), "k8s-aws-v1.cached").await;

        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/aws/us-east-1/c1")
                    .header(header::AUTHORIZATION, authorization("AKIAEXAMPLE", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json",
        );

        let doc = body_json(response).await;
        assert_eq!(doc["kind"], "ExecCredential");
        assert_eq!(doc["status"]["token"], "k8s-aws-v1.cached");
    }

    #[tokio::test]
    async fn decapsuled_response_is_the_raw_token() {
        let state = test_state();

        let options = AzureOptions {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            tenant: "tenant123".to_string(),
            resource: "https://management.azure.com/.default".to_string(),
        };
        seed(&state, &options.cache_key(), "azure-bearer").await;

        let response = router(state)
            .oneshot(
                HttpRequest::builder()
                    .uri("/azure/tenant123/https://management.azure.com/.default")
                    .header(header::AUTHORIZATION, authorization("client", "secret"))
                    .header(consts::DECAPSULED_HEADER, "true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let doc = body_json(response).await;
        assert_eq!(doc["value"], "azure-bearer");
        assert!(doc["expiration"].is_string());
        assert!(doc.get("kind").is_none());
    }
}
