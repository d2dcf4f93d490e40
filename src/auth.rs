//! HTTP Basic credential gate in front of the gRPC services.

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::BoxFuture;
use http::{header, HeaderMap, HeaderValue, Request, Response};
use serde::Deserialize;
use thiserror::Error;
use tower::{Layer, Service};

pub const CHALLENGE: &str = "Basic realm=\"Protected\"";

#[derive(Clone, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Static list of accepted username/password pairs.
#[derive(Clone, Debug, Default)]
pub struct CredentialStore {
    users: Arc<Vec<Credential>>,
}

/// Authenticated caller, available in request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    Missing,
    #[error("malformed authorization header")]
    Malformed,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid user list: {0}")]
    Config(String),
}

impl CredentialStore {
    pub fn new(users: Vec<Credential>) -> Self {
        Self {
            users: Arc::new(users),
        }
    }

    /// Parses `[{"username": "...", "password": "..."}, ...]`.
    pub fn from_json(json: &str) -> Result<Self, AuthError> {
        serde_json::from_str::<Vec<Credential>>(json)
            .map(Self::new)
            .map_err(|e| AuthError::Config(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.users.iter().any(|u| {
            u.username == username && constant_time_eq(u.password.as_bytes(), password.as_bytes())
        })
    }
}

/// Checks an `Authorization: Basic <base64(user:password)>` header.
pub fn authenticate(
    store: &CredentialStore,
    header: Option<&HeaderValue>,
) -> Result<Identity, AuthError> {
    let value = header.ok_or(AuthError::Missing)?;
    let value = value.to_str().map_err(|_| AuthError::Malformed)?;
    let token = value.strip_prefix("Basic ").ok_or(AuthError::Missing)?;
    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    if !store.matches(username, password) {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(Identity {
        username: username.to_string(),
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone, Debug)]
pub struct BasicAuthLayer {
    store: CredentialStore,
}

impl BasicAuthLayer {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for BasicAuthLayer {
    type Service = BasicAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BasicAuth {
            inner,
            store: self.store.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BasicAuth<S> {
    inner: S,
    store: CredentialStore,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for BasicAuth<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        match authenticate(&self.store, req.headers().get(header::AUTHORIZATION)) {
            Ok(identity) => {
                tracing::trace!(user = identity.username, "authenticated");
                req.extensions_mut().insert(identity);
            }
            Err(e) => {
                tracing::warn!(error = %e, uri = %req.uri(), "rejected");
                return Box::pin(async { Ok(reject()) });
            }
        }

        // the clone may not be ready, keep the one that is
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let mut res = inner.call(req).await?;
            set_isolation_headers(res.headers_mut());
            Ok(res)
        })
    }
}

/// Trailers-only gRPC `Unauthenticated` response with a Basic challenge.
fn reject<B: Default>() -> Response<B> {
    let mut res = Response::new(B::default());
    let headers = res.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert("grpc-status", HeaderValue::from(tonic::Code::Unauthenticated as i32));
    headers.insert("grpc-message", HeaderValue::from_static("Unauthorized"));
    headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
    res
}

fn set_isolation_headers(headers: &mut HeaderMap) {
    headers.insert(
        "cross-origin-opener-policy",
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        "cross-origin-embedder-policy",
        HeaderValue::from_static("require-corp"),
    );
}
