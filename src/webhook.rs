// webhook.rs
//! Webhook ingestion pipeline.
//!
//! A request moves through `ReceivingRequest → Validating → Dispatching →
//! Verifying` and ends either delivered, ignored or rejected. Every rejection
//! is a [`WebhookError`], which maps to exactly one HTTP response.

use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::channel::Sender;
use crate::config::{OnInvalidSignature, Settings};
use crate::registry::SourceRegistry;
use crate::signature::Verifier;

pub const HEADER_DELIVERY: &str = "x-github-delivery";
pub const HEADER_EVENT: &str = "x-github-event";
pub const HEADER_SIGNATURE: &str = "x-hub-signature-256";

pub const MISSING_HEADERS_MESSAGE: &str = "Failed to provide correct headers";
pub const VALIDATION_FAILED_MESSAGE: &str = "Error occured during validation.";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("no route for {method} {path}")]
    NotFound { method: Method, path: String },

    #[error("missing required header: {0}")]
    MissingHeaders(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown repository {owner}/{repo}")]
    UnknownRepository { owner: String, repo: String },

    #[error("invalid signature for {owner}/{repo}")]
    InvalidSignature { owner: String, repo: String },

    #[error("no consumer took the event within {0:?}")]
    DeliveryTimedOut(Duration),

    #[error("event consumer has shut down")]
    ConsumerClosed,
}

impl From<serde_json::Error> for WebhookError {
    fn from(e: serde_json::Error) -> Self {
        WebhookError::Validation(e.to_string())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match &self {
            WebhookError::NotFound { .. } => StatusCode::NOT_FOUND.into_response(),
            WebhookError::MissingHeaders(_) => {
                (StatusCode::BAD_REQUEST, MISSING_HEADERS_MESSAGE).into_response()
            }
            WebhookError::Validation(_) => validation_failed(),
            WebhookError::UnknownRepository { .. } => {
                (StatusCode::NOT_FOUND, "Unknown repository").into_response()
            }
            WebhookError::InvalidSignature { .. } => {
                (StatusCode::UNAUTHORIZED, "Invalid signature").into_response()
            }
            WebhookError::DeliveryTimedOut(_) | WebhookError::ConsumerClosed => {
                (StatusCode::SERVICE_UNAVAILABLE, "No consumer available").into_response()
            }
        }
    }
}

/// The 500 response used for any fault after the request shape was accepted.
pub fn validation_failed() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, VALIDATION_FAILED_MESSAGE).into_response()
}

/// Successful terminal states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A push was authenticated (or the repository has no secret) and handed to the consumer.
    Delivered,
    /// An event type this receiver does not act on.
    Ignored,
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        StatusCode::OK.into_response()
    }
}

/// An accepted push, as handed to the downstream consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    pub delivery_id: String,
    pub owner: String,
    pub repo: String,
    pub source_root: String,
    /// Whether the signature was checked against a repository secret.
    pub verified: bool,
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    name: String,
    owner: PushOwner,
}

#[derive(Debug, Deserialize)]
struct PushOwner {
    login: String,
}

/// The orchestrator. Owns handles to the registry, the verifier and the
/// sending side of the event channel.
#[derive(Clone)]
pub struct WebhookPipeline {
    webhook_path: String,
    delivery_timeout: Duration,
    on_invalid_signature: OnInvalidSignature,
    registry: Arc<SourceRegistry>,
    verifier: Arc<dyn Verifier>,
    events: Sender<CheckpointEvent>,
}

impl WebhookPipeline {
    pub fn new(
        settings: &Settings,
        registry: Arc<SourceRegistry>,
        verifier: Arc<dyn Verifier>,
        events: Sender<CheckpointEvent>,
    ) -> Self {
        Self {
            webhook_path: settings.webhook_path.clone(),
            delivery_timeout: settings.delivery_timeout(),
            on_invalid_signature: settings.on_invalid_signature,
            registry,
            verifier,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Rejects anything other than a POST to the webhook path.
    ///
    /// Cheap enough to run before the body is read.
    pub fn check_route(&self, method: &Method, path: &str) -> Result<(), WebhookError> {
        if path != self.webhook_path || method != Method::POST {
            warn!(%method, path, "Bad request");
            return Err(WebhookError::NotFound {
                method: method.clone(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Runs one request through the pipeline.
    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Outcome, WebhookError> {
        self.check_route(method, path)?;

        let delivery_id = header(headers, HEADER_DELIVERY)?;
        let event = header(headers, HEADER_EVENT)?;
        debug!(delivery_id, event, "Received webhook");

        let payload: serde_json::Value = serde_json::from_slice(body)?;

        match event {
            "push" => self.handle_push(delivery_id, headers, body, payload).await,
            other => {
                info!(delivery_id, event = other, "Not replying to event");
                Ok(Outcome::Ignored)
            }
        }
    }

    async fn handle_push(
        &self,
        delivery_id: &str,
        headers: &HeaderMap,
        body: &[u8],
        payload: serde_json::Value,
    ) -> Result<Outcome, WebhookError> {
        let push = PushEvent::deserialize(&payload)?;
        let owner = push.repository.owner.login;
        let repo = push.repository.name;
        info!(delivery_id, owner = %owner, repo = %repo, "Checking validity of webhook");

        let resolution = match self.registry.resolve_path(&owner, &repo) {
            Some(resolution) => resolution,
            None => {
                warn!(delivery_id, owner = %owner, repo = %repo, "No source root for repository");
                return Err(WebhookError::UnknownRepository { owner, repo });
            }
        };
        if resolution.is_provisioned() {
            self.registry.persist().await;
        }

        let manifest = self
            .registry
            .resolve_manifest(&owner, &repo)
            .ok_or_else(|| WebhookError::Validation(format!("manifest for {owner}/{repo} vanished")))?;

        let verified = if manifest.github.secret.is_empty() {
            info!(delivery_id, owner = %owner, repo = %repo, "Secret not available, skipping signature check");
            false
        } else {
            let signature = headers
                .get(HEADER_SIGNATURE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let valid = self
                .verifier
                .verify(&manifest.github.secret, signature, body);
            info!(delivery_id, owner = %owner, repo = %repo, valid, "Signature checked");

            if !valid {
                match self.on_invalid_signature {
                    OnInvalidSignature::Reject => {
                        warn!(delivery_id, owner = %owner, repo = %repo, "Rejecting webhook with invalid signature");
                        return Err(WebhookError::InvalidSignature { owner, repo });
                    }
                    OnInvalidSignature::AcceptAndLog => {
                        warn!(delivery_id, owner = %owner, repo = %repo, "Accepting webhook with invalid signature");
                    }
                }
            }
            valid
        };

        let event = CheckpointEvent {
            delivery_id: delivery_id.to_string(),
            owner,
            repo,
            source_root: resolution.path().to_string(),
            verified,
            payload,
        };
        self.deliver(event).await?;

        Ok(Outcome::Delivered)
    }

    /// Hands the event to the consumer, waiting at most `delivery_timeout`.
    ///
    /// A 503 does not guarantee the event was not delivered: on a multi-threaded
    /// runtime a consumer can take the parked send just before the deadline fires.
    async fn deliver(&self, event: CheckpointEvent) -> Result<(), WebhookError> {
        let delivery_id = event.delivery_id.clone();
        match tokio::time::timeout(self.delivery_timeout, self.events.send(event)).await {
            Ok(Ok(())) => {
                debug!(delivery_id, "Event handed to consumer");
                Ok(())
            }
            Ok(Err(_)) => {
                warn!(delivery_id, "Event consumer has shut down");
                Err(WebhookError::ConsumerClosed)
            }
            Err(_) => {
                warn!(delivery_id, timeout = ?self.delivery_timeout, "No consumer took the event");
                Err(WebhookError::DeliveryTimedOut(self.delivery_timeout))
            }
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!(header = name, "Failed to receive GitHub webhook: {}", MISSING_HEADERS_MESSAGE);
            WebhookError::MissingHeaders(name)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, Receiver};
    use crate::registry::{ConfigFile, GithubSource, SourceRootManifest, SourceRootOptions};
    use crate::signature::{compute_signature, format_signature_header, HmacVerifier};
    use axum::http::HeaderValue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and delegates to the real verifier.
    #[derive(Default)]
    struct CountingVerifier {
        calls: AtomicUsize,
    }

    impl Verifier for CountingVerifier {
        fn verify(&self, secret: &str, signature: &str, payload: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HmacVerifier.verify(secret, signature, payload)
        }
    }

    fn settings(policy: OnInvalidSignature) -> Settings {
        Settings {
            host: "127.0.0.1".to_string(),
            port: None,
            data_file: "data.json".into(),
            webhook_path: "/github-checkpoint".to_string(),
            delivery_timeout_secs: 1,
            on_invalid_signature: policy,
        }
    }

    fn manifest(owner: &str, repo: &str, secret: &str) -> SourceRootManifest {
        SourceRootManifest {
            abs_path: format!("/srv/{owner}/{repo}"),
            github: GithubSource {
                secret: secret.to_string(),
                repo_name: repo.to_string(),
                repo_owner: owner.to_string(),
                filter: String::new(),
            },
            last_updated_at: 0,
        }
    }

    struct Fixture {
        pipeline: WebhookPipeline,
        verifier: Arc<CountingVerifier>,
        events: Receiver<CheckpointEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture(policy: OnInvalidSignature) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SourceRegistry::new(
            dir.path().join("data.json"),
            ConfigFile {
                source_roots: vec![
                    manifest("alice", "proj", "s3cr3t"),
                    manifest("alice", "open", ""),
                ],
                source_root_options: SourceRootOptions {
                    create_by_request: true,
                    dynamic_create_repo_owners: vec!["bob".to_string()],
                    created_source_root: "/mirrors/".to_string(),
                },
                ..ConfigFile::default()
            },
        ));
        let verifier = Arc::new(CountingVerifier::default());
        let (tx, rx) = channel();

        Fixture {
            pipeline: WebhookPipeline::new(&settings(policy), registry, verifier.clone(), tx),
            verifier,
            events: rx,
            _dir: dir,
        }
    }

    fn push_body(owner: &str, repo: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "repository": { "owner": { "login": owner }, "name": repo }
        }))
        .unwrap()
    }

    fn headers(event: &str, signature: Option<String>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_DELIVERY, HeaderValue::from_static("72d3162e-cc78-11e3-81ab-4c9367dc0958"));
        headers.insert(HEADER_EVENT, HeaderValue::from_str(event).unwrap());
        if let Some(signature) = signature {
            headers.insert(HEADER_SIGNATURE, HeaderValue::from_str(&signature).unwrap());
        }
        headers
    }

    fn sign(secret: &str, body: &[u8]) -> Option<String> {
        Some(format_signature_header(&compute_signature(secret, body)))
    }

    async fn handle_and_receive(
        fixture: &Fixture,
        headers: &HeaderMap,
        body: &[u8],
    ) -> (Result<Outcome, WebhookError>, Option<CheckpointEvent>) {
        let receive = async {
            tokio::time::timeout(Duration::from_millis(500), fixture.events.recv())
                .await
                .ok()
                .flatten()
        };
        let handle = fixture
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", headers, body);
        tokio::join!(handle, receive)
    }

    #[tokio::test]
    async fn wrong_path_is_not_found() {
        let f = fixture(OnInvalidSignature::Reject);

        let result = f
            .pipeline
            .handle(&Method::POST, "/elsewhere", &headers("push", None), b"{}")
            .await;
        assert!(matches!(result, Err(WebhookError::NotFound { .. })));
    }

    #[tokio::test]
    async fn wrong_method_is_not_found() {
        let f = fixture(OnInvalidSignature::Reject);

        let result = f
            .pipeline
            .handle(&Method::GET, "/github-checkpoint", &headers("push", None), b"{}")
            .await;
        assert!(matches!(result, Err(WebhookError::NotFound { .. })));
    }

    #[tokio::test]
    async fn missing_event_header_is_bad_request() {
        let f = fixture(OnInvalidSignature::Reject);
        let mut headers = headers("push", None);
        headers.remove(HEADER_EVENT);

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers, b"not json")
            .await;
        assert!(matches!(result, Err(WebhookError::MissingHeaders(HEADER_EVENT))));
    }

    #[tokio::test]
    async fn missing_delivery_header_is_bad_request() {
        let f = fixture(OnInvalidSignature::Reject);
        let mut headers = headers("push", None);
        headers.remove(HEADER_DELIVERY);

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers, b"{}")
            .await;
        assert!(matches!(result, Err(WebhookError::MissingHeaders(HEADER_DELIVERY))));
    }

    #[tokio::test]
    async fn malformed_json_is_validation_failure() {
        let f = fixture(OnInvalidSignature::Reject);

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("push", None), b"{oops")
            .await;
        assert!(matches!(result, Err(WebhookError::Validation(_))));
    }

    #[tokio::test]
    async fn push_without_repository_is_validation_failure() {
        let f = fixture(OnInvalidSignature::Reject);

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("push", None), br#"{"ref":"x"}"#)
            .await;
        assert!(matches!(result, Err(WebhookError::Validation(_))));
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let f = fixture(OnInvalidSignature::Reject);

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("ping", None), br#"{"zen":"hi"}"#)
            .await;
        assert_eq!(result.unwrap(), Outcome::Ignored);
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_signature_delivers_event() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("alice", "proj");

        let (result, event) = handle_and_receive(&f, &headers("push", sign("s3cr3t", &body)), &body).await;

        assert_eq!(result.unwrap(), Outcome::Delivered);
        let event = event.unwrap();
        assert_eq!(event.owner, "alice");
        assert_eq!(event.repo, "proj");
        assert_eq!(event.source_root, "/srv/alice/proj");
        assert!(event.verified);
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bare_hex_signature_is_accepted() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("alice", "proj");
        let bare = hex::encode(compute_signature("s3cr3t", &body));

        let (result, event) = handle_and_receive(&f, &headers("push", Some(bare)), &body).await;

        assert_eq!(result.unwrap(), Outcome::Delivered);
        assert!(event.is_some());
    }

    #[tokio::test]
    async fn empty_secret_skips_verification() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("alice", "open");

        let (result, event) = handle_and_receive(&f, &headers("push", None), &body).await;

        assert_eq!(result.unwrap(), Outcome::Delivered);
        assert!(!event.unwrap().verified);
        assert_eq!(f.verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("alice", "proj");

        let result = f
            .pipeline
            .handle(
                &Method::POST,
                "/github-checkpoint",
                &headers("push", sign("wrong", &body)),
                &body,
            )
            .await;

        assert!(matches!(result, Err(WebhookError::InvalidSignature { .. })));
        assert_eq!(f.events.pending_senders(), 0);
    }

    #[tokio::test]
    async fn missing_signature_with_secret_is_rejected() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("alice", "proj");

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("push", None), &body)
            .await;

        assert!(matches!(result, Err(WebhookError::InvalidSignature { .. })));
    }

    #[tokio::test]
    async fn accept_and_log_delivers_unverified_event() {
        let f = fixture(OnInvalidSignature::AcceptAndLog);
        let body = push_body("alice", "proj");

        let (result, event) = handle_and_receive(&f, &headers("push", sign("wrong", &body)), &body).await;

        assert_eq!(result.unwrap(), Outcome::Delivered);
        assert!(!event.unwrap().verified);
    }

    #[tokio::test]
    async fn signature_covers_raw_body_not_reserialized_json() {
        let f = fixture(OnInvalidSignature::Reject);
        // Whitespace and key order that serde_json would not reproduce.
        let body = br#"{ "repository" : { "name":"proj", "owner":{"login":"alice"} } }"#;

        let (result, _) = handle_and_receive(&f, &headers("push", sign("s3cr3t", body)), body).await;

        assert_eq!(result.unwrap(), Outcome::Delivered);
    }

    #[tokio::test]
    async fn unknown_repository_is_rejected() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("mallory", "tool");

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("push", None), &body)
            .await;

        assert!(matches!(result, Err(WebhookError::UnknownRepository { .. })));
        assert!(!f.pipeline.registry().exists("mallory", "tool"));
    }

    #[tokio::test]
    async fn allow_listed_owner_is_provisioned_and_persisted() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("Bob", "tool");

        let (result, event) = handle_and_receive(&f, &headers("push", None), &body).await;

        assert_eq!(result.unwrap(), Outcome::Delivered);
        assert_eq!(event.unwrap().source_root, "/mirrors/Bob/tool");

        let reloaded = SourceRegistry::load(f.pipeline.registry().path()).await.unwrap();
        assert!(reloaded.exists("Bob", "tool"));
    }

    #[tokio::test]
    async fn delivery_times_out_without_consumer() {
        let f = fixture(OnInvalidSignature::Reject);
        let body = push_body("alice", "open");

        let result = f
            .pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("push", None), &body)
            .await;

        assert!(matches!(result, Err(WebhookError::DeliveryTimedOut(_))));
        // The cancelled send left no parked entry behind.
        assert_eq!(f.events.pending_senders(), 0);
    }

    #[tokio::test]
    async fn delivery_fails_when_consumer_gone() {
        let Fixture { pipeline, events, _dir, .. } = fixture(OnInvalidSignature::Reject);
        drop(events);
        let body = push_body("alice", "open");

        let result = pipeline
            .handle(&Method::POST, "/github-checkpoint", &headers("push", None), &body)
            .await;

        assert!(matches!(result, Err(WebhookError::ConsumerClosed)));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (
                WebhookError::NotFound {
                    method: Method::GET,
                    path: "/".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (WebhookError::MissingHeaders(HEADER_EVENT), StatusCode::BAD_REQUEST),
            (WebhookError::Validation("bad".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                WebhookError::UnknownRepository {
                    owner: "a".to_string(),
                    repo: "b".to_string(),
                },
                StatusCode::NOT_FOUND,
            ),
            (
                WebhookError::InvalidSignature {
                    owner: "a".to_string(),
                    repo: "b".to_string(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (WebhookError::ConsumerClosed, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
