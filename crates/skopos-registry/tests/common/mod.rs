//! Shared fixtures: a scripted in-memory transport and image documents.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use skopos_registry::{
    Clock, ContentDigest, EngineConfig, HttpRequest, HttpResponse, HttpTransport, ManualClock,
    MediaType, RetryConfig, TransportError,
};

type Handler = Arc<dyn Fn(&HttpRequest, usize) -> HttpResponse + Send + Sync>;

/// Transport answering from scripted routes keyed by `host/path`.
///
/// Every request is logged. Unknown routes answer `404`.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    routes: Arc<Mutex<HashMap<String, Handler>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    calls: Arc<Mutex<Vec<HttpRequest>>>,
    delay: Option<Duration>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

fn route_key(request: &HttpRequest) -> String {
    format!(
        "{}{}",
        request.url.host_str().unwrap_or_default(),
        request.url.path()
    )
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response, so concurrent callers overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answers a route with a handler that sees the request and its hit number (0-based).
    pub fn route<F>(&self, key: &str, handler: F)
    where
        F: Fn(&HttpRequest, usize) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes.lock().insert(key.to_string(), Arc::new(handler));
    }

    /// Answers a route with the same response every time.
    pub fn respond(&self, key: &str, response: HttpResponse) {
        self.route(key, move |_, _| response.clone());
    }

    /// Answers a route with responses in order; the last one repeats.
    pub fn sequence(&self, key: &str, responses: Vec<HttpResponse>) {
        self.route(key, move |_, hit| {
            responses[hit.min(responses.len() - 1)].clone()
        });
    }

    /// All requests received, in order.
    pub fn calls(&self) -> Vec<HttpRequest> {
        self.calls.lock().clone()
    }

    /// Number of requests to a route.
    pub fn hits(&self, key: &str) -> usize {
        self.hits.lock().get(key).copied().unwrap_or(0)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let key = route_key(&request);
        self.calls.lock().push(request.clone());
        let hit = {
            let mut hits = self.hits.lock();
            let count = hits.entry(key.clone()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let handler = self.routes.lock().get(&key).cloned();
        Ok(match handler {
            Some(handler) => handler(&request, hit),
            None => HttpResponse::new(404, Vec::<(String, String)>::new(), Vec::new()),
        })
    }
}

pub fn ok_json(media_type: &str, body: &[u8]) -> HttpResponse {
    HttpResponse::new(200, [("Content-Type", media_type)], body.to_vec())
}

pub fn status(code: u16) -> HttpResponse {
    HttpResponse::new(code, Vec::<(String, String)>::new(), Vec::new())
}

pub fn status_with(code: u16, headers: &[(&str, &str)]) -> HttpResponse {
    HttpResponse::new(code, headers.iter().copied(), Vec::new())
}

/// Serialized documents of a two-platform image.
#[derive(Debug, Clone)]
pub struct ImageFixture {
    pub index: Vec<u8>,
    pub index_digest: String,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
    pub config: Vec<u8>,
    pub config_digest: String,
}

impl ImageFixture {
    /// Builds an image whose manifest carries `version` and whose config
    /// labels carry a GitHub source and `revision`.
    pub fn new(version: &str, revision: &str) -> Self {
        let config = serde_json::to_vec(&json!({
            "created": "2024-05-01T10:00:00Z",
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Labels": {
                    "org.opencontainers.image.source": "https://github.com/acme/app",
                    "org.label-schema.vcs-ref": revision,
                    "org.opencontainers.image.version": "label-version"
                }
            }
        }))
        .unwrap();
        let config_digest = ContentDigest::sha256(&config).to_string();

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MediaType::OCI_MANIFEST,
            "config": {
                "mediaType": MediaType::OCI_CONFIG,
                "digest": config_digest,
                "size": config.len()
            },
            "layers": [],
            "annotations": { "org.opencontainers.image.version": version }
        }))
        .unwrap();
        let manifest_digest = ContentDigest::sha256(&manifest).to_string();

        let index = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": MediaType::OCI_INDEX,
            "manifests": [
                {
                    "mediaType": MediaType::OCI_MANIFEST,
                    "digest": manifest_digest,
                    "size": manifest.len(),
                    "platform": { "architecture": "amd64", "os": "linux" },
                    "annotations": { "com.example.selected": "amd64" }
                },
                {
                    "mediaType": MediaType::OCI_MANIFEST,
                    "digest": manifest_digest,
                    "size": manifest.len(),
                    "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" }
                },
                {
                    "mediaType": MediaType::OCI_MANIFEST,
                    "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                    "size": 10,
                    "platform": { "architecture": "unknown", "os": "unknown" }
                }
            ],
            "annotations": {
                "org.opencontainers.image.version": "index-version",
                "com.example.index": "yes"
            }
        }))
        .unwrap();
        let index_digest = ContentDigest::sha256(&index).to_string();

        Self {
            index,
            index_digest,
            manifest,
            manifest_digest,
            config,
            config_digest,
        }
    }

    /// Routes the index under `tag`, and the manifest and config by digest.
    pub fn serve(&self, transport: &ScriptedTransport, host: &str, repository: &str, tag: &str) {
        self.serve_index(transport, host, repository, tag);
        self.serve_by_digest(transport, host, repository);
    }

    pub fn serve_index(&self, transport: &ScriptedTransport, host: &str, repository: &str, tag: &str) {
        transport.respond(
            &manifest_key(host, repository, tag),
            HttpResponse::new(
                200,
                [
                    ("Content-Type", MediaType::OCI_INDEX),
                    ("Docker-Content-Digest", self.index_digest.as_str()),
                ],
                self.index.clone(),
            ),
        );
    }

    pub fn serve_by_digest(&self, transport: &ScriptedTransport, host: &str, repository: &str) {
        transport.respond(
            &manifest_key(host, repository, &self.manifest_digest),
            ok_json(MediaType::OCI_MANIFEST, &self.manifest),
        );
        transport.respond(
            &blob_key(host, repository, &self.config_digest),
            ok_json("application/octet-stream", &self.config),
        );
    }
}

pub fn manifest_key(host: &str, repository: &str, reference: &str) -> String {
    format!("{host}/v2/{repository}/manifests/{reference}")
}

pub fn blob_key(host: &str, repository: &str, digest: &str) -> String {
    format!("{host}/v2/{repository}/blobs/{digest}")
}

/// Engine configuration with near-instant retries.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_retry(
        RetryConfig::default().with_delays(Duration::from_millis(1), Duration::from_millis(2)),
    )
}

/// Clock driven by tokio time, so it advances with paused-runtime sleeps.
#[derive(Debug, Clone)]
pub struct TokioClock {
    start: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            start: ManualClock::default().now(),
            origin: tokio::time::Instant::now(),
        }
    }

    /// Tokio time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_default()
    }
}
