//! End-to-end pulls against an in-process registry.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use minibox_core::config::RegistryConfig;
use minibox_core::error::BoxError;
use minibox_runtime::{ImagePuller, LayerCache, RegistryClient};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const REPOSITORY: &str = "library/demo";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Gzipped tar of regular files.
fn layer(files: &[(&str, &str, u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// OCI image index with one linux entry per `(digest, arch, size)`.
fn index(entries: &[(&str, &str, usize)]) -> Vec<u8> {
    let manifests: Vec<_> = entries
        .iter()
        .map(|(digest, arch, size)| {
            json!({
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": digest,
                "size": size,
                "platform": {"architecture": arch, "os": "linux"}
            })
        })
        .collect();
    serde_json::to_vec(&json!({"schemaVersion": 2, "manifests": manifests})).unwrap()
}

#[derive(Default)]
struct MockRegistry {
    index: Vec<u8>,
    manifests: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
    /// Blobs answered with HTTP 500
    failing: Vec<String>,
    config_digest: String,
    layer_requests: AtomicUsize,
}

impl MockRegistry {
    /// Two-layer image: the upper layer whites out `etc/motd` and
    /// overwrites `etc/hostname`.
    fn two_layer_image() -> (Self, Vec<String>) {
        let lower = layer(&[
            ("etc/hostname", "base", 0o644),
            ("etc/motd", "welcome", 0o644),
            ("bin/tool", "#!/bin/sh\n", 0o755),
        ]);
        let upper = layer(&[("etc/hostname", "top", 0o644), ("etc/.wh.motd", "", 0o644)]);
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "config": {
                "Cmd": ["/bin/tool"],
                "Env": ["PATH=/bin"],
                "WorkingDir": "/etc"
            }
        }))
        .unwrap();

        let layer_digests = vec![digest_of(&lower), digest_of(&upper)];
        let config_digest = digest_of(&config);
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len()
            },
            "layers": [
                {"mediaType": LAYER_MEDIA_TYPE, "digest": layer_digests[0], "size": lower.len()},
                {"mediaType": LAYER_MEDIA_TYPE, "digest": layer_digests[1], "size": upper.len()}
            ]
        }))
        .unwrap();
        let manifest_digest = digest_of(&manifest);

        let mut registry = Self {
            config_digest: config_digest.clone(),
            ..Default::default()
        };
        registry.index = index(&[
            ("sha256:0000", "arm64", 10),
            (&manifest_digest, "amd64", manifest.len()),
        ]);
        registry.manifests.insert(manifest_digest, manifest);
        registry.blobs.insert(config_digest, config);
        registry.blobs.insert(layer_digests[0].clone(), lower);
        registry.blobs.insert(layer_digests[1].clone(), upper);
        (registry, layer_digests)
    }
}

async fn token() -> Json<serde_json::Value> {
    Json(json!({"token": "test-token", "expires_in": 300}))
}

async fn manifest(
    State(registry): State<Arc<MockRegistry>>,
    UrlPath(reference): UrlPath<String>,
) -> Response {
    if reference == "latest" {
        return registry.index.clone().into_response();
    }
    match registry.manifests.get(&reference) {
        Some(body) => body.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn blob(State(registry): State<Arc<MockRegistry>>, UrlPath(digest): UrlPath<String>) -> Response {
    if digest != registry.config_digest {
        registry.layer_requests.fetch_add(1, Ordering::SeqCst);
    }
    if registry.failing.contains(&digest) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    match registry.blobs.get(&digest) {
        Some(body) => Body::from(body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve `registry` on a loopback port and return a puller pointed at it.
async fn start(registry: Arc<MockRegistry>, work: &Path) -> ImagePuller {
    let app = Router::new()
        .route("/token", get(token))
        .route(&format!("/v2/{}/manifests/:reference", REPOSITORY), get(manifest))
        .route(&format!("/v2/{}/blobs/:digest", REPOSITORY), get(blob))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = RegistryClient::new(RegistryConfig {
        auth_url: format!("http://{}/token", addr),
        service: "test-registry".to_string(),
        registry_url: format!("http://{}", addr),
        default_namespace: "library".to_string(),
    })
    .unwrap();
    let cache = LayerCache::new(&work.join("layers")).unwrap();
    ImagePuller::new(client, cache, work.join("rootfs"), "library")
}

#[tokio::test]
async fn test_pull_applies_layers_in_order() {
    let work = TempDir::new().unwrap();
    let (registry, _) = MockRegistry::two_layer_image();
    let puller = start(Arc::new(registry), work.path()).await;

    let image = puller.pull("demo").await.unwrap();

    assert_eq!(image.reference.repository, REPOSITORY);
    assert_eq!(image.manifest.layers().len(), 2);
    assert_eq!(image.config.cmd, vec!["/bin/tool".to_string()]);
    assert_eq!(image.config.working_dir.as_deref(), Some("/etc"));

    let rootfs = &image.rootfs;
    assert_eq!(std::fs::read_to_string(rootfs.join("etc/hostname")).unwrap(), "top");
    assert!(!rootfs.join("etc/motd").exists());
    assert!(!rootfs.join("etc/.wh.motd").exists());
    let mode = std::fs::metadata(rootfs.join("bin/tool")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[tokio::test]
async fn test_second_pull_downloads_no_layers() {
    let work = TempDir::new().unwrap();
    let (registry, layer_digests) = MockRegistry::two_layer_image();
    let registry = Arc::new(registry);
    let puller = start(registry.clone(), work.path()).await;

    puller.pull("demo").await.unwrap();
    assert_eq!(registry.layer_requests.load(Ordering::SeqCst), 2);
    for digest in &layer_digests {
        assert!(puller.assembler().cache().exists(digest).unwrap());
    }

    let image = puller.pull("demo:latest").await.unwrap();
    assert_eq!(registry.layer_requests.load(Ordering::SeqCst), 2);
    assert_eq!(
        std::fs::read_to_string(image.rootfs.join("etc/hostname")).unwrap(),
        "top"
    );
}

#[tokio::test]
async fn test_digest_mismatch_is_rejected() {
    let work = TempDir::new().unwrap();
    let (mut registry, layer_digests) = MockRegistry::two_layer_image();
    registry
        .blobs
        .insert(layer_digests[1].clone(), layer(&[("etc/evil", "x", 0o644)]));
    let puller = start(Arc::new(registry), work.path()).await;

    let err = puller.pull("demo").await.unwrap_err();
    match err {
        BoxError::RegistryError { message, .. } => assert!(message.contains("Digest mismatch")),
        other => panic!("unexpected error: {}", other),
    }
    assert!(!puller.assembler().cache().exists(&layer_digests[1]).unwrap());
}

#[tokio::test]
async fn test_failed_download_commits_nothing() {
    let work = TempDir::new().unwrap();
    let (mut registry, layer_digests) = MockRegistry::two_layer_image();
    registry.failing.push(layer_digests[1].clone());
    let puller = start(Arc::new(registry), work.path()).await;

    let err = puller.pull("demo").await.unwrap_err();
    assert!(matches!(err, BoxError::RegistryError { .. }));
    for digest in &layer_digests {
        assert!(!puller.assembler().cache().exists(digest).unwrap());
    }
    assert!(!work.path().join("rootfs").exists());
}

#[tokio::test]
async fn test_index_without_amd64_is_unsupported() {
    let work = TempDir::new().unwrap();
    let (mut registry, _) = MockRegistry::two_layer_image();
    registry.index = index(&[("sha256:0000", "arm64", 10)]);
    let registry = Arc::new(registry);
    let puller = start(registry.clone(), work.path()).await;

    let err = puller.pull("demo").await.unwrap_err();
    assert!(matches!(err, BoxError::UnsupportedPlatform { .. }));
    assert_eq!(registry.layer_requests.load(Ordering::SeqCst), 0);
}
