//! Registry client and mirror manager tests against local stubs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pocketbox_common::error::PocketboxError;
use pocketbox_common::records::RegistryMirror;
use pocketbox_common::store::{JsonStore, MetadataStore};
use pocketbox_image::auth::TokenCache;
use pocketbox_image::{ClientTimeouts, Endpoint, ImageReference, MirrorManager, RegistryClient};
use support::{RegistryFixture, Reply, StubServer, TOKEN};

const TIMEOUTS: ClientTimeouts = ClientTimeouts {
    request: Duration::from_secs(5),
    download: Duration::from_secs(5),
};

fn client(endpoint: Endpoint, store: &Arc<JsonStore>) -> RegistryClient {
    RegistryClient::new(endpoint, TokenCache::new(store.clone()), TIMEOUTS, "arm64", "linux")
        .expect("client")
}

fn fixture() -> RegistryFixture {
    RegistryFixture::new("demo/app", "1.0", &[&[("a.txt", "a\n")]])
}

// ── Authentication ───────────────────────────────────────────────────

#[tokio::test]
async fn anonymous_registry_yields_empty_token() {
    let fixture = fixture();
    let server = StubServer::start(move |r| fixture.reply(r)).await;
    let store = Arc::new(JsonStore::in_memory());

    let token = client(Endpoint::new(&server.url), &store)
        .authenticate("demo/app")
        .await
        .expect("authenticate");

    assert_eq!(token, "");
    assert_eq!(server.hits("/token"), 0);
}

#[tokio::test]
async fn bearer_token_is_cached_across_clients() {
    let fixture = fixture().with_auth();
    let server = StubServer::start(move |r| fixture.reply(r)).await;
    let store = Arc::new(JsonStore::in_memory());

    for _ in 0..2 {
        let token = client(Endpoint::new(&server.url), &store)
            .authenticate("demo/app")
            .await
            .expect("authenticate");
        assert_eq!(token, TOKEN);
    }

    assert_eq!(server.hits("/token"), 1);
    assert_eq!(server.hits("/v2/"), 2);
    let expected_url = format!(
        "{}/token?service=stub&scope=repository:demo/app:pull",
        server.url
    );
    assert!(store.get_token(&expected_url).expect("store").is_some());
}

#[tokio::test]
async fn challenge_without_header_is_rejected() {
    let server = StubServer::start(|_| Reply::status(401)).await;
    let store = Arc::new(JsonStore::in_memory());

    let err = client(Endpoint::new(&server.url), &store)
        .authenticate("demo/app")
        .await
        .expect_err("missing challenge");

    assert!(matches!(err, PocketboxError::Integrity { .. }), "{err}");
}

#[tokio::test]
async fn preconfigured_token_skips_the_challenge() {
    let server = StubServer::start(|_| Reply::status(500)).await;
    let store = Arc::new(JsonStore::in_memory());
    let endpoint = Endpoint {
        bearer_token: Some("mirror-secret".into()),
        ..Endpoint::new(&server.url)
    };

    let token = client(endpoint, &store)
        .authenticate("demo/app")
        .await
        .expect("authenticate");

    assert_eq!(token, "mirror-secret");
    assert_eq!(server.hits("/"), 0);
}

#[tokio::test]
async fn manifest_list_resolves_to_platform_manifest() {
    let fixture = fixture().with_auth();
    let expected_config = fixture.config_digest.clone();
    let server = {
        let fixture = fixture.clone();
        StubServer::start(move |r| fixture.reply(r)).await
    };
    let store = Arc::new(JsonStore::in_memory());
    let reference =
        ImageReference::parse(&format!("{}/demo/app:1.0", server.authority())).expect("ref");

    let registry = client(Endpoint::new(&server.url), &store);
    let manifest = registry.get_manifest(&reference).await.expect("manifest");
    let config = registry
        .get_image_config(&reference, &manifest.config.digest)
        .await
        .expect("config");

    assert_eq!(manifest.config.digest, expected_config);
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(config.architecture, "arm64");
    assert_eq!(
        server.hits(&format!("/v2/demo/app/manifests/{}", fixture.manifest_digest)),
        1
    );
}

// ── Mirrors ──────────────────────────────────────────────────────────

fn manager(mirrors: Vec<RegistryMirror>, timeout: Duration) -> MirrorManager {
    MirrorManager::with_built_ins(Arc::new(JsonStore::in_memory()), mirrors, timeout)
        .expect("manager")
}

#[tokio::test]
async fn unresponsive_mirror_is_marked_unhealthy_within_timeout() {
    let healthy = StubServer::start(|_| Reply::status(401)).await;
    let silent = StubServer::silent().await;
    let mirrors = manager(
        vec![
            RegistryMirror::new("fast", &healthy.url, 100),
            RegistryMirror::new("stuck", &silent.url, 100),
        ],
        Duration::from_millis(300),
    );

    let started = Instant::now();
    let checked = mirrors.check_all().await.expect("check");
    assert!(started.elapsed() < Duration::from_secs(5));

    let by_name = |name: &str| checked.iter().find(|m| m.name == name).expect(name);
    assert!(by_name("fast").is_healthy);
    assert!(by_name("fast").latency_ms.is_some());
    assert!(!by_name("stuck").is_healthy);
    assert_eq!(mirrors.best().expect("best").name, "fast");
}

#[tokio::test]
async fn server_errors_count_as_unhealthy() {
    let broken = StubServer::start(|_| Reply::status(500)).await;
    let mirrors = manager(
        vec![RegistryMirror::new("broken", &broken.url, 100)],
        Duration::from_secs(2),
    );

    let health = mirrors.check(&mirrors.list().expect("list")[0]).await;

    assert!(!health.healthy);
    assert!(matches!(
        mirrors.best(),
        Err(PocketboxError::NoMirrorAvailable)
    ));
}

#[tokio::test]
async fn docker_hub_pulls_route_through_best_mirror() {
    let mirror = StubServer::start(|_| Reply::json(&serde_json::json!({}))).await;
    let down = support::closed_url().await;
    let mirrors = manager(
        vec![
            RegistryMirror::new("down", &down, 200),
            RegistryMirror::new("up", &mirror.url, 100),
        ],
        Duration::from_secs(2),
    );

    let hub = ImageReference::parse("alpine:3.19").expect("ref");
    let endpoint = mirrors.resolve(&hub).await.expect("resolve");
    assert_eq!(endpoint.url, mirror.url);
    assert_eq!(mirror.hits("/v2/"), 1);

    let ghcr = ImageReference::parse("ghcr.io/owner/tool:1.0").expect("ref");
    let endpoint = mirrors.resolve(&ghcr).await.expect("resolve");
    assert_eq!(endpoint.url, "https://ghcr.io");
}

#[tokio::test]
async fn resolve_fails_when_every_mirror_is_down() {
    let down = support::closed_url().await;
    let mirrors = manager(
        vec![RegistryMirror::new("down", &down, 100)],
        Duration::from_secs(2),
    );

    let hub = ImageReference::parse("alpine").expect("ref");
    assert!(matches!(
        mirrors.resolve(&hub).await,
        Err(PocketboxError::NoMirrorAvailable)
    ));
}

#[tokio::test]
async fn custom_mirrors_carry_their_token_into_the_endpoint() {
    let mirror = StubServer::start(|_| Reply::status(200)).await;
    let mirrors = manager(Vec::new(), Duration::from_secs(2));
    let _ = mirrors
        .add_custom("corp", &mirror.url, Some("corp-token".into()), None)
        .expect("add");

    let endpoint = mirrors
        .resolve(&ImageReference::parse("busybox").expect("ref"))
        .await
        .expect("resolve");

    assert_eq!(endpoint.url, mirror.url);
    assert_eq!(endpoint.bearer_token.as_deref(), Some("corp-token"));
}
