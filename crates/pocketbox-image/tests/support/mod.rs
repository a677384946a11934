//! A minimal HTTP/1.1 registry stub served from a local `TcpListener`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::write::GzEncoder;
use pocketbox_image::manifest::{MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_MANIFEST_V2};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Token handed out by the stub token endpoint.
pub const TOKEN: &str = "stub-token";

/// A parsed request line plus headers (names lowercased).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// Canned response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn bytes(body: &[u8]) -> Self {
        Self {
            body: body.to_vec(),
            ..Self::status(200)
        }
    }

    pub fn json(value: &serde_json::Value) -> Self {
        Self::bytes(value.to_string().as_bytes()).header("Content-Type", "application/json")
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;

/// A running stub server. Aborted on drop.
pub struct StubServer {
    pub url: String,
    log: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);
        let task = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let handler = Arc::clone(&handler);
                    let log = Arc::clone(&log);
                    drop(tokio::spawn(async move {
                        let _ = serve(socket, &handler, &log).await;
                    }));
                }
            })
        };
        Self { url, log, task }
    }

    /// A server that accepts connections and never answers.
    pub async fn silent() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        Self {
            url,
            log: Arc::new(Mutex::new(Vec::new())),
            task,
        }
    }

    /// `host:port` part of the URL.
    pub fn authority(&self) -> &str {
        self.url.trim_start_matches("http://")
    }

    /// Number of requests whose path starts with `prefix`.
    pub fn hits(&self, prefix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with(prefix))
            .count()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A URL on which nothing listens.
pub async fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("http://{}", listener.local_addr().expect("addr"));
    drop(listener);
    url
}

async fn serve(
    mut socket: TcpStream,
    handler: &Handler,
    log: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&buf).to_string();
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    log.lock().unwrap().push(path.clone());

    let reply = handler(&Request {
        method,
        path,
        headers,
    });
    let mut head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.body.len()
    );
    for (name, value) in &reply.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    socket.write_all(head.as_bytes()).await?;
    socket.write_all(&reply.body).await?;
    socket.shutdown().await
}

// ── Image fixtures ───────────────────────────────────────────────────

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Builds a gzip-compressed tar holding regular files.
pub fn gzip_tar(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_bytes())
            .expect("append");
    }
    let tar = builder.into_inner().expect("tar");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).expect("gzip");
    encoder.finish().expect("gzip")
}

/// A multi-arch image served by [`RegistryFixture::reply`].
#[derive(Debug, Clone)]
pub struct RegistryFixture {
    pub repository: String,
    pub tag: String,
    pub index: Vec<u8>,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
    pub other_platform_digest: String,
    pub config: Vec<u8>,
    pub config_digest: String,
    pub layers: Vec<(String, Vec<u8>)>,
    pub require_auth: bool,
    pub corrupt_layers: bool,
}

impl RegistryFixture {
    /// An `arm64`/`linux` image listed next to an `amd64` entry.
    pub fn new(repository: &str, tag: &str, layers: &[&[(&str, &str)]]) -> Self {
        let layers: Vec<(String, Vec<u8>)> = layers
            .iter()
            .map(|files| {
                let blob = gzip_tar(files);
                (sha256_digest(&blob), blob)
            })
            .collect();
        let config = json!({
            "architecture": "arm64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/bin:/usr/bin:/bin", "LANG=C"],
                "Cmd": ["/bin/sh", "-c", "echo hi"],
                "WorkingDir": "/srv"
            }
        })
        .to_string()
        .into_bytes();
        let config_digest = sha256_digest(&config);
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST_V2,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layers.iter().map(|(digest, blob)| json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": digest,
                "size": blob.len(),
            })).collect::<Vec<_>>(),
        })
        .to_string()
        .into_bytes();
        let manifest_digest = sha256_digest(&manifest);
        let other_platform_digest = format!("sha256:{}", "a".repeat(64));
        let index = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST_LIST,
            "manifests": [
                {
                    "mediaType": MEDIA_TYPE_MANIFEST_V2,
                    "digest": other_platform_digest,
                    "size": 10,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": MEDIA_TYPE_MANIFEST_V2,
                    "digest": manifest_digest,
                    "size": manifest.len(),
                    "platform": {"architecture": "arm64", "os": "linux"}
                }
            ]
        })
        .to_string()
        .into_bytes();

        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            index,
            manifest,
            manifest_digest,
            other_platform_digest,
            config,
            config_digest,
            layers,
            require_auth: false,
            corrupt_layers: false,
        }
    }

    pub fn with_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn with_corrupt_layers(mut self) -> Self {
        self.corrupt_layers = true;
        self
    }

    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|(_, b)| b.len() as u64).sum()
    }

    /// Serves the registry API for this image.
    pub fn reply(&self, request: &Request) -> Reply {
        let host = request.headers.get("host").cloned().unwrap_or_default();
        let expected = format!("Bearer {TOKEN}");
        let authorized = request
            .headers
            .get("authorization")
            .is_some_and(|v| *v == expected);

        if request.path == "/v2/" {
            return if self.require_auth && !authorized {
                Reply::status(401).header(
                    "WWW-Authenticate",
                    &format!(r#"Bearer realm="http://{host}/token",service="stub""#),
                )
            } else {
                Reply::json(&json!({}))
            };
        }
        if request.path.starts_with("/token") {
            return Reply::json(&json!({"token": TOKEN, "expires_in": 300}));
        }
        if self.require_auth && !authorized {
            return Reply::status(401);
        }

        let manifests = format!("/v2/{}/manifests/", self.repository);
        let blobs = format!("/v2/{}/blobs/", self.repository);
        if let Some(reference) = request.path.strip_prefix(&manifests) {
            if reference == self.tag {
                return Reply::bytes(&self.index).header("Content-Type", MEDIA_TYPE_MANIFEST_LIST);
            }
            if reference == self.manifest_digest {
                return Reply::bytes(&self.manifest).header("Content-Type", MEDIA_TYPE_MANIFEST_V2);
            }
        } else if let Some(digest) = request.path.strip_prefix(&blobs) {
            if digest == self.config_digest {
                return Reply::bytes(&self.config).header("Content-Type", "application/json");
            }
            if let Some((_, blob)) = self.layers.iter().find(|(d, _)| d == digest) {
                if self.corrupt_layers {
                    let mut tampered = blob.clone();
                    tampered.extend_from_slice(b"tampered");
                    return Reply::bytes(&tampered);
                }
                return Reply::bytes(blob);
            }
        }
        Reply::status(404)
    }
}
