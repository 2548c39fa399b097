//! Google Drive appData log files as a message medium.
//!
//! Two log files live in the user's `appDataFolder`; each envelope is one
//! base64 line. Appends are read-modify-write guarded by the file ETag
//! (`If-Match`); a 412 means another writer got there first and the append
//! is retried on fresh content. The receiver polls its inbound file and
//! tracks a byte offset, resetting when the file shrinks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use clipssh_protocol::{wire, Envelope};

use crate::facade::{channel_pair, TransportChannels, WorkerSide};
use crate::{Result, Transport, TransportError};

pub const LOG_C2S: &str = "gitssh2-c2s.log";
pub const LOG_S2C: &str = "gitssh2-s2c.log";

pub const DEFAULT_TOKEN_PATH: &str = "~/.config/clipssh/drive-token.json";

const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const CAS_RETRIES: u32 = 8;
const HTTP_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct DriveTransportConfig {
    pub client_secrets_path: PathBuf,
    pub token_path: PathBuf,
    pub inbound_file: String,
    pub outbound_file: String,
    pub poll_interval: Duration,
}

impl DriveTransportConfig {
    pub fn for_client(client_secrets_path: PathBuf, token_path: PathBuf) -> DriveTransportConfig {
        DriveTransportConfig {
            client_secrets_path,
            token_path,
            inbound_file: LOG_S2C.to_string(),
            outbound_file: LOG_C2S.to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn for_server(client_secrets_path: PathBuf, token_path: PathBuf) -> DriveTransportConfig {
        DriveTransportConfig {
            client_secrets_path,
            token_path,
            inbound_file: LOG_C2S.to_string(),
            outbound_file: LOG_S2C.to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Compare-and-swap view of one remote log file. The production impl talks
/// to Drive; tests substitute an in-memory store with injected conflicts.
#[async_trait]
pub trait CasLogStore: Send + Sync {
    /// Current content plus an opaque version tag.
    async fn fetch(&self) -> Result<(String, String)>;

    /// Store new content if the version tag still matches. Ok(false) means
    /// the precondition failed and the caller should refetch.
    async fn store(&self, content: &str, version: &str) -> Result<bool>;
}

/// Append one line atomically through bounded CAS retries.
pub async fn append_line(store: &dyn CasLogStore, line: &str) -> Result<()> {
    let mut delay = Duration::from_millis(100);
    for _ in 0..CAS_RETRIES {
        let (mut content, version) = store.fetch().await?;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(line);
        content.push('\n');
        if store.store(&content, &version).await? {
            return Ok(());
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(2));
    }
    Err(TransportError::Broken(
        "drive append kept losing the precondition race".into(),
    ))
}

// --- OAuth token store ---

#[derive(Serialize, Deserialize, Debug, Clone)]
struct StoredToken {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_at_ms: Option<u64>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Persisted refresh token with file-locked refresh.
///
/// The interactive consent flow is outside this program; a missing token
/// file is a setup error telling the user how to provision one.
pub struct TokenStore {
    path: PathBuf,
    http: reqwest::Client,
}

impl TokenStore {
    pub fn new(path: PathBuf, http: reqwest::Client) -> TokenStore {
        TokenStore { path, http }
    }

    pub async fn access_token(&self) -> Result<String> {
        let mut token = self.load()?;
        let now = unix_millis();
        if let (Some(access), Some(expiry)) = (&token.access_token, token.expires_at_ms) {
            // 30s of slack against clock skew and request latency.
            if now + 30_000 < expiry {
                return Ok(access.clone());
            }
        }

        let response = self
            .http
            .post(OAUTH_TOKEN_URL)
            .form(&[
                ("client_id", token.client_id.as_str()),
                ("client_secret", token.client_secret.as_str()),
                ("refresh_token", token.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| TransportError::Broken(format!("oauth refresh request: {err}")))?;
        if !response.status().is_success() {
            return Err(TransportError::Setup(format!(
                "oauth refresh rejected ({}); re-provision {} with a valid refresh token",
                response.status(),
                self.path.display()
            )));
        }
        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|err| TransportError::Broken(format!("oauth refresh body: {err}")))?;

        token.access_token = Some(refreshed.access_token.clone());
        token.expires_at_ms = refreshed
            .expires_in
            .map(|seconds| unix_millis() + seconds * 1000);
        self.persist(&token)?;
        Ok(refreshed.access_token)
    }

    fn load(&self) -> Result<StoredToken> {
        let text = std::fs::read_to_string(&self.path).map_err(|err| {
            TransportError::Setup(format!(
                "cannot read Drive token file {}: {err}\n\
                 Provision it with a desktop-app OAuth refresh token \
                 (fields: client_id, client_secret, refresh_token).",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            TransportError::Setup(format!(
                "Drive token file {} is malformed: {err}",
                self.path.display()
            ))
        })
    }

    fn persist(&self, token: &StoredToken) -> Result<()> {
        use std::os::unix::fs::OpenOptionsExt;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| TransportError::Broken(format!("token dir: {err}")))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .mode(0o600)
            .open(&self.path)
            .map_err(|err| TransportError::Broken(format!("open token file: {err}")))?;

        // Exclusive lock while rewriting, so concurrent refreshes from the
        // client and server processes do not interleave writes.
        let locked = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
            .map_err(|(_, err)| TransportError::Broken(format!("lock token file: {err}")))?;
        let payload = serde_json::to_string_pretty(token)
            .map_err(|err| TransportError::Broken(format!("encode token: {err}")))?;
        use std::io::Write;
        let mut file: &std::fs::File = &locked;
        file.set_len(0)
            .and_then(|_| file.write_all(payload.as_bytes()))
            .map_err(|err| TransportError::Broken(format!("write token file: {err}")))?;
        Ok(())
    }
}

/// Expand a leading `~/` against $HOME.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

// --- Drive REST client ---

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileMeta>,
}

#[derive(Deserialize)]
struct FileMeta {
    id: String,
}

pub struct DriveClient {
    http: reqwest::Client,
    tokens: TokenStore,
}

impl DriveClient {
    pub fn new(token_path: PathBuf) -> Result<DriveClient> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| TransportError::Setup(format!("http client: {err}")))?;
        Ok(DriveClient {
            tokens: TokenStore::new(token_path, http.clone()),
            http,
        })
    }

    /// Locate the named appData file, creating it empty when absent.
    pub async fn ensure_file(&self, name: &str) -> Result<String> {
        if let Some(id) = self.find_file(name).await? {
            return Ok(id);
        }

        let token = self.tokens.access_token().await?;
        let metadata = serde_json::json!({ "name": name, "parents": ["appDataFolder"] });
        let response = self
            .retrying(|| {
                self.http
                    .post(format!("{DRIVE_UPLOAD_URL}?uploadType=multipart"))
                    .bearer_auth(&token)
                    .multipart(
                        reqwest::multipart::Form::new()
                            .part(
                                "metadata",
                                reqwest::multipart::Part::text(metadata.to_string())
                                    .mime_str("application/json")
                                    .expect("static mime"),
                            )
                            .part("media", reqwest::multipart::Part::bytes(Vec::new())),
                    )
            })
            .await?;
        let meta: FileMeta = response
            .json()
            .await
            .map_err(|err| TransportError::Broken(format!("drive create body: {err}")))?;
        Ok(meta.id)
    }

    async fn find_file(&self, name: &str) -> Result<Option<String>> {
        let token = self.tokens.access_token().await?;
        let query = format!("name = '{}' and trashed = false", name.replace('\'', "\\'"));
        let response = self
            .retrying(|| {
                self.http
                    .get(DRIVE_FILES_URL)
                    .bearer_auth(&token)
                    .query(&[
                        ("q", query.as_str()),
                        ("spaces", "appDataFolder"),
                        ("fields", "files(id,name)"),
                    ])
            })
            .await?;
        let listing: FileList = response
            .json()
            .await
            .map_err(|err| TransportError::Broken(format!("drive list body: {err}")))?;
        Ok(listing.files.into_iter().next().map(|meta| meta.id))
    }

    pub async fn download(&self, file_id: &str) -> Result<(String, String)> {
        let token = self.tokens.access_token().await?;
        let response = self
            .retrying(|| {
                self.http
                    .get(format!("{DRIVE_FILES_URL}/{file_id}"))
                    .bearer_auth(&token)
                    .query(&[("alt", "media")])
            })
            .await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|err| TransportError::Broken(format!("drive download body: {err}")))?;
        Ok((body, etag))
    }

    /// Upload new content with an If-Match precondition. Ok(false) on 412.
    pub async fn upload_if_match(
        &self,
        file_id: &str,
        content: &str,
        etag: &str,
    ) -> Result<bool> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .patch(format!("{DRIVE_UPLOAD_URL}/{file_id}?uploadType=media"))
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(content.to_string());
        if !etag.is_empty() {
            request = request.header(reqwest::header::IF_MATCH, etag);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Broken(format!("drive upload: {err}")))?;
        if response.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(TransportError::Broken(format!(
                "drive upload failed: {}",
                response.status()
            )));
        }
        Ok(true)
    }

    async fn retrying<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay = Duration::from_millis(200);
        let mut last_error = String::new();
        for attempt in 0..HTTP_RETRIES {
            match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if is_retryable_status(response.status()) => {
                    last_error = format!("status {}", response.status());
                }
                Ok(response) => {
                    return Err(TransportError::Broken(format!(
                        "drive request failed: {}",
                        response.status()
                    )));
                }
                Err(err) => last_error = err.to_string(),
            }
            if attempt + 1 < HTTP_RETRIES {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
        }
        Err(TransportError::Broken(format!(
            "drive request failed after retries: {last_error}"
        )))
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct DriveFileStore {
    client: std::sync::Arc<DriveClient>,
    file_id: String,
}

#[async_trait]
impl CasLogStore for DriveFileStore {
    async fn fetch(&self) -> Result<(String, String)> {
        self.client.download(&self.file_id).await
    }

    async fn store(&self, content: &str, version: &str) -> Result<bool> {
        self.client
            .upload_if_match(&self.file_id, content, version)
            .await
    }
}

/// Google Drive append-log transport. Link-unreliable: the session layer
/// drives retransmission.
pub struct DriveTransport {
    name: String,
    channels: TransportChannels,
}

impl DriveTransport {
    pub async fn spawn(config: DriveTransportConfig) -> Result<DriveTransport> {
        if !config.client_secrets_path.exists() {
            return Err(TransportError::Setup(format!(
                "OAuth client secrets file does not exist: {}",
                config.client_secrets_path.display()
            )));
        }

        let client = std::sync::Arc::new(DriveClient::new(config.token_path.clone())?);
        let inbound_id = client.ensure_file(&config.inbound_file).await?;
        let outbound_id = client.ensure_file(&config.outbound_file).await?;

        let name = format!(
            "google-drive:in={},out={}",
            config.inbound_file, config.outbound_file
        );
        let outbound_store = DriveFileStore {
            client: client.clone(),
            file_id: outbound_id,
        };

        let (channels, worker) = channel_pair();
        tokio::spawn(worker_loop(
            client,
            inbound_id,
            outbound_store,
            worker,
            config.poll_interval,
        ));
        Ok(DriveTransport { name, channels })
    }
}

#[async_trait]
impl Transport for DriveTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.channels.send(envelope).await
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Envelope>> {
        self.channels.recv(timeout).await
    }

    async fn close(&self) {
        self.channels.close().await;
    }
}

async fn worker_loop(
    client: std::sync::Arc<DriveClient>,
    inbound_id: String,
    outbound: DriveFileStore,
    mut worker: WorkerSide,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut offset = 0usize;

    loop {
        tokio::select! {
            _ = worker.shutdown_rx.changed() => {
                if worker.is_shutdown() {
                    break;
                }
            }
            envelope = worker.outbound_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let line = match wire::encode_log_line(&envelope) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::debug!(error = %err, "dropping unencodable envelope");
                        continue;
                    }
                };
                if let Err(err) = append_line(&outbound, &line).await {
                    tracing::warn!(error = %err, "drive append failed");
                    worker.mark_broken(err.to_string());
                    break;
                }
            }
            _ = ticker.tick() => {
                match poll_inbound(&client, &inbound_id, &mut offset, &mut worker).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "drive poll failed");
                        worker.mark_broken(err.to_string());
                        break;
                    }
                }
            }
        }
    }

    let deadline = tokio::time::Instant::now() + crate::DRAIN_DEADLINE;
    while let Ok(envelope) = worker.outbound_rx.try_recv() {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if let Ok(line) = wire::encode_log_line(&envelope) {
            if append_line(&outbound, &line).await.is_err() {
                break;
            }
        }
    }
}

async fn poll_inbound(
    client: &DriveClient,
    file_id: &str,
    offset: &mut usize,
    worker: &mut WorkerSide,
) -> Result<bool> {
    let (content, _etag) = client.download(file_id).await?;
    // Truncation resets the read position.
    if content.len() < *offset {
        tracing::debug!(old = *offset, new = content.len(), "inbound log shrank, rewinding");
        *offset = 0;
    }

    let fresh = &content[*offset..];
    // Only consume whole lines; a torn trailing line is read next poll.
    let consumable = match fresh.rfind('\n') {
        Some(last_newline) => &fresh[..=last_newline],
        None => return Ok(false),
    };
    *offset += consumable.len();

    for line in consumable.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match wire::decode_log_line(line) {
            Ok(envelope) => {
                if !worker.deliver(envelope).await {
                    return Ok(true);
                }
            }
            Err(err) => tracing::debug!(error = %err, "skipping undecodable drive log line"),
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory CAS store that can fail the first N preconditions.
    struct FakeStore {
        state: Mutex<(String, u64)>,
        forced_conflicts: AtomicU32,
    }

    impl FakeStore {
        fn new(conflicts: u32) -> FakeStore {
            FakeStore {
                state: Mutex::new((String::new(), 0)),
                forced_conflicts: AtomicU32::new(conflicts),
            }
        }

        fn content(&self) -> String {
            self.state.lock().unwrap().0.clone()
        }
    }

    #[async_trait]
    impl CasLogStore for FakeStore {
        async fn fetch(&self) -> Result<(String, String)> {
            let guard = self.state.lock().unwrap();
            Ok((guard.0.clone(), guard.1.to_string()))
        }

        async fn store(&self, content: &str, version: &str) -> Result<bool> {
            if self.forced_conflicts.load(Ordering::SeqCst) > 0 {
                self.forced_conflicts.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            let mut guard = self.state.lock().unwrap();
            if guard.1.to_string() != version {
                return Ok(false);
            }
            guard.0 = content.to_string();
            guard.1 += 1;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn append_retries_through_a_lost_precondition() {
        let store = FakeStore::new(1);
        append_line(&store, "first").await.unwrap();
        assert_eq!(store.content(), "first\n");
    }

    #[tokio::test]
    async fn concurrent_appends_both_land_without_corruption() {
        let store = std::sync::Arc::new(FakeStore::new(0));

        let a = {
            let store = store.clone();
            tokio::spawn(async move { append_line(store.as_ref(), "from-a").await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { append_line(store.as_ref(), "from-b").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let content = store.content();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&"from-a"));
        assert!(lines.contains(&"from-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn append_gives_up_after_bounded_conflicts() {
        let store = FakeStore::new(CAS_RETRIES + 4);
        assert!(append_line(&store, "doomed").await.is_err());
    }

    #[test]
    fn home_expansion_only_touches_leading_tilde() {
        std::env::set_var("HOME", "/home/clipssh-test");
        assert_eq!(
            expand_home("~/.config/clipssh/drive-token.json"),
            PathBuf::from("/home/clipssh-test/.config/clipssh/drive-token.json")
        );
        assert_eq!(expand_home("/etc/token.json"), PathBuf::from("/etc/token.json"));
    }
}
