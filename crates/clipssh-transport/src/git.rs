//! Shared bare git repository as a message medium.
//!
//! Each peer keeps a local bare mirror of the upstream repo. One envelope
//! becomes one commit on the sender's branch whose tree holds the single
//! blob `frame.json`. The receiver fetches the peer branch, walks commits
//! past its cursor and persists the cursor at `refs/clipssh/cursor`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use clipssh_protocol::Envelope;

use crate::facade::{channel_pair, TransportChannels, WorkerSide};
use crate::{Result, Transport, TransportError};

pub const BRANCH_C2S: &str = "gitssh2-c2s";
pub const BRANCH_S2C: &str = "gitssh2-s2c";

/// Name of the per-commit payload blob.
const FRAME_BLOB: &str = "frame.json";
/// Ref recording the last inbound commit handed to the session layer.
const CURSOR_REF: &str = "refs/clipssh/cursor";

const PUSH_RETRIES: u32 = 6;

#[derive(Debug, Clone)]
pub struct GitTransportConfig {
    pub local_repo: PathBuf,
    pub upstream_url: String,
    pub inbound_branch: String,
    pub outbound_branch: String,
    pub sync_interval: Duration,
}

impl GitTransportConfig {
    pub fn for_client(local_repo: PathBuf, upstream_url: String) -> GitTransportConfig {
        GitTransportConfig {
            local_repo,
            upstream_url,
            inbound_branch: BRANCH_S2C.to_string(),
            outbound_branch: BRANCH_C2S.to_string(),
            sync_interval: Duration::from_millis(500),
        }
    }

    pub fn for_server(local_repo: PathBuf, upstream_url: String) -> GitTransportConfig {
        GitTransportConfig {
            local_repo,
            upstream_url,
            inbound_branch: BRANCH_C2S.to_string(),
            outbound_branch: BRANCH_S2C.to_string(),
            sync_interval: Duration::from_millis(500),
        }
    }
}

/// Plumbing-level operations against the local bare mirror.
pub struct GitMirror {
    git_dir: PathBuf,
    upstream_url: String,
    inbound_ref: String,
    outbound_ref: String,
    inbound_branch: String,
}

impl GitMirror {
    pub async fn open(config: &GitTransportConfig) -> Result<GitMirror> {
        let mirror = GitMirror {
            git_dir: config.local_repo.clone(),
            upstream_url: config.upstream_url.clone(),
            inbound_ref: format!("refs/heads/{}", config.inbound_branch),
            outbound_ref: format!("refs/heads/{}", config.outbound_branch),
            inbound_branch: config.inbound_branch.clone(),
        };
        mirror.ensure_initialized().await?;
        Ok(mirror)
    }

    async fn ensure_initialized(&self) -> Result<()> {
        if !self.git_dir.exists() {
            if let Some(parent) = self.git_dir.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| TransportError::Setup(format!("create mirror dir: {err}")))?;
            }
            run_git(None, &["init", "--bare", &self.git_dir.to_string_lossy()])
                .await
                .map_err(TransportError::Setup)?;
        }

        let bare = self
            .git(&["rev-parse", "--is-bare-repository"])
            .await
            .map_err(TransportError::Setup)?;
        if bare.trim() != "true" {
            return Err(TransportError::Setup(format!(
                "local mirror is not a bare repository: {}",
                self.git_dir.display()
            )));
        }

        // Point origin at the upstream medium, creating or correcting it.
        match self.git(&["remote", "get-url", "origin"]).await {
            Ok(existing) if existing.trim() == self.upstream_url => {}
            Ok(_) => {
                self.git(&["remote", "set-url", "origin", &self.upstream_url])
                    .await
                    .map_err(TransportError::Setup)?;
            }
            Err(_) => {
                self.git(&["remote", "add", "origin", &self.upstream_url])
                    .await
                    .map_err(TransportError::Setup)?;
            }
        }
        Ok(())
    }

    /// Commit one envelope on the outbound branch and push it upstream,
    /// recovering from non-fast-forward rejections by re-committing onto
    /// the fetched upstream tip.
    pub async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let payload = envelope
            .to_json()
            .map_err(|err| TransportError::Broken(format!("encode envelope: {err}")))?;

        let mut delay = Duration::from_millis(50);
        for attempt in 0..PUSH_RETRIES {
            self.commit_frame(envelope, &payload).await?;
            match self.push_outbound().await {
                Ok(()) => return Ok(()),
                Err(err) if is_non_fast_forward(&err) && attempt + 1 < PUSH_RETRIES => {
                    tracing::debug!(attempt, "push rejected, rebasing onto upstream tip");
                    self.fetch_branch(&self.outbound_ref).await.ok();
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
                Err(err) => return Err(TransportError::Broken(err)),
            }
        }
        Err(TransportError::Broken(
            "failed to push outbound frame after repeated non-fast-forward conflicts".into(),
        ))
    }

    async fn commit_frame(&self, envelope: &Envelope, payload: &str) -> Result<()> {
        let parent = self.resolve_ref(&self.outbound_ref).await;

        let blob = self
            .git_with_stdin(&["hash-object", "-w", "--stdin"], payload)
            .await
            .map_err(TransportError::Broken)?;
        let tree_entry = format!("100644 blob {}\t{FRAME_BLOB}\n", blob.trim());
        let tree = self
            .git_with_stdin(&["mktree"], &tree_entry)
            .await
            .map_err(TransportError::Broken)?;

        let subject = format!(
            "gitssh2 seq={} msg_id={}\n",
            envelope.seq, envelope.msg_id
        );
        let mut args = vec!["commit-tree".to_string(), tree.trim().to_string()];
        if let Some(parent) = &parent {
            args.push("-p".to_string());
            args.push(parent.clone());
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let commit = self
            .git_with_stdin(&arg_refs, &subject)
            .await
            .map_err(TransportError::Broken)?;

        let commit = commit.trim().to_string();
        let mut update = vec!["update-ref", self.outbound_ref.as_str(), commit.as_str()];
        if let Some(parent) = &parent {
            update.push(parent.as_str());
        }
        self.git(&update).await.map_err(TransportError::Broken)?;
        Ok(())
    }

    async fn push_outbound(&self) -> std::result::Result<(), String> {
        let refspec = format!("{0}:{0}", self.outbound_ref);
        self.git(&["push", "origin", &refspec]).await.map(|_| ())
    }

    /// Fetch the given branch ref from upstream, overwriting the local ref.
    /// A missing upstream branch (peer has not written yet) is not an error.
    async fn fetch_branch(&self, local_ref: &str) -> std::result::Result<bool, String> {
        let branch = local_ref.trim_start_matches("refs/heads/");
        let refspec = format!("+refs/heads/{branch}:{local_ref}");
        match self.git(&["fetch", "--prune", "origin", &refspec]).await {
            Ok(_) => Ok(true),
            Err(err) => {
                let lowered = err.to_lowercase();
                if lowered.contains("couldn't find remote ref")
                    || lowered.contains("no such ref was fetched")
                {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub async fn fetch_inbound(&self) -> std::result::Result<bool, String> {
        self.fetch_branch(&self.inbound_ref).await
    }

    /// Commits on the inbound branch past the persisted cursor, oldest
    /// first, decoded into envelopes. Advances the cursor ref.
    pub async fn read_new_envelopes(&self) -> std::result::Result<Vec<Envelope>, String> {
        let Some(head) = self.resolve_ref(&self.inbound_ref).await else {
            return Ok(Vec::new());
        };
        let cursor = self.resolve_ref(CURSOR_REF).await;
        if cursor.as_deref() == Some(head.as_str()) {
            return Ok(Vec::new());
        }

        let range = match &cursor {
            Some(cursor) => format!("{cursor}..{head}"),
            None => head.clone(),
        };
        let listing = match self.git(&["rev-list", "--reverse", &range]).await {
            Ok(listing) => listing,
            // The cursor can go stale if the peer branch history was
            // rewritten; restart from the beginning (dedup absorbs replays).
            Err(_) => self.git(&["rev-list", "--reverse", &head]).await?,
        };

        let mut envelopes = Vec::new();
        for commit in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let spec = format!("{commit}:{FRAME_BLOB}");
            match self.git(&["show", &spec]).await {
                Ok(payload) => match Envelope::from_json(payload.trim_end()) {
                    Ok(envelope) => envelopes.push(envelope),
                    Err(err) => {
                        tracing::debug!(commit, error = %err, "skipping undecodable frame commit")
                    }
                },
                Err(err) => tracing::debug!(commit, error = %err, "commit without frame blob"),
            }
        }

        self.git(&["update-ref", CURSOR_REF, &head]).await?;
        Ok(envelopes)
    }

    async fn resolve_ref(&self, reference: &str) -> Option<String> {
        let out = self
            .git(&["rev-parse", "--verify", "-q", reference])
            .await
            .ok()?;
        let value = out.trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    async fn git(&self, args: &[&str]) -> std::result::Result<String, String> {
        run_git(Some(&self.git_dir), args).await
    }

    async fn git_with_stdin(
        &self,
        args: &[&str],
        input: &str,
    ) -> std::result::Result<String, String> {
        run_git_with_stdin(Some(&self.git_dir), args, Some(input)).await
    }

    pub fn inbound_branch(&self) -> &str {
        &self.inbound_branch
    }
}

fn is_non_fast_forward(message: &str) -> bool {
    let lowered = message.to_lowercase();
    ["non-fast-forward", "fetch first", "rejected", "failed to push some refs"]
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

async fn run_git(git_dir: Option<&Path>, args: &[&str]) -> std::result::Result<String, String> {
    run_git_with_stdin(git_dir, args, None).await
}

async fn run_git_with_stdin(
    git_dir: Option<&Path>,
    args: &[&str],
    input: Option<&str>,
) -> std::result::Result<String, String> {
    let mut command = Command::new("git");
    if let Some(dir) = git_dir {
        command.arg("--git-dir").arg(dir);
    }
    command
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|err| format!("failed to run git (is git installed?): {err}"))?;
    if let Some(stdin_text) = input {
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(stdin_text.as_bytes())
                .await
                .map_err(|err| format!("git stdin: {err}"))?;
        }
    } else {
        drop(child.stdin.take());
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| format!("git wait: {err}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            }
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Git branch append-log transport. Link-unreliable: the session layer
/// drives retransmission.
pub struct GitTransport {
    name: String,
    channels: TransportChannels,
}

impl GitTransport {
    pub async fn spawn(config: GitTransportConfig) -> Result<GitTransport> {
        let name = format!(
            "git:{} (upstream={}, in={}, out={})",
            config.local_repo.display(),
            config.upstream_url,
            config.inbound_branch,
            config.outbound_branch
        );
        let mirror = GitMirror::open(&config).await?;
        let (channels, worker) = channel_pair();
        tokio::spawn(worker_loop(mirror, worker, config.sync_interval));
        Ok(GitTransport { name, channels })
    }
}

#[async_trait]
impl Transport for GitTransport {
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

async fn worker_loop(mirror: GitMirror, mut worker: WorkerSide, sync_interval: Duration) {
    let mut ticker = tokio::time::interval(sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = worker.shutdown_rx.changed() => {
                if worker.is_shutdown() {
                    break;
                }
            }
            outbound = worker.outbound_rx.recv() => {
                let Some(envelope) = outbound else { break };
                if let Err(err) = mirror.publish(&envelope).await {
                    tracing::warn!(error = %err, "git publish failed");
                    worker.mark_broken(err.to_string());
                    break;
                }
            }
            _ = ticker.tick() => {
                match sync_inbound(&mirror, &mut worker).await {
                    Ok(true) => return,       // session side gone
                    Ok(false) => consecutive_failures = 0,
                    Err(err) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= 8 {
                            tracing::warn!(error = %err, "git sync failing persistently");
                            worker.mark_broken(err);
                            break;
                        }
                        tracing::debug!(error = %err, consecutive_failures, "git sync failed, will retry");
                    }
                }
            }
        }
    }

    // Publish whatever the session queued before shutdown.
    let deadline = tokio::time::Instant::now() + crate::DRAIN_DEADLINE;
    while let Ok(envelope) = worker.outbound_rx.try_recv() {
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        if mirror.publish(&envelope).await.is_err() {
            break;
        }
    }
}

/// Fetch + walk the inbound branch. Ok(true) means the session receiver is
/// gone and the worker should exit.
async fn sync_inbound(
    mirror: &GitMirror,
    worker: &mut WorkerSide,
) -> std::result::Result<bool, String> {
    mirror.fetch_inbound().await?;
    for envelope in mirror.read_new_envelopes().await? {
        tracing::trace!(kind = envelope.kind(), seq = envelope.seq, branch = mirror.inbound_branch(), "git frame received");
        if !worker.deliver(envelope).await {
            return Ok(true);
        }
    }
    Ok(false)
}
