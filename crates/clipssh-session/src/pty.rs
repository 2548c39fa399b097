//! PTY-backed shell owned by the server session.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use clipssh_protocol::{SignalName, MAX_CHUNK_BYTES};

use crate::{Result, SessionError};

const PTY_THREAD_STACK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub enum PtyEvent {
    Output(Vec<u8>),
    Exited(i32),
}

/// Resolve the shell to run: the preferred name/path first, then the
/// historical fallbacks.
pub fn resolve_shell(preferred: &str) -> Result<PathBuf> {
    let mut candidates = vec![preferred.to_string()];
    for fallback in ["tcsh", "/bin/sh"] {
        if fallback != preferred {
            candidates.push(fallback.to_string());
        }
    }

    for candidate in candidates {
        let path = Path::new(&candidate);
        if path.is_absolute() {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            continue;
        }
        if let Some(found) = find_in_path(&candidate) {
            return Ok(found);
        }
    }
    Err(SessionError::ShellSpawn(format!(
        "no usable shell found (tried {preferred}, tcsh, /bin/sh)"
    )))
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| {
            candidate
                .metadata()
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Interactive shell on a PTY. Output streams through the event channel
/// from a dedicated reader thread; input goes through [`write_input`].
pub struct PtyShell {
    shell_path: PathBuf,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    shell_pid: Option<u32>,
}

impl PtyShell {
    pub fn spawn(
        shell_path: &Path,
        cols: u16,
        rows: u16,
        events: mpsc::Sender<PtyEvent>,
    ) -> Result<PtyShell> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SessionError::ShellSpawn(format!("openpty: {err}")))?;

        let cmd = CommandBuilder::new(shell_path);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| SessionError::ShellSpawn(format!("spawn {}: {err}", shell_path.display())))?;
        let killer = child.clone_killer();
        let shell_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| SessionError::ShellSpawn(format!("clone pty reader: {err}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| SessionError::ShellSpawn(format!("take pty writer: {err}")))?;

        std::thread::Builder::new()
            .name("clipssh-pty-io".to_string())
            .stack_size(PTY_THREAD_STACK_BYTES)
            .spawn(move || {
                let mut buf = vec![0u8; MAX_CHUNK_BYTES];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            for chunk in buf[..n].chunks(MAX_CHUNK_BYTES) {
                                if events.blocking_send(PtyEvent::Output(chunk.to_vec())).is_err() {
                                    return;
                                }
                            }
                        }
                        // EIO on the master means the slave side is gone;
                        // treated as shell exit.
                        Err(_) => break,
                    }
                }
                let status = child.wait();
                let code = status
                    .ok()
                    .map(|s| i32::try_from(s.exit_code()).unwrap_or(1))
                    .unwrap_or(1);
                let _ = events.blocking_send(PtyEvent::Exited(code));
            })
            .map_err(|err| SessionError::ShellSpawn(format!("spawn pty io thread: {err}")))?;

        Ok(PtyShell {
            shell_path: shell_path.to_path_buf(),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            shell_pid,
        })
    }

    pub fn shell_path(&self) -> &Path {
        &self.shell_path
    }

    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SessionError::Internal("pty writer lock poisoned".into()))?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|err| SessionError::Internal(format!("pty write: {err}")))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .map_err(|_| SessionError::Internal("pty master lock poisoned".into()))?
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| SessionError::Internal(format!("pty resize: {err}")))
    }

    /// Forward a signal to the PTY's foreground process group. Falls back
    /// to the shell's own group when the terminal has no foreground job
    /// (non-job-control shells share their group with children anyway).
    pub fn signal(&self, name: SignalName) -> Result<()> {
        let signal = match name {
            SignalName::Int => Signal::SIGINT,
            SignalName::Quit => Signal::SIGQUIT,
            SignalName::Tstp => Signal::SIGTSTP,
        };

        let foreground = {
            let master = self
                .master
                .lock()
                .map_err(|_| SessionError::Internal("pty master lock poisoned".into()))?;
            master.as_raw_fd().and_then(|fd| {
                let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                nix::unistd::tcgetpgrp(fd).ok()
            })
        };
        let target = match foreground {
            Some(pgid) if pgid.as_raw() > 0 => pgid,
            _ => {
                let Some(pid) = self.shell_pid else {
                    return Err(SessionError::Internal("shell pid unknown".into()));
                };
                Pid::from_raw(pid as i32)
            }
        };
        killpg(target, signal)
            .map_err(|err| SessionError::Internal(format!("killpg: {err}")))
    }

    pub fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shell_resolution_falls_back_to_bin_sh() {
        let shell = resolve_shell("definitely-not-a-real-shell-xyz").unwrap();
        assert!(shell.ends_with("tcsh") || shell == Path::new("/bin/sh"));
    }

    #[test]
    fn absolute_preferred_shell_wins_when_present() {
        let shell = resolve_shell("/bin/sh").unwrap();
        assert_eq!(shell, Path::new("/bin/sh"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shell_echoes_input_and_reports_exit() {
        let (tx, mut rx) = mpsc::channel(64);
        let shell = PtyShell::spawn(Path::new("/bin/sh"), 80, 24, tx).unwrap();

        shell.write_input(b"echo pty-round-trip\n").unwrap();

        let mut output = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&output).contains("pty-round-trip") {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for pty output")
                .expect("pty event channel closed");
            if let PtyEvent::Output(chunk) = event {
                output.extend_from_slice(&chunk);
            }
        }

        shell.write_input(b"exit 7\n").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, rx.recv())
                .await
                .expect("timed out waiting for exit")
                .expect("pty event channel closed");
            if let PtyEvent::Exited(code) = event {
                assert_eq!(code, 7);
                break;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn killing_the_shell_ends_the_event_stream() {
        let (tx, mut rx) = mpsc::channel(64);
        let shell = PtyShell::spawn(Path::new("/bin/sh"), 80, 24, tx).unwrap();
        shell.kill();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(PtyEvent::Exited(_))) | Ok(None) => break,
                Ok(Some(PtyEvent::Output(_))) => continue,
                Err(_) => panic!("shell did not exit after kill"),
            }
        }
    }
}
