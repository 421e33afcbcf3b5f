//! Child-process supervision for the backup tool.
//!
//! XtraBackup is interactive: it streams progress to stderr and prompts for
//! the database password once. The supervisor spawns the tool with piped
//! stdio, scans both output streams for the prompt, answers it exactly once,
//! then blocks without a deadline for the tool to finish. The timeout bounds
//! only the authentication handshake, never the backup itself.
//!
//! The prompt and completion strings are the textual contract of Percona
//! XtraBackup 8.0; treat them as versioned and fragile.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::utils::errors::{CycleError, Result};

/// Substring the tool prints when asking for the password.
pub const PASSWORD_PROMPT: &str = "Enter password";

/// Final line the tool prints after a successful backup.
pub const SUCCESS_MARKER: &str = "completed OK!";

/// Marker for a rejected credential (MySQL error 1045).
pub const AUTH_ERROR_MARKER: &str = "Access denied";

/// Captured output is trimmed to this tail; the classification markers all
/// appear near the end of the stream.
const TRANSCRIPT_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Base,
    Incremental,
}

/// One backup command to supervise.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub kind: BackupKind,
    pub target_dir: PathBuf,

    /// Prior folder the incremental is taken against; `None` for a base
    pub incremental_basedir: Option<PathBuf>,
}

/// Classified result of one supervised run, with the captured output tail.
#[derive(Debug)]
pub enum CommandOutcome {
    Success {
        output: String,
    },
    /// The password prompt was not observed in time; the child was killed
    Timeout,
    /// The tool reported a credential rejection; must not be retried
    AuthRejected {
        output: String,
    },
    /// Non-zero exit, or a zero exit without the completion marker
    ToolError {
        exit_code: Option<i32>,
        output: String,
    },
}

/// Run one backup command to completion.
///
/// On any outcome other than `Success` the target directory must be treated
/// as unusable output; the caller is responsible for removing it.
pub async fn run_backup_command(
    request: &BackupRequest,
    config: &Config,
) -> Result<CommandOutcome> {
    let args = build_args(request, config);

    let mut child = Command::new(&config.general.backup_command)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    info!(
        command = %config.general.backup_command,
        kind = ?request.kind,
        target = %request.target_dir.display(),
        pid = child.id(),
        "Spawned backup tool"
    );

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| CycleError::Tool("backup tool stdin was not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CycleError::Tool("backup tool stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CycleError::Tool("backup tool stderr was not captured".into()))?;

    let (tx, mut rx) = mpsc::channel::<String>(64);
    spawn_pump(stdout, tx.clone());
    spawn_pump(stderr, tx);

    let echo = config.log.enabled && config.log.echo_child_output;
    let mut transcript = String::new();

    // Handshake: bounded scan for the password prompt. The prompt is not
    // newline-terminated, so the pumps deliver raw chunks, not lines.
    let deadline = Instant::now() + Duration::from_secs(config.general.prompt_timeout_secs);
    let mut prompt_answered = false;
    while !prompt_answered {
        match timeout_at(deadline, rx.recv()).await {
            Err(_) => {
                warn!(
                    timeout_secs = config.general.prompt_timeout_secs,
                    "No password prompt from the backup tool; killing it"
                );
                child.kill().await?;
                return Ok(CommandOutcome::Timeout);
            }
            // Streams closed before any prompt: the tool bailed out early.
            // Fall through and classify by exit status.
            Ok(None) => break,
            Ok(Some(chunk)) => {
                if echo {
                    mirror_to_screen(&chunk);
                }
                append_bounded(&mut transcript, &chunk);
                if transcript.contains(PASSWORD_PROMPT) {
                    stdin.write_all(config.database.password.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await?;
                    prompt_answered = true;
                    debug!("Password prompt answered, waiting for the tool to finish");
                }
            }
        }
    }

    // Single prompt, single response: nothing else is ever written.
    drop(stdin);

    // Past authentication the wait is unbounded; a large backup may run for
    // hours while the pumps keep draining output.
    while let Some(chunk) = rx.recv().await {
        if echo {
            mirror_to_screen(&chunk);
        }
        append_bounded(&mut transcript, &chunk);
    }

    let status = child.wait().await?;
    debug!(exit = ?status.code(), "Backup tool finished");

    if transcript.contains(AUTH_ERROR_MARKER) {
        return Ok(CommandOutcome::AuthRejected { output: transcript });
    }
    if !status.success() {
        return Ok(CommandOutcome::ToolError {
            exit_code: status.code(),
            output: transcript,
        });
    }
    if transcript.contains(SUCCESS_MARKER) {
        Ok(CommandOutcome::Success { output: transcript })
    } else {
        // A clean exit without the completion marker is outside the tool's
        // contract; do not count the target folder as a valid backup.
        Ok(CommandOutcome::ToolError {
            exit_code: status.code(),
            output: transcript,
        })
    }
}

/// Build the tool's argument list. The password is never placed on the
/// command line: a bare `--password` makes the tool prompt for it.
fn build_args(request: &BackupRequest, config: &Config) -> Vec<String> {
    let mut args = vec![
        format!("--user={}", config.database.user),
        "--password".to_string(),
        format!("--host={}", config.database.host),
        format!("--port={}", config.database.port),
        "--backup".to_string(),
        format!("--target-dir={}", request.target_dir.display()),
    ];
    if let Some(basedir) = &request.incremental_basedir {
        args.push(format!("--incremental-basedir={}", basedir.display()));
    }
    for extra in &config.general.extra_args {
        let extra = extra.trim();
        if extra.is_empty() {
            continue;
        }
        args.push(format!("--{extra}"));
    }
    args
}

/// Forward one of the child's output streams into the shared channel.
fn spawn_pump<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn mirror_to_screen(chunk: &str) {
    use std::io::Write;
    print!("{chunk}");
    let _ = std::io::stdout().flush();
}

/// Append a chunk, keeping only the transcript tail once it grows past the
/// limit.
fn append_bounded(transcript: &mut String, chunk: &str) {
    transcript.push_str(chunk);
    if transcript.len() > TRANSCRIPT_LIMIT {
        let mut cut = transcript.len() - TRANSCRIPT_LIMIT / 2;
        while !transcript.is_char_boundary(cut) {
            cut += 1;
        }
        transcript.drain(..cut);
    }
}
