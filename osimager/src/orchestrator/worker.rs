//! The worker loop: claim the highest-priority queued build, prepare it,
//! run Packer under supervision, and report everything through the registry
//! and event bus.
//!
//! Each worker is a tokio task.  Blocking work (resolution, file
//! generation) runs on the blocking pool; process I/O is supervised with
//! dedicated line readers per stream so log capture never stalls the state
//! machine.

use super::build::{detect_level, BuildRequest, BuildState, LogLevel, LogSource, Progress};
use super::{BuildId, Inner};
use crate::assembly::{self, AssembledBuild, AssemblyOptions};
use crate::installer;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The orchestrator's visible steps for one build.
const TOTAL_STEPS: u32 = 5;

/// How long a worker naps when the queue is empty; a Notify wakes it sooner.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// How a supervised build ended.
enum Ending {
    Completed,
    Failed { message: String, exit_code: i32 },
    Cancelled,
    TimedOut,
}

pub(super) async fn run(inner: Arc<Inner>, worker_id: usize) {
    log::debug!("Worker {} started", worker_id);
    loop {
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }

        let next = inner.queue.lock().unwrap().pop();
        let id = match next {
            Some(id) => id,
            None => {
                // The timeout covers a notify that fired before we started
                // listening; the queue is re-polled either way.
                let _ = tokio::time::timeout(IDLE_POLL, inner.queue_ready.notified()).await;
                continue;
            }
        };

        // Claim the build: only still-Queued builds run; anything else was
        // cancelled while queued and the entry is stale.
        let claimed = {
            let mut registry = inner.registry.lock().unwrap();
            match registry.get_mut(&id) {
                Some(record) if record.state == BuildState::Queued => {
                    record.state = BuildState::Preparing;
                    Some((record.request.clone(), record.cancel_rx.clone()))
                }
                _ => None,
            }
        };
        let (request, cancel_rx) = match claimed {
            Some(claimed) => claimed,
            None => continue,
        };

        inner.active.fetch_add(1, Ordering::SeqCst);
        inner.set_state(&id, BuildState::Preparing);
        log::info!("Worker {} picked up build {}", worker_id, id);

        let ending = drive(&inner, &id, &request, cancel_rx).await;
        conclude(&inner, &id, &request, ending);

        inner.active.fetch_sub(1, Ordering::SeqCst);
    }
    log::debug!("Worker {} exiting", worker_id);
}

/// Applies the terminal transition and cleans the workspace.
fn conclude(inner: &Arc<Inner>, id: &BuildId, request: &BuildRequest, ending: Ending) {
    inner.set_progress(id, Progress::at(TOTAL_STEPS, TOTAL_STEPS, "cleanup"));

    if let Some(workspace) = inner.workspace_of(id) {
        if request.keep_workspace {
            inner.log(
                id,
                LogLevel::Info,
                LogSource::Orchestrator,
                format!("Keeping workspace '{}'", workspace.display()),
            );
        } else if let Err(e) = std::fs::remove_dir_all(&workspace) {
            log::warn!(
                "Failed to remove workspace '{}': {}",
                workspace.display(),
                e
            );
        }
    }

    match ending {
        Ending::Completed => inner.finish(id, BuildState::Completed, None),
        Ending::Failed { message, exit_code } => {
            inner.log(
                id,
                LogLevel::Error,
                LogSource::Orchestrator,
                message.clone(),
            );
            inner.finish(id, BuildState::Failed, Some((message, exit_code)));
        }
        Ending::Cancelled => inner.finish(
            id,
            BuildState::Cancelled,
            None,
        ),
        Ending::TimedOut => inner.finish(
            id,
            BuildState::TimedOut,
            Some(("Build timed out".to_string(), 6)),
        ),
    }
}

/// Runs one build through preparation, generation, and supervision.
async fn drive(
    inner: &Arc<Inner>,
    id: &BuildId,
    request: &BuildRequest,
    mut cancel_rx: watch::Receiver<bool>,
) -> Ending {
    let cancelled = |rx: &watch::Receiver<bool>| *rx.borrow();

    // Step 1: workspace and resolution.
    inner.set_progress(id, Progress::at(1, TOTAL_STEPS, "prepare"));
    inner.log(
        id,
        LogLevel::Info,
        LogSource::Orchestrator,
        format!("Resolving {}", request.target),
    );

    if cancelled(&cancel_rx) {
        return Ending::Cancelled;
    }

    let workspace = request
        .options
        .workspace
        .clone()
        .unwrap_or_else(|| inner.settings.temp_dir().join(format!("osimager-{}", id)));
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        return Ending::Failed {
            message: format!("Failed to create workspace '{}': {}", workspace.display(), e),
            exit_code: 1,
        };
    }
    {
        let mut registry = inner.registry.lock().unwrap();
        if let Some(record) = registry.get_mut(id) {
            record.workspace = Some(workspace.clone());
        }
    }

    let assembled = {
        let inner = inner.clone();
        let request = request.clone();
        let workspace = workspace.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let options = AssemblyOptions {
                workspace: Some(workspace),
                ..request.options.clone()
            };
            let creds = inner.creds.as_deref();
            assembly::assemble(
                &inner.settings,
                &inner.index,
                &request.target,
                &options,
                creds,
            )
        });
        match handle.await {
            Ok(Ok(assembled)) => assembled,
            Ok(Err(e)) => {
                return Ending::Failed {
                    message: e.to_string(),
                    exit_code: e.exit_code(),
                }
            }
            Err(join_error) => {
                return Ending::Failed {
                    message: format!("Resolution task failed: {}", join_error),
                    exit_code: 1,
                }
            }
        }
    };

    if cancelled(&cancel_rx) {
        return Ending::Cancelled;
    }

    // Step 2: installer files.
    inner.set_progress(id, Progress::at(2, TOTAL_STEPS, "file-gen"));
    {
        let task_inner = inner.clone();
        let assembled = assembled.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let creds = task_inner.creds.as_deref();
            installer::generate_files(&assembled, &task_inner.settings.installer_dir, creds)
        });
        match handle.await {
            Ok(Ok(written)) => {
                inner.log(
                    id,
                    LogLevel::Info,
                    LogSource::Orchestrator,
                    format!("Generated {} installer file(s)", written.len()),
                );
            }
            Ok(Err(e)) => {
                return Ending::Failed {
                    message: e.to_string(),
                    exit_code: e.exit_code(),
                }
            }
            Err(join_error) => {
                return Ending::Failed {
                    message: format!("File generation task failed: {}", join_error),
                    exit_code: 1,
                }
            }
        }
    }

    if cancelled(&cancel_rx) {
        return Ending::Cancelled;
    }

    // The Packer input document.
    let document_path = workspace.join(format!("{}.json", assembled.name));
    let rendered = match serde_json::to_string_pretty(&assembled.document) {
        Ok(rendered) => rendered,
        Err(e) => {
            return Ending::Failed {
                message: format!("Failed to serialize Packer document: {}", e),
                exit_code: 1,
            }
        }
    };
    if let Err(e) = std::fs::write(&document_path, rendered) {
        return Ending::Failed {
            message: format!("Failed to write '{}': {}", document_path.display(), e),
            exit_code: 1,
        };
    }

    if request.dry_run {
        inner.log(
            id,
            LogLevel::Info,
            LogSource::Orchestrator,
            format!(
                "Dry run; would invoke: {}",
                packer_command_line(request, &document_path)
            ),
        );
        return Ending::Completed;
    }

    // Step 3: spawn Packer.
    inner.set_progress(id, Progress::at(3, TOTAL_STEPS, "spawn"));
    let mut command = packer_command(inner, request, &assembled, &document_path);
    inner.log(
        id,
        LogLevel::Info,
        LogSource::Orchestrator,
        format!("Spawning: {}", packer_command_line(request, &document_path)),
    );

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Ending::Failed {
                message: format!("Failed to spawn packer: {}", e),
                exit_code: 4,
            }
        }
    };

    inner.set_state(id, BuildState::Running);
    inner.set_progress(id, Progress::at(4, TOTAL_STEPS, "running"));

    // Dedicated reader per stream; every line becomes a log event.
    let stdout_reader = child
        .stdout
        .take()
        .map(|stream| spawn_reader(inner.clone(), id.clone(), stream, LogSource::PackerStdout));
    let stderr_reader = child
        .stderr
        .take()
        .map(|stream| spawn_reader(inner.clone(), id.clone(), stream, LogSource::PackerStderr));

    let timeout = request.timeout.or_else(|| {
        inner
            .settings
            .build_timeout_secs
            .map(Duration::from_secs)
    });
    let grace = Duration::from_secs(inner.settings.cancel_grace_secs);

    let ending = supervise(&mut child, &mut cancel_rx, timeout, grace).await;

    // Drain the readers so the terminal event never precedes its log lines.
    if let Some(reader) = stdout_reader {
        let _ = reader.await;
    }
    if let Some(reader) = stderr_reader {
        let _ = reader.await;
    }

    ending
}

/// Waits for child exit, cancellation, or timeout, whichever comes first.
/// Cancellation and timeout share the same kill sequence: SIGTERM, a grace
/// window, then SIGKILL; the child is reaped in every path.
async fn supervise(
    child: &mut Child,
    cancel_rx: &mut watch::Receiver<bool>,
    timeout: Option<Duration>,
    grace: Duration,
) -> Ending {
    enum Signalled {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancel,
        CancelSenderGone,
        Timeout,
    }

    let timeout_sleep = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timeout_sleep);

    // A cancel requested before we started supervising still counts.
    let already_cancelled = *cancel_rx.borrow();

    let signal = if already_cancelled {
        Signalled::Cancel
    } else {
        tokio::select! {
            status = child.wait() => Signalled::Exited(status),
            changed = cancel_rx.changed() => {
                if changed.is_ok() { Signalled::Cancel } else { Signalled::CancelSenderGone }
            }
            _ = &mut timeout_sleep => Signalled::Timeout,
        }
    };
    // The cancel sender only disappears when the registry drops the record,
    // which cannot happen to a running build; wait for exit if it somehow
    // does.
    let signal = match signal {
        Signalled::CancelSenderGone => Signalled::Exited(child.wait().await),
        other => other,
    };

    match signal {
        Signalled::Exited(Ok(status)) if status.success() => Ending::Completed,
        Signalled::Exited(Ok(status)) => Ending::Failed {
            message: format!("Packer exited with {}", status),
            exit_code: 4,
        },
        Signalled::Exited(Err(e)) => Ending::Failed {
            message: format!("Failed waiting for packer: {}", e),
            exit_code: 4,
        },
        Signalled::Cancel => {
            kill_sequence(child, grace).await;
            Ending::Cancelled
        }
        Signalled::Timeout => {
            kill_sequence(child, grace).await;
            Ending::TimedOut
        }
        Signalled::CancelSenderGone => unreachable!("converted to Exited above"),
    }
}

/// SIGTERM, wait up to the grace window, then SIGKILL and reap.
async fn kill_sequence(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        log::info!("Sending SIGTERM to packer pid {}", pid);
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        log::warn!("Packer pid {} outlived the grace window; killing", pid);
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn spawn_reader(
    inner: Arc<Inner>,
    id: BuildId,
    stream: impl AsyncRead + Unpin + Send + 'static,
    source: LogSource,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let level = detect_level(&line);
            inner.log(&id, level, source, line);
        }
    })
}

/// Builds the packer invocation: flags from the request, the document from
/// the workspace, the installer root as working directory so provisioner
/// paths resolve, and the merged evars (plus Vault and logging controls) in
/// the environment.
fn packer_command(
    inner: &Arc<Inner>,
    request: &BuildRequest,
    assembled: &AssembledBuild,
    document_path: &Path,
) -> Command {
    let mut command = Command::new("packer");
    command.arg("build");
    if request.timestamp_ui {
        command.arg("-timestamp-ui");
    }
    if let Some(mode) = &request.on_error {
        command.arg(format!("-on-error={}", mode));
    }
    if request.force {
        command.arg("-force");
    }
    if request.debug {
        command.arg("-debug");
        command.env("PACKER_LOG", "1");
    }
    command.arg(document_path);

    command.current_dir(&inner.settings.installer_dir);
    for (key, value) in &assembled.evars {
        command.env(key, value);
    }
    if inner.settings.credential_source == osimager_config::CredentialSource::vault {
        if let Some(addr) = &inner.settings.vault_addr {
            command.env("VAULT_ADDR", addr);
        }
        if let Some(token_path) = &inner.settings.vault_token_path {
            if let Ok(token) = std::fs::read_to_string(token_path) {
                command.env("VAULT_TOKEN", token.trim());
            }
        }
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// The human-readable form of the invocation, for logs and dry runs.
fn packer_command_line(request: &BuildRequest, document_path: &Path) -> String {
    let mut parts = vec!["packer".to_string(), "build".to_string()];
    if request.timestamp_ui {
        parts.push("-timestamp-ui".to_string());
    }
    if let Some(mode) = &request.on_error {
        parts.push(format!("-on-error={}", mode));
    }
    if request.force {
        parts.push("-force".to_string());
    }
    if request.debug {
        parts.push("-debug".to_string());
    }
    parts.push(document_path.display().to_string());
    parts.join(" ")
}
