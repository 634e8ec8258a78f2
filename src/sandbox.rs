//! Container runtime abstraction over the local Docker daemon.
//!
//! `DockerSandbox` provisions a throwaway workspace, creates an isolated
//! container with the session's language spec, attaches the duplex stdio
//! streams before start, and runs a watcher that races container exit
//! against session cancellation. The daemon multiplexes stdout/stderr into
//! one framed stream; bollard demuxes it into per-stream `LogOutput` frames.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerWaitResponse, HostConfig};
use bollard::Docker;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tempfile::TempDir;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::SandboxError;
use crate::language::{ExecutionSpec, LanguageRegistry};
use crate::session::Session;

/// Mount point of the session workspace inside the container.
const WORKSPACE_DIR: &str = "/workspace";

/// How long the watcher lets the output pump drain after container exit
/// before recording the terminal state.
const OUTPUT_DRAIN_WINDOW: Duration = Duration::from_secs(1);

type AttachOutput = Pin<Box<dyn Stream<Item = Result<LogOutput, DockerError>> + Send>>;

/// Result of a non-interactive run to completion.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Narrow contract the engine holds over the container runtime.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Provisions and starts a container for the session, binds the
    /// container id and stdin handle, and spawns the output pump and
    /// lifecycle watcher. On success the session is ready to run.
    async fn start_session(
        &self,
        session: &Arc<Session>,
        spec: &ExecutionSpec,
        code: &str,
    ) -> Result<(), SandboxError>;

    /// Runs code to completion without stdin, bounded by `time_limit`.
    async fn run_oneshot(
        &self,
        spec: &ExecutionSpec,
        code: &str,
        time_limit: Duration,
    ) -> Result<RunReport, SandboxError>;
}

pub struct DockerSandbox {
    docker: Docker,
    config: EngineConfig,
}

impl DockerSandbox {
    pub fn connect(config: &EngineConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            config: config.clone(),
        })
    }

    /// Pulls every registered language image that is not already present.
    pub async fn preload_images(&self, registry: &LanguageRegistry) -> Result<(), SandboxError> {
        for spec in registry.all() {
            if self.docker.inspect_image(spec.image).await.is_ok() {
                debug!(image = %spec.image, "image already present");
                continue;
            }
            info!(image = %spec.image, language = %spec.name, "pulling image");
            let mut pull = self.docker.create_image(
                Some(CreateImageOptions {
                    from_image: spec.image,
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = pull.next().await {
                progress?;
            }
            info!(image = %spec.image, "image ready");
        }
        Ok(())
    }

    /// Ephemeral workspace with the code written to the spec's file name.
    async fn prepare(&self, spec: &ExecutionSpec, code: &str) -> Result<TempDir, SandboxError> {
        let workspace = tempfile::Builder::new().prefix("exec-").tempdir()?;
        let path = workspace.path().join(spec.file_name);
        tokio::fs::write(&path, code).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
        Ok(workspace)
    }

    fn container_config(&self, spec: &ExecutionSpec, workspace_path: &str) -> Config<String> {
        let tmpfs = HashMap::from([(
            "/tmp".to_string(),
            format!("rw,size={}m,noexec,nosuid", self.config.tmpfs_size_mib),
        )]);
        Config {
            image: Some(spec.image.to_string()),
            cmd: Some(container_command(spec)),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            stdin_once: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(self.config.container_memory),
                nano_cpus: Some((self.config.container_cpus * 1_000_000_000.0) as i64),
                pids_limit: Some(self.config.container_pids),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(tmpfs),
                binds: Some(vec![format!("{workspace_path}:{WORKSPACE_DIR}")]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn remove(&self, container_id: &str) {
        remove_container(&self.docker, container_id).await;
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn start_session(
        &self,
        session: &Arc<Session>,
        spec: &ExecutionSpec,
        code: &str,
    ) -> Result<(), SandboxError> {
        let workspace = self.prepare(spec, code).await?;
        let workspace_path = workspace.path().to_string_lossy().to_string();

        let name = format!("exec-{}", session.id());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                self.container_config(spec, &workspace_path),
            )
            .await?;
        let container_id = created.id;

        // Attach before start so no early output is lost.
        let attach = match self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await
        {
            Ok(attach) => attach,
            Err(err) => {
                self.remove(&container_id).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_id).await;
            return Err(err.into());
        }

        let AttachContainerResults { output, input } = attach;
        session.set_runtime(container_id.clone(), input);
        info!(
            session = %session.id(),
            container = %container_id,
            image = %spec.image,
            "container started"
        );

        tokio::spawn(watch_container(
            self.docker.clone(),
            session.clone(),
            container_id,
            output,
            workspace,
        ));
        Ok(())
    }

    async fn run_oneshot(
        &self,
        spec: &ExecutionSpec,
        code: &str,
        time_limit: Duration,
    ) -> Result<RunReport, SandboxError> {
        let workspace = self.prepare(spec, code).await?;
        let workspace_path = workspace.path().to_string_lossy().to_string();

        let mut config = self.container_config(spec, &workspace_path);
        config.open_stdin = Some(false);
        config.attach_stdin = Some(false);

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        let container_id = created.id;

        let started = Instant::now();
        if let Err(err) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_id).await;
            return Err(err.into());
        }

        let mut wait = self.docker.wait_container(
            &container_id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        let mut timed_out = false;
        let exit_code = tokio::select! {
            outcome = wait.next() => Some(wait_outcome(outcome)),
            _ = tokio::time::sleep(time_limit) => {
                timed_out = true;
                let _ = self
                    .docker
                    .kill_container(&container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
                    .await;
                let _ = wait.next().await;
                None
            }
        };

        let mut logs = self.docker.logs(
            &container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(frame) = logs.next().await {
            match frame {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(container = %container_id, error = %err, "log collection failed");
                    break;
                }
            }
        }

        self.remove(&container_id).await;
        if let Err(err) = workspace.close() {
            warn!(error = %err, "workspace cleanup failed");
        }

        Ok(RunReport {
            stdout,
            stderr,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out,
        })
    }
}

/// Shell composition when a spec compiles first: the running process
/// replaces the shell, keeping signal delivery and exit codes clean.
fn container_command(spec: &ExecutionSpec) -> Vec<String> {
    match &spec.compile_command {
        Some(compile) => vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{} && exec {}", compile.join(" "), spec.run_command.join(" ")),
        ],
        None => spec.run_command.clone(),
    }
}

/// Output pump plus lifecycle watcher for one started container. The pump
/// demuxes frames into the session buffers until EOF; the watcher races
/// container exit against session cancellation. Either way the container is
/// force-removed and the workspace deleted before the terminal state is
/// recorded, so completion waiters never resume ahead of cleanup.
async fn watch_container(
    docker: Docker,
    session: Arc<Session>,
    container_id: String,
    mut output: AttachOutput,
    workspace: TempDir,
) {
    let pump_session = session.clone();
    let mut pump = tokio::spawn(async move {
        while let Some(frame) = output.next().await {
            match frame {
                Ok(LogOutput::StdOut { message }) => pump_session.append_stdout(&message),
                Ok(LogOutput::StdErr { message }) => pump_session.append_stderr(&message),
                Ok(_) => {}
                Err(err) => {
                    warn!(session = %pump_session.id(), error = %err, "output pump error");
                    break;
                }
            }
        }
    });

    let cancel = session.cancel_token();
    let mut wait = docker.wait_container(
        &container_id,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    );

    let exit_code = tokio::select! {
        outcome = wait.next() => {
            let exit_code = wait_outcome(outcome);
            // Let the tail of the attach stream land before the terminal
            // transition triggers the clients' final flush.
            let _ = tokio::time::timeout(OUTPUT_DRAIN_WINDOW, &mut pump).await;
            Some(exit_code)
        }
        _ = cancel.cancelled() => {
            let _ = docker
                .kill_container(&container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await;
            let _ = wait.next().await;
            let _ = tokio::time::timeout(OUTPUT_DRAIN_WINDOW, &mut pump).await;
            None
        }
    };

    // Cleanup first: the done signal releases completion waiters (and with
    // them manager eviction), which must not outrun container removal.
    remove_container(&docker, &container_id).await;
    if let Err(err) = workspace.close() {
        warn!(session = %session.id(), error = %err, "workspace cleanup failed");
    }

    match exit_code {
        Some(exit_code) => session.mark_finished(exit_code),
        None => session.mark_terminated(),
    }
}

fn wait_outcome(outcome: Option<Result<ContainerWaitResponse, DockerError>>) -> i64 {
    match outcome {
        Some(Ok(response)) => response.status_code,
        // bollard reports non-zero exits through the error variant.
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
        Some(Err(err)) => {
            warn!(error = %err, "container wait failed");
            -1
        }
        None => -1,
    }
}

async fn remove_container(docker: &Docker, container_id: &str) {
    let remove = docker.remove_container(
        container_id,
        Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        }),
    );
    if let Err(err) = remove.await {
        warn!(container = %container_id, error = %err, "container remove failed");
    }
}

#[cfg(test)]
pub use mock::MockSandbox;

#[cfg(test)]
mod mock {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct MockLedger {
        started: Vec<String>,
        killed: Vec<String>,
        removed: Vec<String>,
    }

    /// Scripted stand-in for the Docker runtime. The fake program emits the
    /// configured output, optionally echoes stdin, and either finishes after
    /// `run_for` or runs until cancelled.
    pub struct MockSandbox {
        output: Vec<u8>,
        run_for: Option<Duration>,
        echo_stdin: bool,
        fail_start: bool,
        ledger: Arc<Mutex<MockLedger>>,
    }

    impl MockSandbox {
        pub fn new() -> Self {
            Self {
                output: Vec::new(),
                run_for: Some(Duration::from_millis(50)),
                echo_stdin: false,
                fail_start: false,
                ledger: Arc::default(),
            }
        }

        pub fn with_output(mut self, output: &[u8]) -> Self {
            self.output = output.to_vec();
            self
        }

        pub fn running_for(mut self, run_for: Option<Duration>) -> Self {
            self.run_for = run_for;
            self
        }

        pub fn echoing_stdin(mut self) -> Self {
            self.echo_stdin = true;
            self
        }

        pub fn failing_start(mut self) -> Self {
            self.fail_start = true;
            self
        }

        pub fn started(&self) -> Vec<String> {
            self.ledger.lock().unwrap().started.clone()
        }

        pub fn killed(&self) -> Vec<String> {
            self.ledger.lock().unwrap().killed.clone()
        }

        pub fn removed(&self) -> Vec<String> {
            self.ledger.lock().unwrap().removed.clone()
        }
    }

    #[async_trait]
    impl Sandbox for MockSandbox {
        async fn start_session(
            &self,
            session: &Arc<Session>,
            _spec: &ExecutionSpec,
            _code: &str,
        ) -> Result<(), SandboxError> {
            if self.fail_start {
                return Err(SandboxError::Io(std::io::Error::other(
                    "mock start failure",
                )));
            }
            let container_id = format!("mock-{}", session.id());
            self.ledger
                .lock()
                .unwrap()
                .started
                .push(container_id.clone());

            let (stdin, mut peer) = tokio::io::duplex(4096);
            session.set_runtime(container_id.clone(), Box::pin(stdin));

            let session = session.clone();
            let cancel = session.cancel_token();
            let ledger = self.ledger.clone();
            let output = self.output.clone();
            let run_for = self.run_for;
            let echo = self.echo_stdin;
            tokio::spawn(async move {
                if !output.is_empty() {
                    session.append_stdout(&output);
                }
                let deadline = async {
                    match run_for {
                        Some(run_for) => tokio::time::sleep(run_for).await,
                        None => std::future::pending().await,
                    }
                };
                let echo_loop = async {
                    let mut buf = [0u8; 256];
                    loop {
                        match peer.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => session.append_stdout(&buf[..n]),
                        }
                    }
                };
                let finished = tokio::select! {
                    _ = cancel.cancelled() => {
                        ledger.lock().unwrap().killed.push(container_id.clone());
                        false
                    }
                    _ = deadline => true,
                    _ = echo_loop, if echo => true,
                };
                // Same ordering as the real watcher: removal happens before
                // the terminal transition fires the done signal.
                ledger.lock().unwrap().removed.push(container_id);
                if finished {
                    session.mark_finished(0);
                } else {
                    session.mark_terminated();
                }
            });
            Ok(())
        }

        async fn run_oneshot(
            &self,
            _spec: &ExecutionSpec,
            _code: &str,
            _time_limit: Duration,
        ) -> Result<RunReport, SandboxError> {
            Ok(RunReport {
                stdout: String::from_utf8_lossy(&self.output).into_owned(),
                stderr: String::new(),
                exit_code: Some(0),
                duration_ms: 1,
                timed_out: false,
            })
        }
    }
}
