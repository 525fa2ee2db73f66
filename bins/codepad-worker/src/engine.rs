/// Sandbox Engine - Compile and Run One Submission in Docker
///
/// **Core Responsibility:**
/// Take source code and stdin, compile and execute them inside isolated,
/// resource-capped containers, and return the raw execution record.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (Docker, cgroups, workspaces)
/// - Engine does NOT classify outcomes (classifier's job)
/// - Engine returns `Err` only for infrastructure faults; program failures
///   are data inside `RawExecution`
///
/// **Per-execution state machine:**
/// Preparing → Compiling → (CompileFailed | Running) → Finished
///
/// Every phase gets a fresh container over a fresh workspace, and both are
/// torn down before `execute` returns on every path, so re-running a
/// redelivered job is always safe.

use crate::classifier::{CappedBuffer, CompileCapture, RawExecution, RunCapture};
use crate::config::{SandboxLimits, Toolchain, WorkerConfig};
use crate::workspace::{Workspace, BINARY_FILE, INPUT_FILE, SANDBOX_DIR, SOURCE_FILE};
use anyhow::{bail, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unprivileged uid:gid every sandbox process runs as
const SANDBOX_USER: &str = "65534:65534";

/// How long the keep-alive process outlives the phase timeout
const KEEPALIVE_SLACK: Duration = Duration::from_secs(30);

/// Budget for reading the cgroup memory counter after a run
const MEMORY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How often a finished stream's exec is re-inspected for its exit status
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Label carried by every sandbox container, for operators hunting leaks
const JOB_LABEL: &str = "codepad.job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => f.write_str("compile"),
            Phase::Run => f.write_str("run"),
        }
    }
}

/// Output of one exec inside a sandbox container
#[derive(Debug)]
struct ExecCapture {
    stdout: CappedBuffer,
    stderr: CappedBuffer,
    exit_code: Option<i64>,
    timed_out: bool,
    elapsed: Duration,
}

/// Container cleanup guard.
///
/// The normal path awaits `remove()`, so the container is gone before the
/// engine returns. If the owning future panics or is dropped first, `Drop`
/// schedules a forced removal instead.
struct ContainerGuard {
    docker: Docker,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: &Docker, id: String) -> Self {
        Self {
            docker: docker.clone(),
            id,
            armed: true,
        }
    }

    async fn remove(mut self) {
        self.armed = false;
        force_remove(&self.docker, &self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let id = self.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { force_remove(&docker, &id).await });
            }
            Err(_) => warn!(container_id = %self.id, "No runtime to remove container; it may leak"),
        }
    }
}

async fn force_remove(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(id, Some(options)).await {
        warn!(container_id = %id, error = %e, "Failed to remove sandbox container");
    } else {
        debug!(container_id = %id, "Sandbox container removed");
    }
}

/// Docker-backed sandbox for one fixed C++ toolchain.
///
/// **Isolation applied to every container:**
/// - Network disabled (`network_mode=none`)
/// - Memory ceiling with swap pinned to the same value
/// - CPU share via `nano_cpus`
/// - Process and open-file ceilings (`pids_limit`, `nofile` ulimit)
/// - All capabilities dropped, `no-new-privileges`, unprivileged user
/// - Read-only root filesystem; only the workspace and a small `/tmp` are writable
pub struct DockerEngine {
    docker: Docker,
    limits: SandboxLimits,
    toolchain: Toolchain,
    workspace_root: Option<PathBuf>,
}

impl DockerEngine {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        Ok(DockerEngine {
            docker,
            limits: config.limits.clone(),
            toolchain: config.toolchain.clone(),
            workspace_root: config.workspace_root.clone(),
        })
    }

    /// Fail fast when the daemon is unreachable
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon is not responding")?;
        Ok(())
    }

    /// Ensure the toolchain image is present locally, pulling it if needed.
    pub async fn ensure_image(&self) -> Result<()> {
        let image = self.toolchain.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = Box::pin(self.docker.create_image(options, None, None));
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull Docker image '{}'", image))?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    /// Compile and run one submission.
    ///
    /// `Ok` carries every program-level outcome (compile error, crash,
    /// timeout). `Err` means the sandbox itself could not do its job.
    #[tracing::instrument(skip(self, source, stdin), fields(source_bytes = source.len()))]
    pub async fn execute(&self, job_id: Uuid, source: &str, stdin: &str) -> Result<RawExecution> {
        let workspace = Workspace::prepare(self.workspace_root.as_deref(), source, stdin)?;
        debug!(workspace = %workspace.path().display(), "Workspace prepared");

        let result = self.execute_in(job_id, &workspace).await;
        workspace.release();
        result
    }

    async fn execute_in(&self, job_id: Uuid, workspace: &Workspace) -> Result<RawExecution> {
        let container = self.start_container(job_id, workspace, Phase::Compile).await?;
        let compiled = self.compile(&container.id).await;
        container.remove().await;
        let mut compile = compiled?;

        if compile.succeeded() && !workspace.binary_path().exists() {
            compile.diagnostics.push(b"Compiler produced no executable");
        }
        if !compile.succeeded() {
            debug!(exit_code = ?compile.exit_code, timed_out = compile.timed_out, "Compilation failed");
            return Ok(RawExecution::CompileFailed {
                compile,
                compile_timeout: self.limits.compile_timeout(),
            });
        }
        debug!(compile_ms = compile.elapsed.as_millis() as u64, "Compilation succeeded");

        let container = self.start_container(job_id, workspace, Phase::Run).await?;
        let ran = self.run(&container.id).await;
        container.remove().await;

        Ok(RawExecution::Ran { run: ran? })
    }

    async fn compile(&self, container_id: &str) -> Result<CompileCapture> {
        let cmd = self.toolchain.compile_command(SOURCE_FILE, BINARY_FILE);
        let capture = self
            .exec_with_timeout(container_id, cmd, self.limits.compile_timeout())
            .await
            .context("Compilation could not be executed")?;

        // Diagnostics go to stderr; some toolchains also print to stdout.
        let mut diagnostics = capture.stderr;
        if !capture.stdout.is_empty() {
            diagnostics.push(capture.stdout.as_bytes());
        }

        Ok(CompileCapture {
            exit_code: capture.exit_code,
            timed_out: capture.timed_out,
            diagnostics,
            elapsed: capture.elapsed,
        })
    }

    async fn run(&self, container_id: &str) -> Result<RunCapture> {
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("exec ./{} < {}", BINARY_FILE, INPUT_FILE),
        ];
        let capture = self
            .exec_with_timeout(container_id, cmd, self.limits.run_timeout())
            .await
            .context("Program could not be executed")?;

        let peak_memory_kb = if capture.timed_out {
            None
        } else {
            self.peak_memory_kb(container_id).await
        };

        if capture.stdout.dropped() > 0 || capture.stderr.dropped() > 0 {
            debug!(
                stdout_dropped = capture.stdout.dropped(),
                stderr_dropped = capture.stderr.dropped(),
                "Program output exceeded the capture limit"
            );
        }

        Ok(RunCapture {
            exit_code: capture.exit_code,
            timed_out: capture.timed_out,
            stdout: capture.stdout,
            stderr: capture.stderr,
            elapsed: capture.elapsed,
            peak_memory_kb,
        })
    }

    fn container_config(&self, job_id: Uuid, workspace: &Workspace, phase: Phase) -> Config<String> {
        let (lifetime, read_only) = match phase {
            Phase::Compile => (self.limits.compile_timeout(), false),
            Phase::Run => (self.limits.run_timeout(), true),
        };
        let keepalive_secs = (lifetime + KEEPALIVE_SLACK).as_secs();
        let memory = self.limits.memory_bytes();

        Config {
            image: Some(self.toolchain.image.clone()),
            entrypoint: Some(vec![]),
            cmd: Some(vec!["sleep".to_string(), keepalive_secs.to_string()]),
            working_dir: Some(SANDBOX_DIR.to_string()),
            user: Some(SANDBOX_USER.to_string()),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(JOB_LABEL.to_string(), job_id.to_string())])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(self.limits.nano_cpus()),
                pids_limit: Some(self.limits.pids_limit),
                ulimits: Some(vec![ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(self.limits.nofile_limit),
                    hard: Some(self.limits.nofile_limit),
                }]),
                binds: Some(vec![workspace.bind(read_only)]),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,exec,nosuid,size=64m".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn start_container(
        &self,
        job_id: Uuid,
        workspace: &Workspace,
        phase: Phase,
    ) -> Result<ContainerGuard> {
        let name = format!("codepad-{}-{}-{}", job_id, phase, &Uuid::new_v4().simple().to_string()[..8]);
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), self.container_config(job_id, workspace, phase))
            .await
            .with_context(|| format!("Failed to create {} container", phase))?;

        // Guard first, so a failed start still removes the container.
        let guard = ContainerGuard::new(&self.docker, created.id);

        if let Err(e) = self
            .docker
            .start_container(&guard.id, None::<StartContainerOptions<String>>)
            .await
        {
            guard.remove().await;
            return Err(e).with_context(|| format!("Failed to start {} container", phase));
        }

        debug!(container_id = %guard.id, phase = %phase, "Sandbox container started");
        Ok(guard)
    }

    /// Run `cmd` inside the container under a hard wall-clock limit.
    ///
    /// On expiry the whole container is SIGKILLed, which takes down every
    /// process the command spawned. Output captured until then is kept.
    async fn exec_with_timeout(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        limit: Duration,
    ) -> Result<ExecCapture> {
        let cap = self.limits.output_limit_bytes + 1;
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(SANDBOX_DIR.to_string()),
                    user: Some(SANDBOX_USER.to_string()),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut stdout = CappedBuffer::new(cap);
        let mut stderr = CappedBuffer::new(cap);
        let start_time = Instant::now();

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .context("Failed to start exec")?;

        let StartExecResults::Attached { mut output, .. } = started else {
            bail!("Exec did not attach to its output streams");
        };

        // The stream can close while the process keeps running (it may close
        // its own stdout/stderr), so the limit covers the exit as well.
        let finished = async {
            while let Some(frame) = output.next().await {
                match frame? {
                    LogOutput::StdOut { message } => stdout.push(&message),
                    LogOutput::StdErr { message } => stderr.push(&message),
                    _ => {}
                }
            }
            self.wait_for_exit(&exec.id).await
        };
        let outcome = tokio::time::timeout(limit, finished).await;
        let elapsed = start_time.elapsed();

        let exit_code = match outcome {
            Ok(Ok(exit_code)) => exit_code,
            Ok(Err(e)) => return Err(e).context("Lost track of the sandboxed process"),
            Err(_) => {
                warn!(
                    container_id = %container_id,
                    limit_ms = limit.as_millis() as u64,
                    "Wall-clock limit hit, killing sandbox"
                );
                let kill = KillContainerOptions { signal: "SIGKILL" };
                if let Err(e) = self.docker.kill_container(container_id, Some(kill)).await {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out sandbox");
                }
                return Ok(ExecCapture {
                    stdout,
                    stderr,
                    exit_code: None,
                    timed_out: true,
                    elapsed,
                });
            }
        };

        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code,
            timed_out: false,
            elapsed,
        })
    }

    /// Poll the exec until the daemon reports it stopped, then return its
    /// exit status. Unbounded; callers wrap it in their wall-clock limit.
    async fn wait_for_exit(&self, exec_id: &str) -> Result<Option<i64>, bollard::errors::Error> {
        loop {
            let inspect = self.docker.inspect_exec(exec_id).await?;
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Peak memory of the run container in KB, from cgroup accounting.
    ///
    /// cgroup v1 hosts report `max_usage` through the stats API; on cgroup v2
    /// the container's own `memory.peak` is read. Includes the container's
    /// keep-alive process. `None` when neither is available.
    async fn peak_memory_kb(&self, container_id: &str) -> Option<u64> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats = Box::pin(self.docker.stats(container_id, Some(options)));
        if let Some(Ok(stats)) = stats.next().await {
            if let Some(max_usage) = stats.memory_stats.max_usage.filter(|bytes| *bytes > 0) {
                return Some(max_usage / 1024);
            }
        }

        let probe = vec!["cat".to_string(), "/sys/fs/cgroup/memory.peak".to_string()];
        match self.exec_with_timeout(container_id, probe, MEMORY_PROBE_TIMEOUT).await {
            Ok(capture) if capture.exit_code == Some(0) => {
                parse_peak_bytes(capture.stdout.as_bytes()).map(|bytes| bytes / 1024)
            }
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Memory probe failed");
                None
            }
        }
    }
}

fn parse_peak_bytes(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}
