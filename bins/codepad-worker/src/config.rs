// Worker configuration: sandbox limits, toolchain and scheduling knobs.
// Everything is process-wide and read once at start-up; nothing here is
// overridable per job.
use anyhow::{bail, Result};
use codepad_common::config::{parse_or, BrokerConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Extra lease time on top of the compile and run limits, covering container
/// creation, teardown and result publication.
const LEASE_GRACE: Duration = Duration::from_secs(60);

/// Resource ceilings applied to every execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxLimits {
    pub run_timeout_ms: u64,
    pub compile_timeout_ms: u64,
    pub memory_limit_mb: u64,
    pub cpu_limit: f64,
    pub pids_limit: i64,
    pub nofile_limit: i64,
    pub output_limit_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            run_timeout_ms: 2_000,
            compile_timeout_ms: 15_000,
            memory_limit_mb: 256,
            cpu_limit: 1.0,
            pids_limit: 50,
            nofile_limit: 100,
            output_limit_bytes: 50 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit * 1_000_000_000.0) as i64
    }
}

/// The fixed compiler invocation. Submitted code cannot change any of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toolchain {
    pub image: String,
    pub compiler: String,
    pub flags: Vec<String>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            image: "gcc:13".to_string(),
            compiler: "g++".to_string(),
            flags: ["-std=c++20", "-O2", "-pipe"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Toolchain {
    /// Full compile command line, run inside the sandbox working directory
    pub fn compile_command(&self, source: &str, binary: &str) -> Vec<String> {
        let mut cmd = vec![self.compiler.clone()];
        cmd.extend(self.flags.iter().cloned());
        cmd.extend(["-o".to_string(), binary.to_string(), source.to_string()]);
        cmd
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerConfig {
    #[serde(skip)]
    pub broker: BrokerConfig,
    pub worker_name: String,
    pub concurrency: usize,
    pub limits: SandboxLimits,
    pub toolchain: Toolchain,
    /// Parent directory for per-job workspaces; must be visible to the Docker daemon
    pub workspace_root: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub reap_interval_secs: u64,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker = BrokerConfig::from_lookup(&lookup)?;
        let defaults = SandboxLimits::default();
        let limits = SandboxLimits {
            run_timeout_ms: parse_or(&lookup, "RUN_TIMEOUT_MS", defaults.run_timeout_ms)?,
            compile_timeout_ms: parse_or(&lookup, "COMPILE_TIMEOUT_MS", defaults.compile_timeout_ms)?,
            memory_limit_mb: parse_or(&lookup, "MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            cpu_limit: parse_or(&lookup, "CPU_LIMIT", defaults.cpu_limit)?,
            pids_limit: parse_or(&lookup, "PIDS_LIMIT", defaults.pids_limit)?,
            nofile_limit: parse_or(&lookup, "NOFILE_LIMIT", defaults.nofile_limit)?,
            output_limit_bytes: parse_or(&lookup, "OUTPUT_LIMIT_BYTES", defaults.output_limit_bytes)?,
        };

        let default_toolchain = Toolchain::default();
        let toolchain = Toolchain {
            image: lookup("SANDBOX_IMAGE").unwrap_or(default_toolchain.image),
            compiler: lookup("COMPILER").unwrap_or(default_toolchain.compiler),
            flags: lookup("COMPILE_FLAGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or(default_toolchain.flags),
        };

        let worker_name = lookup("WORKER_NAME").unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("worker-{}-{}", std::process::id(), &suffix[..8])
        });

        let config = Self {
            broker,
            worker_name,
            concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", 1usize)?,
            limits,
            toolchain,
            workspace_root: lookup("WORKSPACE_ROOT").map(PathBuf::from),
            poll_interval_ms: parse_or(&lookup, "POLL_INTERVAL_MS", 250u64)?,
            reap_interval_secs: parse_or(&lookup, "REAP_INTERVAL_SECS", 15u64)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if self.concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if limits.run_timeout_ms == 0 || limits.compile_timeout_ms == 0 {
            bail!("RUN_TIMEOUT_MS and COMPILE_TIMEOUT_MS must be positive");
        }
        if limits.memory_limit_mb < 16 {
            bail!("MEMORY_LIMIT_MB must be at least 16, got {}", limits.memory_limit_mb);
        }
        if !(limits.cpu_limit > 0.0) {
            bail!("CPU_LIMIT must be positive, got {}", limits.cpu_limit);
        }
        if limits.pids_limit < 1 || limits.nofile_limit < 1 {
            bail!("PIDS_LIMIT and NOFILE_LIMIT must be positive");
        }
        if limits.output_limit_bytes < 1024 {
            bail!("OUTPUT_LIMIT_BYTES must be at least 1024, got {}", limits.output_limit_bytes);
        }
        if self.toolchain.compiler.trim().is_empty() {
            bail!("COMPILER must not be empty");
        }
        if self.poll_interval_ms == 0 || self.reap_interval_secs == 0 {
            bail!("POLL_INTERVAL_MS and REAP_INTERVAL_SECS must be positive");
        }
        Ok(())
    }

    /// How long a claim stays valid before the job is considered stalled
    pub fn lease(&self) -> Duration {
        self.limits.compile_timeout() + self.limits.run_timeout() + LEASE_GRACE
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}
