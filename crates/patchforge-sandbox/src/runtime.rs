//! Container runtime capability.
//!
//! The harness never assumes a specific container engine; it drives this
//! trait. [`DockerCliRuntime`] implements it by shelling out to the
//! `docker` binary, and [`MockRuntime`] provides a scripted double that
//! records every call for lifecycle assertions in tests.
//!
//! Operations against different containers are safe concurrently; the
//! docker implementation serializes operations against the same
//! container with a per-container mutex.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};

/// Label marking containers as harness-managed.
pub const MANAGED_LABEL: &str = "platform=digital-twin";

/// Request to start one sandbox container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    /// CPU limit in cores.
    pub cpu_limit: f64,
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// When true, the container gets no outbound network. Only roles
    /// whose health checks need outbound probes run attached.
    pub network_isolated: bool,
    /// Environment variables visible inside the sandbox.
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: &str, name: &str) -> Self {
        let mut labels = BTreeMap::new();
        let (key, value) = MANAGED_LABEL.split_once('=').expect("managed label is k=v");
        labels.insert(key.to_string(), value.to_string());

        Self {
            image: image.to_string(),
            name: name.to_string(),
            labels,
            cpu_limit: 2.0,
            memory_mb: 4096,
            network_isolated: true,
            env: BTreeMap::new(),
        }
    }

    pub fn with_network(mut self) -> Self {
        self.network_isolated = false;
        self
    }

    pub fn with_limits(mut self, cpu_limit: f64, memory_mb: u64) -> Self {
        self.cpu_limit = cpu_limit;
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

/// Demuxed output of one in-container command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Generic container runtime capability.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a container from the spec; returns the container id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Run a shell command inside the container.
    async fn exec(&self, container_id: &str, command: &str) -> Result<ExecOutput>;

    /// Write `content` to `path` inside the container with the given
    /// octal mode.
    async fn copy_content(
        &self,
        container_id: &str,
        path: &str,
        content: &str,
        mode: u32,
    ) -> Result<()>;

    /// Tail of the container's log stream.
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;

    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Remove the container and its volumes. Must succeed on an already
    /// stopped container.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Ids of running containers carrying the managed label.
    async fn list_managed(&self) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Docker CLI implementation
// ---------------------------------------------------------------------------

/// Runtime backed by the `docker` command-line client.
pub struct DockerCliRuntime {
    docker_bin: String,
    /// Per-container exec serialization.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCliRuntime {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn container_lock(&self, container_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(container_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn run_docker(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!("docker {}", args.join(" "));
        Command::new(&self.docker_bin)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker: {e}")))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        let cpus = format!("{}", spec.cpu_limit);
        let memory = format!("{}m", spec.memory_mb);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--cpus".into(),
            cpus,
            "--memory".into(),
            memory,
        ];
        if spec.network_isolated {
            args.push("--network".into());
            args.push("none".into());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());
        // Keep the container alive until the harness tears it down.
        args.extend(["/bin/sh".into(), "-c".into(), "while true; do sleep 3600; done".into()]);

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run_docker(&arg_refs).await?;

        if !output.status.success() {
            return Err(SandboxError::Runtime(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("started sandbox container {} from {}", &container_id[..12.min(container_id.len())], spec.image);
        Ok(container_id)
    }

    async fn exec(&self, container_id: &str, command: &str) -> Result<ExecOutput> {
        let lock = self.container_lock(container_id).await;
        let _guard = lock.lock().await;

        let started = Instant::now();
        let output = self
            .run_docker(&["exec", container_id, "/bin/sh", "-c", command])
            .await?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn copy_content(
        &self,
        container_id: &str,
        path: &str,
        content: &str,
        mode: u32,
    ) -> Result<()> {
        let lock = self.container_lock(container_id).await;
        let _guard = lock.lock().await;

        let command = format!("cat > {path} && chmod {mode:o} {path}");
        let mut child = Command::new(&self.docker_bin)
            .args(["exec", "-i", container_id, "/bin/sh", "-c", &command])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SandboxError::Runtime(format!("failed to run docker exec: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| SandboxError::Runtime(format!("failed to stream content: {e}")))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::Runtime(format!("docker exec wait failed: {e}")))?;

        if !output.status.success() {
            return Err(SandboxError::Runtime(format!(
                "copy to {path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let output = self
            .run_docker(&["logs", "--tail", &tail.to_string(), container_id])
            .await?;
        let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let output = self.run_docker(&["stop", "-t", "5", container_id]).await?;
        if !output.status.success() {
            warn!(
                "docker stop failed for {}: {}",
                container_id,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let output = self
            .run_docker(&["rm", "-f", "-v", container_id])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::Runtime(format!(
                "docker rm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("removed sandbox container {}", &container_id[..12.min(container_id.len())]);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        let filter = format!("label={MANAGED_LABEL}");
        let output = self.run_docker(&["ps", "-aq", "--filter", &filter]).await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Mock implementation for tests
// ---------------------------------------------------------------------------

/// Scripted runtime double.
///
/// Records every call in a ledger, tracks live containers, and can be
/// programmed to fail specific operations or answer specific exec
/// commands. The ledger is what lifecycle tests assert against.
#[derive(Default)]
pub struct MockRuntime {
    ledger: std::sync::Mutex<Vec<String>>,
    live: std::sync::Mutex<Vec<String>>,
    fail_start: bool,
    fail_exec_containing: Option<String>,
    /// Delay execs whose command contains the needle; used to exercise
    /// timeout and cancellation paths.
    exec_delay: Option<(String, std::time::Duration)>,
    /// Substring-keyed canned outputs, first match wins.
    responses: Vec<(String, ExecOutput)>,
    counter: std::sync::atomic::AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Fail any exec whose command contains `needle`.
    pub fn with_exec_failure(mut self, needle: &str) -> Self {
        self.fail_exec_containing = Some(needle.to_string());
        self
    }

    /// Sleep before answering any exec whose command contains `needle`.
    pub fn with_exec_delay(mut self, needle: &str, delay: std::time::Duration) -> Self {
        self.exec_delay = Some((needle.to_string(), delay));
        self
    }

    /// Answer any exec whose command contains `needle` with `output`.
    pub fn with_response(mut self, needle: &str, output: ExecOutput) -> Self {
        self.responses.push((needle.to_string(), output));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.ledger.lock().expect("ledger poisoned").clone()
    }

    pub fn live_containers(&self) -> Vec<String> {
        self.live.lock().expect("live list poisoned").clone()
    }

    fn record(&self, call: String) {
        self.ledger.lock().expect("ledger poisoned").push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("start:{}", spec.image));
        if self.fail_start {
            return Err(SandboxError::Runtime("image pull failed".to_string()));
        }
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let id = format!("mock-container-{n}");
        self.live.lock().expect("live list poisoned").push(id.clone());
        Ok(id)
    }

    async fn exec(&self, container_id: &str, command: &str) -> Result<ExecOutput> {
        self.record(format!("exec:{container_id}:{command}"));

        if let Some((needle, delay)) = &self.exec_delay {
            if command.contains(needle.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }

        if let Some(needle) = &self.fail_exec_containing {
            if command.contains(needle.as_str()) {
                return Err(SandboxError::Runtime(format!(
                    "exec failed on command containing '{needle}'"
                )));
            }
        }

        for (needle, output) in &self.responses {
            if command.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }

        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        })
    }

    async fn copy_content(
        &self,
        container_id: &str,
        path: &str,
        _content: &str,
        _mode: u32,
    ) -> Result<()> {
        self.record(format!("copy:{container_id}:{path}"));
        Ok(())
    }

    async fn logs(&self, container_id: &str, _tail: usize) -> Result<String> {
        self.record(format!("logs:{container_id}"));
        Ok("mock container logs".to_string())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        self.record(format!("stop:{container_id}"));
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.record(format!("remove:{container_id}"));
        self.live
            .lock()
            .expect("live list poisoned")
            .retain(|id| id != container_id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        Ok(self.live_containers())
    }
}
