mod docker;
#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::engine::models::ContainerLimits;

pub use docker::DockerSandbox;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub limits: ContainerLimits,
    pub network_disabled: bool,
    pub auto_remove: bool,
    pub working_dir: String,
}

/// One command created inside a container. `pid_file` is where the command
/// records its own pid so it can be terminated without guessing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    pub id: String,
    pub pid_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability surface of the container runtime. The pool and the
/// orchestrator depend on nothing else.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle>;

    async fn start(&self, container: &ContainerHandle) -> anyhow::Result<()>;

    /// Extracts a tar `payload` into `path` inside the container.
    async fn put_archive(
        &self,
        container: &ContainerHandle,
        path: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()>;

    async fn create_exec(
        &self,
        container: &ContainerHandle,
        command: &[String],
    ) -> anyhow::Result<ExecHandle>;

    /// Starts a created exec, feeds `stdin` (then EOF) and waits for it to exit.
    async fn run_exec(
        &self,
        container: &ContainerHandle,
        exec: &ExecHandle,
        stdin: Option<&str>,
    ) -> anyhow::Result<ExecOutput>;

    async fn kill_exec(&self, container: &ContainerHandle, exec: &ExecHandle) -> anyhow::Result<()>;

    async fn remove(&self, container: &ContainerHandle) -> anyhow::Result<()>;

    /// Containers (running or not) whose name starts with `prefix`.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<ContainerHandle>>;

    async fn exec(
        &self,
        container: &ContainerHandle,
        command: &[String],
        stdin: Option<&str>,
    ) -> anyhow::Result<ExecOutput> {
        let exec = self.create_exec(container, command).await?;
        self.run_exec(container, &exec, stdin).await
    }
}

pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}
