//! Scripted in-memory runtime for tests.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::engine::sandbox::{
    ContainerHandle, ContainerSpec, ExecHandle, ExecOutput, SandboxRuntime,
};

pub enum MockReply {
    Output {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: i64,
    },
    Hang,
    Fail(String),
}

impl MockReply {
    pub fn ok(stdout: &str) -> Self {
        Self::Output {
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }

    pub fn exit(code: i64, stderr: &str) -> Self {
        Self::Output {
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            exit_code: code,
        }
    }
}

type Script = Box<dyn Fn(&[String], Option<&str>) -> MockReply + Send + Sync>;

#[derive(Default)]
struct MockState {
    live: HashMap<String, ContainerSpec>,
    created: Vec<ContainerHandle>,
    removed: Vec<String>,
    uploads: Vec<(String, String, Vec<u8>)>,
    execs: HashMap<String, Vec<String>>,
    commands: Vec<Vec<String>>,
    killed: Vec<String>,
}

pub struct MockRuntime {
    script: Script,
    state: Mutex<MockState>,
    next_id: AtomicU64,
    fail_create: AtomicBool,
    fail_kill: AtomicBool,
    fail_upload: AtomicBool,
    create_delay: Mutex<Duration>,
    kill_delay: Mutex<Duration>,
}

impl MockRuntime {
    /// Every command succeeds with empty output.
    pub fn new() -> Self {
        Self::scripted(|_, _| MockReply::ok(""))
    }

    pub fn scripted(
        script: impl Fn(&[String], Option<&str>) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            fail_kill: AtomicBool::new(false),
            fail_upload: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
            kill_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// A container left behind by a previous process.
    pub fn seed_container(&self, name: &str) -> ContainerHandle {
        let handle = ContainerHandle {
            id: format!("seed-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            name: name.to_string(),
        };
        let spec = ContainerSpec {
            name: name.to_string(),
            image: "leftover".to_string(),
            labels: HashMap::new(),
            limits: crate::engine::config::PoolConfig::default().limits,
            network_disabled: true,
            auto_remove: true,
            working_dir: "/".to_string(),
        };
        self.lock().live.insert(handle.id.clone(), spec);
        handle
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_kills(&self, fail: bool) {
        self.fail_kill.store(fail, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_upload.store(fail, Ordering::SeqCst);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_kill_delay(&self, delay: Duration) {
        *self.kill_delay.lock().unwrap() = delay;
    }

    pub fn created(&self) -> Vec<ContainerHandle> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.lock().uploads.clone()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.lock().commands.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.lock().killed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("image {} not available", spec.image);
        }
        let handle = ContainerHandle {
            id: format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
            name: spec.name.clone(),
        };
        let mut state = self.lock();
        state.live.insert(handle.id.clone(), spec.clone());
        state.created.push(handle.clone());
        Ok(handle)
    }

    async fn start(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        if !self.lock().live.contains_key(&container.id) {
            anyhow::bail!("no such container {}", container.id);
        }
        Ok(())
    }

    async fn put_archive(
        &self,
        container: &ContainerHandle,
        path: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        if self.fail_upload.load(Ordering::SeqCst) {
            anyhow::bail!("archive rejected by {}", container.id);
        }
        self.lock()
            .uploads
            .push((container.id.clone(), path.to_string(), payload));
        Ok(())
    }

    async fn create_exec(
        &self,
        container: &ContainerHandle,
        command: &[String],
    ) -> anyhow::Result<ExecHandle> {
        let id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.lock();
        if !state.live.contains_key(&container.id) {
            anyhow::bail!("no such container {}", container.id);
        }
        state.execs.insert(id.clone(), command.to_vec());
        state.commands.push(command.to_vec());
        Ok(ExecHandle {
            pid_file: format!("/tmp/{id}.pid"),
            id,
        })
    }

    async fn run_exec(
        &self,
        _container: &ContainerHandle,
        exec: &ExecHandle,
        stdin: Option<&str>,
    ) -> anyhow::Result<ExecOutput> {
        let command = self
            .lock()
            .execs
            .get(&exec.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown exec {}", exec.id))?;
        match (self.script)(&command, stdin) {
            MockReply::Output {
                stdout,
                stderr,
                exit_code,
            } => Ok(ExecOutput {
                stdout,
                stderr,
                exit_code,
            }),
            MockReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                anyhow::bail!("hung exec {} was never killed", exec.id)
            }
            MockReply::Fail(message) => anyhow::bail!(message),
        }
    }

    async fn kill_exec(&self, _container: &ContainerHandle, exec: &ExecHandle) -> anyhow::Result<()> {
        let delay = *self.kill_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_kill.load(Ordering::SeqCst) {
            anyhow::bail!("kill refused for {}", exec.id);
        }
        self.lock().killed.push(exec.id.clone());
        Ok(())
    }

    async fn remove(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.live.remove(&container.id);
        state.removed.push(container.id.clone());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<ContainerHandle>> {
        Ok(self
            .lock()
            .live
            .iter()
            .filter(|(_, spec)| spec.name.starts_with(prefix))
            .map(|(id, spec)| ContainerHandle {
                id: id.clone(),
                name: spec.name.clone(),
            })
            .collect())
    }
}

pub fn mentions(command: &[String], needle: &str) -> bool {
    command.iter().any(|arg| arg.contains(needle))
}
