use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::Instrument;
use uuid::Uuid;

use crate::engine::{
    config::EngineConfig,
    error::EngineError,
    language::{LanguageProfile, LanguageRegistry, WORKSPACE_DIR},
    metrics::MetricsRegistry,
    models::ExecutionResponse,
    packager::package,
    pool::{ContainerLease, ContainerPool},
    sandbox::{ContainerHandle, ExecHandle, ExecOutput, SandboxRuntime, shell},
    sanitize::sanitize,
};

const OOM_EXIT_CODE: i64 = 137;
/// Kills every process in the container except init and the calling shell,
/// including daemons the program detached from its own process tree.
const PROCESS_SWEEP: &str = "kill -9 -1 2>/dev/null; exit 0";

pub struct Orchestrator {
    registry: Arc<LanguageRegistry>,
    pool: Arc<ContainerPool>,
    runtime: Arc<dyn SandboxRuntime>,
    metrics: Arc<MetricsRegistry>,
    run_timeout: Duration,
    compile_timeout: Duration,
    cleanup_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        pool: Arc<ContainerPool>,
        runtime: Arc<dyn SandboxRuntime>,
        metrics: Arc<MetricsRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            runtime,
            metrics,
            run_timeout: config.run_timeout,
            compile_timeout: config.compile_timeout,
            cleanup_timeout: config.cleanup_timeout,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.pool
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Runs `code` once in a pooled container of `language`, feeding `input`
    /// on stdin. The container is always cleaned and released before this
    /// returns.
    pub async fn execute(
        &self,
        language: &str,
        code: &str,
        input: &str,
    ) -> Result<ExecutionResponse, EngineError> {
        let profile = match self.registry.lookup_tag(language) {
            Ok(profile) => profile,
            Err(err) => {
                self.metrics.rejected();
                tracing::info!(language, "rejected unsupported language");
                return Err(err);
            }
        };

        let execution_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "execution",
            %execution_id,
            language = %profile.language
        );
        async move {
            let started = Instant::now();
            let result = self.execute_with_profile(profile, execution_id, code, input).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(_) => {
                    self.metrics.execution(profile.language, "ok");
                    tracing::info!(elapsed_ms, "execution finished");
                }
                Err(err) => {
                    self.metrics.execution(profile.language, err.kind());
                    tracing::info!(elapsed_ms, outcome = err.kind(), "execution failed");
                }
            }
            result.map(|output| ExecutionResponse { output })
        }
        .instrument(span)
        .await
    }

    async fn execute_with_profile(
        &self,
        profile: &LanguageProfile,
        execution_id: Uuid,
        code: &str,
        input: &str,
    ) -> Result<String, EngineError> {
        let mut lease = self.pool.acquire(profile).await?;
        tracing::debug!(container = %lease.handle().name, "container acquired");

        let mut pending = None;
        let result = self
            .run_steps(lease.handle(), profile, execution_id, code, input, &mut pending)
            .await;

        self.cleanup(&mut lease, pending).await;
        self.pool.release(lease);
        result
    }

    async fn run_steps(
        &self,
        container: &ContainerHandle,
        profile: &LanguageProfile,
        execution_id: Uuid,
        code: &str,
        input: &str,
        pending: &mut Option<ExecHandle>,
    ) -> Result<String, EngineError> {
        let filename = profile.filename_for(code, &execution_id);
        let source = profile.prepare_source(code);
        let archive = package(&source, &filename)?;
        self.runtime
            .put_archive(container, WORKSPACE_DIR, archive)
            .await
            .map_err(|err| EngineError::UploadFailed(format!("{err:#}")))?;
        tracing::debug!(filename, "source uploaded");

        if let Some(command) = profile.compile_command(&filename) {
            let Some(output) = self
                .tracked_exec(container, &command, None, self.compile_timeout, pending)
                .await?
            else {
                return Err(EngineError::CompilationFailed(
                    "compilation timed out".to_string(),
                ));
            };
            if !output.success() {
                return Err(EngineError::CompilationFailed(diagnostics(&output)));
            }
            tracing::debug!("compilation succeeded");
        }

        let command = profile.run_command(&filename);
        let Some(output) = self
            .tracked_exec(container, &command, Some(input), self.run_timeout, pending)
            .await?
        else {
            tracing::info!(
                timeout_ms = self.run_timeout.as_millis() as u64,
                "run timed out"
            );
            return Err(EngineError::TimedOut(self.run_timeout));
        };

        if output.success() {
            Ok(sanitize(&output.stdout))
        } else if output.exit_code == OOM_EXIT_CODE && sanitize(&output.stderr).is_empty() {
            Err(EngineError::RuntimeFailed(
                "killed: memory or process limit exceeded".to_string(),
            ))
        } else {
            Err(EngineError::RuntimeFailed(diagnostics(&output)))
        }
    }

    /// Runs one exec against `limit`. `None` means the limit elapsed. The exec
    /// stays in `pending` unless it finished, and cleanup kills it.
    async fn tracked_exec(
        &self,
        container: &ContainerHandle,
        command: &[String],
        stdin: Option<&str>,
        limit: Duration,
        pending: &mut Option<ExecHandle>,
    ) -> Result<Option<ExecOutput>, EngineError> {
        let exec = self
            .runtime
            .create_exec(container, command)
            .await
            .map_err(|err| EngineError::Sandbox(format!("{err:#}")))?;
        *pending = Some(exec.clone());

        match tokio::time::timeout(limit, self.runtime.run_exec(container, &exec, stdin)).await {
            Ok(Ok(output)) => {
                *pending = None;
                Ok(Some(output))
            }
            Ok(Err(err)) => Err(EngineError::Sandbox(format!("{err:#}"))),
            Err(_) => Ok(None),
        }
    }

    /// Kills the unfinished exec, sweeps every leftover process and wipes the
    /// workspace, each step bounded by the cleanup timeout. On any failure the
    /// container is discarded instead of returning to idle.
    async fn cleanup(&self, lease: &mut ContainerLease, pending: Option<ExecHandle>) {
        let container = lease.handle().clone();
        let limit = self.cleanup_timeout;
        let mut failures = Vec::new();

        if let Some(exec) = pending {
            match tokio::time::timeout(limit, self.runtime.kill_exec(&container, &exec)).await {
                Ok(Ok(())) => tracing::debug!(exec = %exec.id, "unfinished exec killed"),
                Ok(Err(err)) => failures.push(EngineError::CleanupFailed(format!(
                    "kill of exec {}: {err:#}",
                    exec.id
                ))),
                Err(_) => failures.push(EngineError::CleanupFailed(format!(
                    "kill of exec {} timed out",
                    exec.id
                ))),
            }
        }

        let wipe = format!("rm -rf {WORKSPACE_DIR}/* {WORKSPACE_DIR}/.[!.]* /tmp/.sandbox-exec");
        let steps = [("process sweep", PROCESS_SWEEP), ("workspace wipe", wipe.as_str())];
        for (step, script) in steps {
            let command = shell(script);
            match tokio::time::timeout(limit, self.runtime.exec(&container, &command, None)).await {
                Ok(Ok(output)) if output.success() => {}
                Ok(Ok(output)) => failures.push(EngineError::CleanupFailed(format!(
                    "{step} exited with status {}",
                    output.exit_code
                ))),
                Ok(Err(err)) => {
                    failures.push(EngineError::CleanupFailed(format!("{step}: {err:#}")))
                }
                Err(_) => failures.push(EngineError::CleanupFailed(format!("{step} timed out"))),
            }
        }

        if failures.is_empty() {
            return;
        }
        for failure in &failures {
            self.metrics.cleanup_failed();
            tracing::warn!(container = %container.name, error = %failure, "sandbox cleanup failed");
        }
        lease.discard();
    }
}

/// Diagnostic text of a failed exec: stderr, else stdout, else the status.
fn diagnostics(output: &ExecOutput) -> String {
    [&output.stderr, &output.stdout]
        .into_iter()
        .map(|stream| sanitize(stream))
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| format!("exited with status {}", output.exit_code))
}
