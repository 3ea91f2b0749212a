use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
        StartContainerOptions, UploadToContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::engine::sandbox::{
    ContainerHandle, ContainerSpec, ExecHandle, ExecOutput, SandboxRuntime, shell,
};

const PID_DIR: &str = "/tmp/.sandbox-exec";

pub struct DockerSandbox {
    docker: Docker,
    max_output_bytes: usize,
}

impl DockerSandbox {
    pub fn connect(max_output_bytes: usize) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to docker daemon")?;
        Ok(Self {
            docker,
            max_output_bytes,
        })
    }

    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image, "pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("failed to pull image {image}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxRuntime for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> anyhow::Result<ContainerHandle> {
        self.ensure_image(&spec.image).await?;

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes()),
            memory_swap: Some(spec.limits.memory_bytes()),
            nano_cpus: Some(spec.limits.nano_cpus()),
            pids_limit: Some(spec.limits.max_processes),
            auto_remove: Some(spec.auto_remove),
            network_mode: spec.network_disabled.then(|| "none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(spec.labels.clone()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(spec.network_disabled),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("failed to create container {}", spec.name))?;
        Ok(ContainerHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("failed to start container {}", container.name))
    }

    async fn put_archive(
        &self,
        container: &ContainerHandle,
        path: &str,
        payload: Vec<u8>,
    ) -> anyhow::Result<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(&container.id, Some(options), Bytes::from(payload))
            .await
            .with_context(|| format!("failed to upload archive to {}", container.name))
    }

    async fn create_exec(
        &self,
        container: &ContainerHandle,
        command: &[String],
    ) -> anyhow::Result<ExecHandle> {
        let pid_file = format!("{PID_DIR}/{}.pid", Uuid::new_v4().simple());
        // The wrapper records its pid and then execs the command in place, so
        // the recorded pid is the command itself.
        let mut cmd = shell(format!(
            "mkdir -p {PID_DIR} && echo $$ > {pid_file} && exec \"$@\""
        ));
        cmd.push("sh".to_string());
        cmd.extend(command.iter().cloned());

        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(&container.id, options)
            .await
            .with_context(|| format!("failed to create exec in {}", container.name))?;
        Ok(ExecHandle {
            id: created.id,
            pid_file,
        })
    }

    async fn run_exec(
        &self,
        container: &ContainerHandle,
        exec: &ExecHandle,
        stdin: Option<&str>,
    ) -> anyhow::Result<ExecOutput> {
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .with_context(|| format!("failed to start exec in {}", container.name))?;

        let StartExecResults::Attached { mut output, mut input } = started else {
            anyhow::bail!("exec in {} started detached", container.name);
        };

        let stdin_bytes = stdin.unwrap_or_default().as_bytes().to_vec();
        tokio::spawn(async move {
            if !stdin_bytes.is_empty() {
                let _ = input.write_all(&stdin_bytes).await;
            }
            let _ = input.shutdown().await;
        });

        let limit = self.max_output_bytes;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = output.next().await {
            match chunk.context("exec output stream failed")? {
                LogOutput::StdOut { message } => append_limited(&mut stdout, &message, limit),
                LogOutput::StdErr { message } => append_limited(&mut stderr, &message, limit),
                LogOutput::Console { message } => append_limited(&mut stdout, &message, limit),
                LogOutput::StdIn { .. } => {}
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("failed to inspect finished exec")?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn kill_exec(&self, container: &ContainerHandle, exec: &ExecHandle) -> anyhow::Result<()> {
        let inspected = self.docker.inspect_exec(&exec.id).await?;
        if inspected.running == Some(false) {
            return Ok(());
        }

        let pid_file = &exec.pid_file;
        let script = format!(
            concat!(
                "pid=$(cat {pid_file} 2>/dev/null) || exit 0; ",
                "for p in /proc/[0-9]*; do ",
                "ppid=$(awk '/^PPid:/ {{print $2}}' \"$p/status\" 2>/dev/null); ",
                "[ \"$ppid\" = \"$pid\" ] && kill -KILL \"${{p#/proc/}}\" 2>/dev/null; ",
                "done; ",
                "kill -KILL \"$pid\" 2>/dev/null; rm -f {pid_file}; exit 0"
            ),
            pid_file = pid_file
        );
        let killer = self.create_exec(container, &shell(script)).await?;
        let output = self.run_exec(container, &killer, None).await?;
        if !output.success() {
            anyhow::bail!(
                "kill of exec {} exited with status {}",
                exec.id,
                output.exit_code
            );
        }
        Ok(())
    }

    async fn remove(&self, container: &ContainerHandle) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&container.id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            // auto-removed containers may already be gone
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove container {}", container.name))
            }
        }
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<ContainerHandle>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .context("failed to list containers")?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .next()
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                Some(ContainerHandle { id, name })
            })
            .filter(|handle| handle.name.starts_with(prefix))
            .collect())
    }
}

fn append_limited(out: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    if out.len() < limit {
        let remaining = limit - out.len();
        out.extend_from_slice(&chunk[..remaining.min(chunk.len())]);
    }
}

#[cfg(test)]
mod tests {
    use super::append_limited;

    #[test]
    fn output_is_capped_per_stream() {
        let mut out = Vec::new();
        append_limited(&mut out, b"hello", 8);
        append_limited(&mut out, b"world", 8);
        append_limited(&mut out, b"again", 8);
        assert_eq!(out, b"hellowor");
    }
}
