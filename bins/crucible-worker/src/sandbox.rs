// Thin adapter over the Docker API: pull, create/start, stage files,
// exec with a hard timeout, liveness probe, removal, enumeration.
// Knows nothing about pooling, test cases, or scoring.

use crate::errors::SandboxError;
use crate::languages::WORKDIR;
use anyhow::Context;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use crucible_common::config::DockerConfig;
use futures_util::stream::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Removing a stale staged file never runs user code, so it gets a
/// short fixed budget instead of the configured execution timeout.
const FILE_REMOVAL_TIMEOUT_MS: u64 = 5_000;

pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: String,
    pub elapsed_ms: u64,
}

#[derive(Clone)]
pub struct SandboxRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl SandboxRuntime {
    pub fn connect(config: DockerConfig) -> anyhow::Result<Self> {
        let docker = match &config.socket_path {
            Some(socket) => Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
                .context("Failed to connect to Docker socket")?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
        };
        Ok(Self { docker, config })
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon not responding")?;
        Ok(())
    }

    /// Ensure an image is available locally, pulling it if missing.
    /// Idempotent.
    pub async fn pull_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "image already present");
            return Ok(());
        }

        info!(image = %image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                source: e,
            })?;
        }

        info!(image = %image, "image pulled");
        Ok(())
    }

    /// Create and start a sandbox: no network, scratch directory bound
    /// read-write at the working path, memory and swap capped, CPU
    /// quota over a fixed period, pids limit, no privilege escalation.
    /// The tty keeps the container alive between execs.
    pub async fn create_and_start(&self, image: &str, name: &str) -> Result<String, SandboxError> {
        let binds = vec![format!("{}:{}", self.config.scratch_dir.display(), WORKDIR)];

        let config = Config {
            image: Some(image.to_string()),
            working_dir: Some(WORKDIR.to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(self.config.memory_limit_bytes),
                memory_swap: Some(self.config.memory_limit_bytes),
                cpu_period: Some(self.config.cpu_period),
                cpu_quota: Some(self.config.cpu_quota),
                pids_limit: Some(self.config.pids_limit),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                binds: Some(binds),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name,
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(SandboxError::Create)?;

        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(SandboxError::Create)?;

        Ok(container.id)
    }

    /// Write named byte buffers into the sandbox working directory as
    /// one atomic tar transfer.
    pub async fn stage_files(
        &self,
        handle: &str,
        files: &[(String, &[u8])],
    ) -> Result<(), SandboxError> {
        let archive = build_archive(files)?;

        let options = UploadToContainerOptions {
            path: WORKDIR.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(handle, Some(options), Bytes::from(archive).into())
            .await
            .map_err(|e| SandboxError::Stage(Box::new(e)))?;

        Ok(())
    }

    /// Run a command inside the sandbox and collect the combined
    /// output stream. The timeout is hard: on expiry the stream is
    /// dropped and `ExecutionTimeout` returned; the sandbox itself is
    /// left running for the next test case.
    pub async fn exec(
        &self,
        handle: &str,
        cmd: Vec<String>,
        timeout_ms: u64,
    ) -> Result<ExecOutput, SandboxError> {
        let start = Instant::now();

        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(SandboxError::Exec)?;

        let collect = async {
            let mut output = String::new();
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
                .map_err(SandboxError::Exec)?;

            if let StartExecResults::Attached {
                output: mut stream, ..
            } = started
            {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::StdErr { message })
                        | Ok(LogOutput::Console { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(SandboxError::Exec(e)),
                    }
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(SandboxError::Exec)?;

            Ok((output, inspect.exit_code))
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), collect).await {
            Ok(Ok((output, exit_code))) => Ok(ExecOutput {
                exit_code,
                output,
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SandboxError::ExecutionTimeout { timeout_ms }),
        }
    }

    /// Delete a staged file from the sandbox working directory.
    pub async fn remove_file(&self, handle: &str, file_name: &str) -> Result<(), SandboxError> {
        let cmd = vec![
            "rm".to_string(),
            "-f".to_string(),
            format!("{}/{}", WORKDIR, file_name),
        ];
        self.exec(handle, cmd, FILE_REMOVAL_TIMEOUT_MS).await?;
        Ok(())
    }

    /// Liveness probe; any inspection failure counts as not running.
    pub async fn inspect_running(&self, handle: &str) -> bool {
        match self.docker.inspect_container(handle, None).await {
            Ok(details) => details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Force-remove a sandbox. Idempotent: a sandbox that is already
    /// gone is not an error.
    pub async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = %name, "sandbox already removed");
                Ok(())
            }
            Err(e) => Err(SandboxError::Remove {
                name: name.to_string(),
                source: e,
            }),
        }
    }

    /// Names of all containers (running or not) whose name carries the
    /// given prefix. Used to purge sandboxes orphaned by a crash.
    pub async fn list_all(&self, name_prefix: &str) -> Result<Vec<String>, SandboxError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(SandboxError::List)?;

        let mut names = Vec::new();
        for container in containers {
            for name in container.names.unwrap_or_default() {
                // the daemon reports names with a leading slash
                let name = name.trim_start_matches('/');
                if name.starts_with(name_prefix) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Delete a staged file from the host scratch directory. The
    /// scratch dir is bind-mounted into every sandbox, so uploads land
    /// here too. Best effort.
    pub async fn remove_scratch_file(&self, file_name: &str) {
        let path = self.config.scratch_dir.join(file_name);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove scratch file");
            }
        }
    }

    pub fn execution_timeout_ms(&self) -> u64 {
        self.config.execution_timeout_ms
    }
}

/// In-memory tar archive of named byte buffers, rooted at the archive
/// top level so extraction lands directly in the upload path.
fn build_archive(files: &[(String, &[u8])]) -> Result<Vec<u8>, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .map_err(|e| SandboxError::Stage(Box::new(e)))?;
    }
    builder
        .into_inner()
        .map_err(|e| SandboxError::Stage(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_build_archive_round_trips_entries() {
        let files = vec![
            ("solution-1.py".to_string(), b"print(input())".as_slice()),
            ("input-1.txt".to_string(), b"hello".as_slice()),
        ];
        let archive = build_archive(&files).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut seen = Vec::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents).unwrap();
            assert_eq!(entry.header().mode().unwrap(), 0o644);
            seen.push((name, contents));
        }

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "solution-1.py");
        assert_eq!(seen[0].1, b"print(input())");
        assert_eq!(seen[1].0, "input-1.txt");
        assert_eq!(seen[1].1, b"hello");
    }

    #[test]
    fn test_build_archive_empty_file() {
        let files = vec![("input-2.txt".to_string(), b"".as_slice())];
        let archive = build_archive(&files).unwrap();

        let mut reader = tar::Archive::new(archive.as_slice());
        let entry = reader.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().size().unwrap(), 0);
    }
}
