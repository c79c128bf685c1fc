use crate::backend::ContainerRuntime;
use crate::credentials::{single_entry_config, Credential};
use crate::RuntimeError;
use bale_schema::ImageRef;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::debug;

const DEFAULT_BINARY: &str = "docker";

/// Runtime backed by the `docker` command-line client.
///
/// Authenticated pulls run against a throw-away `--config` directory that
/// holds only the matching credential, so the caller's own docker login state
/// is neither read nor modified.
pub struct DockerCliRuntime {
    binary: String,
    host: Option<String>,
}

impl DockerCliRuntime {
    pub fn new(host: Option<&str>) -> Self {
        Self {
            binary: DEFAULT_BINARY.to_owned(),
            host: host.map(str::to_owned),
        }
    }

    #[must_use]
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_owned();
        self
    }

    fn command(&self, config_dir: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.arg("--host").arg(host);
        }
        if let Some(dir) = config_dir {
            cmd.arg("--config").arg(dir);
        }
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<Output, RuntimeError> {
        debug!("running {cmd:?}");
        cmd.stdin(Stdio::null()).output().map_err(|e| self.spawn_error(&e))
    }

    fn spawn_error(&self, e: &std::io::Error) -> RuntimeError {
        if e.kind() == std::io::ErrorKind::NotFound {
            RuntimeError::BackendUnavailable(self.binary.clone())
        } else {
            RuntimeError::ExecFailed(format!("{}: {e}", self.binary))
        }
    }
}

impl ContainerRuntime for DockerCliRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn ping(&self) -> Result<(), RuntimeError> {
        let mut cmd = self.command(None);
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        let output = self.run(cmd)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuntimeError::Unreachable(stderr_line(&output.stderr)))
        }
    }

    fn image_exists(&self, image: &ImageRef) -> Result<bool, RuntimeError> {
        let mut cmd = self.command(None);
        cmd.args(["image", "inspect", "--format", "{{.Id}}", image.as_str()]);
        let output = self.run(cmd)?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_line(&output.stderr);
        match classify(&stderr) {
            Failure::NotFound => Ok(false),
            Failure::Unreachable => Err(RuntimeError::Unreachable(stderr)),
            Failure::Other => Err(RuntimeError::ExecFailed(stderr)),
        }
    }

    fn pull(&self, image: &ImageRef, credential: Option<&Credential>) -> Result<(), RuntimeError> {
        let config_dir = match credential {
            Some(c) => {
                let dir = tempfile::tempdir()?;
                std::fs::write(dir.path().join("config.json"), single_entry_config(c)?)?;
                Some(dir)
            }
            None => None,
        };

        let mut cmd = self.command(config_dir.as_ref().map(tempfile::TempDir::path));
        cmd.args(["pull", "--quiet"])
            .arg(format!("{}:{}", image.repository(), image.tag()));
        let output = self.run(cmd)?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_line(&output.stderr);
        Err(match classify(&stderr) {
            Failure::NotFound => RuntimeError::ImageNotFound(format!("{image}: {stderr}")),
            Failure::Unreachable => RuntimeError::Unreachable(stderr),
            Failure::Other => RuntimeError::PullFailed {
                image: image.to_string(),
                reason: stderr,
            },
        })
    }

    fn export(&self, image: &ImageRef, sink: &mut dyn Write) -> Result<u64, RuntimeError> {
        let mut cmd = self.command(None);
        cmd.args(["save", image.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("running {cmd:?}");
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(&e))?;

        let stderr_reader = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf);
                buf
            })
        });

        let copied = match child.stdout.take() {
            Some(mut stdout) => std::io::copy(&mut stdout, sink),
            None => Ok(0),
        };
        if copied.is_err() {
            let _ = child.kill();
        }
        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .map(|b| stderr_line(&b))
            .unwrap_or_default();

        if !status.success() {
            return Err(match classify(&stderr) {
                Failure::NotFound => RuntimeError::ImageNotFound(image.to_string()),
                Failure::Unreachable => RuntimeError::Unreachable(stderr),
                Failure::Other => RuntimeError::ExportFailed {
                    image: image.to_string(),
                    reason: stderr,
                },
            });
        }
        copied.map_err(|e| RuntimeError::ExportFailed {
            image: image.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Failure {
    NotFound,
    Unreachable,
    Other,
}

fn classify(stderr: &str) -> Failure {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
        || lower.contains("connection refused")
    {
        Failure::Unreachable
    } else if lower.contains("no such image")
        || lower.contains("no such object")
        || lower.contains("manifest unknown")
        || lower.contains("not found")
        || lower.contains("repository does not exist")
        || lower.contains("pull access denied")
    {
        Failure::NotFound
    } else {
        Failure::Other
    }
}

fn stderr_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "no error output".to_owned()
    } else {
        trimmed.lines().last().unwrap_or(trimmed).to_owned()
    }
}
