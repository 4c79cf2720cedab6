//! Docker CLI runtime
//!
//! Implements `ContainerRuntime` by shelling out to `docker` / `docker compose`.

use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::{combined_output, CommandError, CommandRunner};
use super::runtime::{
    ContainerHealth, ContainerRuntime, ContainerState, ContainerStatus, ExecOutput, RuntimeError,
    ServiceAction, StackHealth, StackSpec,
};

/// stderr fragments that indicate a retryable engine/network hiccup
const TRANSIENT_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "temporary failure",
    "toomanyrequests",
    "context deadline exceeded",
];

/// Docker CLI backed runtime
pub struct DockerCli {
    /// (program, leading args) for compose, detected on first use
    compose: OnceCell<(String, Vec<String>)>,
    /// timeout for long compose operations (build/up)
    compose_timeout: Duration,
    /// timeout for quick queries (inspect/ps/network)
    query_timeout: Duration,
}

impl DockerCli {
    pub fn new(compose_timeout: Duration) -> Self {
        Self {
            compose: OnceCell::new(),
            compose_timeout,
            query_timeout: Duration::from_secs(30),
        }
    }

    /// Detect which docker-compose command to use (prefer the v2 plugin)
    async fn compose_command(&self) -> &(String, Vec<String>) {
        self.compose
            .get_or_init(|| async {
                let plugin = Command::new("docker")
                    .args(["compose", "version"])
                    .output()
                    .await
                    .map(|o| o.status.success())
                    .unwrap_or(false);

                if plugin {
                    ("docker".to_string(), vec!["compose".to_string()])
                } else {
                    ("docker-compose".to_string(), vec![])
                }
            })
            .await
    }

    async fn compose(
        &self,
        operation: &'static str,
        stack: &StackSpec,
        extra: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Output, RuntimeError> {
        let (program, lead) = self.compose_command().await;
        let compose_file = stack.compose_file().to_string_lossy().to_string();

        let mut args = lead.clone();
        args.extend(["-p".to_string(), stack.project.clone(), "-f".to_string(), compose_file]);
        args.extend(extra.iter().map(|s| s.to_string()));

        let output = CommandRunner::run(program, &args, Some(&stack.dir), timeout, cancel)
            .await
            .map_err(|e| map_command_error(operation, &stack.project, e))?;
        check_status(operation, &stack.project, output)
    }

    async fn docker(&self, operation: &'static str, target: &str, args: &[String]) -> Result<Output, RuntimeError> {
        CommandRunner::run("docker", args, None, self.query_timeout, &CancellationToken::new())
            .await
            .map_err(|e| map_command_error(operation, target, e))
    }
}

fn map_command_error(operation: &'static str, target: &str, err: CommandError) -> RuntimeError {
    match err {
        CommandError::SpawnFailed(e) => RuntimeError::Unavailable(e.to_string()),
        CommandError::Timeout(_) => RuntimeError::Timeout {
            operation,
            target: target.to_string(),
        },
        CommandError::Cancelled => RuntimeError::Cancelled,
        CommandError::WaitFailed(e) => RuntimeError::CommandFailed {
            operation,
            target: target.to_string(),
            message: e.to_string(),
            transient: true,
        },
    }
}

fn check_status(operation: &'static str, target: &str, output: Output) -> Result<Output, RuntimeError> {
    if output.status.success() {
        return Ok(output);
    }
    let message = combined_output(&output);
    let lower = message.to_ascii_lowercase();
    Err(RuntimeError::CommandFailed {
        operation,
        target: target.to_string(),
        transient: TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)),
        message,
    })
}

/// Parse `docker compose ps --format json`.
///
/// Compose v2.21+ prints one object per line, older releases print a JSON array.
pub fn parse_compose_ps(stdout: &str) -> StackHealth {
    let trimmed = stdout.trim();
    let entries: Vec<serde_json::Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_default()
    } else {
        trimmed
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    };

    let containers = entries
        .iter()
        .map(|entry| ContainerState {
            name: entry["Name"].as_str().unwrap_or_default().to_string(),
            status: ContainerStatus::parse(entry["State"].as_str().unwrap_or_default()),
            health: entry["Health"].as_str().and_then(ContainerHealth::parse),
        })
        .collect();

    StackHealth { containers }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn network_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let args = vec!["network".to_string(), "inspect".to_string(), name.to_string()];
        let output = self.docker("network inspect", name, &args).await?;
        Ok(output.status.success())
    }

    async fn create_network(&self, name: &str) -> Result<(), RuntimeError> {
        let args = vec!["network".to_string(), "create".to_string(), name.to_string()];
        let output = self.docker("network create", name, &args).await?;
        if !output.status.success() && !combined_output(&output).contains("already exists") {
            check_status("network create", name, output)?;
        }
        info!(network = %name, "Docker network ready");
        Ok(())
    }

    async fn up(&self, stack: &StackSpec, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        self.compose(
            "compose up",
            stack,
            &["up", "-d", "--build", "--remove-orphans"],
            self.compose_timeout,
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn down(&self, stack: &StackSpec, remove_volumes: bool) -> Result<(), RuntimeError> {
        let mut extra = vec!["down", "--remove-orphans"];
        if remove_volumes {
            extra.push("-v");
        }
        self.compose(
            "compose down",
            stack,
            &extra,
            self.compose_timeout,
            &CancellationToken::new(),
        )
        .await?;
        Ok(())
    }

    async fn control(
        &self,
        stack: &StackSpec,
        service: Option<&str>,
        action: ServiceAction,
    ) -> Result<(), RuntimeError> {
        let mut extra = vec![action.as_str()];
        if let Some(svc) = service {
            extra.push(svc);
        }
        self.compose(
            "compose control",
            stack,
            &extra,
            self.compose_timeout,
            &CancellationToken::new(),
        )
        .await?;
        Ok(())
    }

    async fn stack_health(&self, stack: &StackSpec) -> Result<StackHealth, RuntimeError> {
        let output = self
            .compose(
                "compose ps",
                stack,
                &["ps", "-a", "--format", "json"],
                self.query_timeout,
                &CancellationToken::new(),
            )
            .await?;
        Ok(parse_compose_ps(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn inspect(&self, container: &str) -> Result<ContainerState, RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}".to_string(),
            container.to_string(),
        ];
        let output = self.docker("inspect", container, &args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Ok(ContainerState::not_found(container));
            }
            check_status("inspect", container, output)?;
            return Ok(ContainerState::not_found(container));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut parts = stdout.trim().splitn(2, '|');
        let status = ContainerStatus::parse(parts.next().unwrap_or_default());
        let health = parts.next().and_then(ContainerHealth::parse);
        debug!(container = %container, ?status, ?health, "Inspected container");

        Ok(ContainerState {
            name: container.to_string(),
            status,
            health,
        })
    }

    async fn attach_network(&self, stack: &StackSpec, network: &str) -> Result<(), RuntimeError> {
        let output = self
            .compose(
                "compose ps",
                stack,
                &["ps", "-q"],
                self.query_timeout,
                &CancellationToken::new(),
            )
            .await?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        if ids.is_empty() {
            return Err(RuntimeError::NotFound(stack.project.clone()));
        }

        for id in ids {
            let args = vec![
                "network".to_string(),
                "connect".to_string(),
                network.to_string(),
                id.clone(),
            ];
            let output = self.docker("network connect", &id, &args).await?;
            let text = combined_output(&output);
            if !output.status.success() && !text.contains("already exists") {
                check_status("network connect", &id, output)?;
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        container: &str,
        command: &[String],
        input: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut args = vec!["exec".to_string()];
        if input.is_some() {
            args.push("-i".to_string());
        }
        args.push(container.to_string());
        args.extend(command.iter().cloned());

        let output = CommandRunner::run_with_input(
            "docker",
            &args,
            None,
            input,
            self.query_timeout,
            &CancellationToken::new(),
        )
        .await
        .map_err(|e| map_command_error("exec", container, e))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: combined_output(&output),
        })
    }

    async fn logs(&self, stack: &StackSpec, tail: usize) -> Result<String, RuntimeError> {
        let tail = format!("--tail={}", tail);
        let output = self
            .compose(
                "compose logs",
                stack,
                &["logs", "--no-color", tail.as_str()],
                self.query_timeout,
                &CancellationToken::new(),
            )
            .await?;
        // docker logs 通常输出到 stderr
        Ok(combined_output(&output))
    }

    async fn engine_version(&self) -> Result<String, RuntimeError> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self.docker("version", "engine", &args).await?;
        let output = check_status("version", "engine", output)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
