//! Kubernetes control plane driven through `kubectl`.
//!
//! Signals go through `kubectl exec ... pkill`, isolation through a Chaos
//! Mesh `NetworkChaos` resource and restart backoff through a Pebble layer
//! merged into the workload container's plan.

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::ControlPlane;
use crate::config::ControlPlaneConfig;
use crate::model::{BackoffPolicy, SignalKind, UnitRef};
use crate::{Error, Result};

/// Label of the Pebble layer carrying the restart backoff override.
const BACKOFF_LAYER_LABEL: &str = "kafka-ha-restart-delay";

/// Where the layer is written inside the container before `pebble add`.
const BACKOFF_LAYER_PATH: &str = "/tmp/kafka-ha-restart-delay.yaml";

/// Pebble's own defaults, restored by the restore policy.
const DEFAULT_BACKOFF_DELAY: &str = "500ms";
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const DEFAULT_BACKOFF_LIMIT: &str = "30s";

/// Control plane for units deployed as pods of one application.
pub struct KubectlControlPlane {
    config: ControlPlaneConfig,
    app: String,
    replica_count: u32,
}

/// Output of a finished kubectl invocation.
#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl KubectlControlPlane {
    pub fn new(config: ControlPlaneConfig, app: impl Into<String>, replica_count: u32) -> Self {
        Self {
            config,
            app: app.into(),
            replica_count,
        }
    }

    async fn kubectl(&self, args: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        debug!("{} {}", self.config.kubectl, args.join(" "));

        let mut command = Command::new(&self.config.kubectl);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::ControlPlane(format!("failed to run {}: {}", self.config.kubectl, e))
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // Closing stdin lets kubectl read to EOF
            drop(pipe);
        }

        let timeout = self.config.command_timeout();
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::TimeoutExceeded {
                operation: format!("kubectl {}", args.join(" ")),
                timeout,
            })??;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run a command whose failure means the perturbation was not applied.
    async fn deliver(
        &self,
        unit: &UnitRef,
        args: Vec<String>,
        stdin: Option<&str>,
    ) -> Result<String> {
        let output = self.kubectl(&args, stdin).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::DeliveryFailed {
                target: unit.to_string(),
                message: if output.stderr.is_empty() {
                    format!("kubectl {} failed", args.first().map_or("", String::as_str))
                } else {
                    output.stderr
                },
            })
        }
    }

    fn exec_args(&self, unit: &UnitRef, command: &[&str]) -> Vec<String> {
        exec_args(&self.config, unit, command)
    }
}

fn exec_args(config: &ControlPlaneConfig, unit: &UnitRef, command: &[&str]) -> Vec<String> {
    let mut args = vec![
        "--namespace".to_string(),
        config.namespace.clone(),
        "exec".to_string(),
        unit.pod_name(),
        "--container".to_string(),
        config.container.clone(),
        "--".to_string(),
    ];
    args.extend(command.iter().map(|s| s.to_string()));
    args
}

/// `kubectl exec <pod> -- pkill --signal <SIG> -f <pattern>`
fn signal_args(config: &ControlPlaneConfig, unit: &UnitRef, signal: SignalKind) -> Vec<String> {
    exec_args(
        config,
        unit,
        &["pkill", "--signal", signal.as_str(), "-f", &config.process_pattern],
    )
}

fn delete_pod_args(config: &ControlPlaneConfig, unit: &UnitRef) -> Vec<String> {
    vec![
        "--namespace".to_string(),
        config.namespace.clone(),
        "delete".to_string(),
        "pod".to_string(),
        unit.pod_name(),
        "--wait=false".to_string(),
    ]
}

fn pod_ip_args(config: &ControlPlaneConfig, unit: &UnitRef) -> Vec<String> {
    vec![
        "--namespace".to_string(),
        config.namespace.clone(),
        "get".to_string(),
        "pod".to_string(),
        unit.pod_name(),
        "--output".to_string(),
        "jsonpath={.status.podIP}".to_string(),
    ]
}

/// NetworkChaos partitioning one pod from the rest of its application.
fn network_chaos_manifest(
    config: &ControlPlaneConfig,
    app: &str,
    unit: &UnitRef,
) -> Result<String> {
    let manifest = json!({
        "apiVersion": "chaos-mesh.org/v1alpha1",
        "kind": "NetworkChaos",
        "metadata": {
            "name": config.network_chaos_name,
            "namespace": config.namespace,
        },
        "spec": {
            "action": "partition",
            "mode": "one",
            "selector": {
                "pods": { config.namespace.clone(): [unit.pod_name()] },
            },
            "direction": "both",
            "target": {
                "mode": "all",
                "selector": {
                    "labelSelectors": { "app.kubernetes.io/name": app },
                },
            },
        },
    });
    Ok(serde_yaml::to_string(&manifest)?)
}

/// Pebble layer overriding the broker service's restart backoff.
fn backoff_layer(service: &str, policy: BackoffPolicy, extended_secs: u64) -> Result<String> {
    let (delay, factor, limit) = match policy {
        BackoffPolicy::Extend => {
            let delay = format!("{}s", extended_secs);
            (delay.clone(), 1.0, delay)
        }
        BackoffPolicy::Restore => (
            DEFAULT_BACKOFF_DELAY.to_string(),
            DEFAULT_BACKOFF_FACTOR,
            DEFAULT_BACKOFF_LIMIT.to_string(),
        ),
    };
    let layer = json!({
        "summary": "kafka-ha restart backoff",
        "services": {
            service: {
                "override": "merge",
                "backoff-delay": delay,
                "backoff-factor": factor,
                "backoff-limit": limit,
            },
        },
    });
    Ok(serde_yaml::to_string(&layer)?)
}

#[async_trait]
impl ControlPlane for KubectlControlPlane {
    async fn send_signal(&self, unit: &UnitRef, signal: SignalKind) -> Result<()> {
        self.deliver(unit, signal_args(&self.config, unit, signal), None)
            .await?;
        info!("Sent {} to {}", signal, unit);
        Ok(())
    }

    async fn isolate(&self, unit: &UnitRef) -> Result<()> {
        let manifest = network_chaos_manifest(&self.config, &self.app, unit)?;
        let args = vec![
            "--namespace".to_string(),
            self.config.namespace.clone(),
            "apply".to_string(),
            "-f".to_string(),
            "-".to_string(),
        ];
        self.deliver(unit, args, Some(&manifest)).await?;
        info!("Isolated {} from the cluster", unit);
        Ok(())
    }

    async fn restore_network(&self, unit: &UnitRef) -> Result<()> {
        let args = vec![
            "--namespace".to_string(),
            self.config.namespace.clone(),
            "delete".to_string(),
            "networkchaos".to_string(),
            self.config.network_chaos_name.clone(),
            "--ignore-not-found".to_string(),
        ];
        self.deliver(unit, args, None).await?;
        info!("Restored network of {}", unit);
        Ok(())
    }

    async fn delete_unit(&self, unit: &UnitRef) -> Result<()> {
        self.deliver(unit, delete_pod_args(&self.config, unit), None)
            .await?;
        info!("Deleted pod of {}", unit);
        Ok(())
    }

    async fn set_restart_backoff(&self, unit: &UnitRef, policy: BackoffPolicy) -> Result<()> {
        let layer = backoff_layer(
            &self.config.service,
            policy,
            self.config.extended_backoff_secs,
        )?;

        let mut write = exec_args(
            &self.config,
            unit,
            &["sh", "-c", &format!("cat > {}", BACKOFF_LAYER_PATH)],
        );
        // kubectl exec only forwards stdin with --stdin
        write.insert(3, "--stdin".to_string());
        self.deliver(unit, write, Some(&layer)).await?;

        let pebble = self.config.pebble.as_str();
        self.deliver(
            unit,
            self.exec_args(
                unit,
                &[pebble, "add", "--combine", BACKOFF_LAYER_LABEL, BACKOFF_LAYER_PATH],
            ),
            None,
        )
        .await?;
        self.deliver(unit, self.exec_args(unit, &[pebble, "replan"]), None)
            .await?;

        info!("Set restart backoff of {} to {:?}", unit, policy);
        Ok(())
    }

    async fn unit_address(&self, unit: &UnitRef) -> Result<String> {
        let output = self.kubectl(&pod_ip_args(&self.config, unit), None).await?;
        if !output.success {
            return Err(Error::NotFound(format!("pod of {}: {}", unit, output.stderr)));
        }
        if output.stdout.is_empty() {
            warn!("Pod of {} has no IP yet", unit);
            return Err(Error::Unreachable(format!("{} has no address yet", unit)));
        }
        Ok(output.stdout)
    }

    async fn list_units(&self) -> Result<Vec<UnitRef>> {
        Ok((0..self.replica_count)
            .map(|index| UnitRef::new(self.app.clone(), index))
            .collect())
    }
}
