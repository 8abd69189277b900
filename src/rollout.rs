//! Container rollout with backup-and-rollback semantics.
//!
//! Swapping a container onto a new image is a stop → rename → create →
//! start sequence. The renamed original is kept as a backup until the
//! replacement starts, so a failed creation restores the previous container
//! instead of leaving the host without one.

use crate::engine::{
    ContainerInspect, DeviceMapping, EngineClient, EngineError, PortBinding, RestartPolicy,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info, warn};

/// Seconds a container gets to exit cleanly before the engine kills it.
const STOP_GRACE_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("failed to prepare rollout of {name}: {source}")]
    Prepare {
        name: String,
        #[source]
        source: EngineError,
    },
    #[error("failed to create replacement for {name}, original restored: {source}")]
    Create {
        name: String,
        #[source]
        source: EngineError,
    },
    /// The one state this design cannot self-heal: creation failed and the
    /// rename back also failed, so the stranded backup was force-removed.
    #[error("rollback of {name} failed, stranded backup {backup} required forced removal")]
    RollbackFailed { name: String, backup: String },
}

/// Engine "create" payload plus the networks to attach after creation.
/// Computed fresh per rollout from the old container's inspect output.
#[derive(Debug)]
pub struct RolloutPlan {
    pub body: CreateContainerBody,
    pub extra_networks: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
    pub image: String,
    pub host_config: CreateHostConfig,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateHostConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_bindings: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_add: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cap_drop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceMapping>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_opt: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

/// Derives a create payload from an inspected container, preserving its
/// runtime configuration on the new image.
///
/// Hostname, port bindings and network reattachment are omitted when the
/// container shares another container's or the host's network namespace;
/// those settings are invalid there. The primary network is carried in
/// `NetworkMode`; only genuinely additional networks are listed for
/// post-create attachment, since re-requesting the primary one produces a
/// duplicate-endpoint error.
pub fn build_plan(inspect: &ContainerInspect, image_ref: &str) -> RolloutPlan {
    let config = &inspect.config;
    let host = &inspect.host_config;

    let network_mode = host.network_mode.as_deref().unwrap_or("default");
    let is_container_net = network_mode.starts_with("container:");
    let shares_netns = network_mode == "host" || is_container_net;
    let short_id: String = inspect.id.chars().take(12).collect();

    let hostname = if shares_netns {
        None
    } else {
        config
            .hostname
            .clone()
            .filter(|h| !h.is_empty() && *h != short_id)
    };

    let env = config.env.as_ref().map(|vars| {
        vars.iter()
            .filter(|var| !var.starts_with("PATH=") && !var.starts_with("HOSTNAME="))
            .cloned()
            .collect::<Vec<_>>()
    });

    // Stack-membership labels survive; other engine-internal labels do not.
    let labels = config.labels.as_ref().map(|labels| {
        labels
            .iter()
            .filter(|(key, _)| {
                key.starts_with("com.docker.compose.") || !key.starts_with("com.docker.")
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<HashMap<_, _>>()
    });

    let mut binds = Vec::new();
    for mount in &inspect.mounts {
        let source = match mount.mount_type.as_str() {
            "bind" => mount.source.clone(),
            "volume" => mount.name.clone(),
            _ => continue,
        };
        let Some(source) = source else { continue };
        let mut bind = format!("{}:{}", source, mount.destination);
        if let Some(mode) = mount.mode.as_deref().filter(|m| !m.is_empty()) {
            bind.push(':');
            bind.push_str(mode);
        }
        binds.push(bind);
    }

    let restart_policy = host
        .restart_policy
        .as_ref()
        .filter(|p| p.name.as_deref().is_some_and(|n| !n.is_empty()))
        .map(|p| RestartPolicy {
            name: p.name.clone(),
            maximum_retry_count: if p.name.as_deref() == Some("on-failure") {
                p.maximum_retry_count
            } else {
                None
            },
        });

    let extra_networks = if shares_netns {
        Vec::new()
    } else {
        let mut extras: Vec<String> = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .map(|networks| {
                networks
                    .keys()
                    .filter(|net| {
                        net.as_str() != network_mode
                            && !(net.as_str() == "bridge"
                                && (network_mode == "default" || network_mode == "bridge"))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        extras.sort_unstable();
        extras
    };

    let body = CreateContainerBody {
        hostname,
        user: config.user.clone().filter(|u| !u.is_empty()),
        working_dir: config.working_dir.clone().filter(|w| !w.is_empty()),
        env,
        cmd: config.cmd.clone(),
        entrypoint: config.entrypoint.clone(),
        labels,
        exposed_ports: if shares_netns {
            None
        } else {
            config.exposed_ports.clone()
        },
        image: image_ref.to_string(),
        host_config: CreateHostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            network_mode: (network_mode != "default").then(|| network_mode.to_string()),
            port_bindings: if shares_netns {
                None
            } else {
                host.port_bindings.clone()
            },
            restart_policy,
            privileged: host.privileged.filter(|p| *p),
            cap_add: host.cap_add.clone().filter(|c| !c.is_empty()),
            cap_drop: host.cap_drop.clone().filter(|c| !c.is_empty()),
            devices: host.devices.clone().filter(|d| !d.is_empty()),
            memory: host.memory.filter(|m| *m != 0),
            cpu_shares: host.cpu_shares.filter(|c| *c != 0),
            cpu_quota: host.cpu_quota.filter(|c| *c != 0),
            security_opt: host.security_opt.clone().filter(|s| !s.is_empty()),
            runtime: host.runtime.clone().filter(|r| !r.is_empty()),
        },
    };

    RolloutPlan {
        body,
        extra_networks,
    }
}

pub struct RolloutOrchestrator {
    engine: EngineClient,
}

impl RolloutOrchestrator {
    pub fn new(engine: EngineClient) -> Self {
        Self { engine }
    }

    /// Recreates one container on `image_ref`, rolling back to the original
    /// if the replacement cannot be created or started.
    pub async fn rollout(&self, name: &str, image_ref: &str) -> Result<(), RolloutError> {
        let prepare = |source| RolloutError::Prepare {
            name: name.to_string(),
            source,
        };

        let inspect = self.engine.inspect_container(name).await.map_err(prepare)?;
        let plan = build_plan(&inspect, image_ref);

        info!("Stopping container {}...", name);
        self.engine
            .stop_container(name, STOP_GRACE_SECS)
            .await
            .map_err(prepare)?;

        let backup = format!("{}_backup_{}", name, Utc::now().timestamp());
        info!("Renaming old container to {}", backup);
        self.engine
            .rename_container(name, &backup)
            .await
            .map_err(prepare)?;

        match self.create_and_start(name, &plan).await {
            Ok(_) => {
                info!("Removing old container {}", backup);
                if let Err(e) = self.engine.remove_container(&backup, false).await {
                    warn!("Could not remove backup container {}: {}", backup, e);
                }
                info!("Successfully updated container {}", name);
                Ok(())
            }
            Err(source) => {
                error!("Failed to create new container {}: {}", name, source);
                info!("Rolling back...");
                // A partially created replacement may still hold the name.
                let _ = self.engine.remove_container(name, true).await;

                if let Err(rename_err) = self.engine.rename_container(&backup, name).await {
                    warn!(
                        "Rollback rename of {} failed ({}), force-removing stranded backup",
                        backup, rename_err
                    );
                    if let Err(e) = self.engine.remove_container(&backup, true).await {
                        warn!("Could not remove stranded backup {}: {}", backup, e);
                    }
                    return Err(RolloutError::RollbackFailed {
                        name: name.to_string(),
                        backup,
                    });
                }
                if let Err(e) = self.engine.start_container(name).await {
                    warn!("Could not restart restored container {}: {}", name, e);
                }
                Err(RolloutError::Create {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    async fn create_and_start(
        &self,
        name: &str,
        plan: &RolloutPlan,
    ) -> Result<String, EngineError> {
        info!("Creating new container {}...", name);
        let id = self.engine.create_container(name, &plan.body).await?;

        for network in &plan.extra_networks {
            if let Err(e) = self.engine.connect_network(network, &id).await {
                warn!("Could not connect {} to network {}: {}", name, network, e);
            }
        }

        self.engine.start_container(name).await?;
        Ok(id)
    }

    /// Rolls out a set of containers one at a time. Engines serialize poorly
    /// under concurrent create/rename on overlapping networks, so fan-out is
    /// sequential in discovery order.
    pub async fn rollout_many(
        &self,
        names: &[String],
        image_ref: &str,
    ) -> HashMap<String, bool> {
        let mut results = HashMap::new();
        for name in names {
            info!("Updating container {} to {}", name, image_ref);
            let success = match self.rollout(name, image_ref).await {
                Ok(()) => true,
                Err(e) => {
                    error!("Error updating container {}: {}", name, e);
                    false
                }
            };
            results.insert(name.clone(), success);
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        if succeeded == results.len() {
            info!(
                "Container update summary: {}/{} succeeded (all)",
                succeeded,
                results.len()
            );
        } else {
            warn!(
                "Container update summary: {}/{} succeeded",
                succeeded,
                results.len()
            );
        }

        results
    }
}
