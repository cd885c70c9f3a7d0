use super::{
    ContainerRuntime, DeviceBindings, LineSplitter, LineStream, NetworkSpec, UnitSpec, VolumeSpec,
};
use crate::errors::{FleetError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::{DeviceMapping, DeviceRequest, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines buffered between the log follower task and its consumer
const OUTPUT_BUFFER: usize = 1024;

/// Docker Engine implementation of [`ContainerRuntime`].
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local engine and check that it answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| FleetError::Runtime(format!("Failed to connect to Docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| FleetError::Runtime(format!("Docker ping failed: {e}")))?;

        debug!("Connected to Docker engine");
        Ok(Self { docker })
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// `Ok(false)` for a 404, the error otherwise.
fn removed(result: std::result::Result<(), bollard::errors::Error>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn host_config(spec: &UnitSpec) -> HostConfig {
    let mut binds: Vec<String> = spec
        .binds
        .iter()
        .map(|b| {
            let mode = if b.read_only { ":ro" } else { "" };
            format!("{}:{}{mode}", b.source, b.target)
        })
        .collect();
    binds.extend(spec.volumes.iter().map(|v| format!("{}:{}", v.volume, v.target)));

    let mut config = HostConfig {
        binds: Some(binds),
        network_mode: spec.network.clone(),
        shm_size: spec.shm_size,
        ..Default::default()
    };

    match &spec.devices {
        DeviceBindings::None => {}
        DeviceBindings::GpuRequest { device_ids } => {
            config.device_requests = Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                device_ids: Some(device_ids.clone()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]);
        }
        DeviceBindings::DeviceNodes(nodes) => {
            config.devices = Some(
                nodes
                    .iter()
                    .map(|node| DeviceMapping {
                        path_on_host: Some(node.clone()),
                        path_in_container: Some(node.clone()),
                        cgroup_permissions: Some("rwm".to_string()),
                    })
                    .collect(),
            );
        }
    }

    config
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: "bridge".to_string(),
            labels: spec.labels.clone(),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| FleetError::Launch(format!("Failed to create network {}: {e}", spec.name)))?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<bool> {
        removed(self.docker.remove_network(name).await)
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        let driver_opts = HashMap::from([
            ("type".to_string(), "tmpfs".to_string()),
            ("device".to_string(), "tmpfs".to_string()),
            ("o".to_string(), format!("size={}", spec.size)),
        ]);
        let options = CreateVolumeOptions {
            name: spec.name.clone(),
            driver: "local".to_string(),
            driver_opts,
            labels: spec.labels.clone(),
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| FleetError::Launch(format!("Failed to create volume {}: {e}", spec.name)))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<bool> {
        removed(
            self.docker
                .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
                .await,
        )
    }

    async fn start_unit(&self, spec: &UnitSpec) -> Result<()> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: spec.hostname.clone(),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| FleetError::Launch(format!("Failed to create unit {}: {e}", spec.name)))?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| FleetError::Launch(format!("Failed to start unit {}: {e}", spec.name)))?;

        debug!(unit = %spec.name, image = %spec.image, "Unit started");
        Ok(())
    }

    async fn remove_unit(&self, name: &str) -> Result<bool> {
        removed(
            self.docker
                .remove_container(
                    name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await,
        )
    }

    async fn unit_address(&self, name: &str, network: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(network))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| FleetError::Runtime(format!("Unit {name} has no address on {network}")))
    }

    async fn follow_output(&self, name: &str) -> Result<LineStream> {
        let (tx, rx) = mpsc::channel::<Result<String>>(OUTPUT_BUFFER);
        let docker = self.docker.clone();
        let unit = name.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut logs = Box::pin(docker.logs(&unit, Some(options)));
            let mut splitter = LineSplitter::new();

            while let Some(item) = logs.next().await {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => message,
                    Ok(LogOutput::StdIn { .. }) => continue,
                    Err(e) => {
                        warn!(unit = %unit, error = %e, "Log stream failed");
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                for line in splitter.push(&chunk) {
                    if tx.send(Ok(line)).await.is_err() {
                        return;
                    }
                }
            }
            if let Some(rest) = splitter.finish() {
                let _ = tx.send(Ok(rest)).await;
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn wait_exit(&self, name: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut waits = Box::pin(self.docker.wait_container(name, Some(options)));

        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(FleetError::Runtime(format!("No exit status for unit {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BindMount, VolumeMount};

    #[test]
    fn test_host_config_for_gpu_unit() {
        let spec = UnitSpec {
            name: "hetero-fleet-cuda".to_string(),
            binds: vec![BindMount {
                source: "/work/train.py".to_string(),
                target: "/train.py".to_string(),
                read_only: true,
            }],
            volumes: vec![VolumeMount {
                volume: "hetero-fleet".to_string(),
                target: "/tmp/rendezvous".to_string(),
            }],
            network: Some("hetero-fleet".to_string()),
            shm_size: Some(16 << 30),
            devices: DeviceBindings::GpuRequest {
                device_ids: vec!["0".to_string(), "1".to_string()],
            },
            ..Default::default()
        };

        let config = host_config(&spec);
        assert_eq!(
            config.binds.unwrap(),
            vec!["/work/train.py:/train.py:ro", "hetero-fleet:/tmp/rendezvous"]
        );
        assert_eq!(config.network_mode.as_deref(), Some("hetero-fleet"));
        let requests = config.device_requests.unwrap();
        assert_eq!(requests[0].device_ids.as_ref().unwrap(), &vec!["0", "1"]);
        assert!(config.devices.is_none());
    }

    #[test]
    fn test_host_config_for_device_nodes() {
        let spec = UnitSpec {
            devices: DeviceBindings::DeviceNodes(vec!["/dev/cambricon_ctl".to_string()]),
            ..Default::default()
        };

        let devices = host_config(&spec).devices.unwrap();
        assert_eq!(devices[0].path_in_container.as_deref(), Some("/dev/cambricon_ctl"));
    }
}
