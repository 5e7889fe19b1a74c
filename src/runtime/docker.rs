//! Docker-backed [`Runtime`] built on bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    secret::{HostConfig, Resources, RestartPolicy, RestartPolicyNameEnum},
};
use futures_util::stream::StreamExt;
use tracing::debug;

use super::{Runtime, RuntimeError, RuntimeSpec, UnitStatus};

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new() -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_unix_defaults().map_err(RuntimeError::Connect)?;
        Ok(DockerRuntime { client })
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        debug!(image, "pulling image");
        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status = %status, "pull progress");
                    }
                }
                Err(source) => {
                    return Err(RuntimeError::Pull {
                        image: image.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn run(&self, spec: &RuntimeSpec) -> Result<String, RuntimeError> {
        self.pull_image(&spec.image).await?;

        let restart_policy = RestartPolicy {
            name: Some(restart_policy_name(&spec.restart_policy)),
            maximum_retry_count: None,
        };

        let resources = Resources {
            memory: Some((spec.memory * 1024 * 1024) as i64),
            nano_cpus: Some((spec.cpu * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: resources.memory,
            nano_cpus: resources.nano_cpus,
            publish_all_ports: Some(true),
            ..Default::default()
        };

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let container_config = bollard::container::Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });

        let created = self
            .client
            .create_container(options, container_config)
            .await
            .map_err(|source| RuntimeError::Create {
                name: spec.name.clone(),
                source,
            })?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|source| RuntimeError::Start {
                name: spec.name.clone(),
                source,
            })?;

        debug!(name = %spec.name, unit = %created.id, "unit started");
        Ok(created.id)
    }

    async fn stop(&self, unit_id: &str) -> Result<(), RuntimeError> {
        self.client
            .stop_container(unit_id, None::<StopContainerOptions>)
            .await
            .map_err(|source| RuntimeError::Stop {
                id: unit_id.to_string(),
                source,
            })
    }

    async fn remove(&self, unit_id: &str) -> Result<(), RuntimeError> {
        self.client
            .remove_container(unit_id, None::<RemoveContainerOptions>)
            .await
            .map_err(|source| RuntimeError::Remove {
                id: unit_id.to_string(),
                source,
            })
    }

    async fn inspect(&self, unit_id: &str) -> Result<UnitStatus, RuntimeError> {
        let resp = self
            .client
            .inspect_container(unit_id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| RuntimeError::Inspect {
                id: unit_id.to_string(),
                source,
            })?;

        let state = resp.state.unwrap_or_default();
        Ok(UnitStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }
}
