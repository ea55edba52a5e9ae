//! EC2 instance lifecycle management

use anyhow::{Context, Result};
use aws_sdk_ec2::types::{Filter, Instance, InstanceStateName, ResourceType, Tag, TagSpecification};
use aws_sdk_ec2::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SECURITY_GROUP;

/// Polling interval for provider-side state transitions
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One allocated compute instance, as last observed from the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub instance_type: String,
    /// Populated only once the instance reaches the running state
    pub public_dns_name: Option<String>,
    /// Provider state name ("pending", "running", "terminated", ...)
    pub state: String,
}

impl From<&Instance> for InstanceHandle {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.instance_id().unwrap_or_default().to_string(),
            instance_type: instance
                .instance_type()
                .map(|t| t.as_str().to_string())
                .unwrap_or_default(),
            public_dns_name: instance
                .public_dns_name()
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            state: instance
                .state()
                .and_then(|s| s.name())
                .map(|n| n.as_str().to_string())
                .unwrap_or_else(|| "pending".to_string()),
        }
    }
}

/// EC2 lifecycle operations, abstracted so orchestration logic can be unit
/// tested without hitting real AWS.
#[allow(async_fn_in_trait)] // Internal use only, no dyn dispatch
#[cfg_attr(test, mockall::automock)]
pub trait Ec2Operations {
    /// Request exactly one instance from the given AMI
    async fn launch(&self, ami: &str, instance_type: &str) -> Result<InstanceHandle>;

    /// Block until the instance is running; returns the refreshed handle
    /// with its public DNS name populated
    async fn wait_for_running(&self, instance_id: &str) -> Result<InstanceHandle>;

    /// Issue a terminate request (does not wait)
    async fn terminate(&self, instance_id: &str) -> Result<()>;

    /// Block until the provider confirms the terminated state
    async fn wait_for_terminated(&self, instance_id: &str) -> Result<()>;

    /// All instances of the given type, filtered server-side
    async fn instances_of_type(&self, instance_type: &str) -> Result<Vec<InstanceHandle>>;

    /// Look up a single instance by id
    async fn instance_by_id(&self, instance_id: &str) -> Result<Option<InstanceHandle>>;
}

/// EC2 client for managing build instances
pub struct Ec2Client {
    client: Client,
    key_name: String,
    name_tag: String,
}

impl Ec2Client {
    /// Create a new EC2 client (loads AWS config from environment)
    pub async fn new(region: &str, key_name: &str, run_id: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;

        Self {
            client: Client::new(&config),
            key_name: key_name.to_string(),
            name_tag: format!("wheel-builder-{run_id}"),
        }
    }

    async fn describe_by_filter(
        &self,
        filter_name: &str,
        filter_value: &str,
    ) -> Result<Vec<InstanceHandle>> {
        let response = self
            .client
            .describe_instances()
            .filters(
                Filter::builder()
                    .name(filter_name)
                    .values(filter_value)
                    .build(),
            )
            .send()
            .await
            .context("Failed to describe instances")?;

        Ok(response
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .map(InstanceHandle::from)
            .collect())
    }
}

impl Ec2Operations for Ec2Client {
    async fn launch(&self, ami: &str, instance_type: &str) -> Result<InstanceHandle> {
        let instance_type_enum: aws_sdk_ec2::types::InstanceType = instance_type
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid instance type: {}", instance_type))?;

        info!(ami = %ami, instance_type = %instance_type, "Launching instance");

        let response = self
            .client
            .run_instances()
            .image_id(ami)
            .instance_type(instance_type_enum)
            .security_groups(SECURITY_GROUP)
            .key_name(&self.key_name)
            .min_count(1)
            .max_count(1)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .tags(Tag::builder().key("Name").value(&self.name_tag).build())
                    .build(),
            )
            .send()
            .await
            .context("Failed to launch instance")?;

        let instance = response
            .instances()
            .first()
            .context("No instance returned")?;

        let handle = InstanceHandle::from(instance);
        info!(instance_id = %handle.instance_id, "Instance launched");
        Ok(handle)
    }

    async fn wait_for_running(&self, instance_id: &str) -> Result<InstanceHandle> {
        info!(instance_id = %instance_id, "Waiting for instance to be running");

        loop {
            let instance = self
                .instance_by_id(instance_id)
                .await?
                .with_context(|| format!("Instance {instance_id} not found"))?;

            match instance.state.as_str() {
                "running" => {
                    info!(
                        instance_id = %instance_id,
                        public_dns = ?instance.public_dns_name,
                        "Instance is running"
                    );
                    return Ok(instance);
                }
                "pending" => {
                    debug!(instance_id = %instance_id, "Instance still pending");
                    tokio::time::sleep(STATE_POLL_INTERVAL).await;
                }
                state => {
                    anyhow::bail!(
                        "Instance {} entered unexpected state while waiting for running: {}",
                        instance_id,
                        state
                    );
                }
            }
        }
    }

    async fn terminate(&self, instance_id: &str) -> Result<()> {
        info!(instance_id = %instance_id, "Terminating instance");

        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .context("Failed to terminate instance")?;

        Ok(())
    }

    async fn wait_for_terminated(&self, instance_id: &str) -> Result<()> {
        debug!(instance_id = %instance_id, "Waiting for instance to terminate");

        loop {
            match self.instance_by_id(instance_id).await? {
                None => return Ok(()), // already gone from the inventory
                Some(instance) if instance.state == InstanceStateName::Terminated.as_str() => {
                    debug!(instance_id = %instance_id, "Instance terminated");
                    return Ok(());
                }
                Some(instance) => {
                    debug!(
                        instance_id = %instance_id,
                        state = %instance.state,
                        "Instance not yet terminated"
                    );
                    tokio::time::sleep(STATE_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn instances_of_type(&self, instance_type: &str) -> Result<Vec<InstanceHandle>> {
        self.describe_by_filter("instance-type", instance_type).await
    }

    async fn instance_by_id(&self, instance_id: &str) -> Result<Option<InstanceHandle>> {
        let mut instances = self.describe_by_filter("instance-id", instance_id).await?;
        Ok(if instances.is_empty() {
            None
        } else {
            Some(instances.swap_remove(0))
        })
    }
}
