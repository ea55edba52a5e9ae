//! Build, allocate, list, and terminate flows.
//!
//! The build flow is a fixed sequence: allocate an instance, wait for SSH
//! reachability, run the provisioning and build steps, copy the wheel back,
//! terminate the instance. The first error aborts the remaining steps; the
//! instance is still terminated unless `--keep` is set.

use crate::config::{RunConfig, SSH_PORT};
use crate::ec2::{Ec2Operations, InstanceHandle};
use crate::pipeline::{build_pipeline, Phase, ARTIFACT_GLOB};
use crate::ssh::{HostTrust, SshSession};
use crate::wait::wait_for_connection;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Settle time after the SSH port first answers; cloud-init may still be
/// rewriting sshd configuration at that point
const SETTLE_DELAY: Duration = Duration::from_secs(10);

/// JSON run summary written when `--output` is given
#[derive(Debug, Serialize)]
struct RunSummary {
    run_id: String,
    instance_id: String,
    instance_type: String,
    ami: String,
    branch: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    artifact: String,
}

/// Allocate one instance and block until it is running
pub async fn start_instance(
    ec2: &impl Ec2Operations,
    ami: &str,
    instance_type: &str,
) -> Result<InstanceHandle> {
    let instance = ec2.launch(ami, instance_type).await?;
    println!("Created instance {}", instance.instance_id);

    let running = ec2.wait_for_running(&instance.instance_id).await?;
    println!(
        "Instance started at {}",
        running.public_dns_name.as_deref().unwrap_or("<no dns>")
    );
    Ok(running)
}

/// Full build flow: allocate, provision, build, fetch the wheel, terminate.
///
/// Termination happens on every exit path once an instance exists, unless
/// `config.keep` is set; a pipeline error is preferred over a termination
/// error when both occur.
pub async fn run_build(ec2: &impl Ec2Operations, config: &RunConfig) -> Result<()> {
    config.validate()?;

    let started_at = Utc::now();
    let ami = config.os.ami();
    let instance = start_instance(ec2, ami, &config.instance_type).await?;

    let build_result = build_on_instance(config, &instance).await;

    if config.keep {
        warn!(
            instance_id = %instance.instance_id,
            "Leaving instance running (--keep)"
        );
        return build_result;
    }

    println!("Waiting for instance {} to terminate", instance.instance_id);
    let terminate_result = async {
        ec2.terminate(&instance.instance_id).await?;
        ec2.wait_for_terminated(&instance.instance_id).await
    }
    .await;

    match (build_result, terminate_result) {
        (Err(build_err), Err(terminate_err)) => {
            warn!(
                instance_id = %instance.instance_id,
                error = ?terminate_err,
                "Failed to terminate instance after build failure"
            );
            Err(build_err)
        }
        (Err(build_err), Ok(())) => Err(build_err),
        (Ok(()), terminate_result) => {
            write_summary(config, &instance, ami, started_at)?;
            terminate_result
        }
    }
}

/// Everything that happens between running and terminating
async fn build_on_instance(config: &RunConfig, instance: &InstanceHandle) -> Result<()> {
    let addr = instance
        .public_dns_name
        .as_deref()
        .context("Running instance has no public DNS name")?;

    wait_for_connection(
        addr,
        SSH_PORT,
        config.reachability.interval,
        config.reachability.max_attempts,
    )
    .await?;
    tokio::time::sleep(SETTLE_DELAY).await;

    let ssh = SshSession::new(addr, config.key_file.clone(), host_trust(config));

    println!("Configuring the system");
    for step in build_pipeline(&config.branch)
        .iter()
        .filter(|s| !config.build_only || s.phase == Phase::Build)
    {
        info!(step = %step.name, phase = ?step.phase, "Running step");
        ssh.run(step.command.as_str())
            .await
            .with_context(|| format!("Step '{}' failed", step.name))?;
    }

    println!("Copying the wheel");
    ssh.fetch(ARTIFACT_GLOB, Path::new(".")).await?;
    Ok(())
}

fn host_trust(config: &RunConfig) -> HostTrust {
    match &config.known_hosts {
        Some(path) => HostTrust::Pinned(path.clone()),
        None => HostTrust::AcceptAny,
    }
}

fn write_summary(
    config: &RunConfig,
    instance: &InstanceHandle,
    ami: &str,
    started_at: DateTime<Utc>,
) -> Result<()> {
    let Some(path) = &config.output else {
        return Ok(());
    };

    let summary = RunSummary {
        run_id: config.run_id.clone(),
        instance_id: instance.instance_id.clone(),
        instance_type: instance.instance_type.clone(),
        ami: ami.to_string(),
        branch: config.branch.clone(),
        started_at,
        finished_at: Utc::now(),
        artifact: ARTIFACT_GLOB.to_string(),
    };

    std::fs::write(path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("Failed to write run summary to {}", path.display()))?;
    info!(path = %path.display(), "Run summary written");
    Ok(())
}

/// One printable line per instance of the requested type.
///
/// The provider query already filters server-side; the type check here keeps
/// stray results out of the output regardless.
fn render_instance_rows(instances: &[InstanceHandle], instance_type: &str) -> Vec<String> {
    instances
        .iter()
        .filter(|i| i.instance_type == instance_type)
        .map(|i| {
            format!(
                "{} {} {}",
                i.instance_id,
                i.public_dns_name.as_deref().unwrap_or("-"),
                i.state
            )
        })
        .collect()
}

/// Print all instances of the given type
pub async fn list_instances(ec2: &impl Ec2Operations, instance_type: &str) -> Result<()> {
    println!("All instances of type {instance_type}");
    let instances = ec2.instances_of_type(instance_type).await?;
    for row in render_instance_rows(&instances, instance_type) {
        println!("{row}");
    }
    Ok(())
}

/// Terminate every instance of the given type.
///
/// All terminate requests are issued first, then termination is awaited for
/// each, so the instances shut down in parallel on the provider side.
pub async fn terminate_instances(ec2: &impl Ec2Operations, instance_type: &str) -> Result<()> {
    println!("Terminating all instances of type {instance_type}");
    let instances = ec2.instances_of_type(instance_type).await?;

    for instance in &instances {
        println!("Terminating {}", instance.instance_id);
        ec2.terminate(&instance.instance_id).await?;
    }

    println!("Waiting for termination to complete");
    for instance in &instances {
        ec2.wait_for_terminated(&instance.instance_id).await?;
    }
    Ok(())
}

/// Allocate an instance and install the package manager needed to exercise a
/// built wheel. Wheel installation and the test run itself are not
/// implemented; the instance is left running for manual use.
///
/// TODO: pip-install the wheel under test and run the torch smoke tests.
pub async fn start_test(ec2: &impl Ec2Operations, config: &RunConfig) -> Result<()> {
    let instance = start_instance(ec2, config.os.ami(), &config.instance_type).await?;
    let addr = instance
        .public_dns_name
        .as_deref()
        .context("Running instance has no public DNS name")?;

    wait_for_connection(
        addr,
        SSH_PORT,
        config.reachability.interval,
        config.reachability.max_attempts,
    )
    .await?;

    let ssh = SshSession::new(addr, config.key_file.clone(), host_trust(config));
    println!("Configuring the system");
    ssh.run("sudo apt-get update").await?;
    ssh.run("sudo apt-get install -y python3-pip").await?;

    warn!(
        instance_id = %instance.instance_id,
        "Test execution is not implemented; instance left running"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsImage;
    use crate::ec2::MockEc2Operations;
    use crate::wait::WaitConfig;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn handle(id: &str, instance_type: &str, state: &str) -> InstanceHandle {
        InstanceHandle {
            instance_id: id.to_string(),
            instance_type: instance_type.to_string(),
            public_dns_name: None,
            state: state.to_string(),
        }
    }

    fn test_config(key_file: PathBuf) -> RunConfig {
        RunConfig {
            run_id: "test-run".to_string(),
            os: OsImage::Ubuntu20_04,
            instance_type: "t4g.2xlarge".to_string(),
            branch: "master".to_string(),
            build_only: false,
            keep: false,
            key_file,
            known_hosts: None,
            output: None,
            reachability: WaitConfig {
                interval: Duration::from_millis(10),
                max_attempts: 2,
            },
        }
    }

    #[test]
    fn test_render_rows_filters_other_types() {
        let instances = vec![
            handle("i-aaa", "t4g.2xlarge", "running"),
            handle("i-bbb", "c6g.large", "running"),
            handle("i-ccc", "t4g.2xlarge", "pending"),
        ];

        let rows = render_instance_rows(&instances, "t4g.2xlarge");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| !r.contains("i-bbb")));
        assert_eq!(rows[0], "i-aaa - running");
        assert_eq!(rows[1], "i-ccc - pending");
    }

    #[test]
    fn test_render_rows_shows_dns_when_present() {
        let mut instance = handle("i-aaa", "t4g.2xlarge", "running");
        instance.public_dns_name = Some("ec2-1-2-3-4.compute.amazonaws.com".to_string());

        let rows = render_instance_rows(&[instance], "t4g.2xlarge");
        assert_eq!(rows, vec!["i-aaa ec2-1-2-3-4.compute.amazonaws.com running"]);
    }

    /// Call-order recording double for the termination-ordering property
    struct RecordingEc2 {
        calls: Arc<Mutex<Vec<String>>>,
        instances: Vec<InstanceHandle>,
    }

    impl Ec2Operations for RecordingEc2 {
        async fn launch(&self, _ami: &str, _instance_type: &str) -> Result<InstanceHandle> {
            unimplemented!("not used by terminate flow")
        }

        async fn wait_for_running(&self, _instance_id: &str) -> Result<InstanceHandle> {
            unimplemented!("not used by terminate flow")
        }

        async fn terminate(&self, instance_id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("terminate {instance_id}"));
            Ok(())
        }

        async fn wait_for_terminated(&self, instance_id: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("wait {instance_id}"));
            Ok(())
        }

        async fn instances_of_type(&self, _instance_type: &str) -> Result<Vec<InstanceHandle>> {
            Ok(self.instances.clone())
        }

        async fn instance_by_id(&self, _instance_id: &str) -> Result<Option<InstanceHandle>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_terminate_all_before_waiting_on_any() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ec2 = RecordingEc2 {
            calls: calls.clone(),
            instances: vec![
                handle("i-1", "t4g.2xlarge", "running"),
                handle("i-2", "t4g.2xlarge", "running"),
                handle("i-3", "t4g.2xlarge", "running"),
            ],
        };

        terminate_instances(&ec2, "t4g.2xlarge").await.unwrap();

        let calls = calls.lock().unwrap();
        let last_terminate = calls
            .iter()
            .rposition(|c| c.starts_with("terminate"))
            .unwrap();
        let first_wait = calls.iter().position(|c| c.starts_with("wait")).unwrap();

        assert_eq!(calls.iter().filter(|c| c.starts_with("terminate")).count(), 3);
        assert_eq!(calls.iter().filter(|c| c.starts_with("wait")).count(), 3);
        assert!(last_terminate < first_wait, "calls: {calls:?}");
    }

    #[tokio::test]
    async fn test_run_build_terminates_on_pipeline_failure() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let config = test_config(key.path().to_path_buf());

        let mut ec2 = MockEc2Operations::new();
        ec2.expect_launch()
            .returning(|_, _| Ok(handle("i-build", "t4g.2xlarge", "pending")));
        ec2.expect_wait_for_running().returning(|_| {
            let mut running = handle("i-build", "t4g.2xlarge", "running");
            // Unresolvable host: reachability wait fails fast
            running.public_dns_name = Some("invalid.host.invalid".to_string());
            Ok(running)
        });
        ec2.expect_terminate()
            .times(1)
            .withf(|id| id == "i-build")
            .returning(|_| Ok(()));
        ec2.expect_wait_for_terminated()
            .times(1)
            .withf(|id| id == "i-build")
            .returning(|_| Ok(()));

        let result = run_build(&ec2, &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_build_keep_skips_termination() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let mut config = test_config(key.path().to_path_buf());
        config.keep = true;

        let mut ec2 = MockEc2Operations::new();
        ec2.expect_launch()
            .returning(|_, _| Ok(handle("i-keep", "t4g.2xlarge", "pending")));
        ec2.expect_wait_for_running().returning(|_| {
            let mut running = handle("i-keep", "t4g.2xlarge", "running");
            running.public_dns_name = Some("invalid.host.invalid".to_string());
            Ok(running)
        });
        ec2.expect_terminate().times(0);
        ec2.expect_wait_for_terminated().times(0);

        let result = run_build(&ec2, &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_build_rejects_invalid_config_before_launch() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let mut config = test_config(key.path().to_path_buf());
        config.branch = String::new();

        let mut ec2 = MockEc2Operations::new();
        ec2.expect_launch().times(0);

        let result = run_build(&ec2, &config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_build_fails_without_public_dns() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let config = test_config(key.path().to_path_buf());

        let mut ec2 = MockEc2Operations::new();
        ec2.expect_launch()
            .returning(|_, _| Ok(handle("i-nodns", "t4g.2xlarge", "pending")));
        // Running but no DNS name: the build must fail, not hang
        ec2.expect_wait_for_running()
            .returning(|_| Ok(handle("i-nodns", "t4g.2xlarge", "running")));
        ec2.expect_terminate().times(1).returning(|_| Ok(()));
        ec2.expect_wait_for_terminated()
            .times(1)
            .returning(|_| Ok(()));

        let err = run_build(&ec2, &config).await.unwrap_err();
        assert!(err.to_string().contains("no public DNS name"));
    }
}
