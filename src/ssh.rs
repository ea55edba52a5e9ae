//! Remote command execution and artifact copy over SSH.
//!
//! Every command opens a fresh `ssh` process; there is no connection reuse
//! and no retry. A non-zero remote exit status is propagated as a local
//! error, which aborts the remaining pipeline.

use crate::config::SSH_USER;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// A command to run on the remote host.
///
/// A script is split on whitespace before being handed to `ssh`; the remote
/// shell re-joins and re-parses it, so shell operators (`;`, `||`, loops)
/// still work. A pre-tokenized argv is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    Script(String),
    Args(Vec<String>),
}

impl RemoteCommand {
    /// The argv appended after the `--` separator in the ssh invocation
    pub fn to_args(&self) -> Vec<String> {
        match self {
            RemoteCommand::Script(script) => {
                script.split_whitespace().map(str::to_string).collect()
            }
            RemoteCommand::Args(args) => args.clone(),
        }
    }
}

impl From<&str> for RemoteCommand {
    fn from(script: &str) -> Self {
        RemoteCommand::Script(script.to_string())
    }
}

impl From<String> for RemoteCommand {
    fn from(script: String) -> Self {
        RemoteCommand::Script(script)
    }
}

impl From<Vec<String>> for RemoteCommand {
    fn from(args: Vec<String>) -> Self {
        RemoteCommand::Args(args)
    }
}

impl From<&[&str]> for RemoteCommand {
    fn from(args: &[&str]) -> Self {
        RemoteCommand::Args(args.iter().map(|s| s.to_string()).collect())
    }
}

/// Host-key trust policy for the SSH transport.
///
/// `AcceptAny` disables host-key verification entirely. For ephemeral
/// instances that exist for the length of one build this trades authenticity
/// checking for not having to distribute host keys; the instance is created
/// and destroyed by the same operator within minutes. `Pinned` is the opt-in
/// alternative: strict checking against a caller-supplied known-hosts file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostTrust {
    #[default]
    AcceptAny,
    Pinned(PathBuf),
}

impl HostTrust {
    fn ssh_options(&self) -> Vec<String> {
        match self {
            HostTrust::AcceptAny => vec![
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
                "-o".to_string(),
                "UserKnownHostsFile=/dev/null".to_string(),
            ],
            HostTrust::Pinned(path) => vec![
                "-o".to_string(),
                "StrictHostKeyChecking=yes".to_string(),
                "-o".to_string(),
                format!("UserKnownHostsFile={}", path.display()),
            ],
        }
    }
}

/// One remote host with a fixed credential and trust policy.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: String,
    user: String,
    key_file: PathBuf,
    host_trust: HostTrust,
}

impl SshSession {
    pub fn new(host: impl Into<String>, key_file: PathBuf, host_trust: HostTrust) -> Self {
        Self {
            host: host.into(),
            user: SSH_USER.to_string(),
            key_file,
            host_trust,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Full ssh argv for the given command
    fn ssh_args(&self, cmd: &RemoteCommand) -> Vec<String> {
        let mut args = self.host_trust.ssh_options();
        args.push("-i".to_string());
        args.push(self.key_file.display().to_string());
        args.push(self.destination());
        args.push("--".to_string());
        args.extend(cmd.to_args());
        args
    }

    /// scp argv for copying `remote_path` into `local_dir`
    fn scp_args(&self, remote_path: &str, local_dir: &Path) -> Vec<String> {
        let mut args = self.host_trust.ssh_options();
        args.push("-i".to_string());
        args.push(self.key_file.display().to_string());
        args.push(format!("{}:{}", self.destination(), remote_path));
        args.push(local_dir.display().to_string());
        args
    }

    /// Run one command on the remote host, inheriting stdout/stderr.
    ///
    /// Fails if the remote process exits non-zero.
    pub async fn run(&self, cmd: impl Into<RemoteCommand>) -> Result<()> {
        let cmd = cmd.into();
        let args = self.ssh_args(&cmd);
        debug!(host = %self.host, args = ?args, "Running remote command");

        let status = Command::new("ssh")
            .args(&args)
            .status()
            .await
            .context("Failed to spawn ssh")?;

        if !status.success() {
            bail!(
                "Remote command {:?} failed on {} with {}",
                cmd.to_args().join(" "),
                self.host,
                status
            );
        }
        Ok(())
    }

    /// Copy files from the remote host into `local_dir` using the same
    /// credential and trust policy as `run`.
    ///
    /// `remote_path` may contain a glob; it is expanded by the remote side.
    pub async fn fetch(&self, remote_path: &str, local_dir: &Path) -> Result<()> {
        let args = self.scp_args(remote_path, local_dir);
        info!(host = %self.host, remote_path = %remote_path, "Copying files from remote host");
        debug!(args = ?args, "Running scp");

        let status = Command::new("scp")
            .args(&args)
            .status()
            .await
            .context("Failed to spawn scp")?;

        if !status.success() {
            bail!(
                "Copy of {} from {} failed with {}",
                remote_path,
                self.host,
                status
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SshSession {
        SshSession::new(
            "ec2-1-2-3-4.compute.amazonaws.com",
            PathBuf::from("/home/op/.ssh/wheel-builder.pem"),
            HostTrust::AcceptAny,
        )
    }

    #[test]
    fn test_script_tokenizes_on_whitespace() {
        let cmd = RemoteCommand::from("a b c");
        assert_eq!(cmd.to_args(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_script_collapses_repeated_whitespace() {
        let cmd = RemoteCommand::from("sudo  apt-get   update");
        assert_eq!(cmd.to_args(), vec!["sudo", "apt-get", "update"]);
    }

    #[test]
    fn test_args_pass_through_unchanged() {
        let argv = vec!["echo".to_string(), "hello world".to_string()];
        let cmd = RemoteCommand::from(argv.clone());
        assert_eq!(cmd.to_args(), argv);
    }

    #[test]
    fn test_ssh_args_accept_any() {
        let args = session().ssh_args(&RemoteCommand::from("a b c"));
        assert_eq!(
            args,
            vec![
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-i",
                "/home/op/.ssh/wheel-builder.pem",
                "ubuntu@ec2-1-2-3-4.compute.amazonaws.com",
                "--",
                "a",
                "b",
                "c",
            ]
        );
    }

    #[test]
    fn test_ssh_args_pinned_host_key() {
        let session = SshSession::new(
            "host",
            PathBuf::from("key.pem"),
            HostTrust::Pinned(PathBuf::from("/tmp/known_hosts")),
        );
        let args = session.ssh_args(&RemoteCommand::from("true"));
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/tmp/known_hosts".to_string()));
        assert!(!args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn test_scp_args() {
        let args = session().scp_args("pytorch/dist/*.whl", Path::new("."));
        assert_eq!(
            args,
            vec![
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-i",
                "/home/op/.ssh/wheel-builder.pem",
                "ubuntu@ec2-1-2-3-4.compute.amazonaws.com:pytorch/dist/*.whl",
                ".",
            ]
        );
    }
}
