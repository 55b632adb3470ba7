//! SSH command execution and SFTP downloads against a libvirt host.

use crate::{ImportError, Result, log_debug, log_warn};
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    /// PEM or OpenSSH encoded private key.
    PrivateKey(String),
}

/// Accepts the host key when no fingerprint is pinned, otherwise only the pinned one.
struct HostKeyPolicy {
    fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let Some(expected) = self.fingerprint.as_deref() else {
            return Ok(true);
        };
        let expected = expected.trim_start_matches("SHA256:");
        let actual = server_public_key.fingerprint();
        if actual != expected {
            log_warn!("Rejecting SSH host key with fingerprint SHA256:{}", actual);
        }
        Ok(actual == expected)
    }
}

pub struct SshSession {
    handle: Handle<HostKeyPolicy>,
}

impl SshSession {
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        auth: &SshAuth,
        host_fingerprint: Option<String>,
    ) -> Result<Self> {
        let config = client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        };
        let policy = HostKeyPolicy {
            fingerprint: host_fingerprint,
        };
        let mut handle = client::connect(Arc::new(config), (host, port), policy).await?;

        let authenticated = match auth {
            SshAuth::Password(password) => handle.authenticate_password(username, password).await?,
            SshAuth::PrivateKey(pem) => {
                let key_pair = russh_keys::decode_secret_key(pem, None).map_err(|e| {
                    ImportError::Validation(format!("invalid SSH private key: {}", e))
                })?;
                handle
                    .authenticate_publickey(username, Arc::new(key_pair))
                    .await?
            }
        };
        if !authenticated {
            return Err(ImportError::Source(format!(
                "SSH authentication as '{}' to {}:{} was rejected",
                username, host, port
            )));
        }
        log_debug!("SSH session established to {}:{}", host, port);
        Ok(Self { handle })
    }

    /// Run `command` and return its stdout. Non-zero exit codes are errors
    /// carrying the command's stderr.
    pub async fn exec(&self, command: &str) -> Result<String> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            Some(code) => Err(ImportError::RemoteCommand {
                command: command.to_string(),
                stderr: format!(
                    "exit status {}: {}",
                    code,
                    String::from_utf8_lossy(&stderr).trim()
                ),
            }),
            None => Err(ImportError::RemoteCommand {
                command: command.to_string(),
                stderr: "channel closed without an exit status".to_string(),
            }),
        }
    }

    /// Copy `remote` to `local` over SFTP.
    pub async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ImportError::Transfer(format!("sftp session: {}", e)))?;
        let mut remote_file = sftp
            .open(remote)
            .await
            .map_err(|e| ImportError::Transfer(format!("sftp open {}: {}", remote, e)))?;

        let mut local_file = tokio::fs::File::create(local).await?;
        let copied = match tokio::io::copy(&mut remote_file, &mut local_file).await {
            Ok(copied) => copied,
            Err(e) => {
                drop(local_file);
                let _ = tokio::fs::remove_file(local).await;
                return Err(ImportError::Transfer(format!("sftp read {}: {}", remote, e)));
            }
        };
        let _ = sftp.close().await;
        log_debug!("Copied {} bytes from {}", copied, remote);
        Ok(copied)
    }

    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
