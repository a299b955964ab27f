use super::*;
use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use russh::ChannelMsg;
use std::net::IpAddr;
use tokio::task::JoinHandle;

use crate::device::{CredentialSet, SshConfig};

/// How an SSH session authenticates.
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    Key {
        /// PEM/OpenSSH encoded private key.
        private_key: String,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(***)"),
            SshAuth::Key { .. } => f.write_str("Key(***)"),
        }
    }
}

impl SshAuth {
    fn method(&self) -> AuthMethod {
        match self {
            SshAuth::Password(password) => AuthMethod::with_password(password),
            SshAuth::Key {
                private_key,
                passphrase,
            } => AuthMethod::with_key(private_key, passphrase.as_deref()),
        }
    }
}

/// SSH transport session: shell channel bridged to a pair of byte channels.
pub struct SshTransport {
    address: IpAddr,
    port: u16,
    username: String,
    auth: SshAuth,
    ssh_config: SshConfig,
    client: Option<Client>,
    io_task: Option<JoinHandle<()>>,
}

impl SshTransport {
    pub fn new(
        address: IpAddr,
        port: u16,
        username: impl Into<String>,
        auth: SshAuth,
        ssh_config: SshConfig,
    ) -> Self {
        Self {
            address,
            port,
            username: username.into(),
            auth,
            ssh_config,
            client: None,
            io_task: None,
        }
    }

    /// Builds a transport from an SSH password or key credential.
    pub fn from_credential(
        address: IpAddr,
        port: u16,
        credential: &CredentialSet,
        ssh_config: &SshConfig,
    ) -> Result<Self, ConnectError> {
        let (username, auth) = match credential {
            CredentialSet::SshPassword(account) => (
                account.username.clone(),
                SshAuth::Password(account.password.clone()),
            ),
            CredentialSet::SshKey(account) => (
                account.username.clone(),
                SshAuth::Key {
                    private_key: account.private_key.clone(),
                    passphrase: account.passphrase.clone(),
                },
            ),
            other => {
                return Err(ConnectError::Unsupported(format!(
                    "credentials {} cannot be used for SSH",
                    other.name()
                )));
            }
        };
        Ok(Self::new(address, port, username, auth, ssh_config.clone()))
    }

    async fn open(&mut self, config: &SessionConfig) -> Result<ShellStreams, ConnectError> {
        let target = self.target();
        let security_options = self.ssh_config.security_options();

        let ssh_config = Config {
            preferred: security_options.preferred(),
            inactivity_timeout: Some(config.receive_timeout()),
            ..Default::default()
        };

        let client = tokio::time::timeout(
            config.connection_timeout(),
            Client::connect_with_config(
                (self.address.to_string(), self.port),
                &self.username,
                self.auth.method(),
                security_options.server_check.clone(),
                ssh_config,
            ),
        )
        .await
        .map_err(|_| {
            ConnectError::TransportFailure(format!("connection to {target} timed out"))
        })??;
        debug!("{} SSH authentication successful", target);

        let mut channel = client.get_channel().await?;
        self.client = Some(client);

        if self.ssh_config.use_pty {
            channel
                .request_pty(
                    false,
                    &self.ssh_config.terminal_type,
                    self.ssh_config.terminal_cols,
                    self.ssh_config.terminal_rows,
                    self.ssh_config.terminal_width,
                    self.ssh_config.terminal_height,
                    &[],
                )
                .await?;
        }
        channel.request_shell(false).await?;
        debug!("{} Shell request successful", target);

        let (streams, peer) = ShellStreams::pair();
        let ShellPeer {
            to_session,
            mut from_session,
        } = peer;

        self.io_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = from_session.recv() => {
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!("{} Failed to send data to shell: {:?}", target, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if to_session.send(data.to_vec()).await.is_err() {
                                    debug!("{} Session receiver dropped, closing task.", target);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} Shell exited with status code: {}", target, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} Shell sent EOF.", target);
                                break;
                            }
                            _ => {}
                        }
                    },
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended.", target);
        }));

        Ok(streams)
    }
}

#[async_trait]
impl CliTransport for SshTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    async fn connect(&mut self, config: &SessionConfig) -> Result<ShellStreams, ConnectError> {
        self.disconnect().await;
        self.open(config).await
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("{} SSH disconnect error ignored: {:?}", self.target(), e);
            }
        }
    }
}
