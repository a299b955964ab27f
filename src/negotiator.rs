//! Protocol and credential negotiation.
//!
//! Given a [`Device`], the [`Negotiator`] walks the driver's protocols in
//! order, tries every compatible credential and hands the first working
//! session to a [`SessionRunner`]. Rejected credentials move on to the next
//! credential, unreachable protocols are abandoned, script errors abort
//! everything. When the device's own credentials are exhausted and auto-try is
//! enabled, the global pool is tried next and the winner is remembered on the
//! device.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::config;
use crate::device::{CredentialSet, Device, DeviceDriver, Protocol};
use crate::error::{ConnectError, FailureClass};
use crate::session::{
    CliSession, CliTransport, SessionConfig, SessionEvent, SessionRecorder, SshTransport,
    TelnetTransport,
};

/// SNMP client used to query and poll a device.
#[async_trait]
pub trait SnmpPoller: Send {
    /// Reads one OID as a string. A missing object should surface as
    /// [`ConnectError::NoSuchObject`].
    async fn get_as_string(&mut self, oid: &str) -> Result<String, ConnectError>;

    async fn stop(&mut self);
}

/// Live access handed to the runner.
pub enum DeviceAccess<'a> {
    Cli(&'a mut CliSession),
    Snmp(&'a mut dyn SnmpPoller),
}

impl DeviceAccess<'_> {
    pub fn protocol(&self) -> Protocol {
        match self {
            DeviceAccess::Cli(session) => session.protocol(),
            DeviceAccess::Snmp(_) => Protocol::Snmp,
        }
    }
}

/// Work to run once a protocol/credential pair is accepted.
///
/// Errors are classified like connection errors: an authentication failure
/// moves on to the next credential (Telnet logins are done here), a
/// [`ConnectError::ScriptFailure`] aborts the negotiation and anything else
/// abandons the protocol.
#[async_trait]
pub trait SessionRunner: Send {
    async fn run(
        &mut self,
        access: DeviceAccess<'_>,
        protocol: Protocol,
        account: &CredentialSet,
    ) -> Result<(), ConnectError>;
}

/// Builds transport sessions and SNMP pollers.
pub trait TransportFactory: Send + Sync {
    fn cli_transport(
        &self,
        protocol: Protocol,
        address: IpAddr,
        port: u16,
        account: &CredentialSet,
        driver: &DeviceDriver,
    ) -> Result<Box<dyn CliTransport>, ConnectError>;

    fn snmp_poller(
        &self,
        address: IpAddr,
        account: &CredentialSet,
    ) -> Result<Box<dyn SnmpPoller>, ConnectError>;
}

/// Creates an SNMP poller for an address and community.
pub type SnmpConnector =
    Arc<dyn Fn(IpAddr, &CredentialSet) -> Result<Box<dyn SnmpPoller>, ConnectError> + Send + Sync>;

/// SSH and Telnet over the network, SNMP through an optional connector.
#[derive(Clone, Default)]
pub struct NetworkTransports {
    snmp: Option<SnmpConnector>,
}

impl NetworkTransports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snmp<F>(mut self, connector: F) -> Self
    where
        F: Fn(IpAddr, &CredentialSet) -> Result<Box<dyn SnmpPoller>, ConnectError>
            + Send
            + Sync
            + 'static,
    {
        self.snmp = Some(Arc::new(connector));
        self
    }
}

impl TransportFactory for NetworkTransports {
    fn cli_transport(
        &self,
        protocol: Protocol,
        address: IpAddr,
        port: u16,
        account: &CredentialSet,
        driver: &DeviceDriver,
    ) -> Result<Box<dyn CliTransport>, ConnectError> {
        match protocol {
            Protocol::Ssh => Ok(Box::new(SshTransport::from_credential(
                address,
                port,
                account,
                driver.ssh_config(),
            )?)),
            Protocol::Telnet if account.is_compatible(Protocol::Telnet) => Ok(Box::new(
                TelnetTransport::new(address, port, driver.telnet_config().clone()),
            )),
            _ => Err(ConnectError::Unsupported(format!(
                "no {protocol} CLI transport for credentials {}",
                account.name()
            ))),
        }
    }

    fn snmp_poller(
        &self,
        address: IpAddr,
        account: &CredentialSet,
    ) -> Result<Box<dyn SnmpPoller>, ConnectError> {
        match self.snmp.as_ref() {
            Some(connector) => connector(address, account),
            None => Err(ConnectError::Unsupported(
                "no SNMP connector configured".to_string(),
            )),
        }
    }
}

/// Reachability bookkeeping of one negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    ssh_opened: bool,
    telnet_opened: bool,
    snmp_worth: bool,
    ssh_tried: bool,
    telnet_tried: bool,
}

impl Progress {
    fn new(driver: &DeviceDriver) -> Self {
        Self {
            ssh_opened: driver.supports(Protocol::Ssh),
            telnet_opened: driver.supports(Protocol::Telnet),
            snmp_worth: driver.supports(Protocol::Snmp),
            ssh_tried: false,
            telnet_tried: false,
        }
    }

    fn usable(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Ssh => self.ssh_opened,
            Protocol::Telnet => self.telnet_opened,
            Protocol::Snmp => self.snmp_worth,
        }
    }

    fn tried(&mut self, protocol: Protocol) {
        match protocol {
            Protocol::Ssh => self.ssh_tried = true,
            Protocol::Telnet => self.telnet_tried = true,
            Protocol::Snmp => {}
        }
    }

    fn abandon(&mut self, protocol: Protocol) {
        match protocol {
            Protocol::Ssh => self.ssh_opened = false,
            Protocol::Telnet => self.telnet_opened = false,
            Protocol::Snmp => {}
        }
    }

    fn any_reachable(&self) -> bool {
        self.ssh_opened || self.telnet_opened || self.snmp_worth
    }

    /// Every CLI protocol that was tried got abandoned.
    fn unreachable(&self) -> bool {
        let ssh_down = self.ssh_tried && !self.ssh_opened;
        let telnet_down = self.telnet_tried && !self.telnet_opened;
        (ssh_down && !self.telnet_tried)
            || (telnet_down && !self.ssh_tried)
            || (ssh_down && telnet_down)
    }
}

/// Ordered device-tier candidates: one-time credentials, else the specific
/// credential, else the device's own list.
fn candidate_pool(device: &Device, one_time: Option<&[CredentialSet]>) -> Vec<CredentialSet> {
    if let Some(one_time) = one_time.filter(|c| !c.is_empty()) {
        return one_time.to_vec();
    }
    if let Some(specific) = device.specific_credential() {
        return vec![specific.clone()];
    }
    device.credential_sets().to_vec()
}

/// Protocols of the driver in declared order, without duplicates.
fn ordered_protocols(driver: &DeviceDriver) -> Vec<Protocol> {
    let mut protocols = Vec::with_capacity(3);
    for protocol in driver.supported_protocols() {
        if !protocols.contains(protocol) {
            protocols.push(*protocol);
        }
    }
    protocols
}

/// Finds a working protocol and credential for a device and runs a script on it.
pub struct Negotiator {
    factory: Arc<dyn TransportFactory>,
    session_config: SessionConfig,
    auth_backoff: Duration,
    recorder: Option<SessionRecorder>,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new(NetworkTransports::new())
    }
}

impl Negotiator {
    pub fn new(factory: impl TransportFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            session_config: SessionConfig::default(),
            auth_backoff: config::AUTH_RETRY_BACKOFF,
            recorder: None,
        }
    }

    /// Configuration of every session this negotiator builds.
    pub fn with_session_config(mut self, session_config: SessionConfig) -> Self {
        self.session_config = session_config;
        self
    }

    /// Pause after a rejected credential.
    pub fn with_auth_backoff(mut self, backoff: Duration) -> Self {
        self.auth_backoff = backoff;
        self
    }

    /// Records negotiation events, and forwards the recorder to sessions.
    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder.as_ref() {
            let _ = recorder.record_event(event);
        }
    }

    /// Connects to `device` and calls `runner` exactly once on the first
    /// accepted protocol/credential pair.
    ///
    /// Non-empty `one_time` credentials replace the device's own. The device is
    /// only mutated when an auto-tried credential wins.
    pub async fn connect_run<R>(
        &self,
        device: &mut Device,
        one_time: Option<&[CredentialSet]>,
        runner: &mut R,
    ) -> Result<(), ConnectError>
    where
        R: SessionRunner + ?Sized,
    {
        let protocols = ordered_protocols(&device.driver);
        info!(
            "Connecting to {} ({}) via {:?}",
            device.name,
            device.connect_address(),
            protocols
        );
        self.record(SessionEvent::NegotiationStarted {
            device: device.name.clone(),
            protocols: protocols.clone(),
        });

        let mut progress = Progress::new(&device.driver);
        let pool = candidate_pool(device, one_time);
        if self
            .try_pool(device, &protocols, &pool, &mut progress, runner)
            .await?
            .is_some()
        {
            return Ok(());
        }

        if device.is_auto_try_credentials() && progress.any_reachable() {
            let auto_pool = device.auto_credential_set_list().to_vec();
            info!(
                "Auto-trying {} global credential sets on {}",
                auto_pool.len(),
                device.name
            );
            if let Some(winner) = self
                .try_pool(device, &protocols, &auto_pool, &mut progress, runner)
                .await?
            {
                info!(
                    "Credentials {} now stored on device {}",
                    winner.name(),
                    device.name
                );
                self.record(SessionEvent::CredentialCached {
                    device: device.name.clone(),
                    credential: winner.name().to_string(),
                });
                device.remember_credential(winner);
                return Ok(());
            }
        }

        if progress.unreachable() {
            warn!("Unable to reach {} via SSH or Telnet", device.name);
            Err(ConnectError::NoReachableProtocol)
        } else {
            warn!("No valid credentials found for {}", device.name);
            Err(ConnectError::NoCredentialsFound)
        }
    }

    async fn try_pool<R>(
        &self,
        device: &Device,
        protocols: &[Protocol],
        pool: &[CredentialSet],
        progress: &mut Progress,
        runner: &mut R,
    ) -> Result<Option<CredentialSet>, ConnectError>
    where
        R: SessionRunner + ?Sized,
    {
        for &protocol in protocols {
            if !progress.usable(protocol) {
                continue;
            }
            let winner = if protocol.is_cli() {
                self.try_cli(device, protocol, pool, progress, runner).await?
            } else {
                self.try_snmp(device, pool, runner).await?
            };
            if winner.is_some() {
                return Ok(winner);
            }
        }
        Ok(None)
    }

    async fn try_cli<R>(
        &self,
        device: &Device,
        protocol: Protocol,
        pool: &[CredentialSet],
        progress: &mut Progress,
        runner: &mut R,
    ) -> Result<Option<CredentialSet>, ConnectError>
    where
        R: SessionRunner + ?Sized,
    {
        let address = device.connect_address();
        let Some(port) = device.port_for(protocol) else {
            return Ok(None);
        };
        let target = format!("{address}:{port}");

        for credential in pool.iter().filter(|c| c.is_compatible(protocol)) {
            progress.tried(protocol);
            info!(
                "Trying {} to {} using credentials {}.",
                protocol,
                target,
                credential.name()
            );
            self.record(SessionEvent::AttemptStarted {
                protocol,
                target: target.clone(),
                credential: credential.name().to_string(),
            });

            let result = self
                .attempt_cli(device, protocol, address, port, credential, runner)
                .await;
            let err = match result {
                Ok(()) => return Ok(Some(credential.clone())),
                Err(err) => err,
            };

            match err.failure_class() {
                FailureClass::Authentication => {
                    warn!(
                        "Authentication failed using {} credentials {}: {}",
                        protocol,
                        credential.name(),
                        err
                    );
                    self.record(SessionEvent::AuthenticationFailed {
                        protocol,
                        credential: credential.name().to_string(),
                        reason: err.to_string(),
                    });
                    tokio::time::sleep(self.auth_backoff).await;
                }
                FailureClass::Script => return Err(err),
                FailureClass::Transport => {
                    warn!("Unable to connect using {} to {}: {}", protocol, target, err);
                    self.record(SessionEvent::ProtocolAbandoned {
                        protocol,
                        reason: err.to_string(),
                    });
                    progress.abandon(protocol);
                    break;
                }
            }
        }
        Ok(None)
    }

    /// One connection attempt. The session is disconnected whatever happens.
    async fn attempt_cli<R>(
        &self,
        device: &Device,
        protocol: Protocol,
        address: IpAddr,
        port: u16,
        credential: &CredentialSet,
        runner: &mut R,
    ) -> Result<(), ConnectError>
    where
        R: SessionRunner + ?Sized,
    {
        let transport =
            self.factory
                .cli_transport(protocol, address, port, credential, &device.driver)?;
        let mut session = CliSession::new(transport, self.session_config.clone());
        if let Some(recorder) = self.recorder.as_ref() {
            session = session.with_recorder(recorder.clone());
        }

        let result = match session.connect().await {
            Ok(()) => {
                info!(
                    "Connected using {} to {} using credentials {}.",
                    protocol,
                    session.target(),
                    credential.name()
                );
                runner
                    .run(DeviceAccess::Cli(&mut session), protocol, credential)
                    .await
            }
            Err(err) => Err(err),
        };
        session.disconnect().await;
        result
    }

    /// SNMP never abandons the protocol: a failing community moves on to the
    /// next one.
    async fn try_snmp<R>(
        &self,
        device: &Device,
        pool: &[CredentialSet],
        runner: &mut R,
    ) -> Result<Option<CredentialSet>, ConnectError>
    where
        R: SessionRunner + ?Sized,
    {
        let address = device.connect_address();

        for credential in pool.iter().filter(|c| c.is_compatible(Protocol::Snmp)) {
            info!(
                "Trying SNMP on {} using credentials {}.",
                address,
                credential.name()
            );
            self.record(SessionEvent::AttemptStarted {
                protocol: Protocol::Snmp,
                target: address.to_string(),
                credential: credential.name().to_string(),
            });

            let mut poller = match self.factory.snmp_poller(address, credential) {
                Ok(poller) => poller,
                Err(err) => {
                    warn!(
                        "Unable to poll {} using SNMP credentials {}: {}",
                        address,
                        credential.name(),
                        err
                    );
                    continue;
                }
            };
            let result = Self::check_and_run(poller.as_mut(), credential, runner).await;
            poller.stop().await;

            match result {
                Ok(()) => return Ok(Some(credential.clone())),
                Err(err) if err.failure_class() == FailureClass::Script => return Err(err),
                Err(err) => {
                    warn!(
                        "Unable to poll {} using SNMP credentials {}: {}",
                        address,
                        credential.name(),
                        err
                    );
                    self.record(SessionEvent::AuthenticationFailed {
                        protocol: Protocol::Snmp,
                        credential: credential.name().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(None)
    }

    async fn check_and_run<R>(
        poller: &mut dyn SnmpPoller,
        credential: &CredentialSet,
        runner: &mut R,
    ) -> Result<(), ConnectError>
    where
        R: SessionRunner + ?Sized,
    {
        match poller.get_as_string(config::SNMP_UPTIME_OID).await {
            Ok(uptime) => debug!("SNMP check answered sysUpTime {}", uptime),
            Err(err) if err.is_no_such_object() => debug!("SNMP check: {}", err),
            Err(err) => return Err(err),
        }
        runner
            .run(DeviceAccess::Snmp(poller), Protocol::Snmp, credential)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SnmpCommunity, SshAccount, TelnetAccount};
    use std::net::Ipv4Addr;

    fn ssh(name: &str) -> CredentialSet {
        CredentialSet::SshPassword(SshAccount {
            name: name.to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            super_password: None,
        })
    }

    fn telnet(name: &str) -> CredentialSet {
        CredentialSet::Telnet(TelnetAccount {
            name: name.to_string(),
            username: "admin".to_string(),
            password: "pw".to_string(),
            super_password: None,
        })
    }

    fn device(protocols: Vec<Protocol>) -> Device {
        Device::new(
            "edge1",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            DeviceDriver::new("generic", protocols),
        )
    }

    #[test]
    fn one_time_credentials_take_precedence() {
        let mut dev = device(vec![Protocol::Ssh]);
        dev.specific_credential = Some(ssh("specific"));
        dev.credential_sets = vec![ssh("own")];

        let one_time = [ssh("once")];
        let pool = candidate_pool(&dev, Some(&one_time[..]));
        assert_eq!(pool, vec![ssh("once")]);

        let pool = candidate_pool(&dev, Some(&[][..]));
        assert_eq!(pool, vec![ssh("specific")]);

        dev.specific_credential = None;
        let pool = candidate_pool(&dev, None);
        assert_eq!(pool, vec![ssh("own")]);
    }

    #[test]
    fn protocols_follow_driver_order_once() {
        let driver = DeviceDriver::new(
            "odd",
            vec![Protocol::Telnet, Protocol::Ssh, Protocol::Telnet],
        );
        assert_eq!(
            ordered_protocols(&driver),
            vec![Protocol::Telnet, Protocol::Ssh]
        );
    }

    #[test]
    fn unreachable_only_when_tried_protocols_were_abandoned() {
        let driver = DeviceDriver::new("d", vec![Protocol::Ssh, Protocol::Telnet]);

        let mut progress = Progress::new(&driver);
        assert!(!progress.unreachable());

        progress.tried(Protocol::Ssh);
        progress.abandon(Protocol::Ssh);
        assert!(progress.unreachable());

        progress.tried(Protocol::Telnet);
        assert!(!progress.unreachable());

        progress.abandon(Protocol::Telnet);
        assert!(progress.unreachable());
        assert!(!progress.any_reachable());
    }

    #[test]
    fn snmp_keeps_negotiation_reachable() {
        let driver = DeviceDriver::new("d", vec![Protocol::Ssh, Protocol::Snmp]);
        let mut progress = Progress::new(&driver);
        progress.tried(Protocol::Ssh);
        progress.abandon(Protocol::Ssh);
        assert!(progress.any_reachable());
        assert!(progress.usable(Protocol::Snmp));
    }

    #[test]
    fn network_transports_pick_transport_by_protocol() {
        let factory = NetworkTransports::new();
        let driver = DeviceDriver::new("d", vec![Protocol::Ssh, Protocol::Telnet]);
        let address = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let transport = factory
            .cli_transport(Protocol::Telnet, address, 23, &telnet("t"), &driver)
            .expect("telnet transport");
        assert_eq!(transport.protocol(), Protocol::Telnet);
        assert_eq!(transport.target(), "127.0.0.1:23");

        let transport = factory
            .cli_transport(Protocol::Ssh, address, 22, &ssh("s"), &driver)
            .expect("ssh transport");
        assert_eq!(transport.protocol(), Protocol::Ssh);

        assert!(
            factory
                .cli_transport(Protocol::Telnet, address, 23, &ssh("s"), &driver)
                .is_err()
        );

        let community = CredentialSet::SnmpV2c(SnmpCommunity {
            name: "ro".to_string(),
            community: "public".to_string(),
        });
        let err = factory
            .snmp_poller(address, &community)
            .err()
            .expect("no SNMP connector");
        assert!(matches!(err, ConnectError::Unsupported(_)));
    }
}
