//! # rnaccess - Network Device CLI Access
//!
//! `rnaccess` logs into network devices over SSH, Telnet or SNMP, picking the
//! first protocol and credential that works, and gives scripts a CLI session
//! that waits for prompts and returns clean text.
//!
//! ## Features
//!
//! - **Protocol Negotiation**: Driver protocols in order, every compatible credential
//! - **Failure Classification**: Retry on bad credentials, abandon unreachable protocols
//! - **Adaptive Credential Cache**: Remembers the auto-tried credential that worked
//! - **Expect-Style Reading**: Ordered regex patterns with an inactivity timeout
//! - **Output Cleanup**: ANSI codes, backspaces and carriage-return overwrites are resolved
//! - **Maximum Compatibility**: SSH algorithm profiles for legacy devices, minimal Telnet
//! - **Async/Await**: Built on Tokio
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rnaccess::device::{CredentialSet, Device, DeviceDriver, Protocol, SshAccount};
//! use rnaccess::error::ConnectError;
//! use rnaccess::negotiator::{DeviceAccess, Negotiator, SessionRunner};
//!
//! struct ShowVersion;
//!
//! #[async_trait]
//! impl SessionRunner for ShowVersion {
//!     async fn run(
//!         &mut self,
//!         access: DeviceAccess<'_>,
//!         _protocol: Protocol,
//!         _account: &CredentialSet,
//!     ) -> Result<(), ConnectError> {
//!         if let DeviceAccess::Cli(cli) = access {
//!             cli.read_until(&[r"[>#]\s*$"]).await?;
//!             let output = cli.send("show version\n", &[r"[>#]\s*$"]).await?;
//!             println!("{output}");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = DeviceDriver::new("cisco_ios", vec![Protocol::Ssh, Protocol::Telnet]);
//!     let mut device = Device::new("core-sw1", "192.168.1.1".parse()?, driver);
//!     device.credential_sets.push(CredentialSet::SshPassword(SshAccount {
//!         name: "lab".to_string(),
//!         username: "admin".to_string(),
//!         password: "password".to_string(),
//!         super_password: None,
//!     }));
//!
//!     Negotiator::default()
//!         .connect_run(&mut device, None, &mut ShowVersion)
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`negotiator::Negotiator`] - Protocol and credential negotiation
//! - [`session::CliSession`] - Interactive session with expect-style reads
//! - [`session::normalize`] - Terminal output cleanup pipeline
//! - [`device`] - Device, driver and credential model
//! - [`error::ConnectError`] - Error types and failure classification
//! - [`config`] - Default timeouts and SSH algorithm tables

pub mod config;
pub mod device;
pub mod error;
pub mod negotiator;
pub mod session;
