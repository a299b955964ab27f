use async_trait::async_trait;
use rnaccess::device::{CredentialSet, Device, Protocol};
use rnaccess::error::ConnectError;
use rnaccess::negotiator::{DeviceAccess, Negotiator, SessionRunner};
use rnaccess::session::{CliSession, SessionRecordLevel, SessionRecorder};
use std::error::Error;
use std::fs;

const PROMPT: &str = r"(?m)^\S+[>#]\s*$";
const LOGIN: &str = r"(?i)(username|login):\s*$";
const PASSWORD: &str = r"(?i)password:\s*$";
const LOGIN_REJECTED: &str = r"(?i)(login invalid|authentication failed|incorrect)";

/// Logs in when needed, then collects `show version`.
#[derive(Default)]
struct VersionAudit {
    report: Option<String>,
}

impl VersionAudit {
    async fn telnet_login(
        cli: &mut CliSession,
        account: &CredentialSet,
    ) -> Result<(), ConnectError> {
        let username = account.username().unwrap_or_default();
        let password = account.password().unwrap_or_default();

        cli.read_until(&[LOGIN]).await?;
        cli.send(&format!("{username}\n"), &[PASSWORD]).await?;
        cli.send(&format!("{password}\n"), &[LOGIN_REJECTED, PROMPT, LOGIN])
            .await?;
        match cli.last_expect_match_index() {
            Some(1) => Ok(()),
            _ => Err(ConnectError::AuthenticationFailure(format!(
                "Telnet login rejected for {username}"
            ))),
        }
    }
}

#[async_trait]
impl SessionRunner for VersionAudit {
    async fn run(
        &mut self,
        access: DeviceAccess<'_>,
        protocol: Protocol,
        account: &CredentialSet,
    ) -> Result<(), ConnectError> {
        let DeviceAccess::Cli(cli) = access else {
            return Err(ConnectError::ScriptFailure(format!(
                "{protocol} is not a CLI protocol"
            )));
        };

        match protocol {
            Protocol::Telnet => Self::telnet_login(cli, account).await?,
            _ => {
                cli.read_until(&[PROMPT]).await?;
            }
        }

        cli.send("terminal length 0\n", &[PROMPT]).await?;
        let version = cli.send("show version\n", &[PROMPT]).await?;
        if version.trim().is_empty() {
            return Err(ConnectError::ScriptFailure(
                "empty show version output".to_string(),
            ));
        }
        self.report = Some(version);
        Ok(())
    }
}

fn print_usage() {
    eprintln!("Usage: cargo run --example device_audit -- <device.json> [--log]");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    let Some(path) = args.get(1) else {
        print_usage();
        std::process::exit(2);
    };
    let show_log = args.iter().any(|arg| arg == "--log");

    let mut device: Device = serde_json::from_str(&fs::read_to_string(path)?)?;
    let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);
    let negotiator = Negotiator::default().with_recorder(recorder.clone());

    let mut audit = VersionAudit::default();
    let result = negotiator.connect_run(&mut device, None, &mut audit).await;

    if show_log {
        println!("{}", recorder.to_log()?);
    }
    result?;

    println!("device={} address={}", device.name, device.connect_address());
    if let Some(report) = audit.report {
        println!("{report}");
    }
    // Credentials may have been updated by the auto-try tier.
    fs::write(path, serde_json::to_string_pretty(&device)?)?;
    Ok(())
}
