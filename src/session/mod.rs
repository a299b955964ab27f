//! Interactive CLI sessions over SSH and Telnet.
//!
//! A [`CliSession`] wraps a [`CliTransport`] that, once authenticated, hands
//! over a pair of byte channels. Everything above the transport (writing
//! commands, waiting for expect patterns, cleaning terminal output) lives here.
//!
//! # Main Components
//!
//! - [`CliSession`] - Per-connection object driven by scripts
//! - [`CliTransport`] - Transport session contract (SSH, Telnet, test doubles)
//! - [`SshTransport`] / [`TelnetTransport`] - Built-in transports
//! - [`CommandInput`] - A command with its expect patterns and overrides
//! - [`CommandOutput`] - Cleaned output and match details of one read

use async_ssh2_tokio::ServerCheckMethod;
use async_trait::async_trait;
use log::{debug, trace};
use regex::{Captures, Regex, RegexBuilder};
use russh::Preferred;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Instant;

use crate::config;
use crate::device::Protocol;
use crate::error::ConnectError;

pub use normalize::{CleanupAction, CleanupActions, normalize};
pub use recording::{SessionEvent, SessionRecordEntry, SessionRecordLevel, SessionRecorder};
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::{SshAuth, SshTransport};
pub use telnet::{TelnetCodec, TelnetTransport};

use reader::{ReadRequest, SessionReader};

/// Buffer size of the channels between a transport I/O task and its session.
const STREAM_BUFFER: usize = 256;

/// Byte streams handed over by a transport once authenticated.
pub struct ShellStreams {
    /// Bytes received from the device.
    pub input: Receiver<Vec<u8>>,
    /// Bytes to send to the device.
    pub output: Sender<Vec<u8>>,
}

/// Transport side of a [`ShellStreams`] pair.
pub struct ShellPeer {
    pub to_session: Sender<Vec<u8>>,
    pub from_session: Receiver<Vec<u8>>,
}

impl ShellStreams {
    /// Creates connected session/transport channel ends.
    pub fn pair() -> (ShellStreams, ShellPeer) {
        let (to_session, input) = mpsc::channel(STREAM_BUFFER);
        let (output, from_session) = mpsc::channel(STREAM_BUFFER);
        (
            ShellStreams { input, output },
            ShellPeer {
                to_session,
                from_session,
            },
        )
    }
}

/// A protocol-specific connection that yields an interactive byte stream.
#[async_trait]
pub trait CliTransport: Send {
    fn protocol(&self) -> Protocol;

    /// `address:port`, for logging.
    fn target(&self) -> String;

    /// Opens the connection and authenticates.
    async fn connect(&mut self, config: &SessionConfig) -> Result<ShellStreams, ConnectError>;

    /// Releases transport resources. Must be safe to call repeatedly, including
    /// after a failed `connect`.
    async fn disconnect(&mut self);
}

/// Session timeouts and cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    /// TCP connect and handshake timeout.
    pub connection_timeout_ms: u64,
    /// Transport-level receive timeout.
    pub receive_timeout_ms: u64,
    /// Maximum time without new bytes before a read fails.
    pub command_timeout_ms: u64,
    pub cleanup_actions: CleanupActions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: config::DEFAULT_CONNECTION_TIMEOUT_MS,
            receive_timeout_ms: config::DEFAULT_RECEIVE_TIMEOUT_MS,
            command_timeout_ms: config::DEFAULT_COMMAND_TIMEOUT_MS,
            cleanup_actions: CleanupActions::default(),
        }
    }
}

impl SessionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// A command to send and the patterns that end its output.
#[derive(Debug, Clone, Default)]
pub struct CommandInput {
    /// Written as is. `None` only waits for output.
    pub command: Option<String>,
    /// Tested in order, first match wins.
    pub expects: Vec<String>,
    /// Overrides the session command timeout.
    pub command_timeout: Option<Duration>,
    /// Overrides the session cleanup actions.
    pub cleanup_actions: Option<CleanupActions>,
    /// Quiet period after the last received bytes before patterns are tested.
    pub discover_wait: Option<Duration>,
}

impl CommandInput {
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    /// Waits for output without sending anything.
    pub fn wait() -> Self {
        Self::default()
    }

    pub fn expect(mut self, pattern: impl Into<String>) -> Self {
        self.expects.push(pattern.into());
        self
    }

    pub fn expects<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expects.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn cleanup_actions(mut self, actions: CleanupActions) -> Self {
        self.cleanup_actions = Some(actions);
        self
    }

    pub fn discover_wait(mut self, wait: Duration) -> Self {
        self.discover_wait = Some(wait);
        self
    }
}

/// Match details of an expect pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectMatch {
    /// Matched text.
    pub text: String,
    pub start: usize,
    pub end: usize,
    /// Capture groups, index 0 being the whole match.
    pub groups: Vec<Option<String>>,
    pub named: HashMap<String, String>,
}

impl ExpectMatch {
    pub(crate) fn from_captures(pattern: &Regex, caps: &Captures<'_>) -> Self {
        let whole = caps.get(0);
        let groups = caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()))
            .collect();
        let named = pattern
            .capture_names()
            .flatten()
            .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
            .collect();
        Self {
            text: whole.map(|m| m.as_str().to_string()).unwrap_or_default(),
            start: whole.map(|m| m.start()).unwrap_or_default(),
            end: whole.map(|m| m.end()).unwrap_or_default(),
            groups,
            named,
        }
    }

    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }

    pub fn name(&self, name: &str) -> Option<&str> {
        self.named.get(name).map(String::as_str)
    }
}

/// Result of one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: Option<String>,
    /// Cleaned output, without the matched prompt when `STRIP_PROMPT` is enabled.
    pub output: String,
    /// Cleaned output including the prompt.
    pub full_output: String,
    /// Bytes received during the read, before cleanup.
    pub raw_buffer: String,
    pub expect_match: Option<ExpectMatch>,
    pub expect_match_index: Option<usize>,
    pub expect_match_pattern: Option<String>,
}

/// Bookkeeping of the most recent successful read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchState {
    pub last_command: Option<String>,
    pub last_expect_match: Option<ExpectMatch>,
    pub last_expect_match_index: Option<usize>,
    pub last_expect_match_pattern: Option<String>,
    pub last_full_output: Option<String>,
}

/// Interrupts a blocked read from another task.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    /// The pending or next read fails with [`ConnectError::Interrupted`].
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consumes a pending interrupt.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Milliseconds of `duration`, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Compiles an expect pattern in multiline mode.
pub fn compile_expect(pattern: &str) -> Result<Regex, ConnectError> {
    Ok(RegexBuilder::new(pattern).multi_line(true).build()?)
}

/// An interactive CLI session over any [`CliTransport`].
pub struct CliSession {
    transport: Box<dyn CliTransport>,
    config: SessionConfig,
    reader: Option<SessionReader>,
    writer: Option<Sender<Vec<u8>>>,
    state: MatchState,
    interrupt: InterruptHandle,
    recorder: Option<SessionRecorder>,
}

impl CliSession {
    pub fn new(transport: Box<dyn CliTransport>, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            reader: None,
            writer: None,
            state: MatchState::default(),
            interrupt: InterruptHandle::default(),
            recorder: None,
        }
    }

    /// Attaches a recorder that receives this session's events.
    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.transport.protocol()
    }

    pub fn target(&self) -> String {
        self.transport.target()
    }

    fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder.as_ref() {
            let _ = recorder.record_event(event);
        }
    }

    /// Connects the transport and takes over its streams.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        debug!("Connecting via {} to {}", self.protocol(), self.target());
        let streams = self.transport.connect(&self.config).await?;
        self.reader = Some(SessionReader::new(streams.input));
        self.writer = Some(streams.output);
        self.record(SessionEvent::Connected {
            protocol: self.protocol(),
            target: self.target(),
        });
        Ok(())
    }

    /// Closes the session. Safe to call at any time, any number of times.
    pub async fn disconnect(&mut self) {
        let was_open = self.reader.take().is_some();
        self.writer = None;
        self.transport.disconnect().await;
        if was_open {
            debug!("Disconnected from {}", self.target());
            self.record(SessionEvent::ConnectionClosed {
                target: self.target(),
                reason: "disconnect".to_string(),
            });
        }
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some() && self.writer.as_ref().is_some_and(|w| !w.is_closed())
    }

    /// Writes raw text to the device.
    pub async fn write(&mut self, data: &str) -> Result<(), ConnectError> {
        let writer = self.writer.as_ref().ok_or(ConnectError::ConnectClosedError)?;
        trace!("Writing {:?} to {}", data, self.transport.target());
        writer.send(data.as_bytes().to_vec()).await?;
        Ok(())
    }

    /// Sends `command` and waits until one of `expects` matches.
    ///
    /// The command is written as given, so it normally ends with a newline.
    pub async fn send(&mut self, command: &str, expects: &[&str]) -> Result<String, ConnectError> {
        let input = CommandInput::command(command).expects(expects.iter().copied());
        Ok(self.send_input(input).await?.output)
    }

    /// Waits until one of `expects` matches, without sending anything.
    pub async fn read_until(&mut self, expects: &[&str]) -> Result<String, ConnectError> {
        let input = CommandInput::wait().expects(expects.iter().copied());
        Ok(self.send_input(input).await?.output)
    }

    /// Sends an optional command and reads its output.
    pub async fn send_input(&mut self, input: CommandInput) -> Result<CommandOutput, ConnectError> {
        let patterns = input
            .expects
            .iter()
            .map(|p| compile_expect(p))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(command) = input.command.as_deref() {
            self.write(command).await?;
            debug!("Sent {:?} to {}", command.trim_end(), self.target());
            self.state.last_command = Some(command.to_string());
            self.record(SessionEvent::CommandSent {
                command: command.to_string(),
            });
        }

        let reader = self.reader.as_mut().ok_or(ConnectError::ConnectClosedError)?;
        let actions = input
            .cleanup_actions
            .as_ref()
            .unwrap_or(&self.config.cleanup_actions);
        let request = ReadRequest {
            expects: &input.expects,
            patterns: &patterns,
            command_timeout: input
                .command_timeout
                .unwrap_or_else(|| self.config.command_timeout()),
            discover_wait: input.discover_wait.unwrap_or(Duration::ZERO),
            actions,
        };

        match reader
            .read_until(request, &self.interrupt, self.recorder.as_ref())
            .await
        {
            Ok(mut output) => {
                output.command = input.command;
                self.state.last_expect_match = output.expect_match.clone();
                self.state.last_expect_match_index = output.expect_match_index;
                self.state.last_expect_match_pattern = output.expect_match_pattern.clone();
                self.state.last_full_output = Some(output.full_output.clone());
                self.record(SessionEvent::CommandOutput {
                    command: output.command.clone(),
                    output: output.output.clone(),
                    expect_match_pattern: output.expect_match_pattern.clone(),
                });
                Ok(output)
            }
            Err(ConnectError::ReadTimeout(raw_buffer)) => {
                debug!("Timeout waiting for {:?} on {}", input.expects, self.target());
                self.record(SessionEvent::ReadTimeout {
                    raw_buffer: raw_buffer.clone(),
                });
                Err(ConnectError::ReadTimeout(raw_buffer))
            }
            Err(err) => Err(err),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn match_state(&self) -> &MatchState {
        &self.state
    }

    pub fn last_command(&self) -> Option<&str> {
        self.state.last_command.as_deref()
    }

    pub fn last_expect_match(&self) -> Option<&ExpectMatch> {
        self.state.last_expect_match.as_ref()
    }

    pub fn last_expect_match_index(&self) -> Option<usize> {
        self.state.last_expect_match_index
    }

    pub fn last_expect_match_pattern(&self) -> Option<&str> {
        self.state.last_expect_match_pattern.as_deref()
    }

    pub fn last_full_output(&self) -> Option<&str> {
        self.state.last_full_output.as_deref()
    }

    pub fn connection_timeout(&self) -> Duration {
        self.config.connection_timeout()
    }

    pub fn set_connection_timeout(&mut self, timeout: Duration) {
        self.config.connection_timeout_ms = millis(timeout);
    }

    pub fn receive_timeout(&self) -> Duration {
        self.config.receive_timeout()
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.config.receive_timeout_ms = millis(timeout);
    }

    pub fn command_timeout(&self) -> Duration {
        self.config.command_timeout()
    }

    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.config.command_timeout_ms = millis(timeout);
    }

    pub fn cleanup_actions(&self) -> &CleanupActions {
        &self.config.cleanup_actions
    }

    pub fn set_cleanup_actions(&mut self, actions: CleanupActions) {
        self.config.cleanup_actions = actions;
    }

    /// Enables or disables a single cleanup action.
    pub fn set_cleanup_action(&mut self, action: CleanupAction, enabled: bool) {
        self.config.cleanup_actions.set(action, enabled);
    }

    /// Handle that interrupts this session's reads from another task.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

mod normalize;
mod reader;
mod recording;
mod security;
mod ssh;
mod telnet;
