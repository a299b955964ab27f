//! Error types for device access, output reading and credential negotiation.
//!
//! This module defines all errors that can occur while connecting to a device,
//! reading its CLI output and negotiating a working protocol/credential pair.

use once_cell::sync::Lazy;
use regex::RegexSet;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Errors that can occur during device access and negotiation.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The device rejected the credential.
    ///
    /// Recovered locally by the negotiator, which moves on to the next
    /// credential of the same protocol.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The device could not be reached for reasons unrelated to credentials
    /// (refused connection, DNS failure, handshake error...).
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// No new bytes arrived within the command timeout.
    ///
    /// The error contains the raw, un-normalized output received so far.
    #[error("timeout waiting for the command output: {0:?}")]
    ReadTimeout(String),

    /// The script run against the session failed. Never retried.
    #[error("script failure: {0}")]
    ScriptFailure(String),

    /// Every candidate credential was tried and none was accepted.
    #[error("no valid credentials found")]
    NoCredentialsFound,

    /// Every attempted CLI protocol failed at the transport level.
    #[error("failed to connect via SSH or Telnet")]
    NoReachableProtocol,

    /// The transport stream was closed while waiting for output.
    #[error("channel disconnect on wait output")]
    ChannelDisconnectError,

    /// The session is not connected.
    #[error("connect closed")]
    ConnectClosedError,

    /// A blocking read was interrupted through its interrupt handle.
    #[error("interrupted while waiting for data")]
    Interrupted,

    /// An expect pattern failed to compile.
    #[error("invalid expect pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The SNMP agent answered but has no such object.
    #[error("noSuchObject: {0}")]
    NoSuchObject(String),

    /// The requested protocol has no transport available.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// Failed to send data to the transport.
    #[error("Failed to send data: {0}")]
    SendDataError(#[from] SendError<Vec<u8>>),

    /// The session recorder could not store or encode an event.
    #[error("recorder error: {0}")]
    RecorderError(String),
}

/// How the negotiator reacts to an error raised while trying a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Bad credential: try the next credential of the same protocol.
    Authentication,
    /// Host/port unusable: abandon the protocol.
    Transport,
    /// Script-level error: abort the whole negotiation.
    Script,
}

/// Whole library messages that are actually caused by rejected credentials.
static AUTH_FAILURE_MESSAGES: Lazy<RegexSet> = Lazy::new(|| {
    match RegexSet::new([
        r"(?i)^no more authentication methods available$",
        r"(?i)^protocol error: expected packet type 61, got 50$",
        r"(?i)^permission denied \([a-z0-9,-]+\)\.?$",
        r"(?i)^authentication failed\.?$",
    ]) {
        Ok(set) => set,
        Err(err) => panic!("invalid AUTH_FAILURE_MESSAGES regex: {err}"),
    }
});

impl ConnectError {
    /// Classifies this error for the negotiator's retry/fallback policy.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            ConnectError::AuthenticationFailure(_) => FailureClass::Authentication,
            ConnectError::ScriptFailure(_) | ConnectError::InvalidPattern(_) => {
                FailureClass::Script
            }
            ConnectError::Ssh2Error(
                async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed,
            ) => FailureClass::Authentication,
            other => match other.library_message() {
                Some(message) if AUTH_FAILURE_MESSAGES.is_match(message.trim()) => {
                    FailureClass::Authentication
                }
                _ => FailureClass::Transport,
            },
        }
    }

    /// Message of an error raised by the SSH libraries. OS errors and read
    /// diagnostics carry device or system text and have none.
    fn library_message(&self) -> Option<String> {
        match self {
            ConnectError::TransportFailure(message) => Some(message.clone()),
            ConnectError::RusshError(err) => Some(err.to_string()),
            ConnectError::Ssh2Error(err) => Some(err.to_string()),
            _ => None,
        }
    }

    /// Returns true if the root cause of this error is a rejected credential.
    pub fn is_authentication_failure(&self) -> bool {
        self.failure_class() == FailureClass::Authentication
    }

    /// Returns true for an SNMP "no such object" answer.
    pub fn is_no_such_object(&self) -> bool {
        match self {
            ConnectError::NoSuchObject(_) => true,
            other => other.to_string().contains("noSuchObject"),
        }
    }
}
