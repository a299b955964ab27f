use super::*;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record key events only.
    KeyEventsOnly,
    /// Record key events and raw chunks.
    #[default]
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Supported recorded event types.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    NegotiationStarted {
        device: String,
        protocols: Vec<Protocol>,
    },
    AttemptStarted {
        protocol: Protocol,
        target: String,
        credential: String,
    },
    AuthenticationFailed {
        protocol: Protocol,
        credential: String,
        reason: String,
    },
    ProtocolAbandoned {
        protocol: Protocol,
        reason: String,
    },
    Connected {
        protocol: Protocol,
        target: String,
    },
    CommandSent {
        command: String,
    },
    CommandOutput {
        #[serde(default)]
        command: Option<String>,
        output: String,
        #[serde(default)]
        expect_match_pattern: Option<String>,
    },
    ReadTimeout {
        raw_buffer: String,
    },
    RawChunk {
        data: String,
    },
    ConnectionClosed {
        target: String,
        reason: String,
    },
    CredentialCached {
        device: String,
        credential: String,
    },
}

impl SessionEvent {
    /// Human readable line, in the style of a per-task session log.
    pub fn describe(&self) -> String {
        match self {
            SessionEvent::NegotiationStarted { device, protocols } => {
                let names: Vec<String> = protocols.iter().map(|p| p.to_string()).collect();
                format!("Connecting to {device} via {}.", names.join(", "))
            }
            SessionEvent::AttemptStarted {
                protocol,
                target,
                credential,
            } => format!("Trying {protocol} to {target} using credentials {credential}."),
            SessionEvent::AuthenticationFailed {
                protocol,
                credential,
                reason,
            } => format!(
                "Authentication failed using {protocol} credentials {credential}: {reason}"
            ),
            SessionEvent::ProtocolAbandoned { protocol, reason } => {
                format!("Giving up on {protocol}: {reason}")
            }
            SessionEvent::Connected { protocol, target } => {
                format!("Connected via {protocol} to {target}.")
            }
            SessionEvent::CommandSent { command } => format!("> {}", command.trim_end()),
            SessionEvent::CommandOutput { output, .. } => output.clone(),
            SessionEvent::ReadTimeout { raw_buffer } => {
                format!("Timeout while waiting for output, received: {raw_buffer:?}")
            }
            SessionEvent::RawChunk { data } => format!("< {data:?}"),
            SessionEvent::ConnectionClosed { target, reason } => {
                format!("Disconnected from {target} ({reason}).")
            }
            SessionEvent::CredentialCached { device, credential } => {
                format!("Credentials {credential} now stored on {device}.")
            }
        }
    }

    fn is_raw(&self) -> bool {
        matches!(self, SessionEvent::RawChunk { .. })
    }
}

/// In-memory session recorder.
///
/// Clones share the same entry list, so one recorder can follow a whole
/// negotiation across the sessions it builds.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    /// Create a recorder with the given level.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current recording level.
    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record a key-level event.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), ConnectError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        if event.is_raw() && self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::RecorderError(format!("record lock error: {e}")))?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Record raw transport data chunk when enabled.
    pub fn record_raw_chunk(&self, data: String) -> Result<(), ConnectError> {
        self.record_event(SessionEvent::RawChunk { data })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, ConnectError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::RecorderError(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    /// Clears all recorded events.
    pub fn clear(&self) -> Result<(), ConnectError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| ConnectError::RecorderError(format!("record lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    /// Renders the key events as a plain text session log.
    pub fn to_log(&self) -> Result<String, ConnectError> {
        let lines: Vec<String> = self
            .entries()?
            .iter()
            .filter(|entry| !entry.event.is_raw())
            .map(|entry| entry.event.describe())
            .collect();
        Ok(lines.join("\n"))
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, ConnectError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry)
                .map_err(|e| ConnectError::RecorderError(format!("record encode error: {e}")))?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Restore recorder from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConnectError> {
        let recorder = Self::new(SessionRecordLevel::Full);
        if jsonl.trim().is_empty() {
            return Ok(recorder);
        }

        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionRecordEntry = serde_json::from_str(line)
                .map_err(|e| ConnectError::RecorderError(format!("record decode error: {e}")))?;
            parsed.push(entry);
        }

        let mut guard = recorder
            .entries
            .lock()
            .map_err(|e| ConnectError::RecorderError(format!("record lock error: {e}")))?;
        *guard = parsed;
        drop(guard);

        Ok(recorder)
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonl_roundtrip_keeps_event_order() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::AttemptStarted {
                protocol: Protocol::Ssh,
                target: "10.0.0.1:22".to_string(),
                credential: "lab-admin".to_string(),
            })
            .expect("record attempt");
        recorder
            .record_event(SessionEvent::Connected {
                protocol: Protocol::Ssh,
                target: "10.0.0.1:22".to_string(),
            })
            .expect("record connected");

        let jsonl = recorder.to_jsonl().expect("encode");
        assert!(jsonl.contains(r#""kind":"attempt_started""#));
        assert!(jsonl.contains(r#""protocol":"SSH""#));

        let restored = SessionRecorder::from_jsonl(&jsonl).expect("decode");
        let entries = restored.entries().expect("entries");
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[1].event,
            SessionEvent::Connected {
                protocol: Protocol::Ssh,
                ..
            }
        ));
    }

    #[test]
    fn key_events_only_skips_raw_chunks() {
        let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);

        recorder
            .record_raw_chunk("raw-shell-data".to_string())
            .expect("record raw");
        recorder
            .record_event(SessionEvent::CommandSent {
                command: "show version\n".to_string(),
            })
            .expect("record command");

        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].event, SessionEvent::CommandSent { .. }));
    }

    #[test]
    fn off_level_records_nothing() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Off);

        recorder
            .record_event(SessionEvent::ProtocolAbandoned {
                protocol: Protocol::Telnet,
                reason: "connection refused".to_string(),
            })
            .expect("record abandon");
        recorder
            .record_raw_chunk("raw-shell-data".to_string())
            .expect("record raw");

        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn from_jsonl_accepts_empty_input() {
        let restored = SessionRecorder::from_jsonl("").expect("decode empty jsonl");
        assert!(restored.entries().expect("entries").is_empty());
    }

    #[test]
    fn from_jsonl_rejects_garbage() {
        let err = SessionRecorder::from_jsonl("{not json}").expect_err("garbage should fail");
        assert!(matches!(err, ConnectError::RecorderError(_)));
    }

    #[test]
    fn recorder_clear_removes_all_entries() {
        let recorder = SessionRecorder::default();
        recorder
            .record_event(SessionEvent::CommandSent {
                command: "exit".to_string(),
            })
            .expect("record command");
        recorder.clear().expect("clear");
        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn session_log_skips_raw_chunks_and_reads_naturally() {
        let recorder = SessionRecorder::default();
        recorder
            .record_event(SessionEvent::AttemptStarted {
                protocol: Protocol::Telnet,
                target: "10.0.0.1:23".to_string(),
                credential: "lab".to_string(),
            })
            .expect("record attempt");
        recorder
            .record_raw_chunk("Username: ".to_string())
            .expect("record raw");
        recorder
            .record_event(SessionEvent::AuthenticationFailed {
                protocol: Protocol::Telnet,
                credential: "lab".to_string(),
                reason: "% Login invalid".to_string(),
            })
            .expect("record auth failure");

        let log = recorder.to_log().expect("log");
        assert_eq!(
            log,
            "Trying Telnet to 10.0.0.1:23 using credentials lab.\n\
             Authentication failed using Telnet credentials lab: % Login invalid"
        );
    }
}
