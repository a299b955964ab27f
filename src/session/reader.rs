use super::*;

/// Parameters of one `read_until` call.
pub(super) struct ReadRequest<'a> {
    pub expects: &'a [String],
    pub patterns: &'a [Regex],
    pub command_timeout: Duration,
    pub discover_wait: Duration,
    pub actions: &'a CleanupActions,
}

/// Pulls bytes from the transport until an expect pattern matches.
///
/// Normalization and pattern matching run only when new bytes arrived; the
/// raw buffer itself is never touched by the cleanup steps.
pub(super) struct SessionReader {
    input: Receiver<Vec<u8>>,
    raw: Vec<u8>,
    closed: bool,
    /// Pattern evaluations of the current read.
    evaluations: usize,
}

impl SessionReader {
    pub(super) fn new(input: Receiver<Vec<u8>>) -> Self {
        Self {
            input,
            raw: Vec::new(),
            closed: false,
            evaluations: 0,
        }
    }

    /// Moves every chunk currently queued into the raw buffer.
    fn drain(&mut self, recorder: Option<&SessionRecorder>) -> usize {
        let mut received = 0;
        loop {
            match self.input.try_recv() {
                Ok(chunk) => {
                    trace!("Received data {:?}", String::from_utf8_lossy(&chunk));
                    if let Some(recorder) = recorder {
                        let _ = recorder
                            .record_raw_chunk(String::from_utf8_lossy(&chunk).into_owned());
                    }
                    received += chunk.len();
                    self.raw.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        debug!("Receive stream closed by transport");
                    }
                    self.closed = true;
                    break;
                }
            }
        }
        received
    }

    fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    pub(super) async fn read_until(
        &mut self,
        request: ReadRequest<'_>,
        interrupt: &InterruptHandle,
        recorder: Option<&SessionRecorder>,
    ) -> Result<CommandOutput, ConnectError> {
        self.raw.clear();
        self.evaluations = 0;
        let mut last_activity = Instant::now();
        // First pass evaluates even without data, so an empty expect list returns at once.
        let mut changed = true;

        loop {
            if interrupt.take() {
                return Err(ConnectError::Interrupted);
            }

            if self.drain(recorder) > 0 {
                last_activity = Instant::now();
                changed = true;
            }

            if changed && reached(last_activity, request.discover_wait) {
                self.evaluations += 1;
                trace!("Evaluating expect patterns, pass {}", self.evaluations);
                let raw_buffer = self.raw_text();
                let full_output = normalize(&raw_buffer, request.actions);

                if request.patterns.is_empty() {
                    return Ok(CommandOutput {
                        command: None,
                        output: full_output.clone(),
                        full_output,
                        raw_buffer,
                        expect_match: None,
                        expect_match_index: None,
                        expect_match_pattern: None,
                    });
                }

                for (index, pattern) in request.patterns.iter().enumerate() {
                    if let Some(caps) = pattern.captures(&full_output) {
                        let expect_match = ExpectMatch::from_captures(pattern, &caps);
                        let output = if request.actions.contains(CleanupAction::StripPrompt) {
                            pattern.replacen(&full_output, 1, "").into_owned()
                        } else {
                            full_output.clone()
                        };
                        trace!("Expect pattern #{} '{}' matched", index, pattern.as_str());
                        return Ok(CommandOutput {
                            command: None,
                            output,
                            full_output,
                            raw_buffer,
                            expect_match: Some(expect_match),
                            expect_match_index: Some(index),
                            expect_match_pattern: request.expects.get(index).cloned(),
                        });
                    }
                }
                changed = false;
            }

            if self.closed && !changed {
                return Err(ConnectError::ChannelDisconnectError);
            }

            if expired(last_activity, request.command_timeout) {
                return Err(ConnectError::ReadTimeout(self.raw_text()));
            }

            tokio::time::sleep(config::READ_POLL_INTERVAL).await;
        }
    }
}

/// `span` has fully elapsed since `since`. A span past the clock range never does.
fn reached(since: Instant, span: Duration) -> bool {
    since
        .checked_add(span)
        .is_some_and(|deadline| Instant::now() >= deadline)
}

fn expired(since: Instant, span: Duration) -> bool {
    since
        .checked_add(span)
        .is_some_and(|deadline| Instant::now() > deadline)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(expects: &[String]) -> Vec<Regex> {
        expects
            .iter()
            .map(|e| compile_expect(e).expect("valid pattern"))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn first_matching_pattern_in_list_order_wins() {
        let (tx, rx) = mpsc::channel(8);
        let mut reader = SessionReader::new(rx);
        tx.send(b"Password:\nrouter#".to_vec()).await.expect("send");

        let expects = vec!["router#".to_string(), "Password:".to_string()];
        let patterns = compile(&expects);
        let actions = CleanupActions::default();
        let out = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::from_secs(5),
                    discover_wait: Duration::ZERO,
                    actions: &actions,
                },
                &InterruptHandle::default(),
                None,
            )
            .await
            .expect("read");

        assert_eq!(out.expect_match_index, Some(0));
        assert_eq!(out.expect_match_pattern.as_deref(), Some("router#"));
        assert_eq!(out.output, "Password:\n");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_without_match_is_reported() {
        let (tx, rx) = mpsc::channel(8);
        let mut reader = SessionReader::new(rx);
        tx.send(b"partial".to_vec()).await.expect("send");
        drop(tx);

        let expects = vec!["#$".to_string()];
        let patterns = compile(&expects);
        let actions = CleanupActions::default();
        let err = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::from_secs(5),
                    discover_wait: Duration::ZERO,
                    actions: &actions,
                },
                &InterruptHandle::default(),
                None,
            )
            .await
            .expect_err("closed stream should fail");
        assert!(matches!(err, ConnectError::ChannelDisconnectError));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_surfaces_as_error() {
        let (_tx, rx) = mpsc::channel::<Vec<u8>>(8);
        let mut reader = SessionReader::new(rx);
        let interrupt = InterruptHandle::default();
        interrupt.interrupt();

        let expects = vec!["#".to_string()];
        let patterns = compile(&expects);
        let actions = CleanupActions::default();
        let err = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::from_secs(5),
                    discover_wait: Duration::ZERO,
                    actions: &actions,
                },
                &interrupt,
                None,
            )
            .await
            .expect_err("interrupted read should fail");
        assert!(matches!(err, ConnectError::Interrupted));
        assert!(!interrupt.take());
    }

    #[tokio::test(start_paused = true)]
    async fn split_utf8_sequence_is_reassembled() {
        let (tx, rx) = mpsc::channel(8);
        let mut reader = SessionReader::new(rx);
        let text = "température 25°C\nrouter#".as_bytes();
        tx.send(text[..16].to_vec()).await.expect("send");
        tx.send(text[16..].to_vec()).await.expect("send");

        let expects = vec!["router#".to_string()];
        let patterns = compile(&expects);
        let actions = CleanupActions::none();
        let out = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::from_secs(5),
                    discover_wait: Duration::ZERO,
                    actions: &actions,
                },
                &InterruptHandle::default(),
                None,
            )
            .await
            .expect("read");
        assert_eq!(out.full_output, "température 25°C\nrouter#");
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_iterations_do_not_reevaluate_patterns() {
        let (tx, rx) = mpsc::channel(8);
        let mut reader = SessionReader::new(rx);
        tx.send(b"partial".to_vec()).await.expect("send");

        let expects = vec!["never".to_string()];
        let patterns = compile(&expects);
        let actions = CleanupActions::default();
        let err = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::from_secs(1),
                    discover_wait: Duration::ZERO,
                    actions: &actions,
                },
                &InterruptHandle::default(),
                None,
            )
            .await
            .expect_err("no match");
        assert!(matches!(err, ConnectError::ReadTimeout(_)));
        assert_eq!(reader.evaluations, 1);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_waits_do_not_overflow() {
        let (tx, rx) = mpsc::channel(8);
        let mut reader = SessionReader::new(rx);
        tx.send(b"router#".to_vec()).await.expect("send");

        let expects = vec!["#".to_string()];
        let patterns = compile(&expects);
        let actions = CleanupActions::default();
        let out = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::MAX,
                    discover_wait: Duration::ZERO,
                    actions: &actions,
                },
                &InterruptHandle::default(),
                None,
            )
            .await
            .expect("read");
        assert_eq!(out.output, "router");

        let interrupt = InterruptHandle::default();
        let stopper = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            stopper.interrupt();
        });
        tx.send(b"router#".to_vec()).await.expect("send");
        let err = reader
            .read_until(
                ReadRequest {
                    expects: &expects,
                    patterns: &patterns,
                    command_timeout: Duration::MAX,
                    discover_wait: Duration::MAX,
                    actions: &actions,
                },
                &interrupt,
                None,
            )
            .await
            .expect_err("discover wait never ends");
        assert!(matches!(err, ConnectError::Interrupted));
        assert!(!interrupt.is_interrupted());
        assert_eq!(reader.evaluations, 0);
    }
}
