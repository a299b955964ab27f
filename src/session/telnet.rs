use super::*;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::device::TelnetConfig;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecState {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Telnet stream decoder and option negotiator.
///
/// Keeps its state between chunks, so a command split across two reads is
/// still understood. Accepts the server's ECHO and SGA, sends the configured
/// terminal type when asked and refuses every other option.
#[derive(Debug, Clone)]
pub struct TelnetCodec {
    state: CodecState,
    terminal_type: String,
    sub: Vec<u8>,
}

impl TelnetCodec {
    pub fn new(terminal_type: &str) -> Self {
        Self {
            state: CodecState::Data,
            terminal_type: terminal_type.to_uppercase(),
            sub: Vec::new(),
        }
    }

    /// Splits received bytes into application data and negotiation replies.
    pub fn decode(&mut self, bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::with_capacity(bytes.len());
        let mut replies = Vec::new();

        for &byte in bytes {
            self.state = match self.state {
                CodecState::Data if byte == IAC => CodecState::Iac,
                CodecState::Data => {
                    data.push(byte);
                    CodecState::Data
                }
                CodecState::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        CodecState::Data
                    }
                    WILL | WONT | DO | DONT => CodecState::Option(byte),
                    SB => {
                        self.sub.clear();
                        CodecState::Sub
                    }
                    // NOP, GA, AYT...
                    _ => CodecState::Data,
                },
                CodecState::Option(command) => {
                    self.negotiate(command, byte, &mut replies);
                    CodecState::Data
                }
                CodecState::Sub if byte == IAC => CodecState::SubIac,
                CodecState::Sub => {
                    self.sub.push(byte);
                    CodecState::Sub
                }
                CodecState::SubIac => match byte {
                    SE => {
                        self.subnegotiate(&mut replies);
                        CodecState::Data
                    }
                    IAC => {
                        self.sub.push(IAC);
                        CodecState::Sub
                    }
                    _ => CodecState::Sub,
                },
            };
        }

        (data, replies)
    }

    fn negotiate(&self, command: u8, option: u8, replies: &mut Vec<u8>) {
        let answer = match (command, option) {
            (WILL, OPT_ECHO | OPT_SGA) => DO,
            (WILL, _) => DONT,
            (DO, OPT_SGA | OPT_TTYPE) => WILL,
            (DO, _) => WONT,
            // WONT and DONT are not acknowledged.
            _ => return,
        };
        trace!("Telnet option {} {} answered with {}", command, option, answer);
        replies.extend_from_slice(&[IAC, answer, option]);
    }

    fn subnegotiate(&mut self, replies: &mut Vec<u8>) {
        if self.sub.as_slice() == [OPT_TTYPE, TTYPE_SEND] {
            replies.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
            replies.extend_from_slice(self.terminal_type.as_bytes());
            replies.extend_from_slice(&[IAC, SE]);
        }
        self.sub.clear();
    }

    /// Escapes IAC bytes of outgoing application data.
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &byte in data {
            if byte == IAC {
                out.push(IAC);
            }
            out.push(byte);
        }
        out
    }
}

/// Telnet transport session. Login is left to the script.
pub struct TelnetTransport {
    address: IpAddr,
    port: u16,
    telnet_config: TelnetConfig,
    io_task: Option<JoinHandle<()>>,
}

impl TelnetTransport {
    pub fn new(address: IpAddr, port: u16, telnet_config: TelnetConfig) -> Self {
        Self {
            address,
            port,
            telnet_config,
            io_task: None,
        }
    }
}

#[async_trait]
impl CliTransport for TelnetTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Telnet
    }

    fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    async fn connect(&mut self, config: &SessionConfig) -> Result<ShellStreams, ConnectError> {
        self.disconnect().await;
        let target = self.target();

        let stream = tokio::time::timeout(
            config.connection_timeout(),
            TcpStream::connect((self.address, self.port)),
        )
        .await
        .map_err(|_| {
            ConnectError::TransportFailure(format!("connection to {target} timed out"))
        })??;
        debug!("{} Telnet TCP connection successful", target);

        let (mut reader, mut writer) = stream.into_split();
        let mut codec = TelnetCodec::new(&self.telnet_config.terminal_type);
        let (streams, peer) = ShellStreams::pair();
        let ShellPeer {
            to_session,
            mut from_session,
        } = peer;

        self.io_task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    Some(data) = from_session.recv() => {
                        if let Err(e) = writer.write_all(&TelnetCodec::encode(&data)).await {
                            debug!("{} Failed to send data: {:?}", target, e);
                            break;
                        }
                    },
                    read = reader.read(&mut buf) => {
                        match read {
                            Ok(0) => {
                                debug!("{} Connection closed by peer.", target);
                                break;
                            }
                            Ok(n) => {
                                let (data, replies) = codec.decode(&buf[..n]);
                                if !replies.is_empty()
                                    && writer.write_all(&replies).await.is_err()
                                {
                                    break;
                                }
                                if !data.is_empty() && to_session.send(data).await.is_err() {
                                    debug!("{} Session receiver dropped, closing task.", target);
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("{} Read error: {:?}", target, e);
                                break;
                            }
                        }
                    },
                }
            }
            let _ = writer.shutdown().await;
            debug!("{} Telnet I/O task ended.", target);
        }));

        Ok(streams)
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn plain_data_passes_through() {
        let mut codec = TelnetCodec::new("vt100");
        let (data, replies) = codec.decode(b"Username: ");
        assert_eq!(data, b"Username: ");
        assert!(replies.is_empty());
    }

    #[test]
    fn accepts_echo_and_sga_and_refuses_others() {
        let mut codec = TelnetCodec::new("vt100");
        let input = [
            IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, WILL, 42, IAC, DO, 31, b'>',
        ];
        let (data, replies) = codec.decode(&input);
        assert_eq!(data, b">");
        assert_eq!(
            replies,
            vec![IAC, DO, OPT_ECHO, IAC, DO, OPT_SGA, IAC, DONT, 42, IAC, WONT, 31]
        );
    }

    #[test]
    fn terminal_type_is_sent_uppercase_on_request() {
        let mut codec = TelnetCodec::new("vt100");
        let (_, replies) = codec.decode(&[IAC, DO, OPT_TTYPE]);
        assert_eq!(replies, vec![IAC, WILL, OPT_TTYPE]);

        let (data, replies) = codec.decode(&[IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE]);
        assert!(data.is_empty());
        let mut expected = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
        expected.extend_from_slice(b"VT100");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(replies, expected);
    }

    #[test]
    fn commands_split_across_chunks_are_reassembled() {
        let mut codec = TelnetCodec::new("vt100");
        let (data, replies) = codec.decode(&[b'a', IAC]);
        assert_eq!(data, b"a");
        assert!(replies.is_empty());

        let (data, replies) = codec.decode(&[WILL]);
        assert!(data.is_empty() && replies.is_empty());

        let (data, replies) = codec.decode(&[OPT_ECHO, b'b']);
        assert_eq!(data, b"b");
        assert_eq!(replies, vec![IAC, DO, OPT_ECHO]);
    }

    #[test]
    fn escaped_iac_is_data_both_ways() {
        let mut codec = TelnetCodec::new("vt100");
        let (data, _) = codec.decode(&[b'x', IAC, IAC, b'y']);
        assert_eq!(data, vec![b'x', IAC, b'y']);
        assert_eq!(TelnetCodec::encode(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
    }

    #[tokio::test]
    async fn connects_and_bridges_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            socket
                .write_all(&[IAC, WILL, OPT_ECHO, b'l', b'o', b'g', b'i', b'n', b':', b' '])
                .await
                .expect("write banner");
            let mut buf = [0u8; 64];
            let mut received = Vec::new();
            while !received.ends_with(b"admin\n") {
                let n = socket.read(&mut buf).await.expect("read");
                assert!(n > 0, "client closed early");
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        let mut transport = TelnetTransport::new(
            IpAddr::from([127, 0, 0, 1]),
            port,
            TelnetConfig::default(),
        );
        let mut streams = transport
            .connect(&SessionConfig::default())
            .await
            .expect("connect");
        let mut banner = Vec::new();
        while banner.len() < b"login: ".len() {
            banner.extend(streams.input.recv().await.expect("banner"));
        }
        assert_eq!(banner, b"login: ");
        streams
            .output
            .send(b"admin\n".to_vec())
            .await
            .expect("send username");

        let received = server.await.expect("server task");
        assert_eq!(received, vec![IAC, DO, OPT_ECHO, b'a', b'd', b'm', b'i', b'n', b'\n']);
        transport.disconnect().await;
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let mut transport = TelnetTransport::new(
            IpAddr::from([127, 0, 0, 1]),
            port,
            TelnetConfig::default(),
        );
        let err = transport
            .connect(&SessionConfig::default())
            .await
            .err()
            .expect("nothing listens on the port");
        assert_eq!(err.failure_class(), crate::error::FailureClass::Transport);
    }
}
