//! GDB remote serial protocol client for Apple's on-device `debugserver`.
//!
//! Drives the launch dialogue that the debugserver service expects: disable
//! acks, push the environment, set the argv packet, confirm launch success,
//! select all threads, continue, then relay hex-encoded `$O` stdout
//! packets until a `$W`/`$X` exit packet yields the hosted app's exit code.
//!
//! Useful reading:
//! <https://sourceware.org/gdb/current/onlinedocs/gdb.html/Packets.html>

use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::ReadWrite;

/// Per-recv timeout; the server streams continuously once the app runs.
const RECV_TIMEOUT: Duration = Duration::from_millis(500);
/// Wall-clock ceiling when a reply is required.
const REQUIRED_READ_DEADLINE: Duration = Duration::from_secs(10);
/// Receive buffer bound; one overfull packet is a protocol violation.
const RECV_BUFFER_LIMIT: usize = 16 * 1024;
/// Consecutive empty reads tolerated before the relay loop sleeps.
const MAX_EMPTY_READS: u32 = 5;

#[derive(Error, Debug)]
pub enum DebugServerError {
    #[error("debugserver connection failed")]
    Io(#[from] std::io::Error),
    #[error("debugserver closed the connection")]
    Closed,
    #[error("timed out waiting for debugserver data")]
    RecvTimeout,
    #[error("receive buffer overflow")]
    BufferOverflow,
    #[error("received invalid gdb packet: {0:?}")]
    Protocol(String),
    #[error("received {received:?} instead of expected {expected:?}")]
    UnexpectedReply { expected: String, received: String },
    #[error("app appears to have crashed: {0:?}")]
    Crashed(String),
}

/// One packet off the wire.
#[derive(Debug, PartialEq, Eq)]
enum Packet {
    /// The bare `+` acknowledgement.
    Ack,
    /// The payload between `$` and `#`, checksum verified.
    Payload(String),
}

/// A client over an established connection to the
/// `com.apple.debugserver` service.
pub struct DebugServerClient {
    socket: Box<dyn ReadWrite>,
    buffer: Vec<u8>,
    head: usize,
}

impl DebugServerClient {
    pub fn new(socket: Box<dyn ReadWrite>) -> Self {
        DebugServerClient {
            socket,
            buffer: Vec::new(),
            head: 0,
        }
    }

    /// Launches the app at `app_path` and relays its stdout into `output`
    /// until it exits; returns the hosted app's exit code.
    pub async fn run_app(
        &mut self,
        app_path: &str,
        args: &[&str],
        env: &[(String, String)],
        output: &mut (impl AsyncWrite + Unpin),
    ) -> Result<i32, DebugServerError> {
        // Disable acks; the reply itself still travels under ack rules.
        self.send_packet("QStartNoAckMode").await?;
        self.expect_ack().await?;
        self.expect_ok().await?;
        self.send_raw(b"+").await?;

        for (key, value) in env {
            let packet = format!("QEnvironmentHexEncoded:{}", hex_encode(format!("{key}={value}").as_bytes()));
            self.send_packet(&packet).await?;
            self.expect_ok().await?;
        }

        self.send_packet(&argv_packet(app_path, args)).await?;
        self.expect_ok().await?;

        self.send_packet("qLaunchSuccess").await?;
        self.expect_ok().await?;

        // Select all threads, then continue.
        self.send_packet("Hc-1").await?;
        self.expect_ok().await?;
        self.send_packet("c").await?;

        let exit_code = self.relay_output(output).await;

        // Ask the server to kill the inferior on the way out; best effort
        // when the app is already gone.
        let _ = self.send_packet("k").await;
        exit_code
    }

    async fn relay_output(
        &mut self,
        output: &mut (impl AsyncWrite + Unpin),
    ) -> Result<i32, DebugServerError> {
        let mut empty_reads = 0u32;
        loop {
            let packet = match self.read_packet(true).await? {
                None => {
                    empty_reads += 1;
                    if empty_reads > MAX_EMPTY_READS {
                        // The per-recv timeout should pace us already; this
                        // is a backstop against spinning.
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        empty_reads = 0;
                    }
                    continue;
                }
                Some(packet) => packet,
            };
            empty_reads = 0;

            let payload = match packet {
                Packet::Ack => continue,
                Packet::Payload(payload) => payload,
            };
            if payload.is_empty() {
                continue;
            }
            match payload.as_bytes()[0] {
                b'O' => {
                    let bytes = hex_decode(&payload[1..])
                        .ok_or_else(|| DebugServerError::Protocol(payload.clone()))?;
                    output.write_all(&bytes).await?;
                    output.flush().await?;
                    self.send_packet("OK").await?;
                }
                b'W' | b'X' => {
                    let code = i32::from_str_radix(&payload[1..], 16)
                        .map_err(|_| DebugServerError::Protocol(payload.clone()))?;
                    self.send_packet("OK").await?;
                    return Ok(code);
                }
                b'T' => return Err(DebugServerError::Crashed(payload)),
                _ => return Err(DebugServerError::Protocol(payload)),
            }
        }
    }

    async fn send_packet(&mut self, payload: &str) -> Result<(), DebugServerError> {
        let packet = format!("${payload}#{:02x}", checksum(payload));
        debug!("sent[{}] ({})", packet.len(), packet);
        self.send_raw(packet.as_bytes()).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), DebugServerError> {
        self.socket.write_all(bytes).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn expect_ack(&mut self) -> Result<(), DebugServerError> {
        match self.read_packet(false).await?.expect("required read") {
            Packet::Ack => Ok(()),
            Packet::Payload(p) => Err(DebugServerError::UnexpectedReply {
                expected: "+".to_string(),
                received: p,
            }),
        }
    }

    async fn expect_ok(&mut self) -> Result<(), DebugServerError> {
        match self.read_packet(false).await?.expect("required read") {
            Packet::Payload(p) if p == "OK" => Ok(()),
            Packet::Ack => Err(DebugServerError::UnexpectedReply {
                expected: "OK".to_string(),
                received: "+".to_string(),
            }),
            Packet::Payload(p) => Err(DebugServerError::UnexpectedReply {
                expected: "OK".to_string(),
                received: p,
            }),
        }
    }

    /// Reads one packet. With `allow_empty`, a single quiet recv window
    /// yields `None` instead of waiting out the full deadline.
    async fn read_packet(
        &mut self,
        allow_empty: bool,
    ) -> Result<Option<Packet>, DebugServerError> {
        let first = match self.read_byte(allow_empty).await? {
            None => return Ok(None),
            Some(b) => b,
        };
        match first {
            b'+' => Ok(Some(Packet::Ack)),
            b'$' => {
                let mut payload = Vec::new();
                loop {
                    let byte = self.read_byte(false).await?.expect("required read");
                    if byte == b'#' {
                        break;
                    }
                    payload.push(byte);
                    if payload.len() > RECV_BUFFER_LIMIT {
                        return Err(DebugServerError::BufferOverflow);
                    }
                }
                let hi = self.read_byte(false).await?.expect("required read");
                let lo = self.read_byte(false).await?.expect("required read");
                let payload = String::from_utf8_lossy(&payload).into_owned();
                let sent = (hex_digit(hi).ok_or_else(|| DebugServerError::Protocol(payload.clone()))?
                    << 4)
                    | hex_digit(lo).ok_or_else(|| DebugServerError::Protocol(payload.clone()))?;
                if sent != checksum(&payload) {
                    return Err(DebugServerError::Protocol(payload));
                }
                debug!("recv[{}] (${payload}#..)", payload.len());
                Ok(Some(Packet::Payload(payload)))
            }
            other => Err(DebugServerError::Protocol(
                (other as char).to_string(),
            )),
        }
    }

    async fn read_byte(&mut self, allow_empty: bool) -> Result<Option<u8>, DebugServerError> {
        if self.head == self.buffer.len() {
            self.buffer.clear();
            self.head = 0;
            let started = Instant::now();
            loop {
                let mut chunk = [0u8; 4096];
                match tokio::time::timeout(RECV_TIMEOUT, self.socket.read(&mut chunk)).await {
                    Ok(Ok(0)) => return Err(DebugServerError::Closed),
                    Ok(Ok(n)) => {
                        self.buffer.extend_from_slice(&chunk[..n]);
                        break;
                    }
                    Ok(Err(e)) => return Err(DebugServerError::Io(e)),
                    Err(_elapsed) => {
                        if allow_empty {
                            return Ok(None);
                        }
                        if started.elapsed() > REQUIRED_READ_DEADLINE {
                            return Err(DebugServerError::RecvTimeout);
                        }
                    }
                }
            }
        }
        let byte = self.buffer[self.head];
        self.head += 1;
        Ok(Some(byte))
    }
}

/// `$A<2*len(path)>,0,<hex(path)>[,<2*len(arg)>,<i>,<hex(arg)>]...`
fn argv_packet(app_path: &str, args: &[&str]) -> String {
    let mut packet = String::from("A");
    for (i, arg) in std::iter::once(app_path).chain(args.iter().copied()).enumerate() {
        if i > 0 {
            packet.push(',');
        }
        packet.push_str(&format!("{},{},{}", 2 * arg.len(), i, hex_encode(arg.as_bytes())));
    }
    packet
}

fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            Some((hi << 4) | lo)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn packet(payload: &str) -> Vec<u8> {
        format!("${payload}#{:02x}", checksum(payload)).into_bytes()
    }

    /// Scripted debugserver side of the launch dialogue.
    async fn fake_debugserver(mut server: DuplexStream, output_packets: Vec<String>) {
        let mut incoming = Vec::new();
        let mut buf = [0u8; 4096];

        // QStartNoAckMode arrives under ack rules.
        let n = server.read(&mut buf).await.unwrap();
        incoming.extend_from_slice(&buf[..n]);
        assert!(String::from_utf8_lossy(&incoming).contains("QStartNoAckMode"));
        server.write_all(b"+").await.unwrap();
        server.write_all(&packet("OK")).await.unwrap();

        // The client's closing ack for the no-ack switch.
        let mut expect_plus = [0u8; 1];
        server.read_exact(&mut expect_plus).await.unwrap();
        assert_eq!(&expect_plus, b"+");

        // Environment, argv, qLaunchSuccess and Hc-1 all get OK; the
        // continue packet gets no reply and starts the output stream.
        loop {
            let incoming = read_one_packet(&mut server).await;
            if incoming == "c" {
                break;
            }
            server.write_all(&packet("OK")).await.unwrap();
        }
        for out in output_packets {
            server.write_all(&packet(&out)).await.unwrap();
            let ack = read_one_packet(&mut server).await;
            assert_eq!(ack, "OK");
        }
    }

    async fn read_one_packet(server: &mut DuplexStream) -> String {
        let mut bytes = Vec::new();
        let mut one = [0u8; 1];
        loop {
            server.read_exact(&mut one).await.unwrap();
            bytes.push(one[0]);
            if one[0] == b'#' {
                let mut cs = [0u8; 2];
                server.read_exact(&mut cs).await.unwrap();
                break;
            }
        }
        let text = String::from_utf8(bytes).unwrap();
        text.trim_start_matches('$').trim_end_matches('#').to_string()
    }

    #[tokio::test]
    async fn launches_relays_stdout_and_returns_exit_code() {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(fake_debugserver(
            server_side,
            vec![
                format!("O{}", hex_encode(b"WiFi: ok\n")),
                "W00".to_string(),
            ],
        ));

        let mut client = DebugServerClient::new(Box::new(client_side));
        let mut stdout = Vec::new();
        let env = vec![("HOME".to_string(), "/var/mobile".to_string())];
        let code = client
            .run_app("/var/containers/App.app/App", &["--check_wifi"], &env, &mut stdout)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(String::from_utf8(stdout).unwrap(), "WiFi: ok\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_packet_is_decoded_from_hex() {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(fake_debugserver(server_side, vec!["X1f".to_string()]));

        let mut client = DebugServerClient::new(Box::new(client_side));
        let mut stdout = Vec::new();
        let code = client
            .run_app("/app", &[], &[], &mut stdout)
            .await
            .unwrap();
        assert_eq!(code, 0x1f);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stop_packet_reports_a_crash() {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut server = server_side;
            let mut buf = [0u8; 4096];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"+").await.unwrap();
            server.write_all(&packet("OK")).await.unwrap();
            let mut one = [0u8; 1];
            server.read_exact(&mut one).await.unwrap();
            // argv, qLaunchSuccess, Hc-1.
            for _ in 0..3 {
                read_one_packet(&mut server).await;
                server.write_all(&packet("OK")).await.unwrap();
            }
            read_one_packet(&mut server).await; // c
            server.write_all(&packet("T05")).await.unwrap();
            // Swallow whatever the client sends on shutdown.
            let _ = server.read(&mut buf).await;
        });

        let mut client = DebugServerClient::new(Box::new(client_side));
        let mut stdout = Vec::new();
        let result = client.run_app("/app", &[], &[], &mut stdout).await;
        assert!(matches!(result, Err(DebugServerError::Crashed(_))));
    }

    #[test]
    fn argv_packet_matches_the_wire_layout() {
        assert_eq!(
            argv_packet("ab", &["c"]),
            format!("A4,0,{},2,1,{}", hex_encode(b"ab"), hex_encode(b"c"))
        );
    }

    #[test]
    fn checksum_matches_known_packets() {
        assert_eq!(checksum("QStartNoAckMode"), 0xb0);
        assert_eq!(checksum("OK"), 0x9a);
    }

    #[test]
    fn hex_round_trip() {
        assert_eq!(hex_encode(b"IosControl"), "496F73436F6E74726F6C");
        assert_eq!(hex_decode("496F73436F6E74726F6C").unwrap(), b"IosControl");
        assert!(hex_decode("zz").is_none());
    }
}
