//! Length-prefixed plist framing over a device socket.
//!
//! Each message on the wire is a 4-byte big-endian length followed by a
//! binary property list whose root is a dictionary. End of stream, whether
//! at a frame boundary or mid-frame, is normal stream closure.

use std::io;
use std::time::Duration;

use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::command::{CommandError, CommandProcess};
use crate::real::commands::IdeviceCommands;
use crate::retry::Retrier;
use crate::ReadWrite;

/// The fixed localhost port the simulator's Web Inspector listens on.
/// The IPv6 loopback address is required.
const SIMULATOR_INSPECTOR_PORT: u16 = 27753;

pub(crate) struct FrameReader {
    inner: ReadHalf<Box<dyn ReadWrite>>,
}

impl FrameReader {
    /// Receives one plist dictionary, or `None` once the peer has closed
    /// the stream.
    pub async fn receive_message(&mut self) -> io::Result<Option<plist::Dictionary>> {
        let mut length = [0u8; 4];
        match self.inner.read_exact(&mut length).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut payload = vec![0u8; u32::from_be_bytes(length) as usize];
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let value = plist::Value::from_reader(io::Cursor::new(payload))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        match value {
            plist::Value::Dictionary(dict) => Ok(Some(dict)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "inspector message is not a dictionary",
            )),
        }
    }
}

pub(crate) struct FrameWriter {
    inner: WriteHalf<Box<dyn ReadWrite>>,
}

impl FrameWriter {
    /// Sends one dictionary as a length-prefixed binary plist.
    pub async fn send_message(&mut self, message: &plist::Dictionary) -> io::Result<()> {
        let mut payload = Vec::new();
        plist::Value::Dictionary(message.clone())
            .to_writer_binary(&mut payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        self.inner.write_all(&payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}

/// A framed plist socket to a device's Web Inspector service.
///
/// For real devices the socket rides on an `idevicewebinspectorproxy`
/// subprocess whose lifetime is tied to the socket: closing the socket
/// kills the proxy.
pub struct InspectorSocket {
    reader: FrameReader,
    writer: FrameWriter,
    proxy: Option<CommandProcess>,
}

impl InspectorSocket {
    pub fn new(stream: Box<dyn ReadWrite>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        InspectorSocket {
            reader: FrameReader { inner: read_half },
            writer: FrameWriter { inner: write_half },
            proxy: None,
        }
    }

    fn with_proxy(stream: Box<dyn ReadWrite>, proxy: CommandProcess) -> Self {
        let mut socket = InspectorSocket::new(stream);
        socket.proxy = Some(proxy);
        socket
    }

    /// Opens a Web Inspector socket to the real device with the given
    /// udid, starting a proxy subprocess on an ephemeral local port.
    pub async fn open_to_real_device(udid: &str) -> io::Result<InspectorSocket> {
        let inspector_port = {
            let probe = std::net::TcpListener::bind(("127.0.0.1", 0))?;
            probe.local_addr()?.port()
        };

        let proxy = IdeviceCommands::new(udid).webinspectorproxy(inspector_port);

        // The proxy's listen socket may not be open right away.
        let connected = Retrier::new()
            .with_delay(Duration::from_secs(1))
            .with_max_attempts(15)
            .run(|| TcpStream::connect(("127.0.0.1", inspector_port)))
            .await;

        match connected {
            Ok(stream) => Ok(InspectorSocket::with_proxy(Box::new(stream), proxy)),
            Err(e) => {
                close_proxy(proxy).await;
                Err(e)
            }
        }
    }

    /// Connects to the Web Inspector of the booted simulator.
    pub async fn open_to_simulator() -> io::Result<InspectorSocket> {
        let stream =
            TcpStream::connect((std::net::Ipv6Addr::LOCALHOST, SIMULATOR_INSPECTOR_PORT)).await?;
        Ok(InspectorSocket::new(Box::new(stream)))
    }

    pub async fn send_message(&mut self, message: &plist::Dictionary) -> io::Result<()> {
        self.writer.send_message(message).await
    }

    /// Receives one message, or `None` once the device side has closed.
    pub async fn receive_message(&mut self) -> io::Result<Option<plist::Dictionary>> {
        self.reader.receive_message().await
    }

    /// Closes the socket; for real devices this also stops the backing
    /// proxy subprocess.
    pub async fn close(mut self) -> io::Result<()> {
        if let Some(proxy) = self.proxy.take() {
            close_proxy(proxy).await;
        }
        self.writer.shutdown().await
    }

    pub(crate) fn into_parts(self) -> (FrameReader, FrameWriter, Option<CommandProcess>) {
        (self.reader, self.writer, self.proxy)
    }
}

pub(crate) async fn close_proxy(proxy: CommandProcess) {
    match proxy.kill().wait().await {
        Ok(result) => info!("web inspector proxy result: {result}"),
        Err(CommandError::Failed(failure))
            if matches!(failure.result().exit_code(), 143 | 255) =>
        {
            info!("web inspector proxy result: {}", failure.result());
        }
        Err(e) => warn!("web inspector proxy exited abnormally: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn framed_pair() -> (InspectorSocket, DuplexStream) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        (InspectorSocket::new(Box::new(near)), far)
    }

    fn dict(key: &str, value: &str) -> plist::Dictionary {
        let mut dict = plist::Dictionary::new();
        dict.insert(key.into(), value.into());
        dict
    }

    #[tokio::test]
    async fn frames_round_trip_between_peers() {
        let (mut near, far) = framed_pair();
        let mut far = InspectorSocket::new(Box::new(far));

        near.send_message(&dict("direction", "out")).await.unwrap();
        let received = far.receive_message().await.unwrap().unwrap();
        assert_eq!(received.get("direction").unwrap().as_string(), Some("out"));

        far.send_message(&dict("direction", "back")).await.unwrap();
        let received = near.receive_message().await.unwrap().unwrap();
        assert_eq!(received.get("direction").unwrap().as_string(), Some("back"));
    }

    #[tokio::test]
    async fn wire_form_is_length_prefixed_binary_plist() {
        use tokio::io::AsyncReadExt;
        let (mut near, mut far) = framed_pair();
        near.send_message(&dict("k", "v")).await.unwrap();

        let mut length = [0u8; 4];
        far.read_exact(&mut length).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(length) as usize];
        far.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload[..8], b"bplist00");
    }

    #[tokio::test]
    async fn eof_is_normal_closure() {
        let (mut near, far) = framed_pair();
        drop(far);
        assert!(near.receive_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_normal_closure() {
        use tokio::io::AsyncWriteExt;
        let (mut near, mut far) = framed_pair();
        far.write_all(&100u32.to_be_bytes()).await.unwrap();
        far.write_all(b"bplist00 but truncated").await.unwrap();
        drop(far);
        assert!(near.receive_message().await.unwrap().is_none());
    }
}
