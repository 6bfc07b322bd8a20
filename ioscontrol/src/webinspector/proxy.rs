//! TCP-to-device Web Inspector bridge.
//!
//! Listens on a local TCP port and, per accepted client, runs a pair of
//! forwarding tasks: client frames are parsed (XML or binary plist) and
//! pushed to the device service, device frames are re-serialized (binary
//! by default, XML on request) and pushed back with the usual 4-byte
//! big-endian length prefix. The device connection is opened lazily on the
//! first client frame.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::ReadWrite;

/// Largest accepted inspector message.
const MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// Supplies connections to a device's Web Inspector service endpoint.
pub trait DeviceConnector: Send + Sync + 'static {
    fn connect(
        &self,
    ) -> impl Future<Output = io::Result<Box<dyn ReadWrite>>> + Send;
}

/// Connects over TCP, e.g. to a usbmuxd-forwarded service port.
#[derive(Clone, Debug)]
pub struct TcpDeviceConnector {
    address: String,
}

impl TcpDeviceConnector {
    pub fn new(address: impl Into<String>) -> Self {
        TcpDeviceConnector {
            address: address.into(),
        }
    }
}

impl DeviceConnector for TcpDeviceConnector {
    async fn connect(&self) -> io::Result<Box<dyn ReadWrite>> {
        let stream = TcpStream::connect(&self.address).await?;
        Ok(Box::new(stream))
    }
}

/// A long-lived bridge between local TCP clients and one device's Web
/// Inspector service.
pub struct WebInspectorProxy<C> {
    connector: Arc<C>,
    recv_timeout: Duration,
    xml_output: bool,
}

impl<C: DeviceConnector> WebInspectorProxy<C> {
    pub fn new(connector: C) -> Self {
        WebInspectorProxy {
            connector: Arc::new(connector),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            xml_output: false,
        }
    }

    /// How long a device receive may stay quiet before the pump rechecks
    /// its stop flag.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Re-serialize device frames as XML instead of binary plists.
    pub fn with_xml_output(mut self) -> Self {
        self.xml_output = true;
        self
    }

    pub async fn bind(port: u16) -> io::Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", port)).await
    }

    /// Accepts clients until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> io::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((client, address)) => {
                        debug!("handling new client connection from {address}");
                        let connector = Arc::clone(&self.connector);
                        let recv_timeout = self.recv_timeout;
                        let xml_output = self.xml_output;
                        tokio::spawn(handle_client(
                            client,
                            connector,
                            recv_timeout,
                            xml_output,
                        ));
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                    }
                },
                _ = &mut shutdown => break,
            }
        }
        debug!("shutting down web inspector proxy");
        Ok(())
    }
}

async fn handle_client<C: DeviceConnector>(
    client: TcpStream,
    connector: Arc<C>,
    recv_timeout: Duration,
    xml_output: bool,
) {
    let (mut client_read, client_write) = client.into_split();
    let mut client_write = Some(client_write);
    let mut device_write: Option<WriteHalf<Box<dyn ReadWrite>>> = None;
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut device_pump = None;

    loop {
        // Read one framed message from the client.
        let mut length = [0u8; 4];
        if client_read.read_exact(&mut length).await.is_err() {
            break;
        }
        let length = u32::from_be_bytes(length) as usize;
        if length == 0 || length > MAX_MESSAGE_LENGTH {
            error!("invalid message length: {length}");
            break;
        }
        let mut payload = vec![0u8; length];
        if client_read.read_exact(&mut payload).await.is_err() {
            break;
        }

        // Both framings are accepted from the client.
        let message = if payload.starts_with(b"bplist00") || payload.starts_with(b"<?xml") {
            match plist::Value::from_reader(io::Cursor::new(&payload)) {
                Ok(message) => message,
                Err(e) => {
                    error!("invalid plist input ({length} bytes): {e}");
                    break;
                }
            }
        } else {
            error!("input is neither a binary nor an XML plist");
            break;
        };

        // Lazily open the device service and start the reverse pump.
        if device_write.is_none() {
            debug!("connecting to inspector");
            let device = match connector.connect().await {
                Ok(device) => device,
                Err(e) => {
                    error!("could not connect to the webinspector: {e}");
                    break;
                }
            };
            let (read_half, write_half) = tokio::io::split(device);
            device_write = Some(write_half);
            device_pump = Some(tokio::spawn(device_to_client(
                read_half,
                client_write.take().expect("client writer not yet moved"),
                recv_timeout,
                xml_output,
                stop_rx.clone(),
            )));
        }

        if let Err(e) = send_to_device(device_write.as_mut().unwrap(), &message).await {
            error!("send to device failed: {e}");
            break;
        }
    }

    debug!("client connection done, shutting down");
    let _ = stop_tx.send(true);
    if let Some(pump) = device_pump {
        let _ = pump.await;
    }
}

async fn send_to_device(
    device: &mut WriteHalf<Box<dyn ReadWrite>>,
    message: &plist::Value,
) -> io::Result<()> {
    let mut payload = Vec::new();
    message
        .to_writer_binary(&mut payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    device.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    device.write_all(&payload).await?;
    device.flush().await?;
    Ok(())
}

async fn device_to_client(
    mut device: ReadHalf<Box<dyn ReadWrite>>,
    mut client: OwnedWriteHalf,
    recv_timeout: Duration,
    xml_output: bool,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let frame = match read_device_frame(&mut device, recv_timeout, &mut stop).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("device receive ended: {e}");
                break;
            }
        };
        let message = match plist::Value::from_reader(io::Cursor::new(&frame)) {
            Ok(message) => message,
            Err(e) => {
                error!("device sent an unparseable plist: {e}");
                break;
            }
        };

        let mut payload = Vec::new();
        let serialized = if xml_output {
            message.to_writer_xml(&mut payload)
        } else {
            message.to_writer_binary(&mut payload)
        };
        if let Err(e) = serialized {
            error!("could not re-serialize device message: {e}");
            break;
        }
        if client
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .is_err()
            || client.write_all(&payload).await.is_err()
        {
            break;
        }
        let _ = client.flush().await;
    }
    let _ = client.shutdown().await;
}

/// Reads one length-prefixed frame, waking every `recv_timeout` to check
/// the stop flag. `None` means stop was requested or the device closed.
async fn read_device_frame(
    device: &mut ReadHalf<Box<dyn ReadWrite>>,
    recv_timeout: Duration,
    stop: &mut watch::Receiver<bool>,
) -> io::Result<Option<Vec<u8>>> {
    let mut length = [0u8; 4];
    if !read_exact_with_stop(device, &mut length, recv_timeout, stop).await? {
        return Ok(None);
    }
    let length = u32::from_be_bytes(length) as usize;
    if length == 0 || length > MAX_MESSAGE_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid message length: {length}"),
        ));
    }
    let mut payload = vec![0u8; length];
    if !read_exact_with_stop(device, &mut payload, recv_timeout, stop).await? {
        return Ok(None);
    }
    Ok(Some(payload))
}

async fn read_exact_with_stop(
    device: &mut ReadHalf<Box<dyn ReadWrite>>,
    out: &mut [u8],
    recv_timeout: Duration,
    stop: &mut watch::Receiver<bool>,
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < out.len() {
        if *stop.borrow() {
            return Ok(false);
        }
        // A plain read is cancel safe, so a timeout here never loses bytes.
        match tokio::time::timeout(recv_timeout, device.read(&mut out[filled..])).await {
            Err(_elapsed) => continue,
            Ok(Ok(0)) => return Ok(false),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    /// Hands out queued duplex ends as device connections.
    struct FakeDeviceConnector {
        devices: Mutex<Vec<DuplexStream>>,
    }

    impl FakeDeviceConnector {
        fn single() -> (Self, DuplexStream) {
            let (near, far) = tokio::io::duplex(256 * 1024);
            (
                FakeDeviceConnector {
                    devices: Mutex::new(vec![near]),
                },
                far,
            )
        }
    }

    impl DeviceConnector for FakeDeviceConnector {
        async fn connect(&self) -> io::Result<Box<dyn ReadWrite>> {
            let device = self
                .devices
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| io::Error::other("no more fake devices"))?;
            Ok(Box::new(device))
        }
    }

    fn xml_frame(selector: &str) -> Vec<u8> {
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\"><dict>\
             <key>__selector</key><string>{selector}</string>\
             <key>__argument</key><dict/>\
             </dict></plist>"
        );
        let mut frame = (xml.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(xml.as_bytes());
        frame
    }

    async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> Vec<u8> {
        let mut length = [0u8; 4];
        stream.read_exact(&mut length).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(length) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[tokio::test]
    async fn bridges_xml_client_frames_and_binary_device_frames() {
        let (connector, mut device) = FakeDeviceConnector::single();
        let proxy = WebInspectorProxy::new(connector)
            .with_recv_timeout(Duration::from_millis(50));
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            proxy
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(&xml_frame("_rpc_reportIdentifier:"))
            .await
            .unwrap();

        // The device receives the frame re-encoded as a binary plist.
        let to_device = read_frame(&mut device).await;
        assert_eq!(&to_device[..8], b"bplist00");
        let value = plist::Value::from_reader(io::Cursor::new(&to_device)).unwrap();
        assert_eq!(
            value
                .as_dictionary()
                .and_then(|d| d.get("__selector"))
                .and_then(|v| v.as_string()),
            Some("_rpc_reportIdentifier:")
        );

        // A device reply comes back to the client, binary by default.
        let mut reply = plist::Dictionary::new();
        reply.insert("__selector".into(), "_rpc_reportSetup:".into());
        reply.insert(
            "__argument".into(),
            plist::Value::Dictionary(plist::Dictionary::new()),
        );
        let mut reply_bytes = Vec::new();
        plist::Value::Dictionary(reply)
            .to_writer_binary(&mut reply_bytes)
            .unwrap();
        device
            .write_all(&(reply_bytes.len() as u32).to_be_bytes())
            .await
            .unwrap();
        device.write_all(&reply_bytes).await.unwrap();

        let to_client = read_frame(&mut client).await;
        assert_eq!(&to_client[..8], b"bplist00");

        let _ = shutdown_tx.send(());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_input_closes_the_connection() {
        let (connector, _device) = FakeDeviceConnector::single();
        let proxy = WebInspectorProxy::new(connector)
            .with_recv_timeout(Duration::from_millis(50));
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            proxy
                .serve(listener, async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        let junk = b"neither xml nor bplist";
        client
            .write_all(&(junk.len() as u32).to_be_bytes())
            .await
            .unwrap();
        client.write_all(junk).await.unwrap();

        // The proxy drops the connection rather than forwarding junk.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        let _ = shutdown_tx.send(());
        server.await.unwrap();
    }
}
