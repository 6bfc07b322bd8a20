//! Safari/WebKit remote Web Inspector access.
//!
//! [`WebInspector`] is the host-side client: it frames typed
//! [`InspectorMessage`]s onto the device socket and pumps incoming
//! messages to a listener in the background. The lifecycle is strict:
//! created, then started by [`WebInspector::start_listening`], then
//! closed by [`WebInspector::close`]; sending is legal only while
//! started.

mod messages;
mod proxy;
mod socket;

pub use messages::{
    InspectorApplication, InspectorDriver, InspectorMessage, InspectorPage, MessageError,
    MessageKey, MessageSelector,
};
pub use proxy::{DeviceConnector, TcpDeviceConnector, WebInspectorProxy, DEFAULT_RECV_TIMEOUT};
pub use socket::InspectorSocket;

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::command::CommandProcess;
use socket::{FrameReader, FrameWriter};

const RECEIVE_CADENCE: Duration = Duration::from_millis(50);
const CLOSE_GRACE: Duration = Duration::from_secs(5);
/// Log lines truncate long messages at this many characters.
const MESSAGE_LOG_LIMIT: usize = 2500;

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const CLOSED: u8 = 2;

/// A Web Inspector client over a framed device socket.
pub struct WebInspector {
    writer: AsyncMutex<FrameWriter>,
    reader: Mutex<Option<FrameReader>>,
    proxy: Mutex<Option<CommandProcess>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    state: AtomicU8,
    remote_closed: Arc<AtomicU8>,
}

impl WebInspector {
    /// Connects to the Web Inspector of a real device by udid.
    pub async fn connect_to_real_device(udid: &str) -> io::Result<Self> {
        Ok(WebInspector::new(
            InspectorSocket::open_to_real_device(udid).await?,
        ))
    }

    /// Connects to the Web Inspector of the booted simulator.
    pub async fn connect_to_simulator() -> io::Result<Self> {
        Ok(WebInspector::new(InspectorSocket::open_to_simulator().await?))
    }

    pub fn new(socket: InspectorSocket) -> Self {
        let (reader, writer, proxy) = socket.into_parts();
        WebInspector {
            writer: AsyncMutex::new(writer),
            reader: Mutex::new(Some(reader)),
            proxy: Mutex::new(proxy),
            pump: Mutex::new(None),
            state: AtomicU8::new(CREATED),
            remote_closed: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Starts the background receive pump, invoking `listener` for every
    /// decoded message.
    ///
    /// # Panics
    /// Panics if listening was already started.
    pub fn start_listening(&self, listener: impl Fn(InspectorMessage) + Send + 'static) {
        let transitioned =
            self.state
                .compare_exchange(CREATED, STARTED, Ordering::SeqCst, Ordering::SeqCst);
        assert!(transitioned.is_ok(), "web inspector already started");

        let mut reader = self
            .reader
            .lock()
            .unwrap()
            .take()
            .expect("reader present before start");
        let remote_closed = Arc::clone(&self.remote_closed);
        let pump = tokio::spawn(async move {
            let mut cadence = tokio::time::interval(RECEIVE_CADENCE);
            cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                cadence.tick().await;
                match reader.receive_message().await {
                    Ok(Some(dict)) => match InspectorMessage::from_plist(&dict) {
                        Ok(message) => {
                            info!("message received: {}", format_message(&message));
                            listener(message);
                        }
                        Err(e) => warn!("undecodable inspector message: {e}"),
                    },
                    Ok(None) => {
                        error!("web inspector closed unexpectedly");
                        remote_closed.store(1, Ordering::SeqCst);
                        break;
                    }
                    Err(e) => warn!("inspector receive failed: {e}"),
                }
            }
        });
        *self.pump.lock().unwrap() = Some(pump);
    }

    /// Sends one message to the Web Inspector.
    ///
    /// # Panics
    /// Panics unless listening was started and the inspector is not
    /// closed.
    pub async fn send_message(&self, message: &InspectorMessage) -> io::Result<()> {
        assert_eq!(
            self.state.load(Ordering::SeqCst),
            STARTED,
            "web inspector is not started"
        );
        assert_eq!(
            self.remote_closed.load(Ordering::SeqCst),
            0,
            "web inspector is closed"
        );
        self.writer.lock().await.send_message(&message.to_plist()).await?;
        info!("message sent: {}", format_message(message));
        Ok(())
    }

    /// Stops the receive pump and closes the socket, killing the backing
    /// proxy subprocess when there is one.
    ///
    /// # Panics
    /// Panics unless listening was started.
    pub async fn close(&self) -> io::Result<()> {
        let previous = self.state.swap(CLOSED, Ordering::SeqCst);
        assert_eq!(previous, STARTED, "web inspector is not started");

        let pump = self.pump.lock().unwrap().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = tokio::time::timeout(CLOSE_GRACE, pump).await;
        }
        let proxy = self.proxy.lock().unwrap().take();
        if let Some(proxy) = proxy {
            socket::close_proxy(proxy).await;
        }
        self.writer.lock().await.shutdown().await
    }
}

fn format_message(message: &InspectorMessage) -> String {
    let mut text = format!("{message:?}");
    if text.len() > MESSAGE_LOG_LIMIT {
        let mut cut = MESSAGE_LOG_LIMIT;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn inspector_pair() -> (WebInspector, DuplexStream) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        (
            WebInspector::new(InspectorSocket::new(Box::new(near))),
            far,
        )
    }

    async fn read_frame(stream: &mut DuplexStream) -> plist::Dictionary {
        let mut length = [0u8; 4];
        stream.read_exact(&mut length).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(length) as usize];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload[..8], b"bplist00");
        plist::Value::from_reader(std::io::Cursor::new(payload))
            .unwrap()
            .into_dictionary()
            .unwrap()
    }

    async fn write_message(stream: &mut DuplexStream, message: &InspectorMessage) {
        let mut payload = Vec::new();
        plist::Value::Dictionary(message.to_plist())
            .to_writer_binary(&mut payload)
            .unwrap();
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&payload).await.unwrap();
    }

    fn report_identifier() -> InspectorMessage {
        InspectorMessage::ReportIdentifier {
            connection_id: "id1".to_string(),
        }
    }

    #[tokio::test]
    async fn send_message_writes_one_framed_binary_plist() {
        let (inspector, mut far) = inspector_pair();
        inspector.start_listening(|_| {});
        inspector.send_message(&report_identifier()).await.unwrap();

        let frame = read_frame(&mut far).await;
        assert_eq!(
            frame.get("__selector").unwrap().as_string(),
            Some("_rpc_reportIdentifier:")
        );
        let argument = frame.get("__argument").unwrap().as_dictionary().unwrap();
        assert_eq!(
            argument.get("WIRConnectionIdentifierKey").unwrap().as_string(),
            Some("id1")
        );
        inspector.close().await.unwrap();
    }

    #[tokio::test]
    async fn listener_observes_typed_messages() {
        let (inspector, mut far) = inspector_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        inspector.start_listening(move |message| {
            tx.send(message).unwrap();
        });

        let connected = InspectorMessage::ApplicationConnected(InspectorApplication {
            application_bundle_id: "com.apple.mobilesafari".to_string(),
            application_id: "123".to_string(),
            application_name: "Safari".to_string(),
            host_application_id: None,
            is_application_active: true,
            is_application_proxy: false,
            is_application_ready: None,
            remote_automation_enabled: None,
        });
        write_message(&mut far, &connected).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received, connected);
        inspector.close().await.unwrap();
    }

    #[tokio::test]
    async fn messages_are_received_in_wire_order() {
        let (inspector, mut far) = inspector_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        inspector.start_listening(move |message| {
            tx.send(message).unwrap();
        });

        for id in ["one", "two", "three"] {
            write_message(
                &mut far,
                &InspectorMessage::ReportIdentifier {
                    connection_id: id.to_string(),
                },
            )
            .await;
        }
        for expected in ["one", "two", "three"] {
            match rx.recv().await.unwrap() {
                InspectorMessage::ReportIdentifier { connection_id } => {
                    assert_eq!(connection_id, expected);
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        inspector.close().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "web inspector is not started")]
    async fn send_before_start_is_a_programming_error() {
        let (inspector, _far) = inspector_pair();
        let _ = inspector.send_message(&report_identifier()).await;
    }

    #[tokio::test]
    #[should_panic(expected = "web inspector already started")]
    async fn double_start_is_a_programming_error() {
        let (inspector, _far) = inspector_pair();
        inspector.start_listening(|_| {});
        inspector.start_listening(|_| {});
    }

    #[tokio::test]
    #[should_panic(expected = "web inspector is not started")]
    async fn double_close_is_a_programming_error() {
        let (inspector, _far) = inspector_pair();
        inspector.start_listening(|_| {});
        inspector.close().await.unwrap();
        let _ = inspector.close().await;
    }

    #[tokio::test]
    #[should_panic(expected = "web inspector is closed")]
    async fn send_after_remote_eof_is_a_programming_error() {
        let (inspector, far) = inspector_pair();
        inspector.start_listening(|_| {});
        drop(far);
        // Give the pump a beat to observe the closure.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = inspector.send_message(&report_identifier()).await;
    }
}
