//! Control iOS devices from an automation host.
//!
//! This crate drives both physical devices tethered over USB (through the
//! libimobiledevice command-line tools plus `cfgutil` for supervised
//! devices) and simulators running on the host (through `xcrun simctl`).
//! Both kinds of device are exposed behind the same [`IosDevice`] contract:
//! install and uninstall applications, launch them and stream their output,
//! capture system and crash logs, take screenshots, restart, and open a
//! remote Web Inspector channel to Safari/WebKit.

pub mod command;
pub mod memo;
pub mod model;
pub mod real;
pub mod retry;
pub mod simulator;
pub mod webinspector;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::command::{CaptureReader, CommandError, CommandProcess};
use crate::model::{IosAppBundleId, IosAppInfo, IosModel, IosVersion};
use crate::webinspector::InspectorSocket;

pub use crate::real::RealDeviceHost;
pub use crate::simulator::SimulatorDeviceHost;

/// A trait combining all required characteristics for a device communication
/// socket.
///
/// Tokio's TcpStream and the in-memory duplex stream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ReadWrite for T {}

/// Recovery hint attached to a [`DeviceError`].
///
/// A remedy is a suggestion that *may* resolve the error; callers opt into
/// acting on it, usually through a [`retry::Retrier`] handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Remedy {
    /// A dialog on the device is probably blocking the operation.
    DismissDialog,
    /// The application install is probably corrupt or stale.
    ReinstallApp,
    /// The device itself is probably wedged.
    RestartDevice,
}

/// Machine-readable classification of a [`DeviceError`], consumed by the
/// recovery handlers in the real-device driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceErrorKind {
    Other,
    /// An operation did not complete within its deadline.
    Timeout,
    /// A service required the developer disk image and it is not mounted.
    DeveloperImageNotMounted,
    /// The on-device debugserver produced no output at all.
    DebugServerWedged,
    /// The device did not answer a liveness probe.
    Unresponsive,
}

/// Signals an error occurred when interacting with an iOS device.
///
/// Every device error names the offending device and optionally carries a
/// suggested [`Remedy`] and the underlying cause. The cause is reference
/// counted so memoized failures stay cloneable.
#[derive(Clone, Debug)]
pub struct DeviceError {
    udid: String,
    message: String,
    kind: DeviceErrorKind,
    remedy: Option<Remedy>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl DeviceError {
    pub fn new(udid: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError {
            udid: udid.into(),
            message: message.into(),
            kind: DeviceErrorKind::Other,
            remedy: None,
            cause: None,
        }
    }

    pub fn with_cause(
        udid: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        DeviceError {
            udid: udid.into(),
            message: cause.to_string(),
            kind: DeviceErrorKind::Other,
            remedy: None,
            cause: Some(Arc::new(cause)),
        }
    }

    pub fn remedy(mut self, remedy: Remedy) -> Self {
        self.remedy = Some(remedy);
        self
    }

    pub fn kind(mut self, kind: DeviceErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// The UDID of the device on which the error occurred; empty for errors
    /// raised by a device host before a device was resolved.
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Suggested remedy that *may* resolve the cause of the error.
    pub fn suggested_remedy(&self) -> Option<Remedy> {
        self.remedy
    }

    pub fn error_kind(&self) -> DeviceErrorKind {
        self.kind
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.udid.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "device {}: {}", self.udid, self.message)
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// An iOS device, real or simulated.
///
/// Implementations are cheap to share behind an [`Arc`]; all methods take
/// `&self`. Two devices are equal exactly when their UDIDs are equal.
#[allow(async_fn_in_trait)]
pub trait IosDevice {
    type AppProcess: IosAppProcess;

    /// The unique device identifier: 40 hex characters for a real device, a
    /// UUID for a simulator.
    fn udid(&self) -> &str;

    /// Whether the device currently answers a liveness probe.
    async fn is_responsive(&self) -> bool;

    /// Whether a [`restart`](Self::restart) is currently in progress.
    fn is_restarting(&self) -> bool;

    async fn model(&self) -> Result<IosModel, DeviceError>;

    async fn version(&self) -> Result<IosVersion, DeviceError>;

    async fn list_applications(&self) -> Result<Vec<IosAppInfo>, DeviceError>;

    async fn is_application_installed(
        &self,
        bundle_id: &IosAppBundleId,
    ) -> Result<bool, DeviceError>;

    /// Installs the application at the given `.app` directory or `.ipa`
    /// archive path.
    async fn install_application(&self, ipa_or_app_path: &Path) -> Result<(), DeviceError>;

    async fn uninstall_application(&self, bundle_id: &IosAppBundleId) -> Result<(), DeviceError>;

    /// Launches the application and returns a handle over the running
    /// process.
    async fn run_application(
        &self,
        bundle_id: &IosAppBundleId,
        args: &[&str],
    ) -> Result<Self::AppProcess, DeviceError>;

    /// Starts capturing the device system log to `log_path`.
    ///
    /// At most one system logger may run per device at a time; starting a
    /// second one is a programming error.
    async fn start_system_logger(&self, log_path: &Path) -> Result<SystemLogger, DeviceError>;

    async fn pull_crash_logs(&self, directory: &Path) -> Result<(), DeviceError>;

    async fn clear_crash_logs(&self) -> Result<(), DeviceError>;

    async fn restart(&self) -> Result<(), DeviceError>;

    /// Returns the screen contents as PNG bytes.
    async fn take_screenshot(&self) -> Result<Vec<u8>, DeviceError>;

    /// Opens a framed plist socket to the device's Web Inspector service.
    async fn open_web_inspector_socket(&self) -> Result<InspectorSocket, DeviceError>;
}

/// A future-like handle over an application launched on a device.
#[allow(async_fn_in_trait)]
pub trait IosAppProcess {
    /// Sends the termination signal to the hosting process and returns
    /// immediately.
    fn kill(&self);

    /// Waits for the application to exit and returns its output.
    async fn wait(&self) -> Result<String, DeviceError>;

    /// Like [`wait`](Self::wait) but fails once `timeout` elapses. The
    /// application keeps running; the caller decides whether to kill it.
    async fn wait_with_timeout(&self, timeout: Duration) -> Result<String, DeviceError>;

    /// A streaming view over the same output [`wait`](Self::wait) returns.
    fn output_reader(&self) -> CaptureReader;
}

/// A host owning a fleet of connected devices of one kind.
#[allow(async_fn_in_trait)]
pub trait IosDeviceHost {
    type Device: IosDevice;

    /// All devices currently attached to or configured on this host. The
    /// same device is always represented by the same instance.
    async fn connected_devices(&self) -> Result<Vec<Arc<Self::Device>>, DeviceError>;

    /// The connected device with the given udid; the returned instance is
    /// shared with [`connected_devices`](Self::connected_devices).
    async fn connected_device(&self, udid: &str) -> Result<Arc<Self::Device>, DeviceError> {
        self.connected_devices()
            .await?
            .into_iter()
            .find(|d| d.udid() == udid)
            .ok_or_else(|| DeviceError::new(udid, "device not connected"))
    }
}

/// A running system-log capture, returned by
/// [`IosDevice::start_system_logger`].
///
/// Closing consumes the resource, so releasing it twice is not expressible.
pub struct SystemLogger {
    udid: String,
    process: CommandProcess,
    started: Arc<AtomicBool>,
}

impl SystemLogger {
    pub(crate) fn new(udid: &str, process: CommandProcess, started: Arc<AtomicBool>) -> Self {
        SystemLogger {
            udid: udid.to_string(),
            process,
            started,
        }
    }

    /// Stops the capture and releases the device's logger slot.
    pub async fn close(self) -> Result<(), DeviceError> {
        let was_started = self.started.swap(false, Ordering::SeqCst);
        assert!(was_started, "system logger has already been stopped");
        match self.process.kill().wait().await {
            Ok(_) => Ok(()),
            // The syslog tools report 143 when terminated and 255 on a
            // dropped device connection; both mean the capture is over.
            Err(CommandError::Failed(failure))
                if matches!(failure.result().exit_code(), 143 | 255) =>
            {
                Ok(())
            }
            Err(e) => Err(DeviceError::with_cause(&self.udid, e)),
        }
    }
}
