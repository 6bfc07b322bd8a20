//! Physical devices tethered over USB, driven through the
//! libimobiledevice tools and `cfgutil`.

mod app_runner;
pub(crate) mod commands;
mod disk_images;

pub use app_runner::{DebugServerClient, DebugServerError};
pub use commands::SupervisionIdentity;
pub use disk_images::{DevDiskImages, DiskImage};

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::command::{CaptureReader, CommandError, CommandProcess, CommandResult};
use crate::memo::Memoized;
use crate::model::{
    bundle_id_from_ipa, product_name_for_identifier, IosAppBundleId, IosAppInfo, IosModel,
    IosVersion,
};
use crate::retry::{RecoveryAction, Retrier};
use crate::webinspector::InspectorSocket;
use crate::{DeviceError, DeviceErrorKind, IosAppProcess, IosDevice, IosDeviceHost, Remedy,
    SystemLogger};
use commands::{CfgutilCommands, IdeviceCommands};

const XCODE_ROOT_IMAGES_DIR: &str =
    "/Applications/Xcode.app/Contents/Developer/Platforms/iPhoneOS.platform/DeviceSupport";

static HOST_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration of the real device host.
#[derive(Clone, Debug)]
pub struct Configuration {
    disk_images_root: PathBuf,
    supervision_id: Option<SupervisionIdentity>,
}

impl Configuration {
    /// Adds the supervision identity that allows `cfgutil` to manage
    /// profiles and pair without a trust dialog.
    pub fn with_supervision_identity(
        mut self,
        certificate_path: impl Into<PathBuf>,
        private_key_path: impl Into<PathBuf>,
    ) -> Self {
        self.supervision_id = Some(SupervisionIdentity {
            certificate_path: certificate_path.into(),
            private_key_path: private_key_path.into(),
        });
        self
    }

    /// Builds the host.
    ///
    /// # Panics
    /// A real-device host can only be initialized once per process, as
    /// protection against over-exercising physical devices with commands
    /// firing from multiple hosts.
    pub fn initialize(self) -> RealDeviceHost {
        let already = HOST_INITIALIZED.swap(true, Ordering::SeqCst);
        assert!(!already, "RealDeviceHost already initialized");
        RealDeviceHost {
            configuration: self,
            devices: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

/// The host of all USB-tethered devices, backed by the libimobiledevice
/// tools.
pub struct RealDeviceHost {
    configuration: Configuration,
    devices: tokio::sync::Mutex<HashMap<String, Arc<RealDevice>>>,
}

impl RealDeviceHost {
    /// Configuration using the developer disk images that ship inside
    /// Xcode.
    pub fn with_developer_disk_images_from_xcode() -> Configuration {
        Self::with_developer_disk_images_from(XCODE_ROOT_IMAGES_DIR)
    }

    pub fn with_developer_disk_images_from(root: impl Into<PathBuf>) -> Configuration {
        Configuration {
            disk_images_root: root.into(),
            supervision_id: None,
        }
    }

    async fn make_device(&self, udid: &str) -> Result<RealDevice, DeviceError> {
        let idevice = IdeviceCommands::new(udid);
        // --simple keeps this working before the device is paired.
        let ecid_output = host_await(idevice.info(&["--simple", "-k", "UniqueChipID"])).await?;
        let ecid: u64 = ecid_output
            .trim()
            .parse()
            .map_err(|_| DeviceError::new(udid, format!("bad UniqueChipID: {ecid_output:?}")))?;
        let cfgutil = CfgutilCommands::new(
            format!("{ecid:x}"),
            self.configuration.supervision_id.clone(),
        );
        Ok(RealDevice::new(
            udid,
            idevice,
            cfgutil,
            DevDiskImages::in_directory(&self.configuration.disk_images_root),
        ))
    }
}

impl IosDeviceHost for RealDeviceHost {
    type Device = RealDevice;

    async fn connected_devices(&self) -> Result<Vec<Arc<RealDevice>>, DeviceError> {
        let listing = host_await(IdeviceCommands::id(&["-l"])).await?;
        let mut devices = self.devices.lock().await;
        let mut connected = Vec::new();
        for udid in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(device) = devices.get(udid) {
                connected.push(Arc::clone(device));
                continue;
            }
            let device = Arc::new(self.make_device(udid).await?);
            devices.insert(udid.to_string(), Arc::clone(&device));
            connected.push(device);
        }
        Ok(connected)
    }
}

async fn host_await(process: CommandProcess) -> Result<String, DeviceError> {
    match process.wait().await {
        Ok(result) => Ok(result.stdout_utf8()),
        Err(e) => Err(DeviceError::with_cause("", e)),
    }
}

/// A configuration profile installed on a supervised device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationProfile {
    pub display_name: String,
    pub identifier: String,
    pub version: i64,
}

#[derive(Clone)]
struct DeviceInfo {
    model: IosModel,
    version: IosVersion,
}

/// A physical iOS device.
pub struct RealDevice {
    udid: String,
    idevice: IdeviceCommands,
    cfgutil: CfgutilCommands,
    disk_images: DevDiskImages,
    // ideviceinfo values are constant for as long as a device stays
    // attached to a host, so one read serves the device's lifetime.
    info: Memoized<DeviceInfo, DeviceError>,
    logger_started: Arc<AtomicBool>,
    restarting: AtomicBool,
}

impl PartialEq for RealDevice {
    fn eq(&self, other: &Self) -> bool {
        self.udid == other.udid
    }
}

impl Eq for RealDevice {}

impl std::fmt::Debug for RealDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealDevice").field("udid", &self.udid).finish()
    }
}

impl RealDevice {
    fn new(
        udid: &str,
        idevice: IdeviceCommands,
        cfgutil: CfgutilCommands,
        disk_images: DevDiskImages,
    ) -> Self {
        RealDevice {
            udid: udid.to_string(),
            idevice,
            cfgutil,
            disk_images,
            info: Memoized::new(),
            logger_started: Arc::new(AtomicBool::new(false)),
            restarting: AtomicBool::new(false),
        }
    }

    fn error(&self, message: impl Into<String>) -> DeviceError {
        DeviceError::new(&self.udid, message)
    }

    fn error_cause(&self, cause: impl std::error::Error + Send + Sync + 'static) -> DeviceError {
        DeviceError::with_cause(&self.udid, cause)
    }

    /// Waits for a process, treating a command failure as a result rather
    /// than an error; exit-code policy is applied by the caller.
    async fn await_result(&self, process: &CommandProcess) -> Result<CommandResult, DeviceError> {
        match process.wait().await {
            Ok(result) => Ok(result),
            Err(CommandError::Failed(failure)) => Ok(failure.result().clone()),
            Err(e) => Err(self.error_cause(e)),
        }
    }

    /// Waits for an idevice/cfgutil process and returns its stdout.
    /// `expected_exit_codes` defaults to just zero.
    ///
    /// If an idevice command fails because the device is not trusted and a
    /// supervision identity is configured, the device is paired with
    /// `cfgutil pair` and the command retried once.
    async fn await_command(
        &self,
        process: CommandProcess,
        expected_exit_codes: &[i32],
    ) -> Result<String, DeviceError> {
        let mut result = self.await_result(&process).await?;

        if result.exit_code() != 0 {
            let command = process.command();
            let filename = Path::new(command.executable())
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default();
            // cfgutil does not report lockdownd errors, but checking the
            // executable name also rules out any recursion through pair().
            if filename.starts_with("idevice")
                && result.stderr_utf8().contains("Could not connect to lockdownd")
            {
                if self.cfgutil.is_supervised() {
                    let pair_result = self.await_result(&self.cfgutil.pair()).await?;
                    if pair_result.exit_code() != 0 {
                        return Err(
                            self.error(format!("pairing failed: {pair_result}"))
                        );
                    }
                    let rerun = commands::exec(command.clone());
                    result = self.await_result(&rerun).await?;
                } else {
                    warn!(
                        "set a configuration profile in the device host \
                         to automatically pair the device"
                    );
                }
            }
        }

        let expected: &[i32] = if expected_exit_codes.is_empty() {
            &[0]
        } else {
            expected_exit_codes
        };
        if !expected.contains(&result.exit_code()) {
            return Err(self.error(format!("unexpected exit code in result: {result}")));
        }
        Ok(result.stdout_utf8())
    }

    async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        self.info
            .get_or_init(|| async move {
                let xml = self.await_command(self.idevice.info(&["-x"]), &[]).await?;
                let value = plist::Value::from_reader(Cursor::new(xml.into_bytes()))
                    .map_err(|e| self.error_cause(e))?;
                let dict = value
                    .as_dictionary()
                    .ok_or_else(|| self.error("ideviceinfo output is not a dictionary"))?;
                let string = |key: &str| -> Result<String, DeviceError> {
                    dict.get(key)
                        .and_then(|v| v.as_string())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            self.error(format!("key {key} missing from device info"))
                        })
                };

                let identifier = string("ProductType")?;
                let product_name = product_name_for_identifier(&identifier)
                    .ok_or_else(|| {
                        self.error(format!("no product name found for {identifier}"))
                    })?;
                let architecture = string("CPUArchitecture")?
                    .parse()
                    .map_err(|e| self.error_cause(e))?;
                Ok(DeviceInfo {
                    model: IosModel::new(identifier, product_name, architecture),
                    version: IosVersion::new(string("BuildVersion")?, string("ProductVersion")?),
                })
            })
            .await
    }

    /// Battery charge percentage.
    pub async fn battery_level(&self) -> Result<i32, DeviceError> {
        let output = self
            .await_command(
                self.idevice.info(&[
                    "-k",
                    "BatteryCurrentCapacity",
                    "-q",
                    "com.apple.mobile.battery",
                ]),
                &[],
            )
            .await?;
        output
            .trim()
            .parse()
            .map_err(|_| self.error(format!("bad battery level: {output:?}")))
    }

    /// Sets the device clock from the host clock.
    pub async fn sync_to_system_time(&self) -> Result<(), DeviceError> {
        self.await_command(self.idevice.date(&["--sync"]), &[]).await?;
        Ok(())
    }

    pub async fn install_profile(&self, profile_path: &Path) -> Result<(), DeviceError> {
        self.await_command(
            self.cfgutil.install_profile(&profile_path.to_string_lossy()),
            &[],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_profile(&self, identifier: &str) -> Result<(), DeviceError> {
        match self
            .await_command(self.cfgutil.remove_profile(identifier), &[])
            .await
        {
            Ok(_) => Ok(()),
            // A remove of a profile that is not installed is a no-op.
            Err(e) if e.to_string().contains("cfgutil: warning: no such profile") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_configuration_profiles(
        &self,
    ) -> Result<Vec<ConfigurationProfile>, DeviceError> {
        let xml = self
            .await_command(self.cfgutil.get("configurationProfiles"), &[])
            .await?;
        let value = plist::Value::from_reader(Cursor::new(xml.into_bytes()))
            .map_err(|e| self.error_cause(e))?;
        let malformed = || self.error("unexpected cfgutil output shape");
        let dict = value.as_dictionary().ok_or_else(malformed)?;
        let ecid = dict
            .get("Devices")
            .and_then(|v| v.as_array())
            .and_then(|devices| devices.first())
            .and_then(|v| v.as_string())
            .ok_or_else(malformed)?;
        let profile_array = dict
            .get("Output")
            .and_then(|v| v.as_dictionary())
            .and_then(|output| output.get(ecid))
            .and_then(|v| v.as_dictionary())
            .and_then(|device| device.get("configurationProfiles"))
            .and_then(|v| v.as_array())
            .ok_or_else(malformed)?;

        profile_array
            .iter()
            .map(|entry| {
                let profile = entry.as_dictionary().ok_or_else(malformed)?;
                Ok(ConfigurationProfile {
                    display_name: profile
                        .get("displayName")
                        .and_then(|v| v.as_string())
                        .ok_or_else(malformed)?
                        .to_string(),
                    identifier: profile
                        .get("identifier")
                        .and_then(|v| v.as_string())
                        .ok_or_else(malformed)?
                        .to_string(),
                    version: profile
                        .get("version")
                        .and_then(|v| v.as_signed_integer())
                        .ok_or_else(malformed)?,
                })
            })
            .collect()
    }

    async fn mount_developer_image(&self) -> Result<(), DeviceError> {
        let version = self.version().await?;
        let disk_image = self.disk_images.find_for_version(version.product_version());
        let image = disk_image.image.to_string_lossy().into_owned();
        let signature = disk_image.signature.to_string_lossy().into_owned();
        let process = self
            .idevice
            .imagemounter(&[image.as_str(), signature.as_str()]);
        // ideviceimagemounter sometimes reports 255 even when it succeeds.
        self.await_command(process, &[0, 255]).await?;
        Ok(())
    }

    /// Starts a service-backed process, mounting the developer image and
    /// retrying when the service turns out to be unavailable. Whether the
    /// "Could not start" notice appears on stdout or stderr depends on the
    /// tool.
    ///
    /// `ideviceimagemounter -l` could check mounted state up front, but
    /// the image usually is mounted already (this is faster) and the
    /// listing lies on iOS 7.
    async fn retry_with_developer_image_mount<F, Fut>(
        &self,
        error_to_stdout: bool,
        start: F,
    ) -> Result<CommandProcess, DeviceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<CommandProcess, DeviceError>>,
    {
        Retrier::new()
            .with_max_attempts(10)
            .with_delay(Duration::from_secs(3))
            .run_with_handler(
                || self.probe_service_start(error_to_stdout, &start),
                |failure| {
                    let mount = failure.error_kind() == DeviceErrorKind::DeveloperImageNotMounted;
                    async move {
                        if mount {
                            info!("mounting developer image on {} and retrying", self.udid);
                            self.mount_developer_image().await?;
                            Ok(RecoveryAction::Retry)
                        } else {
                            Ok(RecoveryAction::Fail)
                        }
                    }
                },
            )
            .await
    }

    /// One attempt of a service-backed start: launches the process and
    /// inspects the first output line for the missing-image notice.
    async fn probe_service_start<F, Fut>(
        &self,
        error_to_stdout: bool,
        start: &F,
    ) -> Result<CommandProcess, DeviceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<CommandProcess, DeviceError>>,
    {
        let process = start().await?;
        let mut output = if error_to_stdout {
            process.stdout_reader()
        } else {
            process.stderr_reader()
        };
        let first_line = output.next_line().await.unwrap_or_default();
        if first_line.starts_with("Could not start") {
            self.await_command(process, &[255]).await?;
            Err(self
                .error("cannot use this service without mounting a developer image")
                .kind(DeviceErrorKind::DeveloperImageNotMounted))
        } else {
            Ok(process)
        }
    }

    /// Starts the apprunner, restarting the device and trying once more
    /// when the debug server appears wedged.
    async fn start_apprunner(&self, args: &[String]) -> Result<CommandProcess, DeviceError> {
        Retrier::new()
            .with_max_attempts(2)
            .run_with_handler(
                || self.spawn_apprunner_checked(args),
                |failure| {
                    let wedged = failure.error_kind() == DeviceErrorKind::DebugServerWedged;
                    async move {
                        if wedged {
                            self.restart().await?;
                            Ok(RecoveryAction::Retry)
                        } else {
                            Ok(RecoveryAction::Fail)
                        }
                    }
                },
            )
            .await
    }

    async fn spawn_apprunner_checked(
        &self,
        args: &[String],
    ) -> Result<CommandProcess, DeviceError> {
        let process = self.idevice.apprunner(args);
        self.wait_for_stderr_output(&process).await?;
        Ok(process)
    }

    /// Polls for stderr output until deciding the debug server is wedged.
    async fn wait_for_stderr_output(&self, process: &CommandProcess) -> Result<(), DeviceError> {
        Retrier::new()
            .with_max_attempts(5)
            .with_delay(Duration::from_secs(1))
            .run_with_handler(
                || self.probe_apprunner_stderr(process),
                |failure| {
                    let wedged = failure.error_kind() == DeviceErrorKind::DebugServerWedged;
                    async move {
                        Ok(if wedged {
                            RecoveryAction::Retry
                        } else {
                            RecoveryAction::Fail
                        })
                    }
                },
            )
            .await
    }

    async fn probe_apprunner_stderr(&self, process: &CommandProcess) -> Result<(), DeviceError> {
        if process.stderr_reader().available() == 0 {
            Err(self
                .error("no apprunner output; is the debug server wedged?")
                .kind(DeviceErrorKind::DebugServerWedged))
        } else {
            Ok(())
        }
    }

    async fn check_responsive_after_reboot(&self) -> Result<(), DeviceError> {
        if self.is_responsive().await {
            Ok(())
        } else {
            Err(self
                .error("device unresponsive after reboot")
                .kind(DeviceErrorKind::Unresponsive))
        }
    }

    async fn spawn_screenshot(&self, screenshot_path: &str) -> Result<CommandProcess, DeviceError> {
        Ok(self.idevice.screenshot(&[screenshot_path]))
    }
}

impl IosDevice for RealDevice {
    type AppProcess = RealAppProcess;

    fn udid(&self) -> &str {
        &self.udid
    }

    async fn is_responsive(&self) -> bool {
        match self.await_command(self.idevice.date(&[]), &[]).await {
            Ok(output) => !output.is_empty(),
            Err(_) => false,
        }
    }

    fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    async fn model(&self) -> Result<IosModel, DeviceError> {
        Ok(self.device_info().await?.model)
    }

    async fn version(&self) -> Result<IosVersion, DeviceError> {
        Ok(self.device_info().await?.version)
    }

    async fn list_applications(&self) -> Result<Vec<IosAppInfo>, DeviceError> {
        let xml = self
            .await_command(self.idevice.installer(&["-l", "-o", "xml"]), &[])
            .await?;
        let value = plist::Value::from_reader(Cursor::new(xml.into_bytes()))
            .map_err(|e| self.error_cause(e))?;
        let apps = value
            .as_array()
            .ok_or_else(|| self.error("application list is not an array"))?;
        apps.iter()
            .map(|app| IosAppInfo::read_from_plist(app).map_err(|e| self.error_cause(e)))
            .collect()
    }

    async fn is_application_installed(
        &self,
        bundle_id: &IosAppBundleId,
    ) -> Result<bool, DeviceError> {
        Ok(self
            .list_applications()
            .await?
            .iter()
            .any(|app| app.bundle_id() == bundle_id))
    }

    async fn install_application(&self, ipa_or_app_path: &Path) -> Result<(), DeviceError> {
        let bundle_id = bundle_id_from_ipa(ipa_or_app_path).map_err(|e| self.error_cause(e))?;

        // When the bundle id matches an installed app whose application
        // identifier entitlement differs, the install fails spuriously;
        // uninstall the existing app and run the install again.
        let ipa = ipa_or_app_path.to_string_lossy();
        match self
            .await_command(self.idevice.installer(&["-i", ipa.as_ref()]), &[])
            .await
        {
            Ok(_) => {}
            Err(e) if e.to_string().contains("MismatchedApplicationIdentifierEntitlement") => {
                self.await_command(
                    self.idevice.installer(&["-U", bundle_id.as_str()]),
                    &[],
                )
                .await?;
                self.await_command(self.idevice.installer(&["-i", ipa.as_ref()]), &[])
                    .await?;
            }
            Err(e) => return Err(e),
        }

        // Checking the install catches failures early, and the act of
        // listing also nudges the device's internal application list to
        // catch up; install-reboot-run in quick succession fails without
        // it.
        if !self.is_application_installed(&bundle_id).await? {
            return Err(self.error(format!(
                "{bundle_id} not in application list after install"
            )));
        }
        Ok(())
    }

    async fn uninstall_application(&self, bundle_id: &IosAppBundleId) -> Result<(), DeviceError> {
        if self.is_application_installed(bundle_id).await? {
            self.await_command(
                self.idevice.installer(&["-U", bundle_id.as_str()]),
                &[],
            )
            .await?;
        }
        Ok(())
    }

    async fn run_application(
        &self,
        bundle_id: &IosAppBundleId,
        args: &[&str],
    ) -> Result<RealAppProcess, DeviceError> {
        let mut apprunner_args = vec![
            "-d".to_string(),
            "-s".to_string(),
            bundle_id.to_string(),
            "--args".to_string(),
        ];
        apprunner_args.extend(args.iter().map(|a| a.to_string()));

        // The debugserver service behind the apprunner needs the developer
        // image.
        let process = self
            .retry_with_developer_image_mount(false, || self.start_apprunner(&apprunner_args))
            .await?;
        Ok(RealAppProcess {
            udid: self.udid.clone(),
            process,
        })
    }

    async fn start_system_logger(&self, log_path: &Path) -> Result<SystemLogger, DeviceError> {
        let already = self.logger_started.swap(true, Ordering::SeqCst);
        assert!(!already, "system logger has already been started");
        Ok(SystemLogger::new(
            &self.udid,
            self.idevice.syslog(log_path),
            Arc::clone(&self.logger_started),
        ))
    }

    async fn pull_crash_logs(&self, directory: &Path) -> Result<(), DeviceError> {
        let directory = directory.to_string_lossy();
        self.await_command(self.idevice.crashreport(&[directory.as_ref()]), &[])
            .await?;
        Ok(())
    }

    async fn clear_crash_logs(&self) -> Result<(), DeviceError> {
        let scratch = tempfile::tempdir().map_err(|e| self.error_cause(e))?;
        let scratch_path = scratch.path().to_string_lossy().into_owned();
        self.await_command(self.idevice.crashreport(&[scratch_path.as_str()]), &[])
            .await?;
        Ok(())
    }

    async fn restart(&self) -> Result<(), DeviceError> {
        self.await_command(self.idevice.diagnostics(&["restart"]), &[])
            .await?;

        // The flag clears on every exit path, cancellation included.
        struct ClearOnExit<'a>(&'a AtomicBool);
        impl Drop for ClearOnExit<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        self.restarting.store(true, Ordering::SeqCst);
        let _clear = ClearOnExit(&self.restarting);

        // A device always takes at least 30 seconds to reboot.
        tokio::time::sleep(Duration::from_secs(30)).await;
        Retrier::new()
            .with_max_attempts(12)
            .with_delay(Duration::from_secs(5))
            .run(|| self.check_responsive_after_reboot())
            .await
    }

    async fn take_screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        let scratch = tempfile::tempdir().map_err(|e| self.error_cause(e))?;
        let screenshot_path = scratch.path().join("screenshot.out");
        let path_arg = screenshot_path.to_string_lossy().into_owned();

        // The screenshot service also needs the developer image; its
        // "Could not start" notice goes to stdout.
        let process = self
            .retry_with_developer_image_mount(true, || self.spawn_screenshot(&path_arg))
            .await?;
        self.await_command(process, &[]).await?;

        let bytes = std::fs::read(&screenshot_path).map_err(|e| self.error_cause(e))?;
        match image::guess_format(&bytes) {
            Ok(image::ImageFormat::Png) => Ok(bytes),
            // iOS versions before 9 produce TIFF.
            _ => {
                let decoded =
                    image::load_from_memory(&bytes).map_err(|e| self.error_cause(e))?;
                let mut png = Vec::new();
                decoded
                    .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
                    .map_err(|e| self.error_cause(e))?;
                Ok(png)
            }
        }
    }

    async fn open_web_inspector_socket(&self) -> Result<InspectorSocket, DeviceError> {
        InspectorSocket::open_to_real_device(&self.udid)
            .await
            .map_err(|e| self.error_cause(e))
    }
}

/// A running app, backed by an `idevice-app-runner` process.
pub struct RealAppProcess {
    udid: String,
    process: CommandProcess,
}

impl RealAppProcess {
    fn map_failure(&self, failure: crate::command::CommandFailure) -> DeviceError {
        let remedy = {
            let stderr = failure.result().stderr_utf8();
            let trimmed = stderr.trim();
            let last_line = trimmed.rsplit('\n').next().unwrap_or(trimmed);
            remedy_for_last_line(last_line)
        };
        let error = DeviceError::with_cause(&self.udid, CommandError::Failed(failure));
        match remedy {
            Some(remedy) => error.remedy(remedy),
            None => error,
        }
    }
}

impl IosAppProcess for RealAppProcess {
    fn kill(&self) {
        self.process.kill();
    }

    async fn wait(&self) -> Result<String, DeviceError> {
        match self.process.wait().await {
            Ok(result) => Ok(result.stdout_utf8()),
            Err(CommandError::Failed(failure)) => Err(self.map_failure(failure)),
            Err(e) => Err(DeviceError::with_cause(&self.udid, e)),
        }
    }

    async fn wait_with_timeout(&self, timeout: Duration) -> Result<String, DeviceError> {
        match self.process.wait_with_timeout(timeout).await {
            Ok(result) => Ok(result.stdout_utf8()),
            Err(CommandError::Failed(failure)) => Err(self.map_failure(failure)),
            // A launch that hangs is usually a dialog waiting on the
            // screen.
            Err(e @ CommandError::Timeout { .. }) => {
                Err(DeviceError::with_cause(&self.udid, e)
                    .kind(DeviceErrorKind::Timeout)
                    .remedy(Remedy::DismissDialog))
            }
            Err(e) => Err(DeviceError::with_cause(&self.udid, e)),
        }
    }

    fn output_reader(&self) -> CaptureReader {
        self.process.stdout_reader()
    }
}

/// Maps the last line of apprunner stderr to a suggested remedy.
fn remedy_for_last_line(last_line: &str) -> Option<Remedy> {
    // Stale or broken installs answer with these packets.
    if last_line.contains("$E4294967295#")
        || last_line.contains("$ENotFound#")
        || last_line.contains("Unknown APPID")
        || packet_error(last_line, "$Efailed to get the task for process")
        || packet_error(last_line, "$ENo such file or directory")
    {
        return Some(Remedy::ReinstallApp);
    }
    if last_line.contains("$Etimed out trying to launch app#") {
        return Some(Remedy::RestartDevice);
    }
    None
}

/// Whether the line carries an `$E...#` packet starting with `prefix`.
fn packet_error(line: &str, prefix: &str) -> bool {
    line.find(prefix)
        .is_some_and(|at| line[at + prefix.len()..].contains('#'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_patterns_map_to_their_remedies() {
        let cases = [
            ("$E4294967295#", Some(Remedy::ReinstallApp)),
            (
                "$Efailed to get the task for process 4242#b3",
                Some(Remedy::ReinstallApp),
            ),
            (
                "$ENo such file or directory (/private/var/App.app)#88",
                Some(Remedy::ReinstallApp),
            ),
            ("$ENotFound#", Some(Remedy::ReinstallApp)),
            ("Unknown APPID (fake.google.OpenUrl) is not in:", Some(Remedy::ReinstallApp)),
            (
                "$Etimed out trying to launch app#",
                Some(Remedy::RestartDevice),
            ),
            ("sent[19] ($QStartNoAckMode#b0)", None),
            ("some unrelated failure", None),
        ];
        for (line, expected) in cases {
            assert_eq!(remedy_for_last_line(line), expected, "for line {line:?}");
        }
    }

    #[test]
    fn packet_errors_need_a_closing_hash() {
        assert!(packet_error("$Efailed to get the task for process 1#00", "$Efailed to get the task for process"));
        assert!(!packet_error("$Efailed to get the task for process 1", "$Efailed to get the task for process"));
    }

    #[test]
    fn devices_compare_by_udid() {
        let disk_images = DevDiskImages::in_directory("/tmp/images");
        let first = RealDevice::new(
            "0123456789abcdef0123456789abcdef01234567",
            IdeviceCommands::new("0123456789abcdef0123456789abcdef01234567"),
            CfgutilCommands::new("1f2e3d", None),
            disk_images.clone(),
        );
        let same = RealDevice::new(
            "0123456789abcdef0123456789abcdef01234567",
            IdeviceCommands::new("0123456789abcdef0123456789abcdef01234567"),
            CfgutilCommands::new("ffffff", None),
            disk_images.clone(),
        );
        let other = RealDevice::new(
            "fedcba9876543210fedcba9876543210fedcba98",
            IdeviceCommands::new("fedcba9876543210fedcba9876543210fedcba98"),
            CfgutilCommands::new("1f2e3d", None),
            disk_images,
        );
        assert_eq!(first, same);
        assert_ne!(first, other);
    }

    #[test]
    fn host_configuration_initializes_exactly_once() {
        let host = RealDeviceHost::with_developer_disk_images_from("/tmp/images").initialize();
        assert!(host.devices.try_lock().is_ok());
        let second = std::panic::catch_unwind(|| {
            RealDeviceHost::with_developer_disk_images_from("/tmp/images").initialize()
        });
        assert!(second.is_err());
    }
}
