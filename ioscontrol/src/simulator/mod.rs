//! Simulated devices running on the host, driven through `xcrun simctl`.

mod simctl;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Deserialize;

use crate::command::{CommandError, CommandProcess, CommandResult};
use crate::memo::Memoized;
use crate::model::{Architecture, IosAppBundleId, IosAppInfo, IosModel, IosVersion};
use crate::webinspector::InspectorSocket;
use crate::{DeviceError, IosAppProcess, IosDevice, IosDeviceHost, SystemLogger};
use simctl::{ShellCommands, SimctlCommands};

const DEVICE_TYPE_PREFIX: &str = "com.apple.CoreSimulator.SimDeviceType.";
const DEVICE_TYPES_DIR: &str = "/Applications/Xcode.app/Contents/Developer/Platforms/\
     iPhoneSimulator.platform/Developer/Library/CoreSimulator/Profiles/DeviceTypes";

/// The port the simulator's Web Inspector listens on; used to identify
/// which device currently owns the inspector.
const INSPECTOR_PORT: u16 = 27753;

// Models and system-app listings are per-installation facts, shared by
// every device that refers to them.
static DEVICE_TYPE_MODELS: OnceLock<Mutex<HashMap<String, IosModel>>> = OnceLock::new();
static RUNTIME_SYSTEM_APPS: OnceLock<Mutex<HashMap<String, Vec<IosAppInfo>>>> = OnceLock::new();

/// The host of all simulated devices configured for the current user.
pub struct SimulatorDeviceHost {
    device_map: tokio::sync::Mutex<HashMap<String, Arc<SimulatorDevice>>>,
    // The set of configured devices does not change at runtime, so the
    // full listing is computed once.
    all_devices: Memoized<Vec<Arc<SimulatorDevice>>, DeviceError>,
}

impl Default for SimulatorDeviceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatorDeviceHost {
    pub fn new() -> Self {
        SimulatorDeviceHost {
            device_map: tokio::sync::Mutex::new(HashMap::new()),
            all_devices: Memoized::new(),
        }
    }

    /// The devices that are currently booted.
    pub async fn booted_devices(&self) -> Result<Vec<Arc<SimulatorDevice>>, DeviceError> {
        self.collect_devices(|record| record.state == "Booted").await
    }

    pub async fn shutdown_all_devices(&self) -> Result<(), DeviceError> {
        await_command(SimctlCommands::shutdown_all(), &[]).await?;
        Ok(())
    }

    /// Moves the crash logs of all devices on this host into `directory`,
    /// booted or not.
    pub async fn pull_crash_logs(&self, directory: &Path) -> Result<(), DeviceError> {
        let crash_dir = crash_log_dir()?;
        let entries = match std::fs::read_dir(&crash_dir) {
            Ok(entries) => entries,
            // The folder is only created by the first crash.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DeviceError::with_cause("", e)),
        };
        for entry in entries.filter_map(Result::ok) {
            let target = directory.join(entry.file_name());
            std::fs::rename(entry.path(), target).map_err(|e| DeviceError::with_cause("", e))?;
        }
        Ok(())
    }

    /// Deletes the crash logs of all devices on this host, booted or not.
    pub async fn clear_crash_logs(&self) -> Result<(), DeviceError> {
        let crash_dir = crash_log_dir()?;
        let entries = match std::fs::read_dir(&crash_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DeviceError::with_cause("", e)),
        };
        for entry in entries.filter_map(Result::ok) {
            std::fs::remove_file(entry.path()).map_err(|e| DeviceError::with_cause("", e))?;
        }
        Ok(())
    }

    /// The device currently holding the inspector port, if any.
    pub async fn device_on_inspector_port(
        &self,
    ) -> Result<Option<Arc<SimulatorDevice>>, DeviceError> {
        // Exit code 1 means nothing is listening on the port.
        let port_filter = format!(":{INSPECTOR_PORT}");
        let pid = await_command(
            ShellCommands::lsof(&["-ti", port_filter.as_str()]),
            &[0, 1],
        )
        .await?
        .stdout_utf8();
        let pid = pid.trim();
        if pid.is_empty() {
            return Ok(None);
        }
        let processes = await_command(ShellCommands::ps(&["-p", pid, "-o", "command"]), &[])
            .await?
            .stdout_utf8();
        for device in self.connected_devices().await? {
            if processes.contains(device.udid()) {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    async fn collect_devices(
        &self,
        keep: impl Fn(&DeviceRecord) -> bool,
    ) -> Result<Vec<Arc<SimulatorDevice>>, DeviceError> {
        let listing = await_command(SimctlCommands::list(), &[]).await?.stdout_utf8();
        let records = parse_device_list(&listing)?;

        let mut device_map = self.device_map.lock().await;
        let mut devices = Vec::new();
        for record in records.iter().filter(|r| keep(r)) {
            let device = match device_map.get(&record.udid) {
                Some(device) => Arc::clone(device),
                None => {
                    let version = runtime_version(&record.product_version)?;
                    let device = Arc::new(SimulatorDevice::new(&record.udid, version));
                    device_map.insert(record.udid.clone(), Arc::clone(&device));
                    device
                }
            };
            devices.push(device);
        }
        Ok(devices)
    }
}

impl IosDeviceHost for SimulatorDeviceHost {
    type Device = SimulatorDevice;

    async fn connected_devices(&self) -> Result<Vec<Arc<SimulatorDevice>>, DeviceError> {
        self.all_devices
            .get_or_init(|| self.collect_devices(|_| true))
            .await
    }
}

#[derive(Debug, PartialEq, Eq)]
struct DeviceRecord {
    udid: String,
    state: String,
    product_version: String,
}

#[derive(Deserialize)]
struct SimctlList {
    devices: std::collections::BTreeMap<String, Vec<SimctlListEntry>>,
}

#[derive(Deserialize)]
struct SimctlListEntry {
    udid: String,
    state: String,
}

/// Parses `simctl list --json devices` output, keeping iOS runtimes only.
fn parse_device_list(json: &str) -> Result<Vec<DeviceRecord>, DeviceError> {
    let listing: SimctlList =
        serde_json::from_str(json).map_err(|e| DeviceError::with_cause("", e))?;
    let mut records = Vec::new();
    for (runtime, entries) in listing.devices {
        let Some(product_version) = runtime.strip_prefix("iOS ") else {
            continue;
        };
        for entry in entries {
            records.push(DeviceRecord {
                udid: entry.udid,
                state: entry.state,
                product_version: product_version.to_string(),
            });
        }
    }
    Ok(records)
}

/// One version value is shared by every simulated device on a runtime.
fn runtime_version(product_version: &str) -> Result<IosVersion, DeviceError> {
    let system_version_file =
        runtime_root(product_version).join("System/Library/CoreServices/SystemVersion.plist");
    let value = plist::Value::from_file(&system_version_file)
        .map_err(|e| DeviceError::with_cause("", e))?;
    let build_version = value
        .as_dictionary()
        .and_then(|d| d.get("ProductBuildVersion"))
        .and_then(|v| v.as_string())
        .ok_or_else(|| {
            DeviceError::new(
                "",
                format!("no ProductBuildVersion in {}", system_version_file.display()),
            )
        })?;
    Ok(IosVersion::new(build_version, product_version))
}

/// Depending on how the runtime is installed, its root is either inside
/// the Xcode SDK or under the CoreSimulator profiles; the SDK wins when it
/// exists.
fn runtime_root(product_version: &str) -> PathBuf {
    let sdk_root = PathBuf::from(format!(
        "/Applications/Xcode.app/Contents/Developer/Platforms/iPhoneSimulator.platform\
         /Developer/SDKs/iPhoneSimulator{product_version}.sdk"
    ));
    if sdk_root.exists() {
        return sdk_root;
    }
    PathBuf::from(format!(
        "/Library/Developer/CoreSimulator/Profiles/Runtimes/iOS {product_version}\
         .simruntime/Contents/Resources/RuntimeRoot"
    ))
}

fn home_dir() -> Result<PathBuf, DeviceError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| DeviceError::new("", "HOME is not set"))
}

fn crash_log_dir() -> Result<PathBuf, DeviceError> {
    Ok(home_dir()?.join("Library/Logs/DiagnosticReports"))
}

fn simulator_data_dir(udid: &str) -> Result<PathBuf, DeviceError> {
    Ok(home_dir()?.join("Library/Developer/CoreSimulator/Devices").join(udid))
}

/// System applications shipped with a runtime.
fn system_apps(product_version: &str) -> Result<Vec<IosAppInfo>, DeviceError> {
    let cache = RUNTIME_SYSTEM_APPS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Some(apps) = cache.lock().unwrap().get(product_version) {
        return Ok(apps.clone());
    }

    let apps_dir = runtime_root(product_version).join("Applications");
    let mut apps = Vec::new();
    for entry in std::fs::read_dir(&apps_dir)
        .map_err(|e| DeviceError::with_cause("", e))?
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !path.join("Info.plist").exists() {
            continue;
        }
        apps.push(IosAppInfo::read_from_path(&path).map_err(|e| DeviceError::with_cause("", e))?);
    }

    cache
        .lock()
        .unwrap()
        .insert(product_version.to_string(), apps.clone());
    Ok(apps)
}

/// Replaces every non-word character with a hyphen; the DeviceTypes
/// directory names relate to device-type identifiers this way.
fn normalize_device_type_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Reduces "(2nd generation)" decorations to the bare ordinal, so
/// "iPad Pro (2nd generation)" reads "iPad Pro 2".
fn strip_generation(raw: &str) -> String {
    let mut search = 0;
    while let Some(open_offset) = raw[search..].find('(') {
        let open = search + open_offset;
        if let Some(close_offset) = raw[open..].find(')') {
            let close = open + close_offset;
            let inner = &raw[open + 1..close];
            if let Some(ordinal) = inner.strip_suffix(" generation") {
                let digits: String =
                    ordinal.chars().take_while(char::is_ascii_digit).collect();
                let suffix = &ordinal[digits.len()..];
                if !digits.is_empty()
                    && suffix.len() == 2
                    && suffix.chars().all(|c| c.is_ascii_alphabetic())
                {
                    let mut stripped =
                        format!("{}{}{}", &raw[..open], digits, &raw[close + 1..]);
                    stripped.truncate(stripped.trim_end().len());
                    return stripped;
                }
            }
            search = open + 1;
        } else {
            break;
        }
    }
    raw.to_string()
}

/// Model information for a device type, resolved from the CoreSimulator
/// device-type profile.
fn model_for_device_type(device_type: &str) -> Result<IosModel, DeviceError> {
    let cache = DEVICE_TYPE_MODELS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Some(model) = cache.lock().unwrap().get(device_type) {
        return Ok(model.clone());
    }

    let mut matches = Vec::new();
    for entry in std::fs::read_dir(DEVICE_TYPES_DIR)
        .map_err(|e| DeviceError::with_cause("", e))?
        .filter_map(Result::ok)
    {
        let path = entry.path();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if normalize_device_type_name(&stem) == device_type {
            matches.push((path, stem));
        }
    }
    let (device_type_path, raw_product_name) = match matches.as_slice() {
        [only] => only.clone(),
        _ => {
            return Err(DeviceError::new(
                "",
                format!("no unique device type directory for {device_type}"),
            ))
        }
    };
    let product_name = strip_generation(&raw_product_name);

    let profile = plist::Value::from_file(
        device_type_path.join("Contents/Resources/profile.plist"),
    )
    .map_err(|e| DeviceError::with_cause("", e))?;
    let profile = profile
        .as_dictionary()
        .ok_or_else(|| DeviceError::new("", "profile.plist is not a dictionary"))?;
    let identifier = profile
        .get("modelIdentifier")
        .and_then(|v| v.as_string())
        .ok_or_else(|| DeviceError::new("", "profile.plist has no modelIdentifier"))?;
    // The supported architectures are either just i386, or i386 plus
    // x86_64; prefer the wider one.
    let architecture = profile
        .get("supportedArchs")
        .and_then(|v| v.as_array())
        .map(|archs| {
            archs
                .iter()
                .filter_map(|a| a.as_string())
                .any(|a| a == Architecture::X86_64.as_str())
        })
        .unwrap_or(false);
    let architecture = if architecture {
        Architecture::X86_64
    } else {
        Architecture::I386
    };

    let model = IosModel::new(identifier, product_name, architecture);
    cache
        .lock()
        .unwrap()
        .insert(device_type.to_string(), model.clone());
    Ok(model)
}

async fn await_result(process: &CommandProcess) -> Result<CommandResult, DeviceError> {
    match process.wait().await {
        Ok(result) => Ok(result),
        Err(CommandError::Failed(failure)) => Ok(failure.result().clone()),
        Err(e) => Err(DeviceError::with_cause("", e)),
    }
}

/// Waits for a simctl process, checking the exit code against
/// `expected_exit_codes` (zero when empty).
async fn await_command(
    process: CommandProcess,
    expected_exit_codes: &[i32],
) -> Result<CommandResult, DeviceError> {
    let result = await_result(&process).await?;
    let expected: &[i32] = if expected_exit_codes.is_empty() {
        &[0]
    } else {
        expected_exit_codes
    };
    if !expected.contains(&result.exit_code()) {
        return Err(DeviceError::new(
            "",
            format!("unexpected exit code in result: {result}"),
        ));
    }
    Ok(result)
}

/// A simulated iOS device.
pub struct SimulatorDevice {
    udid: String,
    version: IosVersion,
    simctl: SimctlCommands,
    logger_started: Arc<AtomicBool>,
    device_type: Memoized<String, DeviceError>,
}

impl PartialEq for SimulatorDevice {
    fn eq(&self, other: &Self) -> bool {
        self.udid == other.udid
    }
}

impl Eq for SimulatorDevice {}

impl std::fmt::Debug for SimulatorDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatorDevice")
            .field("udid", &self.udid)
            .finish()
    }
}

impl SimulatorDevice {
    fn new(udid: &str, version: IosVersion) -> Self {
        SimulatorDevice {
            udid: udid.to_string(),
            version,
            simctl: SimctlCommands::new(udid),
            logger_started: Arc::new(AtomicBool::new(false)),
            device_type: Memoized::new(),
        }
    }

    fn error(&self, message: impl Into<String>) -> DeviceError {
        DeviceError::new(&self.udid, message)
    }

    fn error_cause(&self, cause: impl std::error::Error + Send + Sync + 'static) -> DeviceError {
        DeviceError::with_cause(&self.udid, cause)
    }

    /// Boots the device, waiting until it is responsive and able to
    /// produce a screenshot. Booting a booted device is a no-op.
    pub async fn startup(&self) -> Result<(), DeviceError> {
        // 163 is simctl for "already booted".
        await_command(self.simctl.boot(), &[0, 163]).await?;
        while !self.is_responsive().await || !self.is_screenshottable().await? {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Shuts the device down; shutting down a stopped device is a no-op.
    pub async fn shutdown(&self) -> Result<(), DeviceError> {
        // 163 is simctl for "already shut down".
        await_command(self.simctl.shutdown(), &[0, 163]).await?;
        Ok(())
    }

    /// Factory-resets the device, shutting it down first.
    pub async fn erase(&self) -> Result<(), DeviceError> {
        self.shutdown().await?;
        await_command(self.simctl.erase(), &[]).await?;
        Ok(())
    }

    /// For a short window after boot the device has no io registry yet and
    /// cannot take screenshots.
    async fn is_screenshottable(&self) -> Result<bool, DeviceError> {
        let result = await_command(self.simctl.enumerate(), &[]).await?;
        Ok(result.stdout_utf8().contains("IOSurface port"))
    }

    fn user_apps(&self) -> Result<Vec<IosAppInfo>, DeviceError> {
        let container_dir = simulator_data_dir(&self.udid)?.join("data/Containers/Bundle/Application");
        if !container_dir.exists() {
            return Ok(Vec::new());
        }
        let mut apps = Vec::new();
        for entry in std::fs::read_dir(&container_dir)
            .map_err(|e| self.error_cause(e))?
            .filter_map(Result::ok)
        {
            let mut bundles = std::fs::read_dir(entry.path())
                .map_err(|e| self.error_cause(e))?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "app").unwrap_or(false));
            let bundle = match (bundles.next(), bundles.next()) {
                (Some(bundle), None) => bundle,
                _ => {
                    return Err(self.error(format!(
                        "expected exactly one .app bundle under {}",
                        entry.path().display()
                    )))
                }
            };
            apps.push(IosAppInfo::read_from_path(&bundle).map_err(|e| self.error_cause(e))?);
        }
        Ok(apps)
    }
}

impl IosDevice for SimulatorDevice {
    type AppProcess = SimulatorAppProcess;

    fn udid(&self) -> &str {
        &self.udid
    }

    async fn is_responsive(&self) -> bool {
        let listing = match await_command(SimctlCommands::list(), &[]).await {
            Ok(result) => result.stdout_utf8(),
            Err(_) => return false,
        };
        match parse_device_list(&listing) {
            Ok(records) => records
                .iter()
                .any(|r| r.udid == self.udid && r.state == "Booted"),
            Err(_) => false,
        }
    }

    fn is_restarting(&self) -> bool {
        false
    }

    async fn model(&self) -> Result<IosModel, DeviceError> {
        let device_type = self
            .device_type
            .get_or_init(|| async move {
                let device_plist = simulator_data_dir(&self.udid)?.join("device.plist");
                let value = plist::Value::from_file(&device_plist)
                    .map_err(|e| self.error_cause(e))?;
                let device_type = value
                    .as_dictionary()
                    .and_then(|d| d.get("deviceType"))
                    .and_then(|v| v.as_string())
                    .ok_or_else(|| self.error("device.plist has no deviceType"))?;
                device_type
                    .strip_prefix(DEVICE_TYPE_PREFIX)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        self.error(format!("unexpected device type: {device_type}"))
                    })
            })
            .await?;
        model_for_device_type(&device_type)
    }

    async fn version(&self) -> Result<IosVersion, DeviceError> {
        Ok(self.version.clone())
    }

    async fn list_applications(&self) -> Result<Vec<IosAppInfo>, DeviceError> {
        let mut apps = system_apps(self.version.product_version())?;
        for app in self.user_apps()? {
            if !apps.contains(&app) {
                apps.push(app);
            }
        }
        Ok(apps)
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
        if ipa_or_app_path.is_dir() {
            await_command(
                self.simctl.install(&ipa_or_app_path.to_string_lossy()),
                &[],
            )
            .await?;
            return Ok(());
        }

        // An ipa is unzipped to a scratch directory and the contained app
        // bundle installed from there.
        let scratch = tempfile::tempdir().map_err(|e| self.error_cause(e))?;
        let file = std::fs::File::open(ipa_or_app_path).map_err(|e| self.error_cause(e))?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| self.error_cause(e))?;
        archive.extract(scratch.path()).map_err(|e| self.error_cause(e))?;

        let stem = ipa_or_app_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let app_path = scratch.path().join("Payload").join(format!("{stem}.app"));
        await_command(self.simctl.install(&app_path.to_string_lossy()), &[]).await?;
        Ok(())
    }

    async fn uninstall_application(&self, bundle_id: &IosAppBundleId) -> Result<(), DeviceError> {
        await_command(self.simctl.uninstall(bundle_id.as_str()), &[]).await?;
        Ok(())
    }

    async fn run_application(
        &self,
        bundle_id: &IosAppBundleId,
        args: &[&str],
    ) -> Result<SimulatorAppProcess, DeviceError> {
        Ok(SimulatorAppProcess {
            udid: self.udid.clone(),
            process: self.simctl.launch(bundle_id.as_str(), args),
        })
    }

    async fn start_system_logger(&self, log_path: &Path) -> Result<SystemLogger, DeviceError> {
        let already = self.logger_started.swap(true, Ordering::SeqCst);
        assert!(!already, "system logger has already been started");
        Ok(SystemLogger::new(
            &self.udid,
            self.simctl.syslog(log_path),
            Arc::clone(&self.logger_started),
        ))
    }

    async fn pull_crash_logs(&self, _directory: &Path) -> Result<(), DeviceError> {
        // Crash logs are per-host on simulators.
        unimplemented!("use SimulatorDeviceHost::pull_crash_logs");
    }

    async fn clear_crash_logs(&self) -> Result<(), DeviceError> {
        unimplemented!("use SimulatorDeviceHost::clear_crash_logs");
    }

    async fn restart(&self) -> Result<(), DeviceError> {
        // Shutdown exits gracefully when the device is not running.
        self.shutdown().await?;
        self.startup().await
    }

    async fn take_screenshot(&self) -> Result<Vec<u8>, DeviceError> {
        let scratch = tempfile::tempdir().map_err(|e| self.error_cause(e))?;
        let screenshot_path = scratch.path().join("screenshot.png");
        await_command(self.simctl.screenshot(&screenshot_path), &[]).await?;
        std::fs::read(&screenshot_path).map_err(|e| self.error_cause(e))
    }

    async fn open_web_inspector_socket(&self) -> Result<InspectorSocket, DeviceError> {
        InspectorSocket::open_to_simulator()
            .await
            .map_err(|e| self.error_cause(e))
    }
}

/// A running app, backed by a `simctl launch --console` process.
///
/// `simctl launch --console` emits the hosted app's stdout on its own
/// stderr, so the app's "output" here is the command's stderr.
pub struct SimulatorAppProcess {
    udid: String,
    process: CommandProcess,
}

impl IosAppProcess for SimulatorAppProcess {
    fn kill(&self) {
        self.process.kill();
    }

    async fn wait(&self) -> Result<String, DeviceError> {
        match self.process.wait().await {
            Ok(result) => Ok(result.stderr_utf8()),
            Err(e) => Err(DeviceError::with_cause(&self.udid, e)),
        }
    }

    async fn wait_with_timeout(&self, timeout: Duration) -> Result<String, DeviceError> {
        match self.process.wait_with_timeout(timeout).await {
            Ok(result) => Ok(result.stderr_utf8()),
            Err(e) => Err(DeviceError::with_cause(&self.udid, e)),
        }
    }

    fn output_reader(&self) -> crate::command::CaptureReader {
        self.process.stderr_reader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_parsing_keeps_ios_runtimes_only() {
        let json = r#"{
            "devices": {
                "iOS 12.1": [
                    {"state": "Shutdown", "availability": "(available)",
                     "name": "iPhone 5s",
                     "udid": "05E08937-A141-4D53-8B4F-3A90A1B6CFFF"},
                    {"state": "Booted", "availability": "(available)",
                     "name": "iPhone 6",
                     "udid": "B3BF8CA9-8E17-4DE7-BEA4-4F1B97BBF81F"}
                ],
                "tvOS 12.1": [
                    {"state": "Shutdown", "availability": "(available)",
                     "name": "Apple TV",
                     "udid": "2AA92E3F-52FE-4E6A-9E42-BEFF7D4817A5"}
                ],
                "watchOS 5.1": []
            }
        }"#;
        let records = parse_device_list(json).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.product_version == "12.1"));
        assert_eq!(
            records.iter().filter(|r| r.state == "Booted").count(),
            1
        );
    }

    #[test]
    fn malformed_device_list_is_an_error() {
        assert!(parse_device_list("not json").is_err());
    }

    #[test]
    fn device_type_names_normalize_to_identifiers() {
        assert_eq!(
            normalize_device_type_name("iPad Pro (12.9-inch) (2nd generation)"),
            "iPad-Pro--12-9-inch---2nd-generation-"
        );
        assert_eq!(normalize_device_type_name("iPhone 7"), "iPhone-7");
        assert_eq!(normalize_device_type_name("iPhone_7"), "iPhone_7");
    }

    #[test]
    fn generation_decorations_reduce_to_ordinals() {
        assert_eq!(strip_generation("iPad Pro (2nd generation)"), "iPad Pro 2");
        assert_eq!(
            strip_generation("iPad Pro (12.9-inch) (2nd generation)"),
            "iPad Pro (12.9-inch) 2"
        );
        assert_eq!(strip_generation("iPhone 7"), "iPhone 7");
    }

    #[tokio::test]
    async fn app_output_is_the_console_stderr() {
        let process = crate::command::Command::new("/bin/sh")
            .with_args(["-c", "echo ignored; echo 'WiFi: ok' 1>&2"])
            .start()
            .unwrap();
        let app = SimulatorAppProcess {
            udid: "B3BF8CA9-8E17-4DE7-BEA4-4F1B97BBF81F".to_string(),
            process,
        };
        let output = app.wait().await.unwrap();
        assert!(output.contains("WiFi"));
        assert!(!output.contains("ignored"));
    }

    #[test]
    fn devices_compare_by_udid() {
        let version = IosVersion::new("16B91", "12.1");
        let first = SimulatorDevice::new("05E08937-A141-4D53-8B4F-3A90A1B6CFFF", version.clone());
        let same = SimulatorDevice::new("05E08937-A141-4D53-8B4F-3A90A1B6CFFF", version.clone());
        let other = SimulatorDevice::new("B3BF8CA9-8E17-4DE7-BEA4-4F1B97BBF81F", version);
        assert_eq!(first, same);
        assert_ne!(first, other);
    }
}
