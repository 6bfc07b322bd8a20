//! Value types describing devices and applications.

use std::fmt;
use std::io::{Cursor, Read};
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

/// CPU architecture of an iOS device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    Arm64,
    Armv7,
    Armv7f,
    Armv7k,
    Armv7s,
    I386,
    X86_64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Arm64 => "arm64",
            Architecture::Armv7 => "armv7",
            Architecture::Armv7f => "armv7f",
            Architecture::Armv7k => "armv7k",
            Architecture::Armv7s => "armv7s",
            Architecture::I386 => "i386",
            Architecture::X86_64 => "x86_64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unrecognized architecture: {0}")]
pub struct ParseArchitectureError(String);

impl FromStr for Architecture {
    type Err = ParseArchitectureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "arm64" => Architecture::Arm64,
            "armv7" => Architecture::Armv7,
            "armv7f" => Architecture::Armv7f,
            "armv7k" => Architecture::Armv7k,
            "armv7s" => Architecture::Armv7s,
            "i386" => Architecture::I386,
            "x86_64" => Architecture::X86_64,
            other => return Err(ParseArchitectureError(other.to_string())),
        })
    }
}

/// The class of device, derived from the first word of the product name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    IPad,
    IPhone,
    IPod,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::IPad => "iPad",
            DeviceClass::IPhone => "iPhone",
            DeviceClass::IPod => "iPod",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unrecognized device class: {0}")]
pub struct ParseDeviceClassError(String);

impl FromStr for DeviceClass {
    type Err = ParseDeviceClassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "iPad" => DeviceClass::IPad,
            "iPhone" => DeviceClass::IPhone,
            "iPod" => DeviceClass::IPod,
            other => return Err(ParseDeviceClassError(other.to_string())),
        })
    }
}

/// Model information of an iOS device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IosModel {
    identifier: String,
    product_name: String,
    architecture: Architecture,
}

impl IosModel {
    pub fn new(
        identifier: impl Into<String>,
        product_name: impl Into<String>,
        architecture: Architecture,
    ) -> Self {
        IosModel {
            identifier: identifier.into(),
            product_name: product_name.into(),
            architecture,
        }
    }

    /// Model identifier, e.g. "iPhone5,1".
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Product string of this model, e.g. "iPhone 5".
    pub fn product_name(&self) -> &str {
        &self.product_name
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Device class of this model, e.g. iPad for "iPad Pro (9.7-inch)".
    pub fn device_class(&self) -> Result<DeviceClass, ParseDeviceClassError> {
        let first_word = self
            .product_name
            .split_whitespace()
            .next()
            .unwrap_or_default();
        first_word.parse()
    }
}

/// Maps a model identifier to its marketed product name. There is no
/// deterministic derivation; the mapping is enumerated.
pub fn product_name_for_identifier(identifier: &str) -> Option<&'static str> {
    Some(match identifier {
        "iPad1,1" => "iPad",
        "iPad2,1" | "iPad2,2" | "iPad2,3" | "iPad2,4" => "iPad 2",
        "iPad3,1" | "iPad3,2" | "iPad3,3" => "iPad 3",
        "iPad3,4" | "iPad3,5" | "iPad3,6" => "iPad 4",
        "iPad6,11" | "iPad6,12" => "iPad 5",
        "iPad4,1" | "iPad4,2" | "iPad4,3" => "iPad Air",
        "iPad5,3" | "iPad5,4" => "iPad Air 2",
        "iPad2,5" | "iPad2,6" | "iPad2,7" => "iPad mini",
        "iPad4,4" | "iPad4,5" | "iPad4,6" => "iPad mini 2",
        "iPad4,7" | "iPad4,8" | "iPad4,9" => "iPad mini 3",
        "iPad5,1" | "iPad5,2" => "iPad mini 4",
        "iPad6,3" | "iPad6,4" => "iPad Pro (9.7-inch)",
        "iPad7,3" | "iPad7,4" => "iPad Pro (10.5-inch)",
        "iPad6,7" | "iPad6,8" => "iPad Pro (12.9-inch)",
        "iPad7,1" | "iPad7,2" => "iPad Pro (12.9-inch) 2",
        "iPhone1,1" => "iPhone",
        "iPhone1,2" => "iPhone 3G",
        "iPhone2,1" => "iPhone 3GS",
        "iPhone3,1" | "iPhone3,2" | "iPhone3,3" => "iPhone 4",
        "iPhone4,1" => "iPhone 4S",
        "iPhone5,1" | "iPhone5,2" => "iPhone 5",
        "iPhone5,3" | "iPhone5,4" => "iPhone 5c",
        "iPhone6,1" | "iPhone6,2" => "iPhone 5s",
        "iPhone7,2" => "iPhone 6",
        "iPhone7,1" => "iPhone 6 Plus",
        "iPhone8,1" => "iPhone 6s",
        "iPhone8,2" => "iPhone 6s Plus",
        "iPhone8,4" => "iPhone SE",
        "iPhone9,1" | "iPhone9,3" => "iPhone 7",
        "iPhone9,2" | "iPhone9,4" => "iPhone 7 Plus",
        _ => return None,
    })
}

/// Version information of an iOS device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IosVersion {
    build_version: String,
    product_version: String,
}

impl IosVersion {
    pub fn new(build_version: impl Into<String>, product_version: impl Into<String>) -> Self {
        IosVersion {
            build_version: build_version.into(),
            product_version: product_version.into(),
        }
    }

    /// Build version, e.g. "12H321".
    pub fn build_version(&self) -> &str {
        &self.build_version
    }

    /// Product version, e.g. "8.4.1".
    pub fn product_version(&self) -> &str {
        &self.product_version
    }

    /// The integer prefix of the product version, e.g. 8 for "8.4.1".
    pub fn major_version(&self) -> u32 {
        let digits: String = self
            .product_version
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().unwrap_or(0)
    }
}

/// An iOS application bundle identifier; normally a reverse DNS string,
/// e.g. com.apple.mobilesafari.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IosAppBundleId(String);

#[derive(Error, Debug)]
#[error("not a valid bundle identifier: {0:?}")]
pub struct InvalidBundleId(String);

impl IosAppBundleId {
    /// Validates that the string is a printable Apple Uniform Type
    /// Identifier: only alphanumeric, hyphen and period characters.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidBundleId> {
        let s = s.into();
        let valid = !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if valid {
            Ok(IosAppBundleId(s))
        } else {
            Err(InvalidBundleId(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IosAppBundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IosAppBundleId {
    type Err = InvalidBundleId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IosAppBundleId::new(s)
    }
}

#[derive(Error, Debug)]
pub enum AppInfoError {
    #[error("io error reading application info")]
    Io(#[from] std::io::Error),
    #[error("malformed Info.plist")]
    Plist(#[from] plist::Error),
    #[error("malformed ipa archive")]
    Zip(#[from] zip::result::ZipError),
    #[error("expected exactly one .app bundle under Payload/")]
    PayloadLayout,
    #[error("Info.plist has no CFBundleIdentifier string")]
    MissingBundleId,
    #[error(transparent)]
    InvalidBundleId(#[from] InvalidBundleId),
}

/// Information about an iOS application.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IosAppInfo {
    bundle_id: IosAppBundleId,
}

impl IosAppInfo {
    pub fn new(bundle_id: IosAppBundleId) -> Self {
        IosAppInfo { bundle_id }
    }

    /// The bundle identifier of the application.
    pub fn bundle_id(&self) -> &IosAppBundleId {
        &self.bundle_id
    }

    /// Reads application info from either an `.app` directory or an `.ipa`
    /// archive.
    pub fn read_from_path(ipa_or_app_path: &Path) -> Result<Self, AppInfoError> {
        let plist = if ipa_or_app_path.is_dir() {
            plist::Value::from_file(ipa_or_app_path.join("Info.plist"))?
        } else {
            read_info_plist_from_ipa(ipa_or_app_path)?
        };
        Self::read_from_plist(&plist)
    }

    /// Reads application info from a parsed `Info.plist` dictionary.
    pub fn read_from_plist(plist: &plist::Value) -> Result<Self, AppInfoError> {
        let bundle_id = plist
            .as_dictionary()
            .and_then(|dict| dict.get("CFBundleIdentifier"))
            .and_then(|value| value.as_string())
            .ok_or(AppInfoError::MissingBundleId)?;
        Ok(IosAppInfo {
            bundle_id: IosAppBundleId::new(bundle_id)?,
        })
    }
}

/// The bundle identifier inside an `.ipa` archive, read from
/// `Payload/*.app/Info.plist`.
pub fn bundle_id_from_ipa(ipa_path: &Path) -> Result<IosAppBundleId, AppInfoError> {
    Ok(IosAppInfo::read_from_path(ipa_path)?.bundle_id.clone())
}

fn read_info_plist_from_ipa(ipa_path: &Path) -> Result<plist::Value, AppInfoError> {
    let file = std::fs::File::open(ipa_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    // Find the unique Payload/<name>.app/ bundle prefix. Not every archive
    // carries explicit directory entries, so derive prefixes from file
    // names.
    let mut app_prefix: Option<String> = None;
    for name in archive.file_names() {
        let Some(rest) = name.strip_prefix("Payload/") else {
            continue;
        };
        let Some(end) = rest.find(".app/") else {
            continue;
        };
        let prefix = format!("Payload/{}.app/", &rest[..end]);
        match &app_prefix {
            Some(existing) if *existing != prefix => return Err(AppInfoError::PayloadLayout),
            Some(_) => {}
            None => app_prefix = Some(prefix),
        }
    }
    let app_prefix = app_prefix.ok_or(AppInfoError::PayloadLayout)?;

    let mut entry = archive.by_name(&format!("{app_prefix}Info.plist"))?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(plist::Value::from_reader(Cursor::new(bytes))?)
}
