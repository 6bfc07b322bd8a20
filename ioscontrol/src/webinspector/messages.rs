//! Typed model of the Web Inspector protocol messages.
//!
//! Wire form: a plist dictionary `{"__selector": <selector string>,
//! "__argument": <field dictionary>}`. Each selector admits a fixed set of
//! WIR-prefixed argument keys; an argument key outside its selector's set
//! is a decode error. Key and selector strings are listed in WebKit's
//! `RemoteInspectorConstants.h`.

use std::fmt;

use thiserror::Error;

const SELECTOR_KEY: &str = "__selector";
const ARGUMENT_KEY: &str = "__argument";

/// The type of a Web Inspector protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageSelector {
    ApplicationConnected,
    ApplicationDisconnected,
    ApplicationSentData,
    ApplicationSentListing,
    ApplicationUpdated,
    ForwardGetListing,
    ForwardSocketData,
    ForwardSocketSetup,
    ReportConnectedApplicationList,
    ReportConnectedDriverList,
    ReportIdentifier,
    ReportSetup,
}

impl MessageSelector {
    pub const ALL: [MessageSelector; 12] = [
        MessageSelector::ApplicationConnected,
        MessageSelector::ApplicationDisconnected,
        MessageSelector::ApplicationSentData,
        MessageSelector::ApplicationSentListing,
        MessageSelector::ApplicationUpdated,
        MessageSelector::ForwardGetListing,
        MessageSelector::ForwardSocketData,
        MessageSelector::ForwardSocketSetup,
        MessageSelector::ReportConnectedApplicationList,
        MessageSelector::ReportConnectedDriverList,
        MessageSelector::ReportIdentifier,
        MessageSelector::ReportSetup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSelector::ApplicationConnected => "_rpc_applicationConnected:",
            MessageSelector::ApplicationDisconnected => "_rpc_applicationDisconnected:",
            MessageSelector::ApplicationSentData => "_rpc_applicationSentData:",
            MessageSelector::ApplicationSentListing => "_rpc_applicationSentListing:",
            MessageSelector::ApplicationUpdated => "_rpc_applicationUpdated:",
            MessageSelector::ForwardGetListing => "_rpc_forwardGetListing:",
            MessageSelector::ForwardSocketData => "_rpc_forwardSocketData:",
            MessageSelector::ForwardSocketSetup => "_rpc_forwardSocketSetup:",
            MessageSelector::ReportConnectedApplicationList => {
                "_rpc_reportConnectedApplicationList:"
            }
            MessageSelector::ReportConnectedDriverList => "_rpc_reportConnectedDriverList:",
            MessageSelector::ReportIdentifier => "_rpc_reportIdentifier:",
            MessageSelector::ReportSetup => "_rpc_reportSetup:",
        }
    }

    pub fn for_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|sel| sel.as_str() == s)
    }
}

impl fmt::Display for MessageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key in a Web Inspector protocol message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKey {
    ApplicationBundleIdentifier,
    ApplicationDictionary,
    ApplicationIdentifier,
    ApplicationName,
    AutomaticallyPause,
    ConnectionIdentifier,
    Destination,
    DriverDictionary,
    HostApplicationIdentifier,
    IsApplicationActive,
    IsApplicationProxy,
    IsApplicationReady,
    Listing,
    MessageData,
    PageIdentifier,
    RemoteAutomationEnabled,
    Sender,
    SimulatorBuild,
    SimulatorName,
    SimulatorProductVersion,
    SocketData,
    Title,
    Type,
    Url,
}

impl MessageKey {
    pub const ALL: [MessageKey; 24] = [
        MessageKey::ApplicationBundleIdentifier,
        MessageKey::ApplicationDictionary,
        MessageKey::ApplicationIdentifier,
        MessageKey::ApplicationName,
        MessageKey::AutomaticallyPause,
        MessageKey::ConnectionIdentifier,
        MessageKey::Destination,
        MessageKey::DriverDictionary,
        MessageKey::HostApplicationIdentifier,
        MessageKey::IsApplicationActive,
        MessageKey::IsApplicationProxy,
        MessageKey::IsApplicationReady,
        MessageKey::Listing,
        MessageKey::MessageData,
        MessageKey::PageIdentifier,
        MessageKey::RemoteAutomationEnabled,
        MessageKey::Sender,
        MessageKey::SimulatorBuild,
        MessageKey::SimulatorName,
        MessageKey::SimulatorProductVersion,
        MessageKey::SocketData,
        MessageKey::Title,
        MessageKey::Type,
        MessageKey::Url,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKey::ApplicationBundleIdentifier => "WIRApplicationBundleIdentifierKey",
            MessageKey::ApplicationDictionary => "WIRApplicationDictionaryKey",
            MessageKey::ApplicationIdentifier => "WIRApplicationIdentifierKey",
            MessageKey::ApplicationName => "WIRApplicationNameKey",
            // No "Key" suffix on the wire.
            MessageKey::AutomaticallyPause => "WIRAutomaticallyPause",
            MessageKey::ConnectionIdentifier => "WIRConnectionIdentifierKey",
            MessageKey::Destination => "WIRDestinationKey",
            MessageKey::DriverDictionary => "WIRDriverDictionaryKey",
            MessageKey::HostApplicationIdentifier => "WIRHostApplicationIdentifierKey",
            MessageKey::IsApplicationActive => "WIRIsApplicationActiveKey",
            MessageKey::IsApplicationProxy => "WIRIsApplicationProxyKey",
            MessageKey::IsApplicationReady => "WIRIsApplicationReadyKey",
            MessageKey::Listing => "WIRListingKey",
            MessageKey::MessageData => "WIRMessageDataKey",
            MessageKey::PageIdentifier => "WIRPageIdentifierKey",
            MessageKey::RemoteAutomationEnabled => "WIRRemoteAutomationEnabledKey",
            MessageKey::Sender => "WIRSenderKey",
            MessageKey::SimulatorBuild => "WIRSimulatorBuildKey",
            MessageKey::SimulatorName => "WIRSimulatorNameKey",
            MessageKey::SimulatorProductVersion => "WIRSimulatorProductVersionKey",
            MessageKey::SocketData => "WIRSocketDataKey",
            MessageKey::Title => "WIRTitleKey",
            MessageKey::Type => "WIRTypeKey",
            // All-caps URL, unlike the UpperCamel of the other keys.
            MessageKey::Url => "WIRURLKey",
        }
    }

    pub fn for_string(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == s)
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message has no __selector/__argument envelope")]
    MalformedEnvelope,
    #[error("unknown selector {0:?}")]
    UnknownSelector(String),
    #[error("unknown message key {0:?}")]
    UnknownKey(String),
    #[error("key {key} is not valid for {selector}")]
    UnexpectedKey {
        selector: MessageSelector,
        key: MessageKey,
    },
    #[error("{selector} is missing key {key}")]
    MissingKey {
        selector: MessageSelector,
        key: MessageKey,
    },
    #[error("key {0} has a value of the wrong type")]
    WrongType(MessageKey),
    #[error("key {0} holds malformed JSON")]
    MalformedJson(MessageKey, #[source] serde_json::Error),
}

/// An application entry, as carried by the applicationConnected family and
/// the connected-application listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectorApplication {
    pub application_bundle_id: String,
    pub application_id: String,
    pub application_name: String,
    pub host_application_id: Option<String>,
    pub is_application_active: bool,
    pub is_application_proxy: bool,
    pub is_application_ready: Option<bool>,
    pub remote_automation_enabled: Option<bool>,
}

/// One inspectable page in a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectorPage {
    pub connection_id: Option<String>,
    pub page_id: u32,
    pub title: String,
    pub page_type: String,
    pub url: String,
}

/// A driver entry. Safari reports connected-driver lists, but so far they
/// only ever contain empty dictionaries; this is a placeholder shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectorDriver {
    pub driver_id: String,
}

/// A message sent to or from the Web Inspector in the WebKit remote debug
/// protocol, one variant per selector.
#[derive(Clone, Debug, PartialEq)]
pub enum InspectorMessage {
    ApplicationConnected(InspectorApplication),
    ApplicationDisconnected(InspectorApplication),
    ApplicationSentData {
        application_id: String,
        destination: String,
        message_data: serde_json::Value,
    },
    ApplicationSentListing {
        application_id: String,
        listing: Vec<InspectorPage>,
    },
    ApplicationUpdated(InspectorApplication),
    ForwardGetListing {
        application_id: String,
        connection_id: String,
    },
    ForwardSocketData {
        application_id: String,
        connection_id: String,
        page_id: u32,
        sender: String,
        socket_data: serde_json::Value,
    },
    ForwardSocketSetup {
        application_id: String,
        automatically_pause: bool,
        connection_id: String,
        page_id: u32,
        sender: String,
    },
    ReportConnectedApplicationList {
        application_dictionary: Vec<InspectorApplication>,
    },
    ReportConnectedDriverList {
        driver_dictionary: Vec<InspectorDriver>,
    },
    ReportIdentifier {
        connection_id: String,
    },
    ReportSetup {
        simulator_build: Option<String>,
        simulator_name: Option<String>,
        simulator_product_version: Option<String>,
    },
}

impl InspectorMessage {
    pub fn selector(&self) -> MessageSelector {
        match self {
            InspectorMessage::ApplicationConnected(_) => MessageSelector::ApplicationConnected,
            InspectorMessage::ApplicationDisconnected(_) => {
                MessageSelector::ApplicationDisconnected
            }
            InspectorMessage::ApplicationSentData { .. } => MessageSelector::ApplicationSentData,
            InspectorMessage::ApplicationSentListing { .. } => {
                MessageSelector::ApplicationSentListing
            }
            InspectorMessage::ApplicationUpdated(_) => MessageSelector::ApplicationUpdated,
            InspectorMessage::ForwardGetListing { .. } => MessageSelector::ForwardGetListing,
            InspectorMessage::ForwardSocketData { .. } => MessageSelector::ForwardSocketData,
            InspectorMessage::ForwardSocketSetup { .. } => MessageSelector::ForwardSocketSetup,
            InspectorMessage::ReportConnectedApplicationList { .. } => {
                MessageSelector::ReportConnectedApplicationList
            }
            InspectorMessage::ReportConnectedDriverList { .. } => {
                MessageSelector::ReportConnectedDriverList
            }
            InspectorMessage::ReportIdentifier { .. } => MessageSelector::ReportIdentifier,
            InspectorMessage::ReportSetup { .. } => MessageSelector::ReportSetup,
        }
    }

    /// Converts this message to its wire dictionary.
    pub fn to_plist(&self) -> plist::Dictionary {
        let mut argument = plist::Dictionary::new();
        match self {
            InspectorMessage::ApplicationConnected(app)
            | InspectorMessage::ApplicationDisconnected(app)
            | InspectorMessage::ApplicationUpdated(app) => {
                encode_application(&mut argument, app);
            }
            InspectorMessage::ApplicationSentData {
                application_id,
                destination,
                message_data,
            } => {
                put_string(&mut argument, MessageKey::ApplicationIdentifier, application_id);
                put_string(&mut argument, MessageKey::Destination, destination);
                put_json(&mut argument, MessageKey::MessageData, message_data);
            }
            InspectorMessage::ApplicationSentListing {
                application_id,
                listing,
            } => {
                put_string(&mut argument, MessageKey::ApplicationIdentifier, application_id);
                let mut pages = plist::Dictionary::new();
                for page in listing {
                    pages.insert(page.page_id.to_string(), encode_page(page));
                }
                argument.insert(
                    MessageKey::Listing.as_str().to_string(),
                    plist::Value::Dictionary(pages),
                );
            }
            InspectorMessage::ForwardGetListing {
                application_id,
                connection_id,
            } => {
                put_string(&mut argument, MessageKey::ApplicationIdentifier, application_id);
                put_string(&mut argument, MessageKey::ConnectionIdentifier, connection_id);
            }
            InspectorMessage::ForwardSocketData {
                application_id,
                connection_id,
                page_id,
                sender,
                socket_data,
            } => {
                put_string(&mut argument, MessageKey::ApplicationIdentifier, application_id);
                put_string(&mut argument, MessageKey::ConnectionIdentifier, connection_id);
                put_integer(&mut argument, MessageKey::PageIdentifier, *page_id);
                put_string(&mut argument, MessageKey::Sender, sender);
                put_json(&mut argument, MessageKey::SocketData, socket_data);
            }
            InspectorMessage::ForwardSocketSetup {
                application_id,
                automatically_pause,
                connection_id,
                page_id,
                sender,
            } => {
                put_string(&mut argument, MessageKey::ApplicationIdentifier, application_id);
                put_bool(&mut argument, MessageKey::AutomaticallyPause, *automatically_pause);
                put_string(&mut argument, MessageKey::ConnectionIdentifier, connection_id);
                put_integer(&mut argument, MessageKey::PageIdentifier, *page_id);
                put_string(&mut argument, MessageKey::Sender, sender);
            }
            InspectorMessage::ReportConnectedApplicationList {
                application_dictionary,
            } => {
                let mut apps = plist::Dictionary::new();
                for app in application_dictionary {
                    let mut dict = plist::Dictionary::new();
                    encode_application(&mut dict, app);
                    apps.insert(app.application_id.clone(), plist::Value::Dictionary(dict));
                }
                argument.insert(
                    MessageKey::ApplicationDictionary.as_str().to_string(),
                    plist::Value::Dictionary(apps),
                );
            }
            InspectorMessage::ReportConnectedDriverList { driver_dictionary } => {
                // Safari's driver entries have so far always been empty
                // dictionaries keyed by driver id; mirror that.
                let mut drivers = plist::Dictionary::new();
                for driver in driver_dictionary {
                    drivers.insert(
                        driver.driver_id.clone(),
                        plist::Value::Dictionary(plist::Dictionary::new()),
                    );
                }
                argument.insert(
                    MessageKey::DriverDictionary.as_str().to_string(),
                    plist::Value::Dictionary(drivers),
                );
            }
            InspectorMessage::ReportIdentifier { connection_id } => {
                put_string(&mut argument, MessageKey::ConnectionIdentifier, connection_id);
            }
            InspectorMessage::ReportSetup {
                simulator_build,
                simulator_name,
                simulator_product_version,
            } => {
                if let Some(build) = simulator_build {
                    put_string(&mut argument, MessageKey::SimulatorBuild, build);
                }
                if let Some(name) = simulator_name {
                    put_string(&mut argument, MessageKey::SimulatorName, name);
                }
                if let Some(version) = simulator_product_version {
                    put_string(&mut argument, MessageKey::SimulatorProductVersion, version);
                }
            }
        }

        let mut plist = plist::Dictionary::new();
        plist.insert(
            SELECTOR_KEY.to_string(),
            plist::Value::String(self.selector().as_str().to_string()),
        );
        plist.insert(ARGUMENT_KEY.to_string(), plist::Value::Dictionary(argument));
        plist
    }

    /// Reconstructs a typed message from its wire dictionary.
    pub fn from_plist(plist: &plist::Dictionary) -> Result<Self, MessageError> {
        let selector_string = plist
            .get(SELECTOR_KEY)
            .and_then(|v| v.as_string())
            .ok_or(MessageError::MalformedEnvelope)?;
        let argument = plist
            .get(ARGUMENT_KEY)
            .and_then(|v| v.as_dictionary())
            .ok_or(MessageError::MalformedEnvelope)?;
        let selector = MessageSelector::for_string(selector_string)
            .ok_or_else(|| MessageError::UnknownSelector(selector_string.to_string()))?;

        let args = Args {
            selector,
            dict: argument,
        };
        Ok(match selector {
            MessageSelector::ApplicationConnected => {
                InspectorMessage::ApplicationConnected(decode_application(&args, true)?)
            }
            MessageSelector::ApplicationDisconnected => {
                InspectorMessage::ApplicationDisconnected(decode_application(&args, true)?)
            }
            MessageSelector::ApplicationUpdated => {
                InspectorMessage::ApplicationUpdated(decode_application(&args, true)?)
            }
            MessageSelector::ApplicationSentData => {
                args.check_keys(&[
                    MessageKey::ApplicationIdentifier,
                    MessageKey::Destination,
                    MessageKey::MessageData,
                ])?;
                InspectorMessage::ApplicationSentData {
                    application_id: args.string(MessageKey::ApplicationIdentifier)?,
                    destination: args.string(MessageKey::Destination)?,
                    message_data: args.json(MessageKey::MessageData)?,
                }
            }
            MessageSelector::ApplicationSentListing => {
                args.check_keys(&[MessageKey::ApplicationIdentifier, MessageKey::Listing])?;
                InspectorMessage::ApplicationSentListing {
                    application_id: args.string(MessageKey::ApplicationIdentifier)?,
                    listing: args.pages(MessageKey::Listing)?,
                }
            }
            MessageSelector::ForwardGetListing => {
                args.check_keys(&[
                    MessageKey::ApplicationIdentifier,
                    MessageKey::ConnectionIdentifier,
                ])?;
                InspectorMessage::ForwardGetListing {
                    application_id: args.string(MessageKey::ApplicationIdentifier)?,
                    connection_id: args.string(MessageKey::ConnectionIdentifier)?,
                }
            }
            MessageSelector::ForwardSocketData => {
                args.check_keys(&[
                    MessageKey::ApplicationIdentifier,
                    MessageKey::ConnectionIdentifier,
                    MessageKey::PageIdentifier,
                    MessageKey::Sender,
                    MessageKey::SocketData,
                ])?;
                InspectorMessage::ForwardSocketData {
                    application_id: args.string(MessageKey::ApplicationIdentifier)?,
                    connection_id: args.string(MessageKey::ConnectionIdentifier)?,
                    page_id: args.integer(MessageKey::PageIdentifier)?,
                    sender: args.string(MessageKey::Sender)?,
                    socket_data: args.json(MessageKey::SocketData)?,
                }
            }
            MessageSelector::ForwardSocketSetup => {
                args.check_keys(&[
                    MessageKey::ApplicationIdentifier,
                    MessageKey::AutomaticallyPause,
                    MessageKey::ConnectionIdentifier,
                    MessageKey::PageIdentifier,
                    MessageKey::Sender,
                ])?;
                InspectorMessage::ForwardSocketSetup {
                    application_id: args.string(MessageKey::ApplicationIdentifier)?,
                    automatically_pause: args.boolean(MessageKey::AutomaticallyPause)?,
                    connection_id: args.string(MessageKey::ConnectionIdentifier)?,
                    page_id: args.integer(MessageKey::PageIdentifier)?,
                    sender: args.string(MessageKey::Sender)?,
                }
            }
            MessageSelector::ReportConnectedApplicationList => {
                args.check_keys(&[MessageKey::ApplicationDictionary])?;
                InspectorMessage::ReportConnectedApplicationList {
                    application_dictionary: args.applications(MessageKey::ApplicationDictionary)?,
                }
            }
            MessageSelector::ReportConnectedDriverList => {
                args.check_keys(&[MessageKey::DriverDictionary])?;
                InspectorMessage::ReportConnectedDriverList {
                    driver_dictionary: args.drivers(MessageKey::DriverDictionary)?,
                }
            }
            MessageSelector::ReportIdentifier => {
                args.check_keys(&[MessageKey::ConnectionIdentifier])?;
                InspectorMessage::ReportIdentifier {
                    connection_id: args.string(MessageKey::ConnectionIdentifier)?,
                }
            }
            MessageSelector::ReportSetup => {
                args.check_keys(&[
                    MessageKey::SimulatorBuild,
                    MessageKey::SimulatorName,
                    MessageKey::SimulatorProductVersion,
                ])?;
                InspectorMessage::ReportSetup {
                    simulator_build: args.opt_string(MessageKey::SimulatorBuild)?,
                    simulator_name: args.opt_string(MessageKey::SimulatorName)?,
                    simulator_product_version: args
                        .opt_string(MessageKey::SimulatorProductVersion)?,
                }
            }
        })
    }
}

fn put_string(dict: &mut plist::Dictionary, key: MessageKey, value: &str) {
    dict.insert(key.as_str().to_string(), plist::Value::String(value.to_string()));
}

fn put_bool(dict: &mut plist::Dictionary, key: MessageKey, value: bool) {
    dict.insert(key.as_str().to_string(), plist::Value::Boolean(value));
}

fn put_integer(dict: &mut plist::Dictionary, key: MessageKey, value: u32) {
    dict.insert(key.as_str().to_string(), plist::Value::Integer(value.into()));
}

fn put_json(dict: &mut plist::Dictionary, key: MessageKey, value: &serde_json::Value) {
    let bytes = serde_json::to_vec(value).expect("JSON value serializes");
    dict.insert(key.as_str().to_string(), plist::Value::Data(bytes));
}

fn encode_application(dict: &mut plist::Dictionary, app: &InspectorApplication) {
    put_string(dict, MessageKey::ApplicationBundleIdentifier, &app.application_bundle_id);
    put_string(dict, MessageKey::ApplicationIdentifier, &app.application_id);
    put_string(dict, MessageKey::ApplicationName, &app.application_name);
    if let Some(host) = &app.host_application_id {
        put_string(dict, MessageKey::HostApplicationIdentifier, host);
    }
    // A boolean property that travels as an integer.
    put_integer(
        dict,
        MessageKey::IsApplicationActive,
        app.is_application_active as u32,
    );
    put_bool(dict, MessageKey::IsApplicationProxy, app.is_application_proxy);
    if let Some(ready) = app.is_application_ready {
        put_bool(dict, MessageKey::IsApplicationReady, ready);
    }
    if let Some(enabled) = app.remote_automation_enabled {
        put_bool(dict, MessageKey::RemoteAutomationEnabled, enabled);
    }
}

fn encode_page(page: &InspectorPage) -> plist::Value {
    let mut dict = plist::Dictionary::new();
    if let Some(connection_id) = &page.connection_id {
        put_string(&mut dict, MessageKey::ConnectionIdentifier, connection_id);
    }
    put_integer(&mut dict, MessageKey::PageIdentifier, page.page_id);
    put_string(&mut dict, MessageKey::Title, &page.title);
    put_string(&mut dict, MessageKey::Type, &page.page_type);
    put_string(&mut dict, MessageKey::Url, &page.url);
    plist::Value::Dictionary(dict)
}

/// Typed access to one `__argument` dictionary.
struct Args<'a> {
    selector: MessageSelector,
    dict: &'a plist::Dictionary,
}

impl Args<'_> {
    /// Rejects keys that are unknown altogether or not declared for this
    /// selector.
    fn check_keys(&self, allowed: &[MessageKey]) -> Result<(), MessageError> {
        for key_string in self.dict.keys() {
            let key = MessageKey::for_string(key_string)
                .ok_or_else(|| MessageError::UnknownKey(key_string.to_string()))?;
            if !allowed.contains(&key) {
                return Err(MessageError::UnexpectedKey {
                    selector: self.selector,
                    key,
                });
            }
        }
        Ok(())
    }

    fn required(&self, key: MessageKey) -> Result<&plist::Value, MessageError> {
        self.dict.get(key.as_str()).ok_or(MessageError::MissingKey {
            selector: self.selector,
            key,
        })
    }

    fn string(&self, key: MessageKey) -> Result<String, MessageError> {
        self.required(key)?
            .as_string()
            .map(str::to_string)
            .ok_or(MessageError::WrongType(key))
    }

    fn opt_string(&self, key: MessageKey) -> Result<Option<String>, MessageError> {
        match self.dict.get(key.as_str()) {
            None => Ok(None),
            Some(value) => value
                .as_string()
                .map(|s| Some(s.to_string()))
                .ok_or(MessageError::WrongType(key)),
        }
    }

    fn boolean(&self, key: MessageKey) -> Result<bool, MessageError> {
        self.required(key)?
            .as_boolean()
            .ok_or(MessageError::WrongType(key))
    }

    fn integer(&self, key: MessageKey) -> Result<u32, MessageError> {
        self.required(key)?
            .as_unsigned_integer()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(MessageError::WrongType(key))
    }

    fn json(&self, key: MessageKey) -> Result<serde_json::Value, MessageError> {
        let data = match self.required(key)? {
            plist::Value::Data(data) => data,
            _ => return Err(MessageError::WrongType(key)),
        };
        serde_json::from_slice(data).map_err(|e| MessageError::MalformedJson(key, e))
    }

    fn pages(&self, key: MessageKey) -> Result<Vec<InspectorPage>, MessageError> {
        let listing = self
            .required(key)?
            .as_dictionary()
            .ok_or(MessageError::WrongType(key))?;
        listing
            .values()
            .map(|entry| {
                let dict = entry.as_dictionary().ok_or(MessageError::WrongType(key))?;
                let page = Args {
                    selector: self.selector,
                    dict,
                };
                page.check_keys(&[
                    MessageKey::ConnectionIdentifier,
                    MessageKey::PageIdentifier,
                    MessageKey::Title,
                    MessageKey::Type,
                    MessageKey::Url,
                ])?;
                Ok(InspectorPage {
                    connection_id: page.opt_string(MessageKey::ConnectionIdentifier)?,
                    page_id: page.integer(MessageKey::PageIdentifier)?,
                    title: page.string(MessageKey::Title)?,
                    page_type: page.string(MessageKey::Type)?,
                    url: page.string(MessageKey::Url)?,
                })
            })
            .collect()
    }

    fn applications(&self, key: MessageKey) -> Result<Vec<InspectorApplication>, MessageError> {
        let apps = self
            .required(key)?
            .as_dictionary()
            .ok_or(MessageError::WrongType(key))?;
        apps.values()
            .map(|entry| {
                let dict = entry.as_dictionary().ok_or(MessageError::WrongType(key))?;
                let app = Args {
                    selector: self.selector,
                    dict,
                };
                decode_application(&app, false)
            })
            .collect()
    }

    fn drivers(&self, key: MessageKey) -> Result<Vec<InspectorDriver>, MessageError> {
        let drivers = self
            .required(key)?
            .as_dictionary()
            .ok_or(MessageError::WrongType(key))?;
        Ok(drivers
            .keys()
            .map(|driver_id| InspectorDriver {
                driver_id: driver_id.clone(),
            })
            .collect())
    }
}

fn decode_application(
    args: &Args<'_>,
    check: bool,
) -> Result<InspectorApplication, MessageError> {
    if check {
        args.check_keys(&[
            MessageKey::ApplicationBundleIdentifier,
            MessageKey::ApplicationIdentifier,
            MessageKey::ApplicationName,
            MessageKey::HostApplicationIdentifier,
            MessageKey::IsApplicationActive,
            MessageKey::IsApplicationProxy,
            MessageKey::IsApplicationReady,
            MessageKey::RemoteAutomationEnabled,
        ])?;
    }
    let active = match args.required(MessageKey::IsApplicationActive)? {
        plist::Value::Integer(n) => n.as_unsigned().unwrap_or(0) != 0,
        _ => return Err(MessageError::WrongType(MessageKey::IsApplicationActive)),
    };
    let ready = match args.dict.get(MessageKey::IsApplicationReady.as_str()) {
        None => None,
        Some(value) => Some(
            value
                .as_boolean()
                .ok_or(MessageError::WrongType(MessageKey::IsApplicationReady))?,
        ),
    };
    let automation = match args.dict.get(MessageKey::RemoteAutomationEnabled.as_str()) {
        None => None,
        Some(value) => Some(
            value
                .as_boolean()
                .ok_or(MessageError::WrongType(MessageKey::RemoteAutomationEnabled))?,
        ),
    };
    Ok(InspectorApplication {
        application_bundle_id: args.string(MessageKey::ApplicationBundleIdentifier)?,
        application_id: args.string(MessageKey::ApplicationIdentifier)?,
        application_name: args.string(MessageKey::ApplicationName)?,
        host_application_id: args.opt_string(MessageKey::HostApplicationIdentifier)?,
        is_application_active: active,
        is_application_proxy: args.boolean(MessageKey::IsApplicationProxy)?,
        is_application_ready: ready,
        remote_automation_enabled: automation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safari() -> InspectorApplication {
        InspectorApplication {
            application_bundle_id: "com.apple.mobilesafari".to_string(),
            application_id: "PID:176".to_string(),
            application_name: "Safari".to_string(),
            host_application_id: Some("PID:457".to_string()),
            is_application_active: true,
            is_application_proxy: false,
            is_application_ready: None,
            remote_automation_enabled: None,
        }
    }

    fn all_messages() -> Vec<InspectorMessage> {
        vec![
            InspectorMessage::ApplicationConnected(safari()),
            InspectorMessage::ApplicationDisconnected(safari()),
            InspectorMessage::ApplicationUpdated(InspectorApplication {
                is_application_ready: Some(true),
                remote_automation_enabled: Some(false),
                ..safari()
            }),
            InspectorMessage::ApplicationSentData {
                application_id: "PID:176".to_string(),
                destination: "C1EAD225-D6BC-44B9-9089-2D7CC2D2204C".to_string(),
                message_data: serde_json::json!({"id": 1, "result": true}),
            },
            InspectorMessage::ApplicationSentListing {
                application_id: "PID:176".to_string(),
                listing: vec![
                    InspectorPage {
                        connection_id: None,
                        page_id: 1,
                        title: "Google".to_string(),
                        page_type: "WIRTypeWeb".to_string(),
                        url: "http://www.google.com".to_string(),
                    },
                    InspectorPage {
                        connection_id: Some("17858421-36EF-4752-89F7-7A13ED5782C5".to_string()),
                        page_id: 2,
                        title: "Yahoo".to_string(),
                        page_type: "WIRTypeWeb".to_string(),
                        url: "http://www.yahoo.com".to_string(),
                    },
                ],
            },
            InspectorMessage::ForwardGetListing {
                application_id: "PID:176".to_string(),
                connection_id: "17858421-36EF-4752-89F7-7A13ED5782C5".to_string(),
            },
            InspectorMessage::ForwardSocketData {
                application_id: "PID:176".to_string(),
                connection_id: "17858421-36EF-4752-89F7-7A13ED5782C5".to_string(),
                page_id: 1,
                sender: "945F1154-E7E1-4B6A-B1AF-9F29E48E9C88".to_string(),
                socket_data: serde_json::json!({"method": "Page.enable"}),
            },
            InspectorMessage::ForwardSocketSetup {
                application_id: "PID:176".to_string(),
                automatically_pause: false,
                connection_id: "17858421-36EF-4752-89F7-7A13ED5782C5".to_string(),
                page_id: 1,
                sender: "945F1154-E7E1-4B6A-B1AF-9F29E48E9C88".to_string(),
            },
            InspectorMessage::ReportConnectedApplicationList {
                application_dictionary: vec![safari()],
            },
            InspectorMessage::ReportConnectedDriverList {
                driver_dictionary: vec![],
            },
            InspectorMessage::ReportIdentifier {
                connection_id: "17858421-36EF-4752-89F7-7A13ED5782C5".to_string(),
            },
            InspectorMessage::ReportSetup {
                simulator_build: Some("12H321".to_string()),
                simulator_name: Some("iPhone 5".to_string()),
                simulator_product_version: Some("8.4.1".to_string()),
            },
        ]
    }

    #[test]
    fn every_message_round_trips_through_its_plist() {
        for message in all_messages() {
            let decoded = InspectorMessage::from_plist(&message.to_plist()).unwrap();
            assert_eq!(decoded, message, "round trip failed for {message:?}");
        }
    }

    #[test]
    fn key_strings_round_trip() {
        for key in MessageKey::ALL {
            assert_eq!(MessageKey::for_string(key.as_str()), Some(key));
        }
        assert_eq!(MessageKey::for_string("WIRBogusKey"), None);
    }

    #[test]
    fn selector_strings_round_trip() {
        for selector in MessageSelector::ALL {
            assert_eq!(MessageSelector::for_string(selector.as_str()), Some(selector));
        }
        assert_eq!(MessageSelector::ALL.len(), 12);
    }

    #[test]
    fn url_key_keeps_its_all_caps_spelling() {
        assert_eq!(MessageKey::Url.as_str(), "WIRURLKey");
    }

    #[test]
    fn application_connected_encodes_the_expected_wire_keys() {
        let message = InspectorMessage::ApplicationConnected(safari());
        let plist = message.to_plist();
        assert_eq!(
            plist.get("__selector").unwrap().as_string(),
            Some("_rpc_applicationConnected:")
        );
        let argument = plist.get("__argument").unwrap().as_dictionary().unwrap();
        assert_eq!(
            argument
                .get("WIRApplicationBundleIdentifierKey")
                .unwrap()
                .as_string(),
            Some("com.apple.mobilesafari")
        );
        // The active flag travels as an integer, the proxy flag as a real
        // boolean.
        assert_eq!(
            argument.get("WIRIsApplicationActiveKey").unwrap(),
            &plist::Value::Integer(1.into())
        );
        assert_eq!(
            argument.get("WIRIsApplicationProxyKey").unwrap(),
            &plist::Value::Boolean(false)
        );
    }

    #[test]
    fn listing_is_keyed_by_page_number() {
        let message = InspectorMessage::ApplicationSentListing {
            application_id: "PID:176".to_string(),
            listing: vec![InspectorPage {
                connection_id: None,
                page_id: 7,
                title: "Title".to_string(),
                page_type: "WIRTypeWeb".to_string(),
                url: "http://example.com".to_string(),
            }],
        };
        let plist = message.to_plist();
        let argument = plist.get("__argument").unwrap().as_dictionary().unwrap();
        let listing = argument.get("WIRListingKey").unwrap().as_dictionary().unwrap();
        assert!(listing.contains_key("7"));
    }

    #[test]
    fn report_identifier_wire_form_matches_the_protocol() {
        let message = InspectorMessage::ReportIdentifier {
            connection_id: "id1".to_string(),
        };
        let plist = message.to_plist();
        assert_eq!(
            plist.get("__selector").unwrap().as_string(),
            Some("_rpc_reportIdentifier:")
        );
        let argument = plist.get("__argument").unwrap().as_dictionary().unwrap();
        assert_eq!(argument.len(), 1);
        assert_eq!(
            argument.get("WIRConnectionIdentifierKey").unwrap().as_string(),
            Some("id1")
        );
    }

    #[test]
    fn decodes_from_an_xml_plist() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>__selector</key>
  <string>_rpc_forwardGetListing:</string>
  <key>__argument</key>
  <dict>
    <key>WIRApplicationIdentifierKey</key>
    <string>PID:176</string>
    <key>WIRConnectionIdentifierKey</key>
    <string>id1</string>
  </dict>
</dict>
</plist>"#;
        let value = plist::Value::from_reader(std::io::Cursor::new(xml.as_bytes())).unwrap();
        let message =
            InspectorMessage::from_plist(value.as_dictionary().unwrap()).unwrap();
        assert_eq!(
            message,
            InspectorMessage::ForwardGetListing {
                application_id: "PID:176".to_string(),
                connection_id: "id1".to_string(),
            }
        );
    }

    #[test]
    fn unknown_selector_is_a_decode_error() {
        let mut plist = plist::Dictionary::new();
        plist.insert("__selector".into(), "_rpc_bogus:".into());
        plist.insert(
            "__argument".into(),
            plist::Value::Dictionary(plist::Dictionary::new()),
        );
        assert!(matches!(
            InspectorMessage::from_plist(&plist),
            Err(MessageError::UnknownSelector(_))
        ));
    }

    #[test]
    fn undeclared_key_for_a_selector_is_a_decode_error() {
        let mut argument = plist::Dictionary::new();
        argument.insert("WIRConnectionIdentifierKey".into(), "id1".into());
        argument.insert("WIRTitleKey".into(), "not allowed here".into());
        let mut plist = plist::Dictionary::new();
        plist.insert("__selector".into(), "_rpc_reportIdentifier:".into());
        plist.insert("__argument".into(), plist::Value::Dictionary(argument));
        assert!(matches!(
            InspectorMessage::from_plist(&plist),
            Err(MessageError::UnexpectedKey { .. })
        ));
    }

    #[test]
    fn missing_required_key_is_a_decode_error() {
        let mut plist = plist::Dictionary::new();
        plist.insert("__selector".into(), "_rpc_reportIdentifier:".into());
        plist.insert(
            "__argument".into(),
            plist::Value::Dictionary(plist::Dictionary::new()),
        );
        assert!(matches!(
            InspectorMessage::from_plist(&plist),
            Err(MessageError::MissingKey { .. })
        ));
    }
}
