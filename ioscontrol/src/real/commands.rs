//! Invocation of the libimobiledevice binaries and `cfgutil`.

use std::path::{Path, PathBuf};

use crate::command::{Command, CommandProcess, OutputSink};

const TOOL_DIR: &str = "/usr/local/bin";

/// The binaries provided by libimobiledevice and friends, bound to one
/// device by udid. Every command runs with an empty environment.
#[derive(Clone, Debug)]
pub(crate) struct IdeviceCommands {
    udid: String,
}

impl IdeviceCommands {
    pub fn new(udid: impl Into<String>) -> Self {
        IdeviceCommands { udid: udid.into() }
    }

    /// `idevice_id`, the one tool that runs without a target device.
    pub fn id(args: &[&str]) -> CommandProcess {
        exec(
            Command::new(tool_path("idevice_id"))
                .with_args(args.iter().copied())
                .with_empty_env(),
        )
    }

    pub fn apprunner(&self, args: &[String]) -> CommandProcess {
        self.exec_device("idevice-app-runner", args, |c| c)
    }

    pub fn date(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("idevicedate", args)
    }

    pub fn diagnostics(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("idevicediagnostics", args)
    }

    pub fn imagemounter(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("ideviceimagemounter", args)
    }

    pub fn info(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("ideviceinfo", args)
    }

    pub fn installer(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("ideviceinstaller", args)
    }

    pub fn screenshot(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("idevicescreenshot", args)
    }

    pub fn syslog(&self, log_path: &Path) -> CommandProcess {
        let log_path = log_path.to_path_buf();
        self.exec_device("idevicesyslog", &[], move |c| {
            c.with_stdout(OutputSink::File(log_path))
        })
    }

    pub fn crashreport(&self, args: &[&str]) -> CommandProcess {
        self.exec_str("idevicecrashreport", args)
    }

    pub fn webinspectorproxy(&self, port: u16) -> CommandProcess {
        let port = port.to_string();
        self.exec_str("idevicewebinspectorproxy", &[port.as_str()])
    }

    fn exec_str(&self, filename: &str, args: &[&str]) -> CommandProcess {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.exec_device(filename, &args, |c| c)
    }

    fn exec_device(
        &self,
        filename: &str,
        args: &[String],
        transform: impl FnOnce(Command) -> Command,
    ) -> CommandProcess {
        let command = Command::new(tool_path(filename))
            .with_args(["-u", self.udid.as_str()])
            .with_args_appended(args.iter().cloned())
            .with_empty_env();
        exec(transform(command))
    }
}

/// Restarts a previously built idevice command, e.g. after re-pairing.
pub(crate) fn exec(command: Command) -> CommandProcess {
    command.start().unwrap_or_else(|e| {
        panic!("have the libimobiledevice tools been installed? {e}");
    })
}

fn tool_path(filename: &str) -> String {
    PathBuf::from(TOOL_DIR)
        .join(filename)
        .to_string_lossy()
        .into_owned()
}

/// Paths to the certificate and private key of a supervision identity.
#[derive(Clone, Debug)]
pub struct SupervisionIdentity {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

/// The `cfgutil` subcommands against a device, addressed by ECID. All
/// output is requested in plist form.
#[derive(Clone, Debug)]
pub(crate) struct CfgutilCommands {
    ecid: String,
    supervision_id: Option<SupervisionIdentity>,
}

impl CfgutilCommands {
    pub fn new(ecid: impl Into<String>, supervision_id: Option<SupervisionIdentity>) -> Self {
        CfgutilCommands {
            ecid: ecid.into(),
            supervision_id,
        }
    }

    pub fn is_supervised(&self) -> bool {
        self.supervision_id.is_some()
    }

    pub fn get(&self, property: &str) -> CommandProcess {
        self.exec("get", &[property])
    }

    pub fn install_profile(&self, profile_path: &str) -> CommandProcess {
        self.exec_supervised("install-profile", &[profile_path])
    }

    pub fn pair(&self) -> CommandProcess {
        self.exec_supervised("pair", &[])
    }

    pub fn remove_profile(&self, path_or_identifier: &str) -> CommandProcess {
        self.exec_supervised("remove-profile", &[path_or_identifier])
    }

    fn exec(&self, subcommand: &str, args: &[&str]) -> CommandProcess {
        self.start(&["-e", self.ecid.as_str(), subcommand], args)
    }

    fn exec_supervised(&self, subcommand: &str, args: &[&str]) -> CommandProcess {
        let identity = self.supervision_id.as_ref().unwrap_or_else(|| {
            panic!("must set a supervision identity in the device host to use `cfgutil {subcommand}`")
        });
        let cert = identity.certificate_path.to_string_lossy().into_owned();
        let key = identity.private_key_path.to_string_lossy().into_owned();
        self.start(
            &[
                "-e",
                self.ecid.as_str(),
                "-C",
                cert.as_str(),
                "-K",
                key.as_str(),
                subcommand,
            ],
            args,
        )
    }

    fn start(&self, head: &[&str], tail: &[&str]) -> CommandProcess {
        let command = Command::new(tool_path("cfgutil"))
            .with_args(["--format", "plist"])
            .with_args_appended(head.iter().copied())
            .with_args_appended(tail.iter().copied())
            .with_empty_env();
        command.start().unwrap_or_else(|e| {
            panic!("have the Apple Configurator automation tools been installed? {e}");
        })
    }
}
