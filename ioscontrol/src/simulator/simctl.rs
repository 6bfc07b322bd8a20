//! Invocation of `xcrun simctl` and the host shell tools it leans on.

use std::path::Path;

use crate::command::{Command, CommandProcess, OutputSink};

/// The simctl subcommands for one simulated device. Every command runs
/// with an empty environment.
#[derive(Clone, Debug)]
pub(crate) struct SimctlCommands {
    udid: String,
}

impl SimctlCommands {
    pub fn new(udid: impl Into<String>) -> Self {
        SimctlCommands { udid: udid.into() }
    }

    pub fn list() -> CommandProcess {
        exec(simctl(&["list", "--json", "devices"]))
    }

    pub fn shutdown_all() -> CommandProcess {
        exec(simctl(&["shutdown", "all"]))
    }

    pub fn install(&self, app_path: &str) -> CommandProcess {
        exec(simctl(&["install", self.udid.as_str(), app_path]))
    }

    pub fn uninstall(&self, bundle_id: &str) -> CommandProcess {
        exec(simctl(&["uninstall", self.udid.as_str(), bundle_id]))
    }

    pub fn launch(&self, bundle_id: &str, args: &[&str]) -> CommandProcess {
        let command = simctl(&["launch", "--console", self.udid.as_str(), bundle_id])
            .with_args_appended(args.iter().copied());
        exec(command)
    }

    pub fn screenshot(&self, screenshot_path: &Path) -> CommandProcess {
        let path = screenshot_path.to_string_lossy();
        exec(simctl(&[
            "io",
            self.udid.as_str(),
            "screenshot",
            "--type=png",
            path.as_ref(),
        ]))
    }

    pub fn enumerate(&self) -> CommandProcess {
        exec(simctl(&["io", self.udid.as_str(), "enumerate"]))
    }

    pub fn shutdown(&self) -> CommandProcess {
        exec(simctl(&["shutdown", self.udid.as_str()]))
    }

    pub fn boot(&self) -> CommandProcess {
        exec(simctl(&["boot", self.udid.as_str()]))
    }

    pub fn erase(&self) -> CommandProcess {
        exec(simctl(&["erase", self.udid.as_str()]))
    }

    pub fn syslog(&self, log_path: &Path) -> CommandProcess {
        let command = simctl(&[
            "spawn",
            self.udid.as_str(),
            "log",
            "stream",
            "--level=debug",
            "--system",
        ])
        .with_stdout(OutputSink::File(log_path.to_path_buf()));
        exec(command)
    }
}

fn simctl(args: &[&str]) -> Command {
    Command::new("xcrun")
        .with_args(std::iter::once("simctl").chain(args.iter().copied()))
        .with_empty_env()
}

fn exec(command: Command) -> CommandProcess {
    command
        .start()
        .unwrap_or_else(|e| panic!("has Xcode been installed? {e}"))
}

/// Host shell commands used to probe simulator state.
pub(crate) struct ShellCommands;

impl ShellCommands {
    pub fn lsof(args: &[&str]) -> CommandProcess {
        exec(Command::new("lsof").with_args(args.iter().copied()).with_empty_env())
    }

    pub fn ps(args: &[&str]) -> CommandProcess {
        exec(Command::new("ps").with_args(args.iter().copied()).with_empty_env())
    }
}
