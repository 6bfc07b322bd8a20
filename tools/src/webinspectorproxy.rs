// A TCP proxy exposing a device's Web Inspector service on a local port.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Arg, ArgAction, Command};
use log::error;

use ioscontrol::webinspector::{TcpDeviceConnector, WebInspectorProxy};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let matches = Command::new("webinspectorproxy")
        .about("Proxy a device Web Inspector service to a local TCP port")
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Enable communication debugging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("udid")
                .short('u')
                .long("udid")
                .value_name("UDID")
                .help("Target device UDID, for log context"),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("TIMEOUT_MS")
                .help("Device receive timeout in milliseconds"),
        )
        .arg(
            Arg::new("xml")
                .short('x')
                .long("xml")
                .help("Forward device messages as XML instead of binary plists")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .value_name("ADDR")
                .help("host:port of the device webinspector service endpoint")
                .required(true),
        )
        .arg(
            Arg::new("port")
                .value_name("PORT")
                .help("Local port to listen on")
                .required(true),
        )
        .get_matches();

    if matches.get_flag("debug") {
        log::set_max_level(log::LevelFilter::Debug);
    }

    let port: u16 = match matches.get_one::<String>("port").unwrap().parse() {
        Ok(port) if port > 0 => port,
        _ => {
            eprintln!("Please specify a PORT.");
            return ExitCode::FAILURE;
        }
    };
    let timeout = matches
        .get_one::<String>("timeout")
        .and_then(|t| t.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(ioscontrol::webinspector::DEFAULT_RECV_TIMEOUT);

    let connector =
        TcpDeviceConnector::new(matches.get_one::<String>("device").unwrap().clone());
    let mut proxy = WebInspectorProxy::new(connector).with_recv_timeout(timeout);
    if matches.get_flag("xml") {
        proxy = proxy.with_xml_output();
    }

    let listener = match WebInspectorProxy::<TcpDeviceConnector>::bind(port).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("could not create socket: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(udid) = matches.get_one::<String>("udid") {
        log::info!("proxying web inspector of device {udid} on port {port}");
    }

    let shutdown = quit_signal();
    match proxy.serve(listener, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("proxy failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves when SIGINT, SIGTERM or SIGQUIT arrives.
#[cfg(unix)]
async fn quit_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
    let mut quit = signal(SignalKind::quit()).expect("signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn quit_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
