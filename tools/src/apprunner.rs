// Launch an app through a device's debugserver and relay its stdout.

use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use log::error;

use ioscontrol::real::DebugServerClient;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let matches = Command::new("apprunner")
        .about("Run apps on an iDevice through its debugserver")
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
                .help("Target device by its 40-digit device UDID"),
        )
        .arg(
            Arg::new("addr")
                .long("addr")
                .value_name("ADDR")
                .help("host:port of the device debugserver endpoint")
                .required(true),
        )
        .arg(
            Arg::new("start")
                .short('s')
                .long("start")
                .value_name("APPID")
                .help("Bundle id of the app, for log context")
                .required(true),
        )
        .arg(
            Arg::new("path")
                .long("path")
                .value_name("APP_PATH")
                .help("On-device executable path of the app")
                .required(true),
        )
        .arg(
            Arg::new("env")
                .short('D')
                .value_name("NAME=VALUE")
                .help("Set an environment variable")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("args")
                .long("args")
                .value_name("ARG")
                .help("Command-line arguments for the app")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
        .get_matches();

    if matches.get_flag("debug") {
        log::set_max_level(log::LevelFilter::Debug);
    }
    if let Some(udid) = matches.get_one::<String>("udid") {
        if udid.len() != 40 {
            eprintln!("invalid UDID specified (length != 40)");
            return ExitCode::from(2);
        }
    }

    let mut env = Vec::new();
    for pair in matches.get_many::<String>("env").unwrap_or_default() {
        match pair.split_once('=') {
            Some((name, value)) => env.push((name.to_string(), value.to_string())),
            None => {
                eprintln!("bad environment variable: {pair}");
                return ExitCode::from(2);
            }
        }
    }
    let args: Vec<&str> = matches
        .get_many::<String>("args")
        .unwrap_or_default()
        .map(String::as_str)
        .collect();

    let addr = matches.get_one::<String>("addr").unwrap();
    let socket = match tokio::net::TcpStream::connect(addr.as_str()).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("could not connect to debugserver at {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let app_id = matches.get_one::<String>("start").unwrap();
    let app_path = matches.get_one::<String>("path").unwrap();
    log::info!("launching {app_id} from {app_path}");

    let mut client = DebugServerClient::new(Box::new(socket));
    let mut stdout = tokio::io::stdout();
    match client.run_app(app_path, &args, &env, &mut stdout).await {
        Ok(exit_code) => ExitCode::from(exit_code.clamp(0, 255) as u8),
        Err(e) => {
            error!("app launch failed: {e}");
            ExitCode::FAILURE
        }
    }
}
