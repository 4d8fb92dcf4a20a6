//! tcp-router entry point
//!
//! ```bash
//! tcp-router /etc/tcp-router.conf
//! ```
//!
//! Exit code 0 on clean shutdown (operator `exit` command), 1 on startup
//! failure: missing argument, invalid configuration, another instance
//! already running, fifo creation failure, or listen failure.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tcp_router::config::load_config;
use tcp_router::control::{base_name, RuntimePaths};
use tcp_router::engine::Proxy;
use tcp_router::instance::InstanceLock;
use tcp_router::net;

/// Command-line arguments
struct Args {
    /// argv[0], used to derive the runtime file names
    program: String,
    /// Configuration file path
    config_path: String,
}

impl Args {
    fn parse() -> Self {
        let mut argv = std::env::args();
        let program = argv.next().unwrap_or_else(|| "tcp-router".to_string());
        let mut config_path = None;

        for arg in argv {
            match arg.as_str() {
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("tcp-router v{}", tcp_router::VERSION);
                    std::process::exit(0);
                }
                _ if arg.starts_with('-') => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
                _ if config_path.is_none() => config_path = Some(arg),
                _ => {
                    eprintln!("Unexpected argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        let Some(config_path) = config_path else {
            eprintln!("No configuration file specified.");
            print_help();
            std::process::exit(1);
        };

        Self {
            program,
            config_path,
        }
    }
}

fn print_help() {
    println!(
        r#"tcp-router v{}

Source-IP-routed TCP reverse proxy with a runtime control channel.

USAGE:
    tcp-router <CONFIG>

ARGS:
    <CONFIG>    Configuration file path

OPTIONS:
    -h, --help       Print help information
    -v, --version    Print version information

CONFIGURATION:
    [tcp_proxy]
    "port"="8080"

    [tcp_proxy\routes]
    "route"="<source_host> <target_host>:<target_port>"

CONTROL:
    Commands are written to /tmp/<name>.fifo, one command per open:
        add <source_host> <target_host>:<port>
        exit
"#,
        tcp_router::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` level.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: &Args) -> tcp_router::error::Result<()> {
    // One-shot process initialisation: a half-closed socket must surface
    // EPIPE, not kill us.
    net::ignore_sigpipe();

    let name = base_name(&args.program);
    let paths = RuntimePaths::for_name(&name);

    let lock = InstanceLock::acquire(&paths.lock, &name)?;
    let config = load_config(&args.config_path)?;

    let mut proxy = Proxy::new(&config, &paths)?;
    info!("starting TCP proxy on port {}", config.port);
    proxy.run()?;

    lock.remove();
    Ok(())
}

fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}
