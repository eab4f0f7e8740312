//! omx chat server
//!
//! Usage: omx-server [OPTIONS]
//!
//! Options:
//!   -p, --port <PORT>    Listen port (default 5000; tunnel modes 5443)
//!   -m, --mode <MODE>    default | secure | obfs | secure_obfs
//!   -c, --config <FILE>  TOML configuration file
//!   -i, --id <NAME>      Server identity announced in HELLO
//!   -h, --help           Print help information

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use omx::app::{Session, SessionEvent, SessionPhase};
use omx::carrier::{Carrier, ObfsServerCarrier, UdpCarrier};
use omx::config::ConfigFile;
use omx::transport::Endpoint;
use omx::Config;

const DEFAULT_UDP_PORT: u16 = 5000;
const DEFAULT_TUNNEL_PORT: u16 = 5443;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let mut config = Config::default();
    let mut port: Option<u16> = None;
    let mut identity = omx::DEFAULT_SERVER_ID.to_owned();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-c" | "--config" => {
                let path = expect_value(&args, &mut i)?;
                let content = std::fs::read_to_string(&path)?;
                let file: ConfigFile = toml::from_str(&content)?;
                config = file.to_config()?;
            }
            "-m" | "--mode" => {
                config.mode = expect_value(&args, &mut i)?.parse()?;
            }
            "-p" | "--port" => {
                port = Some(expect_value(&args, &mut i)?.parse()?);
            }
            "-i" | "--id" => {
                identity = expect_value(&args, &mut i)?;
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                return Ok(());
            }
        }
        i += 1;
    }

    config.validate()?;
    let port = port.unwrap_or(if config.mode.uses_tunnel() {
        DEFAULT_TUNNEL_PORT
    } else {
        DEFAULT_UDP_PORT
    });
    let listen: SocketAddr = ([0, 0, 0, 0], port).into();

    tracing::info!(mode = %config.mode, %listen, "starting omx server");
    if config.mode.is_secure() {
        tracing::info!("secure mode: a fresh AES-128 key is issued per session");
    }

    if config.mode.uses_tunnel() {
        let carrier = ObfsServerCarrier::bind(listen, &config.obfs).await?;
        serve(carrier, config, identity).await
    } else {
        let carrier = UdpCarrier::bind(listen).await?;
        serve(carrier, config, identity).await
    }
}

/// Serve clients one session at a time, resetting between them.
async fn serve<C: Carrier>(carrier: C, config: Config, identity: String) -> anyhow::Result<()> {
    let endpoint = Endpoint::new(carrier, config.transport.clone());
    let mut session = Session::server(endpoint, config.mode, identity);

    let shutdown = session.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    loop {
        tracing::info!("waiting for a client...");
        let client_id = match session.accept().await {
            Ok(id) => id,
            Err(omx::Error::Cancelled) => break,
            Err(e) => {
                tracing::warn!("session setup failed: {e}");
                session.reset();
                continue;
            }
        };
        println!("*** {client_id} connected ({} mode)", session.mode());

        while session.phase() == SessionPhase::Ready {
            match session.poll(Duration::from_millis(200)).await {
                Ok(Some(SessionEvent::Chat { sender, text })) => {
                    println!(">>> [{sender}]: {text}");
                }
                Ok(Some(SessionEvent::Bye { reason })) => {
                    match reason {
                        Some(reason) => println!("*** {client_id} left: {reason}"),
                        None => println!("*** {client_id} left"),
                    }
                    break;
                }
                Ok(Some(SessionEvent::PeerError { code, detail })) => {
                    tracing::warn!(%code, %detail, "client reported an error");
                    break;
                }
                Ok(None) => {}
                Err(omx::Error::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::warn!("session ended: {e}");
                    break;
                }
            }
        }

        session.reset();
    }

    Ok(())
}

fn expect_value(args: &[String], i: &mut usize) -> anyhow::Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", args[*i - 1]))
}

fn print_usage() {
    println!(
        r#"omx-server - reliable chat server over UDP or an HTTP tunnel

USAGE:
    omx-server [OPTIONS]

OPTIONS:
    -p, --port <PORT>    Listen port (default 5000; tunnel modes 5443)
    -m, --mode <MODE>    default | secure | obfs | secure_obfs
    -c, --config <FILE>  TOML configuration file
    -i, --id <NAME>      Server identity announced in HELLO
    -h, --help           Print help information

EXAMPLES:
    Plain UDP chat on the default port:
        omx-server --mode default

    Encrypted chat behind the HTTP tunnel:
        omx-server --mode secure_obfs --port 8080
"#
    );
}
