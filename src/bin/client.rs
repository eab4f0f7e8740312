//! omx chat client
//!
//! Usage: omx-client [OPTIONS]
//!
//! Options:
//!   -H, --host <HOST>    Server address (default 127.0.0.1)
//!   -p, --port <PORT>    Server port (default 5000; tunnel modes 5443)
//!   -m, --mode <MODE>    default | secure | obfs | secure_obfs
//!   -c, --config <FILE>  JSON configuration file
//!   -i, --id <NAME>      Client identity (default: generated)
//!   -h, --help           Print help information

use std::env;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc;

use omx::app::{Session, SessionEvent, SessionPhase};
use omx::carrier::{Carrier, ObfsClientCarrier, Peer, UdpCarrier};
use omx::config::ConfigFile;
use omx::transport::Endpoint;
use omx::{Config, Mode};

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
    let mut host = "127.0.0.1".to_owned();
    let mut port: Option<u16> = None;
    let mut identity: Option<String> = None;

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
                let file: ConfigFile = serde_json::from_str(&content)?;
                config = file.to_config()?;
            }
            "-m" | "--mode" => {
                config.mode = expect_value(&args, &mut i)?.parse()?;
            }
            "-H" | "--host" => {
                host = expect_value(&args, &mut i)?;
            }
            "-p" | "--port" => {
                port = Some(expect_value(&args, &mut i)?.parse()?);
            }
            "-i" | "--id" => {
                identity = Some(expect_value(&args, &mut i)?);
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
    let server: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("could not resolve {host}:{port}"))?;
    let identity = identity.unwrap_or_else(generate_client_id);

    tracing::info!(%server, mode = %config.mode, id = %identity, "connecting");

    if config.mode.uses_tunnel() {
        let carrier = ObfsClientCarrier::new(server, identity.clone(), &config.obfs);
        let peer = carrier.server_peer();
        run(carrier, peer, config, identity).await
    } else {
        let carrier = UdpCarrier::bind("0.0.0.0:0".parse::<SocketAddr>()?).await?;
        run(carrier, Peer::Socket(server), config, identity).await
    }
}

async fn run<C: Carrier>(
    carrier: C,
    peer: Peer,
    config: Config,
    identity: String,
) -> anyhow::Result<()> {
    let endpoint = Endpoint::new(carrier, config.transport.clone());
    let mut session = Session::client(endpoint, config.mode, identity);

    session.connect(peer).await?;
    banner(&session, config.mode);

    let shutdown = session.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    // The interactive input runs on its own blocking thread and feeds a
    // channel, so user typing never stalls the protocol loop.
    let mut lines = spawn_stdin_reader();

    loop {
        match lines.try_recv() {
            Ok(line) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if matches!(text, "quit" | "exit" | "bye") {
                    break;
                }
                match session.send_chat(text).await {
                    Ok(()) => println!("✓ sent"),
                    Err(e) => {
                        tracing::error!("send failed: {e}");
                        break;
                    }
                }
                continue;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }

        match session.poll(Duration::from_millis(200)).await {
            Ok(Some(SessionEvent::Chat { sender, text })) => {
                println!("<<< [{sender}]: {text}");
            }
            Ok(Some(SessionEvent::Bye { .. })) => {
                println!("*** server said goodbye");
                break;
            }
            Ok(Some(SessionEvent::PeerError { code, detail })) => {
                eprintln!("*** server error {code}: {detail}");
                break;
            }
            Ok(None) => {}
            Err(omx::Error::Cancelled) => break,
            Err(e) => {
                tracing::error!("session ended: {e}");
                break;
            }
        }

        if session.phase() != SessionPhase::Ready {
            break;
        }
    }

    if session.phase() == SessionPhase::Ready {
        session.bye(None).await?;
    }
    tracing::info!("disconnected");
    Ok(())
}

fn banner<C: Carrier>(session: &Session<C>, mode: Mode) {
    println!("{}", "=".repeat(60));
    println!("Connected to {}", session.peer_identity().unwrap_or("?"));
    println!("Mode: {mode}");
    if mode.is_secure() {
        println!("Encryption: AES-128-CBC (session key installed)");
    }
    if mode.uses_tunnel() {
        println!("Carrier: HTTP tunnel");
    } else {
        println!("Carrier: direct UDP");
    }
    println!("{}", "=".repeat(60));
    println!("Type messages; 'quit' to leave.");
}

/// Read stdin lines on a dedicated thread, ending the channel on EOF.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

/// `client_<unix-ts>_<6 random lowercase alphanumerics>`, for clients that
/// did not configure an identity.
fn generate_client_id() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            let alphabet = b"abcdefghijklmnopqrstuvwxyz0123456789";
            alphabet[rng.gen_range(0..alphabet.len())] as char
        })
        .collect();
    format!("client_{ts}_{suffix}")
}

fn expect_value(args: &[String], i: &mut usize) -> anyhow::Result<String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", args[*i - 1]))
}

fn print_usage() {
    println!(
        r#"omx-client - reliable chat client over UDP or an HTTP tunnel

USAGE:
    omx-client [OPTIONS]

OPTIONS:
    -H, --host <HOST>    Server address (default 127.0.0.1)
    -p, --port <PORT>    Server port (default 5000; tunnel modes 5443)
    -m, --mode <MODE>    default | secure | obfs | secure_obfs
    -c, --config <FILE>  JSON configuration file
    -i, --id <NAME>      Client identity (default: generated)
    -h, --help           Print help information

EXAMPLES:
    Plain chat with a local server:
        omx-client --mode default

    Encrypted chat through the HTTP tunnel:
        omx-client --host example.org --mode secure_obfs
"#
    );
}
