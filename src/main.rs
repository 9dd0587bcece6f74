use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pubmesh::{AllowAll, Key, KeyId, MemoryKeyStore, MeshConfig, Node};

/// Preshared key id for the demo deployment.
const DEMO_KEY_ID: KeyId = [
    0xed, 0x54, 0x14, 0xa8, 0x5c, 0x4d, 0x4d, 0x15, 0xb6, 0x9f, 0x0e, 0x99, 0x8a, 0xb1, 0x71,
    0xf2,
];

/// Preshared key material for the demo deployment. Testing only.
const DEMO_KEY_MATERIAL: &[u8] = &[
    0x77, 0x58, 0x22, 0xfc, 0x3d, 0xef, 0x48, 0x88, 0x91, 0x25, 0x78, 0xd0, 0xe2, 0x74, 0x5c,
    0x10,
];

const ACK_MESSAGE: &[u8] = b"This is an ACK";

#[derive(Parser, Debug)]
#[command(name = "pubmesh")]
#[command(author, version, about = "Interest-flooding pub/sub mesh subscriber", long_about = None)]
struct Args {
    /// Listen port (0 picks an ephemeral port).
    #[arg(short = 'l', long = "listen", default_value = "0")]
    listen: u16,

    /// Host to link to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// Port to link to; no link is attempted when absent.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Enable local-network multicast discovery.
    #[arg(short = 'm', long = "multicast")]
    multicast: bool,

    /// Encrypt publications and acks with the preshared demo key.
    #[arg(short = 'x', long = "encrypt", default_value = "1", value_parser = clap::value_parser!(u8).range(0..=1))]
    encrypt: u8,

    /// Suppress per-publication output.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Topic group to subscribe; repeat for independent groups
    /// (`-s a b -s c` registers two subscriptions).
    #[arg(short = 's', long = "subscribe", num_args = 1.., action = clap::ArgAction::Append, value_parser = clap::value_parser!(String))]
    subscribe: Vec<Vec<String>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut keys = MemoryKeyStore::new();
    keys.insert(DEMO_KEY_ID, Key::from_material(DEMO_KEY_MATERIAL));

    let config = MeshConfig {
        key_id: (args.encrypt == 1).then_some(DEMO_KEY_ID),
        ..MeshConfig::default()
    };

    let node = match Node::start(
        &format!("0.0.0.0:{}", args.listen),
        config,
        Arc::new(keys),
        Arc::new(AllowAll),
    )
    .await
    {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "listening on port {}, publisher {}",
        node.local_addr().port(),
        node.publisher_id()
    );

    let mut subscriber_tasks = Vec::new();
    for group in &args.subscribe {
        let topics: Vec<&str> = group.iter().map(String::as_str).collect();
        let (id, mut rx) = match node.subscribe(&topics).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("failed to subscribe {:?}: {:#}", group, e);
                return ExitCode::FAILURE;
            }
        };
        info!(subscription = id, "subscribed to {}", group.join(" & "));

        let node = node.clone();
        let quiet = args.quiet;
        subscriber_tasks.push(tokio::spawn(async move {
            while let Some(publication) = rx.recv().await {
                if !quiet {
                    println!(
                        "pub {}({}) matches: {}",
                        hex::encode(publication.publisher),
                        publication.sequence,
                        publication.topics.join(" | ")
                    );
                    if !publication.payload.is_empty() {
                        println!("{}", String::from_utf8_lossy(&publication.payload));
                    }
                }
                if publication.ack_requested {
                    if let Err(e) = node.ack(&publication, ACK_MESSAGE.to_vec()).await {
                        warn!("failed to ack publication: {:#}", e);
                    }
                }
            }
        }));
    }

    // Without an explicit link target, fall back to discovery so the
    // node can still join a local mesh.
    if args.multicast || args.port.is_none() {
        if let Err(e) = node.enable_discovery().await {
            warn!("multicast discovery unavailable: {:#}", e);
        }
    }

    if let Some(port) = args.port {
        let target = format!("{}:{}", args.host, port);
        let addr = match target.parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("invalid link target {}: {}", target, e);
                return ExitCode::FAILURE;
            }
        };
        match node.link_to(addr).await {
            Ok(link) => info!(link, "linked to {}", target),
            Err(e) => {
                error!("failed to link to {}: {:#}", target, e);
                return ExitCode::FAILURE;
            }
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to wait for shutdown signal");
        return ExitCode::FAILURE;
    }
    info!("shutting down");
    for task in subscriber_tasks {
        task.abort();
    }
    if let Err(e) = node.shutdown().await {
        warn!("shutdown error: {:#}", e);
    }
    ExitCode::SUCCESS
}
