//! Palisade unified CLI.
//!
//! A Byzantine-fault-tolerant secret store with SPAKE2+ password
//! authentication.
//!
//! # Quick Start
//!
//! ```bash
//! # Deal keys and write palisade.toml + node-<id>.toml (n = 4, f = 1)
//! palisade keygen ./cluster
//!
//! # Start the replicas and the gateway (one terminal each)
//! palisade replica --id 0 ./cluster
//! palisade replica --id 1 ./cluster
//! palisade replica --id 2 ./cluster
//! palisade replica --id 3 ./cluster
//! palisade gateway ./cluster
//!
//! # Enroll and log in
//! palisade enroll ./cluster alice
//! palisade login ./cluster alice
//! ```

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use palisade_config::{
    ClusterConfig, ClusterSection, NodeEntry, NodeSecrets, Role, encode_key,
};
use palisade_crypto::{SignatureService, dealer_keygen};
use palisade_node::{NodeRuntime, UserClient};
use palisade_store::FileStore;
use palisade_types::{NodeId, Timestamp, Username};

/// Palisade - a BFT replicated secret store with PAKE authentication.
#[derive(Parser)]
#[command(name = "palisade")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deal cluster keys and write the configuration files.
    Keygen {
        /// Directory to write palisade.toml and the node-<id>.toml files.
        dir: PathBuf,

        /// Total replicas.
        #[arg(long, default_value_t = 4)]
        n: usize,

        /// Tolerated Byzantine faults (n ≥ 3f + 1).
        #[arg(long, default_value_t = 1)]
        f: usize,

        /// First replica port; nodes take consecutive ports.
        #[arg(long, default_value_t = 7400)]
        base_port: u16,

        /// Host every node binds and advertises.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Start a replica.
    Replica {
        /// Directory holding palisade.toml and this node's secrets.
        dir: PathBuf,

        /// Replica id, 0..n.
        #[arg(long)]
        id: u8,
    },

    /// Start the gateway.
    Gateway {
        /// Directory holding palisade.toml and the gateway's secrets.
        dir: PathBuf,
    },

    /// Enroll a username against a running cluster.
    Enroll {
        /// Directory holding palisade.toml.
        dir: PathBuf,

        /// Username to enroll.
        username: String,

        /// Password; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,

        /// This user's node id; must be above the gateway's.
        #[arg(long, default_value_t = 100)]
        user_id: u8,
    },

    /// Log in and print the negotiated session key.
    Login {
        /// Directory holding palisade.toml.
        dir: PathBuf,

        /// Username to log in as.
        username: String,

        /// Password; prompted for when omitted.
        #[arg(long)]
        password: Option<String>,

        /// This user's node id; must be above the gateway's.
        #[arg(long, default_value_t = 100)]
        user_id: u8,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Keygen {
            dir,
            n,
            f,
            base_port,
            host,
        } => keygen(&dir, n, f, base_port, &host),
        Commands::Replica { dir, id } => run_replica(&dir, id),
        Commands::Gateway { dir } => run_gateway(&dir),
        Commands::Enroll {
            dir,
            username,
            password,
            user_id,
        } => enroll(&dir, &username, password, user_id),
        Commands::Login {
            dir,
            username,
            password,
            user_id,
        } => login(&dir, &username, password, user_id),
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("PALISADE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Acts as the trusted dealer: Ed25519 keypairs for every node, Shamir
/// shares of the threshold decryption key, and the cluster address book.
fn keygen(dir: &Path, n: usize, f: usize, base_port: u16, host: &str) -> Result<()> {
    if n < 3 * f + 1 {
        bail!("{n} replicas cannot tolerate {f} Byzantine faults (need n ≥ 3f + 1)");
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating output directory {}", dir.display()))?;

    let (group_public, shares) =
        dealer_keygen(n, 2 * f + 1).context("dealing threshold key shares")?;

    let mut nodes = Vec::new();
    for (i, share) in shares.into_iter().enumerate() {
        let id = NodeId::new(i as u8);
        let (seed, verifying) = SignatureService::generate_keypair();
        nodes.push(NodeEntry {
            id: id.as_u8(),
            role: Role::Replica,
            host: host.to_string(),
            port: base_port + i as u16,
            verifying_key: encode_key(&verifying),
        });
        NodeSecrets {
            id: id.as_u8(),
            signing_seed: encode_key(&seed),
            threshold_share: Some(encode_key(&share.to_bytes())),
        }
        .save(dir.join(NodeSecrets::filename(id)))?;
    }

    let gateway = NodeId::new(n as u8);
    let (seed, verifying) = SignatureService::generate_keypair();
    nodes.push(NodeEntry {
        id: gateway.as_u8(),
        role: Role::Gateway,
        host: host.to_string(),
        port: base_port + n as u16,
        verifying_key: encode_key(&verifying),
    });
    NodeSecrets {
        id: gateway.as_u8(),
        signing_seed: encode_key(&seed),
        threshold_share: None,
    }
    .save(dir.join(NodeSecrets::filename(gateway)))?;

    let config = ClusterConfig {
        cluster: ClusterSection {
            n,
            f,
            base_port,
            threshold_public_key: encode_key(&group_public),
        },
        nodes,
    };
    config.validate()?;
    config.save(dir.join("palisade.toml"))?;

    println!(
        "wrote palisade.toml and {} node key files to {}",
        n + 1,
        dir.display()
    );
    println!("replicas 0..{n} on ports {base_port}..{}, gateway on {}",
        base_port + n as u16 - 1,
        base_port + n as u16,
    );
    Ok(())
}

fn run_replica(dir: &Path, id: u8) -> Result<()> {
    let config = ClusterConfig::load(dir.join("palisade.toml"))?;
    if usize::from(id) >= config.cluster.n {
        bail!("replica id {id} outside 0..{}", config.cluster.n);
    }
    let secrets = NodeSecrets::load(dir.join(NodeSecrets::filename(NodeId::new(id))))?;
    let store = FileStore::open(dir.join(format!("replica-{id}-data")))?;

    let mut runtime = NodeRuntime::replica(&config, &secrets, Box::new(store))?;
    tracing::info!(id, addr = %runtime.local_addr(), "replica started");
    runtime.run()?;
    Ok(())
}

fn run_gateway(dir: &Path) -> Result<()> {
    let config = ClusterConfig::load(dir.join("palisade.toml"))?;
    let gateway = NodeId::new(config.cluster.n as u8);
    let secrets = NodeSecrets::load(dir.join(NodeSecrets::filename(gateway)))?;

    let mut runtime = NodeRuntime::gateway(&config, &secrets)?;
    tracing::info!(addr = %runtime.local_addr(), "gateway started");
    runtime.run()?;
    Ok(())
}

fn enroll(dir: &Path, username: &str, password: Option<String>, user_id: u8) -> Result<()> {
    let mut client = connect_user(dir, user_id)?;
    let password = password_or_prompt(password)?;
    let username = Username::from(username);

    client
        .enroll(&username, &password, request_timestamp())
        .context("enrollment failed")?;
    println!("enrolled {username}");
    Ok(())
}

fn login(dir: &Path, username: &str, password: Option<String>, user_id: u8) -> Result<()> {
    let mut client = connect_user(dir, user_id)?;
    let password = password_or_prompt(password)?;
    let username = Username::from(username);

    let session = client
        .login(&username, &password, request_timestamp())
        .context("login failed")?;
    println!("logged in as {username}");
    println!("session key: {}", encode_key(session.session_key()));
    Ok(())
}

fn connect_user(dir: &Path, user_id: u8) -> Result<UserClient> {
    let config = ClusterConfig::load(dir.join("palisade.toml"))?;
    let gateway = NodeId::new(config.cluster.n as u8);
    if user_id <= gateway.as_u8() {
        bail!("user id {user_id} collides with the cluster (must be above {gateway})");
    }

    let entry = config
        .node(gateway)
        .context("gateway missing from the address book")?;
    let addr = std::net::ToSocketAddrs::to_socket_addrs(&(entry.host.as_str(), entry.port))?
        .next()
        .with_context(|| format!("gateway address {}:{} did not resolve", entry.host, entry.port))?;

    UserClient::connect(NodeId::new(user_id), addr, Duration::from_secs(10))
        .context("connecting to the gateway")
}

fn password_or_prompt(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    print!("password: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Originator-chosen transaction timestamp; wall-clock nanos are unique
/// enough per user.
fn request_timestamp() -> Timestamp {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the UNIX epoch")
        .as_nanos() as u64;
    Timestamp::new(nanos)
}
