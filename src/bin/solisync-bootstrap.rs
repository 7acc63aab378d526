use clap::Parser;
use solisync::cluster::{AuthScheme, ClusterNode, NodeId, DEFAULT_PORT};
use solisync::rpc::auth::{generate_secret, write_shared_secret};
use solisync::rpc::{AuthContext, RemoteSyncClient};
use solisync::sync::manager::unsync_keys;
use solisync::sync::{SYSTEM_NODE_STORE, SYSTEM_UNSYNC_STORE};
use solisync::{SyncError, SyncResult};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "solisync-bootstrap")]
#[command(about = "Inspect and configure cluster membership of a solisync node", long_about = None)]
struct Args {
    /// Node to talk to
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Node-to-node port of that node
    #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Authentication scheme used to connect
    #[arg(long, default_value = "NO_AUTH")]
    auth_scheme: AuthScheme,

    /// Key store holding the shared secret
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Key store password
    #[arg(long)]
    keystore_password: Option<String>,

    /// Create a new key store with a random secret and exit
    #[arg(long)]
    write_keystore: bool,

    /// Seeds to bootstrap from (comma separated host:port, empty for a new cluster)
    #[arg(long)]
    seeds: Option<String>,

    /// Domain the node should belong to
    #[arg(long)]
    local_node_domain: Option<i16>,

    /// Port the node should announce
    #[arg(long)]
    local_node_port: Option<u16>,

    /// Interface whose address the node should announce
    #[arg(long)]
    local_node_iface: Option<String>,

    /// Hostname the node should announce
    #[arg(long)]
    local_node_host: Option<String>,

    /// Store the given authentication settings on the node
    #[arg(long)]
    set_auth: bool,

    /// Bootstrap the node again, keeping its id
    #[arg(long)]
    reseed: bool,

    /// Remove a node from the cluster
    #[arg(long)]
    delete: Option<NodeId>,

    /// List cluster nodes
    #[arg(long)]
    list: bool,

    /// Print the domain leader
    #[arg(long)]
    leader: bool,

    /// Start a new domain election
    #[arg(long)]
    new_election: bool,

    /// Make the contacted node win the election
    #[arg(long, requires = "new_election")]
    rigged: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "solisync=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(args: Args) -> SyncResult<()> {
    if args.write_keystore {
        let path = args
            .keystore
            .as_deref()
            .ok_or_else(|| SyncError::Config("--write-keystore requires --keystore".to_string()))?;
        write_shared_secret(
            path,
            args.keystore_password.as_deref().unwrap_or(""),
            &generate_secret(),
        )?;
        println!("Wrote key store {}", path.display());
        return Ok(());
    }

    let auth = AuthContext::from_settings(
        args.auth_scheme,
        args.keystore.as_deref(),
        args.keystore_password.as_deref(),
    )?;
    let addr = format!("{}:{}", args.host, args.port);
    let mut client = RemoteSyncClient::connect(&addr, auth).await?;

    {
        let mut unsync = client.store::<String, String>(SYSTEM_UNSYNC_STORE);
        if args.set_auth {
            unsync
                .put(&unsync_keys::AUTH_SCHEME.to_string(), &args.auth_scheme.to_string())
                .await?;
            if let Some(path) = &args.keystore {
                unsync
                    .put(&unsync_keys::KEYSTORE_PATH.to_string(), &path.display().to_string())
                    .await?;
            }
            if let Some(password) = &args.keystore_password {
                unsync
                    .put(&unsync_keys::KEYSTORE_PASSWORD.to_string(), password)
                    .await?;
            }
        }
        if let Some(domain) = args.local_node_domain {
            unsync
                .put(&unsync_keys::LOCAL_DOMAIN_ID.to_string(), &domain.to_string())
                .await?;
        }
        if let Some(port) = args.local_node_port {
            unsync
                .put(&unsync_keys::LOCAL_NODE_PORT.to_string(), &port.to_string())
                .await?;
        }
        if let Some(iface) = &args.local_node_iface {
            unsync
                .put(&unsync_keys::LOCAL_NODE_IFACE.to_string(), iface)
                .await?;
        }
        if let Some(host) = &args.local_node_host {
            unsync
                .put(&unsync_keys::LOCAL_NODE_HOSTNAME.to_string(), host)
                .await?;
        }
        if let Some(seeds) = &args.seeds {
            let seeds = solisync::cluster::node::parse_seeds(seeds)?.join(",");
            unsync.put(&unsync_keys::SEEDS.to_string(), &seeds).await?;
        }
    }

    let info = client.cluster_info().await?;
    let local = Some(info.local_node_id).filter(|id| solisync::cluster::node::is_assigned(*id));

    if args.reseed {
        let node_id = local.ok_or_else(|| {
            SyncError::Config("Node has not joined a cluster, nothing to reseed".to_string())
        })?;
        client
            .store::<String, String>(SYSTEM_UNSYNC_STORE)
            .put(&unsync_keys::LOCAL_DOMAIN_ID.to_string(), &node_id.to_string())
            .await?;
        client
            .store::<NodeId, ClusterNode>(SYSTEM_NODE_STORE)
            .delete(&node_id)
            .await?;
        println!("Node {} will bootstrap again", node_id);
    }

    if let Some(node_id) = args.delete {
        if local == Some(node_id) {
            return Err(SyncError::DeleteLocalNode(node_id));
        }
        client
            .store::<NodeId, ClusterNode>(SYSTEM_NODE_STORE)
            .delete(&node_id)
            .await?;
        println!("Deleted node {}", node_id);
    }

    if args.new_election {
        client.new_election(args.rigged).await?;
        println!("Election started{}", if args.rigged { " (rigged)" } else { "" });
    }

    if args.list {
        let nodes = client
            .store::<NodeId, ClusterNode>(SYSTEM_NODE_STORE)
            .entries()
            .await?;
        println!("{:>6}  {:>6}  {:<30}  {}", "ID", "DOMAIN", "ADDRESS", "STATUS");
        for (node_id, node) in nodes {
            let Some(node) = node.into_value() else {
                continue;
            };
            let status = if Some(node_id) == local {
                "local"
            } else if info.connected.contains(&node_id) {
                "connected"
            } else {
                "disconnected"
            };
            let marker = if info.domain_leader == Some(node_id) { " (leader)" } else { "" };
            println!(
                "{:>6}  {:>6}  {:<30}  {}{}",
                node.node_id,
                node.domain_id,
                node.address(),
                status,
                marker
            );
        }
    }

    if args.leader {
        match info.domain_leader {
            Some(leader) => println!("{}", leader),
            None => println!("No leader elected"),
        }
    }

    client.close();
    Ok(())
}
