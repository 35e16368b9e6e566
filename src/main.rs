//! Build a local cloud from CLI flags, hold it up until Ctrl-C, tear it
//! down.

use clap::Parser;
use slog::{error, info, o, Drain, Logger};
use std::path::PathBuf;

use cloudrunner::{build_cloud, ClusterConfig};

#[derive(Parser, Debug)]
#[command(name = "cloudrunner", about = "Launch and supervise a worker cloud")]
struct Args {
    /// Number of worker processes to launch
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// Path to the worker binary
    #[arg(long)]
    worker_bin: PathBuf,

    /// First port to assign (two consecutive ports per node)
    #[arg(long, default_value_t = 54321)]
    base_port: u16,

    /// Port shift for running several clouds on one host
    #[arg(long, default_value_t = 0)]
    port_offset: u16,

    /// Cloud name; defaults to a per-user, per-process unique name
    #[arg(long)]
    name: Option<String>,

    /// Worker heap ceiling in MB
    #[arg(long)]
    heap_mb: Option<u32>,

    /// Directory for node logs, the command log and scan markers
    #[arg(long, default_value = "sandbox")]
    sandbox_dir: PathBuf,

    /// Shuffle peer-list and launch order
    #[arg(long)]
    shuffle: bool,

    /// Stabilize against every node instead of just node 0
    #[arg(long)]
    conservative: bool,

    /// Also write a descriptor file so other runs can attach
    #[arg(long)]
    descriptor: Option<PathBuf>,
}

fn terminal_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build();
    let drain = std::sync::Mutex::new(drain).fuse();
    Logger::root(drain, o!())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let logger = terminal_logger();

    let mut config = ClusterConfig::local(args.nodes, args.worker_bin)
        .with_base_port(args.base_port)
        .with_port_offset(args.port_offset)
        .with_sandbox_dir(args.sandbox_dir)
        .with_shuffle(args.shuffle)
        .with_conservative(args.conservative);
    if let Some(name) = args.name {
        config = config.with_cluster_name(name);
    }
    if let Some(heap_mb) = args.heap_mb {
        config.heap_max_mb = Some(heap_mb);
    }

    let mut cluster = match build_cloud(&config, logger.clone()).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(logger, "cloud build failed"; "error" => %e);
            std::process::exit(1);
        }
    };

    info!(logger, "cloud is up";
        "cloud_name" => &cluster.name,
        "size" => cluster.size,
        "version" => &cluster.version,
        "control" => cluster.client().base_url());

    if let Some(path) = &args.descriptor {
        if let Err(e) = cluster.create_descriptor(path) {
            error!(logger, "could not write descriptor"; "error" => %e);
        } else {
            info!(logger, "descriptor written"; "path" => %path.display());
        }
    }

    info!(logger, "press Ctrl-C to tear the cloud down");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(logger, "could not listen for shutdown signal"; "error" => %e);
    }

    if let Err(e) = cluster.teardown().await {
        error!(logger, "teardown found problems"; "error" => %e);
        std::process::exit(1);
    }
    info!(logger, "done");
}
