use std::net::SocketAddr;
use std::sync::Arc;
use swarmfetch::cli::Args;
use swarmfetch::dns::Resolver;
use swarmfetch::pipeline::{self, PipelineConfig};
use swarmfetch::semaphore::KeyedSemaphoreMap;
use swarmfetch::transport::Transport;
use swarmfetch::worker::Worker;

const DEFAULT_NAMESERVER: &str = "8.8.8.8:53";
const DNS_CONCURRENCY: usize = 2;
const MAX_IDLE_CONNS_PER_HOST: i32 = 2;
const STATUS_EVERY: u64 = 200;

#[tokio::main]
async fn main() {
    let args = Args::parse_or_exit();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(args.log_level.clone()))
        .with_writer(std::io::stderr)
        .init();

    let nameserver: SocketAddr = DEFAULT_NAMESERVER.parse().expect("valid default nameserver");
    let resolver = Arc::new(Resolver::new(nameserver, DNS_CONCURRENCY));
    let transport = Arc::new(Transport::new(
        resolver,
        MAX_IDLE_CONNS_PER_HOST,
        args.insecure_skip_verify,
    ));
    let host_limits = Arc::new(KeyedSemaphoreMap::new());
    let worker = Arc::new(Worker::new(transport, host_limits, args.worker_config()));

    let pipeline_config = PipelineConfig {
        max_concurrency: args.jobs,
        status_every: STATUS_EVERY,
    };

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    if let Err(err) = pipeline::run(worker, pipeline_config, stdin, stdout).await {
        tracing::error!(%err, "pipeline exited with an error");
        std::process::exit(1);
    }
}
