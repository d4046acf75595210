//! Command-line flags, matching the documented stable names and defaults.

use crate::transport::RequestOptions;
use crate::worker::WorkerConfig;
use clap::Parser;
use std::time::Duration;

fn parse_duration_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    Ok(Duration::from_secs_f64(secs))
}

/// swarmfetch: a high-concurrency HTTP crawler worker.
///
/// Reads URLs one per line on stdin, fetches each (optionally honoring
/// robots.txt and following redirects), and writes one JSON report per line
/// on stdout.
#[derive(Parser, Debug, Clone)]
#[command(name = "swarmfetch")]
pub struct Args {
    /// Max number of URLs fetched concurrently.
    #[arg(long, default_value_t = 1000)]
    pub jobs: u32,

    /// Max number of concurrent fetches per host.
    #[arg(long = "host-jobs", default_value_t = 1)]
    pub host_jobs: u32,

    /// Max redirects followed per URL.
    #[arg(long, default_value_t = 10)]
    pub redirects: u32,

    /// Skip the robots.txt check before fetching.
    #[arg(long = "skip-robots", default_value_t = false)]
    pub skip_robots: bool,

    /// Drop response bodies from reports (still counted in `length`).
    #[arg(long = "skip-body", default_value_t = false)]
    pub skip_body: bool,

    /// Timeout, in seconds, for DNS resolution plus TCP/TLS connect.
    #[arg(long = "connect-timeout", value_parser = parse_duration_secs, default_value = "15")]
    pub connect_timeout: Duration,

    /// Total timeout, in seconds, for one URL's entire fetch attempt.
    #[arg(long = "total-timeout", value_parser = parse_duration_secs, default_value = "60")]
    pub total_timeout: Duration,

    /// Per-socket read/write timeout, in seconds.
    #[arg(long = "io-timeout", value_parser = parse_duration_secs, default_value = "30")]
    pub io_timeout: Duration,

    /// How long an idle pooled connection may live, in seconds.
    #[arg(long = "keepalive-timeout", value_parser = parse_duration_secs, default_value = "120")]
    pub keepalive_timeout: Duration,

    /// Max bytes read per response (headers + body).
    #[arg(long = "read-limit", default_value_t = 10 * 1024 * 1024)]
    pub read_limit: u64,

    /// User-Agent header sent with every request; its first word is also
    /// the robots.txt agent name.
    #[arg(
        long = "user-agent",
        default_value = "SwarmfetchBot/1 (unknown_owner; +http://example.invalid/bot.html)"
    )]
    pub user_agent: String,

    /// `tracing` filter directive.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Skip TLS certificate and hostname verification.
    #[arg(long = "insecure-skip-verify", default_value_t = false)]
    pub insecure_skip_verify: bool,
}

impl Args {
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            connect_timeout: self.connect_timeout,
            read_timeout: self.io_timeout,
            write_timeout: self.io_timeout,
            read_limit: self.read_limit,
            keepalive_timeout: self.keepalive_timeout,
            insecure_skip_verify: self.insecure_skip_verify,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            host_concurrency: self.host_jobs,
            follow_redirects: self.redirects,
            skip_robots: self.skip_robots,
            skip_body: self.skip_body,
            user_agent: self.user_agent.clone(),
            request_options: self.request_options(),
            total_timeout: self.total_timeout,
        }
    }

    /// Parses `std::env::args()`, exiting the process with status 1 on any
    /// parse error (including `--help`), matching the documented contract.
    pub fn parse_or_exit() -> Self {
        match Args::try_parse() {
            Ok(args) => {
                if args.jobs == 0 {
                    eprintln!("error: --jobs must be nonzero");
                    std::process::exit(1);
                }
                args
            }
            Err(e) => {
                eprint!("{e}");
                std::process::exit(1);
            }
        }
    }
}
