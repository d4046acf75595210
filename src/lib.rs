//! swarmfetch - a high-concurrency HTTP crawler worker.
//!
//! Reads URLs on stdin, fetches each one through a hand-rolled,
//! connection-pooled HTTP/1.1 transport with per-socket timeouts, and writes
//! a structured JSON report per URL on stdout. Concurrency is capped both
//! globally and per host; redirects are followed up to a configurable
//! bound, and `robots.txt` is consulted before each fetch unless disabled.
//!
//! # Architecture
//!
//! ```text
//! stdin lines -> pipeline::run -> worker::Worker::process (per URL)
//!                                     |-- robots::evaluate (via worker::ask_robots)
//!                                     `-- fetch::fetch -> transport::Transport
//!                                                              |-- dns::Resolver
//!                                                              `-- semaphore::KeyedSemaphoreMap (per host)
//! ```
pub mod cache;
pub mod cli;
pub mod connection;
pub mod dns;
pub mod errors;
pub mod fetch;
pub mod pipeline;
pub mod report;
pub mod robots;
pub mod semaphore;
pub mod transport;
pub mod worker;
