//! Wires stdin -> worker fan-out -> stdout together, with a global
//! concurrency gate and a graceful-shutdown path on SIGINT.

use crate::fetch::FetchResult;
use crate::report;
use crate::semaphore::KeyedSemaphoreMap;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};

pub struct PipelineConfig {
    pub max_concurrency: u32,
    pub status_every: u64,
}

struct ReportItem {
    result: FetchResult,
    started: SystemTime,
}

/// Drives the pipeline to completion: reads `input` line by line, dispatches
/// fetches gated by `config.max_concurrency`, and writes one JSON report per
/// line to `output`. Returns once stdin is exhausted (or a shutdown signal
/// has fired) and every dispatched fetch has reported.
pub async fn run<R, W>(
    worker: Arc<Worker>,
    config: PipelineConfig,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (report_tx, mut report_rx) = mpsc::channel::<ReportItem>(config.max_concurrency as usize);
    let dispatch_gate = Arc::new(Semaphore::new(config.max_concurrency as usize));
    let shutdown = Arc::new(tokio::sync::Notify::new());

    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("received interrupt, draining in-flight fetches");
            shutdown_for_signal.notify_waiters();
        }
    });

    let reader_handle = {
        let worker = worker.clone();
        let gate = dispatch_gate.clone();
        let tx = report_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            read_and_dispatch(input, worker, gate, tx, shutdown).await;
        })
    };
    drop(report_tx);

    let mut processed: u64 = 0;
    while let Some(item) = report_rx.recv().await {
        if let Some(line) = report::encode_line(&item.result, item.started) {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
        }
        processed += 1;
        if config.status_every != 0 && processed % config.status_every == 0 {
            let (hosts, holders) = worker.host_limits().size().await;
            tracing::info!(processed, open_hosts = hosts, holders, "status");
        }
    }

    output.flush().await?;
    let _ = reader_handle.await;
    Ok(())
}

async fn read_and_dispatch<R>(
    input: R,
    worker: Arc<Worker>,
    gate: Arc<Semaphore>,
    tx: mpsc::Sender<ReportItem>,
    shutdown: Arc<tokio::sync::Notify>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            line = lines.next_line() => line,
        };

        let Ok(Some(line)) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let url = match url::Url::parse(line) {
            Ok(u) if !u.scheme().is_empty() && u.host_str().is_some() => u,
            _ => {
                let result = FetchResult::error_result(
                    url::Url::parse("about:invalid").unwrap(),
                    format!("invalid url: {line:?}"),
                    Default::default(),
                );
                let _ = tx
                    .send(ReportItem {
                        result,
                        started: SystemTime::now(),
                    })
                    .await;
                continue;
            }
        };

        let permit = match gate.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let worker = worker.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let started = SystemTime::now();
            let result = worker.process(url).await;
            let _ = tx.send(ReportItem { result, started }).await;
            drop(permit);
        });
    }

    drop(tx);
    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_item_carries_wallclock_start() {
        let item = ReportItem {
            result: FetchResult::error_result(
                url::Url::parse("http://x/").unwrap(),
                "x".into(),
                Default::default(),
            ),
            started: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(item.started, SystemTime::UNIX_EPOCH);
    }
}
