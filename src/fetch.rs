//! The fetch orchestrator: one GET request/response cycle against the
//! transport, racing a total-timeout deadline.

use crate::errors::FetchError;
use crate::transport::{ConnectMethod, RequestOptions, RequestStat, Transport};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: url::Url,
    pub success: bool,
    pub status: String,
    pub status_code: u16,
    pub headers: std::collections::HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub length: u64,
    pub fetch_time: Duration,
    pub total_time: Duration,
    pub stat: RequestStat,
}

impl FetchResult {
    pub fn error_result(url: url::Url, status: impl Into<String>, stat: RequestStat) -> Self {
        Self {
            url,
            success: false,
            status: status.into(),
            status_code: 0,
            headers: Default::default(),
            body: Vec::new(),
            length: 0,
            fetch_time: Duration::ZERO,
            total_time: Duration::ZERO,
            stat,
        }
    }
}

/// Fetches `url` via GET, enforcing `total_timeout` across the whole attempt
/// (connect + write + read). On timeout the in-flight connection is dropped,
/// which unblocks whichever I/O step was pending.
pub async fn fetch(
    transport: &Transport,
    url: url::Url,
    user_agent: &str,
    options: RequestOptions,
    total_timeout: Duration,
    skip_body: bool,
) -> FetchResult {
    let started = Instant::now();
    let mut stat = RequestStat::default();

    let inner = run_fetch(transport, &url, user_agent, &options, skip_body, &mut stat);

    let result = if total_timeout.is_zero() {
        inner.await
    } else {
        match tokio::time::timeout(total_timeout, inner).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout(total_timeout)),
        }
    };

    stat.total_time = started.elapsed();
    let fetch_time = stat.total_time;

    match result {
        Ok((status_code, status_text, headers, body)) => FetchResult {
            url,
            success: true,
            status: status_text,
            status_code,
            length: body.len() as u64,
            body: if skip_body { Vec::new() } else { body },
            fetch_time,
            total_time: stat.total_time,
            headers,
            stat,
        },
        Err(err) => {
            let mut result = FetchResult::error_result(url, err.to_string(), stat.clone());
            result.fetch_time = fetch_time;
            result.total_time = stat.total_time;
            result
        }
    }
}

#[allow(clippy::type_complexity)]
async fn run_fetch(
    transport: &Transport,
    url: &url::Url,
    user_agent: &str,
    options: &RequestOptions,
    skip_body: bool,
    stat: &mut RequestStat,
) -> Result<
    (
        u16,
        String,
        std::collections::HashMap<String, Vec<String>>,
        Vec<u8>,
    ),
    FetchError,
> {
    let method = ConnectMethod::from_url(url).map_err(FetchError::Transport)?;
    let mut conn = transport
        .get_conn(&method, options, stat)
        .await
        .map_err(FetchError::Transport)?;

    let request_bytes = build_get_request(url, user_agent);
    let write_start = Instant::now();
    let write_result = conn.write_request(&request_bytes, options).await;
    stat.write_time = write_start.elapsed();
    write_result.map_err(FetchError::Transport)?;

    let response = match conn.read_response(options).await {
        Ok(r) => r,
        Err(e) => return Err(FetchError::Transport(e)),
    };
    stat.read_header_time = response.header_time;
    stat.read_body_time = response.body_time;

    if !response.close_requested {
        transport.put_idle(conn).await;
    }

    let body = if skip_body {
        Vec::new()
    } else {
        response.body
    };
    Ok((response.status_code, response.status_text, response.headers, body))
}

fn build_get_request(url: &url::Url, user_agent: &str) -> Vec<u8> {
    let path = if url.query().is_some() {
        format!("{}?{}", url.path(), url.query().unwrap())
    } else {
        url.path().to_string()
    };
    let host = match url.port() {
        Some(p) => format!("{}:{p}", url.host_str().unwrap_or_default()),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         User-Agent: {user_agent}\r\n\
         Accept: */*\r\n\
         Accept-Encoding: identity\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_includes_query() {
        let url = url::Url::parse("http://example.com/path?x=1").unwrap();
        let req = build_get_request(&url, "TestAgent/1");
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("User-Agent: TestAgent/1\r\n"));
    }
}
