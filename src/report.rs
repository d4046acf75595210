//! Serializes a [`FetchResult`] into the stable JSON report line written to
//! stdout, with the documented recovery path when serialization itself
//! fails.

use crate::fetch::FetchResult;
use base64::Engine;
use serde::Serialize;
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Serialize)]
pub struct Report {
    pub key: String,
    pub url: String,
    pub success: bool,
    pub status: String,
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub content: String,
    pub length: u64,
    pub cached: bool,
    pub fetch_time: u64,
    pub total_time: u64,
    pub address: Option<String>,
    pub started: String,
    pub connection_age: u64,
    pub connection_use: u32,
    pub resolve_time: u64,
    pub connect_time: u64,
    pub write_time: u64,
    pub read_header_time: u64,
    pub read_body_time: u64,
}

impl Report {
    pub fn from_result(result: &FetchResult, started: SystemTime) -> Self {
        Self {
            key: result.url.to_string(),
            url: result.url.to_string(),
            success: result.success,
            status: result.status.clone(),
            status_code: result.status_code,
            headers: result.headers.clone(),
            content: base64::engine::general_purpose::STANDARD.encode(&result.body),
            length: result.length,
            cached: false,
            fetch_time: result.fetch_time.as_millis() as u64,
            total_time: result.total_time.as_millis() as u64,
            address: result.stat.remote_addr.map(|a| a.to_string()),
            started: format_rfc3339(started),
            connection_age: result.stat.connection_age.as_millis() as u64,
            connection_use: result.stat.connection_use,
            resolve_time: result.stat.resolve_time.as_millis() as u64,
            connect_time: result.stat.connect_time.as_millis() as u64,
            write_time: result.stat.write_time.as_millis() as u64,
            read_header_time: result.stat.read_header_time.as_millis() as u64,
            read_body_time: result.stat.read_body_time.as_millis() as u64,
        }
    }
}

fn format_rfc3339(time: SystemTime) -> String {
    time::OffsetDateTime::from(time)
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Serializes `result` to a single JSON line. On primary encode failure,
/// tries once more with an empty body and a failure status; if that also
/// fails, returns `None` and the line is dropped.
pub fn encode_line(result: &FetchResult, started: SystemTime) -> Option<String> {
    let report = Report::from_result(result, started);
    match serde_json::to_string(&report) {
        Ok(line) => Some(line),
        Err(err) => {
            tracing::error!(%err, url = %result.url, "report encode failed, retrying with empty body");
            let mut recovery = report;
            recovery.content = String::new();
            recovery.success = false;
            recovery.status_code = 0;
            recovery.status = err.to_string();
            match serde_json::to_string(&recovery) {
                Ok(line) => Some(line),
                Err(err2) => {
                    tracing::error!(%err2, url = %result.url, "report recovery encode failed, dropping line");
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn encodes_successful_result() {
        let mut result = FetchResult::error_result(
            url::Url::parse("http://example.com/").unwrap(),
            "OK".to_string(),
            Default::default(),
        );
        result.success = true;
        result.status_code = 200;
        result.body = b"hello".to_vec();
        result.length = 5;
        result.fetch_time = Duration::from_millis(12);

        let line = encode_line(&result, SystemTime::UNIX_EPOCH).expect("encodes");
        assert!(line.contains("\"status_code\":200"));
        assert!(line.contains("\"content\":\"aGVsbG8=\""));
        assert!(line.contains("\"fetch_time\":12"));
    }
}
