//! A small hand-rolled DNS resolver.
//!
//! Queries A and AAAA records directly over UDP (falling back to TCP when a
//! response is truncated), behind a single process-wide concurrency
//! semaphore so a burst of cold connections does not hammer the configured
//! nameserver. Retries use an exponential backoff starting at one second,
//! bounded by a total time budget.

use rand::Rng;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// A single query attempt's failure, distinguishing errors worth retrying
/// (socket/timeout noise) from a definitive server answer that retrying
/// cannot change (a non-success rcode such as NXDOMAIN).
enum QueryError {
    Temporary(String),
    Permanent(String),
}

/// Shared resolver state: the concurrency gate and retry/timeout policy.
pub struct Resolver {
    nameserver: std::net::SocketAddr,
    limiter: Semaphore,
    per_step_timeout: Duration,
    total_budget: Duration,
}

impl Resolver {
    pub fn new(nameserver: std::net::SocketAddr, concurrency: usize) -> Self {
        Self {
            nameserver,
            limiter: Semaphore::new(concurrency.max(1)),
            per_step_timeout: Duration::from_secs(2),
            total_budget: Duration::from_secs(20),
        }
    }

    pub fn with_timeouts(mut self, per_step: Duration, total_budget: Duration) -> Self {
        self.per_step_timeout = per_step;
        self.total_budget = total_budget;
        self
    }

    /// Resolves `name` to its A and AAAA addresses, in that order.
    pub async fn resolve(&self, name: &str) -> Result<(Vec<IpAddr>, Duration), String> {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok((vec![ip], Duration::ZERO));
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| "dns semaphore closed".to_string())?;

        let start = Instant::now();
        let mut addrs = Vec::new();

        for qtype in [QTYPE_A, QTYPE_AAAA] {
            match self.query_with_retry(name, qtype, start).await {
                Ok(mut found) => addrs.append(&mut found),
                Err(err) => {
                    if addrs.is_empty() && qtype == QTYPE_AAAA {
                        return Err(err);
                    }
                    tracing::debug!(name, qtype, %err, "dns query failed");
                }
            }
        }

        if addrs.is_empty() {
            return Err(format!("no addresses found for {name}"));
        }
        Ok((addrs, start.elapsed()))
    }

    async fn query_with_retry(
        &self,
        name: &str,
        qtype: u16,
        overall_start: Instant,
    ) -> Result<Vec<IpAddr>, String> {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.query_once(name, qtype).await {
                Ok(addrs) => return Ok(addrs),
                Err(QueryError::Permanent(err)) => return Err(err),
                Err(QueryError::Temporary(err)) => {
                    if overall_start.elapsed() + backoff >= self.total_budget {
                        return Err(format!("dns retry budget exhausted: {err}"));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn query_once(&self, name: &str, qtype: u16) -> Result<Vec<IpAddr>, QueryError> {
        let txn_id = rand::thread_rng().gen::<u16>();
        let query = build_query(txn_id, name, qtype);

        let local_bind = if self.nameserver.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(local_bind)
            .await
            .map_err(|e| QueryError::Temporary(format!("udp bind failed: {e}")))?;
        socket
            .connect(self.nameserver)
            .await
            .map_err(|e| QueryError::Temporary(format!("udp connect failed: {e}")))?;

        tokio::time::timeout(self.per_step_timeout, socket.send(&query))
            .await
            .map_err(|_| QueryError::Temporary("dns send timed out".to_string()))?
            .map_err(|e| QueryError::Temporary(format!("dns send failed: {e}")))?;

        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(self.per_step_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| QueryError::Temporary("dns recv timed out".to_string()))?
            .map_err(|e| QueryError::Temporary(format!("dns recv failed: {e}")))?;

        let message = &buf[..n];
        if is_truncated(message) {
            return self.query_over_tcp(&query, txn_id).await;
        }
        parse_response(message, txn_id)
    }

    async fn query_over_tcp(
        &self,
        udp_query: &[u8],
        txn_id: u16,
    ) -> Result<Vec<IpAddr>, QueryError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let mut stream = tokio::time::timeout(
            self.per_step_timeout,
            TcpStream::connect(self.nameserver),
        )
        .await
        .map_err(|_| QueryError::Temporary("dns tcp connect timed out".to_string()))?
        .map_err(|e| QueryError::Temporary(format!("dns tcp connect failed: {e}")))?;

        let len = (udp_query.len() as u16).to_be_bytes();
        stream
            .write_all(&len)
            .await
            .map_err(|e| QueryError::Temporary(format!("dns tcp write failed: {e}")))?;
        stream
            .write_all(udp_query)
            .await
            .map_err(|e| QueryError::Temporary(format!("dns tcp write failed: {e}")))?;

        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| QueryError::Temporary(format!("dns tcp read failed: {e}")))?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut resp = vec![0u8; resp_len];
        stream
            .read_exact(&mut resp)
            .await
            .map_err(|e| QueryError::Temporary(format!("dns tcp read failed: {e}")))?;

        parse_response(&resp, txn_id)
    }
}

fn is_truncated(message: &[u8]) -> bool {
    message.len() >= 4 && message[2] & 0x02 != 0
}

fn build_query(txn_id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&txn_id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // flags: recursion desired
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
    buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
    buf.extend_from_slice(&0u16.to_be_bytes()); // arcount

    for label in name.trim_end_matches('.').split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
    buf
}

fn parse_response(message: &[u8], expected_txn_id: u16) -> Result<Vec<IpAddr>, QueryError> {
    if message.len() < 12 {
        return Err(QueryError::Temporary("dns response too short".to_string()));
    }
    let txn_id = u16::from_be_bytes([message[0], message[1]]);
    if txn_id != expected_txn_id {
        return Err(QueryError::Temporary("dns transaction id mismatch".to_string()));
    }
    let flags = u16::from_be_bytes([message[2], message[3]]);
    let rcode = flags & 0x000f;
    if rcode != 0 {
        // A definitive answer from the server (NXDOMAIN and friends); no
        // amount of retrying changes this, so it is not temporary.
        return Err(QueryError::Permanent(format!("dns rcode {rcode}")));
    }

    let qdcount = u16::from_be_bytes([message[4], message[5]]) as usize;
    let ancount = u16::from_be_bytes([message[6], message[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(message, pos)?;
        pos += 4; // qtype + qclass
    }

    let mut addrs = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(message, pos)?;
        if pos + 10 > message.len() {
            return Err(QueryError::Temporary("dns answer truncated".to_string()));
        }
        let rtype = u16::from_be_bytes([message[pos], message[pos + 1]]);
        let rdlength = u16::from_be_bytes([message[pos + 8], message[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > message.len() {
            return Err(QueryError::Temporary("dns rdata truncated".to_string()));
        }
        let rdata = &message[pos..pos + rdlength];
        match (rtype, rdlength) {
            (t, 4) if t == QTYPE_A => {
                addrs.push(IpAddr::from([rdata[0], rdata[1], rdata[2], rdata[3]]));
            }
            (t, 16) if t == QTYPE_AAAA => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::from(octets));
            }
            _ => {}
        }
        pos += rdlength;
    }
    Ok(addrs)
}

fn skip_name(message: &[u8], mut pos: usize) -> Result<usize, QueryError> {
    loop {
        if pos >= message.len() {
            return Err(QueryError::Temporary(
                "dns name ran past end of message".to_string(),
            ));
        }
        let len = message[pos];
        if len & 0xc0 == 0xc0 {
            // compression pointer: two bytes, does not recurse further here
            return Ok(pos + 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos += 1 + len as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_well_formed_query() {
        let q = build_query(0x1234, "example.com", QTYPE_A);
        assert_eq!(&q[0..2], &[0x12, 0x34]);
        assert_eq!(&q[4..6], &1u16.to_be_bytes());
    }

    #[test]
    fn literal_ip_short_circuits() {
        assert!("127.0.0.1".parse::<IpAddr>().is_ok());
    }
}
