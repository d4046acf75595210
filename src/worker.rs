//! Redirect following and robots.txt enforcement around a single fetch.

use crate::fetch::{self, FetchResult};
use crate::robots::{self, Policy};
use crate::semaphore::KeyedSemaphoreMap;
use crate::transport::{RequestOptions, Transport};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host_concurrency: u32,
    pub follow_redirects: u32,
    pub skip_robots: bool,
    pub skip_body: bool,
    pub user_agent: String,
    pub request_options: RequestOptions,
    pub total_timeout: Duration,
}

pub struct Worker {
    transport: Arc<Transport>,
    host_limits: Arc<KeyedSemaphoreMap>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(transport: Arc<Transport>, host_limits: Arc<KeyedSemaphoreMap>, config: WorkerConfig) -> Self {
        Self {
            transport,
            host_limits,
            config,
        }
    }

    pub fn host_limits(&self) -> &Arc<KeyedSemaphoreMap> {
        &self.host_limits
    }

    /// Runs the full redirect/robots pipeline for `url` and returns the
    /// final result, with `total_time` stamped for the whole chain.
    pub async fn process(&self, url: url::Url) -> FetchResult {
        let started = Instant::now();
        let mut current = url.clone();
        let mut last = FetchResult::error_result(
            url.clone(),
            "no attempts made".to_string(),
            Default::default(),
        );

        for _ in 0..=self.config.follow_redirects {
            if current.scheme().is_empty() || current.host_str().unwrap_or_default().is_empty() {
                last = FetchResult::error_result(
                    current.clone(),
                    format!("invalid url: {current}"),
                    Default::default(),
                );
                break;
            }

            let needs_robots_check = !self.config.skip_robots && current.path() != "/robots.txt";
            if needs_robots_check {
                if let Err(result) = self.ask_robots(&current).await {
                    last = result;
                    break;
                }
            }

            let result = self.download(current.clone()).await;

            if is_redirect_status(result.status_code) {
                match next_location(&result, &current) {
                    Ok(Some(next_url)) => {
                        last = result;
                        current = next_url;
                        continue;
                    }
                    Ok(None) => {
                        last = result;
                        break;
                    }
                    Err(_) => {
                        last = FetchResult::error_result(
                            url.clone(),
                            format!("could not parse redirect location from {current}"),
                            result.stat,
                        );
                        break;
                    }
                }
            }

            last = result;
            break;
        }

        last.total_time = started.elapsed();
        last
    }

    /// Acquires the per-host slot, performs one GET, releases the slot.
    async fn download(&self, url: url::Url) -> FetchResult {
        let host = url.host_str().unwrap_or_default().to_string();
        let _permit = self
            .host_limits
            .acquire(&host, self.config.host_concurrency)
            .await;

        let result = fetch::fetch(
            &self.transport,
            url,
            &self.config.user_agent,
            self.config.request_options.clone(),
            self.config.total_timeout,
            self.config.skip_body,
        )
        .await;

        self.transport
            .close_idle(self.config.request_options.keepalive_timeout, false)
            .await;

        result
    }

    /// Fetches `/robots.txt` for `url`'s origin (recursively re-entering
    /// this same pipeline) and checks whether `url`'s path is allowed.
    async fn ask_robots(&self, url: &url::Url) -> Result<(), FetchResult> {
        let robots_url = format!(
            "{}://{}/robots.txt",
            url.scheme(),
            url.host_str().unwrap_or_default()
        );
        let robots_url = match url::Url::parse(&robots_url) {
            Ok(u) => u,
            Err(e) => {
                return Err(FetchResult::error_result(
                    url.clone(),
                    format!("Robots download error: invalid robots url: {e}"),
                    Default::default(),
                ))
            }
        };

        let result = Box::pin(self.process(robots_url)).await;
        if !result.success {
            return Err(FetchResult::error_result(
                url.clone(),
                format!("Robots download error: {}", result.status),
                result.stat,
            ));
        }

        // Per the de facto robots.txt convention: a missing file means
        // everything is allowed, while an access-denied response means
        // nothing is. Only a server-side failure is a real download error.
        match result.status_code {
            404 | 410 => return Ok(()),
            401 | 403 => {
                return Err(FetchResult::error_result(
                    url.clone(),
                    "Robots disallow".to_string(),
                    result.stat,
                ))
            }
            code if code / 100 != 2 => {
                return Err(FetchResult::error_result(
                    url.clone(),
                    format!("Robots download error: status {code}"),
                    result.stat,
                ))
            }
            _ => {}
        }

        let agent = robots::agent_token(&self.config.user_agent);
        match robots::evaluate(&result.body, agent, url.path()) {
            Ok(Policy::Allow) => Ok(()),
            Ok(Policy::Disallow) => Err(FetchResult::error_result(
                url.clone(),
                "Robots disallow".to_string(),
                result.stat,
            )),
            Err(e) => Err(FetchResult::error_result(
                url.clone(),
                format!("Robots parse error: {e}"),
                result.stat,
            )),
        }
    }
}

fn is_redirect_status(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307)
}

fn next_location(result: &FetchResult, current: &url::Url) -> Result<Option<url::Url>, url::ParseError> {
    let Some(location) = result
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("location"))
        .and_then(|(_, v)| v.first())
    else {
        return Ok(None);
    };
    current.join(location).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_status_codes() {
        assert!(is_redirect_status(301));
        assert!(is_redirect_status(307));
        assert!(!is_redirect_status(200));
        assert!(!is_redirect_status(404));
    }

    #[test]
    fn location_resolved_relative_to_current() {
        let mut result = FetchResult::error_result(
            url::Url::parse("http://srv/a").unwrap(),
            "".into(),
            Default::default(),
        );
        result
            .headers
            .insert("Location".to_string(), vec!["/b".to_string()]);
        let current = url::Url::parse("http://srv/a").unwrap();
        let next = next_location(&result, &current).unwrap().unwrap();
        assert_eq!(next.as_str(), "http://srv/b");
    }
}
