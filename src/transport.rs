use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use tracing::{debug, warn};

use crate::domain::{Credentials, NetworkProxy, RemoteRepository};
use crate::error::ProxyError;

/// Wire-level client used to reach remote repositories.
pub trait TransportClient: Send + Sync {
    fn connect(
        &self,
        target: &RemoteRepository,
        credentials: Option<&Credentials>,
        proxy: Option<&NetworkProxy>,
    ) -> Result<Box<dyn TransportSession>, ProxyError>;
}

/// An open connection to one remote repository.
///
/// `fetch` reports a missing resource as `ProxyError::NotFound`;
/// `fetch_if_newer` additionally reports `ProxyError::NotModified`.
pub trait TransportSession {
    fn fetch(&mut self, remote_path: &str, destination: &Path) -> Result<(), ProxyError>;

    fn fetch_if_newer(
        &mut self,
        remote_path: &str,
        destination: &Path,
        since: SystemTime,
    ) -> Result<(), ProxyError>;

    fn disconnect(&mut self);
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl TransportClient for HttpTransport {
    fn connect(
        &self,
        target: &RemoteRepository,
        credentials: Option<&Credentials>,
        proxy: Option<&NetworkProxy>,
    ) -> Result<Box<dyn TransportSession>, ProxyError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("artifact-proxy/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ProxyError::transfer(&target.url, err))?,
        );

        let mut builder = Client::builder()
            .default_headers(headers)
            .connect_timeout(target.timeout)
            .timeout(target.timeout);

        if let Some(proxy) = proxy {
            let mut http_proxy = reqwest::Proxy::all(proxy.url())
                .map_err(|err| ProxyError::transfer(&target.url, err))?;
            if let Some(creds) = &proxy.credentials {
                if proxy.use_ntlm {
                    warn!(proxy = %proxy.id, "NTLM proxy authentication unsupported, using basic");
                }
                http_proxy = http_proxy.basic_auth(&creds.username, &creds.password);
            }
            builder = builder.proxy(http_proxy);
        }

        let client = builder
            .build()
            .map_err(|err| ProxyError::transfer(&target.url, err))?;
        debug!(remote = %target.id, url = %target.url, "connected");

        Ok(Box::new(HttpSession {
            client,
            target: target.clone(),
            credentials: credentials.cloned(),
        }))
    }
}

struct HttpSession {
    client: Client,
    target: RemoteRepository,
    credentials: Option<Credentials>,
}

impl HttpSession {
    fn request(&self, url: &str) -> RequestBuilder {
        let request = self.client.get(url);
        match &self.credentials {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }

    fn write_response_to_file(
        url: &str,
        mut response: Response,
        destination: &Path,
    ) -> Result<(), ProxyError> {
        let mut file = File::create(destination)
            .map_err(|err| ProxyError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file).map_err(|err| ProxyError::transfer(url, err))?;
        Ok(())
    }

    fn send_with_retries<F>(&self, url: &str, mut make_req: F) -> Result<Response, ProxyError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let budget = self.target.timeout;
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            // Every retry shares the target's timeout.
            let remaining = budget.saturating_sub(started.elapsed());
            let response = make_req().timeout(remaining).send();
            let retry = match &response {
                Ok(resp) => is_retryable_status(resp.status().as_u16()),
                Err(err) => is_retryable_error(err),
            };
            if retry && let Some(delay) = retry_delay(attempt, started.elapsed(), budget) {
                debug!(url, attempt, "retrying request");
                thread::sleep(delay);
                attempt += 1;
                continue;
            }
            return response.map_err(|err| ProxyError::transfer(url, err));
        }
    }

    fn handle_status(url: &str, response: Response) -> Result<Response, ProxyError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(ProxyError::NotFound(url.to_string())),
            StatusCode::NOT_MODIFIED => Err(ProxyError::NotModified(url.to_string())),
            status => {
                let message = response
                    .text()
                    .ok()
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| "remote request failed".to_string());
                Err(ProxyError::transfer(
                    url,
                    format!("status {}: {message}", status.as_u16()),
                ))
            }
        }
    }
}

impl TransportSession for HttpSession {
    fn fetch(&mut self, remote_path: &str, destination: &Path) -> Result<(), ProxyError> {
        let url = self.target.url_for(remote_path);
        let response = self.send_with_retries(&url, || self.request(&url))?;
        let response = Self::handle_status(&url, response)?;
        Self::write_response_to_file(&url, response, destination)
    }

    fn fetch_if_newer(
        &mut self,
        remote_path: &str,
        destination: &Path,
        since: SystemTime,
    ) -> Result<(), ProxyError> {
        let url = self.target.url_for(remote_path);
        let since_header = http_date(since);
        let response = self.send_with_retries(&url, || {
            self.request(&url)
                .header(IF_MODIFIED_SINCE, since_header.as_str())
        })?;
        let response = Self::handle_status(&url, response)?;

        // some servers ignore If-Modified-Since; fall back to Last-Modified
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);
        if let Some(remote) = last_modified {
            if remote <= DateTime::<Utc>::from(since).timestamp() {
                return Err(ProxyError::NotModified(url));
            }
        }
        Self::write_response_to_file(&url, response, destination)
    }

    fn disconnect(&mut self) {
        debug!(remote = %self.target.id, "disconnected");
    }
}

fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.timestamp())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Timeouts are not retried: the time budget is already spent.
fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() && !err.is_timeout()
}

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Backoff before the next retry, or `None` once retries or the time budget run out.
fn retry_delay(attempt: usize, elapsed: Duration, budget: Duration) -> Option<Duration> {
    if attempt >= MAX_RETRIES {
        return None;
    }
    let delay = Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1));
    (elapsed + delay < budget).then_some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_dates_round_trip_to_the_second() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let header = http_date(time);
        assert_eq!(header, "Tue, 14 Nov 2023 22:13:20 GMT");
        assert_eq!(parse_http_date(&header), Some(1_700_000_000));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn retries_stay_within_the_timeout() {
        let budget = Duration::from_secs(5);
        assert_eq!(
            retry_delay(0, Duration::ZERO, budget),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            retry_delay(2, Duration::from_secs(1), budget),
            Some(Duration::from_millis(600))
        );
        assert_eq!(retry_delay(3, Duration::ZERO, budget), None);
        assert_eq!(retry_delay(0, Duration::from_millis(4900), budget), None);
        assert_eq!(retry_delay(0, Duration::ZERO, Duration::from_millis(100)), None);
    }
}
