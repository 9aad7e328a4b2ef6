//! Shared blocking HTTP plumbing for the network-backed sources.
//!
//! Handles retries with exponential backoff, status classification and the
//! circuit breaker. Each source owns one client; there is no timeout or
//! cancellation beyond the per-request timeout configured here.

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::circuit_breaker::CircuitBreaker;
use super::provider::SourceError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";

/// Longest server-requested wait honoured between retries.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// How a response status should be handled.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Success,
    /// Transient: count a failure and try again.
    Retry,
    /// Upstream refuses us: open the breaker and stop.
    Trip,
    /// Permanent for this run.
    Fail,
}

fn classify(status: StatusCode) -> Disposition {
    if status.is_success() {
        Disposition::Success
    } else if status == StatusCode::FORBIDDEN {
        Disposition::Trip
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Disposition::Retry
    } else {
        Disposition::Fail
    }
}

fn status_error(status: StatusCode, url: &str) -> SourceError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SourceError::AuthenticationRequired(format!("HTTP {status} from {url}"))
    } else if status.is_redirection() {
        SourceError::AuthenticationRequired(format!(
            "{url} redirected (HTTP {status}); the session has probably expired"
        ))
    } else {
        SourceError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }
    }
}

/// Blocking HTTP client with retry and circuit breaker logic.
pub struct HttpClient {
    client: Client,
    breaker: CircuitBreaker,
    max_retries: u32,
    base_delay: Duration,
}

impl HttpClient {
    /// Client that follows redirects.
    pub fn new() -> Result<Self, SourceError> {
        Self::build(true)
    }

    /// Client that treats any redirect as an expired session.
    pub fn without_redirects() -> Result<Self, SourceError> {
        Self::build(false)
    }

    fn build(follow_redirects: bool) -> Result<Self, SourceError> {
        let redirect = if follow_redirects {
            reqwest::redirect::Policy::default()
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .redirect(redirect)
            .build()
            .map_err(|e| SourceError::Client(e.to_string()))?;

        Ok(Self {
            client,
            breaker: CircuitBreaker::default_upstream(),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    /// GET `url` and decode a JSON body. `decorate` adds headers/query.
    pub fn get_json<T, F>(&self, url: &str, decorate: F) -> Result<T, SourceError>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let resp = self.execute(url, || decorate(self.client.get(url)))?;
        decode_json(url, resp)
    }

    /// POST a form to `url` and decode a JSON body.
    pub fn post_form_json<T>(&self, url: &str, form: &[(&str, &str)]) -> Result<T, SourceError>
    where
        T: DeserializeOwned,
    {
        let resp = self.execute(url, || self.client.post(url).form(form))?;
        decode_json(url, resp)
    }

    /// Send a request with retries. `request` rebuilds it for each attempt.
    pub fn execute<F>(&self, url: &str, request: F) -> Result<Response, SourceError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = None;
        let mut retry_after = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(retry_delay(self.base_delay, attempt, retry_after.take()));
            }

            if !self.breaker.is_allowed() {
                return Err(SourceError::CircuitOpen);
            }

            match request().send() {
                Ok(resp) => {
                    let status = resp.status();
                    match classify(status) {
                        Disposition::Success => {
                            self.breaker.record_success();
                            return Ok(resp);
                        }
                        Disposition::Trip => {
                            self.breaker.trip();
                            return Err(status_error(status, url));
                        }
                        Disposition::Retry => {
                            self.breaker.record_failure();
                            tracing::debug!(%url, %status, attempt, "retrying request");
                            last_error = Some(if status == StatusCode::TOO_MANY_REQUESTS {
                                let header_secs = resp
                                    .headers()
                                    .get(reqwest::header::RETRY_AFTER)
                                    .and_then(|v| v.to_str().ok())
                                    .and_then(|v| v.trim().parse::<u64>().ok());
                                retry_after = header_secs.map(Duration::from_secs);
                                SourceError::RateLimited {
                                    retry_after_secs: header_secs.unwrap_or(60),
                                }
                            } else {
                                status_error(status, url)
                            });
                        }
                        Disposition::Fail => return Err(status_error(status, url)),
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    self.breaker.record_failure();
                    tracing::debug!(%url, error = %e, attempt, "retrying request");
                    last_error = Some(SourceError::NetworkUnreachable(e.to_string()));
                }
                Err(e) => return Err(SourceError::NetworkUnreachable(e.to_string())),
            }
        }

        Err(last_error
            .unwrap_or_else(|| SourceError::NetworkUnreachable(format!("{url}: retries exhausted"))))
    }
}

/// Delay before retry number `attempt` (1-based). A server-supplied
/// `Retry-After` replaces the exponential backoff, capped at
/// [`MAX_RETRY_AFTER`].
fn retry_delay(base: Duration, attempt: u32, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(wait) => wait.min(MAX_RETRY_AFTER),
        None => base * 2u32.pow(attempt.saturating_sub(1)),
    }
}

fn decode_json<T: DeserializeOwned>(url: &str, resp: Response) -> Result<T, SourceError> {
    let body = resp
        .text()
        .map_err(|e| SourceError::NetworkUnreachable(format!("reading body of {url}: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| SourceError::ResponseFormatChanged(format!("unexpected payload from {url}: {e}")))
}
