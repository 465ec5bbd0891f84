use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProbeSection;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid probe url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
    #[error("probe request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("failed to build probe client: {0}")]
    Client(reqwest::Error),
}

/// Result of a pre-flight reachability check against the source URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub status: Option<u16>,
    pub detail: Option<String>,
}

impl ProbeOutcome {
    pub fn reachable(status: u16) -> Self {
        Self {
            reachable: true,
            status: Some(status),
            detail: None,
        }
    }

    pub fn unreachable(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            status,
            detail: Some(detail.into()),
        }
    }
}

/// Pre-flight check run before any browser resources are allocated.
#[async_trait]
pub trait ConnectivityValidator: Send + Sync {
    async fn validate(&self, url: &str) -> ProbeResult<ProbeOutcome>;
}

/// HEAD-probes the source URL. Gateway-timeout class responses (the origin
/// is slow, not gone) get one retry with a longer timeout before the URL is
/// declared unreachable.
#[derive(Debug, Clone)]
pub struct HttpValidator {
    timeout: Duration,
    retry_timeout: Duration,
}

impl HttpValidator {
    pub fn new(config: &ProbeSection) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_seconds),
            retry_timeout: Duration::from_secs(config.retry_timeout_seconds),
        }
    }

    fn client(&self, timeout: Duration) -> ProbeResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(false)
            .build()
            .map_err(ProbeError::Client)
    }

    async fn head(&self, url: &url::Url, timeout: Duration) -> ProbeResult<ProbeAttempt> {
        let client = self.client(timeout)?;
        match client.head(url.clone()).send().await {
            Ok(response) => Ok(ProbeAttempt::Status(response.status().as_u16())),
            Err(err) if err.is_timeout() => Ok(ProbeAttempt::TimedOut),
            Err(err) => Err(ProbeError::Request(err)),
        }
    }
}

enum ProbeAttempt {
    Status(u16),
    TimedOut,
}

/// Statuses where a slower retry is worth one more attempt.
fn is_gateway_timeout_class(status: u16) -> bool {
    matches!(status, 504 | 522 | 523 | 524)
}

fn classify(status: u16) -> ProbeOutcome {
    // 405 means HEAD itself is rejected, not the resource.
    if status < 400 || status == 405 {
        ProbeOutcome::reachable(status)
    } else {
        ProbeOutcome::unreachable(Some(status), format!("source returned HTTP {status}"))
    }
}

#[async_trait]
impl ConnectivityValidator for HttpValidator {
    async fn validate(&self, url: &str) -> ProbeResult<ProbeOutcome> {
        let parsed = url::Url::parse(url).map_err(|source| ProbeError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let first = self.head(&parsed, self.timeout).await?;
        let needs_retry = match first {
            ProbeAttempt::Status(status) if is_gateway_timeout_class(status) => {
                warn!(url, status, "gateway timeout from probe, retrying slower");
                true
            }
            ProbeAttempt::Status(status) => {
                debug!(url, status, "probe response");
                return Ok(classify(status));
            }
            ProbeAttempt::TimedOut => {
                warn!(url, "probe timed out, retrying slower");
                true
            }
        };

        if needs_retry {
            match self.head(&parsed, self.retry_timeout).await? {
                ProbeAttempt::Status(status) => return Ok(classify(status)),
                ProbeAttempt::TimedOut => {
                    return Ok(ProbeOutcome::unreachable(None, "probe timed out twice"))
                }
            }
        }
        Ok(ProbeOutcome::unreachable(None, "probe exhausted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_timeout_class_is_retryable() {
        for status in [504, 522, 523, 524] {
            assert!(is_gateway_timeout_class(status), "{status}");
        }
        assert!(!is_gateway_timeout_class(502));
        assert!(!is_gateway_timeout_class(404));
        assert!(!is_gateway_timeout_class(200));
    }

    #[test]
    fn classification_accepts_success_and_method_not_allowed() {
        assert!(classify(200).reachable);
        assert!(classify(302).reachable);
        assert!(classify(405).reachable);
        assert!(!classify(404).reachable);
        assert!(!classify(500).reachable);
        assert_eq!(classify(403).status, Some(403));
    }
}
