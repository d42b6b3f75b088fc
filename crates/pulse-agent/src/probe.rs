//! Probe executor: one bounded HTTP GET per assignment

use pulse_core::{ProbeStatus, PulseError, Result};
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: ProbeStatus,
    /// Measured latency, or the timeout ceiling when no response arrived
    pub latency_ms: u64,
    /// HTTP status code, if a response arrived
    pub http_status: Option<u16>,
}

/// Map an HTTP status code to a probe status
///
/// Anything in 200-299 is `Good`; everything else is `Bad`.
pub fn classify_status(code: u16) -> ProbeStatus {
    if (200..300).contains(&code) {
        ProbeStatus::Good
    } else {
        ProbeStatus::Bad
    }
}

/// Issues liveness probes with a mandatory, finite timeout
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    /// Create a prober. `timeout` must be non-zero.
    pub fn new(timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(PulseError::Config(
                "probe timeout must be greater than zero".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PulseError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `url` once
    ///
    /// Never fails: transport errors and timeouts are `Bad` results whose
    /// latency is the timeout ceiling, so a failed probe can never look like a
    /// fast healthy one.
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let request = self.client.get(url).send();

        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => {
                let latency_ms = elapsed_ms(started).min(self.timeout_ms());
                let code = response.status().as_u16();
                debug!("Probe {} answered {} in {}ms", url, code, latency_ms);
                ProbeOutcome {
                    status: classify_status(code),
                    latency_ms,
                    http_status: Some(code),
                }
            }
            Ok(Err(e)) => {
                debug!("Probe {} failed: {}", url, e);
                self.failed()
            }
            Err(_) => {
                debug!("Probe {} timed out after {:?}", url, self.timeout);
                self.failed()
            }
        }
    }

    fn failed(&self) -> ProbeOutcome {
        ProbeOutcome {
            status: ProbeStatus::Bad,
            latency_ms: self.timeout_ms(),
            http_status: None,
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), ProbeStatus::Good);
        assert_eq!(classify_status(204), ProbeStatus::Good);
        assert_eq!(classify_status(299), ProbeStatus::Good);
        assert_eq!(classify_status(301), ProbeStatus::Bad);
        assert_eq!(classify_status(404), ProbeStatus::Bad);
        assert_eq!(classify_status(500), ProbeStatus::Bad);
        assert_eq!(classify_status(199), ProbeStatus::Bad);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(Prober::new(Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_bad_with_ceiling_latency() {
        let prober = Prober::new(Duration::from_millis(250)).unwrap();
        let outcome = prober.probe("not a url").await;
        assert_eq!(outcome.status, ProbeStatus::Bad);
        assert_eq!(outcome.latency_ms, 250);
        assert_eq!(outcome.http_status, None);
    }
}
