//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::{ProbeError, Prober, Samples};

/// Times full GET round trips (request, headers and body) against one URL.
#[derive(Debug, Clone)]
pub struct HttpProber {
    url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(address: &str, timeout: Duration) -> Self {
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Self { url, timeout }
    }

    #[cfg(test)]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Prober for HttpProber {
    async fn run_batch(&self, count: u32) -> Result<Samples, ProbeError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|e| ProbeError::Config(format!("invalid url {}: {}", self.url, e)))?;

        // A fresh client per batch so every sample set pays its own connection setup.
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        let mut samples = Samples::default();
        for _ in 0..count {
            match run_http_probe(&client, url.clone(), self.timeout).await {
                Ok(ms) => samples.latencies.push(ms),
                Err(e) => {
                    tracing::debug!("HTTP sample against {} failed: {}", self.url, e);
                    samples.lost += 1;
                }
            }
        }
        Ok(samples)
    }
}

/// Run one HTTP GET and return its latency in milliseconds.
async fn run_http_probe(
    client: &reqwest::Client,
    url: reqwest::Url,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let start = Instant::now();

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    // Read the full body to measure complete transfer time
    let _body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};

    async fn serve_ok() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(|| async { "pong" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_scheme_is_added() {
        let p = HttpProber::new("example.com/health", Duration::from_secs(1));
        assert_eq!(p.url(), "http://example.com/health");
        let p = HttpProber::new("https://example.com", Duration::from_secs(1));
        assert_eq!(p.url(), "https://example.com");
    }

    #[tokio::test]
    async fn test_reachable_host_has_no_loss() {
        let url = serve_ok().await;
        let prober = HttpProber::new(&url, Duration::from_secs(2));
        let samples = prober.run_batch(3).await.unwrap();
        assert_eq!(samples.latencies.len(), 3);
        assert_eq!(samples.lost, 0);
        assert!(samples.latencies.iter().all(|v| *v >= 0.0));
    }

    #[tokio::test]
    async fn test_unreachable_host_counts_loss() {
        // Port 1 on loopback is closed on any sane test host.
        let prober = HttpProber::new("http://127.0.0.1:1", Duration::from_millis(200));
        let samples = prober.run_batch(2).await.unwrap();
        assert!(samples.latencies.is_empty());
        assert_eq!(samples.lost, 2);
    }

    #[tokio::test]
    async fn test_invalid_url_is_acquisition_error() {
        let prober = HttpProber::new("http://exa mple.com", Duration::from_millis(100));
        assert!(matches!(prober.run_batch(1).await, Err(ProbeError::Config(_))));
    }
}
