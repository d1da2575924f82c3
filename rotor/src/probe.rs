use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

/// Tri-state health verdict. Timeout is distinct from an explicit failure
/// so the controller can log the precise reason a standby was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Unhealthy,
    Timeout,
}

#[async_trait]
pub trait Prober {
    async fn check(&self, container: &str) -> ProbeVerdict;
}

/// Polls `http://{name}:{port}{path}` at a fixed cadence until the endpoint
/// answers 2xx, fails terminally, or the deadline passes.
///
/// A connection error means the container is still booting and keeps the
/// poll going; an HTTP response means the server is up, and
/// `failure_threshold` consecutive non-2xx answers are terminal.
pub struct HttpProber {
    backend_port: u16,
    health_path: String,
    interval: Duration,
    deadline: Duration,
    failure_threshold: u32,
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(
        backend_port: u16,
        health_path: String,
        interval: Duration,
        deadline: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            backend_port,
            health_path,
            interval,
            deadline,
            failure_threshold,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn check(&self, container: &str) -> ProbeVerdict {
        let url = format!(
            "http://{container}:{}{}",
            self.backend_port, self.health_path
        );
        let deadline = Instant::now() + self.deadline;
        let mut consecutive_failures = 0u32;

        loop {
            let attempt = self
                .client
                .get(&url)
                .timeout(self.interval)
                .send()
                .await;

            match attempt {
                Ok(response) if response.status().is_success() => {
                    return ProbeVerdict::Healthy;
                }
                Ok(response) => {
                    consecutive_failures += 1;
                    debug!(
                        container,
                        status = response.status().as_u16(),
                        consecutive_failures,
                        "health endpoint answered non-2xx"
                    );
                    if consecutive_failures >= self.failure_threshold {
                        return ProbeVerdict::Unhealthy;
                    }
                }
                Err(err) => {
                    // still booting, keep polling until the deadline
                    consecutive_failures = 0;
                    debug!(container, error = %err, "health endpoint not reachable yet");
                }
            }

            if Instant::now() + self.interval > deadline {
                return ProbeVerdict::Timeout;
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;

    use super::{HttpProber, ProbeVerdict, Prober};

    fn prober(server: &MockServer, deadline: Duration) -> HttpProber {
        HttpProber::new(
            server.port(),
            "/health".to_string(),
            Duration::from_millis(50),
            deadline,
            2,
        )
    }

    #[tokio::test]
    async fn healthy_endpoint_passes() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;

        let verdict = prober(&server, Duration::from_secs(2))
            .check("127.0.0.1")
            .await;
        assert_eq!(verdict, ProbeVerdict::Healthy);
    }

    #[tokio::test]
    async fn repeated_failures_are_terminal_before_the_deadline() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(500);
            })
            .await;

        let started = tokio::time::Instant::now();
        let verdict = prober(&server, Duration::from_secs(30))
            .check("127.0.0.1")
            .await;
        assert_eq!(verdict, ProbeVerdict::Unhealthy);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_endpoint_times_out() {
        // probing a container that never comes up
        let prober = HttpProber::new(
            9,
            "/health".to_string(),
            Duration::from_millis(50),
            Duration::from_millis(300),
            2,
        );
        let verdict = prober.check("127.0.0.1").await;
        assert_eq!(verdict, ProbeVerdict::Timeout);
    }
}
