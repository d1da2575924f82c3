use std::time::Duration;

use async_trait::async_trait;

/// Pre-shutdown collaboration with the protected workload: before the
/// outgoing container is stopped it gets one bounded chance to flush
/// transient state to durable storage. Failure never blocks the stop.
#[async_trait]
pub trait PreStopHook {
    async fn flush(&self, container: &str) -> Result<(), String>;
}

/// `POST http://{name}:{port}{path}` with a bounded timeout.
pub struct HttpPreStopHook {
    backend_port: u16,
    flush_path: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpPreStopHook {
    pub fn new(backend_port: u16, flush_path: String, timeout: Duration) -> Self {
        Self {
            backend_port,
            flush_path,
            timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PreStopHook for HttpPreStopHook {
    async fn flush(&self, container: &str) -> Result<(), String> {
        let url = format!(
            "http://{container}:{}{}",
            self.backend_port, self.flush_path
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("flush hook answered {}", response.status()))
        }
    }
}

/// Used when no flush path is configured.
pub struct NoopHook;

#[async_trait]
impl PreStopHook for NoopHook {
    async fn flush(&self, _container: &str) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;

    use super::{HttpPreStopHook, PreStopHook};

    #[tokio::test]
    async fn flush_posts_to_the_workload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/flush");
                then.status(200);
            })
            .await;

        let hook = HttpPreStopHook::new(
            server.port(),
            "/internal/flush".to_string(),
            Duration::from_secs(1),
        );
        hook.flush("127.0.0.1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn failed_flush_reports_the_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/flush");
                then.status(500);
            })
            .await;

        let hook = HttpPreStopHook::new(
            server.port(),
            "/internal/flush".to_string(),
            Duration::from_secs(1),
        );
        let err = hook.flush("127.0.0.1").await.unwrap_err();
        assert!(err.contains("500"));
    }
}
