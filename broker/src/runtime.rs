use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("call timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("runtime returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// The container runtime's management API, as far as this broker is
/// concerned: start, stop, list. Everything else the runtime can do is
/// unreachable through this process.
#[async_trait]
pub trait ContainerRuntime {
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn list(&self, name: Option<&str>) -> Result<Value, RuntimeError>;
    async fn ping(&self) -> Result<(), RuntimeError>;
}

/// Talks to a Docker-compatible engine API over HTTP. Every call carries
/// the configured timeout; a 304 from start/stop means the container is
/// already in the requested state and is treated as success.
pub struct HttpRuntime {
    base_url: String,
    stop_grace: Duration,
    call_timeout: Duration,
    client: reqwest::Client,
}

impl HttpRuntime {
    pub fn new(base_url: String, call_timeout: Duration, stop_grace: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            stop_grace,
            call_timeout,
            client: reqwest::Client::new(),
        }
    }

    fn map_transport(e: reqwest::Error) -> RuntimeError {
        if e.is_timeout() {
            RuntimeError::Timeout
        } else {
            RuntimeError::Transport(e.to_string())
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RuntimeError> {
        let status = response.status();
        if status.is_success() || status.as_u16() == 304 {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ContainerRuntime for HttpRuntime {
    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let url = format!("{}/containers/{name}/start", self.base_url);
        let response = self
            .client
            .post(url)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check(response).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let url = format!("{}/containers/{name}/stop", self.base_url);
        let response = self
            .client
            .post(url)
            .query(&[("t", self.stop_grace.as_secs().to_string())])
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check(response).await.map(|_| ())
    }

    async fn list(&self, name: Option<&str>) -> Result<Value, RuntimeError> {
        let url = format!("{}/containers/json", self.base_url);
        let mut query = vec![("all".to_string(), "true".to_string())];
        if let Some(name) = name {
            let filters = serde_json::json!({ "name": [name] });
            query.push(("filters".to_string(), filters.to_string()));
        }
        let response = self
            .client
            .get(url)
            .query(&query)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::map_transport)
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        let url = format!("{}/_ping", self.base_url);
        let response = self
            .client
            .get(url)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check(response).await.map(|_| ())
    }
}

/// In-memory runtime recording every call; test use only.
#[derive(Default, Clone)]
pub struct FakeRuntime {
    calls: Arc<Mutex<Vec<String>>>,
    containers: Arc<Mutex<Value>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            calls: Default::default(),
            containers: Arc::new(Mutex::new(Value::Array(vec![]))),
        }
    }

    pub fn with_containers(self, containers: Value) -> Self {
        *self.containers.lock().expect("poisoned") = containers;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("poisoned").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("poisoned").push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("start:{name}"));
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(format!("stop:{name}"));
        Ok(())
    }

    async fn list(&self, name: Option<&str>) -> Result<Value, RuntimeError> {
        self.record(format!("list:{}", name.unwrap_or("*")));
        Ok(self.containers.lock().expect("poisoned").clone())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.record("ping".to_string());
        Ok(())
    }
}
