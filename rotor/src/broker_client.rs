use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerCallError {
    #[error("broker rejected the configured token")]
    Unauthorized,

    #[error("broker refused the operation: {0}")]
    Forbidden(String),

    #[error("broker call timed out")]
    Timeout,

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// The controller's view of the lifecycle broker. Everything the rotation
/// state machine does to a container goes through this seam, which keeps
/// the state machine testable against a fake.
#[async_trait]
pub trait LifecycleApi {
    async fn start(&self, name: &str) -> Result<(), BrokerCallError>;
    async fn stop(&self, name: &str) -> Result<(), BrokerCallError>;
    async fn inspect(&self, name: Option<&str>) -> Result<Value, BrokerCallError>;
}

pub struct BrokerClient {
    base_url: String,
    token: String,
    call_timeout: Duration,
    client: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base_url: String, token: String, call_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            call_timeout,
            client: reqwest::Client::new(),
        }
    }

    fn map_transport(e: reqwest::Error) -> BrokerCallError {
        if e.is_timeout() {
            BrokerCallError::Timeout
        } else {
            BrokerCallError::Transport(e.to_string())
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BrokerCallError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or_default();
        match status.as_u16() {
            401 => Err(BrokerCallError::Unauthorized),
            403 => Err(BrokerCallError::Forbidden(message)),
            code => Err(BrokerCallError::Api {
                status: code,
                message,
            }),
        }
    }

    async fn lifecycle(&self, name: &str, op: &str) -> Result<(), BrokerCallError> {
        let url = format!("{}/containers/{name}/{op}", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(Self::map_transport)?;
        Self::check(response).await.map(|_| ())
    }
}

#[async_trait]
impl LifecycleApi for BrokerClient {
    async fn start(&self, name: &str) -> Result<(), BrokerCallError> {
        self.lifecycle(name, "start").await
    }

    async fn stop(&self, name: &str) -> Result<(), BrokerCallError> {
        self.lifecycle(name, "stop").await
    }

    async fn inspect(&self, name: Option<&str>) -> Result<Value, BrokerCallError> {
        let url = format!("{}/containers/json", self.base_url);
        let mut request = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .timeout(self.call_timeout);
        if let Some(name) = name {
            request = request.query(&[("name", name)]);
        }
        let response = request.send().await.map_err(Self::map_transport)?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(Self::map_transport)
    }
}

/// Scriptable in-memory broker; test use only.
#[derive(Default, Clone)]
pub struct FakeBroker {
    calls: Arc<Mutex<Vec<String>>>,
    fail_start: Arc<Mutex<bool>>,
    fail_stop: Arc<Mutex<bool>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("poisoned").clone()
    }

    pub fn fail_next_start(&self) {
        *self.fail_start.lock().expect("poisoned") = true;
    }

    pub fn fail_next_stop(&self) {
        *self.fail_stop.lock().expect("poisoned") = true;
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("poisoned").push(call);
    }
}

#[async_trait]
impl LifecycleApi for FakeBroker {
    async fn start(&self, name: &str) -> Result<(), BrokerCallError> {
        self.record(format!("start:{name}"));
        if std::mem::take(&mut *self.fail_start.lock().expect("poisoned")) {
            return Err(BrokerCallError::Api {
                status: 502,
                message: "runtime unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), BrokerCallError> {
        self.record(format!("stop:{name}"));
        if std::mem::take(&mut *self.fail_stop.lock().expect("poisoned")) {
            return Err(BrokerCallError::Api {
                status: 502,
                message: "runtime unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn inspect(&self, name: Option<&str>) -> Result<Value, BrokerCallError> {
        self.record(format!("inspect:{}", name.unwrap_or("*")));
        Ok(Value::Array(vec![]))
    }
}
