//! HubSpot automation API client.
//!
//! Wraps every call in a circuit breaker admission check and a bounded
//! retry. Transport errors and 5xx responses are retried; 4xx responses are
//! client errors and surface immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::HubSpotConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::resilience::{
    retry_with_policy, CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy,
};

const WORKFLOWS_PATH: &str = "/automation/v3/workflows";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Upstream name used for the circuit breaker registry.
const UPSTREAM: &str = "hubspot";

/// A workflow as returned by the HubSpot API.
#[derive(Debug, Clone)]
pub struct HubSpotWorkflow {
    pub id: String,
    pub name: String,
    /// Full workflow document as returned upstream
    pub raw: Value,
}

impl HubSpotWorkflow {
    /// Parse a workflow document, accepting numeric or string ids.
    pub fn from_value(raw: Value) -> Result<Self> {
        let id = match raw.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(Error::HubSpot(
                    "Workflow document has no id field".to_string(),
                ))
            }
        };
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)")
            .to_string();
        Ok(Self { id, name, raw })
    }
}

/// HubSpot API client.
#[derive(Clone)]
pub struct HubSpotClient {
    client: Client,
    base_url: String,
    access_token: String,
    retry: RetryPolicy,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HubSpotClient {
    /// Build a client from configuration.
    pub fn new(config: &HubSpotConfig) -> Result<Self> {
        let access_token = config
            .access_token
            .clone()
            .or_else(|| std::env::var("WFG_HUBSPOT_TOKEN").ok())
            .ok_or_else(|| {
                Error::Config(
                    "HubSpot access token not configured (set WFG_HUBSPOT_TOKEN)".to_string(),
                )
            })?;

        Self::with_settings(
            config.base_url.clone(),
            access_token,
            Duration::from_secs(config.timeout_seconds),
            RetryPolicy::default(),
            CircuitBreakerConfig::default(),
        )
    }

    /// Build a client with explicit settings (used by tests).
    pub fn with_settings(
        base_url: String,
        access_token: String,
        timeout: Duration,
        retry: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            retry,
            breakers: Arc::new(CircuitBreakerRegistry::with_config(breaker_config)),
        })
    }

    /// State of the upstream circuit, for health reporting.
    pub fn breaker_registry(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// List all workflows in the connected account.
    pub async fn list_workflows(&self) -> Result<Vec<HubSpotWorkflow>> {
        let body = self.execute(Method::GET, WORKFLOWS_PATH, None).await?;
        let items = body
            .get("workflows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        items.into_iter().map(HubSpotWorkflow::from_value).collect()
    }

    /// Fetch a single workflow.
    pub async fn get_workflow(&self, hubspot_id: &str) -> Result<HubSpotWorkflow> {
        let path = format!("{}/{}", WORKFLOWS_PATH, hubspot_id);
        let body = self.execute(Method::GET, &path, None).await?;
        HubSpotWorkflow::from_value(body)
    }

    /// Push a definition back to HubSpot (used by rollback).
    pub async fn update_workflow(
        &self,
        hubspot_id: &str,
        definition: &Value,
    ) -> Result<HubSpotWorkflow> {
        let path = format!("{}/{}", WORKFLOWS_PATH, hubspot_id);
        let body = self
            .execute(Method::PUT, &path, Some(definition.clone()))
            .await?;
        HubSpotWorkflow::from_value(body)
    }

    async fn execute(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let breaker = self.breakers.get_or_create(UPSTREAM);
        if !breaker.allow_request() {
            warn!(path, "HubSpot circuit open, rejecting call");
            return Err(Error::CircuitOpen(UPSTREAM.to_string()));
        }

        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();

        // Inner Ok(Err(_)) carries non-retryable client errors through the
        // retry wrapper untouched.
        let outcome: std::result::Result<Result<Value>, Error> =
            retry_with_policy(&self.retry, |attempt| {
                let method = method.clone();
                let url = url.clone();
                let body = body.clone();
                async move {
                    if attempt > 0 {
                        debug!(%url, attempt, "Retrying HubSpot call");
                    }
                    self.attempt(method, &url, body).await
                }
            })
            .await;

        metrics::record_hubspot_duration(started.elapsed(), method.as_str());

        match outcome {
            Ok(Ok(value)) => {
                breaker.record_success();
                Ok(value)
            }
            Ok(Err(client_err)) => {
                // 4xx is the caller's problem, not upstream health
                breaker.record_success();
                Err(client_err)
            }
            Err(err) => {
                breaker.record_failure();
                Err(err)
            }
        }
    }

    /// One HTTP attempt. Outer `Err` is retryable (transport or 5xx), inner
    /// `Err` is a terminal client error.
    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> std::result::Result<Result<Value>, Error> {
        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(&self.access_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(Error::Http)?;
        let status = response.status();
        metrics::record_hubspot_request(method.as_str(), status.as_u16());

        if status.is_success() {
            let value = response.json::<Value>().await.map_err(Error::Http)?;
            return Ok(Ok(value));
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("HubSpot returned {}: {}", status.as_u16(), text);

        if status == StatusCode::NOT_FOUND {
            // NotFound messages are shown to API consumers; keep the
            // upstream body out of them.
            warn!("HubSpot 404 for {}: {}", url, text);
            return Ok(Err(Error::NotFound("HubSpot workflow not found".to_string())));
        }
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            return Ok(Err(Error::HubSpot(message)));
        }

        // 5xx and upstream throttling are worth retrying
        Err(Error::HubSpot(message))
    }
}
