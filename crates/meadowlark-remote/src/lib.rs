//! HTTP transport and collaborator seams for the generation and scoring services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use meadowlark_core::RunContext;
use reqwest::RequestBuilder;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{AcquireError, Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "meadowlark-remote";

pub const GENERATION_COLLABORATOR: &str = "generation";
pub const CONSERVATION_COLLABORATOR: &str = "conservation";
pub const CLIMATE_COLLABORATOR: &str = "climate";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("concurrency limiter closed")]
    LimiterClosed(#[from] AcquireError),
}

impl RemoteError {
    /// True for the "collaborator unreachable" class; false for payload problems.
    pub fn is_transport(&self) -> bool {
        !matches!(self, RemoteError::MalformedPayload(_))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_collaborator_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 12,
            per_collaborator_concurrency: 6,
        }
    }
}

/// Shared reqwest client bounded by a global permit pool and one pool per
/// collaborator. Every call is a single attempt.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_collaborator_limit: usize,
    per_collaborator: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_collaborator_limit: config.per_collaborator_concurrency.max(1),
            per_collaborator: Mutex::new(HashMap::new()),
        })
    }

    async fn collaborator_semaphore(&self, collaborator: &str) -> Arc<Semaphore> {
        let mut map = self.per_collaborator.lock().await;
        map.entry(collaborator.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_collaborator_limit)))
            .clone()
    }

    pub async fn get_text(
        &self,
        ctx: &RunContext,
        collaborator: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<String, RemoteError> {
        let request = self.client.get(url).query(query);
        self.send(ctx, collaborator, url, request).await
    }

    pub async fn post_json_text(
        &self,
        ctx: &RunContext,
        collaborator: &str,
        url: &str,
        body: &JsonValue,
        bearer: Option<&str>,
    ) -> Result<String, RemoteError> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        self.send(ctx, collaborator, url, request).await
    }

    async fn send(
        &self,
        ctx: &RunContext,
        collaborator: &str,
        url: &str,
        request: RequestBuilder,
    ) -> Result<String, RemoteError> {
        let _global = self.global_limit.acquire().await?;
        let limit = self.collaborator_semaphore(collaborator).await;
        let _collaborator = limit.acquire().await?;

        let span = info_span!(
            "collaborator_call",
            run_id = %ctx.run_id,
            generation = ctx.generation,
            collaborator,
            url
        );
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(RemoteError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "collaborator responded");
            Ok::<_, RemoteError>(body)
        }
        .instrument(span)
        .await
    }
}

/// Produces the raw response text for one generation request.
#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    async fn generate(&self, ctx: &RunContext, request: &JsonValue) -> Result<String, RemoteError>;
}

/// One location-keyed scoring service returning arbitrary text.
#[async_trait]
pub trait ScoreLookup: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, ctx: &RunContext, location: &str) -> Result<String, RemoteError>;
}

pub struct HttpCandidateGenerator {
    fetcher: Arc<HttpFetcher>,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl HttpCandidateGenerator {
    pub fn new(fetcher: Arc<HttpFetcher>, endpoint: Option<String>, api_key: Option<String>) -> Self {
        Self {
            fetcher,
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl CandidateGenerator for HttpCandidateGenerator {
    async fn generate(&self, ctx: &RunContext, request: &JsonValue) -> Result<String, RemoteError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or(RemoteError::NotConfigured("generation endpoint"))?;
        self.fetcher
            .post_json_text(
                ctx,
                GENERATION_COLLABORATOR,
                endpoint,
                request,
                self.api_key.as_deref(),
            )
            .await
    }
}

/// GET lookup that passes the location as one query parameter alongside a
/// fixed set of extra parameters.
pub struct HttpScoreLookup {
    name: String,
    fetcher: Arc<HttpFetcher>,
    endpoint: String,
    location_param: String,
    extra_query: Vec<(String, String)>,
}

impl HttpScoreLookup {
    pub fn new(
        name: impl Into<String>,
        fetcher: Arc<HttpFetcher>,
        endpoint: impl Into<String>,
        location_param: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fetcher,
            endpoint: endpoint.into(),
            location_param: location_param.into(),
            extra_query: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_query.push((key.into(), value.into()));
        self
    }

    pub fn query_for(&self, location: &str) -> Vec<(String, String)> {
        let mut query = vec![(self.location_param.clone(), location.to_string())];
        query.extend(self.extra_query.iter().cloned());
        query
    }
}

#[async_trait]
impl ScoreLookup for HttpScoreLookup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, ctx: &RunContext, location: &str) -> Result<String, RemoteError> {
        let query = self.query_for(location);
        self.fetcher
            .get_text(ctx, &self.name, &self.endpoint, &query)
            .await
    }
}

/// Climate lookup keyed on a place name: resolves the name to coordinates
/// through a geocoding search, then asks a forecast endpoint for current
/// conditions at those coordinates. Returns the forecast body unchanged.
pub struct GeocodedForecastLookup {
    name: String,
    fetcher: Arc<HttpFetcher>,
    geocoding_endpoint: String,
    forecast_endpoint: String,
    current_fields: String,
}

impl GeocodedForecastLookup {
    pub fn new(
        name: impl Into<String>,
        fetcher: Arc<HttpFetcher>,
        geocoding_endpoint: impl Into<String>,
        forecast_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fetcher,
            geocoding_endpoint: geocoding_endpoint.into(),
            forecast_endpoint: forecast_endpoint.into(),
            current_fields: "temperature_2m,precipitation".to_string(),
        }
    }

    async fn coordinates(&self, ctx: &RunContext, location: &str) -> Result<(f64, f64), RemoteError> {
        let query = [
            ("name".to_string(), location.to_string()),
            ("count".to_string(), "1".to_string()),
        ];
        let body = self
            .fetcher
            .get_text(ctx, &self.name, &self.geocoding_endpoint, &query)
            .await?;
        first_coordinates(&body).ok_or_else(|| {
            RemoteError::MalformedPayload(format!("no coordinates for {location}"))
        })
    }
}

/// `results[0].latitude` / `results[0].longitude` from a geocoding search body.
fn first_coordinates(body: &str) -> Option<(f64, f64)> {
    let value: JsonValue = serde_json::from_str(body).ok()?;
    let first = value.get("results")?.as_array()?.first()?;
    Some((first.get("latitude")?.as_f64()?, first.get("longitude")?.as_f64()?))
}

#[async_trait]
impl ScoreLookup for GeocodedForecastLookup {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, ctx: &RunContext, location: &str) -> Result<String, RemoteError> {
        let (latitude, longitude) = self.coordinates(ctx, location).await?;
        debug!(location, latitude, longitude, "geocoded location");
        let query = [
            ("latitude".to_string(), latitude.to_string()),
            ("longitude".to_string(), longitude.to_string()),
            ("current".to_string(), self.current_fields.clone()),
        ];
        self.fetcher
            .get_text(ctx, &self.name, &self.forecast_endpoint, &query)
            .await
    }
}
