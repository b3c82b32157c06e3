//! Axum JSON API over the ingestion pipeline.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use meadowlark_core::{InvestmentPreferences, PipelineOutput};
use meadowlark_enrich::FallbackSynthesizer;
use meadowlark_pipeline::Orchestrator;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "meadowlark-web";

pub const RUN_ID_HEADER: &str = "x-meadowlark-run-id";
/// `false` when a newer request overtook this one and `latest` kept the newer result.
pub const APPLIED_HEADER: &str = "x-meadowlark-applied";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    service: &'static str,
    generation: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/opportunities", post(opportunities_handler))
        .route("/api/opportunities/latest", get(latest_handler))
        .route("/api/fallback", post(fallback_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "meadowlark web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        service: CRATE_NAME,
        generation: state.orchestrator.current_generation(),
    })
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Json(preferences): Json<InvestmentPreferences>,
) -> Response {
    let submission = state.orchestrator.submit(&preferences).await;
    let applied = submission.is_applied();
    let report = submission.into_report();

    let mut resp = Json(report.output).into_response();
    let headers = resp.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&report.run_id.to_string()) {
        headers.insert(RUN_ID_HEADER, value);
    }
    headers.insert(
        APPLIED_HEADER,
        HeaderValue::from_static(if applied { "true" } else { "false" }),
    );
    resp
}

async fn latest_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.latest().await {
        Some(output) => Json(output).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no completed run yet" })),
        )
            .into_response(),
    }
}

async fn fallback_handler(Json(preferences): Json<InvestmentPreferences>) -> Json<PipelineOutput> {
    Json(PipelineOutput {
        opportunities: FallbackSynthesizer::synthesize(&preferences),
        used_fallback: true,
        error_detail: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::header;
    use http_body_util::BodyExt;
    use meadowlark_core::RunContext;
    use meadowlark_enrich::ScoreEnricher;
    use meadowlark_pipeline::GenerationSettings;
    use meadowlark_remote::{CandidateGenerator, RemoteError, ScoreLookup};
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    struct CannedGenerator(&'static str);

    #[async_trait]
    impl CandidateGenerator for CannedGenerator {
        async fn generate(&self, _ctx: &RunContext, _request: &JsonValue) -> Result<String, RemoteError> {
            Ok(self.0.to_string())
        }
    }

    /// Holds the first call back so a second request can overtake it.
    struct SlowFirstGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CandidateGenerator for SlowFirstGenerator {
        async fn generate(&self, _ctx: &RunContext, _request: &JsonValue) -> Result<String, RemoteError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(TWO_RECORDS.to_string())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ScoreLookup for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn lookup(&self, _ctx: &RunContext, _location: &str) -> Result<String, RemoteError> {
            Err(RemoteError::NotConfigured("lookup"))
        }
    }

    fn app_with(generator: Arc<dyn CandidateGenerator>) -> Router {
        let enricher = ScoreEnricher::new(Arc::new(Unreachable), Arc::new(Unreachable)).with_seed(1);
        let orchestrator = Orchestrator::new(generator, enricher, GenerationSettings::default());
        app(AppState::new(orchestrator))
    }

    fn test_app(reply: &'static str) -> Router {
        app_with(Arc::new(CannedGenerator(reply)))
    }

    const PREFERENCES: &str = r#"{
        "region": "africa",
        "investmentAmount": 10000,
        "sdgs": [13, 15],
        "riskTolerance": "medium",
        "investmentHorizon": "short",
        "minimumReturn": 4
    }"#;

    const TWO_RECORDS: &str = r#"{"opportunities": [
        {"title": "Kasigau Corridor", "url": "registry.verra.org/612", "location": "Kenya"},
        {"title": "Gorongosa Restoration", "url": "https://gorongosa.org", "location": "Mozambique"}
    ]}"#;

    fn post_json(uri: &str, body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let resp = test_app(TWO_RECORDS)
            .oneshot(axum::http::Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["generation"], 0);
    }

    #[tokio::test]
    async fn opportunities_post_returns_enriched_output() {
        let app = test_app(TWO_RECORDS);
        let resp = app
            .clone()
            .oneshot(post_json("/api/opportunities", PREFERENCES))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(RUN_ID_HEADER));
        assert_eq!(resp.headers()[APPLIED_HEADER], "true");
        let body = json_body(resp).await;
        assert_eq!(body["usedFallback"], false);
        assert!(body.get("errorDetail").is_none());
        assert_eq!(body["opportunities"].as_array().unwrap().len(), 2);
        assert_eq!(body["opportunities"][0]["id"], "ai-1");
        assert_eq!(body["opportunities"][0]["url"], "https://registry.verra.org/612");
        assert_eq!(body["opportunities"][0]["scoreSources"]["conservation"], "baseline");

        let latest = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/opportunities/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn refusal_is_served_as_fallback_with_detail() {
        let resp = test_app("I cannot comply with this request.")
            .oneshot(post_json("/api/opportunities", PREFERENCES))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["usedFallback"], true);
        assert!(body["errorDetail"].is_string());
        assert_eq!(body["opportunities"].as_array().unwrap().len(), 3);
        assert_eq!(body["opportunities"][0]["title"], "Africa Reforestation Initiative");
    }

    #[tokio::test]
    async fn latest_is_not_found_before_any_run() {
        let resp = test_app(TWO_RECORDS)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/opportunities/latest")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fallback_endpoint_synthesizes_three_records() {
        let resp = test_app(TWO_RECORDS)
            .oneshot(post_json("/api/fallback", PREFERENCES))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let ids: Vec<&str> = body["opportunities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["fallback-1", "fallback-2", "fallback-3"]);
    }

    #[tokio::test]
    async fn overlapping_clients_both_receive_collections() {
        let app = app_with(Arc::new(SlowFirstGenerator {
            calls: AtomicUsize::new(0),
        }));
        let other_region = PREFERENCES.replace("africa", "europe");

        let (first, second) = tokio::join!(
            app.clone().oneshot(post_json("/api/opportunities", PREFERENCES)),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                app.clone()
                    .oneshot(post_json("/api/opportunities", &other_region))
                    .await
            }
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(first.headers()[APPLIED_HEADER], "false");
        assert_eq!(second.headers()[APPLIED_HEADER], "true");
        for resp in [first, second] {
            let body = json_body(resp).await;
            assert_eq!(body["usedFallback"], false);
            assert_eq!(body["opportunities"].as_array().unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn malformed_preferences_are_rejected() {
        let resp = test_app(TWO_RECORDS)
            .oneshot(post_json("/api/opportunities", r#"{"region": "antarctica"}"#))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
    }
}
