//! Configuration, generation prompt and the run state machine tying ingest,
//! enrichment and fallback together.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use meadowlark_core::{
    EnrichedOpportunity, InvestmentPreferences, PipelineOutput, RunContext,
};
use meadowlark_enrich::{FallbackSynthesizer, ScoreEnricher};
use meadowlark_ingest::{normalize_all, parse_response, validate, IngestError, ValidatedCollection};
use meadowlark_remote::{
    CandidateGenerator, GeocodedForecastLookup, HttpCandidateGenerator, HttpClientConfig,
    HttpFetcher, HttpScoreLookup, RemoteError, CLIMATE_COLLABORATOR, CONSERVATION_COLLABORATOR,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "meadowlark-pipeline";

pub const DEFAULT_CONSERVATION_URL: &str = "https://api.gbif.org/v1/occurrence/search";
pub const DEFAULT_CLIMATE_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub generation_url: Option<String>,
    pub generation_api_key: Option<String>,
    pub conservation_url: String,
    pub climate_url: String,
    pub geocoding_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_concurrency: usize,
    pub max_tokens: u32,
    pub temperature: f64,
    pub enrichment_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            generation_url: None,
            generation_api_key: None,
            conservation_url: DEFAULT_CONSERVATION_URL.to_string(),
            climate_url: DEFAULT_CLIMATE_URL.to_string(),
            geocoding_url: DEFAULT_GEOCODING_URL.to_string(),
            user_agent: "meadowlark-bot/0.1".to_string(),
            http_timeout_secs: 30,
            http_concurrency: 12,
            max_tokens: 4096,
            temperature: 0.7,
            enrichment_seed: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            generation_url: text("MEADOWLARK_GENERATION_URL"),
            generation_api_key: text("MEADOWLARK_GENERATION_API_KEY"),
            conservation_url: text("MEADOWLARK_CONSERVATION_URL")
                .unwrap_or(defaults.conservation_url),
            climate_url: text("MEADOWLARK_CLIMATE_URL").unwrap_or(defaults.climate_url),
            geocoding_url: text("MEADOWLARK_GEOCODING_URL").unwrap_or(defaults.geocoding_url),
            user_agent: text("MEADOWLARK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed(&var, "MEADOWLARK_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_concurrency: parsed(&var, "MEADOWLARK_HTTP_CONCURRENCY", defaults.http_concurrency),
            max_tokens: parsed(&var, "MEADOWLARK_MAX_TOKENS", defaults.max_tokens),
            temperature: parsed(&var, "MEADOWLARK_TEMPERATURE", defaults.temperature),
            enrichment_seed: var("MEADOWLARK_ENRICHMENT_SEED").and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.http_concurrency,
            ..Default::default()
        }
    }

    pub fn generation_settings(&self) -> GenerationSettings {
        GenerationSettings {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        PipelineConfig::default().generation_settings()
    }
}

/// Prompt payload for the generation collaborator. The 3-5 count in the text
/// is guidance for the model only; acceptance is decided by validation.
pub fn build_generation_request(
    preferences: &InvestmentPreferences,
    settings: &GenerationSettings,
) -> JsonValue {
    let content = format!(
        "You are an expert in conservation finance and sustainable investment opportunities.
Based on the following investment preferences, provide between 3 to 5 verified investment opportunities in valid JSON format.

Investment Preferences:
- Region: {region}
- SDG Goals: {sdgs}
- Risk Tolerance: {risk}
- Investment Horizon: {horizon}
- Minimum Return: {min_return}%
- Investment Amount: ${amount}

CRITICAL REQUIREMENTS - Each opportunity MUST include ALL of these fields:
1. \"title\": A specific, descriptive project name (REQUIRED)
2. \"url\": A valid, working URL to a real conservation project or registry (REQUIRED)
3. \"location\": Specific location name for the project (REQUIRED - e.g., \"Amazon Rainforest, Brazil\")
4. \"description\": Detailed explanation of the opportunity (REQUIRED)
5. \"sdg_alignment\": Which SDG goals this project aligns with (REQUIRED - e.g., \"13, 15\")
6. \"estimated_return\": Expected annual return percentage (REQUIRED - e.g., \"8-12%\")
7. \"region\": Geographic region (REQUIRED - e.g., \"South America\")
8. \"verification_source\": Source of verification or certification (REQUIRED - e.g., \"Verra Registry\")

Use actual websites like:
- Verra Registry: https://registry.verra.org/
- Gold Standard: https://www.goldstandard.org/
- Conservation International: https://www.conservation.org/
- The Nature Conservancy: https://www.nature.org/
- World Wildlife Fund: https://www.worldwildlife.org/

Return ONLY a JSON object of the form {{\"opportunities\": [ ... ]}} with one object per opportunity.

IMPORTANT:
- Provide 3-5 opportunities
- Each MUST have ALL 8 required fields
- URLs must be real and working (no placeholders like example.com)
- Location should be specific enough for biodiversity and climate data lookup
- Return ONLY the JSON object, no other text",
        region = preferences.region.display_name(),
        sdgs = preferences.sdg_list(),
        risk = preferences.risk_tolerance.as_str(),
        horizon = preferences.investment_horizon.as_str(),
        min_return = preferences.minimum_return,
        amount = preferences.investment_amount,
    );

    json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": settings.max_tokens,
        "temperature": settings.temperature,
        "messages": [{ "role": "user", "content": content }],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Requesting,
    Parsing,
    Normalizing,
    Enriching,
    Succeeded,
    FallenBack,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::FallenBack)
    }

    /// `FallenBack` is reachable from the three pre-enrichment stages only.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Requesting, Parsing)
                | (Parsing, Normalizing)
                | (Normalizing, Enriching)
                | (Enriching, Succeeded)
                | (Requesting | Parsing | Normalizing, FallenBack)
        )
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("generation request failed: {0}")]
    Generation(#[from] RemoteError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl PipelineError {
    /// Stage the run was in when it failed.
    pub fn stage(&self) -> PipelineState {
        match self {
            PipelineError::Generation(_) => PipelineState::Requesting,
            PipelineError::Ingest(IngestError::EnvelopeExhausted) => PipelineState::Parsing,
            PipelineError::Ingest(IngestError::InsufficientOpportunities { .. }) => {
                PipelineState::Normalizing
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub generation: u64,
    pub transitions: Vec<PipelineState>,
    pub output: PipelineOutput,
}

impl RunReport {
    pub fn terminal_state(&self) -> PipelineState {
        self.transitions
            .last()
            .copied()
            .unwrap_or(PipelineState::Idle)
    }
}

/// Outcome of [`Orchestrator::submit`]. Both arms carry the caller's own
/// report; they differ only in whether it became `latest`.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Applied(RunReport),
    /// A newer submission started before this one finished, so `latest`
    /// was left alone.
    Superseded { report: RunReport, newest: u64 },
}

impl Submission {
    pub fn is_applied(&self) -> bool {
        matches!(self, Submission::Applied(_))
    }

    pub fn report(&self) -> &RunReport {
        match self {
            Submission::Applied(report) | Submission::Superseded { report, .. } => report,
        }
    }

    pub fn into_report(self) -> RunReport {
        match self {
            Submission::Applied(report) | Submission::Superseded { report, .. } => report,
        }
    }
}

struct Transitions<'a> {
    ctx: &'a RunContext,
    states: Vec<PipelineState>,
}

impl<'a> Transitions<'a> {
    fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            states: vec![PipelineState::Idle],
        }
    }

    fn current(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Idle)
    }

    fn advance(&mut self, next: PipelineState) {
        let from = self.current();
        if !from.can_transition_to(next) {
            warn!(?from, to = ?next, "unexpected pipeline transition");
        }
        info!(
            run_id = %self.ctx.run_id,
            generation = self.ctx.generation,
            ?from,
            to = ?next,
            "pipeline transition"
        );
        self.states.push(next);
    }
}

pub struct Orchestrator {
    generator: Arc<dyn CandidateGenerator>,
    enricher: ScoreEnricher,
    settings: GenerationSettings,
    generation: AtomicU64,
    latest: RwLock<Option<PipelineOutput>>,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn CandidateGenerator>,
        enricher: ScoreEnricher,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            generator,
            enricher,
            settings,
            generation: AtomicU64::new(0),
            latest: RwLock::new(None),
        }
    }

    /// Wires the HTTP collaborators described by `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let generator = HttpCandidateGenerator::new(
            fetcher.clone(),
            config.generation_url.clone(),
            config.generation_api_key.clone(),
        );
        let conservation = HttpScoreLookup::new(
            CONSERVATION_COLLABORATOR,
            fetcher.clone(),
            config.conservation_url.clone(),
            "q",
        )
        .with_query("limit", "0");
        let climate = GeocodedForecastLookup::new(
            CLIMATE_COLLABORATOR,
            fetcher,
            config.geocoding_url.clone(),
            config.climate_url.clone(),
        );

        let mut enricher = ScoreEnricher::new(Arc::new(conservation), Arc::new(climate));
        if let Some(seed) = config.enrichment_seed {
            enricher = enricher.with_seed(seed);
        }
        Ok(Self::new(
            Arc::new(generator),
            enricher,
            config.generation_settings(),
        ))
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// One full run. Never fails: any error before enrichment ends in the
    /// fallback collection. Neither takes a submission ticket nor touches
    /// [`Self::latest`]; the report carries the generation current at start.
    pub async fn run(&self, preferences: &InvestmentPreferences) -> RunReport {
        self.execute(self.current_generation(), preferences).await
    }

    /// Like [`Self::run`], but the result becomes `latest` only if no newer
    /// submission started in the meantime. The caller gets its report either way.
    pub async fn submit(&self, preferences: &InvestmentPreferences) -> Submission {
        let generation = self.next_generation();
        let report = self.execute(generation, preferences).await;

        let mut latest = self.latest.write().await;
        let newest = self.current_generation();
        if newest != generation {
            info!(
                run_id = %report.run_id,
                generation,
                newest,
                "superseded run not applied to latest"
            );
            return Submission::Superseded { report, newest };
        }
        *latest = Some(report.output.clone());
        Submission::Applied(report)
    }

    pub async fn latest(&self) -> Option<PipelineOutput> {
        self.latest.read().await.clone()
    }

    /// Parsing and normalization only, for inspecting a saved response.
    pub fn parse_only(&self, raw: &str) -> Result<ValidatedCollection, PipelineError> {
        let candidates = parse_response(raw)?;
        Ok(validate(normalize_all(&candidates))?)
    }

    async fn execute(&self, generation: u64, preferences: &InvestmentPreferences) -> RunReport {
        let ctx = RunContext::new(generation);
        let span = info_span!("pipeline_run", run_id = %ctx.run_id, generation);

        async {
            let mut transitions = Transitions::new(&ctx);
            let output = match self.produce(&ctx, &mut transitions, preferences).await {
                Ok(opportunities) => {
                    transitions.advance(PipelineState::Succeeded);
                    PipelineOutput {
                        opportunities,
                        used_fallback: false,
                        error_detail: None,
                    }
                }
                Err(err) => {
                    warn!(stage = ?err.stage(), error = %err, "run failed, synthesizing fallback");
                    transitions.advance(PipelineState::FallenBack);
                    PipelineOutput {
                        opportunities: FallbackSynthesizer::synthesize(preferences),
                        used_fallback: true,
                        error_detail: Some(err.to_string()),
                    }
                }
            };
            RunReport {
                run_id: ctx.run_id,
                generation,
                transitions: transitions.states,
                output,
            }
        }
        .instrument(span)
        .await
    }

    async fn produce(
        &self,
        ctx: &RunContext,
        transitions: &mut Transitions<'_>,
        preferences: &InvestmentPreferences,
    ) -> Result<Vec<EnrichedOpportunity>, PipelineError> {
        transitions.advance(PipelineState::Requesting);
        let request = build_generation_request(preferences, &self.settings);
        let raw = self.generator.generate(ctx, &request).await?;

        transitions.advance(PipelineState::Parsing);
        let candidates = parse_response(&raw)?;

        transitions.advance(PipelineState::Normalizing);
        let collection = validate(normalize_all(&candidates))?;
        info!(accepted = collection.len(), candidates = candidates.len(), "validated opportunities");

        transitions.advance(PipelineState::Enriching);
        Ok(self.enricher.enrich(ctx, &collection, preferences).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meadowlark_core::{InvestmentHorizon, Region, RiskTolerance};
    use meadowlark_remote::ScoreLookup;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    fn preferences() -> InvestmentPreferences {
        InvestmentPreferences {
            region: Region::Oceania,
            investment_amount: 25_000.0,
            sdgs: vec![14],
            risk_tolerance: RiskTolerance::Low,
            investment_horizon: InvestmentHorizon::Medium,
            minimum_return: 5.0,
        }
    }

    /// Replies with the queued responses in order; the first reply can be held back.
    struct ScriptedGenerator {
        replies: Vec<Result<String, &'static str>>,
        calls: AtomicUsize,
        first_call_delay: Option<Duration>,
    }

    impl ScriptedGenerator {
        fn replying(replies: Vec<Result<String, &'static str>>) -> Self {
            Self {
                replies,
                calls: AtomicUsize::new(0),
                first_call_delay: None,
            }
        }
    }

    #[async_trait]
    impl CandidateGenerator for ScriptedGenerator {
        async fn generate(&self, _ctx: &RunContext, request: &JsonValue) -> Result<String, RemoteError> {
            assert_eq!(request["anthropic_version"], ANTHROPIC_VERSION);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                if let Some(delay) = self.first_call_delay {
                    tokio::time::sleep(delay).await;
                }
            }
            match self.replies.get(call).or(self.replies.last()) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(reason)) => Err(RemoteError::NotConfigured(reason)),
                None => Err(RemoteError::NotConfigured("no scripted reply")),
            }
        }
    }

    struct FixedLookup(&'static str);

    #[async_trait]
    impl ScoreLookup for FixedLookup {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn lookup(&self, _ctx: &RunContext, _location: &str) -> Result<String, RemoteError> {
            Ok(self.0.to_string())
        }
    }

    fn orchestrator(generator: ScriptedGenerator) -> Orchestrator {
        let enricher = ScoreEnricher::new(
            Arc::new(FixedLookup(r#"{"count": 250}"#)),
            Arc::new(FixedLookup(r#"{"current": {"temperature_2m": 18, "precipitation": 62}}"#)),
        )
        .with_seed(5);
        Orchestrator::new(Arc::new(generator), enricher, GenerationSettings::default())
    }

    fn records(n: usize) -> String {
        let items: Vec<JsonValue> = (1..=n)
            .map(|i| json!({"title": format!("Project {i}"), "url": format!("p{i}.org"), "location": "Tasmania"}))
            .collect();
        format!("```json\n{}\n```", JsonValue::Array(items))
    }

    #[test]
    fn config_reads_variables_with_defaults() {
        let vars: HashMap<&str, &str> = [
            ("MEADOWLARK_GENERATION_URL", "http://localhost:9000/invoke"),
            ("MEADOWLARK_HTTP_TIMEOUT_SECS", "5"),
            ("MEADOWLARK_TEMPERATURE", "not-a-number"),
            ("MEADOWLARK_MAX_TOKENS", " 2048 "),
        ]
        .into_iter()
        .collect();
        let config = PipelineConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.generation_url.as_deref(), Some("http://localhost:9000/invoke"));
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.conservation_url, DEFAULT_CONSERVATION_URL);
        assert_eq!(config.climate_url, DEFAULT_CLIMATE_URL);
        assert_eq!(config.geocoding_url, DEFAULT_GEOCODING_URL);
        assert!(config.generation_api_key.is_none());
    }

    #[test]
    fn config_loads_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "generation_url: https://gen.internal/run\nhttp_concurrency: 4\nenrichment_seed: 9").unwrap();
        let config = PipelineConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.generation_url.as_deref(), Some("https://gen.internal/run"));
        assert_eq!(config.http_concurrency, 4);
        assert_eq!(config.enrichment_seed, Some(9));
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn missing_yaml_file_is_reported_with_path() {
        let err = PipelineConfig::from_yaml_file("/nonexistent/meadowlark.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/meadowlark.yaml"));
    }

    #[test]
    fn generation_request_carries_preferences_and_settings() {
        let request = build_generation_request(&preferences(), &GenerationSettings::default());
        assert_eq!(request["anthropic_version"], ANTHROPIC_VERSION);
        assert_eq!(request["max_tokens"], 4096);
        assert_eq!(request["messages"][0]["role"], "user");
        let content = request["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("- Region: Oceania"));
        assert!(content.contains("- Risk Tolerance: low"));
        assert!(content.contains("verification_source"));
        assert!(content.contains("3-5 opportunities"));
    }

    #[test]
    fn fallen_back_only_reachable_before_enrichment() {
        use PipelineState::*;
        for stage in [Requesting, Parsing, Normalizing] {
            assert!(stage.can_transition_to(FallenBack));
        }
        assert!(!Enriching.can_transition_to(FallenBack));
        assert!(!Idle.can_transition_to(FallenBack));
        assert!(Succeeded.is_terminal() && FallenBack.is_terminal());
    }

    #[tokio::test]
    async fn fenced_two_record_response_succeeds() {
        let raw = "Here is the result:\n```json\n{\"opportunities\":[{\"title\":\"Reef Fund\",\"url\":\"reef.org\",\"location\":\"Fiji\"},{\"title\":\"Ag Fund\",\"url\":\"https://ag.org\",\"location\":\"Kenya\"}]}\n```";
        let orch = orchestrator(ScriptedGenerator::replying(vec![Ok(raw.to_string())]));
        let report = orch.run(&preferences()).await;

        use PipelineState::*;
        assert_eq!(
            report.transitions,
            vec![Idle, Requesting, Parsing, Normalizing, Enriching, Succeeded]
        );
        assert!(!report.output.used_fallback);
        assert!(report.output.error_detail.is_none());
        let urls: Vec<&str> = report
            .output
            .opportunities
            .iter()
            .map(|o| o.opportunity.url.as_str())
            .collect();
        assert_eq!(urls, vec!["https://reef.org", "https://ag.org"]);
        assert_eq!(report.output.opportunities[0].conservation_score, 75);
    }

    #[tokio::test]
    async fn unparseable_response_falls_back_from_parsing() {
        let orch = orchestrator(ScriptedGenerator::replying(vec![Ok(
            "I cannot comply with this request.".to_string(),
        )]));
        let report = orch.run(&preferences()).await;
        assert_eq!(report.terminal_state(), PipelineState::FallenBack);
        assert_eq!(report.transitions[report.transitions.len() - 2], PipelineState::Parsing);
        assert!(report.output.used_fallback);
        assert_eq!(report.output.opportunities.len(), 3);
        assert!(report.output.error_detail.unwrap().contains("envelope"));
    }

    #[tokio::test]
    async fn generation_failure_falls_back_from_requesting() {
        let orch = orchestrator(ScriptedGenerator::replying(vec![Err("generation endpoint")]));
        let report = orch.run(&preferences()).await;
        use PipelineState::*;
        assert_eq!(report.transitions, vec![Idle, Requesting, FallenBack]);
        assert!(report.output.used_fallback);
    }

    #[tokio::test]
    async fn single_record_falls_back_from_normalizing() {
        let orch = orchestrator(ScriptedGenerator::replying(vec![Ok(records(1))]));
        let report = orch.run(&preferences()).await;
        assert_eq!(report.transitions[report.transitions.len() - 2], PipelineState::Normalizing);
        assert!(report.output.error_detail.unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn seven_candidates_are_truncated_to_six() {
        let orch = orchestrator(ScriptedGenerator::replying(vec![Ok(records(7))]));
        let report = orch.run(&preferences()).await;
        assert!(!report.output.used_fallback);
        let titles: Vec<&str> = report
            .output
            .opportunities
            .iter()
            .map(|o| o.opportunity.title.as_str())
            .collect();
        assert_eq!(
            titles,
            vec!["Project 1", "Project 2", "Project 3", "Project 4", "Project 5", "Project 6"]
        );
    }

    #[tokio::test]
    async fn superseded_submission_still_returns_its_own_collection() {
        let mut generator = ScriptedGenerator::replying(vec![Ok(records(2)), Ok(records(3))]);
        generator.first_call_delay = Some(Duration::from_millis(100));
        let orch = orchestrator(generator);
        let prefs = preferences();

        let (first, second) = tokio::join!(orch.submit(&prefs), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            orch.submit(&prefs).await
        });

        match &first {
            Submission::Superseded { report, newest } => {
                assert_eq!(report.generation, 1);
                assert_eq!(*newest, 2);
                assert_eq!(report.terminal_state(), PipelineState::Succeeded);
                assert_eq!(report.output.opportunities.len(), 2);
            }
            other => panic!("expected superseded submission, got {other:?}"),
        }
        assert!(second.is_applied());
        assert_eq!(second.report().generation, 2);

        let latest = orch.latest().await.unwrap();
        assert_eq!(latest.opportunities.len(), 3);
    }

    #[tokio::test]
    async fn diagnostic_run_does_not_supersede_inflight_submission() {
        let mut generator = ScriptedGenerator::replying(vec![Ok(records(2)), Ok(records(4))]);
        generator.first_call_delay = Some(Duration::from_millis(100));
        let orch = orchestrator(generator);
        let prefs = preferences();

        let (submitted, ran) = tokio::join!(orch.submit(&prefs), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            orch.run(&prefs).await
        });

        assert!(submitted.is_applied());
        assert_eq!(submitted.report().generation, 1);
        assert_eq!(ran.generation, 1);
        assert_eq!(orch.current_generation(), 1);
        assert_eq!(orch.latest().await.unwrap().opportunities.len(), 2);
    }

    #[tokio::test]
    async fn latest_is_empty_until_a_submission_applies() {
        let orch = orchestrator(ScriptedGenerator::replying(vec![Ok(records(2))]));
        assert!(orch.latest().await.is_none());
        orch.run(&preferences()).await;
        assert!(orch.latest().await.is_none());
        assert!(matches!(orch.submit(&preferences()).await, Submission::Applied(_)));
        assert!(orch.latest().await.is_some());
    }

    #[test]
    fn parse_only_reports_stage_errors() {
        let orch = orchestrator(ScriptedGenerator::replying(Vec::new()));
        let err = orch.parse_only("nothing here").unwrap_err();
        assert_eq!(err.stage(), PipelineState::Parsing);
        assert_eq!(orch.parse_only(&records(4)).unwrap().len(), 4);
    }
}
