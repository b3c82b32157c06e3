//! Core domain model for Meadowlark: investor preferences, canonical and
//! enriched opportunity records, and the caller-facing pipeline output.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "meadowlark-core";

/// Smallest collection the pipeline accepts from the generation collaborator.
pub const MIN_OPPORTUNITIES: usize = 2;
/// Larger collections are silently truncated to this many records.
pub const MAX_OPPORTUNITIES: usize = 6;
/// Cardinality of every synthesized fallback collection.
pub const FALLBACK_OPPORTUNITIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreferenceParseError {
    #[error("unknown region `{0}`")]
    Region(String),
    #[error("unknown risk tolerance `{0}`")]
    RiskTolerance(String),
    #[error("unknown investment horizon `{0}`")]
    InvestmentHorizon(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Region {
    NorthAmerica,
    SouthAmerica,
    Europe,
    Africa,
    Asia,
    Oceania,
}

impl Region {
    pub const ALL: [Region; 6] = [
        Region::NorthAmerica,
        Region::SouthAmerica,
        Region::Europe,
        Region::Africa,
        Region::Asia,
        Region::Oceania,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Region::NorthAmerica => "north-america",
            Region::SouthAmerica => "south-america",
            Region::Europe => "europe",
            Region::Africa => "africa",
            Region::Asia => "asia",
            Region::Oceania => "oceania",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Region::NorthAmerica => "North America",
            Region::SouthAmerica => "South America",
            Region::Europe => "Europe",
            Region::Africa => "Africa",
            Region::Asia => "Asia",
            Region::Oceania => "Oceania",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Region {
    type Err = PreferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '_'], "-");
        Region::ALL
            .into_iter()
            .find(|r| r.slug() == wanted)
            .ok_or_else(|| PreferenceParseError::Region(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Low,
    Medium,
    High,
}

impl RiskTolerance {
    pub fn multiplier(self) -> f64 {
        match self {
            RiskTolerance::Low => 0.8,
            RiskTolerance::Medium => 1.0,
            RiskTolerance::High => 1.3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskTolerance::Low => "low",
            RiskTolerance::Medium => "medium",
            RiskTolerance::High => "high",
        }
    }
}

impl FromStr for RiskTolerance {
    type Err = PreferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskTolerance::Low),
            "medium" => Ok(RiskTolerance::Medium),
            "high" => Ok(RiskTolerance::High),
            _ => Err(PreferenceParseError::RiskTolerance(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentHorizon {
    Short,
    Medium,
    Long,
}

impl InvestmentHorizon {
    pub fn multiplier(self) -> f64 {
        match self {
            InvestmentHorizon::Short => 0.9,
            InvestmentHorizon::Medium => 1.0,
            InvestmentHorizon::Long => 1.15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvestmentHorizon::Short => "short",
            InvestmentHorizon::Medium => "medium",
            InvestmentHorizon::Long => "long",
        }
    }
}

impl FromStr for InvestmentHorizon {
    type Err = PreferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" => Ok(InvestmentHorizon::Short),
            "medium" => Ok(InvestmentHorizon::Medium),
            "long" => Ok(InvestmentHorizon::Long),
            _ => Err(PreferenceParseError::InvestmentHorizon(s.to_string())),
        }
    }
}

/// What the investor told us. Every downstream stage is a function of this
/// plus whatever the remote collaborators return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentPreferences {
    pub region: Region,
    pub investment_amount: f64,
    #[serde(default)]
    pub sdgs: Vec<u8>,
    pub risk_tolerance: RiskTolerance,
    pub investment_horizon: InvestmentHorizon,
    #[serde(default)]
    pub minimum_return: f64,
}

impl InvestmentPreferences {
    pub fn risk_multiplier(&self) -> f64 {
        self.risk_tolerance.multiplier()
    }

    pub fn horizon_multiplier(&self) -> f64 {
        self.investment_horizon.multiplier()
    }

    /// Combined risk x horizon factor used by return and economic formulas.
    pub fn return_multiplier(&self) -> f64 {
        self.risk_multiplier() * self.horizon_multiplier()
    }

    pub fn sdg_list(&self) -> String {
        self.sdgs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Alias-resolved candidate. `title`, `url` and `location` are never blank and
/// `url` always satisfies [`is_absolute_http_url`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalOpportunity {
    pub title: String,
    pub url: String,
    pub location: String,
    pub description: String,
    pub region: String,
    pub registry: String,
    pub verified: bool,
    pub sdg_alignment: String,
    pub estimated_return: String,
    pub verification_source: String,
}

impl CanonicalOpportunity {
    pub fn satisfies_invariants(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.location.trim().is_empty()
            && is_absolute_http_url(&self.url)
    }
}

/// `http://` or `https://` followed by a non-empty, whitespace-free remainder.
pub fn is_absolute_http_url(candidate: &str) -> bool {
    let rest = strip_http_scheme(candidate);
    match rest {
        Some(rest) => !rest.is_empty() && !rest.starts_with('/') && !rest.chars().any(char::is_whitespace),
        None => false,
    }
}

fn strip_http_scheme(candidate: &str) -> Option<&str> {
    let lower = candidate.get(..8).unwrap_or(candidate).to_ascii_lowercase();
    if lower.starts_with("https://") {
        Some(&candidate[8..])
    } else if lower.starts_with("http://") {
        Some(&candidate[7..])
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Remote,
    Baseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreProvenance {
    pub conservation: ScoreSource,
    pub economic: ScoreSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentalMetrics {
    pub biodiversity_score: f64,
    pub climate: f64,
    pub water_quality_index: f64,
    pub carbon_sequestration_tons: u64,
    pub climate_resilience_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialMetrics {
    #[serde(rename = "projectROI")]
    pub project_roi: f64,
    pub risk_level: RiskTolerance,
    pub investment_yield_percent: f64,
}

/// Presentation figures. Not validated; may vary run to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayMetrics {
    pub investment_amount: f64,
    pub projected_return: f64,
    pub biodiversity_index: f64,
    pub climate_score: f64,
    pub carbon_offset: u64,
    pub species_protected: u64,
    pub land_restored: u64,
    pub sdg_targets: Vec<u8>,
    pub risk_level: RiskTolerance,
    pub timeline: InvestmentHorizon,
    pub highlights: Vec<String>,
    pub environmental: EnvironmentalMetrics,
    pub financial: FinancialMetrics,
}

/// Terminal artifact handed to the caller. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedOpportunity {
    pub id: String,
    #[serde(flatten)]
    pub opportunity: CanonicalOpportunity,
    pub conservation_score: u8,
    pub economic_score: u8,
    pub species_count: u64,
    pub climate_stability: f64,
    pub score_sources: ScoreProvenance,
    pub metrics: DisplayMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOutput {
    pub opportunities: Vec<EnrichedOpportunity>,
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// Identity of one ingestion attempt, threaded through logs and remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(generation: u64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generation,
            started_at: Utc::now(),
        }
    }
}

pub fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Rounds and clamps a raw score into the 0..=100 range.
pub fn clamp_score(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// `12345` -> `"12,345"`.
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_parses_slugs_and_display_names() {
        assert_eq!("south-america".parse::<Region>().unwrap(), Region::SouthAmerica);
        assert_eq!("North America".parse::<Region>().unwrap(), Region::NorthAmerica);
        assert!("antarctica".parse::<Region>().is_err());
        assert_eq!(Region::Oceania.to_string(), "Oceania");
    }

    #[test]
    fn preferences_deserialize_from_camel_case() {
        let prefs: InvestmentPreferences = serde_json::from_str(
            r#"{"region":"africa","investmentAmount":50000,"sdgs":[13,15],
                "riskTolerance":"high","investmentHorizon":"long","minimumReturn":6}"#,
        )
        .unwrap();
        assert_eq!(prefs.region, Region::Africa);
        assert_eq!(prefs.sdg_list(), "13, 15");
        assert!((prefs.return_multiplier() - 1.3 * 1.15).abs() < 1e-9);
    }

    #[test]
    fn url_predicate_requires_scheme_and_host() {
        assert!(is_absolute_http_url("https://reef.org"));
        assert!(is_absolute_http_url("HTTP://reef.org/path"));
        assert!(!is_absolute_http_url("https://"));
        assert!(!is_absolute_http_url("reef.org"));
        assert!(!is_absolute_http_url("https://reef .org"));
        assert!(!is_absolute_http_url("ftp://reef.org"));
    }

    #[test]
    fn score_clamping_and_number_formatting() {
        assert_eq!(clamp_score(100.6), 100);
        assert_eq!(clamp_score(-3.0), 0);
        assert_eq!(clamp_score(f64::NAN), 0);
        assert_eq!(round_to_tenth(7.26), 7.3);
        assert_eq!(format_thousands(0), "0");
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1234567), "1,234,567");
    }

    #[test]
    fn pipeline_output_omits_missing_error_detail() {
        let output = PipelineOutput {
            opportunities: Vec::new(),
            used_fallback: false,
            error_detail: None,
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["usedFallback"], false);
        assert!(json.get("errorDetail").is_none());
    }
}
