//! Score enrichment for validated opportunities and the offline fallback set.

use std::sync::Arc;

use futures::future::join_all;
use meadowlark_core::{
    clamp_score, format_thousands, round_to_tenth, CanonicalOpportunity, DisplayMetrics,
    EnrichedOpportunity, EnvironmentalMetrics, FinancialMetrics, InvestmentPreferences, Region,
    RunContext, ScoreProvenance, ScoreSource, FALLBACK_OPPORTUNITIES,
};
use meadowlark_ingest::{ValidatedCollection, FIELD_PLACEHOLDER};
use meadowlark_remote::{RemoteError, ScoreLookup};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "meadowlark-enrich";

pub const DEFAULT_TEMPERATURE_C: f64 = 15.0;
pub const DEFAULT_PRECIPITATION_MM: f64 = 50.0;
const OPTIMAL_TEMPERATURE_C: f64 = 17.5;
const OPTIMAL_PRECIPITATION_MM: f64 = 60.0;

// ---------------------------------------------------------------------------
// Payload -> score
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConservationReading {
    pub score: u8,
    pub species_count: u64,
    pub threatened_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClimateReading {
    pub score: u8,
    pub temperature: f64,
    pub precipitation: f64,
}

impl ClimateReading {
    pub fn stability(&self) -> f64 {
        f64::from(self.score) / 100.0
    }
}

fn payload_object(payload: &str) -> Result<JsonMap<String, JsonValue>, RemoteError> {
    match serde_json::from_str::<JsonValue>(payload) {
        Ok(JsonValue::Object(object)) => Ok(object),
        Ok(_) => Err(RemoteError::MalformedPayload(
            "expected a JSON object".to_string(),
        )),
        Err(err) => Err(RemoteError::MalformedPayload(err.to_string())),
    }
}

/// Zero and non-numeric values count as absent.
fn nonzero_number(value: Option<&JsonValue>) -> Option<f64> {
    value
        .and_then(JsonValue::as_f64)
        .filter(|n| n.is_finite() && *n != 0.0)
}

fn as_count(value: f64) -> u64 {
    value.max(0.0).round() as u64
}

/// Occurrence count from `count`, else the length of `results`.
pub fn conservation_reading(payload: &str) -> Result<ConservationReading, RemoteError> {
    let object = payload_object(payload)?;
    let count = nonzero_number(object.get("count"))
        .or_else(|| {
            object
                .get("results")
                .and_then(JsonValue::as_array)
                .map(|r| r.len() as f64)
        })
        .unwrap_or(0.0);
    let threatened = nonzero_number(object.get("threatened")).unwrap_or(0.0);

    let base = (50.0 + count / 10.0).min(100.0);
    let bonus = if threatened > 0.0 { 10.0 } else { 0.0 };

    Ok(ConservationReading {
        score: clamp_score((base + bonus).min(100.0)),
        species_count: as_count(count),
        threatened_count: as_count(threatened),
    })
}

pub fn climate_reading(payload: &str) -> Result<ClimateReading, RemoteError> {
    let object = payload_object(payload)?;
    let current = object.get("current");
    let temperature = nonzero_number(current.and_then(|c| c.get("temperature_2m")))
        .or_else(|| nonzero_number(object.get("temperature")))
        .unwrap_or(DEFAULT_TEMPERATURE_C);
    let precipitation = nonzero_number(current.and_then(|c| c.get("precipitation")))
        .or_else(|| nonzero_number(object.get("precipitation")))
        .unwrap_or(DEFAULT_PRECIPITATION_MM);

    let temp_score = (100.0 - (temperature - OPTIMAL_TEMPERATURE_C).abs() * 3.0).max(0.0);
    let precip_score = (100.0 - (precipitation - OPTIMAL_PRECIPITATION_MM).abs() * 1.5).max(0.0);

    Ok(ClimateReading {
        score: clamp_score(temp_score * 0.6 + precip_score * 0.4),
        temperature,
        precipitation,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaselineScores {
    pub conservation: u8,
    pub economic: u8,
}

/// Local stand-in scores for a record whose lookups failed. `base` is
/// expected in `[70, 90)`.
pub fn baseline_scores(preferences: &InvestmentPreferences, base: f64) -> BaselineScores {
    let risk = preferences.risk_multiplier();
    BaselineScores {
        conservation: clamp_score((base * risk).round().min(95.0)),
        economic: clamp_score(((base + 5.0) * preferences.return_multiplier()).round().min(92.0)),
    }
}

// ---------------------------------------------------------------------------
// ScoreEnricher
// ---------------------------------------------------------------------------

/// Random inputs for one record, drawn before any lookup is awaited.
#[derive(Debug, Clone, Copy)]
pub struct RecordDraws {
    pub base: f64,
    pub return_jitter: f64,
    pub biodiversity: f64,
    pub climate: f64,
    pub carbon: f64,
    pub species: f64,
    pub land: f64,
    pub water: f64,
    pub resilience: f64,
}

impl RecordDraws {
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        Self {
            base: rng.random_range(70.0..90.0),
            return_jitter: rng.random(),
            biodiversity: rng.random(),
            climate: rng.random(),
            carbon: rng.random(),
            species: rng.random(),
            land: rng.random(),
            water: rng.random(),
            resilience: rng.random(),
        }
    }
}

pub struct ScoreEnricher {
    conservation: Arc<dyn ScoreLookup>,
    climate: Arc<dyn ScoreLookup>,
    seed: Option<u64>,
}

impl ScoreEnricher {
    pub fn new(conservation: Arc<dyn ScoreLookup>, climate: Arc<dyn ScoreLookup>) -> Self {
        Self {
            conservation,
            climate,
            seed: None,
        }
    }

    /// Fixes the jitter source for reproducible output.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn draws(&self, count: usize) -> Vec<RecordDraws> {
        match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..count).map(|_| RecordDraws::sample(&mut rng)).collect()
            }
            None => {
                let mut rng = rand::rng();
                (0..count).map(|_| RecordDraws::sample(&mut rng)).collect()
            }
        }
    }

    /// Two independent lookups per record, all records concurrently. Output
    /// order matches input order and no record is ever dropped.
    pub async fn enrich(
        &self,
        ctx: &RunContext,
        collection: &ValidatedCollection,
        preferences: &InvestmentPreferences,
    ) -> Vec<EnrichedOpportunity> {
        let draws = self.draws(collection.len());
        let tasks = collection
            .iter()
            .zip(draws)
            .enumerate()
            .map(|(index, (opportunity, draws))| {
                self.enrich_one(ctx, index, opportunity, preferences, draws)
            });
        let enriched = join_all(tasks).await;
        info!(
            run_id = %ctx.run_id,
            records = enriched.len(),
            remote_conservation = enriched
                .iter()
                .filter(|o| o.score_sources.conservation == ScoreSource::Remote)
                .count(),
            "enrichment complete"
        );
        enriched
    }

    async fn enrich_one(
        &self,
        ctx: &RunContext,
        index: usize,
        opportunity: &CanonicalOpportunity,
        preferences: &InvestmentPreferences,
        draws: RecordDraws,
    ) -> EnrichedOpportunity {
        let location = opportunity.location.as_str();
        let (conservation, climate) = tokio::join!(
            self.conservation_lookup(ctx, location),
            self.climate_lookup(ctx, location)
        );
        assemble(
            format!("ai-{}", index + 1),
            opportunity.clone(),
            preferences,
            conservation,
            climate,
            draws,
        )
    }

    async fn conservation_lookup(
        &self,
        ctx: &RunContext,
        location: &str,
    ) -> Option<ConservationReading> {
        let result = self
            .conservation
            .lookup(ctx, location)
            .await
            .and_then(|payload| conservation_reading(&payload));
        match result {
            Ok(reading) => {
                debug!(
                    collaborator = self.conservation.name(),
                    location,
                    score = reading.score,
                    species = reading.species_count,
                    "conservation score resolved"
                );
                Some(reading)
            }
            Err(err) => {
                warn!(
                    run_id = %ctx.run_id,
                    collaborator = self.conservation.name(),
                    location,
                    transport = err.is_transport(),
                    error = %err,
                    "conservation lookup failed, using baseline"
                );
                None
            }
        }
    }

    async fn climate_lookup(&self, ctx: &RunContext, location: &str) -> Option<ClimateReading> {
        let result = self
            .climate
            .lookup(ctx, location)
            .await
            .and_then(|payload| climate_reading(&payload));
        match result {
            Ok(reading) => {
                debug!(
                    collaborator = self.climate.name(),
                    location,
                    score = reading.score,
                    temperature = reading.temperature,
                    precipitation = reading.precipitation,
                    "economic score resolved"
                );
                Some(reading)
            }
            Err(err) => {
                warn!(
                    run_id = %ctx.run_id,
                    collaborator = self.climate.name(),
                    location,
                    transport = err.is_transport(),
                    error = %err,
                    "climate lookup failed, using baseline"
                );
                None
            }
        }
    }
}

fn source_of<T>(reading: &Option<T>) -> ScoreSource {
    if reading.is_some() {
        ScoreSource::Remote
    } else {
        ScoreSource::Baseline
    }
}

/// Folds lookup outcomes and draws into the terminal record. Each derived
/// figure is computed once and reused by the highlights.
fn assemble(
    id: String,
    opportunity: CanonicalOpportunity,
    preferences: &InvestmentPreferences,
    conservation: Option<ConservationReading>,
    climate: Option<ClimateReading>,
    draws: RecordDraws,
) -> EnrichedOpportunity {
    let baseline = baseline_scores(preferences, draws.base);
    let amount = preferences.investment_amount.max(0.0);

    let conservation_score = conservation.map_or(baseline.conservation, |r| r.score);
    let economic_score = climate.map_or(baseline.economic, |r| r.score);
    let species_count = conservation.map_or(0, |r| r.species_count);
    let climate_stability = climate.map_or(0.0, |r| r.stability());

    let projected_return = round_to_tenth(
        preferences.minimum_return
            * (1.1 + 0.3 * draws.return_jitter)
            * preferences.return_multiplier(),
    );
    let biodiversity_index = match conservation {
        Some(reading) => (reading.species_count as f64 / 100.0).min(1.0),
        None => 0.7 + 0.25 * draws.biodiversity,
    };
    let climate_score = 0.65 + 0.25 * draws.climate;
    let carbon_offset = as_count(amount * (0.5 + 0.4 * draws.carbon));
    let species_protected = if species_count > 0 {
        species_count
    } else {
        as_count(30.0 + 40.0 * draws.species)
    };
    let land_restored = as_count(amount * 0.002 * (0.8 + 0.4 * draws.land));
    let climate_resilience_score = if climate_stability > 0.0 {
        climate_stability * 100.0
    } else {
        75.0 + 15.0 * draws.resilience
    };

    let highlights = vec![
        format!("{species_protected} species protected"),
        format!("{} tons CO₂ offset annually", format_thousands(carbon_offset)),
        format!("{} hectares restored", format_thousands(land_restored)),
        if opportunity.verified {
            "Verified by independent auditors".to_string()
        } else {
            "Pending verification".to_string()
        },
    ];

    EnrichedOpportunity {
        id,
        conservation_score,
        economic_score,
        species_count,
        climate_stability,
        score_sources: ScoreProvenance {
            conservation: source_of(&conservation),
            economic: source_of(&climate),
        },
        metrics: DisplayMetrics {
            investment_amount: amount,
            projected_return,
            biodiversity_index,
            climate_score,
            carbon_offset,
            species_protected,
            land_restored,
            sdg_targets: preferences.sdgs.clone(),
            risk_level: preferences.risk_tolerance,
            timeline: preferences.investment_horizon,
            highlights,
            environmental: EnvironmentalMetrics {
                biodiversity_score: biodiversity_index * 100.0,
                climate: climate_score * 100.0,
                water_quality_index: 70.0 + 20.0 * draws.water,
                carbon_sequestration_tons: carbon_offset,
                climate_resilience_score,
            },
            financial: FinancialMetrics {
                project_roi: projected_return,
                risk_level: preferences.risk_tolerance,
                investment_yield_percent: projected_return,
            },
        },
        opportunity,
    }
}

// ---------------------------------------------------------------------------
// FallbackSynthesizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionBaseline {
    pub biodiversity: f64,
    pub climate: f64,
}

pub fn region_baseline(region: Region) -> RegionBaseline {
    let (biodiversity, climate) = match region {
        Region::NorthAmerica => (0.72, 0.68),
        Region::SouthAmerica => (0.89, 0.85),
        Region::Europe => (0.65, 0.62),
        Region::Africa => (0.91, 0.78),
        Region::Asia => (0.83, 0.76),
        Region::Oceania => (0.88, 0.81),
    };
    RegionBaseline {
        biodiversity,
        climate,
    }
}

#[derive(Debug, Clone, Copy)]
enum Figure {
    Species(&'static str),
    Carbon,
    Land,
}

struct Archetype {
    title_suffix: &'static str,
    url: &'static str,
    registry: &'static str,
    description: &'static str,
    conservation_weights: (f64, f64),
    conservation_cap: f64,
    economic_base: f64,
    economic_slope: f64,
    economic_cap: f64,
    return_factor: f64,
    biodiversity_factor: f64,
    climate_factor: f64,
    carbon_factor: f64,
    species_factor: f64,
    land_factor: f64,
    water_quality: f64,
    climate_resilience: f64,
    figures: &'static [Figure],
    notes: &'static [&'static str],
}

const ARCHETYPES: [Archetype; FALLBACK_OPPORTUNITIES] = [
    Archetype {
        title_suffix: "Reforestation Initiative",
        url: "https://registry.verra.org/",
        registry: "Verra",
        description: "A comprehensive reforestation project in {region} focused on restoring native ecosystems while generating sustainable returns through carbon credits and eco-tourism.",
        conservation_weights: (85.0, 15.0),
        conservation_cap: 95.0,
        economic_base: 70.0,
        economic_slope: 2.0,
        economic_cap: 92.0,
        return_factor: 1.2,
        biodiversity_factor: 1.0,
        climate_factor: 1.0,
        carbon_factor: 0.8,
        species_factor: 45.0,
        land_factor: 0.002,
        water_quality: 75.0,
        climate_resilience: 82.0,
        figures: &[Figure::Species("species protected"), Figure::Carbon, Figure::Land],
        notes: &["Community-led conservation model"],
    },
    Archetype {
        title_suffix: "Sustainable Agriculture Fund",
        url: "https://www.goldstandard.org/",
        registry: "Gold Standard",
        description: "Innovative sustainable agriculture initiative combining regenerative farming practices with biodiversity conservation in {region}.",
        conservation_weights: (70.0, 30.0),
        conservation_cap: 88.0,
        economic_base: 75.0,
        economic_slope: 2.2,
        economic_cap: 95.0,
        return_factor: 1.4,
        biodiversity_factor: 0.85,
        climate_factor: 0.95,
        carbon_factor: 0.6,
        species_factor: 32.0,
        land_factor: 0.0025,
        water_quality: 80.0,
        climate_resilience: 78.0,
        figures: &[Figure::Species("species protected"), Figure::Carbon],
        notes: &["Regenerative farming practices", "Local farmer partnerships"],
    },
    Archetype {
        title_suffix: "Marine Conservation Project",
        url: "https://www.conservation.org/",
        registry: "Verra",
        description: "Coastal and marine ecosystem restoration project in {region} protecting critical ocean habitats and supporting sustainable fisheries.",
        conservation_weights: (90.0, 10.0),
        conservation_cap: 93.0,
        economic_base: 68.0,
        economic_slope: 1.8,
        economic_cap: 87.0,
        return_factor: 1.1,
        biodiversity_factor: 0.95,
        climate_factor: 0.7,
        carbon_factor: 0.5,
        species_factor: 58.0,
        land_factor: 0.0015,
        water_quality: 88.0,
        climate_resilience: 85.0,
        figures: &[Figure::Species("marine species protected")],
        notes: &[
            "Coral reef restoration",
            "Sustainable fisheries support",
            "Blue carbon sequestration",
        ],
    },
];

/// Deterministic substitute collection built from preferences alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackSynthesizer;

impl FallbackSynthesizer {
    pub fn synthesize(preferences: &InvestmentPreferences) -> Vec<EnrichedOpportunity> {
        let baseline = region_baseline(preferences.region);
        let records: Vec<EnrichedOpportunity> = ARCHETYPES
            .iter()
            .enumerate()
            .map(|(index, archetype)| synthesize_one(index, archetype, baseline, preferences))
            .collect();
        info!(
            region = preferences.region.slug(),
            records = records.len(),
            "synthesized fallback opportunities"
        );
        records
    }
}

fn synthesize_one(
    index: usize,
    archetype: &Archetype,
    baseline: RegionBaseline,
    preferences: &InvestmentPreferences,
) -> EnrichedOpportunity {
    let RegionBaseline {
        biodiversity: b,
        climate: c,
    } = baseline;
    let region_name = preferences.region.display_name();
    let amount = preferences.investment_amount.max(0.0);
    let risk = preferences.risk_multiplier();
    let growth = preferences.return_multiplier();
    let min_return = preferences.minimum_return;

    let (wb, wc) = archetype.conservation_weights;
    let conservation_score =
        clamp_score(((wb * b + wc * c) * risk).round().min(archetype.conservation_cap));
    let economic_score = clamp_score(
        ((archetype.economic_base + archetype.economic_slope * min_return) * growth)
            .round()
            .min(archetype.economic_cap),
    );
    let projected_return = round_to_tenth(min_return * archetype.return_factor * growth);
    let biodiversity_index = b * archetype.biodiversity_factor;
    let climate_score = c * archetype.climate_factor;
    let carbon_offset = as_count(amount * archetype.carbon_factor * c);
    let species_protected = as_count(b * archetype.species_factor);
    let land_restored = as_count(amount * archetype.land_factor * c);

    let highlights = archetype
        .figures
        .iter()
        .map(|figure| match figure {
            Figure::Species(label) => format!("{species_protected} {label}"),
            Figure::Carbon => format!("{} tons CO₂ offset annually", format_thousands(carbon_offset)),
            Figure::Land => format!("{} hectares restored", format_thousands(land_restored)),
        })
        .chain(archetype.notes.iter().map(|note| note.to_string()))
        .collect();

    let sdg_alignment = if preferences.sdgs.is_empty() {
        FIELD_PLACEHOLDER.to_string()
    } else {
        preferences.sdg_list()
    };

    EnrichedOpportunity {
        id: format!("fallback-{}", index + 1),
        opportunity: CanonicalOpportunity {
            title: format!("{region_name} {}", archetype.title_suffix),
            url: archetype.url.to_string(),
            location: region_name.to_string(),
            description: archetype.description.replace("{region}", region_name),
            region: region_name.to_string(),
            registry: archetype.registry.to_string(),
            verified: true,
            sdg_alignment,
            estimated_return: format!("{projected_return:.1}%"),
            verification_source: archetype.url.to_string(),
        },
        conservation_score,
        economic_score,
        species_count: species_protected,
        climate_stability: climate_score.clamp(0.0, 1.0),
        score_sources: ScoreProvenance {
            conservation: ScoreSource::Baseline,
            economic: ScoreSource::Baseline,
        },
        metrics: DisplayMetrics {
            investment_amount: amount,
            projected_return,
            biodiversity_index,
            climate_score,
            carbon_offset,
            species_protected,
            land_restored,
            sdg_targets: preferences.sdgs.clone(),
            risk_level: preferences.risk_tolerance,
            timeline: preferences.investment_horizon,
            highlights,
            environmental: EnvironmentalMetrics {
                biodiversity_score: biodiversity_index * 100.0,
                climate: climate_score * 100.0,
                water_quality_index: archetype.water_quality,
                carbon_sequestration_tons: carbon_offset,
                climate_resilience_score: archetype.climate_resilience,
            },
            financial: FinancialMetrics {
                project_roi: projected_return,
                risk_level: preferences.risk_tolerance,
                investment_yield_percent: projected_return,
            },
        },
    }
}
