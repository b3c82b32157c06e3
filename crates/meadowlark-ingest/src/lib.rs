//! Response ingestion: pull structured data out of free-form model output,
//! unwrap whichever envelope carries it, normalize each candidate onto the
//! canonical record and enforce the collection's cardinality bounds.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use meadowlark_core::{
    is_absolute_http_url, CanonicalOpportunity, MAX_OPPORTUNITIES, MIN_OPPORTUNITIES,
};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "meadowlark-ingest";

/// Untyped candidate object exactly as the model emitted it.
pub type RawCandidate = JsonMap<String, JsonValue>;

/// Nested text envelopes (a string body holding a completion holding a fenced
/// block...) are followed at most this deep.
pub const MAX_ENVELOPE_DEPTH: usize = 4;

const MAX_SCAN_OPENERS: usize = 2048;

pub const DEFAULT_DESCRIPTION: &str =
    "Conservation investment opportunity aligned with your sustainability goals.";
pub const FIELD_PLACEHOLDER: &str = "Not specified";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("response envelope exhausted: no known shape yielded extractable structured data")]
    EnvelopeExhausted,
    #[error(
        "insufficient opportunities: {found} well-formed record(s), need at least {min}",
        min = MIN_OPPORTUNITIES
    )]
    InsufficientOpportunities { found: usize },
}

// ---------------------------------------------------------------------------
// Text -> structured value
// ---------------------------------------------------------------------------

static TAGGED_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json\s*(.*?)```").expect("valid fence regex"));
static UNTAGGED_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*([\[{].*?)```").expect("valid fence regex"));

/// Pulls the first parseable JSON value out of arbitrary text, or `None`.
pub fn extract_json(text: &str) -> Option<JsonValue> {
    if let Some(value) = extract_from_fenced_block(text) {
        debug!("extracted json from fenced block");
        return Some(value);
    }
    if let Some(value) = extract_by_bracket_probes(text) {
        debug!("extracted json by bracket matching");
        return Some(value);
    }
    let value = extract_from_trimmed_text(text);
    if value.is_some() {
        debug!("extracted json from trimmed text");
    }
    value
}

/// Direct parse first, extraction heuristics second.
pub fn parse_text(text: &str) -> Option<JsonValue> {
    match serde_json::from_str::<JsonValue>(text.trim()) {
        Ok(value) => Some(value),
        Err(_) => extract_json(text),
    }
}

fn extract_from_fenced_block(text: &str) -> Option<JsonValue> {
    for fence in [&*TAGGED_FENCE, &*UNTAGGED_FENCE] {
        let Some(inner) = fence.captures(text).and_then(|c| c.get(1)) else {
            continue;
        };
        match serde_json::from_str(inner.as_str().trim()) {
            Ok(value) => return Some(value),
            Err(err) => debug!(error = %err, "fenced block did not parse"),
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
enum SpanProbe {
    ObjectWithList(&'static str),
    ListOfRecordsWithKey(&'static str),
    AnyObject,
    AnyList,
}

const SPAN_PROBES: [SpanProbe; 6] = [
    SpanProbe::ObjectWithList("opportunities"),
    SpanProbe::ListOfRecordsWithKey("title"),
    SpanProbe::ListOfRecordsWithKey("name"),
    SpanProbe::ListOfRecordsWithKey("url"),
    SpanProbe::AnyObject,
    SpanProbe::AnyList,
];

impl SpanProbe {
    fn accepts(self, value: &JsonValue) -> bool {
        match self {
            SpanProbe::ObjectWithList(key) => value.get(key).is_some_and(JsonValue::is_array),
            SpanProbe::ListOfRecordsWithKey(key) => value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| item.get(key).is_some())),
            SpanProbe::AnyObject => value.is_object(),
            SpanProbe::AnyList => value.is_array(),
        }
    }
}

/// Picks the span matching the earliest probe, the first such span on ties.
/// Spans are parsed one at a time and the scan stops at a top-ranked match.
fn extract_by_bracket_probes(text: &str) -> Option<JsonValue> {
    let mut best: Option<(usize, JsonValue)> = None;
    for value in parseable_spans(text) {
        let Some(rank) = SPAN_PROBES.iter().position(|probe| probe.accepts(&value)) else {
            continue;
        };
        if rank == 0 {
            debug!(probe = ?SPAN_PROBES[0], "bracket probe matched");
            return Some(value);
        }
        if best.as_ref().map_or(true, |(current, _)| rank < *current) {
            best = Some((rank, value));
        }
    }
    let (rank, value) = best?;
    debug!(probe = ?SPAN_PROBES[rank], "bracket probe matched");
    Some(value)
}

/// Balanced `{..}` / `[..]` spans that parse, in start-offset order.
fn parseable_spans(text: &str) -> impl Iterator<Item = JsonValue> + '_ {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .take(MAX_SCAN_OPENERS)
        .filter_map(move |(start, _)| balanced_span_end(text, start).map(|end| &text[start..end]))
        .filter_map(|span| serde_json::from_str::<JsonValue>(span).ok())
}

/// Byte offset one past the bracket closing the one at `start`. String
/// literals are skipped so brackets inside them do not count.
fn balanced_span_end(text: &str, start: usize) -> Option<usize> {
    let mut closers: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => closers.push(b'}'),
            b'[' => closers.push(b']'),
            b'}' | b']' => {
                if closers.pop() != Some(byte) {
                    return None;
                }
                if closers.is_empty() {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_from_trimmed_text(text: &str) -> Option<JsonValue> {
    let start = text.find(|c: char| c == '{' || c == '[')?;
    let end = text.rfind(|c: char| c == '}' || c == ']')?;
    if end < start {
        return None;
    }
    let cleaned = text[start..=end].replace('\r', "").replace('\n', " ");
    serde_json::from_str(cleaned.trim()).ok()
}

// ---------------------------------------------------------------------------
// Envelope unwrapping
// ---------------------------------------------------------------------------

/// Field names that, when holding a list, are taken as the candidate list
/// after the more specific shapes have been ruled out.
pub const ALTERNATE_LIST_FIELDS: [&str; 6] =
    ["results", "items", "projects", "investments", "data", "list"];

/// Closed set of wrapper shapes the generation collaborator has been seen to
/// return. Text-bearing variants carry the embedded text to re-parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Envelope<'a> {
    ProxyBody(&'a JsonValue),
    Completion(&'a str),
    ContentBlocks(&'a str),
    ConverseOutput(&'a str),
    CandidateList(&'a [JsonValue]),
    CandidateText(&'a str),
    BareList(&'a [JsonValue]),
    OutputText(&'a str),
    MessageContent(&'a str),
    AlternateList {
        field: &'static str,
        items: &'a [JsonValue],
    },
    EncodedText(&'a str),
    SingleRecord(&'a RawCandidate),
    Unrecognized,
}

impl<'a> Envelope<'a> {
    /// Shapes are tried in a fixed order, most specific first.
    pub fn classify(root: &'a JsonValue) -> Self {
        let object = match root {
            JsonValue::Array(items) => return Envelope::BareList(items),
            JsonValue::String(text) => return Envelope::EncodedText(text),
            JsonValue::Object(object) => object,
            _ => return Envelope::Unrecognized,
        };

        if let Some(body) = object.get("body").filter(|b| !b.is_null()) {
            return Envelope::ProxyBody(body);
        }
        if let Some(text) = non_blank_str(object.get("completion")) {
            return Envelope::Completion(text);
        }
        if let Some(text) = object.get("content").and_then(first_text_block) {
            return Envelope::ContentBlocks(text);
        }
        if let Some(text) = object
            .get("output")
            .and_then(|o| o.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(first_text_block)
        {
            return Envelope::ConverseOutput(text);
        }
        match object.get("opportunities") {
            Some(JsonValue::Array(items)) => return Envelope::CandidateList(items),
            Some(JsonValue::String(text)) if !text.trim().is_empty() => {
                return Envelope::CandidateText(text)
            }
            _ => {}
        }
        if let Some(text) = non_blank_str(object.get("outputText")) {
            return Envelope::OutputText(text);
        }
        if let Some(content) = object.get("message").and_then(|m| m.get("content")) {
            let text = non_blank_str(Some(content)).or_else(|| first_text_block(content));
            if let Some(text) = text {
                return Envelope::MessageContent(text);
            }
        }
        for field in ALTERNATE_LIST_FIELDS {
            if let Some(JsonValue::Array(items)) = object.get(field) {
                return Envelope::AlternateList { field, items };
            }
        }
        Envelope::SingleRecord(object)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ProxyBody(_) => "proxy_body",
            Envelope::Completion(_) => "completion",
            Envelope::ContentBlocks(_) => "content_blocks",
            Envelope::ConverseOutput(_) => "converse_output",
            Envelope::CandidateList(_) => "candidate_list",
            Envelope::CandidateText(_) => "candidate_text",
            Envelope::BareList(_) => "bare_list",
            Envelope::OutputText(_) => "output_text",
            Envelope::MessageContent(_) => "message_content",
            Envelope::AlternateList { .. } => "alternate_list",
            Envelope::EncodedText(_) => "encoded_text",
            Envelope::SingleRecord(_) => "single_record",
            Envelope::Unrecognized => "unrecognized",
        }
    }

    fn embedded_text(&self) -> Option<&'a str> {
        match *self {
            Envelope::Completion(text)
            | Envelope::ContentBlocks(text)
            | Envelope::ConverseOutput(text)
            | Envelope::CandidateText(text)
            | Envelope::OutputText(text)
            | Envelope::MessageContent(text)
            | Envelope::EncodedText(text) => Some(text),
            _ => None,
        }
    }
}

fn non_blank_str(value: Option<&JsonValue>) -> Option<&str> {
    value
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// First element of a message-content list that carries inline text.
fn first_text_block(content: &JsonValue) -> Option<&str> {
    content
        .as_array()?
        .iter()
        .find_map(|block| non_blank_str(block.get("text")))
}

/// Locates the candidate list inside `root`. An unmatched shape yields an
/// empty list; emptiness is reported by [`validate`].
pub fn unwrap_envelope(root: &JsonValue) -> Vec<RawCandidate> {
    unwrap_at_depth(root, 0).unwrap_or_default()
}

fn unwrap_at_depth(root: &JsonValue, depth: usize) -> Result<Vec<RawCandidate>, IngestError> {
    if depth > MAX_ENVELOPE_DEPTH {
        warn!(depth, "envelope nesting too deep");
        return Err(IngestError::EnvelopeExhausted);
    }
    let envelope = Envelope::classify(root);
    debug!(shape = envelope.kind(), depth, "classified response envelope");

    if let Some(text) = envelope.embedded_text() {
        let inner = parse_text(text).ok_or_else(|| {
            warn!(shape = envelope.kind(), "embedded text held no structured data");
            IngestError::EnvelopeExhausted
        })?;
        return unwrap_at_depth(&inner, depth + 1);
    }

    match envelope {
        Envelope::ProxyBody(body) => unwrap_at_depth(body, depth + 1),
        Envelope::CandidateList(items) | Envelope::BareList(items) => Ok(candidates_from(items)),
        Envelope::AlternateList { field, items } => {
            debug!(field, "candidate list found under alternate field");
            Ok(candidates_from(items))
        }
        Envelope::SingleRecord(record) => Ok(vec![record.clone()]),
        _ => Err(IngestError::EnvelopeExhausted),
    }
}

fn candidates_from(items: &[JsonValue]) -> Vec<RawCandidate> {
    items
        .iter()
        .filter_map(|item| match item {
            JsonValue::Object(record) => Some(record.clone()),
            other => {
                debug!(kind = json_kind(other), "skipping non-object list element");
                None
            }
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Raw collaborator text to the list of raw candidates it carries.
pub fn parse_response(raw: &str) -> Result<Vec<RawCandidate>, IngestError> {
    debug!(length = raw.len(), "parsing generation response");
    let root = parse_text(raw).ok_or_else(|| {
        warn!("response contained no extractable structured data");
        IngestError::EnvelopeExhausted
    })?;
    unwrap_at_depth(&root, 0)
}

// ---------------------------------------------------------------------------
// Field normalization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Title,
    Url,
    Location,
    Description,
    Region,
    Registry,
    SdgAlignment,
    EstimatedReturn,
    VerificationSource,
}

impl CanonicalField {
    /// Source key names probed in order; the first present, non-blank value wins.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            CanonicalField::Title => &[
                "title",
                "name",
                "projectName",
                "project_name",
                "opportunityName",
                "opportunity_name",
                "project",
            ],
            CanonicalField::Url => &[
                "url",
                "link",
                "website",
                "verification_source",
                "verificationSource",
                "source",
                "investmentUrl",
                "investment_url",
                "href",
                "web",
            ],
            CanonicalField::Location => &[
                "location",
                "region",
                "area",
                "country",
                "geographic_location",
                "geographicLocation",
            ],
            CanonicalField::Description => &[
                "description",
                "relevance",
                "reason",
                "summary",
                "details",
                "overview",
                "about",
                "info",
            ],
            CanonicalField::Region => &["region", "location", "area", "country"],
            CanonicalField::Registry => &["registry", "certification", "verifier", "certifier"],
            CanonicalField::SdgAlignment => &["sdg_alignment", "sdgAlignment", "sdgs"],
            CanonicalField::EstimatedReturn => &["estimated_return", "estimatedReturn", "return"],
            CanonicalField::VerificationSource => &["verification_source", "verificationSource"],
        }
    }

    pub fn probe(self, raw: &RawCandidate) -> Option<String> {
        self.aliases()
            .iter()
            .filter_map(|alias| raw.get(*alias))
            .find_map(field_text)
    }
}

/// Renders a JSON value as field text. Scalars and lists of scalars are
/// accepted; blank strings and nested structures are not.
fn field_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::Array(_) | JsonValue::Object(_) => None,
                scalar => field_text(scalar),
            })
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Null | JsonValue::Object(_) => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Accepts `http(s)://` URLs as-is, promotes bare domains to `https://`, and
/// rejects everything else. Idempotent on its own output.
pub fn repair_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "#" {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else if trimmed.contains('.') && !trimmed.chars().any(char::is_whitespace) {
        format!("https://{trimmed}")
    } else {
        return None;
    };
    if is_absolute_http_url(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

fn explicit_verified(raw: &RawCandidate) -> Option<bool> {
    match raw.get("verified")? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Maps one loosely-shaped candidate onto the canonical record. Returns `None`
/// when title, a repairable url, or location is missing.
pub fn normalize(raw: &RawCandidate) -> Option<CanonicalOpportunity> {
    let Some(title) = CanonicalField::Title.probe(raw) else {
        warn!("candidate rejected: missing title");
        return None;
    };
    let url = match CanonicalField::Url.probe(raw) {
        Some(value) => match repair_url(&value) {
            Some(url) => url,
            None => {
                warn!(title = %title, url = %value, "candidate rejected: unusable url");
                return None;
            }
        },
        None => {
            warn!(title = %title, "candidate rejected: missing url");
            return None;
        }
    };
    let Some(location) = CanonicalField::Location.probe(raw) else {
        warn!(title = %title, "candidate rejected: missing location");
        return None;
    };

    let registry = CanonicalField::Registry.probe(raw).unwrap_or_default();
    let verified = explicit_verified(raw).unwrap_or(!registry.is_empty());
    let verification_source = CanonicalField::VerificationSource
        .probe(raw)
        .unwrap_or_else(|| url.clone());

    Some(CanonicalOpportunity {
        description: CanonicalField::Description
            .probe(raw)
            .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
        region: CanonicalField::Region
            .probe(raw)
            .unwrap_or_else(|| location.clone()),
        registry,
        verified,
        sdg_alignment: CanonicalField::SdgAlignment
            .probe(raw)
            .unwrap_or_else(|| FIELD_PLACEHOLDER.to_string()),
        estimated_return: CanonicalField::EstimatedReturn
            .probe(raw)
            .unwrap_or_else(|| FIELD_PLACEHOLDER.to_string()),
        verification_source,
        title,
        url,
        location,
    })
}

pub fn normalize_all(candidates: &[RawCandidate]) -> Vec<Option<CanonicalOpportunity>> {
    candidates.iter().map(normalize).collect()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Ordered, first-appearance collection of 2..=6 canonical records. Only
/// [`validate`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidatedCollection(Vec<CanonicalOpportunity>);

impl ValidatedCollection {
    pub fn as_slice(&self) -> &[CanonicalOpportunity] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CanonicalOpportunity> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<CanonicalOpportunity> {
        self.0
    }
}

impl<'a> IntoIterator for &'a ValidatedCollection {
    type Item = &'a CanonicalOpportunity;
    type IntoIter = std::slice::Iter<'a, CanonicalOpportunity>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

pub fn validate<I>(candidates: I) -> Result<ValidatedCollection, IngestError>
where
    I: IntoIterator<Item = Option<CanonicalOpportunity>>,
{
    let mut kept: Vec<CanonicalOpportunity> = candidates
        .into_iter()
        .flatten()
        .filter(CanonicalOpportunity::satisfies_invariants)
        .collect();

    if kept.len() < MIN_OPPORTUNITIES {
        warn!(found = kept.len(), "validation failed: too few well-formed opportunities");
        return Err(IngestError::InsufficientOpportunities { found: kept.len() });
    }
    if kept.len() > MAX_OPPORTUNITIES {
        debug!(found = kept.len(), cap = MAX_OPPORTUNITIES, "truncating opportunity list");
        kept.truncate(MAX_OPPORTUNITIES);
    }
    Ok(ValidatedCollection(kept))
}

/// Parse, normalize and validate in one step.
pub fn ingest(raw: &str) -> Result<ValidatedCollection, IngestError> {
    let candidates = parse_response(raw)?;
    validate(normalize_all(&candidates))
}

/// Reads a saved collaborator response from disk.
pub fn load_response_fixture(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    fs::read_to_string(path).with_context(|| format!("reading response {}", path.display()))
}
