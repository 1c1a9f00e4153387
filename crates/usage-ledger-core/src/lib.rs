use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Relative tolerance for hour-conservation checks.
pub const HOURS_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invariant violation in {stage} stage: {detail}")]
    Invariant { stage: Stage, detail: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Resolve,
    Aggregate,
    Resample,
    Derive,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Resolve => "resolve",
            Self::Aggregate => "aggregate",
            Self::Resample => "resample",
            Self::Derive => "derive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "normalize" => Some(Self::Normalize),
            "resolve" => Some(Self::Resolve),
            "aggregate" => Some(Self::Aggregate),
            "resample" => Some(Self::Resample),
            "derive" => Some(Self::Derive),
            _ => None,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Total,
    Reservable,
    Committed,
    Occupied,
    Active,
}

impl Quantity {
    pub const ALL: [Self; 5] = [
        Self::Total,
        Self::Reservable,
        Self::Committed,
        Self::Occupied,
        Self::Active,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Reservable => "reservable",
            Self::Committed => "committed",
            Self::Occupied => "occupied",
            Self::Active => "active",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "total" => Some(Self::Total),
            "reservable" => Some(Self::Reservable),
            "committed" => Some(Self::Committed),
            "occupied" => Some(Self::Occupied),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one source claims about an entity at one instant. Silence is the
/// absence of a fact, not a signal variant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case", tag = "kind", content = "state")]
pub enum Signal {
    State(String),
    Tombstone,
}

impl Signal {
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

/// Raw observation as handed over by source adapters: one source's claim that
/// an entity held `state` over `[start, end)`. All temporal fields are RFC3339
/// strings until the normalizer has vetted them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Observation {
    #[serde(default)]
    pub observation_id: Option<Ulid>,
    pub entity_id: String,
    pub source: String,
    pub quantity: String,
    pub state: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fact {
    #[serde(default)]
    pub observation_id: Option<Ulid>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub entity_id: String,
    pub quantity: Quantity,
    pub source: String,
    pub signal: Signal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingStart,
    MissingEntity,
    MissingState,
    PhantomSpan,
    UnknownSource,
    UnknownQuantity,
    BadTimestamp,
    Duplicate,
    UnmatchedExit,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingStart => "missing_start",
            Self::MissingEntity => "missing_entity",
            Self::MissingState => "missing_state",
            Self::PhantomSpan => "phantom_span",
            Self::UnknownSource => "unknown_source",
            Self::UnknownQuantity => "unknown_quantity",
            Self::BadTimestamp => "bad_timestamp",
            Self::Duplicate => "duplicate",
            Self::UnmatchedExit => "unmatched_exit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "missing_start" => Some(Self::MissingStart),
            "missing_entity" => Some(Self::MissingEntity),
            "missing_state" => Some(Self::MissingState),
            "phantom_span" => Some(Self::PhantomSpan),
            "unknown_source" => Some(Self::UnknownSource),
            "unknown_quantity" => Some(Self::UnknownQuantity),
            "bad_timestamp" => Some(Self::BadTimestamp),
            "duplicate" => Some(Self::Duplicate),
            "unmatched_exit" => Some(Self::UnmatchedExit),
            _ => None,
        }
    }

    /// Coarse grouping used in summaries: every normalizer-stage reason is a
    /// flavor of malformed input; the resolver-stage reasons keep their own
    /// categories.
    #[must_use]
    pub fn category(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::UnmatchedExit => "unmatched_exit",
            _ => "malformed",
        }
    }
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger entry paired with every record excluded from the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectionRecord {
    #[serde(default)]
    pub observation_id: Option<Ulid>,
    pub entity_id: String,
    pub source: String,
    #[serde(default)]
    pub quantity: Option<Quantity>,
    pub reason: RejectReason,
    pub detail: String,
    pub lost_hours: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub window_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub window_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TombstonePolicy {
    /// A tombstone held by the winning source collapses the entity to
    /// no-state, even while lower-priority sources still report.
    #[default]
    Authoritative,
    /// A tombstoned source is treated as silent from that point, so a
    /// still-reporting lower-priority source may keep the entity alive.
    PerSource,
}

impl TombstonePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authoritative => "authoritative",
            Self::PerSource => "per_source",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authoritative" => Some(Self::Authoritative),
            "per_source" => Some(Self::PerSource),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CombineOp {
    Difference,
    Sum,
}

impl CombineOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Difference => "difference",
            Self::Sum => "sum",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "difference" => Some(Self::Difference),
            "sum" => Some(Self::Sum),
            _ => None,
        }
    }
}

/// Named linear combination of resampled series, evaluated on the shared
/// bucket grid. `Difference` subtracts every operand after the first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivedFormula {
    pub name: String,
    pub op: CombineOp,
    pub operands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub site: String,
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub tombstone_policy: TombstonePolicy,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
    pub bucket_minutes: i64,
    #[serde(default = "EngineConfig::default_formulas")]
    pub formulas: Vec<DerivedFormula>,
}

impl EngineConfig {
    /// Standard configuration: manual corrections outrank database records,
    /// which outrank legacy usage reports; daily buckets; the two stock
    /// derived metrics.
    #[must_use]
    pub fn standard(site: &str, window_start: OffsetDateTime, window_end: OffsetDateTime) -> Self {
        Self {
            site: site.to_string(),
            priority_order: vec![
                "manual".to_string(),
                "db".to_string(),
                "legacy".to_string(),
            ],
            tombstone_policy: TombstonePolicy::Authoritative,
            window_start,
            window_end,
            bucket_minutes: 1_440,
            formulas: Self::default_formulas(),
        }
    }

    #[must_use]
    pub fn default_formulas() -> Vec<DerivedFormula> {
        vec![
            DerivedFormula {
                name: "available".to_string(),
                op: CombineOp::Difference,
                operands: vec!["reservable".to_string(), "committed".to_string()],
            },
            DerivedFormula {
                name: "idle".to_string(),
                op: CombineOp::Difference,
                operands: vec!["committed".to_string(), "occupied".to_string()],
            },
        ]
    }

    #[must_use]
    pub fn bucket_width(&self) -> Duration {
        Duration::minutes(self.bucket_minutes)
    }

    #[must_use]
    pub fn source_rank(&self, source: &str) -> Option<usize> {
        self.priority_order.iter().position(|s| s == source)
    }

    /// Validates window, bucket, priority order, and formula table.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] for any violation; these are
    /// fatal and raised before computation begins.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.site.trim().is_empty() {
            return Err(EngineError::Configuration(
                "site MUST be provided".to_string(),
            ));
        }

        if self.priority_order.is_empty() {
            return Err(EngineError::Configuration(
                "priority_order MUST list at least one source".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for source in &self.priority_order {
            if source.trim().is_empty() {
                return Err(EngineError::Configuration(
                    "priority_order MUST NOT contain empty source names".to_string(),
                ));
            }
            if !seen.insert(source.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "priority_order lists source {source} more than once"
                )));
            }
        }

        if self.window_end <= self.window_start {
            return Err(EngineError::Configuration(
                "window end MUST be after window start".to_string(),
            ));
        }

        if self.window_start.offset() != UtcOffset::UTC || self.window_end.offset() != UtcOffset::UTC
        {
            return Err(EngineError::Configuration(
                "window bounds MUST be UTC (offset Z)".to_string(),
            ));
        }

        if self.bucket_minutes < 1 {
            return Err(EngineError::Configuration(
                "bucket_minutes MUST be >= 1".to_string(),
            ));
        }

        for formula in &self.formulas {
            if formula.name.trim().is_empty() {
                return Err(EngineError::Configuration(
                    "derived metric name MUST be provided".to_string(),
                ));
            }
            if Quantity::parse(&formula.name).is_some() {
                return Err(EngineError::Configuration(format!(
                    "derived metric {} collides with an observed quantity",
                    formula.name
                )));
            }
            if formula.operands.len() < 2 {
                return Err(EngineError::Configuration(format!(
                    "derived metric {} MUST combine at least two operands",
                    formula.name
                )));
            }
            for operand in &formula.operands {
                if Quantity::parse(operand).is_none() {
                    return Err(EngineError::Configuration(format!(
                        "derived metric {} references unknown operand {operand}",
                        formula.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`EngineError::Configuration`] when decoding fails or decoded
    /// values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            EngineError::Configuration(format!("invalid configuration JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// One step in an entity's canonical state history. `state: None` means the
/// entity has no state from this instant (a tombstone won resolution).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalTimeline {
    pub entity_id: String,
    pub quantity: Quantity,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountPoint {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountSeries {
    pub quantity: Quantity,
    pub points: Vec<CountPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub entity_id: String,
    pub change: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bucket {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResampledSeries {
    pub metric: String,
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Ok,
    NoData,
    NegativeFlagged,
}

impl Quality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoData => "no_data",
            Self::NegativeFlagged => "negative_flagged",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "no_data" => Some(Self::NoData),
            "negative_flagged" => Some(Self::NegativeFlagged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRow {
    pub site: String,
    #[serde(with = "time::serde::rfc3339")]
    pub bucket: OffsetDateTime,
    pub metric: String,
    pub value: Option<f64>,
    pub quality: Quality,
}

/// Per-stage conservation bookkeeping. Hours are only meaningful at the
/// normalize stage; fact-level stages carry zeros.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageAudit {
    pub stage: Stage,
    pub input_rows: usize,
    pub kept_rows: usize,
    pub rejected_rows: usize,
    pub input_hours: f64,
    pub kept_hours: f64,
    pub rejected_hours: f64,
}

impl StageAudit {
    /// Checks row and hour conservation for this stage boundary.
    ///
    /// # Errors
    /// Returns [`EngineError::Invariant`] naming the stage and the magnitude
    /// of the discrepancy. Silent data loss is treated as worse than a
    /// visibly wrong number.
    pub fn verify(&self) -> Result<(), EngineError> {
        if self.kept_rows + self.rejected_rows != self.input_rows {
            return Err(EngineError::Invariant {
                stage: self.stage,
                detail: format!(
                    "row conservation broken: {} kept + {} rejected != {} input",
                    self.kept_rows, self.rejected_rows, self.input_rows
                ),
            });
        }

        let accounted = self.kept_hours + self.rejected_hours;
        let magnitude = (self.input_hours - accounted).abs();
        let tolerance = HOURS_TOLERANCE * self.input_hours.abs().max(1.0);
        if magnitude > tolerance {
            return Err(EngineError::Invariant {
                stage: self.stage,
                detail: format!(
                    "hour conservation broken by {magnitude:.6}h: {:.6} kept + {:.6} rejected vs {:.6} input",
                    self.kept_hours, self.rejected_hours, self.input_hours
                ),
            });
        }

        Ok(())
    }
}

/// Verifies every recorded stage boundary in order.
///
/// # Errors
/// Returns the first [`EngineError::Invariant`] found.
pub fn verify_run(audits: &[StageAudit]) -> Result<(), EngineError> {
    for audit in audits {
        audit.verify()?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub facts: Vec<Fact>,
    pub rejections: Vec<RejectionRecord>,
    pub audit: StageAudit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTimelines {
    pub timelines: Vec<CanonicalTimeline>,
    pub rejections: Vec<RejectionRecord>,
    pub audit: StageAudit,
}

/// Full output table for one run, regenerated from scratch every time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: Ulid,
    pub site: String,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
    pub bucket_minutes: i64,
    pub rows: Vec<UsageRow>,
    pub rejections: Vec<RejectionRecord>,
    pub audits: Vec<StageAudit>,
}

/// Validates raw observations against the run configuration and explodes
/// accepted ones into facts: a state fact at `start` and, when `end` is
/// present, a tombstone fact at `end`. Every rejected observation yields
/// exactly one ledger entry; nothing here is fatal.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn normalize_observations(observations: &[Observation], config: &EngineConfig) -> Normalized {
    let mut facts = Vec::new();
    let mut rejections = Vec::new();
    let mut kept_rows = 0_usize;
    let mut input_hours = 0.0_f64;
    let mut kept_hours = 0.0_f64;
    let mut rejected_hours = 0.0_f64;

    for observation in observations {
        let start = observation.start.as_deref().map(parse_rfc3339_utc);
        let end = observation.end.as_deref().map(parse_rfc3339_utc);

        let parsed_start = match &start {
            Some(Ok(value)) => Some(*value),
            _ => None,
        };
        let parsed_end = match &end {
            Some(Ok(value)) => Some(*value),
            _ => None,
        };
        let hours = span_hours(parsed_start, parsed_end, config.window_end);
        input_hours += hours;

        let failure = check_observation(observation, &start, &end, config);
        if let Some((reason, detail)) = failure {
            tracing::debug!(
                entity_id = %observation.entity_id,
                source = %observation.source,
                reason = %reason,
                "observation rejected"
            );
            rejected_hours += hours;
            rejections.push(RejectionRecord {
                observation_id: observation.observation_id,
                entity_id: observation.entity_id.clone(),
                source: observation.source.clone(),
                quantity: Quantity::parse(&observation.quantity),
                reason,
                detail,
                lost_hours: hours,
                window_start: parsed_start,
                window_end: parsed_end,
            });
            continue;
        }

        // check_observation guarantees these decode.
        let Some(start_at) = parsed_start else {
            continue;
        };
        let Some(quantity) = Quantity::parse(&observation.quantity) else {
            continue;
        };

        kept_rows += 1;
        kept_hours += hours;
        facts.push(Fact {
            observation_id: observation.observation_id,
            timestamp: start_at,
            entity_id: observation.entity_id.clone(),
            quantity,
            source: observation.source.clone(),
            signal: Signal::State(observation.state.clone()),
        });
        if let Some(end_at) = parsed_end {
            facts.push(Fact {
                observation_id: observation.observation_id,
                timestamp: end_at,
                entity_id: observation.entity_id.clone(),
                quantity,
                source: observation.source.clone(),
                signal: Signal::Tombstone,
            });
        }
    }

    let audit = StageAudit {
        stage: Stage::Normalize,
        input_rows: observations.len(),
        kept_rows,
        rejected_rows: rejections.len(),
        input_hours,
        kept_hours,
        rejected_hours,
    };

    tracing::debug!(
        input = audit.input_rows,
        kept = audit.kept_rows,
        rejected = audit.rejected_rows,
        "normalize stage complete"
    );

    Normalized {
        facts,
        rejections,
        audit,
    }
}

type ParsedBound = Option<Result<OffsetDateTime, EngineError>>;

fn check_observation(
    observation: &Observation,
    start: &ParsedBound,
    end: &ParsedBound,
    config: &EngineConfig,
) -> Option<(RejectReason, String)> {
    if observation.entity_id.trim().is_empty() {
        return Some((
            RejectReason::MissingEntity,
            "observation has no entity id".to_string(),
        ));
    }

    if config.source_rank(&observation.source).is_none() {
        return Some((
            RejectReason::UnknownSource,
            format!("source {} is not in the priority order", observation.source),
        ));
    }

    if Quantity::parse(&observation.quantity).is_none() {
        return Some((
            RejectReason::UnknownQuantity,
            format!("unrecognized quantity {}", observation.quantity),
        ));
    }

    if observation.state.trim().is_empty() {
        return Some((
            RejectReason::MissingState,
            "observation has no state token".to_string(),
        ));
    }

    let start_at = match start {
        None => {
            return Some((
                RejectReason::MissingStart,
                "observation has no start timestamp".to_string(),
            ))
        }
        Some(Err(err)) => return Some((RejectReason::BadTimestamp, err.to_string())),
        Some(Ok(value)) => *value,
    };

    match end {
        Some(Err(err)) => return Some((RejectReason::BadTimestamp, err.to_string())),
        Some(Ok(end_at)) if *end_at <= start_at => {
            return Some((
                RejectReason::PhantomSpan,
                format!("span ends at or before it starts ({end_at} <= {start_at})"),
            ))
        }
        _ => {}
    }

    None
}

fn span_hours(
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
    window_end: OffsetDateTime,
) -> f64 {
    let Some(start_at) = start else {
        return 0.0;
    };
    let end_at = end.unwrap_or(window_end);
    if end_at <= start_at {
        return 0.0;
    }
    (end_at - start_at).as_seconds_f64() / 3_600.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityResolution {
    pub timeline: CanonicalTimeline,
    pub rejections: Vec<RejectionRecord>,
    pub kept_facts: usize,
}

/// Resolves one entity's per-source fact streams into its canonical state
/// timeline ("paint"): forward-propagate each source's last signal across the
/// shared time axis, then coalesce by priority at every instant. A
/// lower-priority source is consulted only while every higher-priority source
/// is silent.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn resolve_entity_timeline(
    entity_id: &str,
    quantity: Quantity,
    facts: &[&Fact],
    config: &EngineConfig,
) -> EntityResolution {
    let mut rejections = Vec::new();
    let ranks = config.priority_order.len();
    let mut per_rank: Vec<Vec<&Fact>> = vec![Vec::new(); ranks];

    for fact in facts {
        match config.source_rank(&fact.source) {
            Some(rank) => per_rank[rank].push(*fact),
            None => rejections.push(reject_fact(
                fact,
                RejectReason::UnknownSource,
                format!("source {} is not in the priority order", fact.source),
            )),
        }
    }

    // Per source: stable order by timestamp, then one effective signal per
    // instant. A state reported at the same instant a span closes wins the
    // boundary ([start, end) semantics); equal-kind extras are ledgered.
    let mut streams: Vec<Vec<&Fact>> = Vec::with_capacity(ranks);
    for rank_facts in &mut per_rank {
        rank_facts.sort_by_key(|fact| fact.timestamp);
        let mut stream: Vec<&Fact> = Vec::with_capacity(rank_facts.len());
        let mut cursor = 0_usize;
        while cursor < rank_facts.len() {
            let timestamp = rank_facts[cursor].timestamp;
            let mut group_end = cursor;
            while group_end < rank_facts.len() && rank_facts[group_end].timestamp == timestamp {
                group_end += 1;
            }
            let group = &rank_facts[cursor..group_end];
            let winner = group
                .iter()
                .find(|fact| !fact.signal.is_tombstone())
                .or_else(|| group.first())
                .copied();
            if let Some(winner) = winner {
                for fact in group {
                    if std::ptr::eq(*fact, winner) {
                        continue;
                    }
                    if fact.signal.is_tombstone() != winner.signal.is_tombstone() {
                        // Boundary tombstone consumed by the same-instant
                        // state; both observations are honored.
                        continue;
                    }
                    rejections.push(reject_fact(
                        fact,
                        RejectReason::Duplicate,
                        format!(
                            "shadowed by an earlier signal at the same instant from {}",
                            fact.source
                        ),
                    ));
                }
                stream.push(winner);
            }
            cursor = group_end;
        }
        streams.push(stream);
    }

    let axis: BTreeSet<OffsetDateTime> = streams
        .iter()
        .flat_map(|stream| stream.iter().map(|fact| fact.timestamp))
        .collect();

    let mut held: Vec<Option<&Signal>> = vec![None; ranks];
    let mut cursors = vec![0_usize; ranks];
    let mut transitions: Vec<Transition> = Vec::new();
    let mut current: Option<String> = None;

    for timestamp in axis {
        for (rank, stream) in streams.iter().enumerate() {
            while cursors[rank] < stream.len() && stream[cursors[rank]].timestamp == timestamp {
                let fact = stream[cursors[rank]];
                cursors[rank] += 1;
                if fact.signal.is_tombstone() && held[rank].is_none() {
                    tracing::warn!(
                        entity_id,
                        quantity = %quantity,
                        source = %fact.source,
                        timestamp = %fact.timestamp,
                        "exit signal with no matching entry; excluded"
                    );
                    rejections.push(reject_fact(
                        fact,
                        RejectReason::UnmatchedExit,
                        "exit signal with no matching prior entry".to_string(),
                    ));
                    continue;
                }
                held[rank] = Some(&fact.signal);
            }
        }

        let resolved = coalesce(&held, config.tombstone_policy);
        if resolved != current {
            transitions.push(Transition {
                timestamp,
                state: resolved.clone(),
            });
            current = resolved;
        }
    }

    let kept_facts = facts.len() - rejections.len();
    EntityResolution {
        timeline: CanonicalTimeline {
            entity_id: entity_id.to_string(),
            quantity,
            transitions,
        },
        rejections,
        kept_facts,
    }
}

fn coalesce(held: &[Option<&Signal>], policy: TombstonePolicy) -> Option<String> {
    for slot in held {
        match slot {
            None => {}
            Some(Signal::State(state)) => return Some(state.clone()),
            Some(Signal::Tombstone) => match policy {
                TombstonePolicy::Authoritative => return None,
                TombstonePolicy::PerSource => {}
            },
        }
    }
    None
}

fn reject_fact(fact: &Fact, reason: RejectReason, detail: String) -> RejectionRecord {
    RejectionRecord {
        observation_id: fact.observation_id,
        entity_id: fact.entity_id.clone(),
        source: fact.source.clone(),
        quantity: Some(fact.quantity),
        reason,
        detail,
        lost_hours: 0.0,
        window_start: Some(fact.timestamp),
        window_end: None,
    }
}

/// Resolves every `(entity, quantity)` stream independently. Grouping uses an
/// ordered map so output order never depends on hash iteration.
#[must_use]
pub fn resolve_timelines(facts: &[Fact], config: &EngineConfig) -> ResolvedTimelines {
    let mut grouped: BTreeMap<(&str, Quantity), Vec<&Fact>> = BTreeMap::new();
    for fact in facts {
        grouped
            .entry((fact.entity_id.as_str(), fact.quantity))
            .or_default()
            .push(fact);
    }

    let mut timelines = Vec::new();
    let mut rejections = Vec::new();
    let mut kept_rows = 0_usize;

    for ((entity_id, quantity), entity_facts) in grouped {
        let resolution = resolve_entity_timeline(entity_id, quantity, &entity_facts, config);
        kept_rows += resolution.kept_facts;
        rejections.extend(resolution.rejections);
        if !resolution.timeline.transitions.is_empty() {
            timelines.push(resolution.timeline);
        }
    }

    let audit = StageAudit {
        stage: Stage::Resolve,
        input_rows: facts.len(),
        kept_rows,
        rejected_rows: rejections.len(),
        input_hours: 0.0,
        kept_hours: 0.0,
        rejected_hours: 0.0,
    };

    tracing::debug!(
        timelines = timelines.len(),
        rejected = audit.rejected_rows,
        "resolve stage complete"
    );

    ResolvedTimelines {
        timelines,
        rejections,
        audit,
    }
}

/// Translates one canonical timeline into signed unit events: +1 entering any
/// state, -1 leaving for no-state. Same-state changes carry no delta.
#[must_use]
pub fn timeline_events(timeline: &CanonicalTimeline) -> Vec<DeltaEvent> {
    let mut events = Vec::new();
    let mut present = false;
    for transition in &timeline.transitions {
        let now_present = transition.state.is_some();
        let change = match (present, now_present) {
            (false, true) => 1,
            (true, false) => -1,
            _ => 0,
        };
        if change != 0 {
            events.push(DeltaEvent {
                timestamp: transition.timestamp,
                entity_id: timeline.entity_id.clone(),
                change,
            });
        }
        present = now_present;
    }
    // An open final state emits no closing event; the count must not fall to
    // zero at the window boundary.
    events
}

/// Ordered sweep over signed unit events: merge by `(timestamp, entity_id)`,
/// sum per instant, running total is the concurrency.
///
/// # Errors
/// Returns [`EngineError::Invariant`] if the running total ever goes
/// negative; that is an engine defect, never clamped.
pub fn sweep(quantity: Quantity, events: &[DeltaEvent]) -> Result<Vec<CountPoint>, EngineError> {
    let mut ordered: Vec<&DeltaEvent> = events.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    let mut points = Vec::new();
    let mut total = 0_i64;
    let mut index = 0_usize;
    while index < ordered.len() {
        let timestamp = ordered[index].timestamp;
        let mut change = 0_i64;
        while index < ordered.len() && ordered[index].timestamp == timestamp {
            change += ordered[index].change;
            index += 1;
        }
        total += change;
        if total < 0 {
            return Err(EngineError::Invariant {
                stage: Stage::Aggregate,
                detail: format!("negative concurrency for {quantity} at {timestamp}: {total}"),
            });
        }
        points.push(CountPoint { timestamp, count: total });
    }

    Ok(points)
}

/// Converts canonical timelines for one quantity into its concurrency series.
///
/// # Errors
/// Propagates [`EngineError::Invariant`] from the sweep.
pub fn count_series(
    timelines: &[CanonicalTimeline],
    quantity: Quantity,
) -> Result<CountSeries, EngineError> {
    let mut events = Vec::new();
    for timeline in timelines.iter().filter(|t| t.quantity == quantity) {
        events.extend(timeline_events(timeline));
    }
    let points = sweep(quantity, &events)?;
    Ok(CountSeries { quantity, points })
}

/// Regularizes a count series onto the configured bucket grid with
/// time-weighted averaging. The step function is defined from its first event
/// onward; buckets wholly before that are explicit no-data, and a partially
/// covered bucket averages over its covered portion only.
///
/// # Errors
/// Returns [`EngineError::Configuration`] for a non-positive bucket width or
/// an empty window, before any computation.
pub fn resample_series(
    series: &CountSeries,
    config: &EngineConfig,
) -> Result<ResampledSeries, EngineError> {
    let width = config.bucket_width();
    if width <= Duration::ZERO {
        return Err(EngineError::Configuration(
            "bucket width MUST be positive".to_string(),
        ));
    }
    if config.window_end <= config.window_start {
        return Err(EngineError::Configuration(
            "window end MUST be after window start".to_string(),
        ));
    }

    let mut buckets = Vec::new();
    let mut bucket_start = config.window_start;
    while bucket_start < config.window_end {
        let bucket_end = (bucket_start + width).min(config.window_end);
        buckets.push(Bucket {
            start: bucket_start,
            value: integrate_step(&series.points, bucket_start, bucket_end),
        });
        bucket_start += width;
    }

    Ok(ResampledSeries {
        metric: series.quantity.as_str().to_string(),
        buckets,
    })
}

#[allow(clippy::cast_precision_loss)]
fn integrate_step(
    points: &[CountPoint],
    bucket_start: OffsetDateTime,
    bucket_end: OffsetDateTime,
) -> Option<f64> {
    let first = points.first()?;
    let from = bucket_start.max(first.timestamp);
    if from >= bucket_end {
        return None;
    }

    let covered = (bucket_end - from).as_seconds_f64();
    let mut index = points.partition_point(|point| point.timestamp <= from) - 1;
    let mut cursor = from;
    let mut area = 0.0_f64;
    loop {
        let current = points[index].count as f64;
        match points.get(index + 1) {
            Some(next) if next.timestamp < bucket_end => {
                area += (next.timestamp - cursor).as_seconds_f64() * current;
                cursor = next.timestamp;
                index += 1;
            }
            _ => {
                area += (bucket_end - cursor).as_seconds_f64() * current;
                break;
            }
        }
    }

    Some(area / covered)
}

/// Evaluates the formula table over resampled primaries. Operands must share
/// one bucket grid; a missing operand value yields no-data, never zero. A
/// formula whose operand series is absent from this run is skipped.
///
/// # Errors
/// Returns [`EngineError::Configuration`] when operand grids differ.
pub fn derive_metrics(
    primaries: &[ResampledSeries],
    formulas: &[DerivedFormula],
) -> Result<Vec<ResampledSeries>, EngineError> {
    let by_name: BTreeMap<&str, &ResampledSeries> = primaries
        .iter()
        .map(|series| (series.metric.as_str(), series))
        .collect();

    let mut derived = Vec::new();
    for formula in formulas {
        let mut operands = Vec::with_capacity(formula.operands.len());
        for name in &formula.operands {
            match by_name.get(name.as_str()) {
                Some(series) => operands.push(*series),
                None => {
                    tracing::debug!(
                        metric = %formula.name,
                        operand = %name,
                        "operand series absent this run; derived metric skipped"
                    );
                    operands.clear();
                    break;
                }
            }
        }
        let Some(base) = operands.first() else {
            continue;
        };

        for other in &operands[1..] {
            let same_grid = base.buckets.len() == other.buckets.len()
                && base
                    .buckets
                    .iter()
                    .zip(other.buckets.iter())
                    .all(|(a, b)| a.start == b.start);
            if !same_grid {
                return Err(EngineError::Configuration(format!(
                    "derived metric {} operands are on mismatched bucket grids",
                    formula.name
                )));
            }
        }

        let buckets = (0..base.buckets.len())
            .map(|i| {
                let values: Option<Vec<f64>> = operands
                    .iter()
                    .map(|series| series.buckets[i].value)
                    .collect();
                let value = values.map(|values| match formula.op {
                    CombineOp::Difference => values[0] - values[1..].iter().sum::<f64>(),
                    CombineOp::Sum => values.iter().sum(),
                });
                Bucket {
                    start: base.buckets[i].start,
                    value,
                }
            })
            .collect();

        derived.push(ResampledSeries {
            metric: formula.name.clone(),
            buckets,
        });
    }

    Ok(derived)
}

/// Runs the whole engine: normalize, resolve, aggregate, resample, derive,
/// with the invariant auditor checking every stage boundary. Re-running with
/// identical observations and configuration reproduces the report exactly.
///
/// # Errors
/// Returns [`EngineError::Configuration`] before computation for invalid
/// configuration and [`EngineError::Invariant`] if any conservation or
/// non-negativity check fails mid-run.
#[allow(clippy::too_many_lines)]
pub fn run_pipeline(
    run_id: Ulid,
    observations: &[Observation],
    config: &EngineConfig,
) -> Result<RunReport, EngineError> {
    config.validate()?;

    let normalized = normalize_observations(observations, config);
    normalized.audit.verify()?;

    let resolved = resolve_timelines(&normalized.facts, config);
    resolved.audit.verify()?;

    let mut transitions_total = 0_usize;
    for timeline in &resolved.timelines {
        transitions_total += timeline.transitions.len();
    }

    let mut primaries = Vec::new();
    let mut points_total = 0_usize;
    for quantity in Quantity::ALL {
        let series = count_series(&resolved.timelines, quantity)?;
        if series.points.is_empty() {
            continue;
        }
        points_total += series.points.len();
        primaries.push(resample_series(&series, config)?);
    }

    let aggregate_audit = StageAudit {
        stage: Stage::Aggregate,
        input_rows: transitions_total,
        kept_rows: transitions_total,
        rejected_rows: 0,
        input_hours: 0.0,
        kept_hours: 0.0,
        rejected_hours: 0.0,
    };
    aggregate_audit.verify()?;

    let resample_audit = StageAudit {
        stage: Stage::Resample,
        input_rows: points_total,
        kept_rows: points_total,
        rejected_rows: 0,
        input_hours: 0.0,
        kept_hours: 0.0,
        rejected_hours: 0.0,
    };
    resample_audit.verify()?;

    let derived = derive_metrics(&primaries, &config.formulas)?;

    let primary_buckets: usize = primaries.iter().map(|series| series.buckets.len()).sum();
    let derive_audit = StageAudit {
        stage: Stage::Derive,
        input_rows: primary_buckets,
        kept_rows: primary_buckets,
        rejected_rows: 0,
        input_hours: 0.0,
        kept_hours: 0.0,
        rejected_hours: 0.0,
    };
    derive_audit.verify()?;

    let mut rows = Vec::new();
    for series in primaries.iter().chain(derived.iter()) {
        for bucket in &series.buckets {
            let quality = match bucket.value {
                None => Quality::NoData,
                Some(value) if value < 0.0 => Quality::NegativeFlagged,
                Some(_) => Quality::Ok,
            };
            rows.push(UsageRow {
                site: config.site.clone(),
                bucket: bucket.start,
                metric: series.metric.clone(),
                value: bucket.value,
                quality,
            });
        }
    }

    let mut rejections = normalized.rejections;
    rejections.extend(resolved.rejections);

    let audits = vec![
        normalized.audit,
        resolved.audit,
        aggregate_audit,
        resample_audit,
        derive_audit,
    ];
    verify_run(&audits)?;

    tracing::info!(
        %run_id,
        site = %config.site,
        rows = rows.len(),
        rejections = rejections.len(),
        "pipeline run complete"
    );

    Ok(RunReport {
        run_id,
        site: config.site.clone(),
        window_start: config.window_start,
        window_end: config.window_end,
        bucket_minutes: config.bucket_minutes,
        rows,
        rejections,
        audits,
    })
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`EngineError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, EngineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(EngineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`EngineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, EngineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
