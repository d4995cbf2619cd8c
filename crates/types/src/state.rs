use crate::peer_id::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Domain separator for signed state submissions.
const STATE_DOMAIN: &[u8] = b"trustmesh/state/v1";

/// One of the fixed metric fields carried by a state submission.
///
/// The values are opaque to the trust layer; only their weighted aggregate
/// is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Entropy,
    Valence,
    Arousal,
    Coherence,
    EmpathyScore,
    InsightStrength,
}

/// Canonical field order, used for signing and summaries.
pub const METRIC_FIELDS: [MetricField; 6] = [
    MetricField::Entropy,
    MetricField::Valence,
    MetricField::Arousal,
    MetricField::Coherence,
    MetricField::EmpathyScore,
    MetricField::InsightStrength,
];

impl MetricField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Entropy => "entropy",
            MetricField::Valence => "valence",
            MetricField::Arousal => "arousal",
            MetricField::Coherence => "coherence",
            MetricField::EmpathyScore => "empathy_score",
            MetricField::InsightStrength => "insight_strength",
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        METRIC_FIELDS
            .iter()
            .copied()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| format!("unknown metric field '{s}'"))
    }
}

/// The local-state vector a node reports each round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMetrics {
    pub entropy: f64,
    pub valence: f64,
    pub arousal: f64,
    pub coherence: f64,
    pub empathy_score: f64,
    pub insight_strength: f64,
}

impl StateMetrics {
    pub fn get(&self, field: MetricField) -> f64 {
        match field {
            MetricField::Entropy => self.entropy,
            MetricField::Valence => self.valence,
            MetricField::Arousal => self.arousal,
            MetricField::Coherence => self.coherence,
            MetricField::EmpathyScore => self.empathy_score,
            MetricField::InsightStrength => self.insight_strength,
        }
    }

    pub fn set(&mut self, field: MetricField, value: f64) {
        match field {
            MetricField::Entropy => self.entropy = value,
            MetricField::Valence => self.valence = value,
            MetricField::Arousal => self.arousal = value,
            MetricField::Coherence => self.coherence = value,
            MetricField::EmpathyScore => self.empathy_score = value,
            MetricField::InsightStrength => self.insight_strength = value,
        }
    }
}

/// A node's signed state report for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSubmission {
    pub node_id: PeerId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub entropy: f64,
    pub valence: f64,
    pub arousal: f64,
    pub coherence: f64,
    pub empathy_score: f64,
    pub insight_strength: f64,
    #[serde(with = "crate::serde_hex")]
    pub signature: Vec<u8>,
}

impl StateSubmission {
    /// Build a submission without a signature. Call `signing_bytes` and fill
    /// `signature` before publishing.
    pub fn unsigned(node_id: PeerId, timestamp: u64, metrics: StateMetrics) -> Self {
        Self {
            node_id,
            timestamp,
            entropy: metrics.entropy,
            valence: metrics.valence,
            arousal: metrics.arousal,
            coherence: metrics.coherence,
            empathy_score: metrics.empathy_score,
            insight_strength: metrics.insight_strength,
            signature: Vec::new(),
        }
    }

    pub fn metrics(&self) -> StateMetrics {
        StateMetrics {
            entropy: self.entropy,
            valence: self.valence,
            arousal: self.arousal,
            coherence: self.coherence,
            empathy_score: self.empathy_score,
            insight_strength: self.insight_strength,
        }
    }

    pub fn value(&self, field: MetricField) -> f64 {
        self.metrics().get(field)
    }

    /// Canonical bytes covered by the signature: node id, timestamp and the
    /// metric vector in `METRIC_FIELDS` order, all little-endian.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let metrics = self.metrics();
        let mut out = Vec::with_capacity(STATE_DOMAIN.len() + 20 + 8 + 8 * METRIC_FIELDS.len());
        out.extend_from_slice(STATE_DOMAIN);
        out.extend_from_slice(self.node_id.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        for field in METRIC_FIELDS {
            out.extend_from_slice(&metrics.get(field).to_bits().to_le_bytes());
        }
        out
    }

    /// Returns true when every metric is a finite number.
    pub fn is_well_formed(&self) -> bool {
        METRIC_FIELDS
            .iter()
            .all(|field| self.value(*field).is_finite())
    }
}
