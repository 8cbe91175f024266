//! Vehicle health scoring
//!
//! Maps the latest value of a fixed set of weighted metrics onto a 0-1
//! score and combines them into one overall score.
//!
//! # Per-metric rules
//!
//! ```text
//!  0.0 ... 0.5 |  0.5 ... 0.9  |     1.0      |  0.9 ... 0.5  | 0.5 ... 0.0
//! -------------+---------------+--------------+---------------+------------
//!   beyond     | warning band  |   optimal    | warning band  |   beyond
//!             wl              ol             oh              wh
//! ```
//!
//! Beyond the warning range the score ramps from 0.5 to 0.0 and saturates
//! once the distance exceeds twice the optimal-to-warning gap. A zero-width
//! gap has no warning band: anything outside the optimal range scores 0.0.

use crate::canonical::metrics::*;
use crate::protocol::MetricScoreEntry;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// Score of a metric that has no rule
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Values kept per metric; only the last one is scored
const HISTORY_LEN: usize = 32;

/// Health status bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthStatus {
    /// Bucket a 0-1 score
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::Excellent
        } else if score >= 0.6 {
            Self::Good
        } else if score >= 0.4 {
            Self::Fair
        } else if score >= 0.2 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }

    /// Check if the status is at least `other` (Excellent is best)
    pub fn is_at_least(&self, other: HealthStatus) -> bool {
        self.rank() <= other.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Excellent => 0,
            Self::Good => 1,
            Self::Fair => 2,
            Self::Poor => 3,
            Self::Critical => 4,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scoring rule for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringRule {
    pub optimal: (f64, f64),
    pub warning: (f64, f64),
    pub weight: f64,
}

impl ScoringRule {
    pub fn new(optimal: (f64, f64), warning: (f64, f64), weight: f64) -> Self {
        Self {
            optimal,
            warning,
            weight,
        }
    }

    /// Score a value against this rule. Always within [0, 1].
    pub fn score(&self, value: f64) -> f64 {
        let (opt_lo, opt_hi) = self.optimal;
        let (warn_lo, warn_hi) = self.warning;

        if value >= opt_lo && value <= opt_hi {
            return 1.0;
        }

        let (boundary, gap, distance) = if value < opt_lo {
            (warn_lo, opt_lo - warn_lo, warn_lo - value)
        } else {
            (warn_hi, warn_hi - opt_hi, value - warn_hi)
        };

        if gap <= 0.0 {
            return 0.0;
        }

        let score = if distance <= 0.0 {
            // Inside the warning band: 0.5 at the warning edge, 0.9 next to optimal
            let depth = (boundary - value).abs() / gap;
            0.5 + 0.4 * depth
        } else {
            0.5 * (1.0 - distance / (2.0 * gap))
        };

        score.clamp(0.0, 1.0)
    }
}

/// Scoring rules keyed by canonical metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRules {
    rules: HashMap<String, ScoringRule>,
}

impl HealthRules {
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn with_rule(mut self, metric: &str, rule: ScoringRule) -> Self {
        self.rules.insert(metric.to_string(), rule);
        self
    }

    pub fn get(&self, metric: &str) -> Option<&ScoringRule> {
        self.rules.get(metric)
    }

    pub fn total_weight(&self) -> f64 {
        self.rules.values().map(|r| r.weight).sum()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &String> {
        self.rules.keys()
    }
}

impl Default for HealthRules {
    fn default() -> Self {
        Self::empty()
            .with_rule(COOLANT_TEMP, ScoringRule::new((85.0, 105.0), (70.0, 115.0), 0.15))
            .with_rule(ENGINE_RPM, ScoringRule::new((600.0, 3000.0), (500.0, 4500.0), 0.10))
            .with_rule(OIL_PRESSURE, ScoringRule::new((25.0, 65.0), (15.0, 80.0), 0.15))
            .with_rule(BATTERY_VOLTAGE, ScoringRule::new((12.4, 14.7), (11.8, 15.0), 0.12))
            .with_rule(ENGINE_LOAD, ScoringRule::new((10.0, 70.0), (0.0, 90.0), 0.08))
            .with_rule(INTAKE_AIR_TEMP, ScoringRule::new((-10.0, 45.0), (-30.0, 60.0), 0.06))
            .with_rule(OIL_TEMP, ScoringRule::new((80.0, 110.0), (60.0, 130.0), 0.10))
            .with_rule(THROTTLE_POSITION, ScoringRule::new((0.0, 60.0), (0.0, 90.0), 0.05))
            .with_rule(FUEL_PRESSURE, ScoringRule::new((250.0, 450.0), (200.0, 500.0), 0.09))
            .with_rule(FUEL_LEVEL, ScoringRule::new((20.0, 100.0), (10.0, 100.0), 0.10))
    }
}

/// Score of one metric inside a [`HealthScoreResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub score: f64,
    pub value: f64,
    pub weight: f64,
    pub status: HealthStatus,
}

/// Overall health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScoreResult {
    pub overall: f64,
    pub status: HealthStatus,
    pub per_metric: BTreeMap<String, MetricScore>,
    pub timestamp: f64,
}

impl HealthScoreResult {
    /// Per-metric entries in wire form
    pub fn wire_metrics(&self) -> BTreeMap<String, MetricScoreEntry> {
        self.per_metric
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    MetricScoreEntry {
                        score: m.score,
                        value: m.value,
                        weight: m.weight,
                        status: m.status.as_str().to_string(),
                    },
                )
            })
            .collect()
    }
}

/// Health scoring engine
#[derive(Debug, Default)]
pub struct HealthEngine {
    rules: HealthRules,
    history: HashMap<String, VecDeque<f64>>,
}

impl HealthEngine {
    pub fn new() -> Self {
        Self::with_rules(HealthRules::default())
    }

    pub fn with_rules(rules: HealthRules) -> Self {
        Self {
            rules,
            history: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &HealthRules {
        &self.rules
    }

    /// Record a value for a metric
    pub fn update(&mut self, metric: &str, value: f64) {
        let history = self.history.entry(metric.to_string()).or_default();
        history.push_back(value);
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }
    }

    /// Latest value of a metric
    pub fn latest(&self, metric: &str) -> Option<f64> {
        self.history.get(metric).and_then(|h| h.back().copied())
    }

    /// Score a value for a metric. Metrics without a rule get [`NEUTRAL_SCORE`].
    pub fn metric_score(&self, metric: &str, value: f64) -> f64 {
        self.rules
            .get(metric)
            .map(|rule| rule.score(value))
            .unwrap_or(NEUTRAL_SCORE)
    }

    /// Compute the current health score at `timestamp`.
    ///
    /// The weighted average is renormalized over the metrics that actually
    /// have data, so a missing sensor does not drag the score down.
    pub fn score_at(&self, timestamp: f64) -> Option<HealthScoreResult> {
        let mut per_metric = BTreeMap::new();
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;

        for (metric, rule) in &self.rules.rules {
            let Some(value) = self.latest(metric) else {
                continue;
            };
            let score = rule.score(value);
            weighted += score * rule.weight;
            weight_sum += rule.weight;
            per_metric.insert(
                metric.clone(),
                MetricScore {
                    score,
                    value,
                    weight: rule.weight,
                    status: HealthStatus::from_score(score),
                },
            );
        }

        if per_metric.is_empty() || weight_sum <= 0.0 {
            return None;
        }

        let overall = (weighted / weight_sum).clamp(0.0, 1.0);
        Some(HealthScoreResult {
            overall,
            status: HealthStatus::from_score(overall),
            per_metric,
            timestamp,
        })
    }

    /// Compute the current health score stamped with wall-clock time
    pub fn score(&self) -> Option<HealthScoreResult> {
        self.score_at(crate::protocol::unix_now())
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn coolant_rule() -> ScoringRule {
        ScoringRule::new((85.0, 105.0), (70.0, 115.0), 0.15)
    }

    #[test]
    fn test_status_buckets() {
        assert_eq!(HealthStatus::from_score(0.95), HealthStatus::Excellent);
        assert_eq!(HealthStatus::from_score(0.8), HealthStatus::Excellent);
        assert_eq!(HealthStatus::from_score(0.6), HealthStatus::Good);
        assert_eq!(HealthStatus::from_score(0.4), HealthStatus::Fair);
        assert_eq!(HealthStatus::from_score(0.2), HealthStatus::Poor);
        assert_eq!(HealthStatus::from_score(0.19), HealthStatus::Critical);
    }

    #[test]
    fn test_optimal_boundaries_score_one() {
        let rule = coolant_rule();
        assert_eq!(rule.score(85.0), 1.0);
        assert_eq!(rule.score(105.0), 1.0);
        assert_eq!(rule.score(95.0), 1.0);
    }

    #[test]
    fn test_warning_band_interpolation() {
        let rule = coolant_rule();
        assert_relative_eq!(rule.score(115.0), 0.5);
        assert_relative_eq!(rule.score(70.0), 0.5);
        assert_relative_eq!(rule.score(110.0), 0.7);
        let near_optimal = rule.score(105.01);
        assert!(near_optimal > 0.89 && near_optimal < 0.9);
    }

    #[test]
    fn test_beyond_warning_ramp_and_saturation() {
        let rule = coolant_rule();
        // gap = 10, saturation at 20 beyond the warning edge
        assert_relative_eq!(rule.score(125.0), 0.25);
        assert_relative_eq!(rule.score(135.0), 0.0);
        assert_relative_eq!(rule.score(500.0), 0.0);
        // lower gap = 15
        assert_relative_eq!(rule.score(60.0), 0.5 * (1.0 - 10.0 / 30.0), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_width_gap() {
        let rule = ScoringRule::new((0.0, 60.0), (0.0, 90.0), 0.05);
        assert_eq!(rule.score(0.0), 1.0);
        assert_eq!(rule.score(-1.0), 0.0);
        assert!(rule.score(75.0) > 0.5);
    }

    #[test]
    fn test_score_always_in_unit_interval() {
        let rules = HealthRules::default();
        for metric in rules.metrics() {
            let rule = rules.get(metric).unwrap();
            let mut v = -1000.0;
            while v <= 10_000.0 {
                let s = rule.score(v);
                assert!((0.0..=1.0).contains(&s), "{} at {} scored {}", metric, v, s);
                v += 7.3;
            }
        }
    }

    #[test]
    fn test_default_weights_sum_to_one() {
        assert_relative_eq!(HealthRules::default().total_weight(), 1.0, epsilon = 1e-9);
        assert_eq!(HealthRules::default().len(), 10);
    }

    #[test]
    fn test_no_data_is_none() {
        let mut engine = HealthEngine::new();
        assert!(engine.score_at(0.0).is_none());

        engine.update("Boost_Pressure", 12.0);
        assert!(engine.score_at(0.0).is_none());
        assert_eq!(engine.metric_score("Boost_Pressure", 12.0), NEUTRAL_SCORE);
    }

    #[test]
    fn test_single_metric_overall_equals_metric_score() {
        let mut engine = HealthEngine::new();
        engine.update("Coolant_Temp", 112.0);
        let result = engine.score_at(10.0).unwrap();

        let metric = &result.per_metric["Coolant_Temp"];
        assert_relative_eq!(result.overall, metric.score);
        assert!(metric.score > 0.5 && metric.score < 1.0);
        assert!(result.status.is_at_least(HealthStatus::Fair));
        assert_eq!(result.timestamp, 10.0);
    }

    #[test]
    fn test_last_value_is_authoritative() {
        let mut engine = HealthEngine::new();
        engine.update("Oil_Pressure", 5.0);
        engine.update("Oil_Pressure", 40.0);
        let result = engine.score_at(0.0).unwrap();
        assert_eq!(result.per_metric["Oil_Pressure"].value, 40.0);
        assert_eq!(result.overall, 1.0);
    }

    #[test]
    fn test_weight_renormalization() {
        let mut engine = HealthEngine::new();
        engine.update("Coolant_Temp", 95.0); // 1.0, weight 0.15
        engine.update("Oil_Pressure", 5.0); // 0.5 * (1 - 10/20) = 0.25, weight 0.15
        let result = engine.score_at(0.0).unwrap();
        assert_relative_eq!(result.overall, 0.625, epsilon = 1e-9);
        assert_eq!(result.status, HealthStatus::Good);
    }

    #[test]
    fn test_wire_metrics() {
        let mut engine = HealthEngine::new();
        engine.update("Coolant_Temp", 95.0);
        let wire = engine.score_at(0.0).unwrap().wire_metrics();
        assert_eq!(wire["Coolant_Temp"].status, "excellent");
    }
}
