//! Rule matching: one `(rule, reading, sensor)` triple in, one `MatchResult`
//! out. No state, no I/O; the same triple always yields the same result.
//!
//! Severity is not user configurable. It comes from the per-pollutant bands
//! below, applied to the observed concentration (strictly above the edge):
//!
//! | pollutant | unit  | medium above | high above |
//! |-----------|-------|--------------|------------|
//! | pm25      | µg/m³ | 35           | 55         |
//! | pm10      | µg/m³ | 150          | 250        |
//! | ozone     | ppb   | 70           | 85         |
//! | co        | ppm   | 9            | 12.4       |
//! | no2       | ppb   | 100          | 360        |
//! | so2       | ppb   | 75           | 185        |

use serde::Serialize;

use crate::error::CoreError;
use crate::models::{AlertRule, Pollutant, Reading, Sensor, Severity};

// ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeverityBands {
    pub medium_above: f64,
    pub high_above: f64,
}

pub fn severity_bands(pollutant: Pollutant) -> SeverityBands {
    // ---
    let (medium_above, high_above) = match pollutant {
        Pollutant::Pm25 => (35.0, 55.0),
        Pollutant::Pm10 => (150.0, 250.0),
        Pollutant::Ozone => (70.0, 85.0),
        Pollutant::Co => (9.0, 12.4),
        Pollutant::No2 => (100.0, 360.0),
        Pollutant::So2 => (75.0, 185.0),
    };
    SeverityBands {
        medium_above,
        high_above,
    }
}

pub fn classify(pollutant: Pollutant, observed: f64) -> Severity {
    // ---
    let bands = severity_bands(pollutant);
    if observed > bands.high_above {
        Severity::High
    } else if observed > bands.medium_above {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Outcome of evaluating one rule against one reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub rule_id: i64,
    pub matched: bool,
    pub severity: Severity,
    /// `None` when the reading did not report the rule's pollutant.
    pub observed_value: Option<f64>,
}

impl MatchResult {
    fn no_match(rule_id: i64, observed_value: Option<f64>) -> Self {
        MatchResult {
            rule_id,
            matched: false,
            severity: Severity::Low,
            observed_value,
        }
    }
}

/// Evaluate `rule` against `reading` taken by `sensor`.
///
/// Missing pollutant data and a non-matching location filter are plain
/// non-matches. A rule with a non-finite threshold is an `InvalidInput`
/// error so the caller can skip it and carry on with the other rules.
pub fn evaluate(
    rule: &AlertRule,
    reading: &Reading,
    sensor: &Sensor,
) -> Result<MatchResult, CoreError> {
    // ---
    if !rule.threshold.is_finite() {
        return Err(CoreError::invalid(format!(
            "rule {} has a non-finite threshold {}",
            rule.id, rule.threshold
        )));
    }

    let Some(observed) = reading.value(rule.pollutant) else {
        return Ok(MatchResult::no_match(rule.id, None));
    };

    if !location_matches(rule.location_filter.as_deref(), &sensor.name) {
        return Ok(MatchResult::no_match(rule.id, Some(observed)));
    }

    if !rule.operator.apply(observed, rule.threshold) {
        return Ok(MatchResult::no_match(rule.id, Some(observed)));
    }

    Ok(MatchResult {
        rule_id: rule.id,
        matched: true,
        severity: classify(rule.pollutant, observed),
        observed_value: Some(observed),
    })
}

fn location_matches(filter: Option<&str>, sensor_name: &str) -> bool {
    match filter.map(str::trim) {
        None | Some("") => true,
        Some(f) => sensor_name.to_lowercase().contains(&f.to_lowercase()),
    }
}
