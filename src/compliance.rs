//! Compliance summary against ambient air quality standards.
//!
//! Each standard is checked on buckets matching its averaging period as
//! closely as the rollup granularities allow: 24h standards on day buckets,
//! 8h and 1h standards on hour buckets. The figures are indicative only and
//! are not a regulatory certification.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::aggregate::{AggregateFilter, Granularity, Rollup};
use crate::models::{Pollutant, Reading};

// ---

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Standard {
    pub pollutant: Pollutant,
    pub limit: f64,
    pub averaging: &'static str,
    pub granularity: Granularity,
}

pub const STANDARDS: [Standard; 6] = [
    Standard {
        pollutant: Pollutant::Pm25,
        limit: 35.0,
        averaging: "24h",
        granularity: Granularity::Day,
    },
    Standard {
        pollutant: Pollutant::Pm10,
        limit: 150.0,
        averaging: "24h",
        granularity: Granularity::Day,
    },
    Standard {
        pollutant: Pollutant::Ozone,
        limit: 70.0,
        averaging: "8h",
        granularity: Granularity::Hour,
    },
    Standard {
        pollutant: Pollutant::Co,
        limit: 9.0,
        averaging: "8h",
        granularity: Granularity::Hour,
    },
    Standard {
        pollutant: Pollutant::No2,
        limit: 100.0,
        averaging: "1h",
        granularity: Granularity::Hour,
    },
    Standard {
        pollutant: Pollutant::So2,
        limit: 75.0,
        averaging: "1h",
        granularity: Granularity::Hour,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    Violation,
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollutantCompliance {
    pub pollutant: String,
    pub standard: String,
    pub current_avg: Option<f64>,
    /// Percentage of buckets at or below the limit.
    pub compliance_rate: Option<f64>,
    pub status: ComplianceStatus,
    pub violations_this_period: u64,
    pub buckets: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Mean compliance rate over pollutants that had data.
    pub overall_compliance: Option<f64>,
    pub violations_count: u64,
    pub standards_met: usize,
    pub total_standards: usize,
    pub pollutants: Vec<PollutantCompliance>,
}

/// Summarise `readings` over the `window_days` ending at `now`.
pub fn compliance_report<'a, I>(
    readings: I,
    now: DateTime<Utc>,
    window_days: u32,
) -> ComplianceReport
where
    I: IntoIterator<Item = &'a Reading>,
{
    // ---
    let window_start = now - Duration::days(i64::from(window_days));

    let mut rollups: Vec<Rollup> = STANDARDS
        .iter()
        .map(|s| {
            let mut filter = AggregateFilter::new(s.pollutant, s.granularity);
            filter.start = Some(window_start);
            filter.end = Some(now);
            Rollup::new(filter)
        })
        .collect();

    for reading in readings {
        for rollup in rollups.iter_mut() {
            rollup.push(reading);
        }
    }

    let pollutants: Vec<PollutantCompliance> = STANDARDS
        .iter()
        .zip(rollups.iter())
        .map(|(standard, rollup)| summarise(standard, rollup))
        .collect();

    let rates: Vec<f64> = pollutants.iter().filter_map(|p| p.compliance_rate).collect();
    let overall_compliance = if rates.is_empty() {
        None
    } else {
        Some(round1(rates.iter().sum::<f64>() / rates.len() as f64))
    };

    ComplianceReport {
        window_start,
        window_end: now,
        overall_compliance,
        violations_count: pollutants.iter().map(|p| p.violations_this_period).sum(),
        standards_met: pollutants
            .iter()
            .filter(|p| p.status == ComplianceStatus::Compliant)
            .count(),
        total_standards: STANDARDS.len(),
        pollutants,
    }
}

fn summarise(standard: &Standard, rollup: &Rollup) -> PollutantCompliance {
    // ---
    let buckets = rollup.finish();
    let pollutant = standard.pollutant;
    let label = format!("{} {} ({})", standard.limit, pollutant.unit(), standard.averaging);

    let samples: u64 = buckets.iter().map(|b| b.data_points).sum();
    if samples == 0 {
        return PollutantCompliance {
            pollutant: pollutant.label().to_string(),
            standard: label,
            current_avg: None,
            compliance_rate: None,
            status: ComplianceStatus::NoData,
            violations_this_period: 0,
            buckets: 0,
        };
    }

    let weighted: f64 = buckets.iter().map(|b| b.avg_value * b.data_points as f64).sum();
    let current_avg = weighted / samples as f64;
    let violations = buckets.iter().filter(|b| b.avg_value > standard.limit).count() as u64;
    let total = buckets.len() as u64;
    let rate = 100.0 * (total - violations) as f64 / total as f64;

    PollutantCompliance {
        pollutant: pollutant.label().to_string(),
        standard: label,
        current_avg: Some(round1(current_avg)),
        compliance_rate: Some(round1(rate)),
        status: if current_avg > standard.limit {
            ComplianceStatus::Violation
        } else {
            ComplianceStatus::Compliant
        },
        violations_this_period: violations,
        buckets: total,
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
