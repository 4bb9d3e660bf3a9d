//! Air Quality Index conversion.
//!
//! Piecewise-linear interpolation over EPA breakpoint tables:
//!
//! `index = round((I_hi - I_lo) / (C_hi - C_lo) * (C - C_lo) + I_lo)`
//!
//! A concentration selects the first segment whose `C_hi` is not below it.
//! EPA tables are published at a fixed resolution (0.1 for PM2.5, 1 for
//! PM10), so consecutive segments leave a sub-resolution gap; values falling
//! in that gap use the upper segment and round into its first index.
//! Concentrations above the top breakpoint are extrapolated with the top
//! segment, giving indexes above 500 (category Hazardous). Pollutants without
//! a table use a provisional linear scale capped at 500 and are flagged.
//!
//! Everything here is pure and allocation-free; call it from any task.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::models::Pollutant;

// ---

/// Health category for an index value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AqiCategory {
    #[serde(rename = "Good")]
    Good,
    #[serde(rename = "Moderate")]
    Moderate,
    #[serde(rename = "Unhealthy for Sensitive Groups")]
    UnhealthyForSensitiveGroups,
    #[serde(rename = "Unhealthy")]
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    #[serde(rename = "Hazardous")]
    Hazardous,
}

impl AqiCategory {
    // ---
    pub fn from_index(index: u32) -> Self {
        match index {
            0..=50 => AqiCategory::Good,
            51..=100 => AqiCategory::Moderate,
            101..=150 => AqiCategory::UnhealthyForSensitiveGroups,
            151..=200 => AqiCategory::Unhealthy,
            201..=300 => AqiCategory::VeryUnhealthy,
            _ => AqiCategory::Hazardous,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthyForSensitiveGroups => "Unhealthy for Sensitive Groups",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AqiResult {
    pub pollutant: Pollutant,
    pub concentration: f64,
    pub index: u32,
    pub category: AqiCategory,
    /// `true` when no regulator table exists for the pollutant and the
    /// fallback scale was used.
    pub provisional: bool,
}

// ---

/// One linear segment of a breakpoint table.
#[derive(Debug, Clone, Copy)]
pub struct Breakpoint {
    pub c_lo: f64,
    pub c_hi: f64,
    pub i_lo: u32,
    pub i_hi: u32,
}

const fn bp(c_lo: f64, c_hi: f64, i_lo: u32, i_hi: u32) -> Breakpoint {
    Breakpoint { c_lo, c_hi, i_lo, i_hi }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakpointTable {
    pub pollutant: Pollutant,
    /// Reporting resolution; the largest gap allowed between segments.
    pub resolution: f64,
    pub segments: &'static [Breakpoint],
}

/// EPA PM2.5 (24-hour, µg/m³).
pub const PM25_TABLE: BreakpointTable = BreakpointTable {
    pollutant: Pollutant::Pm25,
    resolution: 0.1,
    segments: &[
        bp(0.0, 12.0, 0, 50),
        bp(12.1, 35.4, 51, 100),
        bp(35.5, 55.4, 101, 150),
        bp(55.5, 150.4, 151, 200),
        bp(150.5, 250.4, 201, 300),
        bp(250.5, 500.4, 301, 500),
    ],
};

/// EPA PM10 (24-hour, µg/m³).
pub const PM10_TABLE: BreakpointTable = BreakpointTable {
    pollutant: Pollutant::Pm10,
    resolution: 1.0,
    segments: &[
        bp(0.0, 54.0, 0, 50),
        bp(55.0, 154.0, 51, 100),
        bp(155.0, 254.0, 101, 150),
        bp(255.0, 354.0, 151, 200),
        bp(355.0, 424.0, 201, 300),
        bp(425.0, 604.0, 301, 500),
    ],
};

pub const TABLES: &[BreakpointTable] = &[PM25_TABLE, PM10_TABLE];

/// Fallback scale for pollutants without a table.
const PROVISIONAL_FACTOR: f64 = 2.0;
const PROVISIONAL_CAP: u32 = 500;

pub fn table_for(pollutant: Pollutant) -> Option<&'static BreakpointTable> {
    TABLES.iter().find(|t| t.pollutant == pollutant)
}

// ---

/// Convert a concentration into an AQI index and category.
///
/// Fails with `InvalidInput` for negative or non-finite concentrations.
pub fn compute_aqi(pollutant: Pollutant, concentration: f64) -> Result<AqiResult, CoreError> {
    // ---
    if !concentration.is_finite() || concentration < 0.0 {
        return Err(CoreError::invalid(format!(
            "{pollutant} concentration {concentration} cannot be converted to AQI"
        )));
    }

    let (index, provisional) = match table_for(pollutant) {
        Some(table) => (interpolate(table, concentration)?, false),
        None => {
            let scaled = (concentration * PROVISIONAL_FACTOR).round();
            (scaled.min(PROVISIONAL_CAP as f64) as u32, true)
        }
    };

    Ok(AqiResult {
        pollutant,
        concentration,
        index,
        category: AqiCategory::from_index(index),
        provisional,
    })
}

fn interpolate(table: &BreakpointTable, c: f64) -> Result<u32, CoreError> {
    // ---
    let segment = table
        .segments
        .iter()
        .find(|s| c <= s.c_hi)
        .or_else(|| table.segments.last())
        .ok_or_else(|| {
            let msg = format!("empty breakpoint table for {}", table.pollutant);
            CoreError::InternalInconsistency(msg)
        })?;

    let slope = (segment.i_hi - segment.i_lo) as f64 / (segment.c_hi - segment.c_lo);
    let index = (slope * (c - segment.c_lo) + segment.i_lo as f64).round();

    Ok(index.max(0.0) as u32)
}

/// Check every table is contiguous and non-overlapping. Run once at startup;
/// a broken table is fatal.
pub fn validate_tables() -> Result<(), CoreError> {
    // ---
    for table in TABLES {
        validate_table(table)?;
    }
    Ok(())
}

pub fn validate_table(table: &BreakpointTable) -> Result<(), CoreError> {
    // ---
    let fail = |msg: String| -> Result<(), CoreError> {
        Err(CoreError::InternalInconsistency(format!("{} table: {msg}", table.pollutant)))
    };

    let Some(first) = table.segments.first() else {
        return fail("no segments".to_string());
    };
    if first.c_lo != 0.0 || first.i_lo != 0 {
        return fail("first segment must start at zero".to_string());
    }

    for (i, s) in table.segments.iter().enumerate() {
        if s.c_hi <= s.c_lo || s.i_hi <= s.i_lo {
            return fail(format!("segment {i} is empty or inverted"));
        }
        if i == 0 {
            continue;
        }
        let prev = &table.segments[i - 1];
        let gap = s.c_lo - prev.c_hi;
        if gap <= 0.0 {
            return fail(format!("segment {i} overlaps segment {}", i - 1));
        }
        if gap > table.resolution + 1e-9 {
            return fail(format!("gap of {gap} before segment {i}"));
        }
        if s.i_lo != prev.i_hi + 1 {
            return fail(format!("index range of segment {i} is not contiguous"));
        }
    }
    Ok(())
}
