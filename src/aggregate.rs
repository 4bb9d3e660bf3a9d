//! Time-series rollups over readings.
//!
//! Readings are folded one at a time into a running accumulator per bucket
//! (hour, day or month, UTC). Sums are kept exactly, so the output is
//! bit-for-bit identical whatever order the readings arrive in, for any
//! finite input. Empty buckets are never emitted.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{Pollutant, Reading};
use crate::store::ReadingFilter;

// ---

/// Bits per limb of [`ExactSum`].
const LIMB_BITS: u32 = 32;
const LIMB_MASK: i64 = (1 << LIMB_BITS) - 1;

/// Every finite double is a multiple of 2^-1074 below 2^1024, which takes
/// 2098 bits. The remaining limbs are carry headroom for 2^64 additions.
const SUM_LIMBS: usize = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    // ---
    /// Parse leniently: anything unknown falls back to `Hour`.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("hour") => Granularity::Hour,
            Some("day") => Granularity::Day,
            Some("month") => Granularity::Month,
            Some(other) => {
                debug!("Unknown granularity '{}', falling back to hour", other);
                Granularity::Hour
            }
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        // ---
        let date = ts.date_naive();
        let naive = match self {
            Granularity::Hour => date.and_hms_opt(ts.hour(), 0, 0),
            Granularity::Day => date.and_hms_opt(0, 0, 0),
            Granularity::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
        };
        // Truncation of a valid timestamp is always valid
        naive.map(|n| Utc.from_utc_datetime(&n)).unwrap_or(ts)
    }

    /// Canonical bucket key. Lexicographic order matches time order.
    pub fn bucket_key(&self, start: DateTime<Utc>) -> String {
        let fmt = match self {
            Granularity::Hour => "%Y-%m-%d %H:00:00",
            Granularity::Day => "%Y-%m-%d",
            Granularity::Month => "%Y-%m",
        };
        start.format(fmt).to_string()
    }
}

/// Filter for an aggregate query. Time bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateFilter {
    pub sensor_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub pollutant: Pollutant,
    pub granularity: Granularity,
}

impl AggregateFilter {
    // ---
    pub fn new(pollutant: Pollutant, granularity: Granularity) -> Self {
        AggregateFilter {
            sensor_id: None,
            start: None,
            end: None,
            pollutant,
            granularity,
        }
    }

    pub fn reading_filter(&self) -> ReadingFilter {
        ReadingFilter {
            sensor_id: self.sensor_id.clone(),
            start: self.start,
            end: self.end,
            limit: None,
            newest_first: false,
        }
    }
}

/// One rollup row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub time_period: String,
    pub period_start: DateTime<Utc>,
    pub pollutant: Pollutant,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub data_points: u64,
}

/// Exact running sum of doubles, as a signed integer count of 2^-1074 split
/// over 32-bit limbs. Addition is exact, so the state does not depend on the
/// order values arrive in, and it cannot overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExactSum {
    limbs: [i64; SUM_LIMBS],
}

impl ExactSum {
    // ---
    fn zero() -> Self {
        ExactSum { limbs: [0; SUM_LIMBS] }
    }

    fn add(&mut self, v: f64) {
        // ---
        let bits = v.to_bits();
        let exp = ((bits >> 52) & 0x7ff) as u32;
        let frac = bits & ((1u64 << 52) - 1);
        // |v| = mantissa * 2^(offset - 1074)
        let (mantissa, offset) = if exp == 0 {
            (frac, 0)
        } else {
            (frac | (1u64 << 52), exp - 1)
        };
        let sign = if v.is_sign_negative() { -1 } else { 1 };

        let low = (offset / LIMB_BITS) as usize;
        let wide = u128::from(mantissa) << (offset % LIMB_BITS);
        for k in 0..3 {
            let digit = (wide >> (LIMB_BITS as usize * k)) as i64 & LIMB_MASK;
            self.limbs[low + k] += sign * digit;
        }
        self.carry_from(low);
    }

    fn merge(&mut self, other: &ExactSum) {
        for (mine, theirs) in self.limbs.iter_mut().zip(other.limbs.iter()) {
            *mine += theirs;
        }
        self.carry_from(0);
    }

    /// Bring limbs below the top back into `[0, 2^32)`. The top limb carries
    /// the sign.
    fn carry_from(&mut self, start: usize) {
        for i in start..SUM_LIMBS - 1 {
            let carry = self.limbs[i] >> LIMB_BITS;
            self.limbs[i] -= carry << LIMB_BITS;
            self.limbs[i + 1] += carry;
        }
    }

    /// `sum / count` rounded to a double. Only the top 96 bits of the sum
    /// take part, which is well below double precision.
    fn mean(&self, count: u64) -> f64 {
        // ---
        let mut magnitude = *self;
        let negative = magnitude.limbs[SUM_LIMBS - 1] < 0;
        if negative {
            for limb in magnitude.limbs.iter_mut() {
                *limb = -*limb;
            }
            magnitude.carry_from(0);
        }

        let Some(top) = magnitude.limbs.iter().rposition(|&l| l != 0) else {
            return 0.0;
        };
        let low = top.saturating_sub(2);
        let head = magnitude.limbs[low..=top]
            .iter()
            .rev()
            .fold(0u128, |acc, &l| (acc << LIMB_BITS) | l as u128);

        let exponent = low as i32 * LIMB_BITS as i32 - 1074;
        let mean = scale_by_pow2(head as f64 / count.max(1) as f64, exponent);
        if negative {
            -mean
        } else {
            mean
        }
    }
}

/// `x * 2^exp` without intermediate overflow or premature underflow.
fn scale_by_pow2(mut x: f64, mut exp: i32) -> f64 {
    // ---
    const STEP: i32 = 1000;
    while exp > STEP {
        x *= 2f64.powi(STEP);
        exp -= STEP;
    }
    while exp < -STEP {
        x *= 2f64.powi(-STEP);
        exp += STEP;
    }
    x * 2f64.powi(exp)
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: ExactSum,
    min: f64,
    max: f64,
    count: u64,
}

impl Accumulator {
    fn new(v: f64) -> Self {
        let mut sum = ExactSum::zero();
        sum.add(v);
        Accumulator {
            sum,
            min: v,
            max: v,
            count: 1,
        }
    }

    fn add(&mut self, v: f64) {
        self.sum.add(v);
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.count += 1;
    }

    fn merge(&mut self, other: &Accumulator) {
        self.sum.merge(&other.sum);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    fn avg(&self) -> f64 {
        // Rounding the exact sum can land a hair outside [min, max]
        self.sum.mean(self.count).clamp(self.min, self.max)
    }
}

/// Running rollup for one filter. Feed it readings from a stream or a
/// query result; `finish` yields buckets in ascending time order.
#[derive(Debug, Clone)]
pub struct Rollup {
    filter: AggregateFilter,
    window: ReadingFilter,
    buckets: BTreeMap<DateTime<Utc>, Accumulator>,
}

impl Rollup {
    // ---
    pub fn new(filter: AggregateFilter) -> Self {
        Rollup {
            window: filter.reading_filter(),
            filter,
            buckets: BTreeMap::new(),
        }
    }

    /// Fold one reading in. Returns whether it contributed.
    pub fn push(&mut self, reading: &Reading) -> bool {
        // ---
        if !self.window.matches(reading) {
            return false;
        }
        let Some(value) = reading.value(self.filter.pollutant).filter(|v| v.is_finite()) else {
            return false;
        };

        let start = self.filter.granularity.bucket_start(reading.timestamp);
        self.buckets
            .entry(start)
            .and_modify(|acc| acc.add(value))
            .or_insert_with(|| Accumulator::new(value));
        true
    }

    /// Combine another rollup built with the same filter.
    pub fn merge(&mut self, other: &Rollup) {
        for (start, acc) in &other.buckets {
            self.buckets
                .entry(*start)
                .and_modify(|mine| mine.merge(acc))
                .or_insert(*acc);
        }
    }

    pub fn finish(&self) -> Vec<AggregateBucket> {
        // ---
        let granularity = self.filter.granularity;
        self.buckets
            .iter()
            .map(|(start, acc)| AggregateBucket {
                time_period: granularity.bucket_key(*start),
                period_start: *start,
                pollutant: self.filter.pollutant,
                avg_value: acc.avg(),
                min_value: acc.min,
                max_value: acc.max,
                data_points: acc.count,
            })
            .collect()
    }
}

/// Roll `readings` up according to `filter`.
pub fn aggregate<'a, I>(readings: I, filter: &AggregateFilter) -> Vec<AggregateBucket>
where
    I: IntoIterator<Item = &'a Reading>,
{
    // ---
    let mut rollup = Rollup::new(filter.clone());
    for reading in readings {
        rollup.push(reading);
    }
    rollup.finish()
}

/// Most recent reading per sensor, ordered by sensor id. Timestamp ties are
/// broken by the larger reading id so the pick is stable.
pub fn latest_per_sensor<'a, I>(readings: I) -> Vec<Reading>
where
    I: IntoIterator<Item = &'a Reading>,
{
    // ---
    let mut latest: HashMap<&str, &Reading> = HashMap::new();
    for reading in readings {
        latest
            .entry(reading.sensor_id.as_str())
            .and_modify(|best| {
                if (reading.timestamp, reading.id) > (best.timestamp, best.id) {
                    *best = reading;
                }
            })
            .or_insert(reading);
    }

    let mut out: Vec<Reading> = latest.into_values().cloned().collect();
    out.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
    out
}
