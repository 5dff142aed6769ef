//! Symbolic interval table: the cadence strings used throughout configs
//! ("m5", "h1", "D1"...), their cron expressions, second counts, and the
//! flooring/ceiling arithmetic the scheduler and transform engine rely on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid interval symbol: {0}")]
pub struct InvalidInterval(pub String);

macro_rules! intervals {
    ($($variant:ident => $sym:literal, $secs:expr, $cron:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum Interval {
            $($variant,)*
        }

        impl Interval {
            pub const ALL: &'static [Interval] = &[$(Interval::$variant,)*];

            pub fn symbol(self) -> &'static str {
                match self {
                    $(Interval::$variant => $sym,)*
                }
            }

            /// Fixed cron expression table (6-field cron for sub-minute
            /// intervals, standard 5-field otherwise).
            pub fn to_cron(self) -> &'static str {
                match self {
                    $(Interval::$variant => $cron,)*
                }
            }

            /// Fixed seconds table; intervals >= 1 week are computed via
            /// calendar delta from "now" rather than being a fixed constant.
            fn base_seconds(self) -> i64 {
                match self {
                    $(Interval::$variant => $secs,)*
                }
            }
        }
    };
}

intervals! {
    S2  => "s2",  2,     "* * * * * */2";
    S5  => "s5",  5,     "* * * * * */5";
    S10 => "s10", 10,    "* * * * * */10";
    S15 => "s15", 15,    "* * * * * */15";
    S20 => "s20", 20,    "* * * * * */20";
    S30 => "s30", 30,    "* * * * * */30";
    M1  => "m1",  60,    "*/1 * * * *";
    M2  => "m2",  120,   "*/2 * * * *";
    M5  => "m5",  300,   "*/5 * * * *";
    M10 => "m10", 600,   "*/10 * * * *";
    M15 => "m15", 900,   "*/15 * * * *";
    M30 => "m30", 1800,  "*/30 * * * *";
    H1  => "h1",  3600,  "0 * * * *";
    H2  => "h2",  7200,  "0 */2 * * *";
    H4  => "h4",  14400, "0 */4 * * *";
    H6  => "h6",  21600, "0 */6 * * *";
    H8  => "h8",  28800, "0 */8 * * *";
    H12 => "h12", 43200, "0 */12 * * *";
    D1  => "D1",  86400,  "0 0 */1 * *";
    D2  => "D2",  172800, "0 0 */2 * *";
    D3  => "D3",  259200, "0 0 */3 * *";
    W1  => "W1",  604800,  "0 0 * * 0";
    Mo1 => "M1",  2592000, "0 0 1 */1 *";
    Y1  => "Y1",  31540000, "0 0 1 1 *";
}

impl FromStr for Interval {
    type Err = InvalidInterval;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.symbol() == s)
            .ok_or_else(|| InvalidInterval(s.to_string()))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl TryFrom<String> for Interval {
    type Error = InvalidInterval;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.symbol().to_string()
    }
}

impl Interval {
    /// Seconds represented by this interval. For week-and-above intervals
    /// this is a calendar delta computed from the current instant, matching
    /// the source's `interval_to_seconds(raw=False)` behaviour; below that
    /// threshold the fixed table value is exact and used directly.
    pub fn to_seconds(self) -> i64 {
        if self.base_seconds() >= 604_800 {
            let now = Utc::now();
            let shifted = self.shift(now);
            (shifted - now).num_seconds()
        } else {
            self.base_seconds()
        }
    }

    fn shift(self, from: DateTime<Utc>) -> DateTime<Utc> {
        use chrono::Months;
        match self {
            Interval::W1 => from + chrono::Duration::weeks(1),
            Interval::Mo1 => from + Months::new(1),
            Interval::Y1 => from + Months::new(12),
            _ => from + chrono::Duration::seconds(self.base_seconds()),
        }
    }

    /// The greatest multiple of `to_seconds()` that is <= `t`.
    pub fn floor(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.to_seconds().max(1);
        let epoch = t.timestamp();
        let floored = epoch - epoch.rem_euclid(secs);
        DateTime::from_timestamp(floored, 0).unwrap_or(t)
    }

    /// `floor(t) + to_seconds()`.
    pub fn ceil(self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(t) + chrono::Duration::seconds(self.to_seconds())
    }

    /// Smallest interval whose second count is >= `(to - from) / target_epochs`;
    /// falls back to `h6` if nothing fits (mirrors the Python `fit_interval`).
    pub fn fit(from: DateTime<Utc>, to: DateTime<Utc>, target_epochs: u32) -> Interval {
        if target_epochs == 0 {
            return Interval::H6;
        }
        let diff_seconds = (to - from).num_seconds().max(0) as f64;
        let target = diff_seconds / target_epochs as f64;
        for interval in Interval::ALL {
            if interval.base_seconds() as f64 >= target {
                return *interval;
            }
        }
        Interval::H6
    }

    /// Round an arbitrary second count up to the nearest known symbolic
    /// interval, with a margin tolerance. Supplements `fit_interval`, used by
    /// the retriever boundary when asked for an arbitrary aggregation window.
    pub fn round(seconds: f64, margin: f64) -> Interval {
        for interval in Interval::ALL {
            if interval.base_seconds() as f64 >= seconds * (1.0 - margin) {
                return *interval;
            }
        }
        Interval::H1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_symbols() {
        assert_eq!("m5".parse::<Interval>().unwrap(), Interval::M5);
        assert_eq!("D1".parse::<Interval>().unwrap(), Interval::D1);
        assert!("bogus".parse::<Interval>().is_err());
    }

    #[test]
    fn seconds_table_matches_spec() {
        assert_eq!(Interval::S2.to_seconds(), 2);
        assert_eq!(Interval::M1.to_seconds(), 60);
        assert_eq!(Interval::H6.to_seconds(), 21600);
        assert_eq!(Interval::D1.to_seconds(), 86400);
    }

    #[test]
    fn floor_is_idempotent_and_le() {
        let t = Utc::now();
        let floored = Interval::M5.floor(t);
        assert!(floored <= t);
        assert_eq!(Interval::M5.floor(floored), floored);
        assert_eq!(floored.timestamp() % 300, 0);
    }

    #[test]
    fn ceil_is_floor_plus_interval() {
        let t = Utc::now();
        assert_eq!(
            Interval::H1.ceil(t),
            Interval::H1.floor(t) + chrono::Duration::seconds(3600)
        );
    }

    #[test]
    fn fit_interval_defaults_to_h6() {
        let now = Utc::now();
        assert_eq!(Interval::fit(now, now, 0), Interval::H6);
    }

    #[test]
    fn fit_interval_picks_smallest_covering_interval() {
        let from = Utc::now();
        let to = from + chrono::Duration::seconds(10_000);
        let picked = Interval::fit(from, to, 100);
        assert!(picked.to_seconds() >= 100);
    }

    /// Intervals whose second count is a fixed table entry rather than a
    /// calendar-relative shift (everything below `W1`), used by the property
    /// tests below to keep `floor`/`ceil`/`fit` comparisons independent of
    /// "now" at the moment the test runs.
    const FIXED_INTERVALS: &[Interval] = &[
        Interval::S2,
        Interval::S5,
        Interval::S10,
        Interval::S15,
        Interval::S20,
        Interval::S30,
        Interval::M1,
        Interval::M2,
        Interval::M5,
        Interval::M10,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D2,
        Interval::D3,
    ];

    proptest::proptest! {
        /// `floor(t) <= t < ceil(t)` for any timestamp and any fixed-seconds
        /// interval, and `floor` is idempotent on its own output.
        #[test]
        fn floor_and_ceil_bracket_t(epoch in 0i64..4_000_000_000i64, interval_idx in 0usize..FIXED_INTERVALS.len()) {
            let t = DateTime::from_timestamp(epoch, 0).unwrap();
            let interval = FIXED_INTERVALS[interval_idx];
            let floored = interval.floor(t);
            let ceiled = interval.ceil(t);
            prop_assert!(floored <= t);
            prop_assert!(t < ceiled);
            prop_assert_eq!(interval.floor(floored), floored);
        }

        /// `fit` never returns an interval narrower than `(to - from) /
        /// target_epochs` when the window stays within the fixed-seconds
        /// table (below `W1`'s calendar-relative range).
        #[test]
        fn fit_interval_always_covers_target_epochs(diff_secs in 0i64..200_000i64, target_epochs in 1u32..200) {
            let from = DateTime::from_timestamp(0, 0).unwrap();
            let to = from + chrono::Duration::seconds(diff_secs);
            let picked = Interval::fit(from, to, target_epochs);
            let target = diff_secs as f64 / target_epochs as f64;
            prop_assert!(picked.to_seconds() as f64 >= target);
        }
    }
}
