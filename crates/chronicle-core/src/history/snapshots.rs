//! Snapshot date grids for point-in-time rebuilds.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::errors::{ChronicleError, ChronicleResult};

/// Upper bound on the number of dates a single grid may expand to.
pub const MAX_SNAPSHOT_DATES: usize = 100_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotGrid {
    Explicit { dates: Vec<NaiveDate> },
    /// Every day from `start` to `end`, inclusive.
    Daily { start: NaiveDate, end: NaiveDate },
    /// Dense recent history thinning out with age: the last `daily_days`
    /// days, Mondays of the last `weekly_weeks` weeks, first days of the last
    /// `monthly_months` months, and 1 January of the last `yearly_years`
    /// years, all ending at `as_of`.
    Logarithmic {
        as_of: NaiveDate,
        daily_days: u32,
        weekly_weeks: u32,
        monthly_months: u32,
        yearly_years: u32,
    },
}

fn out_of_range(what: &str) -> ChronicleError {
    ChronicleError::Config(format!("snapshot grid {what} is out of the supported date range"))
}

impl SnapshotGrid {
    pub fn explicit(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        SnapshotGrid::Explicit {
            dates: dates.into_iter().collect(),
        }
    }

    /// Expand to a sorted, duplicate-free list of dates.
    pub fn dates(&self) -> ChronicleResult<Vec<NaiveDate>> {
        let mut out = BTreeSet::new();
        match self {
            SnapshotGrid::Explicit { dates } => out.extend(dates.iter().copied()),
            SnapshotGrid::Daily { start, end } => {
                if start > end {
                    return Err(ChronicleError::Config(format!(
                        "daily snapshot grid starts {start} after it ends {end}"
                    )));
                }
                let span = (*end - *start).num_days() as usize + 1;
                if span > MAX_SNAPSHOT_DATES {
                    return Err(ChronicleError::Config(format!(
                        "daily snapshot grid spans {span} days (max {MAX_SNAPSHOT_DATES})"
                    )));
                }
                out.extend(start.iter_days().take(span));
            }
            SnapshotGrid::Logarithmic {
                as_of,
                daily_days,
                weekly_weeks,
                monthly_months,
                yearly_years,
            } => {
                // Each tier yields distinct dates, so one oversized tier
                // already exceeds the cap.
                let tiers = [
                    ("daily", daily_days),
                    ("weekly", weekly_weeks),
                    ("monthly", monthly_months),
                    ("yearly", yearly_years),
                ];
                for (tier, count) in tiers {
                    if *count as usize > MAX_SNAPSHOT_DATES {
                        return Err(ChronicleError::Config(format!(
                            "{tier} snapshot tier asks for {count} dates (max {MAX_SNAPSHOT_DATES})"
                        )));
                    }
                }

                for back in 0..*daily_days {
                    let day = as_of
                        .checked_sub_days(Days::new(u64::from(back)))
                        .ok_or_else(|| out_of_range("daily tier"))?;
                    out.insert(day);
                }

                let since_monday = u64::from(as_of.weekday().num_days_from_monday());
                let mut monday = as_of
                    .checked_sub_days(Days::new(since_monday))
                    .ok_or_else(|| out_of_range("weekly tier"))?;
                for _ in 0..*weekly_weeks {
                    debug_assert_eq!(monday.weekday(), Weekday::Mon);
                    out.insert(monday);
                    monday = monday
                        .checked_sub_days(Days::new(7))
                        .ok_or_else(|| out_of_range("weekly tier"))?;
                }

                let mut first_of_month = as_of
                    .with_day(1)
                    .ok_or_else(|| out_of_range("monthly tier"))?;
                for _ in 0..*monthly_months {
                    out.insert(first_of_month);
                    first_of_month = first_of_month
                        .checked_sub_months(Months::new(1))
                        .ok_or_else(|| out_of_range("monthly tier"))?;
                }

                for back in 0..*yearly_years {
                    let year = as_of.year() - back as i32;
                    let jan_first = NaiveDate::from_ymd_opt(year, 1, 1)
                        .ok_or_else(|| out_of_range("yearly tier"))?;
                    out.insert(jan_first);
                }
            }
        }
        if out.len() > MAX_SNAPSHOT_DATES {
            return Err(ChronicleError::Config(format!(
                "snapshot grid expands to {} dates (max {MAX_SNAPSHOT_DATES})",
                out.len()
            )));
        }
        Ok(out.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn explicit_dates_are_sorted_and_deduplicated() {
        let grid = SnapshotGrid::explicit([d(2024, 2, 1), d(2024, 1, 1), d(2024, 2, 1)]);
        assert_eq!(grid.dates().unwrap(), vec![d(2024, 1, 1), d(2024, 2, 1)]);
    }

    #[test]
    fn daily_range_is_inclusive() {
        let grid = SnapshotGrid::Daily {
            start: d(2024, 2, 27),
            end: d(2024, 3, 1),
        };
        assert_eq!(
            grid.dates().unwrap(),
            vec![d(2024, 2, 27), d(2024, 2, 28), d(2024, 2, 29), d(2024, 3, 1)]
        );
        let backwards = SnapshotGrid::Daily {
            start: d(2024, 3, 1),
            end: d(2024, 2, 1),
        };
        assert!(backwards.dates().is_err());
    }

    #[test]
    fn logarithmic_grid_thins_out() {
        // 2024-06-12 is a Wednesday.
        let grid = SnapshotGrid::Logarithmic {
            as_of: d(2024, 6, 12),
            daily_days: 3,
            weekly_weeks: 2,
            monthly_months: 2,
            yearly_years: 2,
        };
        assert_eq!(
            grid.dates().unwrap(),
            vec![
                d(2023, 1, 1),
                d(2024, 1, 1),
                d(2024, 5, 1),
                d(2024, 6, 1),
                d(2024, 6, 3),
                d(2024, 6, 10),
                d(2024, 6, 11),
                d(2024, 6, 12),
            ]
        );
    }

    #[test]
    fn oversized_grids_are_refused() {
        let grid = SnapshotGrid::Daily {
            start: d(1700, 1, 1),
            end: d(2024, 1, 1),
        };
        assert!(matches!(grid.dates(), Err(ChronicleError::Config(_))));
    }

    #[test]
    fn oversized_logarithmic_tiers_are_refused_up_front() {
        let tiers = |daily_days, yearly_years| SnapshotGrid::Logarithmic {
            as_of: d(2024, 6, 12),
            daily_days,
            weekly_weeks: 4,
            monthly_months: 12,
            yearly_years,
        };
        match tiers(u32::MAX, 3).dates() {
            Err(ChronicleError::Config(msg)) => assert!(msg.contains("daily snapshot tier"), "{msg}"),
            other => panic!("expected a config error, got {other:?}"),
        }
        match tiers(7, u32::MAX).dates() {
            Err(ChronicleError::Config(msg)) => assert!(msg.contains("yearly snapshot tier"), "{msg}"),
            other => panic!("expected a config error, got {other:?}"),
        }
        assert_eq!(tiers(MAX_SNAPSHOT_DATES as u32, 0).dates().unwrap().len(), MAX_SNAPSHOT_DATES);
    }
}
