//! Anniversary-based billing cycle arithmetic.
//!
//! Monthly cycles are anchored on the day-of-month of the subscription start. When
//! the anchor day does not exist in a month (the 31st in April, the 30th in
//! February) the boundary is clipped to that month's last day, but the clip never
//! carries forward: the next month that has the anchor day uses it again.
//!
//! ```text
//! anchor = Jan 31:  Jan 31 -> Feb 28 (29) -> Mar 31 -> Apr 30 -> May 31
//! ```
//!
//! All bounds are half-open `[start, end)` at UTC midnight.

use crate::error::QuotaError;
use crate::types::{Period, PeriodType, UNLIMITED};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

/// Number of days in `month` of `year`.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first_of_next| first_of_next.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Truncate a timestamp to UTC midnight.
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    midnight(at.date_naive())
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Move `start` forward by `months`, landing on `anchor_day` clipped to the target
/// month's length. The result is always UTC midnight.
pub fn add_months(start: DateTime<Utc>, months: u32, anchor_day: u32) -> DateTime<Utc> {
    let zero_based = start.month0() + months;
    let year = start.year() + (zero_based / 12) as i32;
    let month = zero_based % 12 + 1;
    let day = anchor_day.min(days_in_month(year, month)).max(1);
    NaiveDate::from_ymd_opt(year, month, day).map(midnight).unwrap_or(start)
}

/// Current anniversary cycle for a subscription started at `subscription_start`.
///
/// If `now` precedes the subscription start (clock skew or a future-dated
/// subscription) the first cycle is returned.
pub fn current_cycle(
    subscription_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start_of_day(subscription_start);
    let anchor_day = start.day();

    if now < start {
        return (start, add_months(start, 1, anchor_day));
    }

    // Jump close to the answer instead of walking from month zero.
    let elapsed_months =
        (now.year() - start.year()) * 12 + now.month() as i32 - start.month() as i32;
    let mut k = elapsed_months.saturating_sub(1).max(0) as u32;

    loop {
        let cycle_end = add_months(start, k + 1, anchor_day);
        if cycle_end > now {
            return (add_months(start, k, anchor_day), cycle_end);
        }
        k += 1;
    }
}

/// UTC calendar day containing `now`.
pub fn current_day(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = start_of_day(now);
    (start, start + Duration::days(1))
}

/// Resolve the concrete period of `period_type` containing `now`.
pub fn period_for(
    period_type: PeriodType,
    subscription_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Period, QuotaError> {
    match period_type {
        PeriodType::Daily => {
            let (start, end) = current_day(now);
            Ok(Period { start, end, period_type })
        }
        PeriodType::Monthly => {
            let (start, end) = current_cycle(subscription_start, now);
            Ok(Period { start, end, period_type })
        }
        PeriodType::Forever => Ok(Period::forever()),
        PeriodType::Auto => Err(QuotaError::InvalidPeriodType(
            "auto must be resolved to a concrete period".to_string(),
        )),
    }
}

/// Fraction of `[start, end)` still ahead of `now`, clamped to `[0, 1]`.
pub fn remaining_fraction(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let total = (end - start).num_milliseconds();
    if total <= 0 {
        return 0.0;
    }
    let remaining = (end - now).num_milliseconds();
    (remaining as f64 / total as f64).clamp(0.0, 1.0)
}

/// Limit for the rest of a cycle after a mid-cycle tier change.
///
/// The elapsed share of the cycle keeps the old tier's allowance and the
/// remaining share gets the new tier's: `round(old * (1 - f)) + round(new * f)`.
/// The result never drops below `current_used`. A new unlimited tier stays
/// unlimited; an old unlimited tier contributes nothing to the blend.
pub fn prorated_limit(current_used: i64, old_limit: i64, new_limit: i64, remaining: f64) -> i64 {
    if new_limit == UNLIMITED {
        return UNLIMITED;
    }
    let remaining = if remaining.is_nan() { 0.0 } else { remaining.clamp(0.0, 1.0) };
    let kept = if old_limit == UNLIMITED {
        0
    } else {
        (old_limit.max(0) as f64 * (1.0 - remaining)).round() as i64
    };
    let granted = (new_limit.max(0) as f64 * remaining).round() as i64;
    kept.saturating_add(granted).max(current_used)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn anchor_on_31st_snaps_back_after_february() {
        let start = utc(2023, 1, 31);
        let ends: Vec<_> = (1..=5).map(|k| add_months(start, k, 31)).collect();
        assert_eq!(
            ends,
            vec![utc(2023, 2, 28), utc(2023, 3, 31), utc(2023, 4, 30), utc(2023, 5, 31), utc(2023, 6, 30)]
        );
    }

    #[test]
    fn leap_year_february_uses_29th() {
        let start = utc(2024, 1, 31);
        assert_eq!(add_months(start, 1, 31), utc(2024, 2, 29));
        assert_eq!(add_months(start, 2, 31), utc(2024, 3, 31));
    }

    #[test]
    fn cycle_walk_never_drifts() {
        let sub = utc(2023, 1, 31);
        // Inside the Feb cycle.
        assert_eq!(current_cycle(sub, utc(2023, 3, 5)), (utc(2023, 2, 28), utc(2023, 3, 31)));
        // Inside the March cycle: starts on the 31st, not the 28th.
        assert_eq!(current_cycle(sub, utc(2023, 4, 1)), (utc(2023, 3, 31), utc(2023, 4, 30)));
    }

    #[test]
    fn cycle_end_is_exclusive() {
        let sub = utc(2024, 5, 15);
        let (start, end) = current_cycle(sub, utc(2024, 6, 15));
        assert_eq!(start, utc(2024, 6, 15));
        assert_eq!(end, utc(2024, 7, 15));

        let just_before = utc(2024, 6, 15) - Duration::nanoseconds(1);
        assert_eq!(current_cycle(sub, just_before), (utc(2024, 5, 15), utc(2024, 6, 15)));
    }

    #[test]
    fn subscription_time_of_day_is_normalized() {
        let sub = Utc.with_ymd_and_hms(2024, 2, 10, 17, 45, 0).unwrap();
        let (start, end) = current_cycle(sub, utc(2024, 2, 10));
        assert_eq!(start, utc(2024, 2, 10));
        assert_eq!(end, utc(2024, 3, 10));
    }

    #[test]
    fn future_subscription_returns_first_cycle() {
        let sub = utc(2030, 1, 31);
        assert_eq!(current_cycle(sub, utc(2024, 1, 1)), (utc(2030, 1, 31), utc(2030, 2, 28)));
    }

    #[test]
    fn multi_year_gap_crosses_december() {
        let sub = utc(2020, 12, 31);
        let (start, end) = current_cycle(sub, utc(2024, 2, 15));
        assert_eq!(start, utc(2024, 1, 31));
        assert_eq!(end, utc(2024, 2, 29));
    }

    #[test]
    fn daily_period_is_utc_day() {
        let now = Utc.with_ymd_and_hms(2024, 7, 4, 23, 59, 59).unwrap();
        let p = period_for(PeriodType::Daily, utc(2020, 1, 1), now).unwrap();
        assert_eq!(p.start, utc(2024, 7, 4));
        assert_eq!(p.end, utc(2024, 7, 5));
    }

    #[test]
    fn auto_is_not_a_concrete_period() {
        let err = period_for(PeriodType::Auto, utc(2020, 1, 1), utc(2024, 1, 1)).unwrap_err();
        assert!(matches!(err, QuotaError::InvalidPeriodType(_)));
    }

    #[test]
    fn remaining_fraction_is_clamped() {
        let start = utc(2024, 4, 1);
        let end = utc(2024, 5, 1);
        assert_eq!(remaining_fraction(start, end, start), 1.0);
        assert_eq!(remaining_fraction(start, end, end), 0.0);
        assert_eq!(remaining_fraction(start, end, utc(2024, 6, 1)), 0.0);
        let mid = remaining_fraction(start, end, utc(2024, 4, 16));
        assert!((mid - 0.5).abs() < 1e-9);
    }

    #[test]
    fn proration_blends_old_and_new_allowance() {
        assert_eq!(prorated_limit(0, 100, 1_000, 0.5), 550);
        assert_eq!(prorated_limit(0, 100, 1_000, 1.0), 1_000);
        assert_eq!(prorated_limit(0, 100, 1_000, 0.0), 100);
    }

    #[test]
    fn proration_never_drops_below_used() {
        let fractions = [0.0, 0.1, 0.25, 0.5, 0.9, 1.0];
        for used in [0, 40, 99, 500, 5_000] {
            for old in [0, 10, 100, 1_000] {
                for new in [0, 10, 100, 1_000] {
                    for f in fractions {
                        let adjusted = prorated_limit(used, old, new, f);
                        assert!(adjusted >= used, "used={used} old={old} new={new} f={f} -> {adjusted}");
                    }
                }
            }
        }
    }

    #[test]
    fn proration_handles_unlimited() {
        assert_eq!(prorated_limit(10, 100, UNLIMITED, 0.5), UNLIMITED);
        assert_eq!(prorated_limit(10, UNLIMITED, 100, 0.5), 50);
        assert_eq!(prorated_limit(80, UNLIMITED, 100, 0.5), 80);
    }
}
