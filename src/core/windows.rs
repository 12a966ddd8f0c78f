use crate::models::{Category, FetchWindow};
use chrono::{Duration, NaiveDate};

/// Splits `[from_date, till_date)` into contiguous provider-sized windows.
///
/// The provider treats `till` as inclusive, so a window spanning `max_span_days`
/// provider days advances by `max_span_days - 1`. An empty or inverted range
/// yields no windows.
pub fn plan_windows(
    entity_id: &str,
    category: Category,
    from_date: NaiveDate,
    till_date: NaiveDate,
    max_span_days: u32,
) -> Vec<FetchWindow> {
    let step = Duration::days(i64::from(max_span_days.saturating_sub(1).max(1)));
    let mut windows = Vec::new();
    let mut start = from_date;

    while start < till_date {
        let end = start.checked_add_signed(step).map_or(till_date, |d| d.min(till_date));
        windows.push(FetchWindow {
            entity_id: entity_id.to_string(),
            category,
            from_date: start,
            till_date: end,
        });
        start = end;
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn assert_covers(windows: &[FetchWindow], from: NaiveDate, till: NaiveDate, max_span: u32) {
        assert_eq!(windows.first().map(|w| w.from_date), Some(from));
        assert_eq!(windows.last().map(|w| w.till_date), Some(till));
        for pair in windows.windows(2) {
            assert_eq!(pair[0].till_date, pair[1].from_date, "gap or overlap");
        }
        for w in windows {
            assert!(w.from_date < w.till_date);
            assert!(w.span_days() <= i64::from(max_span));
        }
    }

    #[test]
    fn splits_hundred_day_limit_at_april_tenth() {
        let windows = plan_windows("SBER", Category::Shares, date(2023, 1, 1), date(2023, 4, 11), 100);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].from_date, date(2023, 1, 1));
        assert_eq!(windows[0].till_date, date(2023, 4, 10));
        assert_eq!(windows[1].from_date, date(2023, 4, 10));
        assert_eq!(windows[1].till_date, date(2023, 4, 11));
    }

    #[test]
    fn empty_or_inverted_range_yields_nothing() {
        let d = date(2024, 5, 1);
        assert!(plan_windows("SBER", Category::Shares, d, d, 100).is_empty());
        assert!(plan_windows("SBER", Category::Shares, d, date(2024, 4, 1), 100).is_empty());
    }

    #[test]
    fn short_range_is_single_window() {
        let windows = plan_windows("SE3", Category::Electricity, date(2024, 1, 1), date(2024, 1, 5), 100);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].category, Category::Electricity);
        assert_eq!(windows[0].entity_id, "SE3");
    }

    #[test]
    fn covers_range_for_many_spans() {
        let from = date(2020, 2, 27);
        for till_offset in [1i64, 2, 7, 99, 100, 101, 365, 1096] {
            let till = from + Duration::days(till_offset);
            for max_span in [1u32, 2, 3, 30, 100, 500] {
                let windows = plan_windows("GAZP", Category::Shares, from, till, max_span);
                assert_covers(&windows, from, till, max_span);
            }
        }
    }
}
