//! Shared trading calendar for multi-symbol simulation.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;

use crate::models::Bar;

/// Dates present in at least half of `series`, ascending, keeping the last `keep`.
pub fn build_calendar<'a, I>(series: I, keep: usize) -> Vec<NaiveDate>
where
    I: IntoIterator<Item = &'a [Bar]>,
{
    let mut counts: HashMap<NaiveDate, usize> = HashMap::new();
    let mut total = 0usize;

    for bars in series {
        total += 1;
        let dates: HashSet<NaiveDate> = bars.iter().map(Bar::date).collect();
        for date in dates {
            *counts.entry(date).or_insert(0) += 1;
        }
    }

    let mut calendar: Vec<NaiveDate> = counts
        .into_iter()
        .filter(|(_, count)| count * 2 >= total)
        .map(|(date, _)| date)
        .collect();
    calendar.sort();

    if calendar.len() > keep {
        calendar.drain(..calendar.len() - keep);
    }
    calendar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::flat_bars;
    use rust_decimal_macros::dec;

    #[test]
    fn test_majority_dates_only() {
        let a = flat_bars(10, dec!(1));
        let b = flat_bars(6, dec!(1));
        let c = flat_bars(3, dec!(1));

        // Three series: a date needs two of them
        let calendar = build_calendar([a.as_slice(), b.as_slice(), c.as_slice()], 100);
        assert_eq!(calendar.len(), 6);
        assert_eq!(calendar[0], a[0].date());

        let recent = build_calendar([a.as_slice(), b.as_slice(), c.as_slice()], 4);
        assert_eq!(recent.len(), 4);
        assert_eq!(*recent.last().unwrap(), b[5].date());
    }

    #[test]
    fn test_two_series_half_is_enough() {
        let a = flat_bars(10, dec!(1));
        let b = flat_bars(4, dec!(1));
        assert_eq!(build_calendar([a.as_slice(), b.as_slice()], 100).len(), 10);
        assert!(build_calendar(std::iter::empty::<&[Bar]>(), 10).is_empty());
    }
}
