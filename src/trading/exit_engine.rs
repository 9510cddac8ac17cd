//! Exit state machine shared by the backtesters and the live monitor.
//!
//! Evaluation order per observation is fixed:
//! 1. price at or below stop closes the position (the stop wins ties)
//! 2. after target1, price at or above target2 closes the rest
//! 3. before target1, price at or above target1 sells half and moves the stop to entry
//! 4. trading days held at or beyond the limit closes at the observed close
//! 5. otherwise nothing happens

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{ExitReason, Position};

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitState {
    OpenFull,
    OpenHalf,
    Closed(ExitReason),
}

/// A price observation: a daily bar in backtests, a quote when live.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    Bar { high: Decimal, low: Decimal, close: Decimal },
    Quote(Decimal),
}

impl Observation {
    fn low(&self) -> Decimal {
        match *self {
            Observation::Bar { low, .. } => low,
            Observation::Quote(price) => price,
        }
    }

    fn high(&self) -> Decimal {
        match *self {
            Observation::Bar { high, .. } => high,
            Observation::Quote(price) => price,
        }
    }

    fn close(&self) -> Decimal {
        match *self {
            Observation::Bar { close, .. } => close,
            Observation::Quote(price) => price,
        }
    }

    /// Fill for a level touched intrabar; a quote fills at the quote itself.
    fn fill_at(&self, level: Decimal) -> Decimal {
        match *self {
            Observation::Bar { .. } => level,
            Observation::Quote(price) => price,
        }
    }
}

/// What the driver must execute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    Hold,
    Partial { quantity: u64, price: Decimal },
    Full { quantity: u64, price: Decimal, reason: ExitReason },
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub action: ExitAction,
    pub state: ExitState,
    /// Position after the action; `None` once closed
    pub remaining: Option<Position>,
}

/// Stateless exit evaluator.
pub struct ExitEngine;

impl ExitEngine {
    /// Current state of an open position.
    pub fn state_of(position: &Position) -> ExitState {
        if position.target1_hit {
            ExitState::OpenHalf
        } else {
            ExitState::OpenFull
        }
    }

    /// Evaluate one observation against `position`.
    pub fn evaluate(position: &Position, observation: &Observation, days_held: u32) -> Transition {
        if observation.low() <= position.stop_price {
            return Self::close(position, observation.fill_at(position.stop_price), ExitReason::Stop);
        }

        if position.target1_hit && observation.high() >= position.target2 {
            return Self::close(position, observation.fill_at(position.target2), ExitReason::Target2);
        }

        if !position.target1_hit && observation.high() >= position.target1 {
            let price = observation.fill_at(position.target1);
            if position.quantity > 1 {
                let sold = position.quantity / 2;
                let mut next = position.clone();
                next.quantity -= sold;
                next.stop_price = position.entry_price;
                next.target1_hit = true;
                return Transition {
                    action: ExitAction::Partial { quantity: sold, price },
                    state: ExitState::OpenHalf,
                    remaining: Some(next),
                };
            }
            // A single share cannot be split
            return Self::close(position, price, ExitReason::Target);
        }

        if days_held >= position.max_hold_days {
            return Self::close(position, observation.close(), ExitReason::Timeout);
        }

        Transition {
            action: ExitAction::Hold,
            state: Self::state_of(position),
            remaining: Some(position.clone()),
        }
    }

    /// Forced close, used at the end of a simulation.
    pub fn close(position: &Position, price: Decimal, reason: ExitReason) -> Transition {
        Transition {
            action: ExitAction::Full {
                quantity: position.quantity,
                price,
                reason,
            },
            state: ExitState::Closed(reason),
            remaining: None,
        }
    }
}

/// Weekdays in `(entry, now]`. Holidays are not consulted.
pub fn trading_days_held(entry: NaiveDate, now: NaiveDate) -> u32 {
    let mut days = 0;
    let mut day = entry + Duration::days(1);
    while day <= now {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days += 1;
        }
        day += Duration::days(1);
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn position(quantity: u64) -> Position {
        Position {
            symbol: "AAA".into(),
            strategy: "test".into(),
            quantity,
            entry_price: dec!(100),
            stop_price: dec!(98),
            original_stop: dec!(98),
            target1: dec!(103),
            target2: dec!(106),
            target1_hit: false,
            entry_time: Utc::now(),
            max_hold_days: 10,
        }
    }

    fn bar(high: Decimal, low: Decimal, close: Decimal) -> Observation {
        Observation::Bar { high, low, close }
    }

    #[test]
    fn test_stop_wins_over_target_in_same_bar() {
        // Low of 97 and high of 104 in one bar
        let t = ExitEngine::evaluate(&position(100), &bar(dec!(104), dec!(97), dec!(100)), 1);
        assert_eq!(t.state, ExitState::Closed(ExitReason::Stop));
        assert_eq!(
            t.action,
            ExitAction::Full { quantity: 100, price: dec!(98), reason: ExitReason::Stop }
        );
        assert!(t.remaining.is_none());
    }

    #[test]
    fn test_partial_then_breakeven_stop_boundary_exits() {
        let t1 = ExitEngine::evaluate(&position(100), &bar(dec!(103), dec!(101), dec!(102)), 1);
        assert_eq!(t1.action, ExitAction::Partial { quantity: 50, price: dec!(103) });
        assert_eq!(t1.state, ExitState::OpenHalf);
        let half = t1.remaining.unwrap();
        assert_eq!(half.quantity, 50);
        assert_eq!(half.stop_price, dec!(100));
        assert!(half.target1_hit);

        // Low equal to the relocated stop is an exit
        let t2 = ExitEngine::evaluate(&half, &bar(dec!(102), dec!(100), dec!(101)), 2);
        assert_eq!(t2.state, ExitState::Closed(ExitReason::Stop));
        assert_eq!(
            t2.action,
            ExitAction::Full { quantity: 50, price: dec!(100), reason: ExitReason::Stop }
        );
    }

    #[test]
    fn test_partial_then_target2() {
        let half = ExitEngine::evaluate(&position(100), &bar(dec!(103), dec!(101), dec!(102)), 1)
            .remaining
            .unwrap();

        let t2 = ExitEngine::evaluate(&half, &bar(dec!(102), dec!(100.5), dec!(101)), 2);
        assert_eq!(t2.action, ExitAction::Hold);
        let half = t2.remaining.unwrap();

        let t3 = ExitEngine::evaluate(&half, &bar(dec!(106), dec!(101), dec!(105)), 3);
        assert_eq!(
            t3.action,
            ExitAction::Full { quantity: 50, price: dec!(106), reason: ExitReason::Target2 }
        );
    }

    #[test]
    fn test_single_share_at_target1_closes_fully() {
        let t = ExitEngine::evaluate(&position(1), &bar(dec!(103.5), dec!(99), dec!(103)), 1);
        assert_eq!(t.state, ExitState::Closed(ExitReason::Target));
    }

    #[test]
    fn test_timeout_at_close() {
        let t = ExitEngine::evaluate(&position(10), &bar(dec!(101), dec!(99), dec!(100.5)), 10);
        assert_eq!(
            t.action,
            ExitAction::Full { quantity: 10, price: dec!(100.5), reason: ExitReason::Timeout }
        );

        let t = ExitEngine::evaluate(&position(10), &bar(dec!(101), dec!(99), dec!(100.5)), 9);
        assert_eq!(t.action, ExitAction::Hold);
    }

    #[test]
    fn test_quote_uses_same_rules() {
        let t = ExitEngine::evaluate(&position(100), &Observation::Quote(dec!(97.5)), 1);
        assert_eq!(
            t.action,
            ExitAction::Full { quantity: 100, price: dec!(97.5), reason: ExitReason::Stop }
        );

        let t = ExitEngine::evaluate(&position(100), &Observation::Quote(dec!(103.2)), 1);
        assert_eq!(t.action, ExitAction::Partial { quantity: 50, price: dec!(103.2) });
    }

    #[test]
    fn test_trading_days_skip_weekends() {
        let fri = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let mon = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let next_fri = NaiveDate::from_ymd_opt(2024, 1, 12).unwrap();
        assert_eq!(trading_days_held(fri, fri), 0);
        assert_eq!(trading_days_held(fri, mon), 1);
        assert_eq!(trading_days_held(fri, next_fri), 5);
        assert_eq!(trading_days_held(mon, fri), 0);
    }

    proptest! {
        #[test]
        fn stop_always_wins(low in 50i64..9800, high in 10300i64..20000) {
            let obs = bar(Decimal::new(high, 2), Decimal::new(low, 2), dec!(100));
            let t = ExitEngine::evaluate(&position(100), &obs, 1);
            prop_assert_eq!(t.state, ExitState::Closed(ExitReason::Stop));
        }

        #[test]
        fn quantity_never_increases(
            path in proptest::collection::vec((9700i64..10800, 0i64..400), 1..30),
            quantity in 2u64..1000,
        ) {
            let mut current = position(quantity);
            let mut last_qty = quantity;
            for (day, (low, range)) in path.into_iter().enumerate() {
                let low = Decimal::new(low, 2);
                let obs = bar(low + Decimal::new(range, 2), low, low);
                let t = ExitEngine::evaluate(&current, &obs, day as u32 + 1);
                match t.remaining {
                    Some(next) => {
                        prop_assert!(next.quantity <= last_qty);
                        if next.target1_hit {
                            prop_assert_eq!(next.stop_price, next.entry_price);
                        }
                        if let ExitAction::Partial { .. } = t.action {
                            prop_assert!(next.quantity < last_qty);
                        }
                        last_qty = next.quantity;
                        current = next;
                    }
                    None => break,
                }
            }
        }
    }
}
