//! Hour and currency arithmetic.
//!
//! Hours are kept at 4 decimal places internally, rounded half away from
//! zero. Currency is only rounded to cents where it is stored or displayed.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

const MINUTES_PER_HOUR: i64 = 60;

/// Round an hour quantity to 4 decimal places.
pub fn round_hours(hours: Decimal) -> Decimal {
    hours.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a currency amount to cents.
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn minutes_to_hours(minutes: i64) -> Decimal {
    round_hours(Decimal::from(minutes) / Decimal::from(MINUTES_PER_HOUR))
}

/// Convert hours to whole minutes, rounding to the nearest minute.
///
/// Saturates at the `i64` bounds.
pub fn hours_to_minutes(hours: Decimal) -> i64 {
    let minutes = hours
        .checked_mul(Decimal::from(MINUTES_PER_HOUR))
        .map(|minutes| minutes.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero));
    match minutes.and_then(|minutes| minutes.to_i64()) {
        Some(minutes) => minutes,
        None if hours.is_sign_negative() => i64::MIN,
        None => i64::MAX,
    }
}

/// Two-decimal display form, e.g. `12.50`.
pub fn format_hours(hours: Decimal) -> String {
    format!(
        "{:.2}",
        hours.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    )
}

/// `h:mm` display form used for line quantities, e.g. `7:05`.
pub fn format_hhmm(minutes: i64) -> String {
    let sign = if minutes < 0 { "-" } else { "" };
    let minutes = minutes.abs();
    format!("{}{}:{:02}", sign, minutes / MINUTES_PER_HOUR, minutes % MINUTES_PER_HOUR)
}
