//! Monetary rounding and the fixed four-digit wire format.

use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Fraction digits carried by every serialized amount.
pub const MONEY_SCALE: u32 = 4;

/// Round to [`MONEY_SCALE`] digits, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Format an amount as a decimal string with exactly four fraction digits.
pub fn to_fixed(amount: Decimal) -> String {
    let mut rounded = round_money(amount);
    if rounded.is_zero() {
        rounded = Decimal::ZERO;
    }
    rounded.rescale(MONEY_SCALE);
    rounded.to_string()
}

/// Serde adapter for `Decimal` fields exchanged as fixed-scale strings.
pub mod fixed4 {
    use super::*;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_fixed(*amount))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Decimal::from_str(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pads_to_four_digits() {
        assert_eq!(to_fixed(dec!(96)), "96.0000");
        assert_eq!(to_fixed(dec!(24.0)), "24.0000");
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(to_fixed(dec!(1.23455)), "1.2346");
        assert_eq!(to_fixed(dec!(-1.23455)), "-1.2346");
    }

    #[test]
    fn zero_has_no_sign() {
        assert_eq!(to_fixed(-dec!(0.00001)), "0.0000");
    }

    #[test]
    fn serde_adapter_uses_strings() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Wrapper {
            #[serde(with = "fixed4")]
            total: Decimal,
        }

        let json = serde_json::to_string(&Wrapper { total: dec!(1350) }).unwrap();
        assert_eq!(json, r#"{"total":"1350.0000"}"#);

        let back: Wrapper = serde_json::from_str(r#"{"total":"12.5"}"#).unwrap();
        assert_eq!(back.total, dec!(12.5));
    }
}
