//! Shared primitive IDs, the fixed-point [`Money`] type, and collection kinds.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Neg, Sub},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable user (account holder) identifier.
pub type UserId = String;
/// Stable product identifier.
pub type ProductId = String;
/// Ledger event identifier.
pub type EventId = String;
/// Institution (resource scope) identifier.
pub type InstitutionId = String;
/// Timestamp in milliseconds since epoch.
pub type TimestampMs = u64;

/// Minor units per major currency unit.
pub const MINOR_PER_MAJOR: i64 = 100;

/// Currency amount held as a signed count of minor units (hundredths).
///
/// The remote data service speaks floating-point major units; conversion happens once at
/// the boundary by rounding to the nearest hundredth, after which all arithmetic and
/// comparisons are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Zero amount.
    pub const ZERO: Money = Money(0);

    /// Builds an amount from minor units.
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Builds an amount from whole major units, saturating at the `i64` range.
    pub const fn from_major_units(major: i64) -> Self {
        Self(major.saturating_mul(MINOR_PER_MAJOR))
    }

    /// Whole major units, or `None` when the minor-unit count overflows.
    pub const fn checked_from_major_units(major: i64) -> Option<Self> {
        match major.checked_mul(MINOR_PER_MAJOR) {
            Some(minor) => Some(Self(minor)),
            None => None,
        }
    }

    /// Converts a floating-point major-unit amount, rounding to the nearest minor unit.
    ///
    /// Saturates out-of-range values; NaN becomes zero. Use [`Money::try_from_major`] for
    /// untrusted input.
    pub fn from_major(major: f64) -> Self {
        Self((major * MINOR_PER_MAJOR as f64).round() as i64)
    }

    /// Like [`Money::from_major`], but `None` for NaN, infinities and out-of-range values.
    pub fn try_from_major(major: f64) -> Option<Self> {
        if !major.is_finite() {
            return None;
        }
        let minor = (major * MINOR_PER_MAJOR as f64).round();
        // i64::MAX as f64 rounds up to 2^63, which is already out of range.
        (minor >= i64::MIN as f64 && minor < i64::MAX as f64).then(|| Self(minor as i64))
    }

    /// Raw minor units.
    pub const fn minor(self) -> i64 {
        self.0
    }

    /// Lossy major-unit view for the wire.
    pub fn to_major(self) -> f64 {
        self.0 as f64 / MINOR_PER_MAJOR as f64
    }

    /// Absolute value.
    pub const fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// True for strictly negative amounts.
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// True for strictly positive amounts.
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// True for zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Subtraction clamped at zero.
    pub fn saturating_sub_floor_zero(self, rhs: Money) -> Money {
        Money((self.0 - rhs.0).max(0))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.copied().sum()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_MAJOR as u64;
        write!(f, "{sign}{}.{:02}", abs / per, abs % per)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_major())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireAmount {
    Int(i64),
    Float(f64),
    Text(String),
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        match WireAmount::deserialize(deserializer)? {
            WireAmount::Int(v) => Money::checked_from_major_units(v)
                .ok_or_else(|| D::Error::custom(format!("amount {v} out of range"))),
            WireAmount::Float(v) => {
                Money::try_from_major(v).ok_or_else(|| D::Error::custom(format!("amount {v} out of range")))
            }
            WireAmount::Text(s) => {
                let v = s
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| D::Error::custom(format!("invalid amount {s:?}: {e}")))?;
                Money::try_from_major(v).ok_or_else(|| D::Error::custom(format!("invalid amount {s:?}")))
            }
        }
    }
}

/// Cached collection selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Account holders and their balances.
    Users,
    /// Sellable products.
    Products,
}

impl CollectionKind {
    /// Every cached collection, in refresh order.
    pub const ALL: [CollectionKind; 2] = [CollectionKind::Users, CollectionKind::Products];
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKind::Users => f.write_str("users"),
            CollectionKind::Products => f.write_str("products"),
        }
    }
}

/// Per-collection fetch generation used to discard superseded reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefetchToken(pub u64);

impl RefetchToken {
    /// Returns the following token.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}
