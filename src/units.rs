use alloy_primitives::U256;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::ops::Mul;
use std::str::FromStr;

/// Decimal places of the chain's native currency.
pub const NATIVE_DECIMALS: u32 = 18;

static WEI_PER_NATIVE: Lazy<U256> =
    Lazy::new(|| U256::from(10u64).pow(U256::from(NATIVE_DECIMALS)));

/// An amount of the chain's native currency, held as integer wei.
///
/// Amounts cross the tool surface as decimal strings (`"0.5"`, `"1"`,
/// `"0.000000000000000001"`); floats are never accepted or produced.
/// Arithmetic stays in `U256` wei throughout.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NativeAmount(U256);

impl NativeAmount {
    pub const ZERO: Self = Self(U256::ZERO);

    pub const fn from_wei(wei: U256) -> Self {
        Self(wei)
    }

    pub fn from_gwei(gwei: u128) -> Self {
        Self(U256::from(gwei).mul(U256::from(1_000_000_000u64)))
    }

    pub const fn wei(&self) -> U256 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(&self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn saturating_add(&self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Parses a decimal string into wei.
    ///
    /// Rejects negatives, malformed input, and more than 18 fractional
    /// digits (sub-wei precision does not exist on chain).
    pub fn parse(input: &str) -> Result<Self, AmountParseError> {
        let parsed =
            Decimal::from_str(input.trim()).map_err(|_| AmountParseError::InvalidFormat)?;
        if parsed.is_sign_negative() {
            return Err(AmountParseError::Negative);
        }
        let scale = parsed.scale();
        if scale > NATIVE_DECIMALS {
            return Err(AmountParseError::WrongPrecision { digits: scale });
        }
        let mantissa = parsed.mantissa().unsigned_abs();
        let multiplier = U256::from(10u64).pow(U256::from(NATIVE_DECIMALS - scale));
        Ok(Self(U256::from(mantissa).mul(multiplier)))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountParseError {
    #[error("invalid decimal amount")]
    InvalidFormat,
    #[error("negative amount is not allowed")]
    Negative,
    #[error("too many fractional digits: {digits}, native currency carries {NATIVE_DECIMALS}")]
    WrongPrecision { digits: u32 },
}

impl Display for NativeAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / *WEI_PER_NATIVE;
        let frac = self.0 % *WEI_PER_NATIVE;
        if frac.is_zero() {
            return write!(f, "{whole}");
        }
        let frac = format!("{:0>width$}", frac.to_string(), width = NATIVE_DECIMALS as usize);
        write!(f, "{whole}.{}", frac.trim_end_matches('0'))
    }
}

impl fmt::Debug for NativeAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeAmount({self})")
    }
}

impl FromStr for NativeAmount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<U256> for NativeAmount {
    fn from(wei: U256) -> Self {
        Self(wei)
    }
}

impl Serialize for NativeAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NativeAmount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
