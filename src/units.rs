use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{cmp::Ordering, fmt};

use crate::error::{Result, SqcError};

/// Physical unit of a [`Quantity`]; magnitudes are always stored in the SI base of the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Hertz,
    Second,
    Percent,
    Count,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Ohm => "Ohm",
            Unit::Farad => "F",
            Unit::Hertz => "Hz",
            Unit::Second => "s",
            Unit::Percent => "%",
            Unit::Count => "",
        }
    }

    fn from_symbol(symbol: &str) -> Option<Unit> {
        match symbol {
            "V" | "v" => Some(Unit::Volt),
            "A" => Some(Unit::Ampere),
            "Ohm" | "ohm" | "OHM" | "Ω" => Some(Unit::Ohm),
            "F" => Some(Unit::Farad),
            "Hz" | "hz" | "HZ" => Some(Unit::Hertz),
            "s" | "sec" => Some(Unit::Second),
            "%" => Some(Unit::Percent),
            _ => None,
        }
    }

    /// Units that never take an SI prefix when printed
    fn is_dimensionless(self) -> bool {
        matches!(self, Unit::Percent | Unit::Count)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// SI prefix for explicit conversion and display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prefix {
    Pico,
    Nano,
    Micro,
    Milli,
    Base,
    Kilo,
    Mega,
    Giga,
}

macro_rules! impl_prefix_table {
    { $( $variant:ident => $magnitude:literal, $notation:literal ),* $(,)? } => {
        impl Prefix {
            /// Prefixes ordered from largest to smallest
            pub const DESCENDING: [Prefix; 8] = [
                Prefix::Giga,
                Prefix::Mega,
                Prefix::Kilo,
                Prefix::Base,
                Prefix::Milli,
                Prefix::Micro,
                Prefix::Nano,
                Prefix::Pico,
            ];

            /// Power of ten of this prefix, e.g. -3 for milli
            pub fn magnitude(self) -> i32 {
                match self {
                    $( Prefix::$variant => $magnitude, )*
                }
            }

            pub fn notation(self) -> &'static str {
                match self {
                    $( Prefix::$variant => $notation, )*
                }
            }

            pub fn factor(self) -> f64 {
                10f64.powi(self.magnitude())
            }
        }
    }
}

impl_prefix_table! {
    Pico => -12, "p",
    Nano => -9, "n",
    Micro => -6, "u",
    Milli => -3, "m",
    Base => 0, "",
    Kilo => 3, "k",
    Mega => 6, "M",
    Giga => 9, "G",
}

impl Prefix {
    fn from_notation(c: char) -> Option<Prefix> {
        match c {
            'p' => Some(Prefix::Pico),
            'n' => Some(Prefix::Nano),
            'u' | 'µ' | 'μ' => Some(Prefix::Micro),
            'm' => Some(Prefix::Milli),
            'k' => Some(Prefix::Kilo),
            'M' => Some(Prefix::Mega),
            'G' => Some(Prefix::Giga),
            _ => None,
        }
    }
}

/// Pretty prints a value with an auto-scaled SI prefix, e.g. `0.0042 A` as `"4.200 mA"`
pub fn format_metric(value: f64, unit: Unit) -> String {
    format_metric_with(value, unit, 3)
}

pub fn format_metric_with(value: f64, unit: Unit, decimals: usize) -> String {
    if !value.is_finite() {
        return format!("{value} {unit}");
    }
    if unit.is_dimensionless() {
        return format!("{value:.decimals$} {unit}").trim_end().to_string();
    }
    let prefix = Prefix::DESCENDING
        .iter()
        .copied()
        .find(|p| value.abs() >= p.factor())
        .unwrap_or(Prefix::Pico);
    let prefix = if value == 0.0 { Prefix::Base } else { prefix };
    format!(
        "{:.decimals$} {}{}",
        value / prefix.factor(),
        prefix.notation(),
        unit.symbol()
    )
}

/// Magnitude tagged with a physical unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantity {
    value: f64,
    unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn volts(value: f64) -> Self {
        Self::new(value, Unit::Volt)
    }

    pub fn amperes(value: f64) -> Self {
        Self::new(value, Unit::Ampere)
    }

    pub fn ohms(value: f64) -> Self {
        Self::new(value, Unit::Ohm)
    }

    pub fn farads(value: f64) -> Self {
        Self::new(value, Unit::Farad)
    }

    pub fn hertz(value: f64) -> Self {
        Self::new(value, Unit::Hertz)
    }

    pub fn seconds(value: f64) -> Self {
        Self::new(value, Unit::Second)
    }

    pub fn percent(value: f64) -> Self {
        Self::new(value, Unit::Percent)
    }

    /// Magnitude in SI base units
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Magnitude expressed with the given prefix, e.g. `value_in(Prefix::Micro)` of 25e-6 A is 25
    pub fn value_in(&self, prefix: Prefix) -> f64 {
        self.value / prefix.factor()
    }

    pub fn abs(&self) -> Self {
        Self::new(self.value.abs(), self.unit)
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self::new(self.value * factor, self.unit)
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0.0
    }

    pub fn expect_unit(&self, unit: Unit) -> Result<()> {
        if self.unit == unit {
            Ok(())
        } else {
            Err(SqcError::UnitMismatch(format!(
                "expected {unit:?}, got {:?} ({self})",
                self.unit
            )))
        }
    }

    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity> {
        other.expect_unit(self.unit)?;
        Ok(Self::new(self.value + other.value, self.unit))
    }

    pub fn checked_sub(&self, other: &Quantity) -> Result<Quantity> {
        other.expect_unit(self.unit)?;
        Ok(Self::new(self.value - other.value, self.unit))
    }

    /// Parses a quantity that must carry its unit, e.g. `"-600 V"` or `"25uA"`
    pub fn parse(text: &str) -> Result<Quantity> {
        let (value, unit) = split_quantity(text)?;
        match unit {
            Some(unit) => Ok(Self::new(value, unit)),
            None => Err(SqcError::UnitMismatch(format!(
                "quantity {text:?} has no unit"
            ))),
        }
    }

    /// Parses a quantity expected in `expected`; plain numbers are taken in that unit
    pub fn parse_as(text: &str, expected: Unit) -> Result<Quantity> {
        let (value, unit) = split_quantity(text)?;
        match unit {
            None => Ok(Self::new(value, expected)),
            Some(unit) if unit == expected => Ok(Self::new(value, unit)),
            Some(unit) => Err(SqcError::UnitMismatch(format!(
                "expected {expected:?} for {text:?}, got {unit:?}"
            ))),
        }
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.unit != other.unit {
            return None;
        }
        self.value.partial_cmp(&other.value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_metric(self.value, self.unit))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(format!("{} {}", self.value, self.unit.symbol()).trim_end())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Quantity::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Splits `"25 uA"` into (25e-6, Some(Ampere)); a bare number yields no unit
fn split_quantity(text: &str) -> Result<(f64, Option<Unit>)> {
    let text = text.trim();
    let split = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .filter(|&i| text[..i].trim().parse::<f64>().is_ok())
        .last()
        .ok_or_else(|| SqcError::Configuration(format!("invalid quantity: {text:?}")))?;

    let value: f64 = text[..split]
        .trim()
        .parse()
        .map_err(|_| SqcError::Configuration(format!("invalid quantity: {text:?}")))?;
    let suffix = text[split..].trim();
    if suffix.is_empty() {
        return Ok((value, None));
    }

    if let Some(unit) = Unit::from_symbol(suffix) {
        return Ok((value, Some(unit)));
    }

    let mut chars = suffix.chars();
    let prefix = chars.next().and_then(Prefix::from_notation);
    let rest = chars.as_str();
    match (prefix, Unit::from_symbol(rest)) {
        (Some(prefix), Some(unit)) => Ok((value * prefix.factor(), Some(unit))),
        _ => Err(SqcError::Configuration(format!(
            "unknown unit {suffix:?} in {text:?}"
        ))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Number(f64),
    Text(String),
}

impl RawQuantity {
    fn into_quantity(self, unit: Unit) -> Result<Quantity> {
        match self {
            RawQuantity::Number(value) => Ok(Quantity::new(value, unit)),
            RawQuantity::Text(text) => Quantity::parse_as(&text, unit),
        }
    }
}

/// Serde field adapters that accept `"-600 V"` or `-600` for a field of a known unit.
macro_rules! quantity_field {
    { $module:ident, $unit:expr } => {
        pub mod $module {
            use super::*;

            pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Quantity, D::Error>
            where
                D: Deserializer<'de>,
            {
                RawQuantity::deserialize(deserializer)?
                    .into_quantity($unit)
                    .map_err(serde::de::Error::custom)
            }

            pub fn serialize<S: Serializer>(
                quantity: &Quantity,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                quantity.serialize(serializer)
            }

            pub mod option {
                use super::*;

                pub fn deserialize<'de, D>(
                    deserializer: D,
                ) -> std::result::Result<Option<Quantity>, D::Error>
                where
                    D: Deserializer<'de>,
                {
                    Option::<RawQuantity>::deserialize(deserializer)?
                        .map(|raw| raw.into_quantity($unit))
                        .transpose()
                        .map_err(serde::de::Error::custom)
                }

                pub fn serialize<S: Serializer>(
                    quantity: &Option<Quantity>,
                    serializer: S,
                ) -> std::result::Result<S::Ok, S::Error> {
                    quantity.serialize(serializer)
                }
            }
        }
    }
}

quantity_field! { volts, Unit::Volt }
quantity_field! { amperes, Unit::Ampere }
quantity_field! { ohms, Unit::Ohm }
quantity_field! { farads, Unit::Farad }
quantity_field! { hertz, Unit::Hertz }
quantity_field! { seconds, Unit::Second }
quantity_field! { percent, Unit::Percent }

/// Acceptance window for a measured metric. Bounds of zero are treated as unset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tolerance {
    pub minimum: Option<Quantity>,
    pub maximum: Option<Quantity>,
}

impl Tolerance {
    pub fn new(minimum: Option<Quantity>, maximum: Option<Quantity>) -> Self {
        Self {
            minimum: minimum.filter(|q| !q.is_zero()),
            maximum: maximum.filter(|q| !q.is_zero()),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            minimum: None,
            maximum: None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.minimum.is_none() && self.maximum.is_none()
    }

    /// Compares `|value|` against the bounds. NaN and infinities never pass a bound.
    pub fn check(&self, value: &Quantity) -> Result<bool> {
        let magnitude = value.abs();
        if !self.is_unbounded() && !magnitude.value().is_finite() {
            for bound in self.minimum.iter().chain(&self.maximum) {
                bound.expect_unit(value.unit())?;
            }
            return Ok(false);
        }
        if let Some(minimum) = &self.minimum {
            minimum.expect_unit(value.unit())?;
            if magnitude.value() < minimum.value() {
                return Ok(false);
            }
        }
        if let Some(maximum) = &self.maximum {
            maximum.expect_unit(value.unit())?;
            if magnitude.value() > maximum.value() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Like [`Tolerance::check`] but returns `ToleranceOutOfRange` describing the window
    pub fn ensure(&self, value: &Quantity) -> Result<()> {
        if self.check(value)? {
            return Ok(());
        }
        let bound = |q: &Option<Quantity>| {
            q.map(|q| q.to_string()).unwrap_or_else(|| "---".to_string())
        };
        Err(SqcError::ToleranceOutOfRange(format!(
            "{} not in [{}, {}]",
            value.abs(),
            bound(&self.minimum),
            bound(&self.maximum)
        )))
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn test_parse_with_prefixes() {
        let q = Quantity::parse("25uA").unwrap();
        assert_eq!(q.unit(), Unit::Ampere);
        assert!(close(q.value(), 25e-6));

        let q = Quantity::parse("1 kHz").unwrap();
        assert_eq!(q.unit(), Unit::Hertz);
        assert!(close(q.value(), 1e3));

        let q = Quantity::parse("10 MOhm").unwrap();
        assert!(close(q.value(), 10e6));

        let q = Quantity::parse("200 ms").unwrap();
        assert_eq!(q.unit(), Unit::Second);
        assert!(close(q.value(), 0.2));

        let q = Quantity::parse("-600 V").unwrap();
        assert_eq!(q, Quantity::volts(-600.0));

        let q = Quantity::parse("45 %").unwrap();
        assert_eq!(q, Quantity::percent(45.0));
    }

    #[test]
    fn test_parse_as_plain_number() {
        let q = Quantity::parse_as("-5", Unit::Volt).unwrap();
        assert_eq!(q, Quantity::volts(-5.0));
        assert!(Quantity::parse("-5").is_err());
        assert!(matches!(
            Quantity::parse_as("1 uA", Unit::Volt),
            Err(SqcError::UnitMismatch(_))
        ));
        assert!(Quantity::parse("12 parsecs").is_err());
    }

    #[test]
    fn test_mixed_units_do_not_compare() {
        let v = Quantity::volts(1.0);
        let i = Quantity::amperes(1.0);
        assert_eq!(v.partial_cmp(&i), None);
        assert!(v.checked_add(&i).is_err());
        assert!(Quantity::volts(-10.0) < Quantity::volts(0.0));
        assert_eq!(
            v.checked_sub(&Quantity::volts(0.5)).unwrap(),
            Quantity::volts(0.5)
        );
    }

    #[test]
    fn test_value_in_prefix() {
        let q = Quantity::amperes(25e-6);
        assert!(close(q.value_in(Prefix::Micro), 25.0));
        assert!(close(Quantity::hertz(1e6).value_in(Prefix::Mega), 1.0));
    }

    #[test]
    fn test_format_metric() {
        assert_eq!(format_metric(0.0042, Unit::Ampere), "4.200 mA");
        assert_eq!(format_metric(-600.0, Unit::Volt), "-600.000 V");
        assert_eq!(format_metric(0.0, Unit::Volt), "0.000 V");
        assert_eq!(format_metric(1.5e6, Unit::Ohm), "1.500 MOhm");
        assert_eq!(format_metric(45.0, Unit::Percent), "45.000 %");
    }

    #[test]
    fn test_tolerance_zero_bound_is_unset() {
        let tol = Tolerance::new(Some(Quantity::amperes(0.0)), Some(Quantity::amperes(1e-9)));
        assert!(tol.minimum.is_none());
        assert!(tol.check(&Quantity::amperes(-0.5e-9)).unwrap());
        assert!(!tol.check(&Quantity::amperes(-2e-9)).unwrap());
        assert!(matches!(
            tol.ensure(&Quantity::amperes(2e-9)),
            Err(SqcError::ToleranceOutOfRange(_))
        ));
        assert!(tol.check(&Quantity::volts(1.0)).is_err());
        assert!(Tolerance::unbounded().check(&Quantity::volts(1e9)).unwrap());
    }

    #[test]
    fn test_tolerance_rejects_non_finite_readings() {
        let tol = Tolerance::new(Some(Quantity::ohms(1e6)), Some(Quantity::ohms(2e6)));
        assert!(tol.check(&Quantity::ohms(1.5e6)).unwrap());
        assert!(!tol.check(&Quantity::ohms(f64::NAN)).unwrap());
        assert!(!tol.check(&Quantity::ohms(f64::INFINITY)).unwrap());
        assert!(tol.ensure(&Quantity::ohms(f64::NAN)).is_err());
        assert!(tol.check(&Quantity::amperes(f64::NAN)).is_err());
    }

    #[derive(Deserialize)]
    struct Params {
        #[serde(with = "volts")]
        voltage: Quantity,
        #[serde(with = "amperes")]
        compliance: Quantity,
        #[serde(default, with = "farads::option")]
        cp_maximum: Option<Quantity>,
    }

    #[test]
    fn test_field_adapters() {
        let params: Params =
            toml::from_str("voltage = -100\ncompliance = \"25 uA\"\ncp_maximum = \"10 pF\"")
                .unwrap();
        assert_eq!(params.voltage, Quantity::volts(-100.0));
        assert!(close(params.compliance.value(), 25e-6));
        assert!(close(params.cp_maximum.unwrap().value(), 10e-12));

        let bad: std::result::Result<Params, _> =
            toml::from_str("voltage = \"1 A\"\ncompliance = 1");
        assert!(bad.is_err());
    }
}
