//! Semantic equality for container resource requirements
//!
//! The API server normalizes quantities (`0.5` comes back as `500m`, `1Gi`
//! may come back as `1024Mi`), so resource drift is judged on values, not
//! on strings. An absent map equals an empty one.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Whether two optional resource requirements are semantically equal
pub fn resources_equal(
    desired: Option<&ResourceRequirements>,
    live: Option<&ResourceRequirements>,
) -> bool {
    let empty = ResourceRequirements::default();
    let a = desired.unwrap_or(&empty);
    let b = live.unwrap_or(&empty);

    quantity_maps_equal(a.limits.as_ref(), b.limits.as_ref())
        && quantity_maps_equal(a.requests.as_ref(), b.requests.as_ref())
        && a.claims.as_deref().unwrap_or_default() == b.claims.as_deref().unwrap_or_default()
}

fn quantity_maps_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);

    a.len() == b.len()
        && a
            .iter()
            .all(|(key, qa)| b.get(key).is_some_and(|qb| quantities_equal(qa, qb)))
}

/// Compare two quantities by value, falling back to their text if either
/// does not parse
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(x), Some(y)) => x == y,
        _ => a.0.trim() == b.0.trim(),
    }
}

/// A quantity as `mantissa * 10^exponent` with no trailing zeros in the mantissa
#[derive(Debug, PartialEq, Eq)]
struct Decimal {
    mantissa: i128,
    exponent: i32,
}

impl Decimal {
    /// `None` when the exponent leaves the `i32` range
    fn normalized(mut mantissa: i128, mut exponent: i32) -> Option<Self> {
        if mantissa == 0 {
            return Some(Self {
                mantissa: 0,
                exponent: 0,
            });
        }
        while mantissa % 10 == 0 {
            mantissa /= 10;
            exponent = exponent.checked_add(1)?;
        }
        Some(Self { mantissa, exponent })
    }
}

fn parse_quantity(raw: &str) -> Option<Decimal> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let (mut mantissa, mut exponent) = parse_number(number)?;

    match suffix {
        "" => {}
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => {
            let power = match suffix {
                "Ki" => 1,
                "Mi" => 2,
                "Gi" => 3,
                "Ti" => 4,
                "Pi" => 5,
                _ => 6,
            };
            mantissa = mantissa.checked_mul(1i128.checked_shl(10 * power)?)?;
        }
        "n" => exponent = exponent.checked_sub(9)?,
        "u" => exponent = exponent.checked_sub(6)?,
        "m" => exponent = exponent.checked_sub(3)?,
        "k" => exponent = exponent.checked_add(3)?,
        "M" => exponent = exponent.checked_add(6)?,
        "G" => exponent = exponent.checked_add(9)?,
        "T" => exponent = exponent.checked_add(12)?,
        "P" => exponent = exponent.checked_add(15)?,
        "E" => exponent = exponent.checked_add(18)?,
        other => {
            let exp = other.strip_prefix(['e', 'E'])?;
            exponent = exponent.checked_add(exp.parse::<i32>().ok()?)?;
        }
    }

    Decimal::normalized(mantissa, exponent)
}

fn parse_number(number: &str) -> Option<(i128, i32)> {
    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }

    let mut mantissa: i128 = 0;
    for c in whole.chars().chain(fraction.chars()) {
        let digit = i128::from(c.to_digit(10)?);
        mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
    }
    let exponent = -i32::try_from(fraction.len()).ok()?;

    Some((if negative { -mantissa } else { mantissa }, exponent))
}
