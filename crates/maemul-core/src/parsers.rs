//! Value parsers for free-text legacy fields.
//!
//! All functions here are pure: the same input always yields the same output,
//! and a value that cannot be parsed comes back as `None` rather than an error.
//! Callers decide whether a `None` deserves a note.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// 억 = 100,000,000 won.
pub const EOK: f64 = 100_000_000.0;
/// 만 = 10,000 won.
pub const MAN: f64 = 10_000.0;

/// Parenthetical display hints such as `(미정)` or `(26억가능)`, ASCII or full-width.
static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\(（][^\)）]*[\)）]").unwrap());

/// `<eok>억 <man>` after whitespace and thousands separators are removed.
/// The trailing amount is in 만 unless it carries 천/천만 (thousands of 만).
static CURRENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?P<eok>\d+(?:\.\d+)?)억)?(?:(?P<man>\d+(?:\.\d+)?)(?P<unit>천만?|만)?)?원?$")
        .unwrap()
});

/// Supply/private area pair parsed from a combined string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DualArea {
    pub supply: Option<f64>,
    pub private: Option<f64>,
}

/// Parse Korean currency shorthand into won.
///
/// Parenthetical annotations are ignored, so `"28억 (26억가능)"` is 28억.
///
/// ```
/// use maemul_core::parsers::parse_korean_currency;
///
/// assert_eq!(parse_korean_currency("60억 (미정)"), Some(6_000_000_000.0));
/// assert_eq!(parse_korean_currency("3억 5,000"), Some(350_000_000.0));
/// assert_eq!(parse_korean_currency("모름"), None);
/// ```
pub fn parse_korean_currency(text: &str) -> Option<f64> {
    let stripped = ANNOTATION.replace_all(text, "");
    let compact: String = stripped
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if compact.is_empty() {
        return None;
    }

    let caps = CURRENCY.captures(&compact)?;
    let eok = caps.name("eok").map(|m| m.as_str());
    let man = caps.name("man").map(|m| m.as_str());
    if eok.is_none() && man.is_none() {
        return None;
    }

    let eok = eok.map_or(Ok(0.0), |s| s.parse::<f64>()).ok()?;
    let mut man = man.map_or(Ok(0.0), |s| s.parse::<f64>()).ok()?;
    if caps.name("unit").is_some_and(|u| u.as_str().starts_with('천')) {
        man *= 1000.0;
    }

    non_negative_finite((eok * EOK + man * MAN).round())
}

/// The first parenthetical annotation in a currency string, without brackets.
///
/// ```
/// use maemul_core::parsers::currency_annotation;
///
/// assert_eq!(currency_annotation("28억 (26억가능)").as_deref(), Some("26억가능"));
/// assert_eq!(currency_annotation("28억"), None);
/// ```
pub fn currency_annotation(text: &str) -> Option<String> {
    let found = ANNOTATION.find(text)?.as_str();
    let inner = found
        .trim_start_matches(['(', '（'])
        .trim_end_matches([')', '）'])
        .trim();
    (!inner.is_empty()).then(|| inner.to_string())
}

/// Parse `"<num><unit>? / <num><unit>?"` into a supply/private pair.
///
/// A missing side is `None`. Returns `None` overall when a present side is not
/// a number, so the caller can null both fields and keep the raw text.
///
/// ```
/// use maemul_core::parsers::{parse_dual_area_value, DualArea};
///
/// assert_eq!(
///     parse_dual_area_value("184.03㎡ / 171.7㎡", "㎡"),
///     Some(DualArea { supply: Some(184.03), private: Some(171.7) })
/// );
/// ```
pub fn parse_dual_area_value(text: &str, unit_suffix: &str) -> Option<DualArea> {
    let mut sides = text.split(['/', '／']);
    let supply = sides.next().unwrap_or("");
    let private = sides.next().unwrap_or("");
    if sides.next().is_some() {
        return None;
    }

    Some(DualArea {
        supply: parse_area_side(supply, unit_suffix)?,
        private: parse_area_side(private, unit_suffix)?,
    })
}

/// `Some(None)` for an empty side, `None` for garbage.
fn parse_area_side(side: &str, unit_suffix: &str) -> Option<Option<f64>> {
    let side = side.trim();
    let side = side.strip_suffix(unit_suffix).unwrap_or(side).trim();
    if side.is_empty() {
        return Some(None);
    }
    parse_plain_number(side).map(Some)
}

/// Parse a single numeric field, tolerating thousands separators and a unit suffix.
pub fn parse_number(text: &str, unit_suffix: &str) -> Option<f64> {
    let text = text.trim();
    let text = text.strip_suffix(unit_suffix).unwrap_or(text).trim();
    parse_plain_number(text)
}

fn parse_plain_number(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().and_then(non_negative_finite)
}

/// Enforce the numeric invariant: finite and non-negative, or nothing.
pub fn non_negative_finite(value: f64) -> Option<f64> {
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Trim; empty becomes `None`.
pub fn normalize_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Floor strings (`"3/15"`, `"B1"`, `"고층"`) are kept verbatim.
pub fn parse_floor_info(text: &str) -> Option<String> {
    normalize_text(text)
}

/// Room/bathroom strings (`"3/2"`) are kept verbatim.
pub fn parse_rooms_bathrooms(text: &str) -> Option<String> {
    normalize_text(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_with_annotations() {
        assert_eq!(parse_korean_currency("60억 (미정)"), Some(6_000_000_000.0));
        assert_eq!(parse_korean_currency("28억 (26억가능)"), Some(2_800_000_000.0));
        assert_eq!(parse_korean_currency("15억（협의）"), Some(1_500_000_000.0));
    }

    #[test]
    fn test_currency_empty_and_garbage() {
        assert_eq!(parse_korean_currency(""), None);
        assert_eq!(parse_korean_currency("   "), None);
        assert_eq!(parse_korean_currency("모름"), None);
        assert_eq!(parse_korean_currency("(미정)"), None);
        assert_eq!(parse_korean_currency("억"), None);
        assert_eq!(parse_korean_currency("-5000"), None);
    }

    #[test]
    fn test_currency_eok_and_man() {
        assert_eq!(parse_korean_currency("28억 5000"), Some(2_850_000_000.0));
        assert_eq!(parse_korean_currency("28억5,000"), Some(2_850_000_000.0));
        assert_eq!(parse_korean_currency("3억 2천"), Some(320_000_000.0));
        assert_eq!(parse_korean_currency("5천만원"), Some(50_000_000.0));
        assert_eq!(parse_korean_currency("1.5억"), Some(150_000_000.0));
    }

    #[test]
    fn test_currency_bare_number_is_man() {
        assert_eq!(parse_korean_currency("5000"), Some(50_000_000.0));
        assert_eq!(parse_korean_currency("300만"), Some(3_000_000.0));
        assert_eq!(parse_korean_currency("0"), Some(0.0));
    }

    #[test]
    fn test_currency_is_deterministic() {
        for input in ["60억 (미정)", "28억 5000", "모름", "", "1.5억"] {
            assert_eq!(parse_korean_currency(input), parse_korean_currency(input));
        }
    }

    #[test]
    fn test_annotation() {
        assert_eq!(currency_annotation("60억 (미정)").as_deref(), Some("미정"));
        assert_eq!(currency_annotation("60억 ( )"), None);
    }

    #[test]
    fn test_dual_area_both_sides() {
        assert_eq!(
            parse_dual_area_value("184.03㎡ / 171.7㎡", "㎡"),
            Some(DualArea {
                supply: Some(184.03),
                private: Some(171.7)
            })
        );
        assert_eq!(
            parse_dual_area_value("55.6평/51.9평", "평"),
            Some(DualArea {
                supply: Some(55.6),
                private: Some(51.9)
            })
        );
    }

    #[test]
    fn test_dual_area_single_side() {
        assert_eq!(
            parse_dual_area_value("184.03㎡ / ", "㎡"),
            Some(DualArea {
                supply: Some(184.03),
                private: None
            })
        );
        assert_eq!(
            parse_dual_area_value(" / 84", "㎡"),
            Some(DualArea {
                supply: None,
                private: Some(84.0)
            })
        );
        assert_eq!(
            parse_dual_area_value("99㎡", "㎡"),
            Some(DualArea {
                supply: Some(99.0),
                private: None
            })
        );
    }

    #[test]
    fn test_dual_area_unparseable() {
        assert_eq!(parse_dual_area_value("넓음 / 171.7㎡", "㎡"), None);
        assert_eq!(parse_dual_area_value("1/2/3", "㎡"), None);
        assert_eq!(parse_dual_area_value("", "㎡"), Some(DualArea::default()));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("1,234.5㎡", "㎡"), Some(1234.5));
        assert_eq!(parse_number("12", "평"), Some(12.0));
        assert_eq!(parse_number("NaN", ""), None);
        assert_eq!(parse_number("inf", ""), None);
        assert_eq!(parse_number("abc", ""), None);
    }

    #[test]
    fn test_pass_through_normalizers() {
        assert_eq!(parse_floor_info("  3/15 "), Some("3/15".to_string()));
        assert_eq!(parse_rooms_bathrooms("3/2"), Some("3/2".to_string()));
        assert_eq!(normalize_text("   "), None);
    }
}
