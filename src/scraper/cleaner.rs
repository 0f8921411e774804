
use crate::error::NormalizeError;
use crate::models::{NavRecord, NavValues, Product, RawProduct};
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;

/// Strings the feed uses for "no value".
const NO_DATA: &[&str] = &["--", "-", "null", "NULL", "N/A"];

// ── Parsers ───────────────────────────────────────────────────────────────────

/// Parse a NAV cell. Sentinels, garbage, zero and negatives are all absent.
/// "1.0000" → Some(1.0) | "--" → None | "0" → None
pub fn clean_nav_value(s: Option<&str>) -> Option<f64> {
    let s = s?.trim();
    if s.is_empty() || NO_DATA.contains(&s) {
        return None;
    }
    let v: f64 = s.parse().ok()?;
    (v.is_finite() && v > 0.0).then_some(v)
}

/// Trim, mapping blanks to `None`.
fn text(s: Option<String>) -> Option<String> {
    s.and_then(|s| {
        let s = s.trim();
        if s.is_empty() { None } else { Some(s.to_string()) }
    })
}

/// The display name is the third caption element when the caption is an array
/// of at least three entries; otherwise the plain name field.
pub fn resolve_product_name(caption: Option<&Value>, plain_name: Option<&str>) -> Option<String> {
    let from_caption = caption
        .and_then(Value::as_array)
        .filter(|parts| parts.len() >= 3)
        .and_then(|parts| parts[2].as_str())
        .map(str::to_string);

    text(from_caption).or_else(|| text(plain_name.map(str::to_string)))
}

// ── Raw record → Product + NavRecord ──────────────────────────────────────────

/// Normalize one raw record. The NAV observation is dated on `now`'s day; the
/// feed carries no per-record valuation date.
pub fn normalize(
    record: &Value,
    now: NaiveDateTime,
) -> Result<(Product, Option<NavRecord>), NormalizeError> {
    let raw = RawProduct::deserialize(record)?;

    let product_code = text(raw.product_code).ok_or(NormalizeError::MissingProductCode)?;
    let product_id = text(raw.id);

    let values = NavValues {
        initial_nav: clean_nav_value(raw.initial_nav.as_deref()),
        accumulated_nav: clean_nav_value(raw.accumulated_nav.as_deref()),
        current_nav: clean_nav_value(raw.current_nav.as_deref()),
    };

    let nav = values.has_any().then(|| NavRecord {
        product_code: product_code.clone(),
        product_id: product_id.clone(),
        nav_date: now.date().format("%Y-%m-%d").to_string(),
        values,
        crawl_time: now,
    });

    let product = Product {
        product_name: resolve_product_name(raw.caption.as_ref(), raw.plain_name.as_deref()),
        product_code,
        product_id,
        issuer: text(raw.issuer),
        issuer_code: text(raw.issuer_code),
        risk_level: text(raw.risk_level),
        risk_level_code: text(raw.risk_level_code),
        product_type: text(raw.product_type),
        product_type_code: text(raw.product_type_code),
        currency: text(raw.currency),
        investment_period: text(raw.investment_period),
        min_investment: text(raw.min_investment),
        sale_status: text(raw.sale_status),
        sale_regions: text(raw.sale_regions),
        start_date: text(raw.start_date),
        end_date: text(raw.end_date),
        product_category: text(raw.product_category),
        income_type: text(raw.income_type),
        sale_method: text(raw.sale_method),
        crawl_time: now,
    };

    Ok((product, nav))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
