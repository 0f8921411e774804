use chrono::{NaiveDate, NaiveDateTime};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Product ───────────────────────────────────────────────────────────────────

/// Normalized product projection of one raw record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Product {
    pub product_code: String,
    pub product_id: Option<String>, // site-internal, informational only
    pub product_name: Option<String>,
    pub issuer: Option<String>,
    pub issuer_code: Option<String>,
    pub risk_level: Option<String>,
    pub risk_level_code: Option<String>,
    pub product_type: Option<String>,
    pub product_type_code: Option<String>,
    pub currency: Option<String>,
    pub investment_period: Option<String>,
    pub min_investment: Option<String>,
    pub sale_status: Option<String>,
    pub sale_regions: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub product_category: Option<String>,
    pub income_type: Option<String>,
    pub sale_method: Option<String>,
    pub crawl_time: NaiveDateTime,
}

/// A product row as stored, with audit columns.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredProduct {
    pub product_code: String,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub issuer: Option<String>,
    pub issuer_code: Option<String>,
    pub risk_level: Option<String>,
    pub risk_level_code: Option<String>,
    pub product_type: Option<String>,
    pub product_type_code: Option<String>,
    pub currency: Option<String>,
    pub investment_period: Option<String>,
    pub min_investment: Option<String>,
    pub sale_status: Option<String>,
    pub sale_regions: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub product_category: Option<String>,
    pub income_type: Option<String>,
    pub sale_method: Option<String>,
    pub crawl_time: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

// ── NAV ───────────────────────────────────────────────────────────────────────

/// The three NAV values. `None` means absent; zero is never stored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct NavValues {
    pub initial_nav: Option<f64>,
    pub accumulated_nav: Option<f64>,
    pub current_nav: Option<f64>,
}

impl NavValues {
    /// Drop anything that is not a finite, strictly positive value.
    pub fn sanitized(&self) -> NavValues {
        let keep = |v: Option<f64>| v.filter(|v| v.is_finite() && *v > 0.0);
        NavValues {
            initial_nav: keep(self.initial_nav),
            accumulated_nav: keep(self.accumulated_nav),
            current_nav: keep(self.current_nav),
        }
    }

    pub fn has_any(&self) -> bool {
        self.initial_nav.is_some() || self.accumulated_nav.is_some() || self.current_nav.is_some()
    }

    /// Overlay the present values of `incoming` onto `self`, field by field.
    /// Stored values never regress to `None`. Returns whether anything changed.
    pub fn absorb(&mut self, incoming: &NavValues) -> bool {
        let mut changed = false;
        for (stored, new) in [
            (&mut self.initial_nav, incoming.initial_nav),
            (&mut self.accumulated_nav, incoming.accumulated_nav),
            (&mut self.current_nav, incoming.current_nav),
        ] {
            if let Some(v) = new {
                if *stored != Some(v) {
                    *stored = Some(v);
                    changed = true;
                }
            }
        }
        changed
    }
}

/// Freshly normalized NAV observation. `nav_date` stays textual until
/// persistence, which skips rows whose date does not parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NavRecord {
    pub product_code: String,
    pub product_id: Option<String>,
    pub nav_date: String,
    pub values: NavValues,
    pub crawl_time: NaiveDateTime,
}

/// A NAV row as stored.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoredNav {
    pub product_code: String,
    pub product_id: Option<String>,
    pub nav_date: NaiveDate,
    pub initial_nav: Option<f64>,
    pub accumulated_nav: Option<f64>,
    pub current_nav: Option<f64>,
    pub is_updated: bool,
    pub last_update_date: Option<NaiveDate>,
    pub crawl_time: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

// ── Export projections ────────────────────────────────────────────────────────

/// NAV row left-joined to its product name.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NavExportRow {
    pub product_code: String,
    pub product_id: Option<String>,
    pub product_name: Option<String>,
    pub nav_date: NaiveDate,
    pub initial_nav: Option<f64>,
    pub accumulated_nav: Option<f64>,
    pub current_nav: Option<f64>,
    pub is_updated: bool,
    pub last_update_date: Option<NaiveDate>,
    pub crawl_time: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Product left-joined to its NAV history (one row per product without NAVs).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CombinedRow {
    pub product_id: Option<String>,
    pub product_code: String,
    pub product_name: Option<String>,
    pub issuer: Option<String>,
    pub risk_level: Option<String>,
    pub product_type: Option<String>,
    pub currency: Option<String>,
    pub investment_period: Option<String>,
    pub min_investment: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub product_category: Option<String>,
    pub income_type: Option<String>,
    pub nav_date: Option<NaiveDate>,
    pub initial_nav: Option<f64>,
    pub accumulated_nav: Option<f64>,
    pub current_nav: Option<f64>,
}

// ── Harvest run log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct HarvestRun {
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub pages_attempted: i64,
    pub pages_failed: i64,
    pub products_saved: i64,
    pub navs_saved: i64,
    pub error_msg: Option<String>,
}

// ── Raw API types ─────────────────────────────────────────────────────────────

/// Search endpoint envelope: `{code, List, Count}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default, deserialize_with = "lenient_string")]
    pub code: Option<String>,
    #[serde(rename = "List", default)]
    pub list: Option<Vec<Value>>,
    #[serde(rename = "Count", default, deserialize_with = "lenient_u64")]
    pub count: Option<u64>,
}

/// One raw product record. Field names are the site's pinyin abbreviations;
/// values arrive as strings or numbers depending on the product category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProduct {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(rename = "cpdjbm", default, deserialize_with = "lenient_string")]
    pub product_code: Option<String>,
    /// Structured caption; the display name is the third element.
    #[serde(rename = "copy", default)]
    pub caption: Option<Value>,
    #[serde(rename = "cpms", default, deserialize_with = "lenient_string")]
    pub plain_name: Option<String>,
    #[serde(rename = "fxjgms", default, deserialize_with = "lenient_string")]
    pub issuer: Option<String>,
    #[serde(rename = "fxjgdm", default, deserialize_with = "lenient_string")]
    pub issuer_code: Option<String>,
    #[serde(rename = "fxdjms", default, deserialize_with = "lenient_string")]
    pub risk_level: Option<String>,
    #[serde(rename = "cpfxdj", default, deserialize_with = "lenient_string")]
    pub risk_level_code: Option<String>,
    #[serde(rename = "cptzxzms", default, deserialize_with = "lenient_string")]
    pub product_type: Option<String>,
    #[serde(rename = "cptzxz", default, deserialize_with = "lenient_string")]
    pub product_type_code: Option<String>,
    #[serde(rename = "mjbz", default, deserialize_with = "lenient_string")]
    pub currency: Option<String>,
    #[serde(rename = "qxms", default, deserialize_with = "lenient_string")]
    pub investment_period: Option<String>,
    #[serde(rename = "qdxsjef", default, deserialize_with = "lenient_string")]
    pub min_investment: Option<String>,
    #[serde(rename = "syztdm", default, deserialize_with = "lenient_string")]
    pub sale_status: Option<String>,
    #[serde(rename = "cpxsqy", default, deserialize_with = "lenient_string")]
    pub sale_regions: Option<String>,
    #[serde(rename = "cpqsrq", default, deserialize_with = "lenient_string")]
    pub start_date: Option<String>,
    #[serde(rename = "cpyjzzrq", default, deserialize_with = "lenient_string")]
    pub end_date: Option<String>,
    #[serde(rename = "cplx", default, deserialize_with = "lenient_string")]
    pub product_category: Option<String>,
    #[serde(rename = "cpsylx", default, deserialize_with = "lenient_string")]
    pub income_type: Option<String>,
    #[serde(rename = "sfxcp", default, deserialize_with = "lenient_string")]
    pub sale_method: Option<String>,
    #[serde(rename = "csjz", default, deserialize_with = "lenient_string")]
    pub initial_nav: Option<String>,
    #[serde(rename = "ljjz", default, deserialize_with = "lenient_string")]
    pub accumulated_nav: Option<String>,
    #[serde(rename = "cpjz", default, deserialize_with = "lenient_string")]
    pub current_nav: Option<String>,
}

// ── Lenient scalar decoding ───────────────────────────────────────────────────

/// Accept a string, number or bool as text; null/missing become `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected a scalar, got {other}"))),
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("count is not a non-negative integer: {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("count is not an integer: {s:?}"))),
        Some(other) => Err(de::Error::custom(format!("unexpected count {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absorb_flags_changes_and_never_regresses() {
        let mut stored = NavValues {
            initial_nav: Some(1.0),
            accumulated_nav: None,
            current_nav: Some(1.05),
        };
        let incoming = NavValues {
            initial_nav: None,
            accumulated_nav: None,
            current_nav: Some(1.10),
        };
        assert!(stored.absorb(&incoming));
        assert_eq!(stored.initial_nav, Some(1.0));
        assert_eq!(stored.current_nav, Some(1.10));

        // Same values again: nothing to flag
        assert!(!stored.absorb(&incoming));
    }

    #[test]
    fn test_sanitized_keeps_only_positive_finite_values() {
        let raw = NavValues {
            initial_nav: Some(0.0),
            accumulated_nav: Some(f64::INFINITY),
            current_nav: Some(-0.5),
        };
        assert!(!raw.sanitized().has_any());

        let raw = NavValues {
            initial_nav: Some(1.0),
            accumulated_nav: Some(f64::NAN),
            current_nav: Some(1.0234),
        };
        assert_eq!(
            raw.sanitized(),
            NavValues {
                initial_nav: Some(1.0),
                accumulated_nav: None,
                current_nav: Some(1.0234),
            }
        );
    }

    #[test]
    fn test_raw_product_accepts_numbers_and_strings() {
        let raw: RawProduct = serde_json::from_value(json!({
            "id": 12345,
            "cpdjbm": "Z7001021000001",
            "csjz": 1.0,
            "ljjz": "--",
            "cpjz": null,
        }))
        .unwrap();
        assert_eq!(raw.id.as_deref(), Some("12345"));
        assert_eq!(raw.product_code.as_deref(), Some("Z7001021000001"));
        assert_eq!(raw.initial_nav.as_deref(), Some("1.0"));
        assert_eq!(raw.accumulated_nav.as_deref(), Some("--"));
        assert_eq!(raw.current_nav, None);
    }

    #[test]
    fn test_envelope_count_as_string() {
        let env: ApiEnvelope =
            serde_json::from_str(r#"{"code":"success","List":[],"Count":"250"}"#).unwrap();
        assert_eq!(env.count, Some(250));
        assert_eq!(env.list.map(|l| l.len()), Some(0));
    }
}
