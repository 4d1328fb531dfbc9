//! Per-source payload parsing: one closed shape variant per documented
//! payload layout, plus a best-effort fallback.

use chrono::{DateTime, SecondsFormat, Utc};
use cmw_core::{RecordSet, Scalar};
use scraper::{Html, Selector};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "cmw-parsers";

/// Closed set of payload shapes. Adding a source means adding (or reusing) a
/// variant here and a line in [`shape_for_source`], not growing a conditional
/// chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceShape {
    /// Single nested object at `RAW.BTC.USD`; one row per fetch, append-only.
    FlatSnapshot,
    /// `{"Data":{"Data":[...]}}` (or `{"Data":[...]}`) time series keyed by
    /// `time`. OHLC series additionally fold `volumeto` into `volume`.
    TimeSeries { rename_volume: bool },
    /// Parent rows each carrying a `balance_distribution` child list, exploded
    /// into one row per (parent time, bucket) with a synthesized merge key.
    NestedExplosion,
    /// Named signal metrics, each a dict; flattened to one row of
    /// `<metric>_<subfield>` columns.
    MetricDictionary,
    /// Plain `Data` list whose items may carry an `id`.
    ListWithId,
    /// Unknown source: best-effort unwrap of the common envelopes.
    Fallback,
}

/// Shape registry. Unknown keys parse through [`SourceShape::Fallback`].
pub fn shape_for_source(source_key: &str) -> SourceShape {
    match source_key {
        "pricemultifull" => SourceShape::FlatSnapshot,
        "histoday" | "histohour" => SourceShape::TimeSeries { rename_volume: true },
        "hourly_social_data" => SourceShape::TimeSeries { rename_volume: false },
        "blockchain_balancedistribution" => SourceShape::NestedExplosion,
        // upstream config historically carried the misspelled key too
        "tradingsignals" | "tadingsignals" => SourceShape::MetricDictionary,
        "news" => SourceShape::ListWithId,
        "bitcoin_dashboard" => SourceShape::Fallback,
        _ => SourceShape::Fallback,
    }
}

/// Parser output: the normalized rows plus the canonical column (if any) that
/// identifies a row for upsert matching.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch {
    pub records: RecordSet,
    pub unique_key: Option<String>,
}

// field is named source_key, not source: thiserror treats a `source` field
// as the error's cause and a plain String is not one
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("source {source_key}: payload missing expected structure ({expected})")]
    UnexpectedShape {
        source_key: String,
        expected: &'static str,
    },
    #[error("source {source_key}: payload produced no rows")]
    Empty { source_key: String },
}

/// Map a raw fetched payload to a record set. Pure: the only ambient input is
/// `fetched_at`, threaded in so snapshot rows are reproducible under test.
pub fn parse_payload(
    shape: SourceShape,
    source_key: &str,
    payload: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedBatch, ParseError> {
    let batch = match shape {
        SourceShape::FlatSnapshot => parse_flat_snapshot(source_key, payload)?,
        SourceShape::TimeSeries { rename_volume } => {
            parse_time_series(source_key, payload, rename_volume)?
        }
        SourceShape::NestedExplosion => parse_nested_explosion(source_key, payload)?,
        SourceShape::MetricDictionary => {
            parse_metric_dictionary(source_key, payload, fetched_at)?
        }
        SourceShape::ListWithId => parse_list_with_id(source_key, payload)?,
        SourceShape::Fallback => parse_fallback(source_key, payload)?,
    };
    if batch.records.is_empty() {
        return Err(ParseError::Empty {
            source_key: source_key.to_string(),
        });
    }
    Ok(batch)
}

fn unexpected(source: &str, expected: &'static str) -> ParseError {
    ParseError::UnexpectedShape {
        source_key: source.to_string(),
        expected,
    }
}

/// Unwrap the envelopes the upstream API uses around row lists:
/// `{"Data":[...]}` or `{"Data":{"Data":[...]}}`.
fn envelope_rows(payload: &JsonValue) -> Option<&Vec<JsonValue>> {
    match payload.get("Data") {
        Some(JsonValue::Array(rows)) => Some(rows),
        Some(JsonValue::Object(inner)) => match inner.get("Data") {
            Some(JsonValue::Array(rows)) => Some(rows),
            _ => None,
        },
        _ => None,
    }
}

fn objects_of(rows: &[JsonValue]) -> Vec<&JsonMap<String, JsonValue>> {
    rows.iter().filter_map(|v| v.as_object()).collect()
}

fn parse_flat_snapshot(source: &str, payload: &JsonValue) -> Result<ParsedBatch, ParseError> {
    let raw = payload
        .pointer("/RAW/BTC/USD")
        .and_then(|v| v.as_object())
        .ok_or_else(|| unexpected(source, "RAW.BTC.USD object"))?;
    Ok(ParsedBatch {
        records: RecordSet::from_objects([raw]),
        unique_key: None,
    })
}

fn parse_time_series(
    source: &str,
    payload: &JsonValue,
    rename_volume: bool,
) -> Result<ParsedBatch, ParseError> {
    let rows = envelope_rows(payload).ok_or_else(|| unexpected(source, "Data / Data.Data list"))?;
    let mut records = RecordSet::from_objects(objects_of(rows));

    if rename_volume {
        if records.has_column("volumeto") {
            // a pre-existing "volume" column is superseded by volumeto
            records.drop_columns(&["volume"]);
            records
                .copy_column("volumeto", "volume")
                .map_err(|_| unexpected(source, "volume rename"))?;
        }
        records.drop_columns(&["volumeto", "volumefrom", "conversionType", "conversionSymbol"]);
    }

    let unique_key = records.has_column("time").then(|| "TIME".to_string());
    Ok(ParsedBatch {
        records,
        unique_key,
    })
}

/// Merge-key separator for exploded balance-distribution rows. The joined
/// fields (`time`, `from`, `to`) are numeric bucket bounds, so the separator
/// cannot occur inside a value; with free-form fields this concatenation
/// could collide.
const MERGE_KEY_SEPARATOR: &str = "_";

fn parse_nested_explosion(source: &str, payload: &JsonValue) -> Result<ParsedBatch, ParseError> {
    let parents = envelope_rows(payload).ok_or_else(|| unexpected(source, "Data.Data list"))?;
    let parent_objects = objects_of(parents);

    let has_buckets = parent_objects
        .first()
        .map(|p| p.contains_key("balance_distribution"))
        .unwrap_or(false);
    if !has_buckets {
        // no child list: treat the parents themselves as rows, no identity
        return Ok(ParsedBatch {
            records: RecordSet::from_objects(parent_objects),
            unique_key: None,
        });
    }

    let meta_fields = ["id", "symbol", "partner_symbol", "time"];
    let key_fields = ["time", "from", "to"];
    let mut exploded: Vec<JsonMap<String, JsonValue>> = Vec::new();
    for parent in &parent_objects {
        let Some(buckets) = parent
            .get("balance_distribution")
            .and_then(|v| v.as_array())
        else {
            continue;
        };
        for bucket in buckets.iter().filter_map(|v| v.as_object()) {
            let mut row = bucket.clone();
            for field in meta_fields {
                if let Some(value) = parent.get(field) {
                    row.insert(field.to_string(), value.clone());
                }
            }
            exploded.push(row);
        }
    }

    // the concatenation is only an identity when every bound field is there;
    // rows missing a bound would all collapse to the same key
    let keyable = !exploded.is_empty()
        && exploded
            .iter()
            .all(|row| key_fields.iter().all(|f| row.contains_key(*f)));
    if keyable {
        for row in &mut exploded {
            let key_parts: Vec<String> = key_fields
                .iter()
                .map(|f| {
                    row.get(*f)
                        .map(|v| Scalar::from_json(v).to_string())
                        .unwrap_or_default()
                })
                .collect();
            row.insert(
                "merge_key".to_string(),
                JsonValue::String(key_parts.join(MERGE_KEY_SEPARATOR)),
            );
        }
    }

    Ok(ParsedBatch {
        records: RecordSet::from_objects(exploded.iter()),
        unique_key: keyable.then(|| "MERGE_KEY".to_string()),
    })
}

/// Current upstream metric names mapped to the column names the warehouse
/// schema was provisioned with.
fn mapped_metric_name(name: &str) -> &str {
    match name {
        "addressesNetGrowth" => "ltHandsTh",
        "concentrationVar" => "concentration",
        "largetxsVar" => "largeSurplus",
        "inOutVar" => "inOutVar",
        other => other,
    }
}

fn parse_metric_dictionary(
    source: &str,
    payload: &JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedBatch, ParseError> {
    let signals = payload
        .get("Data")
        .and_then(|v| v.as_object())
        .ok_or_else(|| unexpected(source, "Data object of signals"))?;

    let mut flat = JsonMap::new();
    for (signal_name, signal_data) in signals {
        let mapped = mapped_metric_name(signal_name);
        match signal_data {
            JsonValue::Object(fields) => {
                // only sentiment and value are of interest; the other
                // sub-fields (score, class thresholds, ...) are dropped
                for sub in ["sentiment", "value"] {
                    if let Some(v) = fields.get(sub) {
                        flat.insert(format!("{mapped}_{sub}"), v.clone());
                    }
                }
            }
            other => {
                flat.insert(mapped.to_string(), other.clone());
            }
        }
    }
    flat.insert(
        "fetched_at".to_string(),
        JsonValue::String(fetched_at.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );

    Ok(ParsedBatch {
        records: RecordSet::from_objects([&flat]),
        unique_key: None,
    })
}

fn parse_list_with_id(source: &str, payload: &JsonValue) -> Result<ParsedBatch, ParseError> {
    let rows = match payload.get("Data") {
        Some(JsonValue::Array(rows)) => rows,
        _ => return Err(unexpected(source, "Data list")),
    };
    let records = RecordSet::from_objects(objects_of(rows));
    let unique_key = records.has_column("id").then(|| "ID".to_string());
    Ok(ParsedBatch {
        records,
        unique_key,
    })
}

fn parse_fallback(source: &str, payload: &JsonValue) -> Result<ParsedBatch, ParseError> {
    let records = if let Some(rows) = envelope_rows(payload) {
        RecordSet::from_objects(objects_of(rows))
    } else {
        match payload {
            JsonValue::Object(map) if map.contains_key("Data") => match map.get("Data") {
                Some(JsonValue::Object(inner)) => RecordSet::from_objects([inner]),
                _ => return Err(unexpected(source, "usable Data envelope")),
            },
            JsonValue::Object(map) => RecordSet::from_objects([map]),
            JsonValue::Array(rows) => RecordSet::from_objects(objects_of(rows)),
            _ => return Err(unexpected(source, "object or list payload")),
        }
    };
    Ok(ParsedBatch {
        records,
        unique_key: None,
    })
}

// --- dashboard HTML extraction -------------------------------------------

/// How one dashboard metric is located in the scraped page.
#[derive(Debug, Clone, Copy)]
pub enum Extract {
    /// Plain CSS selector; first match wins.
    Css(&'static str),
    /// Find the `<p>` whose text contains the label, take the next `<p>`.
    /// Stands in for the `p:contains('...') + p` rules of the source page.
    LabelSibling(&'static str),
    /// Same label-then-next rule, but searched within a scoping selector
    /// instead of every `<p>` on the page.
    ScopedLabelSibling(&'static str, &'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct DashboardRule {
    pub metric: &'static str,
    pub extract: Extract,
}

/// Selector table for the Bitcoin dashboard page. Metric names become the
/// snapshot's column names after canonicalization.
pub const DASHBOARD_RULES: &[DashboardRule] = &[
    DashboardRule { metric: "Bitcoin Dominance", extract: Extract::Css("#btc_dominance") },
    DashboardRule { metric: "Market Cap", extract: Extract::LabelSibling("Market Cap") },
    DashboardRule { metric: "Sats per Dollar", extract: Extract::LabelSibling("Sats per Dollar") },
    DashboardRule { metric: "Block Height", extract: Extract::Css(".block-height") },
    DashboardRule { metric: "Revenue (BTC) (24hrs)", extract: Extract::Css("#dailyRevenueBtc") },
    DashboardRule { metric: "Revenue (USD) (24hrs)", extract: Extract::Css("#dailyRevenueUsd") },
    DashboardRule { metric: "Circulating Supply", extract: Extract::Css("#supply") },
    DashboardRule { metric: "Percentage Issued", extract: Extract::Css("#percentIssued") },
    DashboardRule { metric: "Issuance Remaining", extract: Extract::Css("#IssuanceRemaining") },
    DashboardRule { metric: "Hashrate", extract: Extract::Css("#hashrate") },
    DashboardRule { metric: "Hashprice", extract: Extract::Css("#HashPrice") },
    DashboardRule { metric: "Public Company Holdings", extract: Extract::Css(".dashboard-primary-text") },
    DashboardRule { metric: "Private Company Holdings", extract: Extract::Css(".dashboard-primary-text") },
    DashboardRule { metric: "BTC Held in Treasuries", extract: Extract::Css("#btcGovernments") },
    DashboardRule { metric: "Treasury Value (USD)", extract: Extract::Css("#usdGovernments") },
    DashboardRule { metric: "Number of UTXOs in Profit", extract: Extract::ScopedLabelSibling(".dashboard-subcol p", "Number of UTXOs in Profit") },
    DashboardRule { metric: "Number of UTXOs in Loss", extract: Extract::ScopedLabelSibling(".dashboard-subcol p", "Number of UTXOs in Loss") },
    DashboardRule { metric: "Percent UTXOs in Profit", extract: Extract::ScopedLabelSibling(".dashboard-subcol p", "Percent UTXOs in Profit") },
    DashboardRule { metric: "Transactions Per Second", extract: Extract::Css("#transactions_per_second") },
    DashboardRule { metric: "Transactions Per Block", extract: Extract::Css("#transactions_per_block") },
    DashboardRule { metric: "Transactions Per Day", extract: Extract::Css("#transactions_per_day") },
    DashboardRule { metric: "Transactions Current Month", extract: Extract::ScopedLabelSibling(".dashboard-subcol p", "Current Month") },
    DashboardRule { metric: "Total Transactions All Time", extract: Extract::Css("#total_transactions") },
    DashboardRule { metric: "Open Interest", extract: Extract::Css("#open_interest") },
    DashboardRule { metric: "ATH Price", extract: Extract::Css("#AthPriceMain") },
    DashboardRule { metric: "Price Drawdown Since ATH", extract: Extract::LabelSibling("Price Drawdown Since ATH") },
    DashboardRule { metric: "Days Since ATH", extract: Extract::Css(".drawdown-days-since-ath") },
    DashboardRule { metric: "ATH Date", extract: Extract::Css(".ath-date") },
    DashboardRule { metric: "Daily BTC Trading Vol", extract: Extract::LabelSibling("Daily BTC Trading Vol") },
    DashboardRule { metric: "Binance Trading Dominance", extract: Extract::LabelSibling("Binance Trading Dominance") },
    DashboardRule { metric: "BTC Pairs Trading Dominance", extract: Extract::LabelSibling("BTC Pairs Trading Dominance") },
    DashboardRule { metric: "US Crypto Trading Vol", extract: Extract::LabelSibling("US Crypto Trading Vol") },
    DashboardRule { metric: "Offshore Crypto Trading Vol", extract: Extract::LabelSibling("Offshore Crypto Trading Vol") },
    DashboardRule { metric: "Daily Price Performance", extract: Extract::Css("#daily_price_performance") },
    DashboardRule { metric: "Weekly Price Performance", extract: Extract::Css("#weekly_price_performance") },
    DashboardRule { metric: "Monthly Price Performance", extract: Extract::Css("#monthly_price_performance") },
    DashboardRule { metric: "Quarterly Price Performance", extract: Extract::Css("#quarterly_price_performance") },
    DashboardRule { metric: "Gold Price", extract: Extract::LabelSibling("Gold Price") },
    DashboardRule { metric: "Gold Marketcap", extract: Extract::LabelSibling("Gold Marketcap") },
    DashboardRule { metric: "Bitcoin vs Gold Market Cap", extract: Extract::LabelSibling("Bitcoin vs Gold Market Cap") },
    DashboardRule { metric: "Realized Price", extract: Extract::LabelSibling("Realized Price") },
    DashboardRule { metric: "Realized Marketcap", extract: Extract::LabelSibling("Realized Marketcap") },
    DashboardRule { metric: "STH Realized Price", extract: Extract::LabelSibling("STH Realized Price") },
    DashboardRule { metric: "LTH Realized Price", extract: Extract::LabelSibling("LTH Realized Price") },
    DashboardRule { metric: "New Addresses", extract: Extract::LabelSibling("New Addresses") },
    DashboardRule { metric: "Balance Between 1 sat and .01 BTC", extract: Extract::LabelSibling("1 sat to .01 BTC") },
    DashboardRule { metric: "Balance Between .01 BTC and 1 BTC", extract: Extract::LabelSibling(".01 BTC to 1 BTC") },
    DashboardRule { metric: "Balance Between 1 BTC and 10 BTC", extract: Extract::LabelSibling("1 BTC to 10 BTC") },
    DashboardRule { metric: "Balance Between 10 BTC and 100 BTC", extract: Extract::LabelSibling("10 BTC to 100 BTC") },
    DashboardRule { metric: "Balance Between 100 BTC and 1,000 BTC", extract: Extract::LabelSibling("100 BTC to 1,000 BTC") },
    DashboardRule { metric: "Long Term Holder Supply", extract: Extract::LabelSibling("Long Term Holder Supply") },
    DashboardRule { metric: "Short Term Holder Supply", extract: Extract::LabelSibling("Short Term Holder Supply") },
    DashboardRule { metric: "Percent Supply in Profit", extract: Extract::LabelSibling("Percent Supply in Profit") },
    DashboardRule { metric: "Total Supply in Profit", extract: Extract::LabelSibling("Total Supply in Profit") },
    DashboardRule { metric: "Total Supply in Loss", extract: Extract::LabelSibling("Total Supply in Loss") },
    DashboardRule { metric: "Coin Days Destroyed", extract: Extract::LabelSibling("Coin Days Destroyed") },
    DashboardRule { metric: "MVRV Z-Score", extract: Extract::LabelSibling("MVRV Z-Score") },
    DashboardRule { metric: "NVT Ratio", extract: Extract::LabelSibling("NVT Ratio") },
    DashboardRule { metric: "RHODL Ratio", extract: Extract::LabelSibling("RHODL Ratio") },
    DashboardRule { metric: "Projected Next Halving Date", extract: Extract::LabelSibling("Projected Date") },
    DashboardRule { metric: "Halving at Block", extract: Extract::LabelSibling("Halving at Block") },
    DashboardRule { metric: "Blocks Remaining", extract: Extract::LabelSibling("Blocks Remaining") },
    DashboardRule { metric: "BTC Until Halving", extract: Extract::LabelSibling("BTC Until Halving") },
    DashboardRule { metric: "IBIT - BlackRock", extract: Extract::LabelSibling("BlackRock") },
    DashboardRule { metric: "FBTC - Fidelity", extract: Extract::LabelSibling("Fidelity") },
    DashboardRule { metric: "GBTC - Grayscale", extract: Extract::LabelSibling("Grayscale") },
];

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_label_sibling(document: &Html, scope: &str, label: &str) -> Option<String> {
    let sel = Selector::parse(scope).ok()?;
    let paragraphs: Vec<_> = document.select(&sel).collect();
    let idx = paragraphs
        .iter()
        .position(|p| p.text().collect::<String>().contains(label))?;
    paragraphs
        .get(idx + 1)
        .and_then(|p| text_or_none(p.text().collect::<String>()))
}

/// Extract a flat `{metric: text}` snapshot object from dashboard HTML. The
/// result is just another JSON-shaped payload for [`SourceShape::Fallback`];
/// metrics whose selector finds nothing come out as `null`.
pub fn dashboard_snapshot(
    html: &str,
    rules: &[DashboardRule],
    scraped_at: DateTime<Utc>,
) -> JsonValue {
    let document = Html::parse_document(html);
    let mut out = JsonMap::new();
    out.insert(
        "timestamp".to_string(),
        JsonValue::String(scraped_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    for rule in rules {
        let value = match rule.extract {
            Extract::Css(selector) => select_first_text(&document, selector),
            Extract::LabelSibling(label) => select_label_sibling(&document, "p", label),
            Extract::ScopedLabelSibling(scope, label) => {
                select_label_sibling(&document, scope, label)
            }
        };
        out.insert(
            rule.metric.to_string(),
            value.map(JsonValue::String).unwrap_or(JsonValue::Null),
        );
    }
    JsonValue::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashSet;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn known_sources_resolve_to_their_shape() {
        assert_eq!(shape_for_source("pricemultifull"), SourceShape::FlatSnapshot);
        assert_eq!(
            shape_for_source("histohour"),
            SourceShape::TimeSeries { rename_volume: true }
        );
        assert_eq!(
            shape_for_source("hourly_social_data"),
            SourceShape::TimeSeries { rename_volume: false }
        );
        assert_eq!(
            shape_for_source("blockchain_balancedistribution"),
            SourceShape::NestedExplosion
        );
        assert_eq!(shape_for_source("news"), SourceShape::ListWithId);
        assert_eq!(shape_for_source("something_new"), SourceShape::Fallback);
    }

    #[test]
    fn flat_snapshot_wraps_the_nested_object_as_one_row() {
        let payload = json!({"RAW": {"BTC": {"USD": {"PRICE": 97000.5, "MKTCAP": 1.9e12}}}});
        let batch =
            parse_payload(SourceShape::FlatSnapshot, "pricemultifull", &payload, t0()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records.get(0, "PRICE"), Some(&Scalar::Float(97000.5)));
        assert_eq!(batch.unique_key, None);
    }

    #[test]
    fn flat_snapshot_rejects_missing_path() {
        let payload = json!({"RAW": {"ETH": {}}});
        let err =
            parse_payload(SourceShape::FlatSnapshot, "pricemultifull", &payload, t0()).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedShape { .. }));
    }

    #[test]
    fn time_series_renames_volume_and_drops_conversion_columns() {
        let payload = json!({"Data": {"Data": [
            {"time": 1000, "volumeto": 5.0, "volumefrom": 3.0}
        ]}});
        let batch = parse_payload(
            SourceShape::TimeSeries { rename_volume: true },
            "histoday",
            &payload,
            t0(),
        )
        .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records.get(0, "TIME"), Some(&Scalar::Int(1000)));
        assert_eq!(batch.records.get(0, "VOLUME"), Some(&Scalar::Float(5.0)));
        assert!(!batch.records.has_column("VOLUMETO"));
        assert!(!batch.records.has_column("VOLUMEFROM"));
        assert_eq!(batch.unique_key.as_deref(), Some("TIME"));
    }

    #[test]
    fn time_series_volumeto_supersedes_an_existing_volume_column() {
        let payload = json!({"Data": {"Data": [
            {"time": 1000, "volume": 1.0, "volumeto": 5.0}
        ]}});
        let batch = parse_payload(
            SourceShape::TimeSeries { rename_volume: true },
            "histoday",
            &payload,
            t0(),
        )
        .unwrap();
        assert_eq!(batch.records.get(0, "VOLUME"), Some(&Scalar::Float(5.0)));
        assert!(!batch.records.has_column("VOLUMETO"));
    }

    #[test]
    fn time_series_accepts_single_data_envelope_and_skips_rename_when_disabled() {
        let payload = json!({"Data": [
            {"time": 1, "comments": 10, "posts": 4},
            {"time": 2, "comments": 12, "posts": 5}
        ]});
        let batch = parse_payload(
            SourceShape::TimeSeries { rename_volume: false },
            "hourly_social_data",
            &payload,
            t0(),
        )
        .unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.unique_key.as_deref(), Some("TIME"));
    }

    #[test]
    fn time_series_without_time_column_has_no_unique_key() {
        let payload = json!({"Data": [{"close": 1.0}]});
        let batch = parse_payload(
            SourceShape::TimeSeries { rename_volume: true },
            "histoday",
            &payload,
            t0(),
        )
        .unwrap();
        assert_eq!(batch.unique_key, None);
    }

    fn balance_payload() -> JsonValue {
        json!({"Data": {"Data": [
            {
                "id": 1182, "symbol": "BTC", "partner_symbol": "BTC", "time": 1000,
                "balance_distribution": [
                    {"from": 0.0, "to": 0.01, "totalVolume": 10.0, "addressesCount": 100},
                    {"from": 0.01, "to": 1.0, "totalVolume": 20.0, "addressesCount": 50}
                ]
            },
            {
                "id": 1182, "symbol": "BTC", "partner_symbol": "BTC", "time": 2000,
                "balance_distribution": [
                    {"from": 0.0, "to": 0.01, "totalVolume": 11.0, "addressesCount": 101}
                ]
            }
        ]}})
    }

    #[test]
    fn explosion_carries_parent_fields_into_every_row() {
        let batch = parse_payload(
            SourceShape::NestedExplosion,
            "blockchain_balancedistribution",
            &balance_payload(),
            t0(),
        )
        .unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.unique_key.as_deref(), Some("MERGE_KEY"));
        for row in 0..batch.records.len() {
            assert_eq!(
                batch.records.get(row, "SYMBOL"),
                Some(&Scalar::Text("BTC".into()))
            );
        }
        assert_eq!(batch.records.get(0, "TIME"), Some(&Scalar::Int(1000)));
        assert_eq!(batch.records.get(2, "TIME"), Some(&Scalar::Int(2000)));
    }

    #[test]
    fn explosion_merge_keys_are_unique_for_distinct_input() {
        let batch = parse_payload(
            SourceShape::NestedExplosion,
            "blockchain_balancedistribution",
            &balance_payload(),
            t0(),
        )
        .unwrap();
        let keys: HashSet<String> = (0..batch.records.len())
            .map(|row| batch.records.get(row, "MERGE_KEY").unwrap().to_string())
            .collect();
        assert_eq!(keys.len(), batch.records.len());
        assert!(keys.contains("1000_0_0.01"));
    }

    #[test]
    fn explosion_without_bucket_bounds_falls_back_to_append() {
        // buckets lacking from/to would all concatenate to the same key, so
        // no key may be designated
        let payload = json!({"Data": {"Data": [
            {
                "id": 1182, "symbol": "BTC", "time": 1000,
                "balance_distribution": [
                    {"totalVolume": 10.0, "addressesCount": 100},
                    {"totalVolume": 20.0, "addressesCount": 50}
                ]
            }
        ]}});
        let batch = parse_payload(
            SourceShape::NestedExplosion,
            "blockchain_balancedistribution",
            &payload,
            t0(),
        )
        .unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.unique_key, None);
        assert!(!batch.records.has_column("MERGE_KEY"));
    }

    #[test]
    fn explosion_without_child_list_degrades_to_plain_rows() {
        let payload = json!({"Data": {"Data": [
            {"id": 1, "time": 1000, "value": 3.5}
        ]}});
        let batch = parse_payload(
            SourceShape::NestedExplosion,
            "blockchain_balancedistribution",
            &payload,
            t0(),
        )
        .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.unique_key, None);
        assert!(!batch.records.has_column("MERGE_KEY"));
    }

    #[test]
    fn metric_dictionary_flattens_and_applies_the_rename_table() {
        let payload = json!({"Data": {
            "addressesNetGrowth": {"sentiment": "bullish", "value": 0.8, "score": 3},
            "concentrationVar": {"sentiment": "neutral", "value": 0.1},
            "inOutVar": {"sentiment": "bearish", "value": -0.4},
            "summary": "mixed"
        }});
        let batch = parse_payload(
            SourceShape::MetricDictionary,
            "tradingsignals",
            &payload,
            t0(),
        )
        .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.records.get(0, "LTHANDSTH_SENTIMENT"),
            Some(&Scalar::Text("bullish".into()))
        );
        assert_eq!(
            batch.records.get(0, "CONCENTRATION_VALUE"),
            Some(&Scalar::Float(0.1))
        );
        assert_eq!(
            batch.records.get(0, "SUMMARY"),
            Some(&Scalar::Text("mixed".into()))
        );
        // score is metadata and is intentionally dropped
        assert!(!batch.records.has_column("LTHANDSTH_SCORE"));
        assert!(batch.records.has_column("FETCHED_AT"));
        assert_eq!(batch.unique_key, None);
    }

    #[test]
    fn list_with_id_designates_id_as_unique_key() {
        let payload = json!({"Data": [
            {"id": "n1", "title": "Halving"},
            {"id": "n2", "title": "ETF flows"}
        ]});
        let batch = parse_payload(SourceShape::ListWithId, "news", &payload, t0()).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.unique_key.as_deref(), Some("ID"));
    }

    #[test]
    fn list_without_id_field_has_no_unique_key() {
        let payload = json!({"Data": [{"title": "untracked"}]});
        let batch = parse_payload(SourceShape::ListWithId, "news", &payload, t0()).unwrap();
        assert_eq!(batch.unique_key, None);
    }

    #[test]
    fn fallback_unwraps_each_envelope_variant() {
        let list = json!({"Data": [{"a": 1}]});
        let nested = json!({"Data": {"Data": [{"a": 1}, {"a": 2}]}});
        let bare_dict = json!({"a": 1, "b": 2});
        let bare_list = json!([{"a": 1}, {"a": 2}, {"a": 3}]);

        assert_eq!(
            parse_payload(SourceShape::Fallback, "x", &list, t0()).unwrap().records.len(),
            1
        );
        assert_eq!(
            parse_payload(SourceShape::Fallback, "x", &nested, t0()).unwrap().records.len(),
            2
        );
        assert_eq!(
            parse_payload(SourceShape::Fallback, "x", &bare_dict, t0()).unwrap().records.len(),
            1
        );
        assert_eq!(
            parse_payload(SourceShape::Fallback, "x", &bare_list, t0()).unwrap().records.len(),
            3
        );
    }

    #[test]
    fn empty_row_lists_are_reported_not_returned() {
        let payload = json!({"Data": []});
        let err = parse_payload(SourceShape::ListWithId, "news", &payload, t0()).unwrap_err();
        assert!(matches!(err, ParseError::Empty { .. }));
        assert_eq!(err.to_string(), "source news: payload produced no rows");
    }

    const DASHBOARD_HTML: &str = r#"
        <html><body>
          <div id="btc_dominance">58.2%</div>
          <div class="block-height">861,234</div>
          <div class="dashboard-subcol">
            <p>Market Cap</p><p>$1.91T</p>
          </div>
          <div class="dashboard-subcol">
            <p>MVRV Z-Score</p><p>2.41</p>
          </div>
          <div class="dashboard-subcol">
            <p>Number of UTXOs in Profit</p><p>182M</p>
          </div>
          <div id="hashrate">712 EH/s</div>
        </body></html>
    "#;

    #[test]
    fn dashboard_snapshot_extracts_by_css_and_label_sibling() {
        let snapshot = dashboard_snapshot(DASHBOARD_HTML, DASHBOARD_RULES, t0());
        assert_eq!(snapshot["Bitcoin Dominance"], json!("58.2%"));
        assert_eq!(snapshot["Block Height"], json!("861,234"));
        assert_eq!(snapshot["Market Cap"], json!("$1.91T"));
        assert_eq!(snapshot["MVRV Z-Score"], json!("2.41"));
        assert_eq!(snapshot["Hashrate"], json!("712 EH/s"));
        assert_eq!(snapshot["Number of UTXOs in Profit"], json!("182M"));
        // selector with no match comes out null, not absent
        assert_eq!(snapshot["Open Interest"], json!(null));
        assert_eq!(snapshot["Percent UTXOs in Profit"], json!(null));
        assert_eq!(snapshot["timestamp"], json!("2026-08-25T12:00:00Z"));
    }

    #[test]
    fn dashboard_snapshot_feeds_the_fallback_parser() {
        let snapshot = dashboard_snapshot(DASHBOARD_HTML, DASHBOARD_RULES, t0());
        let batch =
            parse_payload(SourceShape::Fallback, "bitcoin_dashboard", &snapshot, t0()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(
            batch.records.get(0, "BITCOIN_DOMINANCE"),
            Some(&Scalar::Text("58.2%".into()))
        );
        assert!(batch.records.has_column("TIMESTAMP"));
    }
}
