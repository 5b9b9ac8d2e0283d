//! Pure readers over the data API's JSON payloads.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use shelfsync_core::{CompetitiveSnapshot, DetailRecord, PipelineError};

pub const DEFAULT_TITLE: &str = "N/A";
pub const DEFAULT_TYPE: &str = "N/A";

fn malformed(msg: impl Into<String>) -> PipelineError {
    PipelineError::MalformedResponse(msg.into())
}

pub fn parse_json(bytes: &[u8]) -> Result<JsonValue, PipelineError> {
    serde_json::from_slice(bytes).map_err(|e| malformed(format!("invalid JSON: {e}")))
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    (!cur.is_null()).then_some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_path(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_path(value, path)?.as_f64()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_path(value, path)?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

fn json_object_len(value: &JsonValue, path: &[&str]) -> u32 {
    json_path(value, path)
        .and_then(JsonValue::as_object)
        .map(|o| o.len() as u32)
        .unwrap_or(0)
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Option<Vec<String>> {
    let arr = json_path(value, path)?.as_array()?;
    Some(
        arr.iter()
            .filter_map(|v| match v {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
    )
}

fn json_number_vec(value: &JsonValue, path: &[&str]) -> Vec<f64> {
    json_path(value, path)
        .and_then(JsonValue::as_array)
        .map(|arr| arr.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect())
        .unwrap_or_default()
}

/// Ranked identifiers from a best-sellers response. `Ok(None)` when the list is absent.
pub fn best_seller_asins(body: &JsonValue) -> Result<Option<Vec<String>>, PipelineError> {
    let Some(list) = json_path(body, &["bestSellersList"]) else {
        return Ok(None);
    };
    let asins = json_path(list, &["asinList"])
        .and_then(JsonValue::as_array)
        .ok_or_else(|| malformed("bestSellersList has no asinList array"))?;
    Ok(Some(
        asins
            .iter()
            .filter_map(JsonValue::as_str)
            .map(ToString::to_string)
            .collect(),
    ))
}

pub fn products_array(body: &JsonValue) -> Result<&[JsonValue], PipelineError> {
    json_path(body, &["products"])
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| malformed("response has no products array"))
}

pub fn product_asin(product: &JsonValue) -> String {
    json_str(product, &["asin"]).unwrap_or_default().to_string()
}

/// Competing buy-box offers per identifier, counted as the keys of `stats.buyBoxStats`.
pub fn competitive_snapshot(products: &[JsonValue]) -> CompetitiveSnapshot {
    let mut snapshot = CompetitiveSnapshot::new();
    for product in products {
        snapshot.insert(product_asin(product), json_object_len(product, &["stats", "buyBoxStats"]));
    }
    snapshot
}

/// Products keyed by identifier; a repeated identifier keeps the last occurrence.
pub fn index_by_asin(products: &[JsonValue]) -> HashMap<String, &JsonValue> {
    products.iter().map(|p| (product_asin(p), p)).collect()
}

/// Absent reads as 0; a value outside the i32 column range makes the product malformed.
fn json_i32(value: &JsonValue, path: &[&str], asin: &str) -> Result<i32, PipelineError> {
    let Some(raw) = json_i64(value, path) else {
        return Ok(0);
    };
    i32::try_from(raw).map_err(|_| malformed(format!("product {asin}: {} = {raw} is out of range", path.join("."))))
}

pub fn detail_record(product: &JsonValue) -> Result<DetailRecord, PipelineError> {
    let asin = product_asin(product);
    let stats = json_path(product, &["stats"])
        .filter(|s| s.is_object())
        .ok_or_else(|| malformed(format!("product {asin} has no stats object")))?;

    Ok(DetailRecord {
        title: json_str(product, &["title"]).unwrap_or(DEFAULT_TITLE).to_string(),
        brand: json_str(product, &["brand"]).unwrap_or_default().to_string(),
        product_type: json_str(product, &["type"]).unwrap_or(DEFAULT_TYPE).to_string(),
        ean_list: json_string_vec(product, &["eanList"]),
        monthly_sold: json_i32(product, &["monthlySold"], &asin)?,
        current: json_number_vec(stats, &["current"]),
        avg30: json_number_vec(stats, &["avg30"]),
        buy_box_winner_count: json_object_len(stats, &["buyBoxStats"]),
        stock_amazon: json_i32(stats, &["stockAmazon"], &asin)?,
        buy_box_price: json_i64(stats, &["buyBoxPrice"]).unwrap_or(0),
        pick_and_pack_fee: json_f64(product, &["fbaFees", "pickAndPackFee"]).unwrap_or(0.0),
        referral_fee_percentage: json_f64(product, &["referralFeePercentage"]).unwrap_or(0.0),
        buy_box_eligible_offer_counts: json_path(product, &["buyBoxEligibleOfferCounts"])
            .and_then(JsonValue::as_array)
            .map(|arr| arr.iter().map(|v| v.as_i64().unwrap_or(0)).collect())
            .unwrap_or_default(),
        buy_box_seller_id_history: json_string_vec(product, &["buyBoxSellerIdHistory"]).unwrap_or_default(),
        asin,
    })
}

/// Name of the first seller in the keyed `sellers` map, if any.
pub fn seller_name(body: &JsonValue) -> Option<String> {
    let sellers = json_path(body, &["sellers"])?.as_object()?;
    let (_, first) = sellers.iter().next()?;
    json_str(first, &["sellerName"]).map(ToString::to_string)
}

/// Error reported in-band by the API, as `error.message` or `error.type`.
pub fn api_error(body: &JsonValue) -> Option<String> {
    let error = json_path(body, &["error"])?;
    json_str(error, &["message"])
        .or_else(|| json_str(error, &["type"]))
        .or_else(|| error.as_str())
        .map(ToString::to_string)
}

/// `tokensLeft` and `refillRate` as reported alongside every response.
pub fn token_status(body: &JsonValue) -> Option<(f64, f64)> {
    Some((json_f64(body, &["tokensLeft"])?, json_f64(body, &["refillRate"])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn fixture(name: &str) -> JsonValue {
        let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/keepa")
            .join(name);
        let bytes = std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
        parse_json(&bytes).expect("fixture json")
    }

    #[test]
    fn reads_best_seller_list_in_rank_order() {
        let asins = best_seller_asins(&fixture("bestsellers_it.json")).unwrap().unwrap();
        assert_eq!(asins, vec!["B0CATA0001", "B0CATB0002", "B0CATC0003"]);
    }

    #[test]
    fn missing_best_seller_list_is_not_an_error() {
        let body = serde_json::json!({"tokensLeft": 10});
        assert_eq!(best_seller_asins(&body).unwrap(), None);
        let broken = serde_json::json!({"bestSellersList": {"asinList": "nope"}});
        assert!(best_seller_asins(&broken).is_err());
    }

    #[test]
    fn snapshot_counts_buy_box_competitors_for_ninety_days() {
        let body = fixture("product_stats90.json");
        let snapshot = competitive_snapshot(products_array(&body).unwrap());
        assert_eq!(snapshot.identifiers(), vec!["B0CATC0003", "B0CATB0002"]);
        assert_eq!(snapshot.count_for("B0CATC0003"), 3);
        assert_eq!(snapshot.count_for("B0CATB0002"), 0);
    }

    #[test]
    fn detail_record_reads_stats_fees_and_history() {
        let body = fixture("product_detail30.json");
        let products = products_array(&body).unwrap();
        let index = index_by_asin(products);
        let record = detail_record(index["B0CATC0003"]).unwrap();

        assert_eq!(record.title, "Moka Express 3 Tazze");
        assert_eq!(record.brand, "Bialetti");
        assert_eq!(record.product_type, "KITCHEN");
        assert_eq!(record.ean_list.as_deref(), Some(&["8006363011440".to_string()][..]));
        assert_eq!(record.monthly_sold, 2000);
        assert_eq!(record.current[1], 2590.0);
        assert_eq!(record.avg30[18], 0.0);
        assert_eq!(record.buy_box_winner_count, 2);
        assert_eq!(record.stock_amazon, 37);
        assert_eq!(record.buy_box_price, 2590);
        assert_eq!(record.pick_and_pack_fee, 325.0);
        assert_eq!(record.referral_fee_percentage, 15.45);
        assert_eq!(record.buy_box_eligible_offer_counts[0], 5);
        assert_eq!(record.current_seller_id(), Some("A11IL2PNWYJU7H"));
    }

    #[test]
    fn detail_record_defaults_optional_fields() {
        let product = serde_json::json!({"asin": "B0X", "brand": null, "stats": {}});
        let record = detail_record(&product).unwrap();
        assert_eq!(record.title, DEFAULT_TITLE);
        assert_eq!(record.product_type, DEFAULT_TYPE);
        assert_eq!(record.brand, "");
        assert_eq!(record.ean_list, None);
        assert!(record.current.is_empty());
        assert_eq!(record.current_seller_id(), None);
    }

    #[test]
    fn detail_record_without_stats_is_malformed() {
        let product = serde_json::json!({"asin": "B0X"});
        let err = detail_record(&product).unwrap_err();
        assert_eq!(err.kind(), "MalformedResponse");
    }

    #[test]
    fn counts_beyond_the_integer_column_are_malformed() {
        let product = serde_json::json!({
            "asin": "B0BIG",
            "monthlySold": 5_000_000_000i64,
            "stats": {"stockAmazon": 3}
        });
        let err = detail_record(&product).unwrap_err();
        assert_eq!(err.kind(), "MalformedResponse");
        assert!(err.to_string().contains("monthlySold"));

        let product = serde_json::json!({
            "asin": "B0NEG",
            "stats": {"stockAmazon": -3_000_000_000i64}
        });
        assert!(detail_record(&product).unwrap_err().to_string().contains("stockAmazon"));

        let product = serde_json::json!({"asin": "B0OK", "monthlySold": 2000, "stats": {"stockAmazon": -2}});
        let record = detail_record(&product).unwrap();
        assert_eq!((record.monthly_sold, record.stock_amazon), (2000, -2));
    }

    #[test]
    fn products_array_is_required() {
        assert!(products_array(&serde_json::json!({"products": {}})).is_err());
        assert!(products_array(&serde_json::json!({"products": []})).unwrap().is_empty());
    }

    #[test]
    fn seller_name_takes_first_keyed_entry() {
        assert_eq!(seller_name(&fixture("seller.json")).as_deref(), Some("Amazon.it"));
        assert_eq!(seller_name(&serde_json::json!({"sellers": {}})), None);
        assert_eq!(seller_name(&serde_json::json!({"sellers": null})), None);
        assert_eq!(seller_name(&serde_json::json!({"sellers": {"A1": {"sellerName": 4}}})), None);
    }

    #[test]
    fn api_error_reads_message_or_type() {
        let body = serde_json::json!({"error": {"type": "invalidParameter", "message": "domain"}});
        assert_eq!(api_error(&body).as_deref(), Some("domain"));
        let typed = serde_json::json!({"error": {"type": "notEnoughToken"}});
        assert_eq!(api_error(&typed).as_deref(), Some("notEnoughToken"));
        assert_eq!(api_error(&fixture("seller.json")), None);
    }

    #[test]
    fn token_status_reads_budget_fields() {
        assert_eq!(token_status(&fixture("bestsellers_it.json")), Some((1180.0, 20.0)));
        assert_eq!(token_status(&serde_json::json!({"tokensLeft": 5})), None);
    }
}
