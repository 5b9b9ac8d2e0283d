//! Pure mapping from an enriched detail record to the persisted row.

use crate::{DetailRecord, EnrichedRecord, PersistedProduct};

pub const NEW_PRICE_INDEX: usize = 1;
pub const SALES_INDEX: usize = 3;
pub const BUY_BOX_SHIPPING_INDEX: usize = 18;

/// Stock sentinel meaning "not tracked"; stored as NULL.
pub const STOCK_UNTRACKED: i32 = -2;

pub const SELLER_UNKNOWN: &str = "N/A";

/// Attach enrichment results to a detail record.
pub fn enrich(detail: DetailRecord, winner_count_90: u32, seller_name: impl Into<String>) -> EnrichedRecord {
    EnrichedRecord {
        winner_count_30: detail.buy_box_winner_count,
        winner_count_90,
        seller_name: seller_name.into(),
        detail,
    }
}

pub fn transform(detail: &DetailRecord, winner_count_90: u32, seller_name: &str) -> PersistedProduct {
    PersistedProduct {
        asin: detail.asin.clone(),
        title: detail.title.clone(),
        sales_current: series_at(&detail.current, SALES_INDEX),
        sales_avg30: series_at(&detail.avg30, SALES_INDEX),
        monthly_sold: detail.monthly_sold,
        buy_box_shipping_current: minor_to_major(series_at(&detail.current, BUY_BOX_SHIPPING_INDEX)),
        buy_box_shipping_avg30: minor_to_major(series_at(&detail.avg30, BUY_BOX_SHIPPING_INDEX)),
        seller_name: seller_name.to_string(),
        winner_count_30: clamp_count(detail.buy_box_winner_count),
        winner_count_90: clamp_count(winner_count_90),
        buy_box_eligible_offer_count: detail
            .buy_box_eligible_offer_counts
            .first()
            .map(|&c| c.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
            .unwrap_or(0),
        stock_amazon: stock_column(detail.stock_amazon),
        new_price_current: minor_to_major(series_at(&detail.current, NEW_PRICE_INDEX)),
        new_price_avg30: minor_to_major(series_at(&detail.avg30, NEW_PRICE_INDEX)),
        fba_fees: minor_to_major(detail.pick_and_pack_fee),
        referral_fee_percentage: detail.referral_fee_percentage,
        referral_buybox_fee: referral_fee_buy_box(detail.buy_box_price, detail.referral_fee_percentage),
        ean_list: format_ean_list(detail.ean_list.as_deref()),
        product_type: detail.product_type.clone(),
        brand: detail.brand.clone(),
    }
}

pub fn to_persisted(record: &EnrichedRecord) -> PersistedProduct {
    let mut product = transform(&record.detail, record.winner_count_90, &record.seller_name);
    product.winner_count_30 = clamp_count(record.winner_count_30);
    product
}

/// Fixed-position read; short or missing series read as zero.
pub fn series_at(series: &[f64], index: usize) -> f64 {
    series.get(index).copied().unwrap_or(0.0)
}

pub fn minor_to_major(value: f64) -> f64 {
    value / 100.0
}

/// Buy-box price (minor units) times the referral percentage, in major units, rounded half-up to cents.
pub fn referral_fee_buy_box(buy_box_price: i64, referral_fee_percentage: f64) -> f64 {
    let fee_minor = buy_box_price as f64 * (referral_fee_percentage / 100.0);
    round_cents(minor_to_major(fee_minor))
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

pub fn stock_column(stock: i32) -> Option<i32> {
    (stock != STOCK_UNTRACKED).then_some(stock)
}

pub fn format_ean_list(eans: Option<&[String]>) -> String {
    eans.map(|list| list.join(", ")).unwrap_or_default()
}

fn clamp_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}
