use std::path::{Path, PathBuf};

use shelfsync_core::{transform, CandidateList, Locale};
use shelfsync_keepa::{parse, ApiReply};

fn fixture_reply(name: &str) -> ApiReply {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/keepa")
        .join(name);
    let bytes = std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()));
    ApiReply::from_bytes(bytes).expect("fixture parses")
}

#[test]
fn recorded_responses_flow_into_persisted_rows() {
    let ranked = parse::best_seller_asins(&fixture_reply("bestsellers_it.json").body)
        .unwrap()
        .unwrap();
    let candidates = CandidateList::from_ranked(Locale::It, ranked, CandidateList::DEFAULT_MAX);
    assert_eq!(candidates.processing_order()[0], "B0CATC0003");

    let stage1 = fixture_reply("product_stats90.json");
    let snapshot = parse::competitive_snapshot(parse::products_array(&stage1.body).unwrap());

    let stage2 = fixture_reply("product_detail30.json");
    let details = parse::index_by_asin(parse::products_array(&stage2.body).unwrap());

    let moka = parse::detail_record(details["B0CATC0003"]).unwrap();
    let row = transform(&moka, snapshot.count_for(&moka.asin), "Amazon.it");
    assert_eq!(row.asin, "B0CATC0003");
    assert_eq!(row.new_price_current, 25.9);
    assert_eq!(row.new_price_avg30, 26.25);
    assert_eq!(row.sales_current, 1534.0);
    assert_eq!(row.buy_box_shipping_current, 0.0);
    assert_eq!(row.fba_fees, 3.25);
    // 2590 * 15.45% = 400.155 minor -> 4.00155
    assert_eq!(row.referral_buybox_fee, 4.0);
    assert_eq!(row.winner_count_90, 3);
    assert_eq!(row.winner_count_30, 2);
    assert_eq!(row.buy_box_eligible_offer_count, 5);
    assert_eq!(row.stock_amazon, Some(37));
    assert_eq!(row.ean_list, "8006363011440");

    let cups = parse::detail_record(details["B0CATB0002"]).unwrap();
    let row = transform(&cups, snapshot.count_for(&cups.asin), "N/A");
    assert_eq!(row.stock_amazon, None);
    assert_eq!(row.winner_count_90, 0);
    assert_eq!(row.ean_list, "");
    assert_eq!(row.buy_box_shipping_avg30, 19.5);
    assert!(cups.current_seller_id().is_none());

    assert!(!details.contains_key("B0CATA0001"));
}

#[test]
fn seller_and_token_fixtures() {
    assert_eq!(
        parse::seller_name(&fixture_reply("seller.json").body).as_deref(),
        Some("Amazon.it")
    );
    assert_eq!(
        parse::token_status(&fixture_reply("token.json").body),
        Some((2400.0, 60.0))
    );
}
