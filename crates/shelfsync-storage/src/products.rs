//! Locale-partitioned product tables: schema, retention eviction and upsert.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shelfsync_core::{Locale, PersistedProduct, PipelineError};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Connection, Row};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredProduct {
    pub product: PersistedProduct,
    pub last_updated: DateTime<Utc>,
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Create the locale table if absent, keyed by `asin`.
    async fn ensure_schema(&self, locale: Locale) -> Result<(), PipelineError>;

    /// Delete rows untouched for longer than the retention window; returns the count removed.
    async fn delete_stale(&self, locale: Locale) -> Result<u64, PipelineError>;

    /// Insert, or overwrite every non-key column on conflict. Last write wins.
    async fn upsert(&self, locale: Locale, product: &PersistedProduct) -> Result<(), PipelineError>;

    async fn get(&self, locale: Locale, asin: &str) -> Result<Option<StoredProduct>, PipelineError>;
}

/// Accepts plain SQL identifiers only and returns them double-quoted.
pub fn quote_ident(name: &str) -> Result<String, PipelineError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_head || !valid_tail || name.len() > 63 {
        return Err(PipelineError::Configuration(format!(
            "{name:?} is not a valid SQL identifier"
        )));
    }
    Ok(format!("\"{name}\""))
}

fn persistence(context: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Persistence(format!("{context}: {err}"))
}

pub fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            title TEXT,
            sales_current DOUBLE PRECISION,
            sales_avg30 DOUBLE PRECISION,
            monthly_sold INT,
            buy_box_shipping_current DOUBLE PRECISION,
            buy_box_shipping_avg30 DOUBLE PRECISION,
            seller_name TEXT,
            winner_count_30 INT,
            winner_count_90 INT,
            buy_box_eligible_offer_count INT,
            stock_amazon INT,
            new_price_current DOUBLE PRECISION,
            new_price_avg30 DOUBLE PRECISION,
            fba_fees DOUBLE PRECISION,
            referral_fee_percentage DOUBLE PRECISION,
            referral_buybox_fee DOUBLE PRECISION,
            asin VARCHAR(20) PRIMARY KEY,
            ean_list TEXT,
            type TEXT,
            brand TEXT,
            last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    )
}

pub fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} (
            title, sales_current, sales_avg30, monthly_sold,
            buy_box_shipping_current, buy_box_shipping_avg30, seller_name,
            winner_count_30, winner_count_90, buy_box_eligible_offer_count,
            stock_amazon, new_price_current, new_price_avg30, fba_fees,
            referral_fee_percentage, referral_buybox_fee, asin, ean_list, type, brand,
            last_updated
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, NOW())
        ON CONFLICT (asin) DO UPDATE SET
            title = EXCLUDED.title,
            sales_current = EXCLUDED.sales_current,
            sales_avg30 = EXCLUDED.sales_avg30,
            monthly_sold = EXCLUDED.monthly_sold,
            buy_box_shipping_current = EXCLUDED.buy_box_shipping_current,
            buy_box_shipping_avg30 = EXCLUDED.buy_box_shipping_avg30,
            seller_name = EXCLUDED.seller_name,
            winner_count_30 = EXCLUDED.winner_count_30,
            winner_count_90 = EXCLUDED.winner_count_90,
            buy_box_eligible_offer_count = EXCLUDED.buy_box_eligible_offer_count,
            stock_amazon = EXCLUDED.stock_amazon,
            new_price_current = EXCLUDED.new_price_current,
            new_price_avg30 = EXCLUDED.new_price_avg30,
            fba_fees = EXCLUDED.fba_fees,
            referral_fee_percentage = EXCLUDED.referral_fee_percentage,
            referral_buybox_fee = EXCLUDED.referral_buybox_fee,
            ean_list = EXCLUDED.ean_list,
            type = EXCLUDED.type,
            brand = EXCLUDED.brand,
            last_updated = GREATEST({table}.last_updated, EXCLUDED.last_updated)
        "#
    )
}

pub fn delete_stale_sql(table: &str) -> String {
    format!("DELETE FROM {table} WHERE last_updated < NOW() - make_interval(days => $1)")
}

/// PostgreSQL gateway. Each operation opens its own connection, selects the schema, and closes it.
#[derive(Debug, Clone)]
pub struct PgProductStore {
    options: PgConnectOptions,
    schema: String,
    retention_days: u32,
}

impl PgProductStore {
    pub fn new(database_url: &str, schema: &str, retention_days: u32) -> Result<Self, PipelineError> {
        let url = database_url.trim().trim_start_matches("jdbc:");
        let options = PgConnectOptions::from_str(url)
            .map_err(|err| PipelineError::Configuration(format!("invalid database url: {err}")))?
            .disable_statement_logging();
        Ok(Self {
            options,
            schema: quote_ident(schema)?,
            retention_days,
        })
    }

    pub fn with_credentials(mut self, user: Option<&str>, password: Option<&str>) -> Self {
        if let Some(user) = user.filter(|u| !u.is_empty()) {
            self.options = self.options.username(user);
        }
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.options = self.options.password(password);
        }
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    async fn acquire(&self) -> Result<PgConnection, PipelineError> {
        let mut conn = PgConnection::connect_with(&self.options)
            .await
            .map_err(|err| persistence("connecting", err))?;
        let set_path = format!("SET search_path TO {}", self.schema);
        if let Err(err) = sqlx::query(&set_path).execute(&mut conn).await {
            release(conn).await;
            return Err(persistence("selecting schema", err));
        }
        Ok(conn)
    }
}

async fn release(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        warn!(error = %err, "closing database connection failed");
    }
}

fn row_to_stored(row: &PgRow) -> Result<StoredProduct, sqlx::Error> {
    Ok(StoredProduct {
        product: PersistedProduct {
            asin: row.try_get("asin")?,
            title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
            sales_current: row.try_get::<Option<f64>, _>("sales_current")?.unwrap_or_default(),
            sales_avg30: row.try_get::<Option<f64>, _>("sales_avg30")?.unwrap_or_default(),
            monthly_sold: row.try_get::<Option<i32>, _>("monthly_sold")?.unwrap_or_default(),
            buy_box_shipping_current: row
                .try_get::<Option<f64>, _>("buy_box_shipping_current")?
                .unwrap_or_default(),
            buy_box_shipping_avg30: row
                .try_get::<Option<f64>, _>("buy_box_shipping_avg30")?
                .unwrap_or_default(),
            seller_name: row.try_get::<Option<String>, _>("seller_name")?.unwrap_or_default(),
            winner_count_30: row.try_get::<Option<i32>, _>("winner_count_30")?.unwrap_or_default(),
            winner_count_90: row.try_get::<Option<i32>, _>("winner_count_90")?.unwrap_or_default(),
            buy_box_eligible_offer_count: row
                .try_get::<Option<i32>, _>("buy_box_eligible_offer_count")?
                .unwrap_or_default(),
            stock_amazon: row.try_get("stock_amazon")?,
            new_price_current: row.try_get::<Option<f64>, _>("new_price_current")?.unwrap_or_default(),
            new_price_avg30: row.try_get::<Option<f64>, _>("new_price_avg30")?.unwrap_or_default(),
            fba_fees: row.try_get::<Option<f64>, _>("fba_fees")?.unwrap_or_default(),
            referral_fee_percentage: row
                .try_get::<Option<f64>, _>("referral_fee_percentage")?
                .unwrap_or_default(),
            referral_buybox_fee: row
                .try_get::<Option<f64>, _>("referral_buybox_fee")?
                .unwrap_or_default(),
            ean_list: row.try_get::<Option<String>, _>("ean_list")?.unwrap_or_default(),
            product_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
            brand: row.try_get::<Option<String>, _>("brand")?.unwrap_or_default(),
        },
        last_updated: row.try_get("last_updated")?,
    })
}

#[async_trait]
impl ProductStore for PgProductStore {
    async fn ensure_schema(&self, locale: Locale) -> Result<(), PipelineError> {
        let table = locale.table_name();
        let mut conn = self.acquire().await?;
        let result = sqlx::query(&create_table_sql(&table)).execute(&mut conn).await;
        release(conn).await;
        result.map_err(|err| persistence(&format!("creating {table}"), err))?;
        Ok(())
    }

    async fn delete_stale(&self, locale: Locale) -> Result<u64, PipelineError> {
        let table = locale.table_name();
        let days = i32::try_from(self.retention_days).unwrap_or(i32::MAX);
        let mut conn = self.acquire().await?;
        let result = sqlx::query(&delete_stale_sql(&table))
            .bind(days)
            .execute(&mut conn)
            .await;
        release(conn).await;
        let deleted = result
            .map_err(|err| persistence(&format!("deleting stale rows from {table}"), err))?
            .rows_affected();
        info!(%locale, table = %table, deleted, "retention eviction finished");
        Ok(deleted)
    }

    async fn upsert(&self, locale: Locale, product: &PersistedProduct) -> Result<(), PipelineError> {
        let table = locale.table_name();
        let mut conn = self.acquire().await?;
        let result = sqlx::query(&upsert_sql(&table))
            .bind(&product.title)
            .bind(product.sales_current)
            .bind(product.sales_avg30)
            .bind(product.monthly_sold)
            .bind(product.buy_box_shipping_current)
            .bind(product.buy_box_shipping_avg30)
            .bind(&product.seller_name)
            .bind(product.winner_count_30)
            .bind(product.winner_count_90)
            .bind(product.buy_box_eligible_offer_count)
            .bind(product.stock_amazon)
            .bind(product.new_price_current)
            .bind(product.new_price_avg30)
            .bind(product.fba_fees)
            .bind(product.referral_fee_percentage)
            .bind(product.referral_buybox_fee)
            .bind(&product.asin)
            .bind(&product.ean_list)
            .bind(&product.product_type)
            .bind(&product.brand)
            .execute(&mut conn)
            .await;
        release(conn).await;
        result.map_err(|err| persistence(&format!("upserting {} into {table}", product.asin), err))?;
        Ok(())
    }

    async fn get(&self, locale: Locale, asin: &str) -> Result<Option<StoredProduct>, PipelineError> {
        let table = locale.table_name();
        let mut conn = self.acquire().await?;
        let result = sqlx::query(&format!("SELECT * FROM {table} WHERE asin = $1"))
            .bind(asin)
            .fetch_optional(&mut conn)
            .await;
        release(conn).await;
        let row = result.map_err(|err| persistence(&format!("reading {asin} from {table}"), err))?;
        row.as_ref()
            .map(row_to_stored)
            .transpose()
            .map_err(|err| persistence(&format!("decoding {asin} from {table}"), err))
    }
}

/// In-process store with the same semantics as the PostgreSQL gateway. Backs dry runs and tests.
#[derive(Debug)]
pub struct MemoryProductStore {
    retention_days: u32,
    state: Mutex<MemoryState>,
}

impl Default for MemoryProductStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_DAYS)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<Locale, BTreeMap<String, StoredProduct>>,
    rejected: HashSet<String>,
    upserts: usize,
}

impl MemoryProductStore {
    pub fn new(retention_days: u32) -> Self {
        Self {
            retention_days,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Insert a row with an explicit timestamp, creating the table if needed.
    pub async fn seed(&self, locale: Locale, product: PersistedProduct, last_updated: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.tables.entry(locale).or_default().insert(
            product.asin.clone(),
            StoredProduct {
                product,
                last_updated,
            },
        );
    }

    /// Make every upsert for `asin` fail, as a broken statement would.
    pub async fn reject_asin(&self, asin: &str) {
        self.state.lock().await.rejected.insert(asin.to_string());
    }

    pub async fn rows(&self, locale: Locale) -> Vec<StoredProduct> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&locale)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn upsert_count(&self) -> usize {
        self.state.lock().await.upserts
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn ensure_schema(&self, locale: Locale) -> Result<(), PipelineError> {
        self.state.lock().await.tables.entry(locale).or_default();
        Ok(())
    }

    async fn delete_stale(&self, locale: Locale) -> Result<u64, PipelineError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        let mut state = self.state.lock().await;
        let table = state.tables.get_mut(&locale).ok_or_else(|| {
            PipelineError::Persistence(format!("relation {} does not exist", locale.table_name()))
        })?;
        let before = table.len();
        table.retain(|_, row| row.last_updated >= cutoff);
        Ok((before - table.len()) as u64)
    }

    async fn upsert(&self, locale: Locale, product: &PersistedProduct) -> Result<(), PipelineError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.rejected.contains(&product.asin) {
            return Err(PipelineError::Persistence(format!(
                "upserting {} into {}: rejected",
                product.asin,
                locale.table_name()
            )));
        }
        let table = state.tables.get_mut(&locale).ok_or_else(|| {
            PipelineError::Persistence(format!("relation {} does not exist", locale.table_name()))
        })?;
        let last_updated = table
            .get(&product.asin)
            .map(|row| row.last_updated.max(now))
            .unwrap_or(now);
        table.insert(
            product.asin.clone(),
            StoredProduct {
                product: product.clone(),
                last_updated,
            },
        );
        state.upserts += 1;
        Ok(())
    }

    async fn get(&self, locale: Locale, asin: &str) -> Result<Option<StoredProduct>, PipelineError> {
        let state = self.state.lock().await;
        Ok(state.tables.get(&locale).and_then(|t| t.get(asin)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(asin: &str, title: &str) -> PersistedProduct {
        PersistedProduct {
            asin: asin.into(),
            title: title.into(),
            sales_current: 1200.0,
            sales_avg30: 1300.0,
            monthly_sold: 50,
            buy_box_shipping_current: 0.0,
            buy_box_shipping_avg30: 0.0,
            seller_name: "Acme".into(),
            winner_count_30: 2,
            winner_count_90: 3,
            buy_box_eligible_offer_count: 4,
            stock_amazon: None,
            new_price_current: 19.99,
            new_price_avg30: 21.5,
            fba_fees: 3.05,
            referral_fee_percentage: 15.0,
            referral_buybox_fee: 3.0,
            ean_list: String::new(),
            product_type: "BOOK".into(),
            brand: "Acme".into(),
        }
    }

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(quote_ident("keepa_data").unwrap(), "\"keepa_data\"");
        assert!(quote_ident("public; DROP TABLE x").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn sql_targets_the_locale_table() {
        let table = Locale::It.table_name();
        assert!(create_table_sql(&table).contains("CREATE TABLE IF NOT EXISTS products_it"));
        assert!(create_table_sql(&table).contains("asin VARCHAR(20) PRIMARY KEY"));
        assert!(upsert_sql(&table).contains("ON CONFLICT (asin) DO UPDATE"));
        assert!(delete_stale_sql(&table).starts_with("DELETE FROM products_it"));
    }

    #[test]
    fn upsert_overwrites_every_non_key_column() {
        let sql = upsert_sql("products_it");
        for column in [
            "title", "sales_current", "sales_avg30", "monthly_sold", "buy_box_shipping_current",
            "buy_box_shipping_avg30", "seller_name", "winner_count_30", "winner_count_90",
            "buy_box_eligible_offer_count", "stock_amazon", "new_price_current", "new_price_avg30",
            "fba_fees", "referral_fee_percentage", "referral_buybox_fee", "ean_list", "type", "brand",
        ] {
            assert!(
                sql.contains(&format!("{column} = EXCLUDED.{column}")),
                "{column} not overwritten"
            );
        }
    }

    #[test]
    fn jdbc_style_urls_are_accepted() {
        let store = PgProductStore::new("jdbc:postgresql://localhost:5432/keepa", "public", 30);
        assert!(store.is_ok());
        assert!(PgProductStore::new("postgres://localhost/db", "bad schema", 30).is_err());
    }

    #[tokio::test]
    async fn memory_upsert_is_idempotent_with_non_decreasing_timestamp() {
        let store = MemoryProductStore::new(DEFAULT_RETENTION_DAYS);
        store.ensure_schema(Locale::It).await.unwrap();
        let p = product("B01", "First");

        store.upsert(Locale::It, &p).await.unwrap();
        let first = store.get(Locale::It, "B01").await.unwrap().unwrap();
        store.upsert(Locale::It, &p).await.unwrap();
        let second = store.get(Locale::It, "B01").await.unwrap().unwrap();

        assert_eq!(store.rows(Locale::It).await.len(), 1);
        assert_eq!(first.product, second.product);
        assert!(second.last_updated >= first.last_updated);
    }

    #[tokio::test]
    async fn memory_upsert_last_write_wins() {
        let store = MemoryProductStore::new(DEFAULT_RETENTION_DAYS);
        store.ensure_schema(Locale::Fr).await.unwrap();
        store.upsert(Locale::Fr, &product("B01", "Old")).await.unwrap();
        let mut newer = product("B01", "New");
        newer.stock_amazon = Some(7);
        store.upsert(Locale::Fr, &newer).await.unwrap();

        let row = store.get(Locale::Fr, "B01").await.unwrap().unwrap();
        assert_eq!(row.product, newer);
        assert!(store.get(Locale::It, "B01").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_delete_stale_honours_threshold() {
        let store = MemoryProductStore::new(DEFAULT_RETENTION_DAYS);
        let now = Utc::now();
        for (asin, days) in [("OLD1", 31), ("OLD2", 400), ("NEW1", 29), ("NEW2", 0)] {
            store
                .seed(Locale::De, product(asin, asin), now - chrono::Duration::days(days))
                .await;
        }

        let deleted = store.delete_stale(Locale::De).await.unwrap();
        let mut remaining: Vec<String> = store
            .rows(Locale::De)
            .await
            .into_iter()
            .map(|r| r.product.asin)
            .collect();
        remaining.sort();

        assert_eq!(deleted, 2);
        assert_eq!(remaining, vec!["NEW1", "NEW2"]);
    }

    #[tokio::test]
    async fn default_memory_store_keeps_the_thirty_day_window() {
        let store = MemoryProductStore::default();
        let now = Utc::now();
        store
            .seed(Locale::It, product("FRESH", "x"), now - chrono::Duration::hours(1))
            .await;
        store
            .seed(Locale::It, product("STALE", "x"), now - chrono::Duration::days(31))
            .await;

        assert_eq!(store.delete_stale(Locale::It).await.unwrap(), 1);
        assert!(store.get(Locale::It, "FRESH").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_store_requires_schema_and_honours_rejections() {
        let store = MemoryProductStore::new(DEFAULT_RETENTION_DAYS);
        let err = store.upsert(Locale::Es, &product("B01", "x")).await.unwrap_err();
        assert_eq!(err.kind(), "PersistenceError");

        store.ensure_schema(Locale::Es).await.unwrap();
        store.reject_asin("B02").await;
        assert!(store.upsert(Locale::Es, &product("B02", "x")).await.is_err());
        assert!(store.upsert(Locale::Es, &product("B01", "x")).await.is_ok());
        assert_eq!(store.upsert_count().await, 1);
    }

    /// Runs against a live database when `SHELFSYNC_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn postgres_upsert_and_retention() {
        let Ok(url) = std::env::var("SHELFSYNC_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgProductStore::new(&url, "public", DEFAULT_RETENTION_DAYS).unwrap();
        store.ensure_schema(Locale::Es).await.unwrap();

        let p = product("ZZTEST0001", "First");
        store.upsert(Locale::Es, &p).await.unwrap();
        let first = store.get(Locale::Es, "ZZTEST0001").await.unwrap().unwrap();
        store.upsert(Locale::Es, &p).await.unwrap();
        let second = store.get(Locale::Es, "ZZTEST0001").await.unwrap().unwrap();
        assert_eq!(first.product, second.product);
        assert!(second.last_updated >= first.last_updated);

        let mut conn = store.acquire().await.unwrap();
        sqlx::query(
            "UPDATE products_es SET last_updated = NOW() - INTERVAL '31 days' WHERE asin = 'ZZTEST0001'",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        release(conn).await;

        let deleted = store.delete_stale(Locale::Es).await.unwrap();
        assert!(deleted >= 1);
        assert!(store.get(Locale::Es, "ZZTEST0001").await.unwrap().is_none());
    }
}
