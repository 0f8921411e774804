use crate::error::StorageError;
use crate::models::{
    CombinedRow, HarvestRun, NavExportRow, NavRecord, NavValues, Product, StoredNav, StoredProduct,
};
use chrono::{Local, NaiveDate, NaiveDateTime};
use duckdb::{Connection, Row, Transaction, params};
use std::path::Path;
use tracing::{info, warn};

// ── Schema ────────────────────────────────────────────────────────────────────

// product_navs.product_code references products.product_code; the check lives
// in `upsert_navs` rather than a FOREIGN KEY so product rows stay updatable.
const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    product_code        VARCHAR PRIMARY KEY,
    product_id          VARCHAR,
    product_name        VARCHAR,
    issuer              VARCHAR,
    issuer_code         VARCHAR,
    risk_level          VARCHAR,
    risk_level_code     VARCHAR,
    product_type        VARCHAR,
    product_type_code   VARCHAR,
    currency            VARCHAR,
    investment_period   VARCHAR,
    min_investment      VARCHAR,
    sale_status         VARCHAR,
    sale_regions        VARCHAR,
    start_date          VARCHAR,
    end_date            VARCHAR,
    product_category    VARCHAR,
    income_type         VARCHAR,
    sale_method         VARCHAR,
    crawl_time          TIMESTAMP NOT NULL,
    created_at          TIMESTAMP NOT NULL,
    updated_at          TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS product_navs (
    product_code        VARCHAR  NOT NULL,
    nav_date            DATE     NOT NULL,
    product_id          VARCHAR,
    -- NULL means absent; zero is never stored
    initial_nav         DOUBLE,
    accumulated_nav     DOUBLE,
    current_nav         DOUBLE,
    is_updated          BOOLEAN  NOT NULL DEFAULT FALSE,
    last_update_date    DATE,
    crawl_time          TIMESTAMP NOT NULL,
    created_at          TIMESTAMP NOT NULL,
    updated_at          TIMESTAMP NOT NULL,
    PRIMARY KEY (product_code, nav_date)
);

CREATE SEQUENCE IF NOT EXISTS harvest_runs_seq START 1;

CREATE TABLE IF NOT EXISTS harvest_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('harvest_runs_seq'),
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    pages_attempted     BIGINT DEFAULT 0,
    pages_failed        BIGINT DEFAULT 0,
    products_saved      BIGINT DEFAULT 0,
    navs_saved          BIGINT DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_navs_date ON product_navs (nav_date);
"#;

// Read projections consumed by the exporter.
const VIEWS: &str = r#"
CREATE OR REPLACE VIEW v_products AS
SELECT product_code, product_id, product_name, issuer, issuer_code,
       risk_level, risk_level_code, product_type, product_type_code,
       currency, investment_period, min_investment, sale_status,
       sale_regions, start_date, end_date, product_category,
       income_type, sale_method, crawl_time, created_at, updated_at
FROM products
ORDER BY product_code;

CREATE OR REPLACE VIEW v_product_navs AS
SELECT n.product_code, n.product_id, p.product_name, n.nav_date,
       n.initial_nav, n.accumulated_nav, n.current_nav,
       n.is_updated, n.last_update_date, n.crawl_time,
       n.created_at, n.updated_at
FROM product_navs n
LEFT JOIN products p ON n.product_code = p.product_code
ORDER BY n.product_code, n.nav_date DESC;

CREATE OR REPLACE VIEW v_products_combined AS
SELECT p.product_id, p.product_code, p.product_name,
       p.issuer, p.risk_level, p.product_type,
       p.currency, p.investment_period, p.min_investment,
       p.start_date, p.end_date, p.product_category,
       p.income_type, n.nav_date, n.initial_nav,
       n.accumulated_nav, n.current_nav
FROM products p
LEFT JOIN product_navs n ON p.product_code = n.product_code
ORDER BY p.product_code, n.nav_date DESC NULLS LAST;
"#;

const PRODUCT_COLUMNS: &str = "product_code, product_id, product_name, issuer, issuer_code, \
    risk_level, risk_level_code, product_type, product_type_code, currency, investment_period, \
    min_investment, sale_status, sale_regions, start_date, end_date, product_category, \
    income_type, sale_method, crawl_time, created_at, updated_at";

const NAV_COLUMNS: &str = "product_code, product_id, nav_date, initial_nav, accumulated_nav, \
    current_nav, is_updated, last_update_date, crawl_time, created_at, updated_at";

// ── Repository ────────────────────────────────────────────────────────────────

/// Every public call runs in its own transaction; nothing is held open
/// between calls.
pub struct Repository {
    conn: Connection,
}

/// Outcome of one NAV batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NavUpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl NavUpsertSummary {
    pub fn saved(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Release the connection. Callers close explicitly on every exit path.
    pub fn close(self) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_, e)| StorageError::Query(e))
    }

    pub fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL)?;
        self.conn.execute_batch(INDEXES)?;
        self.conn.execute_batch(VIEWS)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Local::now().naive_local()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Products ──────────────────────────────────────────────────────────────

    /// Upsert by `product_code`, last write wins. All-or-nothing per batch.
    pub fn upsert_products(&self, products: &[Product]) -> Result<usize, StorageError> {
        if products.is_empty() {
            return Ok(0);
        }

        let batch = |source| StorageError::Batch {
            table: "products",
            source,
        };
        let tx = self.conn.unchecked_transaction().map_err(batch)?;
        // Dropping `tx` on error rolls the batch back
        let saved = write_products(&tx, products, Local::now().naive_local()).map_err(batch)?;
        tx.commit().map_err(batch)?;

        info!("Saved {} products", saved);
        Ok(saved)
    }

    pub fn product_count(&self) -> Result<i64, StorageError> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM products")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn product_by_code(&self, code: &str) -> Result<Option<StoredProduct>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE product_code = ?"
        ))?;
        let mut rows = stmt.query_map(params![code], product_from_row)?;
        Ok(rows.next().transpose()?)
    }

    // ── NAV observations ──────────────────────────────────────────────────────

    /// Upsert NAV observations, flagging changed values against today.
    /// Returns the number of rows processed (skipped rows excluded).
    pub fn upsert_navs(&self, navs: &[NavRecord]) -> Result<usize, StorageError> {
        Ok(self.upsert_navs_on(navs, Local::now().date_naive())?.saved())
    }

    /// Upsert keyed by `(product_code, nav_date)`. A changed value overwrites
    /// the stored one and sets `is_updated` / `last_update_date = processing_date`.
    pub fn upsert_navs_on(
        &self,
        navs: &[NavRecord],
        processing_date: NaiveDate,
    ) -> Result<NavUpsertSummary, StorageError> {
        if navs.is_empty() {
            return Ok(NavUpsertSummary::default());
        }

        let batch = |source| StorageError::Batch {
            table: "product_navs",
            source,
        };
        let tx = self.conn.unchecked_transaction().map_err(batch)?;
        let summary = write_navs(&tx, navs, processing_date, Local::now().naive_local())
            .map_err(batch)?;
        tx.commit().map_err(batch)?;

        info!(
            "Saved {} NAV rows (new: {}, updated: {}, unchanged: {}, skipped: {})",
            summary.saved(),
            summary.inserted,
            summary.updated,
            summary.unchanged,
            summary.skipped
        );
        Ok(summary)
    }

    pub fn nav_count(&self) -> Result<i64, StorageError> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM product_navs")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn latest_nav(&self, code: &str) -> Result<Option<StoredNav>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NAV_COLUMNS} FROM product_navs WHERE product_code = ? \
             ORDER BY nav_date DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![code], nav_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn nav_on(&self, code: &str, date: NaiveDate) -> Result<Option<StoredNav>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {NAV_COLUMNS} FROM product_navs WHERE product_code = ? AND nav_date = ?"
        ))?;
        let mut rows = stmt.query_map(params![code, date], nav_from_row)?;
        Ok(rows.next().transpose()?)
    }

    // ── Export projections ────────────────────────────────────────────────────

    pub fn export_products(&self) -> Result<Vec<StoredProduct>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM v_products ORDER BY product_code"
        ))?;
        let rows = stmt
            .query_map([], product_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_navs(&self) -> Result<Vec<NavExportRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT product_code, product_id, product_name, nav_date,
                      initial_nav, accumulated_nav, current_nav,
                      is_updated, last_update_date, crawl_time, created_at, updated_at
               FROM v_product_navs
               ORDER BY product_code, nav_date DESC"#,
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(NavExportRow {
                    product_code: r.get(0)?,
                    product_id: r.get(1)?,
                    product_name: r.get(2)?,
                    nav_date: r.get(3)?,
                    initial_nav: r.get(4)?,
                    accumulated_nav: r.get(5)?,
                    current_nav: r.get(6)?,
                    is_updated: r.get(7)?,
                    last_update_date: r.get(8)?,
                    crawl_time: r.get(9)?,
                    created_at: r.get(10)?,
                    updated_at: r.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn export_combined(&self) -> Result<Vec<CombinedRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT product_id, product_code, product_name, issuer, risk_level,
                      product_type, currency, investment_period, min_investment,
                      start_date, end_date, product_category, income_type,
                      nav_date, initial_nav, accumulated_nav, current_nav
               FROM v_products_combined
               ORDER BY product_code, nav_date DESC NULLS LAST"#,
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(CombinedRow {
                    product_id: r.get(0)?,
                    product_code: r.get(1)?,
                    product_name: r.get(2)?,
                    issuer: r.get(3)?,
                    risk_level: r.get(4)?,
                    product_type: r.get(5)?,
                    currency: r.get(6)?,
                    investment_period: r.get(7)?,
                    min_investment: r.get(8)?,
                    start_date: r.get(9)?,
                    end_date: r.get(10)?,
                    product_category: r.get(11)?,
                    income_type: r.get(12)?,
                    nav_date: r.get(13)?,
                    initial_nav: r.get(14)?,
                    accumulated_nav: r.get(15)?,
                    current_nav: r.get(16)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Harvest run log ───────────────────────────────────────────────────────

    pub fn begin_harvest_run(&self) -> Result<i64, StorageError> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO harvest_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![Local::now().naive_local()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_harvest_run(
        &self,
        run_id: i64,
        pages_attempted: u32,
        pages_failed: u32,
        products: usize,
        navs: usize,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            r#"UPDATE harvest_runs SET
               finished_at = ?, status = ?,
               pages_attempted = ?, pages_failed = ?,
               products_saved = ?, navs_saved = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Local::now().naive_local(),
                if error.is_none() { "success" } else { "error" },
                pages_attempted as i64,
                pages_failed as i64,
                products as i64,
                navs as i64,
                error,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn last_harvest_run(&self) -> Result<Option<HarvestRun>, StorageError> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, started_at, finished_at, status, pages_attempted, pages_failed,
                      products_saved, navs_saved, error_msg
               FROM harvest_runs ORDER BY id DESC LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map([], |r| {
            Ok(HarvestRun {
                id: r.get(0)?,
                started_at: r.get(1)?,
                finished_at: r.get(2)?,
                status: r.get(3)?,
                pages_attempted: r.get(4)?,
                pages_failed: r.get(5)?,
                products_saved: r.get(6)?,
                navs_saved: r.get(7)?,
                error_msg: r.get(8)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

// ── Batch writers (run inside the caller's transaction) ───────────────────────

fn write_products(
    tx: &Transaction<'_>,
    products: &[Product],
    now: NaiveDateTime,
) -> duckdb::Result<usize> {
    let mut saved = 0;
    for p in products {
        if p.product_code.trim().is_empty() {
            warn!("Product without code skipped: {:?}", p.product_name);
            continue;
        }

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM products WHERE product_code = ?",
            params![p.product_code],
            |r| r.get(0),
        )?;

        if exists {
            // Every field but the key is overwritten; created_at is kept
            tx.execute(
                r#"UPDATE products SET
                       product_id = ?, product_name = ?, issuer = ?, issuer_code = ?,
                       risk_level = ?, risk_level_code = ?, product_type = ?,
                       product_type_code = ?, currency = ?, investment_period = ?,
                       min_investment = ?, sale_status = ?, sale_regions = ?,
                       start_date = ?, end_date = ?, product_category = ?,
                       income_type = ?, sale_method = ?, crawl_time = ?, updated_at = ?
                   WHERE product_code = ?"#,
                params![
                    p.product_id,
                    p.product_name,
                    p.issuer,
                    p.issuer_code,
                    p.risk_level,
                    p.risk_level_code,
                    p.product_type,
                    p.product_type_code,
                    p.currency,
                    p.investment_period,
                    p.min_investment,
                    p.sale_status,
                    p.sale_regions,
                    p.start_date,
                    p.end_date,
                    p.product_category,
                    p.income_type,
                    p.sale_method,
                    p.crawl_time,
                    now,
                    p.product_code,
                ],
            )?;
        } else {
            tx.execute(
                &format!(
                    "INSERT INTO products ({PRODUCT_COLUMNS}) VALUES \
                     (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    p.product_code,
                    p.product_id,
                    p.product_name,
                    p.issuer,
                    p.issuer_code,
                    p.risk_level,
                    p.risk_level_code,
                    p.product_type,
                    p.product_type_code,
                    p.currency,
                    p.investment_period,
                    p.min_investment,
                    p.sale_status,
                    p.sale_regions,
                    p.start_date,
                    p.end_date,
                    p.product_category,
                    p.income_type,
                    p.sale_method,
                    p.crawl_time,
                    now,
                    now,
                ],
            )?;
        }
        saved += 1;
    }
    Ok(saved)
}

fn write_navs(
    tx: &Transaction<'_>,
    navs: &[NavRecord],
    processing_date: NaiveDate,
    now: NaiveDateTime,
) -> duckdb::Result<NavUpsertSummary> {
    let mut summary = NavUpsertSummary::default();

    for nav in navs {
        let Ok(nav_date) = NaiveDate::parse_from_str(nav.nav_date.trim(), "%Y-%m-%d") else {
            warn!("{}: bad nav_date {:?}, skipped", nav.product_code, nav.nav_date);
            summary.skipped += 1;
            continue;
        };
        let values = nav.values.sanitized();
        if !values.has_any() {
            warn!("{} {}: no NAV values, skipped", nav.product_code, nav_date);
            summary.skipped += 1;
            continue;
        }

        let known_product: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM products WHERE product_code = ?",
            params![nav.product_code],
            |r| r.get(0),
        )?;
        if !known_product {
            warn!("{}: NAV for unknown product, skipped", nav.product_code);
            summary.skipped += 1;
            continue;
        }

        let existing = {
            let mut stmt = tx.prepare(
                r#"SELECT initial_nav, accumulated_nav, current_nav
                   FROM product_navs WHERE product_code = ? AND nav_date = ?"#,
            )?;
            let mut rows = stmt.query_map(params![nav.product_code, nav_date], |r| {
                Ok(NavValues {
                    initial_nav: r.get(0)?,
                    accumulated_nav: r.get(1)?,
                    current_nav: r.get(2)?,
                })
            })?;
            rows.next().transpose()?
        };

        match existing {
            Some(mut stored) => {
                if stored.absorb(&values) {
                    tx.execute(
                        r#"UPDATE product_navs SET
                               initial_nav = ?, accumulated_nav = ?, current_nav = ?,
                               is_updated = TRUE, last_update_date = ?, updated_at = ?
                           WHERE product_code = ? AND nav_date = ?"#,
                        params![
                            stored.initial_nav,
                            stored.accumulated_nav,
                            stored.current_nav,
                            processing_date,
                            now,
                            nav.product_code,
                            nav_date,
                        ],
                    )?;
                    summary.updated += 1;
                } else {
                    summary.unchanged += 1;
                }
            }
            None => {
                tx.execute(
                    &format!(
                        "INSERT INTO product_navs ({NAV_COLUMNS}) VALUES \
                         (?, ?, ?, ?, ?, ?, FALSE, NULL, ?, ?, ?)"
                    ),
                    params![
                        nav.product_code,
                        nav.product_id,
                        nav_date,
                        values.initial_nav,
                        values.accumulated_nav,
                        values.current_nav,
                        nav.crawl_time,
                        now,
                        now,
                    ],
                )?;
                summary.inserted += 1;
            }
        }
    }

    Ok(summary)
}

// ── Row mapping ───────────────────────────────────────────────────────────────

fn product_from_row(r: &Row<'_>) -> duckdb::Result<StoredProduct> {
    Ok(StoredProduct {
        product_code: r.get(0)?,
        product_id: r.get(1)?,
        product_name: r.get(2)?,
        issuer: r.get(3)?,
        issuer_code: r.get(4)?,
        risk_level: r.get(5)?,
        risk_level_code: r.get(6)?,
        product_type: r.get(7)?,
        product_type_code: r.get(8)?,
        currency: r.get(9)?,
        investment_period: r.get(10)?,
        min_investment: r.get(11)?,
        sale_status: r.get(12)?,
        sale_regions: r.get(13)?,
        start_date: r.get(14)?,
        end_date: r.get(15)?,
        product_category: r.get(16)?,
        income_type: r.get(17)?,
        sale_method: r.get(18)?,
        crawl_time: r.get(19)?,
        created_at: r.get(20)?,
        updated_at: r.get(21)?,
    })
}

fn nav_from_row(r: &Row<'_>) -> duckdb::Result<StoredNav> {
    Ok(StoredNav {
        product_code: r.get(0)?,
        product_id: r.get(1)?,
        nav_date: r.get(2)?,
        initial_nav: r.get(3)?,
        accumulated_nav: r.get(4)?,
        current_nav: r.get(5)?,
        is_updated: r.get(6)?,
        last_update_date: r.get(7)?,
        crawl_time: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}
