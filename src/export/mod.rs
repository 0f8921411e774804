//! CSV export of the three read projections (products, NAVs, combined).

use crate::storage::Repository;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// UTF-8 BOM so spreadsheet tools pick the right encoding.
const BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug)]
pub struct ExportedFiles {
    pub products: PathBuf,
    pub navs: PathBuf,
    pub combined: PathBuf,
}

pub fn export_csv(repo: &Repository, dir: &Path, stamp: &str) -> Result<ExportedFiles> {
    std::fs::create_dir_all(dir).with_context(|| format!("Could not create dir {:?}", dir))?;

    let products = dir.join(format!("products_{}.csv", stamp));
    let n = write_rows(&products, &repo.export_products()?)?;
    info!("Exported {} products to {:?}", n, products);

    let navs = dir.join(format!("navs_{}.csv", stamp));
    let n = write_rows(&navs, &repo.export_navs()?)?;
    info!("Exported {} NAV rows to {:?}", n, navs);

    let combined = dir.join(format!("combined_{}.csv", stamp));
    let n = write_rows(&combined, &repo.export_combined()?)?;
    info!("Exported {} combined rows to {:?}", n, combined);

    Ok(ExportedFiles {
        products,
        navs,
        combined,
    })
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<usize> {
    let mut file = File::create(path).with_context(|| format!("Could not create {:?}", path))?;
    file.write_all(BOM)?;

    let mut writer = csv::Writer::from_writer(file);
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("Failed writing {:?}", path))?;
    }
    writer.flush()?;
    Ok(rows.len())
}
