//! Generation of DNF/YUM `updateinfo.xml` from stored downstream
//! advisories.
//!
//! The assembly itself (`assemble`) is free of I/O; `load_slice` feeds
//! it from the store. One (product, major, arch, repo) slice produces
//! one document.

use std::collections::HashMap;

use anyhow::Context;

use errata_sql::advisories::{
    self, Advisory, AdvisoryFixRow, AdvisoryPackageRow,
};

mod assemble;

pub use assemble::{assemble, slugify, update_type};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("XML assembly failed")]
    Xml(#[from] quick_xml::Error),
}

/// Presentation settings stamped into every `<update>` element.
#[derive(Debug, Clone)]
pub struct UpdateinfoMeta {
    /// The `from` attribute, conventionally the managing editor address.
    pub managing_editor: String,
    /// Company named in the `rights` line.
    pub company_name: String,
    /// Base URL for `self` references to the advisory pages.
    pub ui_url: String,
}

/// The closed product-slug map. Slugs are resolved case-insensitively;
/// arbitrary product names cannot be injected through the URL.
pub fn resolve_product_slug(slug: &str) -> Option<&'static str> {
    match slug.to_ascii_lowercase().as_str() {
        "rocky-linux" => Some("Rocky Linux"),
        "rocky-linux-sig-cloud" => Some("Rocky Linux SIG Cloud"),
        _ => None,
    }
}

/// All slugs of the closed map, for error messages.
pub fn known_product_slugs() -> &'static [&'static str] {
    &["rocky-linux", "rocky-linux-sig-cloud"]
}

/// AdvisoryContext is one advisory of a slice with everything the
/// assembler needs.
#[derive(Debug, Clone)]
pub struct AdvisoryContext {
    pub advisory: Advisory,
    pub arch: String,
    pub major_version: i32,
    pub minor_version: Option<i32>,
    pub supported_product_id: i64,
    pub product_name: String,
    pub cves: Vec<String>,
    pub fixes: Vec<AdvisoryFixRow>,
    pub packages: Vec<AdvisoryPackageRow>,
}

/// Load the advisory contexts of one (product, major[, minor], arch,
/// repo) slice. Returns an empty vector when the slice has no
/// advisories.
pub async fn load_slice(
    product_id: i64,
    major_version: i32,
    minor_version: Option<i32>,
    arch: &str,
    repo: &str,
    pool: &sqlx::PgPool,
) -> anyhow::Result<Vec<AdvisoryContext>> {
    let rows = advisories::updateinfo_slice(product_id, major_version, minor_version, arch, repo, pool)
        .await
        .context("querying affected products")?;

    // One context per advisory; the first affected-product row wins.
    let mut contexts: Vec<AdvisoryContext> = Vec::new();
    let mut by_advisory: HashMap<i64, usize> = HashMap::new();
    let advisory_ids: Vec<i64> = {
        let mut ids: Vec<i64> = rows.iter().map(|r| r.advisory_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };

    let advisory_rows = advisories::advisories_by_ids(&advisory_ids, pool)
        .await
        .context("loading advisories")?;
    let package_rows = advisories::packages_by_advisory_ids(&advisory_ids, pool)
        .await
        .context("loading advisory packages")?;
    let cve_rows = advisories::cves_by_advisory_ids(&advisory_ids, pool)
        .await
        .context("loading advisory CVEs")?;
    let fix_rows = advisories::fixes_by_advisory_ids(&advisory_ids, pool)
        .await
        .context("loading advisory fixes")?;

    let advisories_by_id: HashMap<i64, Advisory> =
        advisory_rows.into_iter().map(|a| (a.id, a)).collect();

    for row in rows {
        if by_advisory.contains_key(&row.advisory_id) {
            continue;
        }
        let Some(advisory) = advisories_by_id.get(&row.advisory_id) else {
            continue;
        };
        by_advisory.insert(row.advisory_id, contexts.len());
        contexts.push(AdvisoryContext {
            advisory: advisory.clone(),
            arch: row.arch,
            major_version: row.major_version,
            minor_version: row.minor_version,
            supported_product_id: row.supported_product_id,
            product_name: row.product_name,
            cves: Vec::new(),
            fixes: Vec::new(),
            packages: Vec::new(),
        });
    }

    for package in package_rows {
        if let Some(&position) = by_advisory.get(&package.advisory_id) {
            contexts[position].packages.push(package);
        }
    }
    for cve in cve_rows {
        if let Some(&position) = by_advisory.get(&cve.advisory_id) {
            contexts[position].cves.push(cve.cve);
        }
    }
    for fix in fix_rows {
        if let Some(&position) = by_advisory.get(&fix.advisory_id) {
            contexts[position].fixes.push(fix);
        }
    }

    Ok(contexts)
}
