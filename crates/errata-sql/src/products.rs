//! Products, their upstream mirrors, and mirror repository metadata.

use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct SupportedProduct {
    pub id: i64,
    pub name: String,
    pub variant: String,
    pub vendor: String,
    /// Advisory-name prefix, e.g. `RL` turning `SA-2024:1234` into
    /// `RLSA-2024:1234`.
    pub code: String,
}

/// Mirror selects a slice of upstream advisories by
/// `(variant, major, minor, arch)` on behalf of one product.
#[derive(Debug, Clone, FromRow)]
pub struct Mirror {
    pub id: i64,
    pub supported_product_id: i64,
    pub name: String,
    pub match_variant: String,
    pub match_major_version: i32,
    pub match_minor_version: Option<i32>,
    pub match_arch: String,
    pub active: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Repomd {
    pub id: i64,
    pub mirror_id: i64,
    pub repo_name: String,
    pub arch: String,
    pub production: bool,
    pub url: String,
    pub debug_url: String,
    pub source_url: String,
}

/// Products that have at least one active mirror with repository
/// metadata configured; the matcher workflow iterates these.
pub async fn products_with_mirrors(db: impl sqlx::PgExecutor<'_>) -> sqlx::Result<Vec<i64>> {
    sqlx::query_scalar(
        r#"
        SELECT DISTINCT m.supported_product_id
        FROM mirrors m
        WHERE m.active
          AND EXISTS (SELECT 1 FROM repomds r WHERE r.mirror_id = m.id)
        ORDER BY m.supported_product_id
        "#,
    )
    .fetch_all(db)
    .await
}

pub async fn fetch_product(
    product_id: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<SupportedProduct>> {
    sqlx::query_as(
        "SELECT id, name, variant, vendor, code FROM supported_products WHERE id = $1",
    )
    .bind(product_id)
    .fetch_optional(db)
    .await
}

pub async fn fetch_product_by_name(
    name: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<SupportedProduct>> {
    sqlx::query_as(
        "SELECT id, name, variant, vendor, code FROM supported_products WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(db)
    .await
}

pub async fn active_mirrors(
    product_id: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<Mirror>> {
    sqlx::query_as(
        r#"
        SELECT id, supported_product_id, name, match_variant, match_major_version,
               match_minor_version, match_arch, active
        FROM mirrors
        WHERE supported_product_id = $1 AND active
        ORDER BY id
        "#,
    )
    .bind(product_id)
    .fetch_all(db)
    .await
}

pub async fn repomds_of_mirror(
    mirror_id: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<Repomd>> {
    sqlx::query_as(
        r#"
        SELECT id, mirror_id, repo_name, arch, production, url, debug_url, source_url
        FROM repomds
        WHERE mirror_id = $1
        ORDER BY id
        "#,
    )
    .bind(mirror_id)
    .fetch_all(db)
    .await
}
