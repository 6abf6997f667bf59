//! Downstream advisories: the cloner's transactional writes and the
//! updateinfo read slice.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::AdvisoryKind;

#[derive(Debug, Clone, FromRow)]
pub struct Advisory {
    pub id: i64,
    pub name: String,
    pub synopsis: String,
    pub description: String,
    pub kind: AdvisoryKind,
    pub severity: String,
    pub topic: String,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAdvisory<'a> {
    pub name: &'a str,
    pub synopsis: &'a str,
    pub description: &'a str,
    pub kind: AdvisoryKind,
    pub severity: &'a str,
    pub topic: &'a str,
    pub published_at: Option<DateTime<Utc>>,
    pub upstream_advisory_id: i64,
}

/// Upsert a downstream advisory by its unique name. An existing row is
/// preserved; only previously-empty fields (`published_at`, `topic`)
/// are filled in. Concurrent cloners race on the name constraint rather
/// than on locks.
pub async fn upsert_advisory(
    advisory: &NewAdvisory<'_>,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<Advisory> {
    sqlx::query_as(
        r#"
        INSERT INTO advisories
            (name, synopsis, description, kind, severity, topic, published_at,
             upstream_advisory_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (name) DO UPDATE SET
            updated_at = NOW(),
            published_at = COALESCE(advisories.published_at, EXCLUDED.published_at),
            topic = CASE WHEN advisories.topic = '' THEN EXCLUDED.topic
                         ELSE advisories.topic END
        RETURNING id, name, synopsis, description, kind, severity, topic,
                  published_at, updated_at
        "#,
    )
    .bind(advisory.name)
    .bind(advisory.synopsis)
    .bind(advisory.description)
    .bind(advisory.kind)
    .bind(advisory.severity)
    .bind(advisory.topic)
    .bind(advisory.published_at)
    .bind(advisory.upstream_advisory_id)
    .fetch_one(txn)
    .await
}

#[derive(Debug, Clone)]
pub struct NewPackage {
    pub nevra: String,
    pub checksum: String,
    pub checksum_type: String,
    pub module_name: Option<String>,
    pub module_stream: Option<String>,
    pub module_version: Option<String>,
    pub module_context: Option<String>,
    pub repo_name: String,
    pub package_name: String,
    pub mirror_id: i64,
    pub supported_product_id: i64,
}

pub async fn insert_packages(
    advisory_id: i64,
    packages: &[NewPackage],
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    for package in packages {
        sqlx::query(
            r#"
            INSERT INTO advisory_packages
                (advisory_id, nevra, checksum, checksum_type, module_name,
                 module_stream, module_version, module_context, repo_name,
                 package_name, mirror_id, supported_product_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (advisory_id, nevra) DO NOTHING
            "#,
        )
        .bind(advisory_id)
        .bind(&package.nevra)
        .bind(&package.checksum)
        .bind(&package.checksum_type)
        .bind(&package.module_name)
        .bind(&package.module_stream)
        .bind(&package.module_version)
        .bind(&package.module_context)
        .bind(&package.repo_name)
        .bind(&package.package_name)
        .bind(package.mirror_id)
        .bind(package.supported_product_id)
        .execute(&mut *txn)
        .await?;
    }
    Ok(())
}

pub async fn insert_cves(
    advisory_id: i64,
    cves: &[crate::upstream::UpstreamCve],
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    for cve in cves {
        sqlx::query(
            r#"
            INSERT INTO advisory_cves
                (advisory_id, cve, cvss3_scoring_vector, cvss3_base_score, cwe)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (advisory_id, cve) DO NOTHING
            "#,
        )
        .bind(advisory_id)
        .bind(&cve.cve)
        .bind(&cve.cvss3_scoring_vector)
        .bind(&cve.cvss3_base_score)
        .bind(&cve.cwe)
        .execute(&mut *txn)
        .await?;
    }
    Ok(())
}

pub async fn insert_fix(
    advisory_id: i64,
    ticket_id: &str,
    source: &str,
    description: Option<&str>,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO advisory_fixes (advisory_id, ticket_id, source, description)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (advisory_id, ticket_id) DO NOTHING
        "#,
    )
    .bind(advisory_id)
    .bind(ticket_id)
    .bind(source)
    .bind(description)
    .execute(txn)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewAffectedProduct<'a> {
    pub variant: &'a str,
    pub name: &'a str,
    pub major_version: i32,
    pub minor_version: Option<i32>,
    pub arch: &'a str,
    pub supported_product_id: i64,
}

pub async fn insert_affected_product(
    advisory_id: i64,
    affected: &NewAffectedProduct<'_>,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    // Guarded insert rather than ON CONFLICT: minor_version is nullable,
    // and NULLs never collide under a plain unique constraint.
    sqlx::query(
        r#"
        INSERT INTO advisory_affected_products
            (advisory_id, variant, name, major_version, minor_version, arch,
             supported_product_id)
        SELECT $1, $2, $3, $4, $5, $6, $7
        WHERE NOT EXISTS (
            SELECT 1 FROM advisory_affected_products
            WHERE advisory_id = $1
              AND variant = $2
              AND name = $3
              AND major_version = $4
              AND minor_version IS NOT DISTINCT FROM $5
              AND arch = $6
        )
        "#,
    )
    .bind(advisory_id)
    .bind(affected.variant)
    .bind(affected.name)
    .bind(affected.major_version)
    .bind(affected.minor_version)
    .bind(affected.arch)
    .bind(affected.supported_product_id)
    .execute(txn)
    .await?;
    Ok(())
}

pub async fn update_topic(
    advisory_id: i64,
    topic: &str,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE advisories SET topic = $2, updated_at = NOW() WHERE id = $1")
        .bind(advisory_id)
        .bind(topic)
        .execute(txn)
        .await?;
    Ok(())
}

/// One affected-product row of the updateinfo slice.
#[derive(Debug, Clone, FromRow)]
pub struct AffectedProductRow {
    pub advisory_id: i64,
    pub arch: String,
    pub major_version: i32,
    pub minor_version: Option<i32>,
    pub supported_product_id: i64,
    pub product_name: String,
}

/// Affected-product rows for one (product, major, arch, repo) slice.
/// The package-side product filter repeats the product id on purpose:
/// it is the read-side guard against cross-product contamination.
pub async fn updateinfo_slice(
    product_id: i64,
    major_version: i32,
    minor_version: Option<i32>,
    arch: &str,
    repo: &str,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<AffectedProductRow>> {
    sqlx::query_as(
        r#"
        SELECT DISTINCT ap.advisory_id, ap.arch, ap.major_version, ap.minor_version,
               ap.supported_product_id, sp.name AS product_name
        FROM advisory_affected_products ap
        JOIN supported_products sp ON sp.id = ap.supported_product_id
        WHERE ap.supported_product_id = $1
          AND ap.major_version = $2
          AND ($3::INT IS NULL OR ap.minor_version = $3)
          AND ap.arch = $4
          AND EXISTS (
              SELECT 1 FROM advisory_packages p
              WHERE p.advisory_id = ap.advisory_id
                AND p.repo_name = $5
                AND p.supported_product_id = $1
          )
        ORDER BY ap.advisory_id
        "#,
    )
    .bind(product_id)
    .bind(major_version)
    .bind(minor_version)
    .bind(arch)
    .bind(repo)
    .fetch_all(db)
    .await
}

pub async fn advisories_by_ids(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<Advisory>> {
    sqlx::query_as(
        r#"
        SELECT id, name, synopsis, description, kind, severity, topic,
               published_at, updated_at
        FROM advisories
        WHERE id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await
}

#[derive(Debug, Clone, FromRow)]
pub struct AdvisoryPackageRow {
    pub advisory_id: i64,
    pub nevra: String,
    pub checksum: String,
    pub checksum_type: String,
    pub module_name: Option<String>,
    pub module_stream: Option<String>,
    pub module_version: Option<String>,
    pub module_context: Option<String>,
    pub repo_name: String,
    pub package_name: String,
    pub supported_product_id: i64,
}

pub async fn packages_by_advisory_ids(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<AdvisoryPackageRow>> {
    sqlx::query_as(
        r#"
        SELECT advisory_id, nevra, checksum, checksum_type, module_name,
               module_stream, module_version, module_context, repo_name,
               package_name, supported_product_id
        FROM advisory_packages
        WHERE advisory_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await
}

#[derive(Debug, Clone, FromRow)]
pub struct AdvisoryCveRow {
    pub advisory_id: i64,
    pub cve: String,
}

pub async fn cves_by_advisory_ids(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<AdvisoryCveRow>> {
    sqlx::query_as(
        "SELECT advisory_id, cve FROM advisory_cves WHERE advisory_id = ANY($1) ORDER BY id",
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await
}

#[derive(Debug, Clone, FromRow)]
pub struct AdvisoryFixRow {
    pub advisory_id: i64,
    pub ticket_id: String,
    pub source: String,
    pub description: Option<String>,
}

pub async fn fixes_by_advisory_ids(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<AdvisoryFixRow>> {
    sqlx::query_as(
        r#"
        SELECT advisory_id, ticket_id, source, description
        FROM advisory_fixes
        WHERE advisory_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await
}

/// Whether a downstream advisory exists for `(upstream, product)`.
/// Used by the defunct sweep when `block_all_on_defunct` is off.
pub async fn downstream_exists(
    upstream_advisory_id: i64,
    supported_product_id: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM advisories a
            JOIN advisory_affected_products ap ON ap.advisory_id = a.id
            WHERE a.upstream_advisory_id = $1 AND ap.supported_product_id = $2
        )
        "#,
    )
    .bind(upstream_advisory_id)
    .bind(supported_product_id)
    .fetch_one(db)
    .await?;
    Ok(exists)
}
