//! Upstream advisories as written by the ingestion workers. The matcher
//! only ever reads these tables.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::AdvisoryKind;
use crate::products::Mirror;

#[derive(Debug, Clone, FromRow)]
pub struct UpstreamAdvisory {
    pub id: i64,
    pub name: String,
    pub issued_at: DateTime<Utc>,
    pub synopsis: String,
    pub description: Option<String>,
    pub kind: AdvisoryKind,
    pub severity: String,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UpstreamCve {
    pub upstream_advisory_id: i64,
    pub cve: String,
    pub cvss3_scoring_vector: Option<String>,
    pub cvss3_base_score: Option<String>,
    pub cwe: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UpstreamFix {
    pub upstream_advisory_id: i64,
    pub ticket_id: String,
    pub description: Option<String>,
}

/// Candidate advisories for one mirror, `issued_at` ascending:
/// advisories whose affected products match the mirror selector, plus
/// any with a pending override, minus those blocked past the grace
/// window, restricted to advisories that carry packages.
pub async fn candidate_advisories(
    mirror: &Mirror,
    grace_days: i32,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<UpstreamAdvisory>> {
    sqlx::query_as(
        r#"
        WITH override_ids AS (
            SELECT upstream_advisory_id
            FROM mirror_overrides
            WHERE mirror_id = $1 AND updated_at IS NULL
        ),
        blocked_ids AS (
            SELECT upstream_advisory_id
            FROM mirror_blocks
            WHERE mirror_id = $1
              AND created_at <= NOW() - make_interval(days => $2)
              AND upstream_advisory_id NOT IN (SELECT upstream_advisory_id FROM override_ids)
        ),
        selector_ids AS (
            SELECT DISTINCT ua.id
            FROM upstream_advisories ua
            JOIN upstream_advisory_affected_products ap
              ON ap.upstream_advisory_id = ua.id
            WHERE ap.variant = $3
              AND ap.major_version = $4
              AND ap.minor_version IS NOT DISTINCT FROM $5
              AND ap.arch = $6
        )
        SELECT ua.id, ua.name, ua.issued_at, ua.synopsis, ua.description,
               ua.kind, ua.severity, ua.topic
        FROM upstream_advisories ua
        WHERE (ua.id IN (SELECT id FROM selector_ids)
               OR ua.id IN (SELECT upstream_advisory_id FROM override_ids))
          AND ua.id NOT IN (SELECT upstream_advisory_id FROM blocked_ids)
          AND EXISTS (
              SELECT 1 FROM upstream_advisory_packages p
              WHERE p.upstream_advisory_id = ua.id
          )
        ORDER BY ua.issued_at ASC
        "#,
    )
    .bind(mirror.id)
    .bind(grace_days)
    .bind(&mirror.match_variant)
    .bind(mirror.match_major_version)
    .bind(mirror.match_minor_version)
    .bind(&mirror.match_arch)
    .fetch_all(db)
    .await
}

/// NEVRAs of the given advisories, keyed by advisory id.
pub async fn packages_by_advisory(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<HashMap<i64, Vec<String>>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT upstream_advisory_id, nevra
        FROM upstream_advisory_packages
        WHERE upstream_advisory_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await?;

    let mut map: HashMap<i64, Vec<String>> = HashMap::new();
    for (advisory_id, nevra) in rows {
        map.entry(advisory_id).or_default().push(nevra);
    }
    Ok(map)
}

pub async fn cves_by_advisory(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<UpstreamCve>> {
    sqlx::query_as(
        r#"
        SELECT upstream_advisory_id, cve, cvss3_scoring_vector, cvss3_base_score, cwe
        FROM upstream_advisory_cves
        WHERE upstream_advisory_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await
}

pub async fn fixes_by_advisory(
    advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Vec<UpstreamFix>> {
    sqlx::query_as(
        r#"
        SELECT upstream_advisory_id, ticket_id, description
        FROM upstream_advisory_fixes
        WHERE upstream_advisory_id = ANY($1)
        ORDER BY id
        "#,
    )
    .bind(advisory_ids)
    .fetch_all(db)
    .await
}

/// High-water mark of the upstream ingester, or None before the first
/// successful poll.
pub async fn last_indexed_at(
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    let row: Option<(Option<DateTime<Utc>>,)> =
        sqlx::query_as("SELECT last_indexed_at FROM index_state ORDER BY id LIMIT 1")
            .fetch_optional(db)
            .await?;
    Ok(row.and_then(|(ts,)| ts))
}
