//! The per-(mirror, upstream advisory) block/override ledger.
//!
//! A Block means "do not reattempt": terminal once a clone succeeded,
//! and otherwise only effective once it is older than the grace window,
//! which gives the downstream repositories time to publish the rebuild.
//! A pending Override (NULL `updated_at`) forces a candidate in
//! regardless of selector or block, and is stamped when consumed.
//! The grace predicate itself lives in
//! [`crate::upstream::candidate_advisories`], the one read of the
//! ledger.

/// Insert Block rows, keeping the original `created_at` of any that
/// already exist so the grace window is never restarted.
pub async fn insert_blocks(
    mirror_id: i64,
    upstream_advisory_ids: &[i64],
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    if upstream_advisory_ids.is_empty() {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO mirror_blocks (mirror_id, upstream_advisory_id)
        SELECT $1, advisory_id FROM UNNEST($2::BIGINT[]) AS advisory_id
        ON CONFLICT (mirror_id, upstream_advisory_id) DO NOTHING
        "#,
    )
    .bind(mirror_id)
    .bind(upstream_advisory_ids)
    .execute(db)
    .await?;
    Ok(())
}

/// Stamp the pending overrides that drove an advisory's inclusion.
pub async fn stamp_overrides(
    mirror_ids: &[i64],
    upstream_advisory_id: i64,
    db: impl sqlx::PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        UPDATE mirror_overrides
        SET updated_at = NOW()
        WHERE upstream_advisory_id = $1
          AND mirror_id = ANY($2)
          AND updated_at IS NULL
        "#,
    )
    .bind(upstream_advisory_id)
    .bind(mirror_ids)
    .execute(db)
    .await?;
    Ok(())
}
