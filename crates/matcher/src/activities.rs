//! Activity entry points invoked by the worker. Each is a side-effecting
//! function with an externally supplied deadline; errors within one
//! repomd or one advisory stay local to it.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use chrono::Utc;

use errata_sql::products::{self, Mirror, Repomd};
use errata_sql::upstream::{self, UpstreamAdvisory};
use errata_sql::{advisories, ledger};

use crate::cloner::{self, PendingClone};
use crate::index::{acceptable_arches, match_advisory, RepoIndex};
use crate::MatcherConfig;

/// Product ids that have at least one active mirror with repository
/// metadata; the matcher workflow fans out over these.
pub async fn list_products_with_mirrors(pool: &sqlx::PgPool) -> anyhow::Result<Vec<i64>> {
    products::products_with_mirrors(pool)
        .await
        .context("listing products with mirrors")
}

/// The ingester's high-water mark as an ISO-8601 string with a trailing
/// `Z`, or None before the first successful poll.
pub async fn get_last_indexed_at(pool: &sqlx::PgPool) -> anyhow::Result<Option<String>> {
    let last = upstream::last_indexed_at(pool)
        .await
        .context("reading index state")?;
    Ok(last.map(|ts| format!("{}Z", ts.format("%Y-%m-%dT%H:%M:%S%.6f"))))
}

/// Candidate advisories of one mirror, hydrated with their package
/// NEVRAs, CVEs, and fixes.
struct MirrorCandidates {
    advisories: Vec<UpstreamAdvisory>,
    nevras: HashMap<i64, Vec<String>>,
}

async fn load_candidates(
    mirror: &Mirror,
    config: &MatcherConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<MirrorCandidates> {
    let advisories = upstream::candidate_advisories(mirror, config.grace_days, pool)
        .await
        .context("collecting candidate advisories")?;
    let ids: Vec<i64> = advisories.iter().map(|a| a.id).collect();
    let nevras = upstream::packages_by_advisory(&ids, pool)
        .await
        .context("loading candidate packages")?;
    Ok(MirrorCandidates { advisories, nevras })
}

/// Read the binary, debug, and source views of one repomd row into a
/// single snapshot. Any failure aborts this repomd only.
async fn read_repomd(
    client: &reqwest::Client,
    row: &Repomd,
    limits: &repomd::Limits,
) -> Result<repomd::RepoSnapshot, repomd::Error> {
    let (mut binary, debug, source) = tokio::try_join!(
        repomd::read(client, &row.url, limits),
        repomd::read(client, &row.debug_url, limits),
        repomd::read(client, &row.source_url, limits),
    )?;
    binary.merge(debug);
    binary.merge(source);
    Ok(binary)
}

/// Match every candidate advisory of every active mirror of one product
/// against the mirror's repositories, clone the advisories that
/// matched, and block the candidates that did not.
pub async fn match_product(
    product_id: i64,
    config: &MatcherConfig,
    client: &reqwest::Client,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let product = products::fetch_product(product_id, pool)
        .await
        .context("fetching product")?
        .with_context(|| format!("product {product_id} does not exist"))?;
    let mirrors = products::active_mirrors(product_id, pool)
        .await
        .context("fetching mirrors")?;

    let dist = config.dist.compile();
    let limits = config.limits();

    // Aggregated per-advisory results, in first-seen (issued_at) order.
    let mut pending: Vec<PendingClone> = Vec::new();
    let mut pending_by_id: HashMap<i64, usize> = HashMap::new();
    // Candidate ids per mirror, for the zero-match blocking pass.
    let mut candidates_by_mirror: Vec<(Mirror, Vec<i64>)> = Vec::new();

    for mirror in &mirrors {
        tracing::info!(product = %product.name, mirror = %mirror.name, "processing mirror");
        let candidates = load_candidates(mirror, config, pool).await?;
        if candidates.advisories.is_empty() {
            continue;
        }

        let arches = acceptable_arches(&mirror.match_arch, &dist);
        let repomds = products::repomds_of_mirror(mirror.id, pool)
            .await
            .context("fetching repomds")?;

        for repomd_row in &repomds {
            if repomd_row.arch != mirror.match_arch {
                tracing::debug!(
                    repo = %repomd_row.repo_name,
                    repo_arch = %repomd_row.arch,
                    mirror_arch = %mirror.match_arch,
                    "skipping repomd with mismatched arch"
                );
                continue;
            }

            let snapshot = match read_repomd(client, repomd_row, &limits).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    tracing::warn!(
                        product = %product.name,
                        mirror = %mirror.name,
                        url = %repomd_row.url,
                        %err,
                        "failed to read repomd; skipping it"
                    );
                    continue;
                }
            };
            let repo_index = RepoIndex::build(snapshot, &dist);
            let published_at = repomd_row.production.then(Utc::now);

            for advisory in &candidates.advisories {
                let Some(nevras) = candidates.nevras.get(&advisory.id) else {
                    continue;
                };
                let matches = match_advisory(
                    nevras,
                    &repo_index,
                    &arches,
                    &repomd_row.repo_name,
                    mirror.id,
                    &dist,
                );
                if matches.is_empty() {
                    continue;
                }

                let position = match pending_by_id.get(&advisory.id) {
                    Some(&position) => position,
                    None => {
                        pending.push(PendingClone {
                            advisory: advisory.clone(),
                            cves: Vec::new(),
                            fixes: Vec::new(),
                            mirrors: Vec::new(),
                            packages: Vec::new(),
                            published_at: None,
                        });
                        pending_by_id.insert(advisory.id, pending.len() - 1);
                        pending.len() - 1
                    }
                };
                let entry = &mut pending[position];
                entry.packages.extend(matches);
                if entry.published_at.is_none() {
                    entry.published_at = published_at;
                }
                if !entry.mirrors.iter().any(|m| m.id == mirror.id) {
                    entry.mirrors.push(mirror.clone());
                }
            }
        }

        candidates_by_mirror.push((
            mirror.clone(),
            candidates.advisories.iter().map(|a| a.id).collect(),
        ));
    }

    // Hydrate CVEs and fixes for the advisories that will be cloned.
    let matched_ids: Vec<i64> = pending.iter().map(|p| p.advisory.id).collect();
    if !matched_ids.is_empty() {
        let cves = upstream::cves_by_advisory(&matched_ids, pool)
            .await
            .context("loading candidate CVEs")?;
        let fixes = upstream::fixes_by_advisory(&matched_ids, pool)
            .await
            .context("loading candidate fixes")?;
        for cve in cves {
            if let Some(&position) = pending_by_id.get(&cve.upstream_advisory_id) {
                pending[position].cves.push(cve);
            }
        }
        for fix in fixes {
            if let Some(&position) = pending_by_id.get(&fix.upstream_advisory_id) {
                pending[position].fixes.push(fix);
            }
        }
    }

    // Clone matched advisories. A cloner failure is local to its
    // advisory and, having rolled back, leaves no Block behind.
    let mut cloned: HashSet<i64> = HashSet::new();
    for clone in &pending {
        match cloner::clone_advisory(&product, clone, config, pool).await {
            Ok(()) => {
                cloned.insert(clone.advisory.id);
            }
            Err(err) => {
                tracing::error!(
                    product = %product.name,
                    advisory = %clone.advisory.name,
                    err = format!("{err:#}"),
                    "failed to clone advisory"
                );
            }
        }
    }

    // Block candidates that produced zero matches anywhere. The insert
    // keeps any existing row's created_at, so a block inside its grace
    // window does not restart the clock.
    for (mirror, candidate_ids) in &candidates_by_mirror {
        let unmatched: Vec<i64> = candidate_ids
            .iter()
            .copied()
            .filter(|id| !pending_by_id.contains_key(id))
            .collect();
        if unmatched.is_empty() {
            continue;
        }
        tracing::info!(
            product = %product.name,
            mirror = %mirror.name,
            advisories = unmatched.len(),
            "blocking unmatched candidate advisories"
        );
        ledger::insert_blocks(mirror.id, &unmatched, pool)
            .await
            .context("blocking unmatched advisories")?;
    }

    tracing::info!(
        product = %product.name,
        matched = pending.len(),
        cloned = cloned.len(),
        "finished matching product"
    );
    Ok(())
}

/// Defunct-product sweep. With `block_all_on_defunct` set (the
/// preserved behavior) every candidate advisory of every mirror is
/// blocked, matched or not; otherwise candidates that already produced
/// a downstream advisory for this product are left alone.
pub async fn block_unmatched_for_product(
    product_id: i64,
    config: &MatcherConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let product = products::fetch_product(product_id, pool)
        .await
        .context("fetching product")?
        .with_context(|| format!("product {product_id} does not exist"))?;
    let mirrors = products::active_mirrors(product_id, pool)
        .await
        .context("fetching mirrors")?;

    for mirror in &mirrors {
        let candidates = upstream::candidate_advisories(mirror, config.grace_days, pool)
            .await
            .context("collecting candidate advisories")?;

        let mut to_block = Vec::new();
        for advisory in &candidates {
            if !config.block_all_on_defunct
                && advisories::downstream_exists(advisory.id, product_id, pool)
                    .await
                    .context("checking downstream advisory")?
            {
                continue;
            }
            to_block.push(advisory.id);
        }

        tracing::info!(
            product = %product.name,
            mirror = %mirror.name,
            advisories = to_block.len(),
            "blocking advisories for defunct mirror"
        );
        ledger::insert_blocks(mirror.id, &to_block, pool)
            .await
            .context("inserting blocks")?;
    }

    Ok(())
}
