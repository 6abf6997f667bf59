//! Transactional cloning of a matched upstream advisory into a
//! downstream advisory.

use anyhow::Context;
use chrono::{DateTime, Utc};

use errata_sql::advisories::{self, NewAdvisory, NewAffectedProduct, NewPackage};
use errata_sql::ledger;
use errata_sql::products::{Mirror, SupportedProduct};
use errata_sql::upstream::{UpstreamAdvisory, UpstreamCve, UpstreamFix};

use crate::index::MatchedPackage;
use crate::MatcherConfig;

/// PendingClone is one advisory's aggregated match result across all of
/// a product's mirrors.
#[derive(Debug)]
pub struct PendingClone {
    pub advisory: UpstreamAdvisory,
    pub cves: Vec<UpstreamCve>,
    pub fixes: Vec<UpstreamFix>,
    /// Mirrors that matched the advisory, deduplicated by id.
    pub mirrors: Vec<Mirror>,
    pub packages: Vec<MatchedPackage>,
    /// Set iff a production repomd contributed a match.
    pub published_at: Option<DateTime<Utc>>,
}

/// Downstream advisory name: the product code prefixed to the upstream
/// name with its vendor letters stripped (`RHSA-2024:1234` under code
/// `XL` becomes `XLSA-2024:1234`).
pub fn downstream_name(code: &str, upstream_name: &str, vendor_prefix: &str) -> String {
    format!(
        "{code}{}",
        upstream_name
            .strip_prefix(vendor_prefix)
            .unwrap_or(upstream_name)
    )
}

/// Rewrite upstream advisory text for the downstream product: variant
/// names become the product name, the vendor becomes the product
/// vendor, container image fragments are dropped, and the upstream
/// advisory name becomes the downstream one.
fn rewrite_text(
    text: &str,
    product: &SupportedProduct,
    upstream_name: &str,
    new_name: &str,
    config: &MatcherConfig,
) -> String {
    let container_re = regex::Regex::new(&format!(
        r"{}(?:\d|)/",
        regex::escape(&config.upstream_variant_short.to_lowercase())
    ))
    .expect("container fragment pattern is valid");

    let text = text.replace(&config.upstream_variant, &product.name);
    let text = text.replace(&config.upstream_variant_short, &product.name);
    let text = container_re.replace_all(&text, "");
    let text = text.replace(&config.upstream_vendor, &product.vendor);
    text.replace(upstream_name, new_name)
}

fn synthesize_topic(package_names: &[String], affected_products: &[String]) -> String {
    format!(
        "An update is available for {}.\n\
         This update affects {}.\n\
         A Common Vulnerability Scoring System (CVSS) base score, which gives a \
         detailed severity rating, is available for each vulnerability from the CVE list",
        package_names.join(", "),
        affected_products.join(", "),
    )
}

/// Resolve the rows to insert for the accepted repository packages.
/// Packages whose source-RPM name cannot be determined are reported and
/// skipped.
fn resolve_packages(clone: &PendingClone, product: &SupportedProduct) -> Vec<NewPackage> {
    let mut packages = Vec::new();

    for matched in &clone.packages {
        let package = &matched.package;
        let source_name = if package.arch == "src" {
            Some(package.name.clone())
        } else {
            package
                .source_rpm
                .as_deref()
                .map(|src| src.strip_suffix(".rpm").unwrap_or(src))
                .and_then(nevra::package_name)
                .map(str::to_string)
        };
        let Some(package_name) = source_name else {
            tracing::warn!(
                advisory = %clone.advisory.name,
                nevra = %package.nevra(),
                "skipping package without a resolvable source RPM name"
            );
            continue;
        };

        packages.push(NewPackage {
            nevra: format!("{}.rpm", package.nevra()),
            checksum: package.checksum.clone(),
            checksum_type: package.checksum_type.clone(),
            module_name: matched.module.as_ref().map(|m| m.name.clone()),
            module_stream: matched.module.as_ref().map(|m| m.stream.clone()),
            module_version: matched.module.as_ref().map(|m| m.version.clone()),
            module_context: matched.module.as_ref().map(|m| m.context.clone()),
            repo_name: matched.repo_name.clone(),
            package_name,
            mirror_id: matched.mirror_id,
            supported_product_id: product.id,
        })
    }

    packages
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|err| err.as_database_error())
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

/// Clone one advisory. All rows commit together; a failure leaves no
/// trace, including no Block. A name race with a concurrent cloner is
/// retried once through the upsert.
pub async fn clone_advisory(
    product: &SupportedProduct,
    clone: &PendingClone,
    config: &MatcherConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    match clone_advisory_once(product, clone, config, pool).await {
        Err(err) if is_unique_violation(&err) => {
            tracing::warn!(
                advisory = %clone.advisory.name,
                "advisory name raced with a concurrent cloner; retrying"
            );
            clone_advisory_once(product, clone, config, pool).await
        }
        result => result,
    }
}

async fn clone_advisory_once(
    product: &SupportedProduct,
    clone: &PendingClone,
    config: &MatcherConfig,
    pool: &sqlx::PgPool,
) -> anyhow::Result<()> {
    let upstream = &clone.advisory;
    tracing::info!(advisory = %upstream.name, product = %product.name, "cloning advisory");

    let new_packages = resolve_packages(clone, product);
    anyhow::ensure!(
        !new_packages.is_empty(),
        "no packages resolved for {}",
        upstream.name
    );

    let name = downstream_name(&product.code, &upstream.name, &config.advisory_prefix);
    let synopsis = rewrite_text(&upstream.synopsis, product, &upstream.name, &name, config);
    let description = rewrite_text(
        upstream.description.as_deref().unwrap_or(""),
        product,
        &upstream.name,
        &name,
        config,
    );
    let topic = rewrite_text(
        upstream.topic.as_deref().unwrap_or(""),
        product,
        &upstream.name,
        &name,
        config,
    );

    let mut txn = pool.begin().await.context("beginning clone transaction")?;

    let advisory = advisories::upsert_advisory(
        &NewAdvisory {
            name: &name,
            synopsis: &synopsis,
            description: &description,
            kind: upstream.kind,
            severity: &upstream.severity,
            topic: &topic,
            published_at: clone.published_at,
            upstream_advisory_id: upstream.id,
        },
        &mut txn,
    )
    .await
    .context("upserting downstream advisory")?;

    advisories::insert_packages(advisory.id, &new_packages, &mut txn)
        .await
        .context("inserting packages")?;

    advisories::insert_cves(advisory.id, &clone.cves, &mut txn)
        .await
        .context("inserting CVEs")?;

    for fix in &clone.fixes {
        let source = format!(
            "https://bugzilla.redhat.com/show_bug.cgi?id={}",
            fix.ticket_id
        );
        advisories::insert_fix(
            advisory.id,
            &fix.ticket_id,
            &source,
            fix.description.as_deref(),
            &mut txn,
        )
        .await
        .context("inserting fixes")?;
    }

    for mirror in &clone.mirrors {
        advisories::insert_affected_product(
            advisory.id,
            &NewAffectedProduct {
                variant: &product.name,
                name: &mirror.name,
                major_version: mirror.match_major_version,
                minor_version: mirror.match_minor_version,
                arch: &mirror.match_arch,
                supported_product_id: mirror.supported_product_id,
            },
            &mut txn,
        )
        .await
        .context("inserting affected products")?;
    }

    if advisory.topic.is_empty() {
        let mut package_names: Vec<String> =
            new_packages.iter().map(|p| p.package_name.clone()).collect();
        package_names.sort();
        package_names.dedup();

        let mut affected: Vec<String> = clone
            .mirrors
            .iter()
            .map(|m| format!("{} {}", product.name, m.match_major_version))
            .collect();
        affected.sort();
        affected.dedup();

        advisories::update_topic(
            advisory.id,
            &synthesize_topic(&package_names, &affected),
            &mut txn,
        )
        .await
        .context("synthesizing topic")?;
    }

    // Terminal: the advisory is never reattempted on these mirrors.
    for mirror in &clone.mirrors {
        ledger::insert_blocks(mirror.id, &[upstream.id], &mut txn)
            .await
            .context("inserting blocks")?;
    }

    let mirror_ids: Vec<i64> = clone.mirrors.iter().map(|m| m.id).collect();
    ledger::stamp_overrides(&mirror_ids, upstream.id, &mut txn)
        .await
        .context("stamping overrides")?;

    txn.commit().await.context("committing clone transaction")?;

    tracing::info!(
        advisory = %name,
        product = %product.name,
        packages = new_packages.len(),
        mirrors = clone.mirrors.len(),
        "cloned advisory"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use errata_sql::AdvisoryKind;
    use repomd::RpmPackage;

    fn product() -> SupportedProduct {
        SupportedProduct {
            id: 2,
            name: "Rocky Linux".to_string(),
            variant: "Rocky Linux".to_string(),
            vendor: "Rocky Enterprise Software Foundation".to_string(),
            code: "RL".to_string(),
        }
    }

    #[test]
    fn downstream_name_shape() {
        assert_eq!(downstream_name("RL", "RHSA-2024:1234", "RH"), "RLSA-2024:1234");
        assert_eq!(downstream_name("XL", "RHBA-2023:0042", "RH"), "XLBA-2023:0042");
        // A name without the vendor prefix passes through untouched.
        assert_eq!(downstream_name("RL", "SA-2024:1", "RH"), "RLSA-2024:1");
    }

    #[test]
    fn text_rewriting_covers_variant_vendor_and_name() {
        let config = MatcherConfig::default();
        let rewritten = rewrite_text(
            "Red Hat Enterprise Linux 9 update RHSA-2024:1234: rhel9/httpd \
             container and RHEL module fixes released by Red Hat",
            &product(),
            "RHSA-2024:1234",
            "RLSA-2024:1234",
            &config,
        );
        assert_eq!(
            rewritten,
            "Rocky Linux 9 update RLSA-2024:1234: httpd container and \
             Rocky Linux module fixes released by Rocky Enterprise Software Foundation",
        );
    }

    #[test]
    fn topic_synthesis_lists_packages_and_products() {
        let topic = synthesize_topic(
            &["bash".to_string(), "redis".to_string()],
            &["Rocky Linux 9".to_string()],
        );
        assert!(topic.starts_with("An update is available for bash, redis.\n"));
        assert!(topic.contains("This update affects Rocky Linux 9.\n"));
    }

    fn matched(package: RpmPackage) -> MatchedPackage {
        MatchedPackage {
            package,
            module: None,
            repo_name: "BaseOS".to_string(),
            mirror_id: 11,
        }
    }

    fn pending(packages: Vec<MatchedPackage>) -> PendingClone {
        PendingClone {
            advisory: UpstreamAdvisory {
                id: 5,
                name: "RHSA-2024:1234".to_string(),
                issued_at: Utc::now(),
                synopsis: "Important: bash security update".to_string(),
                description: None,
                kind: AdvisoryKind::Security,
                severity: "Important".to_string(),
                topic: None,
            },
            cves: Vec::new(),
            fixes: Vec::new(),
            mirrors: Vec::new(),
            packages,
            published_at: None,
        }
    }

    #[test]
    fn package_resolution_takes_source_rpm_name() {
        let clone = pending(vec![matched(RpmPackage {
            name: "bash-doc".to_string(),
            epoch: "0".to_string(),
            version: "5.1.8".to_string(),
            release: "6.el9".to_string(),
            arch: "noarch".to_string(),
            checksum: "aa".to_string(),
            checksum_type: "sha256".to_string(),
            source_rpm: Some("bash-5.1.8-6.el9.src.rpm".to_string()),
        })]);

        let packages = resolve_packages(&clone, &product());
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].package_name, "bash");
        assert_eq!(packages[0].nevra, "bash-doc-0:5.1.8-6.el9.noarch.rpm");
        assert_eq!(packages[0].supported_product_id, 2);
        assert_eq!(packages[0].mirror_id, 11);
    }

    #[test]
    fn source_package_names_itself() {
        let clone = pending(vec![matched(RpmPackage {
            name: "bash".to_string(),
            epoch: "0".to_string(),
            version: "5.1.8".to_string(),
            release: "6.el9".to_string(),
            arch: "src".to_string(),
            checksum: "aa".to_string(),
            checksum_type: "sha256".to_string(),
            source_rpm: None,
        })]);

        let packages = resolve_packages(&clone, &product());
        assert_eq!(packages[0].package_name, "bash");
    }

    #[test]
    fn package_without_source_rpm_is_dropped() {
        let clone = pending(vec![matched(RpmPackage {
            name: "mystery".to_string(),
            epoch: "0".to_string(),
            version: "1".to_string(),
            release: "1.el9".to_string(),
            arch: "x86_64".to_string(),
            checksum: "aa".to_string(),
            checksum_type: "sha256".to_string(),
            source_rpm: None,
        })]);

        assert!(resolve_packages(&clone, &product()).is_empty());
    }
}
