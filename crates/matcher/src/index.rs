//! In-memory repository indexes and the package-matching core.
//!
//! This module is deliberately free of I/O: it consumes package records
//! already read from a repository and advisory NEVRAs already read from
//! the store, so the matching rules are testable without either.

use std::collections::{BTreeSet, HashMap, HashSet};

use nevra::DistTags;
use repomd::{ModuleBuild, RpmPackage};

/// MatchedPackage is a repository package accepted for an advisory,
/// annotated with where it came from.
#[derive(Debug, Clone)]
pub struct MatchedPackage {
    pub package: RpmPackage,
    pub module: Option<ModuleBuild>,
    pub repo_name: String,
    pub mirror_id: i64,
}

/// RepoIndex holds one repository's packages keyed for advisory
/// matching: by cleaned NEVRA for direct hits, and by package name for
/// the prefix fallback.
pub struct RepoIndex {
    packages: Vec<RpmPackage>,
    modules: HashMap<String, ModuleBuild>,
    by_cleaned: HashMap<String, Vec<usize>>,
    name_to_cleaned: HashMap<String, Vec<String>>,
}

impl RepoIndex {
    pub fn build(snapshot: repomd::RepoSnapshot, dist: &DistTags) -> Self {
        let repomd::RepoSnapshot { packages, modules } = snapshot;

        let mut by_cleaned: HashMap<String, Vec<usize>> = HashMap::new();
        let mut name_to_cleaned: HashMap<String, Vec<String>> = HashMap::new();

        for (position, package) in packages.iter().enumerate() {
            let raw = format!(
                "{}-{}-{}.{}",
                package.name, package.version, package.release, package.arch
            );
            let cleaned = nevra::clean_parts(
                &package.name,
                &package.version,
                &package.release,
                &package.arch,
                &raw,
                dist,
            );

            if let Some(name) = nevra::package_name(&cleaned.cleaned) {
                name_to_cleaned
                    .entry(name.to_string())
                    .or_default()
                    .push(cleaned.cleaned.clone());
            }
            by_cleaned.entry(cleaned.cleaned).or_default().push(position);
        }

        Self {
            packages,
            modules,
            by_cleaned,
            name_to_cleaned,
        }
    }

    /// Cleaned keys under the advisory package's name that prefix-match
    /// it; used when the direct lookup misses. First match wins.
    fn prefix_alias(&self, advisory_cleaned: &str) -> Option<&str> {
        let name = nevra::package_name(advisory_cleaned)?;
        self.name_to_cleaned
            .get(name)?
            .iter()
            .find(|candidate| nevra::prefix_matches(advisory_cleaned, candidate))
            .map(String::as_str)
    }
}

/// The advisory arches a mirror can ship: its own arch plus `src` and
/// `noarch`, and `i686` for x86_64 mirrors when so configured.
pub fn acceptable_arches(mirror_arch: &str, dist: &DistTags) -> HashSet<String> {
    let mut arches = HashSet::from([
        mirror_arch.to_string(),
        "src".to_string(),
        "noarch".to_string(),
    ]);
    if mirror_arch == "x86_64" && dist.x86_implies_i686 {
        arches.insert("i686".to_string());
    }
    arches
}

fn release_of(nevra_str: &str) -> Option<&str> {
    let trimmed = nevra_str.strip_suffix(".rpm").unwrap_or(nevra_str);
    let (rest, _arch) = trimmed.rsplit_once('.')?;
    let (_nvr, release) = rest.rsplit_once('-')?;
    Some(release)
}

/// Reject a candidate pair when both releases are modular but identify
/// different module builds. A rebuild under a different module build
/// counter or context is still the same artifact; a different stream
/// iteration is not.
fn module_builds_agree(advisory_release: &str, package_release: &str) -> bool {
    if !nevra::is_modular(advisory_release) || !nevra::is_modular(package_release) {
        return true;
    }
    match (
        nevra::ModuleRelease::parse(advisory_release),
        nevra::ModuleRelease::parse(package_release),
    ) {
        (Some(advisory), Some(package)) => advisory.same_build(&package),
        // An unparseable modular release never matches.
        _ => false,
    }
}

/// Match one advisory's NEVRAs against a repository index. Accepted
/// packages are annotated with the repository name and mirror that
/// produced them, and deduplicated.
pub fn match_advisory(
    advisory_nevras: &[String],
    repo_index: &RepoIndex,
    arches: &HashSet<String>,
    repo_name: &str,
    mirror_id: i64,
    dist: &DistTags,
) -> Vec<MatchedPackage> {
    let mut accepted: BTreeSet<usize> = BTreeSet::new();

    for nevra_str in advisory_nevras {
        let cleaned = match nevra::clean_nevra(nevra_str, dist) {
            Ok(cleaned) => cleaned,
            Err(err) => {
                tracing::warn!(nevra = %nevra_str, %err, "skipping unparseable advisory package");
                continue;
            }
        };
        let Some((_, arch)) = cleaned.cleaned.rsplit_once('.') else {
            continue;
        };
        if !arches.contains(arch) {
            continue;
        }
        let Some(advisory_release) = release_of(nevra_str) else {
            continue;
        };

        let key = match repo_index.by_cleaned.contains_key(&cleaned.cleaned) {
            true => cleaned.cleaned.as_str(),
            false => match repo_index.prefix_alias(&cleaned.cleaned) {
                Some(alias) => alias,
                None => continue,
            },
        };

        for &position in &repo_index.by_cleaned[key] {
            let package = &repo_index.packages[position];
            if !module_builds_agree(advisory_release, &package.release) {
                tracing::debug!(
                    advisory_nevra = %nevra_str,
                    package = %package.nevra(),
                    "rejecting module build mismatch"
                );
                continue;
            }
            accepted.insert(position);
        }
    }

    accepted
        .into_iter()
        .map(|position| {
            let package = repo_index.packages[position].clone();
            let module = repo_index.modules.get(&package.nevra()).cloned();
            MatchedPackage {
                package,
                module,
                repo_name: repo_name.to_string(),
                mirror_id,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nevra::DistConfig;

    fn dist() -> DistTags {
        DistConfig::default().compile()
    }

    fn package(name: &str, version: &str, release: &str, arch: &str) -> RpmPackage {
        RpmPackage {
            name: name.to_string(),
            epoch: "0".to_string(),
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
            checksum: format!("checksum-of-{name}"),
            checksum_type: "sha256".to_string(),
            source_rpm: Some(format!("{name}-{version}-{release}.src.rpm")),
        }
    }

    fn index(packages: Vec<RpmPackage>) -> RepoIndex {
        RepoIndex::build(
            repomd::RepoSnapshot {
                packages,
                modules: Default::default(),
            },
            &dist(),
        )
    }

    fn run(advisory_nevras: &[&str], repo_index: &RepoIndex, mirror_arch: &str) -> Vec<String> {
        let dist = dist();
        let nevras: Vec<String> = advisory_nevras.iter().map(|s| s.to_string()).collect();
        match_advisory(
            &nevras,
            repo_index,
            &acceptable_arches(mirror_arch, &dist),
            "BaseOS",
            1,
            &dist,
        )
        .into_iter()
        .map(|m| m.package.nevra())
        .collect()
    }

    #[test]
    fn plain_match_absorbs_rebuild_counter() {
        // The repository rebuilt with a trailing counter on the release.
        let repo = index(vec![package("bash", "5.1.8", "6.el9.1", "x86_64")]);
        let matched = run(&["bash-0:5.1.8-6.el9.x86_64.rpm"], &repo, "x86_64");
        assert_eq!(matched, vec!["bash-0:5.1.8-6.el9.1.x86_64".to_string()]);
    }

    #[test]
    fn arch_policy_restricts_candidates() {
        let repo = index(vec![
            package("bash", "5.1.8", "6.el9", "x86_64"),
            package("bash", "5.1.8", "6.el9", "aarch64"),
            package("bash", "5.1.8", "6.el9", "i686"),
            package("bash-doc", "5.1.8", "6.el9", "noarch"),
        ]);

        let matched = run(
            &[
                "bash-0:5.1.8-6.el9.x86_64",
                "bash-0:5.1.8-6.el9.aarch64",
                "bash-0:5.1.8-6.el9.i686",
                "bash-doc-0:5.1.8-6.el9.noarch",
            ],
            &repo,
            "x86_64",
        );
        // aarch64 is outside the mirror's arch policy; i686 rides along
        // with x86_64 and noarch always participates.
        assert_eq!(
            matched,
            vec![
                "bash-0:5.1.8-6.el9.x86_64".to_string(),
                "bash-0:5.1.8-6.el9.i686".to_string(),
                "bash-doc-0:5.1.8-6.el9.noarch".to_string(),
            ],
        );

        let matched = run(&["bash-0:5.1.8-6.el9.i686"], &repo, "aarch64");
        assert!(matched.is_empty());
    }

    #[test]
    fn modular_match_tolerates_rebuild_context() {
        let repo = index(vec![package(
            "redis",
            "7.2.10",
            "1.module+el9.6.0+23332+115a3b01.1",
            "x86_64",
        )]);
        let matched = run(
            &["redis-0:7.2.10-1.module+el9.6.0+23332+115a3b01.x86_64"],
            &repo,
            "x86_64",
        );
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn modular_mismatch_on_stream_iteration_is_rejected() {
        let repo = index(vec![package(
            "redis",
            "7.2.10",
            "1.module+el9.6.0+23332+115a3b01",
            "x86_64",
        )]);
        let matched = run(
            &["redis-0:7.2.10-1.module+el9.5.0+23332+115a3b01.x86_64"],
            &repo,
            "x86_64",
        );
        assert!(matched.is_empty());
    }

    #[test]
    fn modular_and_plain_packages_never_cross() {
        let modular_repo = index(vec![package(
            "redis",
            "7.2.10",
            "1.module+el9.6.0+23332+115a3b01",
            "x86_64",
        )]);
        let matched = run(&["redis-0:7.2.10-1.el9.x86_64"], &modular_repo, "x86_64");
        assert!(matched.is_empty());

        let plain_repo = index(vec![package("redis", "7.2.10", "1.el9", "x86_64")]);
        let matched = run(
            &["redis-0:7.2.10-1.module+el9.6.0+23332+115a3b01.x86_64"],
            &plain_repo,
            "x86_64",
        );
        assert!(matched.is_empty());
    }

    #[test]
    fn unparseable_advisory_package_is_skipped() {
        let repo = index(vec![package("bash", "5.1.8", "6.el9", "x86_64")]);
        let matched = run(
            &["not-a-nevra", "bash-0:5.1.8-6.el9.x86_64"],
            &repo,
            "x86_64",
        );
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn matched_packages_are_deduplicated() {
        let repo = index(vec![package("bash", "5.1.8", "6.el9", "x86_64")]);
        // Both the src-suffixed and plain forms resolve to one package.
        let matched = run(
            &["bash-0:5.1.8-6.el9.x86_64.rpm", "bash-0:5.1.8-6.el9.x86_64"],
            &repo,
            "x86_64",
        );
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn module_artifacts_annotate_matches() {
        let mut modules = HashMap::new();
        modules.insert(
            "redis-0:7.2.10-1.module+el9.6.0+23332+115a3b01.x86_64".to_string(),
            ModuleBuild {
                name: "redis".to_string(),
                stream: "7".to_string(),
                version: "906002025".to_string(),
                context: "115a3b01".to_string(),
            },
        );
        let repo_index = RepoIndex::build(
            repomd::RepoSnapshot {
                packages: vec![package(
                    "redis",
                    "7.2.10",
                    "1.module+el9.6.0+23332+115a3b01",
                    "x86_64",
                )],
                modules,
            },
            &dist(),
        );

        let dist = dist();
        let matched = match_advisory(
            &["redis-0:7.2.10-1.module+el9.6.0+23332+115a3b01.x86_64".to_string()],
            &repo_index,
            &acceptable_arches("x86_64", &dist),
            "AppStream",
            7,
            &dist,
        );
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].module.as_ref().unwrap().name, "redis");
        assert_eq!(matched[0].repo_name, "AppStream");
        assert_eq!(matched[0].mirror_id, 7);
    }
}
