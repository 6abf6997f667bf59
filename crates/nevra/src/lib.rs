//! NEVRA (Name-Epoch-Version-Release-Architecture) normalization.
//!
//! Rebuilt distributions keep the upstream NEVRA structure but substitute
//! the dist tag (`.el9_4`) and, for modular packages, the module-build
//! counter (`.module+el9.6.0+23332+115a3b01`). Cross-repository package
//! equality therefore works on a "cleaned" form with both suffixes
//! removed. A modular package must never collide with a non-modular one
//! sharing its base NEVR, so cleaned modular forms carry a `module.`
//! prefix.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("missing architecture in NEVRA string {0:?}")]
    MissingArch(String),
    #[error("missing release in NEVRA string {0:?}")]
    MissingRelease(String),
    #[error("missing version in NEVRA string {0:?}")]
    MissingVersion(String),
    #[error("invalid distribution version in NEVRA string {0:?}")]
    InvalidDistVersion(String),
}

/// DistConfig enumerates the distribution markers and architectures the
/// normalizer recognizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistConfig {
    /// Dist-tag identifiers recognized in release strings (`.el9`, `.rhel8_4`, ...).
    pub dist_ids: Vec<String>,
    /// Machine architectures accepted at the serving boundary.
    pub known_arches: Vec<String>,
    /// Whether an x86_64 slice additionally ships i686 packages.
    pub x86_implies_i686: bool,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            dist_ids: vec!["el".to_string(), "rhel".to_string(), "sles".to_string()],
            known_arches: vec![
                "x86_64".to_string(),
                "aarch64".to_string(),
                "ppc64le".to_string(),
                "s390x".to_string(),
                "riscv64".to_string(),
            ],
            x86_implies_i686: true,
        }
    }
}

impl DistConfig {
    /// Compile the recognition patterns once; `DistTags` is what the
    /// per-package paths consume.
    pub fn compile(&self) -> DistTags {
        let alternation = self
            .dist_ids
            .iter()
            .map(|id| regex::escape(id))
            .collect::<Vec<_>>()
            .join("|");

        DistTags {
            version_re: regex::Regex::new(&format!(
                r"(?:module\+)?(?:{alternation})(\d+)(?:[._](\d+))?"
            ))
            .expect("dist version pattern is valid"),
            strip_re: regex::Regex::new(&format!(r"\.(?:{alternation})\d+(?:_\d+)?"))
                .expect("dist tag pattern is valid"),
            known_arches: self.known_arches.clone(),
            x86_implies_i686: self.x86_implies_i686,
        }
    }
}

/// DistTags holds the compiled dist-tag patterns of a `DistConfig`.
#[derive(Debug, Clone)]
pub struct DistTags {
    version_re: regex::Regex,
    strip_re: regex::Regex,
    pub known_arches: Vec<String>,
    pub x86_implies_i686: bool,
}

impl DistTags {
    /// Extract `(major, minor)` of the dist tag carried by `release`,
    /// looking through an optional `module+` prefix.
    pub fn dist_version(&self, release: &str) -> Option<(u32, Option<u32>)> {
        let caps = self.version_re.captures(release)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2).and_then(|m| m.as_str().parse().ok());
        Some((major, minor))
    }

    /// Strip the dist-tag suffix (`.el9`, `.el9_4`) and any module-build
    /// suffix (`.module+...`) from a release string.
    pub fn strip_release(&self, release: &str) -> String {
        lazy_static::lazy_static! {
            static ref MODULE_RE: regex::Regex = regex::Regex::new(r"\.module.+$").unwrap();
        }

        MODULE_RE
            .replace(&self.strip_re.replace_all(release, ""), "")
            .into_owned()
    }
}

/// Whether a release string marks a modular (modulemd stream) build.
pub fn is_modular(release: &str) -> bool {
    release.contains(".module+")
}

/// Nevra is a strictly parsed NEVRA string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nevra {
    pub name: String,
    pub epoch: u32,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub dist_major: u32,
    pub dist_minor: Option<u32>,
    /// The input with epoch preserved and any `.rpm` suffix removed.
    pub raw: String,
}

impl Nevra {
    /// Parse a NEVRA string, optionally suffixed `.rpm`.
    /// The release must carry a recognized dist tag; the epoch defaults
    /// to zero when absent.
    pub fn parse(input: &str, dist: &DistTags) -> Result<Self, Error> {
        let trimmed = input.strip_suffix(".rpm").unwrap_or(input);

        let (rest, arch) = trimmed
            .rsplit_once('.')
            .ok_or_else(|| Error::MissingArch(input.to_string()))?;
        let (nvr, release) = rest
            .rsplit_once('-')
            .ok_or_else(|| Error::MissingRelease(input.to_string()))?;
        let (name, version) = nvr
            .rsplit_once('-')
            .ok_or_else(|| Error::MissingVersion(input.to_string()))?;

        let (epoch, version) = match version.split_once(':') {
            Some((epoch, version)) => (
                epoch
                    .parse()
                    .map_err(|_| Error::MissingVersion(input.to_string()))?,
                version,
            ),
            None => (0, version),
        };

        let (dist_major, dist_minor) = dist
            .dist_version(release)
            .ok_or_else(|| Error::InvalidDistVersion(input.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            epoch,
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
            dist_major,
            dist_minor,
            raw: trimmed.to_string(),
        })
    }
}

/// Cleaned is the canonical cross-repository identity of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cleaned {
    /// `name-version-release.arch` with dist and module suffixes removed,
    /// prefixed `module.` for modular builds.
    pub cleaned: String,
    /// `name-version-release.arch` as carried by the input (epoch
    /// preserved where present, `.rpm` removed).
    pub raw: String,
    pub modular: bool,
}

/// Clean a NEVRA string. Cleaning is lenient about the dist tag so that
/// it is idempotent: an already-cleaned form passes through unchanged.
pub fn clean_nevra(input: &str, dist: &DistTags) -> Result<Cleaned, Error> {
    let trimmed = input.strip_suffix(".rpm").unwrap_or(input);

    let (rest, arch) = trimmed
        .rsplit_once('.')
        .ok_or_else(|| Error::MissingArch(input.to_string()))?;
    let (nvr, release) = rest
        .rsplit_once('-')
        .ok_or_else(|| Error::MissingRelease(input.to_string()))?;
    let (name, version) = nvr
        .rsplit_once('-')
        .ok_or_else(|| Error::MissingVersion(input.to_string()))?;
    let version = match version.split_once(':') {
        Some((_epoch, version)) => version,
        None => version,
    };

    Ok(clean_parts(name, version, release, arch, trimmed, dist))
}

/// Clean a package already split into fields, as yielded by repository
/// metadata. `raw` is the display form retained alongside the key.
pub fn clean_parts(
    name: &str,
    version: &str,
    release: &str,
    arch: &str,
    raw: &str,
    dist: &DistTags,
) -> Cleaned {
    let stripped = dist.strip_release(release);
    let modular = is_modular(release);

    let mut cleaned = format!("{name}-{version}-{stripped}.{arch}");
    if modular {
        cleaned.insert_str(0, "module.");
    }

    Cleaned {
        cleaned,
        raw: raw.to_string(),
        modular,
    }
}

/// Package name of a cleaned or raw NVRA form, without epoch handling.
pub fn package_name(nvra: &str) -> Option<&str> {
    let (rest, _arch) = nvra.rsplit_once('.')?;
    let (nvr, _release) = rest.rsplit_once('-')?;
    let (name, _version) = nvr.rsplit_once('-')?;
    Some(name)
}

/// Name-prefix match between an advisory's cleaned NEVRA and a candidate
/// repository package's cleaned NEVRA. The candidate's `N-V-R` must start
/// with the advisory's `N-V-R` and the arches must agree; this absorbs a
/// downstream rebuild counter appended to the release (`...el9` shipping
/// as `...el9.1`).
pub fn prefix_matches(advisory_cleaned: &str, candidate_cleaned: &str) -> bool {
    let Some((advisory_nvr, advisory_arch)) = advisory_cleaned.rsplit_once('.') else {
        return false;
    };
    let Some((candidate_nvr, candidate_arch)) = candidate_cleaned.rsplit_once('.') else {
        return false;
    };

    candidate_nvr.starts_with(advisory_nvr) && advisory_arch == candidate_arch
}

/// ModuleRelease is the decomposition of a modular release string,
/// `<counter>.module+<dist_info>+<module_counter>+<context>[<rebuild>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRelease {
    pub counter: String,
    pub dist_info: String,
    pub module_counter: String,
    pub context: String,
    pub rebuild: String,
}

impl ModuleRelease {
    pub fn parse(release: &str) -> Option<Self> {
        lazy_static::lazy_static! {
            static ref MODULE_RELEASE_RE: regex::Regex = regex::Regex::new(
                r"^([0-9.a-z]+)\.module\+(.*)\+([^+]*)\+([a-z0-9]{8})(.*)$"
            )
            .unwrap();
        }

        let caps = MODULE_RELEASE_RE.captures(release)?;
        Some(Self {
            counter: caps[1].to_string(),
            dist_info: caps[2].to_string(),
            module_counter: caps[3].to_string(),
            context: caps[4].to_string(),
            rebuild: caps[5].to_string(),
        })
    }

    /// The dist-info with its trailing sub-part dropped when it carries
    /// more than two dot-separated parts: `el9.6.0` compares as `el9.6`,
    /// so two builds of the same stream iteration agree while `el9.5`
    /// and `el9.6` do not.
    fn dist_comparable(&self) -> String {
        let parts: Vec<&str> = self.dist_info.split('.').collect();
        if parts.len() > 2 {
            parts[..parts.len() - 1].join(".")
        } else {
            self.dist_info.clone()
        }
    }

    /// Whether two module releases identify the same module build,
    /// ignoring the module counter, context hash, and rebuild suffix.
    pub fn same_build(&self, other: &Self) -> bool {
        self.counter == other.counter && self.dist_comparable() == other.dist_comparable()
    }
}
