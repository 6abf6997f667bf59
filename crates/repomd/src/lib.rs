//! Reader for YUM-style repository metadata.
//!
//! A `repomd.xml` indexes the repository's data files. This crate fetches
//! the index, resolves the `primary` (XML) and optional `modules`
//! (modulemd YAML) locations, decompresses them streamingly under a byte
//! cap, and yields package records plus the module artifact map. The
//! reader holds no state and is safe to call concurrently.

use std::collections::HashMap;

use serde::Deserialize;

mod fetch;
mod modules;
mod primary;

pub use fetch::Limits;
pub use modules::ModuleBuild;
pub use primary::RpmPackage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to fetch {url}: HTTP {status}")]
    FetchStatus {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("failed to fetch {url}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("metadata at {url} exceeds the {limit}-byte cap")]
    MetadataTooLarge { url: String, limit: usize },
    #[error("failed to decode {url}")]
    Decode {
        url: String,
        #[source]
        source: DecodeError,
    },
    #[error("repomd at {url} has no {data_type:?} data element")]
    Schema {
        url: String,
        data_type: &'static str,
    },
    #[error("invalid metadata url {url:?}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("decompression or read failed")]
    Read(#[source] std::io::Error),
    #[error("metadata is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("XML parse failed")]
    Xml(#[from] quick_xml::Error),
    #[error("XML deserialization failed")]
    XmlDe(#[from] quick_xml::DeError),
    #[error("YAML parse failed")]
    Yaml(#[from] serde_yaml::Error),
    #[error("package record is missing {0}")]
    MissingField(&'static str),
}

/// RepoSnapshot is the parsed content of one repository: its package
/// records and, when the repository ships modulemd metadata, a map of
/// artifact NEVRA to the module build that produced it.
#[derive(Debug, Default)]
pub struct RepoSnapshot {
    pub packages: Vec<RpmPackage>,
    pub modules: HashMap<String, ModuleBuild>,
}

impl RepoSnapshot {
    /// Fold another snapshot into this one. Used to merge the binary,
    /// debug, and source views of a repository before matching.
    pub fn merge(&mut self, other: RepoSnapshot) {
        self.packages.extend(other.packages);
        self.modules.extend(other.modules);
    }
}

/// The `<repomd>` index document. Only the data locations matter here.
#[derive(Debug, Deserialize)]
struct RepomdIndex {
    #[serde(rename = "data", default)]
    data: Vec<RepomdData>,
}

#[derive(Debug, Deserialize)]
struct RepomdData {
    #[serde(rename = "@type")]
    type_: String,
    location: RepomdLocation,
}

#[derive(Debug, Deserialize)]
struct RepomdLocation {
    #[serde(rename = "@href")]
    href: String,
}

impl RepomdIndex {
    fn location_of(&self, data_type: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|d| d.type_ == data_type)
            .map(|d| d.location.href.as_str())
    }
}

/// Resolve a `<location href>` against the parent of the `repodata/`
/// directory that holds the `repomd.xml`.
fn resolve_location(repomd_url: &str, href: &str) -> Result<String, Error> {
    let base = url::Url::parse(repomd_url).map_err(|source| Error::Url {
        url: repomd_url.to_string(),
        source,
    })?;
    let resolved = base
        .join("../")
        .and_then(|parent| parent.join(href))
        .map_err(|source| Error::Url {
            url: format!("{repomd_url} + {href}"),
            source,
        })?;
    Ok(resolved.into())
}

/// Read one repository: fetch its `repomd.xml`, then the referenced
/// `primary` and (optional) `modules` data files.
pub async fn read(
    client: &reqwest::Client,
    repomd_url: &str,
    limits: &Limits,
) -> Result<RepoSnapshot, Error> {
    let index_text = fetch::fetch_text(client, repomd_url, limits).await?;
    let index: RepomdIndex =
        quick_xml::de::from_str(&index_text).map_err(|source| Error::Decode {
            url: repomd_url.to_string(),
            source: source.into(),
        })?;

    let primary_href = index.location_of("primary").ok_or(Error::Schema {
        url: repomd_url.to_string(),
        data_type: "primary",
    })?;
    let primary_url = resolve_location(repomd_url, primary_href)?;
    let primary_text = fetch::fetch_text(client, &primary_url, limits).await?;
    let packages = primary::parse_primary(&primary_text).map_err(|source| Error::Decode {
        url: primary_url.clone(),
        source,
    })?;

    let modules = match index.location_of("modules") {
        Some(href) => {
            let modules_url = resolve_location(repomd_url, href)?;
            let modules_text = fetch::fetch_text(client, &modules_url, limits).await?;
            tracing::debug!(url = %modules_url, "repository ships modulemd metadata");
            modules::parse_modules(&modules_text).map_err(|source| Error::Decode {
                url: modules_url,
                source,
            })?
        }
        None => HashMap::new(),
    };

    tracing::debug!(
        url = %repomd_url,
        packages = packages.len(),
        module_artifacts = modules.len(),
        "read repository metadata"
    );

    Ok(RepoSnapshot { packages, modules })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo" xmlns:rpm="http://linux.duke.edu/metadata/rpm">
  <revision>1714436465</revision>
  <data type="primary">
    <checksum type="sha256">0f2bd0a</checksum>
    <location href="repodata/0f2bd0a-primary.xml.gz"/>
    <size>123</size>
  </data>
  <data type="modules">
    <checksum type="sha256">77aa11</checksum>
    <location href="repodata/77aa11-modules.yaml.xz"/>
  </data>
</repomd>"#;

    #[test]
    fn repomd_index_locations() {
        let index: RepomdIndex = quick_xml::de::from_str(REPOMD).unwrap();
        assert_eq!(
            index.location_of("primary"),
            Some("repodata/0f2bd0a-primary.xml.gz"),
        );
        assert_eq!(
            index.location_of("modules"),
            Some("repodata/77aa11-modules.yaml.xz"),
        );
        assert_eq!(index.location_of("filelists"), None);
    }

    #[test]
    fn locations_resolve_against_repodata_parent() {
        let resolved = resolve_location(
            "https://mirror.example.com/pub/BaseOS/x86_64/os/repodata/repomd.xml",
            "repodata/0f2bd0a-primary.xml.gz",
        )
        .unwrap();
        assert_eq!(
            resolved,
            "https://mirror.example.com/pub/BaseOS/x86_64/os/repodata/0f2bd0a-primary.xml.gz",
        );
    }

    #[test]
    fn snapshot_merge_combines_views() {
        let mut snapshot = RepoSnapshot::default();
        snapshot.merge(RepoSnapshot {
            packages: vec![RpmPackage {
                name: "bash".to_string(),
                epoch: "0".to_string(),
                version: "5.1.8".to_string(),
                release: "6.el9".to_string(),
                arch: "x86_64".to_string(),
                checksum: "aa".to_string(),
                checksum_type: "sha256".to_string(),
                source_rpm: Some("bash-5.1.8-6.el9.src.rpm".to_string()),
            }],
            modules: HashMap::new(),
        });
        assert_eq!(snapshot.packages.len(), 1);
    }
}
