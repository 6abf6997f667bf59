//! The advisory matcher: decides, per product, which upstream advisories
//! the downstream repositories actually ship, and clones the ones that
//! do into downstream advisories.

use serde::{Deserialize, Serialize};

mod activities;
mod cloner;
mod index;

pub use activities::{
    block_unmatched_for_product, get_last_indexed_at, list_products_with_mirrors, match_product,
};
pub use cloner::{clone_advisory, downstream_name, PendingClone};
pub use index::{acceptable_arches, match_advisory, MatchedPackage, RepoIndex};

/// MatcherConfig carries the design seams of the matcher: how upstream
/// text is recognized and rewritten, the block grace window, and the
/// dist-tag configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Upstream variant name rewritten to the product name.
    pub upstream_variant: String,
    /// Short form of the variant, also rewritten to the product name.
    pub upstream_variant_short: String,
    /// Upstream vendor name rewritten to the product vendor.
    pub upstream_vendor: String,
    /// Letters stripped from upstream advisory names before prefixing
    /// the product code (`RHSA-2024:1234` -> `SA-2024:1234`).
    pub advisory_prefix: String,
    /// Days a Block must age before it suppresses retries.
    pub grace_days: i32,
    /// Defunct sweep behavior: when set, `block_unmatched_for_product`
    /// blocks every candidate advisory of a mirror, matched or not.
    pub block_all_on_defunct: bool,
    /// Decompressed-size cap for repository metadata reads.
    pub max_metadata_bytes: usize,
    pub dist: nevra::DistConfig,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            upstream_variant: "Red Hat Enterprise Linux".to_string(),
            upstream_variant_short: "RHEL".to_string(),
            upstream_vendor: "Red Hat".to_string(),
            advisory_prefix: "RH".to_string(),
            grace_days: 14,
            block_all_on_defunct: true,
            max_metadata_bytes: repomd::Limits::default().max_decompressed_bytes,
            dist: nevra::DistConfig::default(),
        }
    }
}

impl MatcherConfig {
    pub fn limits(&self) -> repomd::Limits {
        repomd::Limits {
            max_decompressed_bytes: self.max_metadata_bytes,
        }
    }
}
