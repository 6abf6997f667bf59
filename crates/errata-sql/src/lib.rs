//! Typed rows and SQL for the errata pipeline's Postgres store.
//!
//! Queries use the runtime API so the workspace builds without a
//! database; every statement lives here rather than in the components
//! that call it.

pub mod advisories;
pub mod ledger;
pub mod products;
pub mod upstream;

/// Embedded schema migrations, applied by the worker at startup.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// AdvisoryKind is the closed classification shared by upstream and
/// downstream advisories. It is stored as its display text.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "TEXT")]
pub enum AdvisoryKind {
    #[sqlx(rename = "Security")]
    Security,
    #[sqlx(rename = "Bug Fix")]
    #[serde(rename = "Bug Fix")]
    BugFix,
    #[sqlx(rename = "Enhancement")]
    Enhancement,
}

impl std::fmt::Display for AdvisoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AdvisoryKind::Security => "Security",
            AdvisoryKind::BugFix => "Bug Fix",
            AdvisoryKind::Enhancement => "Enhancement",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display_matches_stored_text() {
        assert_eq!(AdvisoryKind::Security.to_string(), "Security");
        assert_eq!(AdvisoryKind::BugFix.to_string(), "Bug Fix");
        assert_eq!(AdvisoryKind::Enhancement.to_string(), "Enhancement");
    }

    #[test]
    fn kind_serde_round_trip() {
        for kind in [
            AdvisoryKind::Security,
            AdvisoryKind::BugFix,
            AdvisoryKind::Enhancement,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(serde_json::from_str::<AdvisoryKind>(&json).unwrap(), kind);
        }
    }
}
