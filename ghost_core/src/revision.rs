//! File revisions.
//!
//! A revision records one mutation of one file. The DB driver appends one to
//! its revision index for every mutation made with `record_revision = true`;
//! on disk, revisions only exist in the `revisions.json` sidecar written at
//! export time. Comparing the two lists is how sync detects edits made in the
//! database that were never brought back to disk.

use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// File name of the revision sidecar written by exports.
pub const REVISIONS_FILE: &str = "revisions.json";

/// Bucket used for files that sit directly in a scope root.
pub const ROOT_BUCKET: &str = "root";

/// Number of random bytes in a revision id.
const REVISION_ID_BYTES: usize = 4;

/// A recorded file mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Logical path of the mutated file.
    pub path: String,
    /// Short random revision id.
    pub revision: String,
    /// When the mutation happened.
    pub created_on: DateTime<Utc>,
    /// Who made the mutation.
    pub created_by: String,
}

impl Revision {
    /// Create a revision for `path` with a fresh id, stamped now.
    pub fn new(path: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            revision: new_revision_id(),
            created_on: Utc::now(),
            created_by: created_by.into(),
        }
    }

    /// Identity used for de-duplication and disk/DB matching.
    pub fn key(&self) -> (&str, &str) {
        (&self.path, &self.revision)
    }
}

/// Generate a short random revision id (8 hex characters).
///
/// Uniqueness is not checked; collisions on the same path are negligible.
pub fn new_revision_id() -> String {
    hex::encode(rand::random::<[u8; REVISION_ID_BYTES]>())
}

/// DB-side revisions of one scope grouped by top-level folder.
pub type PendingRevisions = BTreeMap<String, Vec<Revision>>;

/// Union of two revision lists, keeping the first occurrence of every
/// `(path, revision)` pair. Order is `first` then the new entries of `second`.
pub fn merge(first: Vec<Revision>, second: Vec<Revision>) -> Vec<Revision> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut merged = Vec::with_capacity(first.len() + second.len());

    for revision in first.into_iter().chain(second) {
        if seen.insert((revision.path.clone(), revision.revision.clone())) {
            merged.push(revision);
        }
    }

    merged
}

/// Revisions of `db` whose `(path, revision)` pair also appears in `disk`.
pub fn mirrored<'a>(db: &'a [Revision], disk: &[Revision]) -> Vec<&'a Revision> {
    let on_disk: HashSet<(&str, &str)> = disk.iter().map(Revision::key).collect();
    db.iter().filter(|r| on_disk.contains(&r.key())).collect()
}

/// Group revisions by the first path segment below `base`.
///
/// Files directly in `base` go to the `root` bucket. Revisions outside `base`
/// are skipped.
pub fn group_by_folder(base: &str, revisions: Vec<Revision>) -> PendingRevisions {
    let mut grouped = PendingRevisions::new();

    for revision in revisions {
        let Some(relative) = paths::relative_to(&revision.path, base) else {
            continue;
        };
        let folder = paths::top_folder(relative).unwrap_or(ROOT_BUCKET).to_string();
        grouped.entry(folder).or_default().push(revision);
    }

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(path: &str, id: &str) -> Revision {
        Revision {
            path: path.to_string(),
            revision: id.to_string(),
            created_on: Utc::now(),
            created_by: "admin".to_string(),
        }
    }

    #[test]
    fn test_revision_id_format() {
        let id = new_revision_id();
        assert_eq!(id.len(), REVISION_ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_revisions_get_distinct_ids() {
        let a = Revision::new("data/global/a.json", "admin");
        let b = Revision::new("data/global/a.json", "admin");
        assert_ne!(a.revision, b.revision);
    }

    #[test]
    fn test_sidecar_field_names() {
        let json = serde_json::to_value(rev("data/global/a.json", "abcd1234")).unwrap();
        assert_eq!(json["path"], "data/global/a.json");
        assert_eq!(json["revision"], "abcd1234");
        assert!(json.get("createdOn").is_some());
        assert_eq!(json["createdBy"], "admin");
    }

    #[test]
    fn test_merge_deduplicates_by_path_and_revision() {
        let disk = vec![rev("a", "1"), rev("a", "2")];
        let db = vec![rev("a", "2"), rev("a", "3"), rev("b", "1")];

        let merged = merge(disk, db);
        let keys: Vec<(&str, &str)> = merged.iter().map(Revision::key).collect();
        assert_eq!(keys, vec![("a", "1"), ("a", "2"), ("a", "3"), ("b", "1")]);
    }

    #[test]
    fn test_mirrored() {
        let db = vec![rev("file", "1"), rev("file", "2"), rev("file", "3")];
        let disk = vec![rev("file", "1"), rev("file", "2")];

        let synced = mirrored(&db, &disk);
        assert_eq!(synced.len(), 2);
        assert!(synced.iter().all(|r| r.revision != "3"));
    }

    #[test]
    fn test_group_by_folder() {
        let base = "data/bots/bot1";
        let grouped = group_by_folder(
            base,
            vec![
                rev("data/bots/bot1/qna/faq.json", "1"),
                rev("data/bots/bot1/qna/other.json", "2"),
                rev("data/bots/bot1/bot.config.json", "3"),
                rev("data/bots/bot10/qna/faq.json", "4"),
            ],
        );

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["qna"].len(), 2);
        assert_eq!(grouped[ROOT_BUCKET].len(), 1);
    }
}
