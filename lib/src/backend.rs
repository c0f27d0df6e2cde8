// Copyright 2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(missing_docs)]

use std::fmt;
use std::path::Path;

use chrono::TimeZone as _;
use itertools::EitherOrBoth;
use itertools::Itertools as _;
use thiserror::Error;

use crate::object_id::BlobId;
use crate::object_id::CommitId;

/// Number of elapsed time units (typically days) since the first commit of
/// the analyzed history.
pub type Tick = u32;

/// Identity of a resolved author, dense and assigned by the external
/// [`IdentityResolver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct AuthorId(pub u32);

impl AuthorId {
    /// Sentinel for an author signature the resolver could not match.
    pub const MISSING: Self = Self((1 << 18) - 1);
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::MISSING {
            f.pad("<missing>")
        } else {
            fmt::Display::fmt(&self.0, f)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MillisSinceEpoch(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub timestamp: MillisSinceEpoch,
    // time zone offset in minutes
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn from_millis(millis: i64) -> Self {
        Self {
            timestamp: MillisSinceEpoch(millis),
            tz_offset: 0,
        }
    }

    pub fn to_datetime(&self) -> chrono::DateTime<chrono::Utc> {
        match chrono::Utc.timestamp_millis_opt(self.timestamp.0) {
            chrono::LocalResult::Single(t) => t,
            chrono::LocalResult::Ambiguous(t, _) => t,
            chrono::LocalResult::None => chrono::DateTime::UNIX_EPOCH,
        }
    }
}

/// An author signature as recorded in a commit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub timestamp: Timestamp,
}

/// One path in a commit's flattened tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub id: BlobId,
}

/// A commit as delivered by the [`CommitSource`].
///
/// The tree is flattened to `(path, blob)` pairs sorted by path; directory
/// structure is irrelevant to the replay engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub author: Signature,
    tree: Vec<TreeEntry>,
}

impl Commit {
    pub fn new(
        id: CommitId,
        parents: Vec<CommitId>,
        author: Signature,
        mut tree: Vec<TreeEntry>,
    ) -> Self {
        tree.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            id,
            parents,
            author,
            tree,
        }
    }

    pub fn tree(&self) -> &[TreeEntry] {
        &self.tree
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }
}

/// What happened to a path between two trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Delete,
    Modify,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEntry {
    pub path: String,
    pub id: BlobId,
}

/// One entry of a tree diff. `before` is absent for insertions, `after` for
/// deletions; a modification with differing paths is a rename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeChange {
    pub kind: ChangeKind,
    pub before: Option<ChangeEntry>,
    pub after: Option<ChangeEntry>,
}

impl TreeChange {
    pub fn insert(path: impl Into<String>, id: BlobId) -> Self {
        Self {
            kind: ChangeKind::Insert,
            before: None,
            after: Some(ChangeEntry {
                path: path.into(),
                id,
            }),
        }
    }

    pub fn delete(path: impl Into<String>, id: BlobId) -> Self {
        Self {
            kind: ChangeKind::Delete,
            before: Some(ChangeEntry {
                path: path.into(),
                id,
            }),
            after: None,
        }
    }

    pub fn modify(
        before_path: impl Into<String>,
        before_id: BlobId,
        after_path: impl Into<String>,
        after_id: BlobId,
    ) -> Self {
        Self {
            kind: ChangeKind::Modify,
            before: Some(ChangeEntry {
                path: before_path.into(),
                id: before_id,
            }),
            after: Some(ChangeEntry {
                path: after_path.into(),
                id: after_id,
            }),
        }
    }

    /// The path the change is keyed by downstream (the post-change path when
    /// one exists).
    pub fn path(&self) -> &str {
        match (&self.after, &self.before) {
            (Some(entry), _) | (None, Some(entry)) => &entry.path,
            (None, None) => unreachable!("tree change with neither side"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    Equal,
    Insert,
    Delete,
}

/// One hunk of a line edit script. `text` is the affected UTF-8 content;
/// line counts are in characters between newlines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffChunk {
    pub kind: DiffKind,
    pub text: String,
}

impl DiffChunk {
    pub fn new(kind: DiffKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn line_count(&self) -> usize {
        let newlines = self.text.bytes().filter(|b| *b == b'\n').count();
        if self.text.is_empty() || self.text.ends_with('\n') {
            newlines
        } else {
            newlines + 1
        }
    }
}

/// A per-file line edit script between two blob versions.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FileDiffData {
    pub old_lines: usize,
    pub new_lines: usize,
    pub diffs: Vec<DiffChunk>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Error when reading commits")]
    ReadCommits {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error when diffing {path}")]
    Diff {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// Delivers the commits of the analyzed repository.
pub trait CommitSource {
    /// All commits of the repository, in arbitrary order.
    fn commits(&self) -> SourceResult<Vec<Commit>>;

    /// The commit the repository currently points at.
    fn head_commit(&self) -> SourceResult<Commit>;

    /// Reads an explicit commit list (one hash per line) and returns the
    /// matching commits in file order.
    fn load_commits_from_path(&self, path: &Path) -> SourceResult<Vec<Commit>>;
}

/// Produces tree diffs and per-file line edit scripts.
///
/// Blob storage, caching and the diff algorithm itself live behind this
/// trait; the replay core only consumes the resulting edit scripts.
pub trait DiffProvider {
    /// Diffs two flattened trees. The default implementation reports plain
    /// insertions, deletions and in-place modifications; implementations
    /// with rename detection may pair a deletion and an insertion into a
    /// single [`ChangeKind::Modify`] with differing paths.
    fn tree_changes(
        &self,
        before: &[TreeEntry],
        after: &[TreeEntry],
    ) -> SourceResult<Vec<TreeChange>> {
        let changes = before
            .iter()
            .merge_join_by(after, |b, a| b.path.cmp(&a.path))
            .filter_map(|pair| match pair {
                EitherOrBoth::Left(b) => Some(TreeChange::delete(b.path.clone(), b.id.clone())),
                EitherOrBoth::Right(a) => Some(TreeChange::insert(a.path.clone(), a.id.clone())),
                EitherOrBoth::Both(b, a) if b.id != a.id => Some(TreeChange::modify(
                    b.path.clone(),
                    b.id.clone(),
                    a.path.clone(),
                    a.id.clone(),
                )),
                EitherOrBoth::Both(..) => None,
            })
            .collect();
        Ok(changes)
    }

    /// The line edit script for an insertion or modification. Returns `None`
    /// when either side of the change is binary.
    fn line_diff(&self, change: &TreeChange) -> SourceResult<Option<FileDiffData>>;
}

/// Maps author signatures to dense identities.
pub trait IdentityResolver {
    fn count(&self) -> usize;

    fn name_of(&self, id: AuthorId) -> Option<&str>;

    /// Resolves a name or email address to an identity.
    fn id_of(&self, name: &str) -> Option<AuthorId>;

    fn for_each(&self, cb: &mut dyn FnMut(AuthorId, &str));
}

/// The external collaborators a pipeline runs against.
pub struct Repository {
    pub source: Box<dyn CommitSource>,
    pub diffs: Box<dyn DiffProvider>,
    pub identities: Box<dyn IdentityResolver>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("", 0; "empty")]
    #[test_case("a\n", 1; "single line")]
    #[test_case("a\nb\n", 2; "two lines")]
    #[test_case("a\nb", 2; "no trailing newline")]
    fn test_line_count(text: &str, lines: usize) {
        assert_eq!(DiffChunk::new(DiffKind::Insert, text).line_count(), lines);
    }

    #[test]
    fn test_author_missing_display() {
        assert_eq!(AuthorId(7).to_string(), "7");
        assert_eq!(AuthorId::MISSING.to_string(), "<missing>");
    }

    #[test]
    fn test_commit_tree_sorted() {
        let blob = BlobId::from_hex("aa");
        let commit = Commit::new(
            CommitId::from_hex("01"),
            vec![],
            Signature {
                name: "a".to_owned(),
                email: "a@example.com".to_owned(),
                timestamp: Timestamp::from_millis(0),
            },
            vec![
                TreeEntry {
                    path: "b.rs".to_owned(),
                    id: blob.clone(),
                },
                TreeEntry {
                    path: "a.rs".to_owned(),
                    id: blob.clone(),
                },
            ],
        );
        let paths: Vec<_> = commit.tree().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["a.rs", "b.rs"]);
    }
}
