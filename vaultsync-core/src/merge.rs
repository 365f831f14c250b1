//! Three-way conflict resolution.
//!
//! Resolves conflicting revisions of an entry against their common ancestor:
//! line-based merge for text, key-path merge for structured JSON. The merge
//! is deliberately conservative: only provably non-overlapping changes are
//! combined automatically; anything that looks like a genuine overlap is
//! handed to the user, because silent data loss is worse than asking.

use crate::config::VaultSettings;
use crate::document::{DocumentId, Revision};
use crate::entry::{EntryFileManager, GetOptions, NewFileEntry, PutOutcome};
use crate::split::SplitMode;
use crate::store::DocumentStore;
use anyhow::{Context, Result};
use serde_json::Value;
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// One side of an unresolved conflict, surfaced for user choice.
#[derive(Debug, Clone)]
pub struct ConflictLeaf {
    pub rev: Revision,
    pub mtime: i64,
    pub data: String,
}

/// Outcome of an auto-merge attempt.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// No conflicting revisions exist; nothing to do.
    NotConflicted,
    /// The document or a required revision body could not be loaded.
    MissingOrError,
    /// Merged automatically; the superseded conflicting revision was removed.
    Resolved { deleted_rev: Revision },
    /// Changes overlap; both leaf contents are surfaced, nothing was changed.
    UserActionRequired {
        left: ConflictLeaf,
        right: ConflictLeaf,
    },
}

/// Attempts automatic three-way merges of conflicted entries.
pub struct ConflictResolver {
    store: Arc<dyn DocumentStore>,
    entries: Arc<EntryFileManager>,
    settings: VaultSettings,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        entries: Arc<EntryFileManager>,
        settings: VaultSettings,
    ) -> Self {
        Self {
            store,
            entries,
            settings,
        }
    }

    /// Attempt to resolve the conflict on `path`.
    ///
    /// Zero conflicting revisions returns immediately; otherwise the
    /// applicable strategy (JSON key-path or text line merge, by file type)
    /// runs only when enabled, falling back to
    /// [`MergeOutcome::UserActionRequired`].
    pub async fn try_auto_merge(
        &self,
        path: &str,
        allow_text_auto_merge: bool,
    ) -> Result<MergeOutcome> {
        let id = DocumentId::from_path(path, self.settings.obfuscate_paths);

        let conflicts = self.store.conflicts(&id).await?;
        let Some(record) = self.store.get(&id).await? else {
            return Ok(MergeOutcome::MissingOrError);
        };
        let Some(conflicted_rev) = conflicts.first().cloned() else {
            return Ok(MergeOutcome::NotConflicted);
        };

        let opts = GetOptions {
            wait_for_replication: true,
            ..Default::default()
        };
        let Some(winner) = self
            .entries
            .get_entry_at_rev(path, &record.rev, &opts)
            .await?
        else {
            return Ok(MergeOutcome::MissingOrError);
        };
        let Some(loser) = self
            .entries
            .get_entry_at_rev(path, &conflicted_rev, &opts)
            .await?
        else {
            return Ok(MergeOutcome::MissingOrError);
        };

        let left = ConflictLeaf {
            rev: record.rev.clone(),
            mtime: winner.mtime,
            data: winner.data,
        };
        let right = ConflictLeaf {
            rev: conflicted_rev.clone(),
            mtime: loser.mtime,
            data: loser.data,
        };

        // Ordered for the insert tie-break: older edit first by default.
        let (first, second) = if (left.mtime <= right.mtime) == self.settings.merge_older_edit_first
        {
            (&left, &right)
        } else {
            (&right, &left)
        };

        let is_object = path.ends_with(".json") || path.ends_with(".canvas");
        let merged = if is_object {
            self.merge_base(path, &id, &left, &right)
                .await?
                .and_then(|base| merge_objects(&base, &first.data, &second.data))
        } else if allow_text_auto_merge && self.settings.enable_text_auto_merge {
            self.merge_base(path, &id, &left, &right)
                .await?
                .and_then(|base| merge_text(&base, &first.data, &second.data))
        } else {
            None
        };

        let Some(merged) = merged else {
            debug!(path, "auto-merge not possible, deferring to user");
            return Ok(MergeOutcome::UserActionRequired { left, right });
        };

        // Drop the superseded leaf first, then write the merged body over
        // the surviving winner.
        self.store
            .remove(&id, &conflicted_rev)
            .await
            .with_context(|| format!("removing conflicting revision of {path}"))?;
        let outcome = self
            .entries
            .put_entry(NewFileEntry {
                path: path.to_string(),
                data: merged,
                ctime: winner.ctime,
                mtime: left.mtime.max(right.mtime),
                mode: winner.mode,
            })
            .await?;
        if !matches!(outcome, PutOutcome::Saved { .. }) {
            return Ok(MergeOutcome::MissingOrError);
        }
        info!(path, deleted_rev = %conflicted_rev, "conflict auto-merged");
        Ok(MergeOutcome::Resolved {
            deleted_rev: conflicted_rev,
        })
    }

    /// Load the common-ancestor body for the two conflict leaves.
    async fn merge_base(
        &self,
        path: &str,
        id: &DocumentId,
        left: &ConflictLeaf,
        right: &ConflictLeaf,
    ) -> Result<Option<String>> {
        let Some(base_rev) = self
            .store
            .common_ancestor(id, &left.rev, &right.rev)
            .await?
        else {
            return Ok(None);
        };
        let opts = GetOptions {
            wait_for_replication: true,
            ..Default::default()
        };
        Ok(self
            .entries
            .get_entry_at_rev(path, &base_rev, &opts)
            .await?
            .map(|e| e.data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Hunk {
    Same(Vec<String>),
    Removed(Vec<String>),
    Added(Vec<String>),
}

fn diff_hunks(base: &str, side: &str) -> VecDeque<Hunk> {
    let diff = TextDiff::from_lines(base, side);
    let mut hunks: VecDeque<Hunk> = VecDeque::new();
    for change in diff.iter_all_changes() {
        let line = change.value().to_string();
        let last = hunks.back_mut();
        match (change.tag(), last) {
            (ChangeTag::Equal, Some(Hunk::Same(lines))) => lines.push(line),
            (ChangeTag::Equal, _) => hunks.push_back(Hunk::Same(vec![line])),
            (ChangeTag::Delete, Some(Hunk::Removed(lines))) => lines.push(line),
            (ChangeTag::Delete, _) => hunks.push_back(Hunk::Removed(vec![line])),
            (ChangeTag::Insert, Some(Hunk::Added(lines))) => lines.push(line),
            (ChangeTag::Insert, _) => hunks.push_back(Hunk::Added(vec![line])),
        }
    }
    hunks
}

/// Consume `n` lines from the front hunk, popping it when drained.
fn consume(queue: &mut VecDeque<Hunk>, n: usize) {
    let drained = {
        let lines = match queue.front_mut() {
            Some(Hunk::Same(l)) | Some(Hunk::Removed(l)) | Some(Hunk::Added(l)) => l,
            None => return,
        };
        lines.drain(..n);
        lines.is_empty()
    };
    if drained {
        queue.pop_front();
    }
}

fn hunk_lines(h: &Hunk) -> &Vec<String> {
    match h {
        Hunk::Same(l) | Hunk::Removed(l) | Hunk::Added(l) => l,
    }
}

/// Three-way line merge of `first` and `second` against `base`.
///
/// Walks both diff streams in lockstep. Equal segments pass through,
/// matching inserts/deletes pass through once, divergent same-position pure
/// inserts are both kept (first side first, a heuristic tie-break rather than a
/// correctness guarantee). Any genuine overlap returns `None`.
pub fn merge_text(base: &str, first: &str, second: &str) -> Option<String> {
    let mut a = diff_hunks(base, first);
    let mut b = diff_hunks(base, second);
    let mut out = String::new();

    loop {
        match (a.front(), b.front()) {
            (None, None) => break,

            // Inserts on both sides at the same position.
            (Some(Hunk::Added(x)), Some(Hunk::Added(y))) => {
                if x == y {
                    out.push_str(&x.concat());
                } else {
                    out.push_str(&x.concat());
                    out.push_str(&y.concat());
                }
                a.pop_front();
                b.pop_front();
            }

            // One-sided insert next to unchanged text passes through; an
            // insert aligned with a delete is an overlap.
            (Some(Hunk::Added(x)), Some(Hunk::Same(_)) | None) => {
                out.push_str(&x.concat());
                a.pop_front();
            }
            (Some(Hunk::Same(_)) | None, Some(Hunk::Added(y))) => {
                out.push_str(&y.concat());
                b.pop_front();
            }
            (Some(Hunk::Added(_)), Some(Hunk::Removed(_)))
            | (Some(Hunk::Removed(_)), Some(Hunk::Added(_))) => return None,

            // Unchanged on both sides: the aligned base lines must agree.
            (Some(Hunk::Same(x)), Some(Hunk::Same(y))) => {
                let n = x.len().min(y.len());
                if x[..n] != y[..n] {
                    return None;
                }
                out.push_str(&x[..n].concat());
                consume(&mut a, n);
                consume(&mut b, n);
            }

            // Clean delete: removed on one side, untouched on the other.
            (Some(Hunk::Removed(x)), Some(Hunk::Same(y)))
            | (Some(Hunk::Same(y)), Some(Hunk::Removed(x))) => {
                let n = x.len().min(y.len());
                if x[..n] != y[..n] {
                    return None;
                }
                let (removed_side, same_side) = if matches!(a.front(), Some(Hunk::Removed(_))) {
                    (&mut a, &mut b)
                } else {
                    (&mut b, &mut a)
                };
                consume(removed_side, n);
                consume(same_side, n);
            }

            // Matching deletes pass through once; a matched delete that one
            // side follows with different replacement text is an overlap.
            (Some(Hunk::Removed(x)), Some(Hunk::Removed(y))) => {
                let n = x.len().min(y.len());
                if x[..n] != y[..n] {
                    return None;
                }
                let both_drain = n == x.len() && n == y.len();
                if both_drain {
                    let a_add = matches!(a.get(1), Some(Hunk::Added(_)));
                    let b_add = matches!(b.get(1), Some(Hunk::Added(_)));
                    if a_add != b_add {
                        return None;
                    }
                    if a_add && b_add && hunk_lines(a.get(1)?) != hunk_lines(b.get(1)?) {
                        return None;
                    }
                }
                consume(&mut a, n);
                consume(&mut b, n);
            }

            // Base consumption out of step; cannot align safely.
            (Some(Hunk::Same(_) | Hunk::Removed(_)), None)
            | (None, Some(Hunk::Same(_) | Hunk::Removed(_))) => return None,
        }
    }

    Some(out)
}

type KeyPath = Vec<String>;
type Patch = BTreeMap<KeyPath, Option<Value>>;

fn flatten(value: &Value, prefix: KeyPath, out: &mut BTreeMap<KeyPath, Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let mut path = prefix.clone();
                path.push(k.clone());
                flatten(v, path, out);
            }
        }
        other => {
            out.insert(prefix, other.clone());
        }
    }
}

/// Flattened key-path changes `base` -> `side`. `None` marks a removal.
fn diff_object(base: &Value, side: &Value) -> Patch {
    let mut base_flat = BTreeMap::new();
    let mut side_flat = BTreeMap::new();
    flatten(base, Vec::new(), &mut base_flat);
    flatten(side, Vec::new(), &mut side_flat);

    let mut patch = Patch::new();
    for (path, value) in &side_flat {
        if base_flat.get(path) != Some(value) {
            patch.insert(path.clone(), Some(value.clone()));
        }
    }
    for path in base_flat.keys() {
        if !side_flat.contains_key(path) {
            patch.insert(path.clone(), None);
        }
    }
    patch
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn apply_patch(target: &mut Value, patch: &Patch) {
    'paths: for (path, change) in patch {
        let Some((leaf, parents)) = path.split_last() else {
            if let Some(value) = change {
                *target = value.clone();
            }
            continue;
        };
        let mut cursor = &mut *target;
        for key in parents {
            if !cursor.is_object() {
                *cursor = empty_object();
            }
            let Value::Object(map) = cursor else {
                continue 'paths;
            };
            cursor = map.entry(key.clone()).or_insert_with(empty_object);
        }
        if !cursor.is_object() {
            *cursor = empty_object();
        }
        let Value::Object(map) = cursor else {
            continue 'paths;
        };
        match change {
            Some(value) => {
                map.insert(leaf.clone(), value.clone());
            }
            None => {
                map.remove(leaf);
            }
        }
    }
}

/// Three-way merge of structured JSON documents.
///
/// Auto-merges when the sets of changed key-paths are disjoint; the same
/// key-path changed to the same value on both sides is deduplicated; the
/// same key-path changed to different values aborts. Patches apply to the
/// base in the supplied order (first side first).
pub fn merge_objects(base: &str, first: &str, second: &str) -> Option<String> {
    let base: Value = serde_json::from_str(base).ok()?;
    let first: Value = serde_json::from_str(first).ok()?;
    let second: Value = serde_json::from_str(second).ok()?;
    if !base.is_object() || !first.is_object() || !second.is_object() {
        return None;
    }

    let pa = diff_object(&base, &first);
    let pb = diff_object(&base, &second);
    for (path, change) in &pa {
        if let Some(other) = pb.get(path) {
            if other != change {
                return None;
            }
        }
    }

    let mut merged = base;
    apply_patch(&mut merged, &pa);
    apply_patch(&mut merged, &pb);
    serde_json::to_string(&merged).ok()
}
