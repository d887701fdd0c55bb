//! Field-level last-writer-wins merge between two stores.
//!
//! For each prefix, the subtree of `a` is merged into `b` and then `b`
//! into `a`. A node copies across when its version is higher, when it
//! has a version and the other side does not, or when versions are equal
//! but values differ and the [`TieBreak`] prefers it. Notifications from
//! both passes are flushed once at the end.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::key::{validate_key, Key};
use crate::store::{NodeId, Store, StoreInner, Tree, WatcherId};

/// Resolution of equal-version nodes holding different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// The side being merged from wins. Depends on pass order.
    #[default]
    FirstObserved,
    /// The greater value wins regardless of pass order.
    GreatestValue,
}

impl TieBreak {
    fn prefers(self, source: Option<&str>, target: Option<&str>) -> bool {
        match self {
            TieBreak::FirstObserved => true,
            TieBreak::GreatestValue => source > target,
        }
    }
}

/// Merges `a` and `b` under every prefix and returns how many fields changed.
pub fn sync_stores(
    a: &Store,
    b: &Store,
    prefixes: &[Key],
    tie_break: TieBreak,
) -> Result<usize, SyncError> {
    if a.id() == b.id() {
        return Ok(0);
    }
    for prefix in prefixes {
        validate_key(prefix)?;
    }

    // Lock in id order so concurrent syncs of the same pair cannot deadlock.
    let (mut a_inner, mut b_inner) = if a.id() < b.id() {
        let a_inner = a.lock()?;
        let b_inner = b.lock()?;
        (a_inner, b_inner)
    } else {
        let b_inner = b.lock()?;
        let a_inner = a.lock()?;
        (a_inner, b_inner)
    };

    let mut changed = 0;
    for prefix in prefixes {
        let (a_root, a_watchers) = a_inner.tree.resolve_or_create(prefix);
        let (b_root, b_watchers) = b_inner.tree.resolve_or_create(prefix);

        let mut key = prefix.clone();
        changed += merge(
            &a_inner.tree,
            a_root,
            &mut b_inner,
            b_root,
            &mut key,
            &b_watchers,
            tie_break,
        );
        changed += merge(
            &b_inner.tree,
            b_root,
            &mut a_inner,
            a_root,
            &mut key,
            &a_watchers,
            tie_break,
        );
    }

    a_inner.end_batch();
    b_inner.end_batch();
    Ok(changed)
}

/// Copies newer fields from `source` into `target`, children first.
///
/// Every copied node is announced to the target's watchers, including a
/// tombstone replacing an older tombstone.
fn merge(
    source: &Tree,
    source_id: NodeId,
    target: &mut StoreInner,
    target_id: NodeId,
    key: &mut Key,
    inherited: &[WatcherId],
    tie_break: TieBreak,
) -> usize {
    let mut watchers = inherited.to_vec();
    watchers.extend_from_slice(&target.tree.node(target_id).watchers);

    let mut changed = 0;
    for (segment, &source_child) in &source.node(source_id).children {
        let target_child = target.tree.child_or_create(target_id, segment);
        key.push(segment.clone());
        changed += merge(
            source,
            source_child,
            target,
            target_child,
            key,
            &watchers,
            tie_break,
        );
        key.pop();
    }

    let from = source.node(source_id);
    let to = target.tree.node(target_id);
    let wins = match (from.version, to.version) {
        (Some(f), Some(t)) if f > t => true,
        (Some(f), Some(t)) if f == t && from.value != to.value => {
            tie_break.prefers(from.value.as_deref(), to.value.as_deref())
        }
        (Some(_), None) => true,
        _ => false,
    };
    if !wins {
        return changed;
    }

    let node = target.tree.node_mut(target_id);
    node.value = from.value.clone();
    node.version = from.version;
    let value = node.value.clone();
    target.watchers.record(&watchers, key, value.as_deref());
    changed + 1
}
