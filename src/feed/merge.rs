//! Identity-based reconciliation of fetched entries against cached ones.

use std::collections::HashSet;

use crate::storage::{Entry, STATE_NEW, STATE_UNREAD};

/// Produces the retained entry list for one feed.
///
/// Content always comes from the fetch; state always comes from the cache.
/// A cached entry with a pending (dirty) local change hands that change
/// through, still dirty, so it is what gets persisted.
#[derive(Debug, Clone, Copy)]
pub struct EntryMerger<'a> {
    tags: &'a [String],
    keep: usize,
}

impl<'a> EntryMerger<'a> {
    pub fn new(tags: &'a [String], keep: usize) -> Self {
        Self { tags, keep }
    }

    fn default_state(&self) -> Vec<String> {
        let mut state = Vec::with_capacity(self.tags.len() + 2);
        for tag in self.tags {
            if !state.contains(tag) {
                state.push(tag.clone());
            }
        }
        state.push(STATE_UNREAD.to_owned());
        state.push(STATE_NEW.to_owned());
        state
    }

    /// Merge `fetched` (in feed order) over `previous` (in cache order).
    ///
    /// The result holds at most `keep` entries with no repeated non-null
    /// identity. When the fetch is shorter than `keep`, unmatched previous
    /// entries pad the tail in their cached order.
    pub fn merge(&self, mut previous: Vec<Entry>, fetched: Vec<Entry>) -> Vec<Entry> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<Entry> = Vec::with_capacity(fetched.len().min(self.keep));

        for mut entry in fetched {
            entry.ensure_identity();
            if let Some(id) = &entry.id {
                if !seen.insert(id.clone()) {
                    tracing::debug!(id = %id, "Dropping duplicate entry in fetch");
                    continue;
                }
            }

            match previous.iter().position(|old| old.same_identity(&entry)) {
                Some(index) => {
                    // Removed so it cannot match again or pad the tail
                    let old = previous.remove(index);
                    entry.state = old.state;
                    entry.dirty = old.dirty;
                }
                None => {
                    entry.state = self.default_state();
                    entry.dirty = false;
                }
            }

            for tag in self.tags {
                entry.insert_tag(tag);
            }
            merged.push(entry);
        }

        if merged.len() >= self.keep {
            merged.truncate(self.keep);
            return merged;
        }

        for old in previous {
            if merged.len() >= self.keep {
                break;
            }
            if let Some(id) = &old.id {
                if !seen.insert(id.clone()) {
                    continue;
                }
            }
            merged.push(old);
        }
        merged
    }
}

/// Carry the reader's unflushed state changes onto freshly loaded entries.
///
/// For every local entry that is dirty, the disk entry with the same
/// identity takes the local state and becomes dirty itself, so that the
/// change is written back. Clean local entries contribute nothing: their
/// state is replaced by the disk state when the reader absorbs the result.
/// Returns how many pending changes were applied.
pub fn overlay_pending(disk: &mut [Entry], local: &[Entry]) -> usize {
    let mut applied = 0;
    for pending in local.iter().filter(|e| e.dirty) {
        if let Some(target) = disk.iter_mut().find(|d| d.same_identity(pending)) {
            target.state.clone_from(&pending.state);
            target.dirty = true;
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::STATE_READ;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn fetched(id: &str, title: &str) -> Entry {
        Entry::from_fields(
            json!({ "id": id, "title": title })
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn cached(id: &str, state: &[&str]) -> Entry {
        let mut e = fetched(id, &format!("old {id}"));
        e.state = state.iter().map(|s| s.to_string()).collect();
        e
    }

    fn ids(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.as_deref().unwrap_or("-")).collect()
    }

    fn tags() -> Vec<String> {
        vec!["F".to_string()]
    }

    #[test]
    fn test_scenario_keep_met_by_fetch() {
        let tags = tags();
        let previous = vec![
            cached("A", &["F", "unread"]),
            cached("B", &["F", "read"]),
            cached("C", &["F", "unread"]),
        ];
        let fetch = vec![fetched("A", "A prime"), fetched("D", "D"), fetched("E", "E")];

        let merged = EntryMerger::new(&tags, 3).merge(previous, fetch);
        assert_eq!(ids(&merged), vec!["A", "D", "E"]);
        assert_eq!(merged[0].state, vec!["F", "unread"]);
        assert_eq!(merged[0].title(), Some("A prime"), "fetched content wins");
        assert_eq!(merged[1].state, vec!["F", "unread", "new"]);
        assert_eq!(merged[2].state, vec!["F", "unread", "new"]);
    }

    #[test]
    fn test_short_fetch_pads_with_previous_in_order() {
        let tags = tags();
        let previous = vec![
            cached("A", &["F", "read"]),
            cached("B", &["F", "read"]),
            cached("C", &["F", "unread"]),
        ];
        let merged =
            EntryMerger::new(&tags, 3).merge(previous, vec![fetched("X", "X"), fetched("B", "B")]);
        assert_eq!(ids(&merged), vec!["X", "B", "A"]);
        assert_eq!(merged[1].state, vec!["F", "read"]);
    }

    #[test]
    fn test_padding_exhausts_previous() {
        let tags = tags();
        let merged = EntryMerger::new(&tags, 10)
            .merge(vec![cached("A", &["F"])], vec![fetched("B", "B")]);
        assert_eq!(ids(&merged), vec!["B", "A"]);
    }

    #[test]
    fn test_null_identity_never_matches() {
        let tags = tags();
        let mut anonymous_old = Entry::from_fields(Default::default());
        anonymous_old.state = vec!["F".into(), STATE_READ.into()];
        let anonymous_new = Entry::from_fields(Default::default());

        let merged = EntryMerger::new(&tags, 1).merge(vec![anonymous_old], vec![anonymous_new]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_unread(), "anonymous fetch gets default state");
    }

    #[test]
    fn test_identity_derived_in_merge() {
        let tags = tags();
        let mut fetched_by_link = Entry::from_fields(Default::default());
        fetched_by_link
            .fields
            .insert("link".into(), json!("https://x.org/1"));
        let previous = vec![cached("https://x.org/1", &["F", "read", "starred"])];

        let merged = EntryMerger::new(&tags, 5).merge(previous, vec![fetched_by_link]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_starred());
    }

    #[test]
    fn test_duplicate_ids_in_fetch_collapse() {
        let tags = tags();
        let merged = EntryMerger::new(&tags, 5).merge(
            Vec::new(),
            vec![fetched("A", "first"), fetched("A", "second"), fetched("B", "B")],
        );
        assert_eq!(ids(&merged), vec!["A", "B"]);
        assert_eq!(merged[0].title(), Some("first"));
    }

    #[test]
    fn test_configured_tags_unioned_not_replaced() {
        let tags = vec!["F".to_string(), "Tech".to_string()];
        let previous = vec![cached("A", &["F", "read", "mine"])];
        let merged = EntryMerger::new(&tags, 5).merge(previous, vec![fetched("A", "A")]);
        assert_eq!(merged[0].state, vec!["F", "read", "mine", "Tech"]);
    }

    #[test]
    fn test_dirty_state_carried_through() {
        let tags = tags();
        let mut old = cached("A", &["F", "unread"]);
        old.mark_read();
        let merged = EntryMerger::new(&tags, 5).merge(vec![old], vec![fetched("A", "A")]);
        assert!(merged[0].dirty);
        assert!(!merged[0].is_unread());
    }

    #[test]
    fn test_merge_idempotent() {
        let tags = tags();
        let first = EntryMerger::new(&tags, 4).merge(
            vec![cached("A", &["F", "read"])],
            vec![fetched("A", "A"), fetched("B", "B"), fetched("C", "C")],
        );
        let again = EntryMerger::new(&tags, 4).merge(first.clone(), first.clone());
        assert_eq!(again, first);
    }

    #[test]
    fn test_keep_zero_retains_nothing() {
        let tags = tags();
        let merged =
            EntryMerger::new(&tags, 0).merge(vec![cached("A", &["F"])], vec![fetched("B", "B")]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_overlay_dirty_local_wins() {
        let mut disk = vec![cached("A", &["F", "unread"]), cached("B", &["F", "unread"])];
        let mut local_a = cached("A", &["F", "unread"]);
        local_a.mark_read();
        let local_b = cached("B", &["F", "read"]); // clean, stale

        let applied = overlay_pending(&mut disk, &[local_a, local_b]);
        assert_eq!(applied, 1);
        assert_eq!(disk[0].state, vec!["F", "read"]);
        assert!(disk[0].dirty);
        assert_eq!(disk[1].state, vec!["F", "unread"], "clean local never overrides disk");
        assert!(!disk[1].dirty);
    }

    fn arb_ids(max: usize) -> impl Strategy<Value = Vec<Option<u8>>> {
        proptest::collection::vec(proptest::option::weighted(0.9, 0u8..12), 0..max)
    }

    fn build(ids: &[Option<u8>], state: &[&str]) -> Vec<Entry> {
        ids.iter()
            .map(|id| match id {
                Some(n) => cached(&format!("e{n}"), state),
                None => Entry::from_fields(Default::default()),
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_retention_invariant(
            prev in arb_ids(12),
            fresh in arb_ids(12),
            keep in 0usize..10,
        ) {
            let tags = tags();
            let previous = build(&prev, &["F", "read"]);
            let fetched = build(&fresh, &[]);
            let merged = EntryMerger::new(&tags, keep).merge(previous, fetched.clone());

            prop_assert!(merged.len() <= keep);

            let mut seen = HashSet::new();
            for e in &merged {
                if let Some(id) = &e.id {
                    prop_assert!(seen.insert(id.clone()), "duplicate id {}", id);
                }
            }

            // Deduplicated fetch order is a prefix of the result
            let mut fetch_seen = HashSet::new();
            let fetch_ids: Vec<Option<String>> = fetched
                .iter()
                .filter(|e| e.id.as_ref().map_or(true, |id| fetch_seen.insert(id.clone())))
                .map(|e| e.id.clone())
                .collect();
            let prefix = fetch_ids.len().min(keep);
            let merged_ids: Vec<Option<String>> = merged.iter().map(|e| e.id.clone()).collect();
            prop_assert_eq!(&merged_ids[..prefix], &fetch_ids[..prefix]);
        }
    }
}
