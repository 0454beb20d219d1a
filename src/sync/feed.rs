use crate::config::{ContentFilter, FeedDescriptor};
use crate::storage::Entry;

/// Reader-side view of one feed.
///
/// Owns the entries the reader currently shows. State changes made through
/// [`entry_mut`](Feed::entry_mut) mark entries dirty; the next update cycle
/// writes them to disk and [`absorb`](Feed::absorb) clears the flag once the
/// disk agrees.
#[derive(Debug, Clone)]
pub struct Feed {
    descriptor: FeedDescriptor,
    tag: Option<String>,
    entries: Vec<Entry>,
}

impl Feed {
    pub fn new(descriptor: FeedDescriptor) -> Self {
        let tag = descriptor.tag.clone();
        Self {
            descriptor,
            tag,
            entries: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> &FeedDescriptor {
        &self.descriptor
    }

    /// The resolved tag, or the URL until the first successful cycle.
    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.descriptor.url)
    }

    pub(crate) fn set_tag(&mut self, tag: String) {
        self.tag = Some(tag);
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.entries.get_mut(index)
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_unread()).count()
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.dirty)
    }

    /// Mark every entry read. Returns how many changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if entry.is_unread() {
                entry.mark_read();
                changed += 1;
            }
        }
        changed
    }

    /// Entries passing the given view filter. The feed's hard filter was
    /// already applied when they were absorbed.
    pub fn visible<'a>(
        &'a self,
        filter: Option<&'a ContentFilter>,
    ) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries
            .iter()
            .filter(move |e| filter.map_or(true, |f| f.matches(e)))
    }

    /// Replace the shown entries with `disk`, the list just read or written.
    ///
    /// A local dirty entry whose state differs from disk keeps its state and
    /// stays dirty: the change was made after the cycle snapshotted it. Every
    /// other entry takes the disk state, clean. Entries failing the feed's
    /// hard filter are dropped.
    pub fn absorb(&mut self, disk: Vec<Entry>) {
        let mut local = std::mem::take(&mut self.entries);
        let filter = self.descriptor.filter.as_ref();

        self.entries = disk
            .into_iter()
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .map(|mut entry| {
                if let Some(pos) = local
                    .iter()
                    .position(|l| l.dirty && l.same_identity(&entry))
                {
                    let newer = local.swap_remove(pos);
                    if newer.state != entry.state {
                        entry.state = newer.state;
                        entry.dirty = true;
                        return entry;
                    }
                }
                entry.dirty = false;
                entry
            })
            .collect();
    }
}

/// Entries that appeared in `new` and entries that left, as seen through
/// the view filter `filter`.
///
/// An entry counts as appeared when it is visible in `new` and was not in
/// `old`; as left when it was in `old` and is not visible in `new`.
pub fn diff_entries(
    old: &[Entry],
    new: &[Entry],
    filter: Option<&ContentFilter>,
) -> (Vec<Entry>, Vec<Entry>) {
    let visible = |e: &Entry| filter.map_or(true, |f| f.matches(e));

    let appeared = new
        .iter()
        .filter(|e| visible(*e) && !old.iter().any(|o| o.same_identity(e)))
        .cloned()
        .collect();
    let left = old
        .iter()
        .filter(|o| !new.iter().any(|e| e.same_identity(o) && visible(e)))
        .cloned()
        .collect();
    (appeared, left)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{STATE_READ, STATE_UNREAD};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entry(id: &str, state: &[&str]) -> Entry {
        let mut e = Entry::from_fields(json!({ "id": id, "title": id }).as_object().cloned().unwrap());
        e.state = state.iter().map(|s| s.to_string()).collect();
        e
    }

    fn feed() -> Feed {
        Feed::new(FeedDescriptor::new("https://example.com/rss", 5, 10).with_tag("F"))
    }

    #[test]
    fn test_absorb_takes_disk_state_for_clean_entries() {
        let mut f = feed();
        f.absorb(vec![entry("a", &["F", STATE_UNREAD])]);
        f.absorb(vec![entry("a", &["F", STATE_READ])]);
        assert_eq!(f.entries()[0].state, vec!["F", "read"]);
        assert!(!f.has_pending());
    }

    #[test]
    fn test_absorb_keeps_newer_local_change() {
        let mut f = feed();
        f.absorb(vec![entry("a", &["F", STATE_UNREAD]), entry("b", &["F", STATE_UNREAD])]);
        f.entry_mut(1).unwrap().set_starred(true);

        f.absorb(vec![entry("a", &["F", STATE_READ]), entry("b", &["F", STATE_UNREAD])]);
        assert!(f.entries()[1].is_starred());
        assert!(f.entries()[1].dirty);
        assert!(!f.entries()[0].dirty);
    }

    #[test]
    fn test_absorb_clears_dirty_once_persisted() {
        let mut f = feed();
        f.absorb(vec![entry("a", &["F", STATE_UNREAD])]);
        f.entry_mut(0).unwrap().mark_read();
        assert!(f.has_pending());

        f.absorb(vec![entry("a", &["F", STATE_READ])]);
        assert!(!f.has_pending());
    }

    #[test]
    fn test_hard_filter_applied_on_absorb() {
        let mut descriptor = FeedDescriptor::new("https://example.com/rss", 5, 10);
        descriptor.filter = Some(ContentFilter::Unread);
        let mut f = Feed::new(descriptor);
        f.absorb(vec![entry("a", &[STATE_READ]), entry("b", &[STATE_UNREAD])]);
        assert_eq!(f.len(), 1);
        assert_eq!(f.entries()[0].id.as_deref(), Some("b"));
    }

    #[test]
    fn test_tag_falls_back_to_url() {
        let f = Feed::new(FeedDescriptor::new("https://example.com/rss", 5, 10));
        assert_eq!(f.tag(), "https://example.com/rss");
    }

    #[test]
    fn test_mark_all_read() {
        let mut f = feed();
        f.absorb(vec![entry("a", &[STATE_UNREAD]), entry("b", &[STATE_READ])]);
        assert_eq!(f.mark_all_read(), 1);
        assert_eq!(f.unread_count(), 0);
    }

    #[test]
    fn test_diff_respects_view_filter() {
        let old = vec![entry("a", &[STATE_UNREAD]), entry("b", &[STATE_UNREAD])];
        let new = vec![
            entry("a", &[STATE_READ]),
            entry("b", &[STATE_UNREAD]),
            entry("c", &[STATE_UNREAD]),
            entry("d", &[STATE_READ]),
        ];
        let unread = ContentFilter::Unread;
        let (appeared, left) = diff_entries(&old, &new, Some(&unread));
        let ids = |v: &[Entry]| v.iter().map(|e| e.id.clone().unwrap()).collect::<Vec<_>>();
        assert_eq!(ids(&appeared), vec!["c"]);
        assert_eq!(ids(&left), vec!["a"]);

        let (appeared, left) = diff_entries(&old, &new, None);
        assert_eq!(ids(&appeared), vec!["c", "d"]);
        assert!(left.is_empty());
    }
}
