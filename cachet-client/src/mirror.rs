//! Local mirror of a client's namespace.
//!
//! The mirror holds the last data the client saw — one image or a set of
//! pages, depending on strategy — plus the last namespace offset observed in
//! any engine reply. Load operations serve from it without a round trip;
//! save operations write through from it. It is advisory state: a stale
//! mirror costs a rejected write and a refetch, never corruption, because
//! every write is still offset-checked by the engine.

use cachet_core::{CacheValue, Offset};
use cachet_engine::BulkRead;
use std::collections::HashMap;

/// Client-local copy of namespace data and the offset it was read at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mirror {
    image: Option<CacheValue>,
    pages: HashMap<String, CacheValue>,
    offset: Option<Offset>,
}

impl Mirror {
    pub fn new() -> Self {
        Mirror::default()
    }

    // === Offset ===

    /// Offset of the last engine reply, if any reply has been seen.
    pub fn offset(&self) -> Option<Offset> {
        self.offset
    }

    pub fn note_offset(&mut self, offset: Offset) {
        self.offset = Some(offset);
    }

    // === Image ===

    pub fn image(&self) -> Option<&CacheValue> {
        self.image.as_ref()
    }

    pub fn set_image(&mut self, image: Option<CacheValue>) {
        self.image = image;
    }

    // === Pages ===

    pub fn page(&self, name: &str) -> Option<&CacheValue> {
        self.pages.get(name)
    }

    /// All requested pages, provided every one of them is mirrored; `None`
    /// as soon as any is missing, so callers fall through to the engine.
    pub fn pages_if_complete(&self, names: &[&str]) -> Option<HashMap<String, CacheValue>> {
        let mut subset = HashMap::with_capacity(names.len());
        for name in names {
            subset.insert((*name).to_string(), self.pages.get(*name)?.clone());
        }
        Some(subset)
    }

    pub fn stash_pages(&mut self, pages: &HashMap<String, CacheValue>) {
        for (name, value) in pages {
            self.pages.insert(name.clone(), value.clone());
        }
    }

    pub fn drop_pages(&mut self, names: &[&str]) {
        for name in names {
            self.pages.remove(*name);
        }
    }

    /// Fold an engine page read into the mirror: returned pages replace the
    /// mirrored copies, and requested pages the engine no longer holds are
    /// evicted as stale.
    pub fn absorb_page_read(&mut self, names: &[&str], read: &BulkRead) {
        for name in names {
            match read.get(name) {
                Some(value) => {
                    self.pages.insert((*name).to_string(), value.clone());
                }
                None => {
                    self.pages.remove(*name);
                }
            }
        }
        self.offset = Some(read.offset);
    }

    // === Wholesale ===

    /// Drop mirrored data but keep the offset; used after flushes, where
    /// the new offset is known and the data is gone by definition.
    pub fn clear_data(&mut self) {
        self.image = None;
        self.pages.clear();
    }

    /// Drop everything, offset included.
    pub fn forget(&mut self) {
        *self = Mirror::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pages_if_complete_requires_every_name() {
        let mut mirror = Mirror::new();
        let mut pages = HashMap::new();
        pages.insert("p1".to_string(), json!(1));
        mirror.stash_pages(&pages);

        assert!(mirror.pages_if_complete(&["p1"]).is_some());
        assert!(mirror.pages_if_complete(&["p1", "p2"]).is_none());
    }

    #[test]
    fn test_absorb_page_read_evicts_stale_pages() {
        let mut mirror = Mirror::new();
        let mut pages = HashMap::new();
        pages.insert("p1".to_string(), json!("old"));
        pages.insert("p2".to_string(), json!("kept"));
        mirror.stash_pages(&pages);

        let mut entries = HashMap::new();
        entries.insert("p1".to_string(), json!("new"));
        let read = BulkRead { entries, offset: 3 };
        // p2 was not part of the request, so it is left alone; p3 was
        // requested and absent, so nothing to evict.
        mirror.absorb_page_read(&["p1", "p3"], &read);

        assert_eq!(mirror.page("p1"), Some(&json!("new")));
        assert_eq!(mirror.page("p2"), Some(&json!("kept")));
        assert_eq!(mirror.offset(), Some(3));
    }

    #[test]
    fn test_clear_data_keeps_offset() {
        let mut mirror = Mirror::new();
        mirror.set_image(Some(json!("img")));
        mirror.note_offset(5);
        mirror.clear_data();
        assert!(mirror.image().is_none());
        assert_eq!(mirror.offset(), Some(5));

        mirror.forget();
        assert_eq!(mirror.offset(), None);
    }
}
