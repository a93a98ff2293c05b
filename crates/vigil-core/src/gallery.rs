use crate::types::{FaceTemplate, Identity};
use std::collections::HashMap;

/// One enrolled face: who it is, how to show them, and their template.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: Identity,
    /// Display label, e.g. "Ada Lovelace".
    pub label: String,
    pub template: FaceTemplate,
}

/// Set of enrolled templates, at most one per identity.
///
/// A gallery is rebuilt as a whole from the person store; entries keep the
/// order in which they were loaded.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    index: HashMap<Identity, usize>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gallery holding exactly the given store records.
    ///
    /// If an identity appears more than once, its last record wins but keeps
    /// the position of the first.
    pub fn load(records: impl IntoIterator<Item = GalleryEntry>) -> Self {
        let mut gallery = Self::new();
        for entry in records {
            match gallery.index.get(&entry.identity) {
                Some(&i) => {
                    tracing::warn!(identity = %entry.identity, "duplicate gallery record, keeping the last");
                    gallery.entries[i] = entry;
                }
                None => {
                    gallery.index.insert(entry.identity.clone(), gallery.entries.len());
                    gallery.entries.push(entry);
                }
            }
        }
        gallery
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, identity: &Identity) -> Option<&GalleryEntry> {
        self.index.get(identity).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.index.contains_key(identity)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TEMPLATE_SIZE;

    fn entry(id: &str, label: &str, fill: u8) -> GalleryEntry {
        let n = (TEMPLATE_SIZE * TEMPLATE_SIZE) as usize;
        GalleryEntry {
            identity: Identity::from(id),
            label: label.to_string(),
            template: FaceTemplate::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, vec![fill; n]).unwrap(),
        }
    }

    #[test]
    fn test_empty_gallery() {
        let gallery = Gallery::load(Vec::new());
        assert!(gallery.is_empty());
        assert_eq!(gallery.len(), 0);
        assert!(gallery.get(&Identity::from("x")).is_none());
    }

    #[test]
    fn test_load_keeps_order() {
        let gallery = Gallery::load(vec![entry("b", "Bo", 1), entry("a", "Al", 2)]);
        let ids: Vec<&str> = gallery.entries().iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(gallery.get(&Identity::from("a")).unwrap().label, "Al");
    }

    #[test]
    fn test_duplicate_identity_last_wins() {
        let gallery = Gallery::load(vec![
            entry("a", "Old", 1),
            entry("b", "Bo", 2),
            entry("a", "New", 3),
        ]);
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.entries()[0].label, "New");
        assert_eq!(gallery.entries()[0].template.as_raw()[0], 3);
    }

    #[test]
    fn test_reload_is_full_replace() {
        let first = Gallery::load(vec![entry("a", "Al", 1), entry("b", "Bo", 2)]);
        assert!(first.contains(&Identity::from("a")));
        let second = Gallery::load(vec![entry("b", "Bo", 2)]);
        assert!(!second.contains(&Identity::from("a")));
        assert_eq!(second.len(), 1);
    }
}
