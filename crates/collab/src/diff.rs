//! Element differ.
//!
//! Computes which elements were added, updated or deleted between two
//! snapshots of the canvas. Pure function, no side effects.

use canvas_model::Element;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Output of [`detect_changes`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementChanges {
    /// Present in the new snapshot only
    pub added: Vec<Element>,
    /// Present in both with differing content (new version)
    pub updated: Vec<Element>,
    /// Ids present in the old snapshot only
    pub deleted: Vec<String>,
}

impl ElementChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of changed elements
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }
}

/// Diff two snapshots by element id.
///
/// `added` and `updated` follow the order of `new`, `deleted` the order of
/// `old`.
pub fn detect_changes(old: &[Element], new: &[Element]) -> ElementChanges {
    let old_by_id: HashMap<&str, &Element> = old.iter().map(|e| (e.id.as_str(), e)).collect();
    let new_by_id: HashMap<&str, &Element> = new.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut changes = ElementChanges::default();

    for element in new {
        match old_by_id.get(element.id.as_str()) {
            None => changes.added.push(element.clone()),
            Some(previous) if has_changed(previous, element) => {
                changes.updated.push(element.clone())
            }
            Some(_) => {}
        }
    }

    changes.deleted = old
        .iter()
        .filter(|e| !new_by_id.contains_key(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();

    changes
}

/// Decide whether `new` differs from `old`.
///
/// A text edit is always detected first, whatever the versioning says.
/// After that the first piece of versioning metadata present on both sides
/// decides: nonce, then version, then `updated`. Without any of those the
/// elements are compared field by field.
pub fn has_changed(old: &Element, new: &Element) -> bool {
    if old.text_content() != new.text_content() {
        return true;
    }

    if let (Some(a), Some(b)) = (old.version_nonce, new.version_nonce) {
        return a != b;
    }

    if let (Some(a), Some(b)) = (old.version, new.version) {
        return a != b;
    }

    if let (Some(a), Some(b)) = (old.updated, new.updated) {
        if a != b {
            return true;
        }
    }

    !old.content_eq(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_model::Point;

    fn rect(id: &str, x: f64) -> Element {
        Element::rectangle(id, x, 0.0, 10.0, 10.0)
    }

    #[test]
    fn test_no_changes() {
        let snapshot = vec![rect("a", 0.0), rect("b", 5.0)];
        let changes = detect_changes(&snapshot, &snapshot);
        assert!(changes.is_empty());
        assert_eq!(changes.len(), 0);
    }

    #[test]
    fn test_added_updated_deleted() {
        let old = vec![rect("a", 0.0), rect("b", 0.0), rect("c", 0.0)];

        let mut moved = old[1].clone();
        moved.x = 50.0;
        moved.bump_version(1);
        let new = vec![old[0].clone(), moved.clone(), rect("d", 0.0)];

        let changes = detect_changes(&old, &new);
        assert_eq!(changes.added.len(), 1);
        assert_eq!(changes.added[0].id, "d");
        assert_eq!(changes.updated, vec![moved]);
        assert_eq!(changes.deleted, vec!["c".to_string()]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_nonce_decides_when_both_present() {
        let old = rect("a", 0.0);
        let mut same_nonce = old.clone();
        same_nonce.x = 99.0;
        // Matching nonces mean "unchanged" even though geometry differs.
        assert!(!has_changed(&old, &same_nonce));

        let mut new_nonce = old.clone();
        new_nonce.version_nonce = Some(old.version_nonce.unwrap_or(0).wrapping_add(1));
        assert!(has_changed(&old, &new_nonce));
    }

    #[test]
    fn test_version_decides_without_nonce() {
        let mut old = rect("a", 0.0);
        old.version_nonce = None;
        let mut new = old.clone();
        new.version = Some(2);
        assert!(has_changed(&old, &new));

        let mut same = old.clone();
        same.y = 7.0;
        assert!(!has_changed(&old, &same));
    }

    #[test]
    fn test_updated_timestamp_then_fields() {
        let old = rect("a", 0.0).without_versioning();

        let mut touched = old.clone();
        touched.updated = Some(5);
        // Only one side has `updated`, so fields decide.
        assert!(!has_changed(&old, &touched));

        let mut a = old.clone();
        a.updated = Some(1);
        let mut b = old.clone();
        b.updated = Some(2);
        assert!(has_changed(&a, &b));

        let mut moved = old.clone();
        moved.x = 3.0;
        assert!(has_changed(&old, &moved));
    }

    #[test]
    fn test_points_compared_deeply() {
        let old = Element::line("l", vec![Point::origin(), Point::new(10.0, 10.0)])
            .without_versioning();
        let mut new = old.clone();
        if let Some(points) = new.kind.points_mut() {
            points[1] = Point::new(10.0, 11.0);
        }
        assert!(has_changed(&old, &new));
        assert!(!has_changed(&old, &old.clone()));
    }

    #[test]
    fn test_text_edit_always_detected() {
        let old = Element::text("t", "hello");
        let mut new = old.clone();
        new.set_text("hello world");
        // Same nonce and version: only the text special case catches this.
        assert!(has_changed(&old, &new));

        let changes = detect_changes(&[old], &[new]);
        assert_eq!(changes.updated.len(), 1);
    }
}
