//! Operation encoder and decoder.
//!
//! [`changes_to_operations`] turns differ output into operation drafts and
//! [`apply_operation`] replays a received operation onto a local snapshot.
//! Both are pure; the host calls them around its own edit/render cycle.

use crate::clock::now_ms;
use crate::diff::ElementChanges;
use crate::error::{SyncError, SyncResult};
use crate::operation::{ElementPayload, Operation, OperationDraft, OperationPayload, ResizeData};
use canvas_model::{random_nonce, Element};
use serde_json::Value;
use std::collections::HashMap;

// =============================================================================
// Encoding
// =============================================================================

/// Encode differ output as at most three drafts: add, update, delete.
///
/// Bound relations are expanded first: a changed text carries its container
/// and a changed container carries its bound text. Related elements are
/// always taken in full from `snapshot`. When an added element is bound to
/// an element that already exists, both travel in the `update` draft, since
/// `update` inserts missing ids on the receiver and `add` would skip the
/// existing partner.
pub fn changes_to_operations(
    changes: &ElementChanges,
    snapshot: &[Element],
) -> SyncResult<Vec<OperationDraft>> {
    let by_id: HashMap<&str, &Element> = snapshot.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut add_ids: Vec<String> = changes.added.iter().map(|e| e.id.clone()).collect();
    let mut update_ids: Vec<String> = changes.updated.iter().map(|e| e.id.clone()).collect();

    let changed = changes.added.iter().chain(changes.updated.iter());
    for element in changed {
        for related in related_ids(element) {
            if !by_id.contains_key(related.as_str()) {
                continue;
            }
            let both_added = add_ids.contains(&element.id) && add_ids.contains(&related);
            if both_added {
                continue;
            }
            for id in [&element.id, &related] {
                add_ids.retain(|a| a != id);
                if !update_ids.contains(id) {
                    update_ids.push(id.clone());
                }
            }
        }
    }

    let fallback: HashMap<&str, &Element> = changes
        .added
        .iter()
        .chain(changes.updated.iter())
        .map(|e| (e.id.as_str(), e))
        .collect();
    let encode = |ids: &[String]| -> SyncResult<Vec<ElementPayload>> {
        ids.iter()
            .filter_map(|id| by_id.get(id.as_str()).or_else(|| fallback.get(id.as_str())))
            .map(|element| ElementPayload::from_element(element).map_err(SyncError::from))
            .collect()
    };

    let mut drafts = Vec::new();
    if !add_ids.is_empty() {
        drafts.push(OperationDraft::new(
            OperationPayload::Add {
                elements: encode(&add_ids)?,
            },
            add_ids,
        ));
    }
    if !update_ids.is_empty() {
        drafts.push(OperationDraft::new(
            OperationPayload::Update {
                elements: encode(&update_ids)?,
            },
            update_ids,
        ));
    }
    if !changes.deleted.is_empty() {
        drafts.push(OperationDraft::delete(changes.deleted.clone()));
    }
    Ok(drafts)
}

/// Ids of elements that must travel with `element`
fn related_ids(element: &Element) -> Vec<String> {
    let mut ids: Vec<String> = element.container_id().map(str::to_string).into_iter().collect();
    ids.extend(element.bound_text_ids().map(str::to_string));
    ids
}

// =============================================================================
// Decoding
// =============================================================================

/// Materialize a wire payload into a full element, filling every omitted
/// field with its default. A payload without `type` becomes a rectangle.
pub fn materialize(payload: &ElementPayload) -> SyncResult<Element> {
    if payload.id().is_none() {
        return Err(SyncError::InvalidPayload("element without id".into()));
    }
    let mut map = payload.as_map().clone();
    map.entry("type")
        .or_insert_with(|| Value::String("rectangle".into()));

    let mut element: Element = serde_json::from_value(Value::Object(map))?;
    element.version.get_or_insert(1);
    element.version_nonce.get_or_insert_with(random_nonce);
    Ok(element)
}

/// Overlay the keys present in `payload` onto `existing`. An explicit
/// `null` clears the property.
fn merge_onto(existing: &Element, payload: &ElementPayload) -> SyncResult<Element> {
    let mut base = match serde_json::to_value(existing)? {
        Value::Object(map) => map,
        _ => return Err(SyncError::InvalidPayload(existing.id.clone())),
    };
    for (key, value) in payload.as_map() {
        base.insert(key.clone(), value.clone());
    }
    Ok(serde_json::from_value(Value::Object(base))?)
}

/// Snapshot being rewritten by one operation. Keeps the relative order of
/// surviving elements and appends new ones.
struct Working {
    slots: Vec<Option<Element>>,
    index: HashMap<String, usize>,
}

impl Working {
    fn new(elements: &[Element]) -> Self {
        let mut slots = Vec::with_capacity(elements.len());
        let mut index = HashMap::with_capacity(elements.len());
        for element in elements {
            match index.get(&element.id) {
                Some(&i) => slots[i] = Some(element.clone()),
                None => {
                    index.insert(element.id.clone(), slots.len());
                    slots.push(Some(element.clone()));
                }
            }
        }
        Self { slots, index }
    }

    fn get(&self, id: &str) -> Option<&Element> {
        self.index.get(id).and_then(|&i| self.slots[i].as_ref())
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Element> {
        match self.index.get(id) {
            Some(&i) => self.slots[i].as_mut(),
            None => None,
        }
    }

    fn upsert(&mut self, element: Element) {
        match self.index.get(&element.id) {
            Some(&i) => self.slots[i] = Some(element),
            None => {
                self.index.insert(element.id.clone(), self.slots.len());
                self.slots.push(Some(element));
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if let Some(i) = self.index.remove(id) {
            self.slots[i] = None;
        }
    }

    fn into_elements(self) -> Vec<Element> {
        self.slots.into_iter().flatten().collect()
    }
}

/// Replay `op` onto `elements` and return the new full element list.
///
/// Malformed element payloads are logged and skipped; the rest of the
/// operation still applies. Deleting a missing id is a no-op.
pub fn apply_operation(elements: &[Element], op: &Operation) -> Vec<Element> {
    let mut doc = Working::new(elements);
    let now = now_ms();

    match &op.payload {
        OperationPayload::Add { elements: payloads } => {
            for payload in payloads {
                let Some(id) = payload.id() else {
                    tracing::warn!(op = %op.kind(), "Skipping element payload without id");
                    continue;
                };
                if doc.get(id).is_some() {
                    continue;
                }
                match materialize(payload) {
                    Ok(element) => doc.upsert(element),
                    Err(e) => tracing::warn!(element_id = id, "Skipping malformed element: {}", e),
                }
            }
        }

        OperationPayload::Update { elements: payloads } => {
            for payload in payloads {
                let Some(id) = payload.id() else {
                    tracing::warn!(op = %op.kind(), "Skipping element payload without id");
                    continue;
                };
                let merged = match doc.get(id) {
                    Some(existing) => merge_onto(existing, payload).map(|mut merged| {
                        keep_text(existing, &mut merged);
                        merged
                    }),
                    None => materialize(payload),
                };
                match merged {
                    Ok(mut element) => {
                        element.bump_version(now);
                        doc.upsert(element);
                    }
                    Err(e) => tracing::warn!(element_id = id, "Skipping malformed update: {}", e),
                }
            }
        }

        OperationPayload::Delete => {
            for id in &op.element_ids {
                doc.remove(id);
            }
        }

        OperationPayload::Move { dx, dy } => {
            for id in &op.element_ids {
                if let Some(element) = doc.get_mut(id) {
                    element.x += dx;
                    element.y += dy;
                    element.bump_version(now);
                }
            }
        }

        OperationPayload::Resize(resize) => {
            for id in &op.element_ids {
                if let Some(element) = doc.get_mut(id) {
                    apply_resize(element, resize);
                    element.bump_version(now);
                }
            }
        }

        OperationPayload::Style(patch) => {
            for id in &op.element_ids {
                if let Some(element) = doc.get_mut(id) {
                    patch.apply_to(element);
                    element.bump_version(now);
                }
            }
        }
    }

    doc.into_elements()
}

/// Replay several operations in order.
pub fn apply_operations<'a>(
    elements: &[Element],
    ops: impl IntoIterator<Item = &'a Operation>,
) -> Vec<Element> {
    ops.into_iter()
        .fold(elements.to_vec(), |acc, op| apply_operation(&acc, op))
}

/// An update must never blank out text that existed before.
fn keep_text(previous: &Element, merged: &mut Element) {
    let Some(old_text) = previous.text_content() else {
        return;
    };
    if merged.text_content() == Some("") && !old_text.is_empty() {
        tracing::warn!(element_id = %merged.id, "Update dropped text content, keeping previous text");
        merged.set_text(old_text);
    }
}

fn apply_resize(element: &mut Element, resize: &ResizeData) {
    let (old_w, old_h) = (element.width, element.height);
    if let Some(points) = element.kind.points_mut() {
        let sx = if old_w != 0.0 { resize.width / old_w } else { 1.0 };
        let sy = if old_h != 0.0 { resize.height / old_h } else { 1.0 };
        for point in points.iter_mut() {
            *point = point.scaled(sx, sy);
        }
    }
    element.width = resize.width;
    element.height = resize.height;
    if let Some(x) = resize.x {
        element.x = x;
    }
    if let Some(y) = resize.y {
        element.y = y;
    }
}
