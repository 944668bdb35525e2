//! Operation wire types
//!
//! An [`Operation`] describes one mutation of the shared canvas and is the
//! unit appended to the operation log. Everything here serializes to plain
//! records of primitives: elements travel as flat JSON objects and points as
//! `{x, y}` objects, never nested arrays.

use crate::client_id::ClientId;
use canvas_model::Element;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

/// A full or partial element as carried on the wire.
///
/// Only keys present in the object override existing fields when an update
/// is applied, so a payload produced from a partial diff cannot erase
/// properties it never meant to touch. A key present with `null` clears the
/// property; full elements always carry their unset optionals that way.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementPayload(pub Map<String, Value>);

impl ElementPayload {
    /// Encode a full element.
    pub fn from_element(element: &Element) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(element)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(serde::ser::Error::custom(format!(
                "element {} encoded as non-object {other}",
                element.id
            ))),
        }
    }

    /// The `id` field, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for ElementPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Absolute size for a `resize` operation, optionally with a new origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResizeData {
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

/// Style fields set by a `style` operation. `None` leaves a field as is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StylePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roughness: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<u32>,
}

impl StylePatch {
    /// Apply every field that is set. Typography only lands on text.
    pub fn apply_to(&self, element: &mut Element) {
        if let Some(v) = &self.stroke_color {
            element.stroke_color = v.clone();
        }
        if let Some(v) = &self.background_color {
            element.background_color = v.clone();
        }
        if let Some(v) = &self.fill_style {
            element.fill_style = v.clone();
        }
        if let Some(v) = self.stroke_width {
            element.stroke_width = v;
        }
        if let Some(v) = &self.stroke_style {
            element.stroke_style = v.clone();
        }
        if let Some(v) = self.roughness {
            element.roughness = v;
        }
        if let Some(v) = self.opacity {
            element.opacity = v;
        }
        if let canvas_model::ElementKind::Text {
            font_size,
            font_family,
            ..
        } = &mut element.kind
        {
            if let Some(v) = self.font_size {
                *font_size = v;
            }
            if let Some(v) = self.font_family {
                *font_family = v;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == StylePatch::default()
    }
}

/// Type-specific operation data, serialized as `{"type": ..., "data": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum OperationPayload {
    /// New elements; ids already present on the receiver are ignored
    Add { elements: Vec<ElementPayload> },
    /// Elements merged onto the receiver's copies (inserted if missing)
    Update { elements: Vec<ElementPayload> },
    /// Remove every id in `element_ids`
    Delete,
    /// Translate every target by a delta
    Move { dx: f64, dy: f64 },
    Resize(ResizeData),
    Style(StylePatch),
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Add { .. } => OperationKind::Add,
            OperationPayload::Update { .. } => OperationKind::Update,
            OperationPayload::Delete => OperationKind::Delete,
            OperationPayload::Move { .. } => OperationKind::Move,
            OperationPayload::Resize(_) => OperationKind::Resize,
            OperationPayload::Style(_) => OperationKind::Style,
        }
    }
}

/// Operation type discriminant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
    Move,
    Resize,
    Style,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Add => "add",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Move => "move",
            OperationKind::Resize => "resize",
            OperationKind::Style => "style",
        };
        f.write_str(name)
    }
}

/// An operation before the session stamps its envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDraft {
    #[serde(flatten)]
    pub payload: OperationPayload,
    pub element_ids: Vec<String>,
}

impl OperationDraft {
    pub fn new(payload: OperationPayload, element_ids: Vec<String>) -> Self {
        Self {
            payload,
            element_ids,
        }
    }

    pub fn delete(ids: Vec<String>) -> Self {
        Self::new(OperationPayload::Delete, ids)
    }

    pub fn moved(ids: Vec<String>, dx: f64, dy: f64) -> Self {
        Self::new(OperationPayload::Move { dx, dy }, ids)
    }

    pub fn resize(id: impl Into<String>, width: f64, height: f64) -> Self {
        Self::new(
            OperationPayload::Resize(ResizeData {
                width,
                height,
                x: None,
                y: None,
            }),
            vec![id.into()],
        )
    }

    pub fn style(ids: Vec<String>, patch: StylePatch) -> Self {
        Self::new(OperationPayload::Style(patch), ids)
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// Wrap in an envelope.
    pub fn stamp(self, user_id: impl Into<String>, client_id: ClientId, timestamp: i64) -> Operation {
        Operation {
            id: None,
            payload: self.payload,
            element_ids: self.element_ids,
            user_id: user_id.into(),
            timestamp,
            client_id,
        }
    }
}

/// A mutation as appended to the operation log. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Assigned by the channel on append
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub payload: OperationPayload,
    pub element_ids: Vec<String>,
    pub user_id: String,
    /// Sender wall clock, ms since epoch
    pub timestamp: i64,
    pub client_id: ClientId,
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// True if both operations target at least one common element.
    pub fn touches(&self, other: &Operation) -> bool {
        let mine: HashSet<&str> = self.element_ids.iter().map(String::as_str).collect();
        other.element_ids.iter().any(|id| mine.contains(id.as_str()))
    }

    /// Element ids shared with `other`, in this operation's order.
    pub fn shared_ids(&self, other: &Operation) -> Vec<String> {
        let theirs: HashSet<&str> = other.element_ids.iter().map(String::as_str).collect();
        self.element_ids
            .iter()
            .filter(|id| theirs.contains(id.as_str()))
            .cloned()
            .collect()
    }
}
