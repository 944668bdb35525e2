//! Per-type element extensions
//!
//! Fields that only make sense for one family of elements live on the
//! matching [`ElementKind`] variant: text content only on text, point
//! sequences only on line, arrow and freedraw.

use serde::{Deserialize, Serialize};

// =============================================================================
// Geometry helpers
// =============================================================================

/// A point relative to the element origin.
///
/// Points are always `{x, y}` objects on the wire, never `[x, y]` tuples,
/// because some channel backends reject arrays of arrays.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub const fn origin() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    /// Scale both coordinates
    pub fn scaled(&self, sx: f64, sy: f64) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
        }
    }
}

/// Binding of an arrow end to another element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointBinding {
    pub element_id: String,
    #[serde(default)]
    pub focus: f64,
    #[serde(default)]
    pub gap: f64,
}

/// Kind of element listed in a container's `boundElements`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundElementKind {
    Text,
    Arrow,
}

/// Back-reference from an element to something bound to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BoundElementKind,
}

impl BoundElement {
    pub fn text(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BoundElementKind::Text,
        }
    }

    pub fn arrow(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BoundElementKind::Arrow,
        }
    }
}

// =============================================================================
// Element kinds
// =============================================================================

/// Type tag plus the fields specific to that type.
///
/// Serialized inline with the base element under the `type` key, e.g.
/// `{"id": "t1", "type": "text", "text": "hello", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ElementKind {
    Rectangle,
    Ellipse,
    Diamond,
    Frame {
        #[serde(default)]
        name: Option<String>,
    },
    Line {
        #[serde(default)]
        points: Vec<Point>,
    },
    Arrow {
        #[serde(default)]
        points: Vec<Point>,
        #[serde(default)]
        start_binding: Option<PointBinding>,
        #[serde(default)]
        end_binding: Option<PointBinding>,
        #[serde(default)]
        start_arrowhead: Option<String>,
        #[serde(default = "default_end_arrowhead")]
        end_arrowhead: Option<String>,
    },
    Freedraw {
        #[serde(default)]
        points: Vec<Point>,
        #[serde(default)]
        pressures: Vec<f64>,
        #[serde(default = "default_true")]
        simulate_pressure: bool,
    },
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        original_text: Option<String>,
        #[serde(default = "default_font_size")]
        font_size: f64,
        #[serde(default = "default_font_family")]
        font_family: u32,
        #[serde(default = "default_text_align")]
        text_align: String,
        #[serde(default = "default_vertical_align")]
        vertical_align: String,
        #[serde(default = "default_line_height")]
        line_height: f64,
        /// Shape this text is bound inside
        #[serde(default)]
        container_id: Option<String>,
    },
    Image {
        #[serde(default)]
        file_id: Option<String>,
        #[serde(default = "default_image_status")]
        status: String,
    },
}

impl ElementKind {
    /// Text kind with default typography
    pub fn text(text: impl Into<String>) -> Self {
        ElementKind::Text {
            text: text.into(),
            original_text: None,
            font_size: default_font_size(),
            font_family: default_font_family(),
            text_align: default_text_align(),
            vertical_align: default_vertical_align(),
            line_height: default_line_height(),
            container_id: None,
        }
    }

    pub fn line(points: Vec<Point>) -> Self {
        ElementKind::Line { points }
    }

    pub fn arrow(points: Vec<Point>) -> Self {
        ElementKind::Arrow {
            points,
            start_binding: None,
            end_binding: None,
            start_arrowhead: None,
            end_arrowhead: default_end_arrowhead(),
        }
    }

    pub fn freedraw(points: Vec<Point>) -> Self {
        ElementKind::Freedraw {
            points,
            pressures: Vec::new(),
            simulate_pressure: true,
        }
    }

    /// The wire name of this kind (`"rectangle"`, `"text"`, ...)
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementKind::Rectangle => "rectangle",
            ElementKind::Ellipse => "ellipse",
            ElementKind::Diamond => "diamond",
            ElementKind::Frame { .. } => "frame",
            ElementKind::Line { .. } => "line",
            ElementKind::Arrow { .. } => "arrow",
            ElementKind::Freedraw { .. } => "freedraw",
            ElementKind::Text { .. } => "text",
            ElementKind::Image { .. } => "image",
        }
    }

    /// Point sequence for line, arrow and freedraw
    pub fn points(&self) -> Option<&[Point]> {
        match self {
            ElementKind::Line { points }
            | ElementKind::Arrow { points, .. }
            | ElementKind::Freedraw { points, .. } => Some(points.as_slice()),
            _ => None,
        }
    }

    pub fn points_mut(&mut self) -> Option<&mut Vec<Point>> {
        match self {
            ElementKind::Line { points }
            | ElementKind::Arrow { points, .. }
            | ElementKind::Freedraw { points, .. } => Some(points),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_end_arrowhead() -> Option<String> {
    Some("arrow".to_string())
}

fn default_font_size() -> f64 {
    20.0
}

fn default_font_family() -> u32 {
    1
}

fn default_text_align() -> String {
    "left".to_string()
}

fn default_vertical_align() -> String {
    "top".to_string()
}

fn default_line_height() -> f64 {
    1.25
}

fn default_image_status() -> String {
    "pending".to_string()
}
