//! Element base record
//!
//! The common fields shared by every drawable element: geometry, style,
//! versioning and binding back-references. Type-specific fields are kept in
//! the flattened [`ElementKind`].

use crate::{BoundElement, ElementKind, Point};
use serde::{Deserialize, Serialize};

/// A drawable unit of the shared canvas.
///
/// `version` is a monotonic edit counter and `version_nonce` a random
/// tie-breaker regenerated on every mutation. Both are optional so that
/// elements built by a host without versioning still diff correctly (the
/// differ falls back to field comparison).
///
/// Unset optional properties serialize as `null` rather than being left
/// out, so a full element on the wire also says which properties are clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    #[serde(flatten)]
    pub kind: ElementKind,

    // Geometry
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub angle: f64,

    // Style
    #[serde(default = "default_stroke_color")]
    pub stroke_color: String,
    #[serde(default = "default_background_color")]
    pub background_color: String,
    #[serde(default = "default_fill_style")]
    pub fill_style: String,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    #[serde(default = "default_stroke_style")]
    pub stroke_style: String,
    #[serde(default = "default_roughness")]
    pub roughness: u32,
    #[serde(default = "default_opacity")]
    pub opacity: f64,

    // Versioning
    #[serde(default = "random_seed")]
    pub seed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_nonce: Option<u32>,
    /// Last mutation time (ms since epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default)]
    pub is_deleted: bool,

    // Relations
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub bound_elements: Option<Vec<BoundElement>>,
    /// Explicit z-order key; array position carries no ordering meaning
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub locked: bool,
}

impl Element {
    /// Create an element with default geometry and style
    pub fn new(id: impl Into<String>, kind: ElementKind) -> Self {
        Self {
            id: id.into(),
            kind,
            x: 0.0,
            y: 0.0,
            width: 0.0,
            height: 0.0,
            angle: 0.0,
            stroke_color: default_stroke_color(),
            background_color: default_background_color(),
            fill_style: default_fill_style(),
            stroke_width: default_stroke_width(),
            stroke_style: default_stroke_style(),
            roughness: default_roughness(),
            opacity: default_opacity(),
            seed: random_seed(),
            version: Some(1),
            version_nonce: Some(random_nonce()),
            updated: None,
            is_deleted: false,
            group_ids: Vec::new(),
            bound_elements: None,
            index: None,
            link: None,
            locked: false,
        }
    }

    /// Rectangle at `(x, y)` with the given size
    pub fn rectangle(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(id, ElementKind::Rectangle).at(x, y).sized(width, height)
    }

    pub fn ellipse(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(id, ElementKind::Ellipse).at(x, y).sized(width, height)
    }

    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, ElementKind::text(text))
    }

    /// Line through `points`, sized to their bounding box
    pub fn line(id: impl Into<String>, points: Vec<Point>) -> Self {
        let (w, h) = extent(&points);
        Self::new(id, ElementKind::line(points)).sized(w, h)
    }

    pub fn arrow(id: impl Into<String>, points: Vec<Point>) -> Self {
        let (w, h) = extent(&points);
        Self::new(id, ElementKind::arrow(points)).sized(w, h)
    }

    /// Move to `(x, y)`
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn sized(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Bind this text element inside `container_id`.
    ///
    /// Has no effect on non-text elements.
    pub fn in_container(mut self, container_id: impl Into<String>) -> Self {
        if let ElementKind::Text { container_id: c, .. } = &mut self.kind {
            *c = Some(container_id.into());
        }
        self
    }

    /// Add a back-reference to an element bound to this one
    pub fn with_bound(mut self, bound: BoundElement) -> Self {
        self.bound_elements.get_or_insert_with(Vec::new).push(bound);
        self
    }

    /// Strip versioning metadata so only content remains
    pub fn without_versioning(mut self) -> Self {
        self.version = None;
        self.version_nonce = None;
        self.updated = None;
        self
    }

    // ========== Accessors ==========

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, ElementKind::Text { .. })
    }

    /// Line, arrow or freedraw
    pub fn is_linear(&self) -> bool {
        self.kind.points().is_some()
    }

    /// Text content, for text elements
    pub fn text_content(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Replace text content. Returns false for non-text elements.
    pub fn set_text(&mut self, value: impl Into<String>) -> bool {
        match &mut self.kind {
            ElementKind::Text { text, .. } => {
                *text = value.into();
                true
            }
            _ => false,
        }
    }

    pub fn container_id(&self) -> Option<&str> {
        match &self.kind {
            ElementKind::Text { container_id, .. } => container_id.as_deref(),
            _ => None,
        }
    }

    pub fn points(&self) -> Option<&[Point]> {
        self.kind.points()
    }

    /// Ids of text elements bound to this one
    pub fn bound_text_ids(&self) -> impl Iterator<Item = &str> {
        self.bound_elements
            .iter()
            .flatten()
            .filter(|b| b.kind == crate::BoundElementKind::Text)
            .map(|b| b.id.as_str())
    }

    /// Compare everything except `version`, `version_nonce` and `updated`
    pub fn content_eq(&self, other: &Element) -> bool {
        self.clone().without_versioning() == other.clone().without_versioning()
    }

    /// Record a mutation: bump `version`, draw a fresh nonce, stamp `updated`
    pub fn bump_version(&mut self, now_ms: i64) {
        self.version = Some(self.version.unwrap_or(1) + 1);
        self.version_nonce = Some(random_nonce());
        self.updated = Some(now_ms);
    }
}

/// Random rendering seed
pub fn random_seed() -> u32 {
    rand::random::<u32>()
}

/// Random version tie-breaker
pub fn random_nonce() -> u32 {
    rand::random::<u32>()
}

fn extent(points: &[Point]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    (max_x - min_x, max_y - min_y)
}

fn default_stroke_color() -> String {
    "#1e1e1e".to_string()
}

fn default_background_color() -> String {
    "transparent".to_string()
}

fn default_fill_style() -> String {
    "solid".to_string()
}

fn default_stroke_width() -> f64 {
    2.0
}

fn default_stroke_style() -> String {
    "solid".to_string()
}

fn default_roughness() -> u32 {
    1
}

fn default_opacity() -> f64 {
    100.0
}
