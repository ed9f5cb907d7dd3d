//! Shape records stored in the shared document.

mod patch;

pub use patch::ShapePatch;

use kurbo::{Point, Rect};
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for shapes, stable across replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ShapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The kind of a shape record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rect,
    Circle,
    Polygon,
    Star,
    Arrow,
    Line,
    Text,
    Image,
    Group,
}

impl ShapeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeKind::Rect => "rect",
            ShapeKind::Circle => "circle",
            ShapeKind::Polygon => "polygon",
            ShapeKind::Star => "star",
            ShapeKind::Arrow => "arrow",
            ShapeKind::Line => "line",
            ShapeKind::Text => "text",
            ShapeKind::Image => "image",
            ShapeKind::Group => "group",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rect" => ShapeKind::Rect,
            "circle" => ShapeKind::Circle,
            "polygon" => ShapeKind::Polygon,
            "star" => ShapeKind::Star,
            "arrow" => ShapeKind::Arrow,
            "line" => ShapeKind::Line,
            "text" => ShapeKind::Text,
            "image" => ShapeKind::Image,
            "group" => ShapeKind::Group,
            _ => return None,
        })
    }
}

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    /// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().strip_prefix('#')?;
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => Some(Self::new(
                channel(&hex[0..1])? * 17,
                channel(&hex[1..2])? * 17,
                channel(&hex[2..3])? * 17,
                255,
            )),
            6 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                255,
            )),
            8 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                channel(&hex[6..8])?,
            )),
            _ => None,
        }
    }

    /// Format as `#rrggbb`, or `#rrggbbaa` when not fully opaque.
    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

impl From<Color> for SerializableColor {
    fn from(color: Color) -> Self {
        let rgba = color.to_rgba8();
        Self {
            r: rgba.r,
            g: rgba.g,
            b: rgba.b,
            a: rgba.a,
        }
    }
}

impl From<SerializableColor> for Color {
    fn from(color: SerializableColor) -> Self {
        Color::from_rgba8(color.r, color.g, color.b, color.a)
    }
}

/// Style properties for shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeStyle {
    /// Fill color (None = no fill).
    pub fill: Option<SerializableColor>,
    /// Stroke color (None = no outline).
    pub stroke: Option<SerializableColor>,
    pub stroke_width: f64,
    /// Overall opacity (0.0 = fully transparent, 1.0 = fully opaque).
    pub opacity: f64,
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            fill: None,
            stroke: Some(SerializableColor::black()),
            stroke_width: 2.0,
            opacity: 1.0,
        }
    }
}

/// One vector shape in the shared document.
///
/// Geometry is absolute: `x`/`y` is the anchor (top-left for boxed shapes),
/// `width`/`height` are optional and treated as zero when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    /// Flat `[x0, y0, x1, y1, ...]` list for lines, arrows and polygons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Image source (URL or data URI).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default)]
    pub style: ShapeStyle,
    /// Rotation in degrees.
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "unit_scale")]
    pub scale_x: f64,
    #[serde(default = "unit_scale")]
    pub scale_y: f64,
    #[serde(default = "visible_default")]
    pub visible: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub z_index: i64,
    /// Back-reference to the owning group, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<ShapeId>,
    /// Member ids; only present on group records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ShapeId>>,
}

fn unit_scale() -> f64 {
    1.0
}

fn visible_default() -> bool {
    true
}

impl ShapeRecord {
    /// Create a record with a fresh id at the given anchor.
    pub fn new(kind: ShapeKind, x: f64, y: f64) -> Self {
        Self {
            id: ShapeId::new(),
            kind,
            x,
            y,
            width: None,
            height: None,
            radius: None,
            points: Vec::new(),
            text: None,
            src: None,
            style: ShapeStyle::default(),
            rotation: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
            visible: true,
            locked: false,
            z_index: 0,
            group_id: None,
            children: if kind == ShapeKind::Group { Some(Vec::new()) } else { None },
        }
    }

    pub fn with_id(mut self, id: impl Into<ShapeId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn with_points(mut self, points: Vec<f64>) -> Self {
        self.points = points;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_fill(mut self, fill: SerializableColor) -> Self {
        self.style.fill = Some(fill);
        self
    }

    pub fn is_group(&self) -> bool {
        self.kind == ShapeKind::Group
    }

    /// Width, or zero when the shape has no horizontal extent.
    pub fn extent_x(&self) -> f64 {
        self.width.unwrap_or(0.0)
    }

    /// Height, or zero when the shape has no vertical extent.
    pub fn extent_y(&self) -> f64 {
        self.height.unwrap_or(0.0)
    }

    pub fn origin(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Axis-aligned bounds used by grouping, alignment and distribution.
    pub fn bounds(&self) -> Rect {
        Rect::new(self.x, self.y, self.x + self.extent_x(), self.y + self.extent_y())
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        self.x += dx;
        self.y += dy;
    }
}

/// Union of the bounds of all given records, or `None` when empty.
pub fn union_bounds<'a>(records: impl IntoIterator<Item = &'a ShapeRecord>) -> Option<Rect> {
    records
        .into_iter()
        .map(ShapeRecord::bounds)
        .reduce(|acc, b| acc.union(b))
}
