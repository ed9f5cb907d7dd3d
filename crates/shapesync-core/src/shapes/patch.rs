//! Partial updates merged into existing shape records.

use super::{SerializableColor, ShapeId, ShapeRecord};
use serde::{Deserialize, Deserializer, Serialize};

/// A set of optional field changes for `update_shape`.
///
/// `None` leaves a field untouched. Fields that are themselves optional on the
/// record use a nested `Option` so they can be cleared: in JSON an absent key
/// leaves the field alone and an explicit `null` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapePatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub width: Option<Option<f64>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub height: Option<Option<f64>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub radius: Option<Option<f64>>,
    pub points: Option<Vec<f64>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub text: Option<Option<String>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub src: Option<Option<String>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub fill: Option<Option<SerializableColor>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub stroke: Option<Option<SerializableColor>>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub rotation: Option<f64>,
    pub scale_x: Option<f64>,
    pub scale_y: Option<f64>,
    pub visible: Option<bool>,
    pub locked: Option<bool>,
    pub z_index: Option<i64>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<ShapeId>>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub children: Option<Option<Vec<ShapeId>>>,
}

/// Maps a present key to `Some`, so `null` becomes `Some(None)`.
fn clearable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ShapePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the anchor to `(x, y)`.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn size(width: f64, height: f64) -> Self {
        Self {
            width: Some(Some(width)),
            height: Some(Some(height)),
            ..Self::default()
        }
    }

    pub fn group(group_id: Option<ShapeId>) -> Self {
        Self {
            group_id: Some(group_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge this patch into `record`. Returns true if any field changed.
    pub fn apply(&self, record: &mut ShapeRecord) -> bool {
        let before = record.clone();

        if let Some(x) = self.x {
            record.x = x;
        }
        if let Some(y) = self.y {
            record.y = y;
        }
        if let Some(width) = self.width {
            record.width = width;
        }
        if let Some(height) = self.height {
            record.height = height;
        }
        if let Some(radius) = self.radius {
            record.radius = radius;
        }
        if let Some(points) = &self.points {
            record.points = points.clone();
        }
        if let Some(text) = &self.text {
            record.text = text.clone();
        }
        if let Some(src) = &self.src {
            record.src = src.clone();
        }
        if let Some(fill) = self.fill {
            record.style.fill = fill;
        }
        if let Some(stroke) = self.stroke {
            record.style.stroke = stroke;
        }
        if let Some(stroke_width) = self.stroke_width {
            record.style.stroke_width = stroke_width;
        }
        if let Some(opacity) = self.opacity {
            record.style.opacity = opacity.clamp(0.0, 1.0);
        }
        if let Some(rotation) = self.rotation {
            record.rotation = rotation;
        }
        if let Some(scale_x) = self.scale_x {
            record.scale_x = scale_x;
        }
        if let Some(scale_y) = self.scale_y {
            record.scale_y = scale_y;
        }
        if let Some(visible) = self.visible {
            record.visible = visible;
        }
        if let Some(locked) = self.locked {
            record.locked = locked;
        }
        if let Some(z_index) = self.z_index {
            record.z_index = z_index;
        }
        if let Some(group_id) = &self.group_id {
            record.group_id = group_id.clone();
        }
        if let Some(children) = &self.children {
            record.children = children.clone();
        }

        *record != before
    }
}
