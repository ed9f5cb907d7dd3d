//! Conversion between shape records and Loro values.

use crate::shapes::{SerializableColor, ShapeId, ShapeKind, ShapeRecord, ShapeStyle};
use loro::{LoroList, LoroMap, LoroMapValue, LoroResult, LoroValue};

// Common keys
const KEY_TYPE: &str = "type";
const KEY_ID: &str = "id";

// Geometry keys
const KEY_X: &str = "x";
const KEY_Y: &str = "y";
const KEY_WIDTH: &str = "width";
const KEY_HEIGHT: &str = "height";
const KEY_RADIUS: &str = "radius";
const KEY_POINTS: &str = "points";

// Content keys
const KEY_TEXT: &str = "text";
const KEY_SRC: &str = "src";

// Style keys
const KEY_HAS_STROKE: &str = "has_stroke";
const KEY_STROKE_R: &str = "stroke_r";
const KEY_STROKE_G: &str = "stroke_g";
const KEY_STROKE_B: &str = "stroke_b";
const KEY_STROKE_A: &str = "stroke_a";
const KEY_STROKE_WIDTH: &str = "stroke_width";
const KEY_HAS_FILL: &str = "has_fill";
const KEY_FILL_R: &str = "fill_r";
const KEY_FILL_G: &str = "fill_g";
const KEY_FILL_B: &str = "fill_b";
const KEY_FILL_A: &str = "fill_a";
const KEY_OPACITY: &str = "opacity";

// Transform and flags
const KEY_ROTATION: &str = "rotation";
const KEY_SCALE_X: &str = "scale_x";
const KEY_SCALE_Y: &str = "scale_y";
const KEY_VISIBLE: &str = "visible";
const KEY_LOCKED: &str = "locked";
const KEY_Z_INDEX: &str = "z_index";

// Grouping
const KEY_GROUP_ID: &str = "group_id";
const KEY_CHILDREN: &str = "children";

// Helper functions to extract values from LoroMapValue (derefs to HashMap<String, LoroValue>)
fn get_double(map: &LoroMapValue, key: &str) -> Option<f64> {
    match map.get(key)? {
        LoroValue::Double(d) => Some(*d),
        LoroValue::I64(i) => Some(*i as f64),
        _ => None,
    }
}

fn get_i64(map: &LoroMapValue, key: &str) -> Option<i64> {
    match map.get(key)? {
        LoroValue::I64(i) => Some(*i),
        LoroValue::Double(d) => Some(*d as i64),
        _ => None,
    }
}

fn get_string(map: &LoroMapValue, key: &str) -> Option<String> {
    match map.get(key)? {
        LoroValue::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn get_bool(map: &LoroMapValue, key: &str) -> Option<bool> {
    match map.get(key)? {
        LoroValue::Bool(b) => Some(*b),
        _ => None,
    }
}

fn get_u8(map: &LoroMapValue, key: &str) -> Option<u8> {
    get_i64(map, key).map(|v| v.clamp(0, 255) as u8)
}

/// Write every field of `record` into an empty Loro map.
pub fn record_to_loro(record: &ShapeRecord, map: &LoroMap) -> LoroResult<()> {
    map.insert(KEY_TYPE, record.kind.as_str())?;
    map.insert(KEY_ID, record.id.as_str())?;
    map.insert(KEY_X, record.x)?;
    map.insert(KEY_Y, record.y)?;

    if let Some(width) = record.width {
        map.insert(KEY_WIDTH, width)?;
    }
    if let Some(height) = record.height {
        map.insert(KEY_HEIGHT, height)?;
    }
    if let Some(radius) = record.radius {
        map.insert(KEY_RADIUS, radius)?;
    }
    if !record.points.is_empty() {
        let points = map.insert_container(KEY_POINTS, LoroList::new())?;
        for coord in &record.points {
            points.push(*coord)?;
        }
    }
    if let Some(text) = &record.text {
        map.insert(KEY_TEXT, text.as_str())?;
    }
    if let Some(src) = &record.src {
        map.insert(KEY_SRC, src.as_str())?;
    }

    style_to_loro(&record.style, map)?;

    map.insert(KEY_ROTATION, record.rotation)?;
    map.insert(KEY_SCALE_X, record.scale_x)?;
    map.insert(KEY_SCALE_Y, record.scale_y)?;
    map.insert(KEY_VISIBLE, record.visible)?;
    map.insert(KEY_LOCKED, record.locked)?;
    map.insert(KEY_Z_INDEX, record.z_index)?;

    if let Some(group_id) = &record.group_id {
        map.insert(KEY_GROUP_ID, group_id.as_str())?;
    }
    if let Some(children) = &record.children {
        let list = map.insert_container(KEY_CHILDREN, LoroList::new())?;
        for child in children {
            list.push(child.as_str())?;
        }
    }

    Ok(())
}

fn style_to_loro(style: &ShapeStyle, map: &LoroMap) -> LoroResult<()> {
    map.insert(KEY_STROKE_WIDTH, style.stroke_width)?;
    map.insert(KEY_OPACITY, style.opacity)?;

    if let Some(stroke) = style.stroke {
        map.insert(KEY_HAS_STROKE, true)?;
        map.insert(KEY_STROKE_R, stroke.r as i64)?;
        map.insert(KEY_STROKE_G, stroke.g as i64)?;
        map.insert(KEY_STROKE_B, stroke.b as i64)?;
        map.insert(KEY_STROKE_A, stroke.a as i64)?;
    } else {
        map.insert(KEY_HAS_STROKE, false)?;
    }

    if let Some(fill) = style.fill {
        map.insert(KEY_HAS_FILL, true)?;
        map.insert(KEY_FILL_R, fill.r as i64)?;
        map.insert(KEY_FILL_G, fill.g as i64)?;
        map.insert(KEY_FILL_B, fill.b as i64)?;
        map.insert(KEY_FILL_A, fill.a as i64)?;
    } else {
        map.insert(KEY_HAS_FILL, false)?;
    }

    Ok(())
}

/// Rebuild a record from its materialized Loro map.
///
/// Returns `None` when the required fields (`type`, `id`, `x`, `y`) are
/// missing or malformed.
pub fn record_from_loro(map: &LoroMapValue) -> Option<ShapeRecord> {
    let kind = ShapeKind::from_name(&get_string(map, KEY_TYPE)?)?;
    let id = ShapeId::from(get_string(map, KEY_ID)?);
    let x = get_double(map, KEY_X)?;
    let y = get_double(map, KEY_Y)?;

    let points = match map.get(KEY_POINTS) {
        Some(LoroValue::List(list)) => list
            .iter()
            .filter_map(|v| match v {
                LoroValue::Double(d) => Some(*d),
                LoroValue::I64(i) => Some(*i as f64),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let children = match map.get(KEY_CHILDREN) {
        Some(LoroValue::List(list)) => Some(
            list.iter()
                .filter_map(|v| match v {
                    LoroValue::String(s) => Some(ShapeId::from(s.to_string())),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    };

    Some(ShapeRecord {
        id,
        kind,
        x,
        y,
        width: get_double(map, KEY_WIDTH),
        height: get_double(map, KEY_HEIGHT),
        radius: get_double(map, KEY_RADIUS),
        points,
        text: get_string(map, KEY_TEXT),
        src: get_string(map, KEY_SRC),
        style: style_from_loro(map),
        rotation: get_double(map, KEY_ROTATION).unwrap_or(0.0),
        scale_x: get_double(map, KEY_SCALE_X).unwrap_or(1.0),
        scale_y: get_double(map, KEY_SCALE_Y).unwrap_or(1.0),
        visible: get_bool(map, KEY_VISIBLE).unwrap_or(true),
        locked: get_bool(map, KEY_LOCKED).unwrap_or(false),
        z_index: get_i64(map, KEY_Z_INDEX).unwrap_or(0),
        group_id: get_string(map, KEY_GROUP_ID).map(ShapeId::from),
        children,
    })
}

fn style_from_loro(map: &LoroMapValue) -> ShapeStyle {
    let defaults = ShapeStyle::default();

    let stroke = if get_bool(map, KEY_HAS_STROKE).unwrap_or(false) {
        Some(SerializableColor::new(
            get_u8(map, KEY_STROKE_R).unwrap_or(0),
            get_u8(map, KEY_STROKE_G).unwrap_or(0),
            get_u8(map, KEY_STROKE_B).unwrap_or(0),
            get_u8(map, KEY_STROKE_A).unwrap_or(255),
        ))
    } else {
        None
    };

    let fill = if get_bool(map, KEY_HAS_FILL).unwrap_or(false) {
        Some(SerializableColor::new(
            get_u8(map, KEY_FILL_R).unwrap_or(0),
            get_u8(map, KEY_FILL_G).unwrap_or(0),
            get_u8(map, KEY_FILL_B).unwrap_or(0),
            get_u8(map, KEY_FILL_A).unwrap_or(255),
        ))
    } else {
        None
    };

    ShapeStyle {
        fill,
        stroke,
        stroke_width: get_double(map, KEY_STROKE_WIDTH).unwrap_or(defaults.stroke_width),
        opacity: get_double(map, KEY_OPACITY).unwrap_or(defaults.opacity),
    }
}
