//! Conversion between QuPath-style GeoJSON features and Concentriq annotations.
//!
//! Concentriq stores annotation geometry in viewport coordinates, where the
//! full image width spans [`VIEWPORT_SIZE`] units. GeoJSON features are in
//! pixel coordinates.

use geo::{Area, BooleanOps, LineString, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::{Annotation, Image};

pub const VIEWPORT_SIZE: f64 = 10000.0;
/// Opaque `#c80000`, the default QuPath class color.
pub const DEFAULT_COLOR_RGB: i32 = -3670016;
const CAPTURE_BOUNDS: &str = "0.0 0.0 10000.0 10000.0";
const FREE_SHAPE: &str = "free";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type", default = "feature_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Properties,
}

fn feature_type() -> String {
    "Feature".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// Absent for a GeometryCollection.
    #[serde(default)]
    pub coordinates: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub measurements: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Signed 32-bit ARGB.
    #[serde(rename = "colorRGB", default, skip_serializing_if = "Option::is_none")]
    pub color_rgb: Option<i32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GeoJsonDocument {
    Features(Vec<Value>),
    Collection { features: Vec<Value> },
    Single(Map<String, Value>),
}

/// Split a GeoJSON document into its raw features: a bare array (as QuPath
/// exports them), a FeatureCollection, or a single feature.
///
/// Features are decoded one by one with [`decode_feature`] so that a
/// feature of an unknown shape does not reject the whole document.
pub fn parse_features(json: &str) -> Result<Vec<Value>> {
    Ok(match serde_json::from_str::<GeoJsonDocument>(json)? {
        GeoJsonDocument::Features(features) => features,
        GeoJsonDocument::Collection { features } => features,
        GeoJsonDocument::Single(feature) => vec![Value::Object(feature)],
    })
}

pub fn decode_feature(value: Value) -> Result<Feature> {
    serde_json::from_value(value).map_err(|e| Error::Unsupported(format!("feature: {e}")))
}

fn viewport_scale(image: &Image) -> Result<f64> {
    if image.img_width == 0 {
        return Err(Error::UnexpectedResponse(format!(
            "image {} reports a width of 0",
            image.id
        )));
    }
    Ok(VIEWPORT_SIZE / f64::from(image.img_width))
}

/// Build a new (unsaved) annotation for `image` from a GeoJSON feature.
pub fn from_geojson(feature: &Feature, image: &Image) -> Result<Annotation> {
    let scale = viewport_scale(image)?;
    if feature.geometry.kind != "Polygon" {
        return Err(Error::Unsupported(format!(
            "geometry type {:?}",
            feature.geometry.kind
        )));
    }
    let rings: Vec<Vec<Vec<f64>>> = serde_json::from_value(feature.geometry.coordinates.clone())?;
    let exterior = rings
        .first()
        .ok_or_else(|| Error::Unsupported("polygon without exterior ring".into()))?;
    let points = exterior
        .iter()
        .map(|pt| match pt.as_slice() {
            [x, y, ..] => Ok(format!("{:.6},{:.6}", x * scale, y * scale)),
            _ => Err(Error::Unsupported(format!("coordinate {pt:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    let classification = feature.properties.classification.clone().unwrap_or_default();
    let [_, r, g, b] = classification
        .color_rgb
        .unwrap_or(DEFAULT_COLOR_RGB)
        .to_be_bytes();

    Ok(Annotation {
        text: classification.name.unwrap_or_default(),
        shape: FREE_SHAPE.into(),
        shape_string: points.join(" "),
        capture_bounds: Some(CAPTURE_BOUNDS.into()),
        image_id: image.id,
        color: format!("#{r:02x}{g:02x}{b:02x}"),
        is_negative: false,
        is_segmenting: false,
        ..Default::default()
    })
}

/// Convert a stored annotation into a GeoJSON feature in pixel coordinates.
pub fn to_geojson(annotation: &Annotation, image: &Image) -> Result<Feature> {
    let scale = 1.0 / viewport_scale(image)?;
    if annotation.shape != FREE_SHAPE {
        return Err(Error::Unsupported(format!("shape {:?}", annotation.shape)));
    }

    let ring: Vec<Vec<f64>> = shape_points(annotation)?
        .into_iter()
        .map(|(x, y)| vec![x * scale, y * scale])
        .collect();

    Ok(Feature {
        kind: feature_type(),
        id: Some(Value::String("PathAnnotationObject".into())),
        geometry: Geometry {
            kind: "Polygon".into(),
            coordinates: serde_json::to_value(vec![ring])?,
        },
        properties: Properties {
            classification: Some(Classification {
                name: Some(annotation.text.clone()),
                color_rgb: Some(parse_color(&annotation.color)?),
            }),
            is_locked: false,
            measurements: Vec::new(),
            extra: Map::new(),
        },
    })
}

/// Rebuild a `free` annotation whose outline is not a valid polygon.
///
/// The outline is unioned with itself, which splits self-intersections
/// into simple rings, and the largest resulting ring is kept. Works in
/// viewport coordinates.
pub fn repair(annotation: &Annotation) -> Result<Annotation> {
    if annotation.shape != FREE_SHAPE {
        return Err(Error::Unsupported(format!("shape {:?}", annotation.shape)));
    }
    let polygon = Polygon::new(LineString::from(shape_points(annotation)?), vec![]);
    let repaired = polygon
        .union(&polygon)
        .0
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
        .ok_or_else(|| Error::Unsupported("outline has no area".into()))?;

    let points: Vec<String> = repaired
        .exterior()
        .coords()
        .map(|c| format!("{:.6},{:.6}", c.x, c.y))
        .collect();
    Ok(Annotation {
        shape_string: points.join(" "),
        ..annotation.clone()
    })
}

fn shape_points(annotation: &Annotation) -> Result<Vec<(f64, f64)>> {
    annotation
        .shape_string
        .split_whitespace()
        .map(|pt| {
            let (x, y) = pt
                .split_once(',')
                .ok_or_else(|| bad_shape(annotation, pt))?;
            let x: f64 = x.parse().map_err(|_| bad_shape(annotation, pt))?;
            let y: f64 = y.parse().map_err(|_| bad_shape(annotation, pt))?;
            Ok((x, y))
        })
        .collect()
}

fn bad_shape(annotation: &Annotation, point: &str) -> Error {
    Error::UnexpectedResponse(format!(
        "annotation {:?} has malformed point {point:?}",
        annotation.id
    ))
}

/// `#rrggbb` to opaque signed ARGB.
fn parse_color(color: &str) -> Result<i32> {
    let hex = color
        .strip_prefix('#')
        .filter(|h| h.len() == 6 && h.is_ascii())
        .ok_or_else(|| Error::UnexpectedResponse(format!("invalid color {color:?}")))?;
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| Error::UnexpectedResponse(format!("invalid color {color:?}")))
    };
    Ok(i32::from_be_bytes([0xff, channel(0)?, channel(2)?, channel(4)?]))
}
