//! Typed records for the Concentriq REST API.
//!
//! Field names follow the API's camelCase keys. A few numeric fields are
//! sometimes sent as strings by the server (`totalSize: "0"`), those go
//! through the lenient deserializers in [`lenient`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;

/// Sharing permissions attached to most records.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SharePermissions {
    pub can_create_annotations: bool,
    pub can_manage_annotations: bool,
    pub can_manage_image_set_share_permissions: bool,
    pub can_manage_images: bool,
    pub can_manage_metadata_fields: bool,
    pub can_manage_metadata_values: bool,
    pub can_modify_image_set: bool,
    pub can_update_navigation: bool,
    pub can_export_data: bool,
}

/// A group of imagesets (`imageSetGroups` on the wire).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    pub image_set_count: Option<i64>,
    #[serde(default)]
    pub owner_name: String,
    pub owner_id: i64,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub description: Option<String>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub share_permissions: Option<SharePermissions>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub billing_email: String,
}

/// A collection of images. The web UI calls these repositories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSet {
    pub id: i64,
    pub name: String,
    #[serde(rename = "thumbnailURL", default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub shared_with_public: bool,
    #[serde(default)]
    pub is_favorite: bool,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient::int")]
    pub image_count: i64,
    #[serde(default, deserialize_with = "lenient::int")]
    pub total_size: i64,
    #[serde(default)]
    pub owner_name: String,
    pub owner_id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub share_permissions: Option<SharePermissions>,
    /// Keys this client does not model yet.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A folder inside an imageset. `folder_parent_id == None` is the root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: i64,
    pub label: String,
    pub image_set_id: i64,
    #[serde(default)]
    pub folder_parent_id: Option<i64>,
    #[serde(default)]
    pub image_set_name: String,
    #[serde(default)]
    pub has_metadata: bool,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub rank: i64,
    pub owner_id: i64,
    #[serde(default)]
    pub share_permissions: Option<SharePermissions>,
}

/// Processing state of an image on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Error,
    Uploading,
    /// Setting an image to this state triggers (re)optimization.
    Optimizing,
    Success,
}

impl ImageStatus {
    pub fn code(self) -> i64 {
        match self {
            ImageStatus::Error => -1,
            ImageStatus::Uploading => 0,
            ImageStatus::Optimizing => 1,
            ImageStatus::Success => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(ImageStatus::Error),
            0 => Some(ImageStatus::Uploading),
            1 => Some(ImageStatus::Optimizing),
            2 => Some(ImageStatus::Success),
            _ => None,
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageStatus::Error => "error",
            ImageStatus::Uploading => "uploading",
            ImageStatus::Optimizing => "optimizing",
            ImageStatus::Success => "success",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: i64,
    pub name: String,
    pub image_set_id: i64,
    #[serde(default)]
    pub image_set_name: String,
    #[serde(default)]
    pub folder_parent_id: Option<i64>,
    pub owner_id: i64,
    #[serde(default)]
    pub rank: i64,
    #[serde(default)]
    pub has_macro: bool,
    #[serde(default)]
    pub has_label: bool,
    #[serde(default)]
    pub has_overlays: bool,
    #[serde(default)]
    pub has_multiple_z_layers: bool,
    #[serde(default)]
    pub has_annotations: bool,
    #[serde(default)]
    pub has_analysis_results: bool,
    #[serde(default)]
    pub mppx: Option<f64>,
    #[serde(default)]
    pub mppy: Option<f64>,
    pub img_width: u32,
    pub img_height: u32,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub objective_power: Option<f64>,
    #[serde(default)]
    pub slide_name: String,
    /// Human readable size as reported by the server.
    #[serde(default, deserialize_with = "lenient::string")]
    pub filesize: String,
    pub status: i64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub storage_key: String,
    #[serde(default)]
    pub associated_key: String,
    #[serde(rename = "thumbURL", default)]
    pub thumb_url: Value,
    #[serde(default)]
    pub image_data: Option<Value>,
    #[serde(default)]
    pub share_permissions: Option<SharePermissions>,
    #[serde(default)]
    pub selected_storage_system_entry: Option<Value>,
}

impl Image {
    pub fn image_status(&self) -> Option<ImageStatus> {
        ImageStatus::from_code(self.status)
    }

    /// Object key of the image in the backing store.
    pub fn storage_key_for_upload(&self) -> Option<&str> {
        self.selected_storage_system_entry
            .as_ref()?
            .get("imageStorageKey")?
            .as_str()
    }

    /// Signed thumbnail URL; its credential carries the upload access key.
    pub fn signed_thumb_url(&self) -> Option<&str> {
        self.thumb_url.get("signedURL")?.as_str()
    }
}

/// An annotation drawn on an image, in viewport coordinates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Free text; used as the class name since the API has no classes.
    pub text: String,
    pub shape: String,
    pub shape_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_bounds: Option<String>,
    pub image_id: i64,
    pub color: String,
    #[serde(default)]
    pub is_negative: bool,
    #[serde(default)]
    pub is_segmenting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_order_x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_order_y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_permissions: Option<SharePermissions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortBy {
    Name,
    #[default]
    Created,
    LastModified,
    Size,
}

/// Request-side pagination, sent as a JSON string in the `pagination` param.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub rows_per_page: u32,
    pub page: u32,
    pub sort_by: SortBy,
    pub descending: bool,
}

impl Pagination {
    /// Pages are 1-based; a page of 0 is bumped to 1.
    pub fn new(rows_per_page: u32, page: u32, sort_by: SortBy, descending: bool) -> Self {
        Self {
            rows_per_page,
            page: page.max(1),
            sort_by,
            descending,
        }
    }

    pub fn to_query(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response-side pagination from `meta.pagination`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationInfo {
    #[serde(default)]
    pub rows_per_page: Option<i64>,
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default, deserialize_with = "lenient::int")]
    pub rows_returned: i64,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    pub total_rows: Option<i64>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub descending: Option<bool>,
}

impl fmt::Display for PaginationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}", self.page.unwrap_or(1))?;
        if let Some(n) = self.rows_per_page {
            write!(f, " ({n} per page)")?;
        }
        write!(f, ": {} rows returned", self.rows_returned)?;
        if let Some(total) = self.total_rows {
            write!(f, " of {total}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreatedFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_set_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Vec<String>>,
    /// Phrases searched over several fields and case properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general_search: Option<Vec<String>>,
    /// Metadata field id to content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<i64, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_overlays: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_multiple_z_layers: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_annotations: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_analysis_results: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<CreatedFilters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FolderFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_set_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_metadata: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachments: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub general_search: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<i64, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageFilters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<i64, Value>>,
}

/// Filter sets serialized into the `filters` query parameter.
pub trait Filters: Serialize {
    fn to_query(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Filters for ImageFilters {}
impl Filters for FolderFilters {}
impl Filters for AnnotationFilters {}

/// Deserializers for fields the server encodes inconsistently.
pub(crate) mod lenient {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    fn value_to_int<E: Error>(value: Value) -> Result<Option<i64>, E> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| E::custom(format!("not an integer: {n}"))),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| E::custom(format!("not an integer: {s:?}"))),
            other => Err(E::custom(format!("not an integer: {other}"))),
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        Ok(value_to_int::<D::Error>(Value::deserialize(d)?)?.unwrap_or_default())
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        value_to_int(Value::deserialize(d)?)
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => String::new(),
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}
