// API client module: typed operations on top of the request proxy.
// Every call is blocking; one CLI invocation runs its requests one after
// the other.

use reqwest::blocking::multipart;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File};
use std::path::Path;

use crate::annotations::{self, Feature};
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::models::{
    Annotation, AnnotationFilters, Filters, Folder, FolderFilters, Group, Image, ImageFilters,
    ImageSet, ImageStatus, Organization, Pagination, PaginationInfo, SortBy,
};
use crate::transport::{Params, RequestProxy};
use crate::upload::{self, Chunks, S3Uploader, SigningRequest, UploadObserver};

/// High level client for one Concentriq instance. Holds the request proxy
/// plus the settings used by image uploads.
#[derive(Clone, Debug)]
pub struct ApiClient {
    proxy: RequestProxy,
    storage_endpoint: Option<String>,
    chunk_size: usize,
}

/// Changes applied by [`ApiClient::imageset_update`]. Unset fields are
/// left untouched on the server.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ImageSetUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateImageSet<'a> {
    name: &'a str,
    group_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateImage<'a> {
    name: &'a str,
    size: u64,
    source: &'a str,
    image_set_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    folder_parent_id: Option<i64>,
}

#[derive(Serialize)]
struct StatusUpdate {
    id: i64,
    status: i64,
}

#[derive(Deserialize)]
struct Created {
    id: i64,
}

#[derive(Deserialize)]
struct Signature {
    signature: String,
}

/// Pull `key` out of a response payload.
fn field<T: DeserializeOwned>(mut data: Value, key: &str) -> Result<T> {
    let value = data
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::UnexpectedResponse(format!("response has no {key:?}")))?;
    Ok(serde_json::from_value(value)?)
}

/// Delete endpoints answer `{"success": "..."}`.
fn deleted(data: &Value) -> bool {
    match data.get("success") {
        Some(msg) => {
            tracing::debug!(%msg, "deleted");
            true
        }
        None => false,
    }
}

fn list_params(pagination: Option<&Pagination>, filters: Option<&dyn FilterQuery>) -> Result<Params> {
    let mut params = Params::new();
    if let Some(pg) = pagination {
        params.push(("pagination", pg.to_query()?));
    }
    if let Some(f) = filters {
        params.push(("filters", f.query()?));
    }
    Ok(params)
}

/// Object-safe view of [`Filters`].
trait FilterQuery {
    fn query(&self) -> Result<String>;
}

impl<T: Filters> FilterQuery for T {
    fn query(&self) -> Result<String> {
        self.to_query()
    }
}

impl ApiClient {
    /// Create a client for the instance described by `creds`.
    pub fn new(creds: &Credentials) -> Result<Self> {
        Ok(ApiClient {
            proxy: RequestProxy::new(creds)?,
            storage_endpoint: None,
            chunk_size: upload::CHUNK_SIZE,
        })
    }

    /// Create a client from a credentials file, with `CONCENTRIQ_*`
    /// environment overrides applied.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        Self::new(&Credentials::load(path)?)
    }

    /// Send image data to another S3-compatible endpoint instead of AWS.
    pub fn with_storage_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.storage_endpoint = Some(endpoint.into());
        self
    }

    /// Part size for multipart uploads.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn api_url(&self) -> &str {
        self.proxy.api_url().as_str()
    }

    // --- groups (`imageSetGroups` on the wire) ---

    /// Groups the current user belongs to.
    pub fn group_list(&self) -> Result<Vec<Group>> {
        field(self.proxy.get("imageSetGroups", &Params::new())?, "groups")
    }

    pub fn group_get(&self, group_id: i64) -> Result<Group> {
        let mut data: Value = self.proxy.get(&format!("imageSetGroups/{group_id}"), &Params::new())?;
        // this endpoint reports the imageset count as `imageCount`
        if let Some(obj) = data.as_object_mut() {
            if !obj.contains_key("imageSetCount") {
                if let Some(count) = obj.remove("imageCount") {
                    obj.insert("imageSetCount".into(), count);
                }
            }
        }
        Ok(serde_json::from_value(data)?)
    }

    /// Organizations, only visible to admins.
    pub fn organization_list(&self) -> Result<Vec<Organization>> {
        self.proxy.get("organizations", &Params::new())
    }

    // --- imagesets ---

    pub fn imageset_list(&self) -> Result<Vec<ImageSet>> {
        field(self.proxy.get("imageSets", &Params::new())?, "imageSets")
    }

    pub fn imageset_get(&self, imageset_id: i64) -> Result<ImageSet> {
        self.proxy.get(&format!("imageSets/{imageset_id}"), &Params::new())
    }

    pub fn imageset_create(&self, name: &str, group_id: i64) -> Result<ImageSet> {
        self.proxy
            .post_form("imageSets", &CreateImageSet { name, group_id })
    }

    /// Patch name and/or description, then return the refreshed imageset.
    pub fn imageset_update(&self, imageset_id: i64, update: &ImageSetUpdate) -> Result<ImageSet> {
        if update.is_empty() {
            return self.imageset_get(imageset_id);
        }
        let _: Value = self
            .proxy
            .patch_form(&format!("imageSets/{imageset_id}"), update)?;
        self.imageset_get(imageset_id)
    }

    pub fn imageset_delete(&self, imageset_id: i64) -> Result<bool> {
        let data: Value = self.proxy.delete(&format!("imageSets/{imageset_id}"))?;
        Ok(deleted(&data))
    }

    /// Imageset metadata as csv text.
    pub fn imageset_export_metadata_csv(&self, imageset_id: i64) -> Result<String> {
        self.proxy
            .get_text(&format!("imageSets/{imageset_id}/export/csv"), &Params::new())
    }

    // --- folders ---

    pub fn folder_list(
        &self,
        include_metadata: bool,
        pagination: Option<&Pagination>,
        filters: Option<&FolderFilters>,
    ) -> Result<Vec<Folder>> {
        let mut params = list_params(pagination, filters.map(|f| f as &dyn FilterQuery))?;
        if include_metadata {
            params.push(("includeMetadata", "true".into()));
        }
        let data: Value = if pagination.is_some() {
            self.proxy.get_paginated::<Value>("folders", &params)?.0
        } else {
            self.proxy.get("folders", &params)?
        };
        field(data, "folders")
    }

    // --- images ---

    /// One page of images (or all of them when `pagination` is None),
    /// with the server's pagination info for paginated calls.
    pub fn image_list(
        &self,
        pagination: Option<&Pagination>,
        filters: Option<&ImageFilters>,
    ) -> Result<(Vec<Image>, Option<PaginationInfo>)> {
        let params = list_params(pagination, filters.map(|f| f as &dyn FilterQuery))?;
        if pagination.is_some() {
            let (data, info): (Value, _) = self.proxy.get_paginated("images", &params)?;
            Ok((field(data, "images")?, Some(info)))
        } else {
            let data: Value = self.proxy.get("images", &params)?;
            Ok((field(data, "images")?, None))
        }
    }

    /// Iterate over every page of images matching `filters`.
    pub fn image_pages<'a>(
        &'a self,
        filters: Option<&ImageFilters>,
        page_size: u32,
        sort_by: SortBy,
        descending: bool,
    ) -> Result<impl Iterator<Item = Result<Vec<Image>>> + 'a> {
        let params = list_params(None, filters.map(|f| f as &dyn FilterQuery))?;
        Ok(self
            .proxy
            .pages("images", params, 0, page_size, sort_by, descending)
            .map(|page| page.and_then(|data| field(data, "images"))))
    }

    pub fn image_get(&self, image_id: i64) -> Result<Image> {
        let image: Image = self.proxy.get(&format!("images/{image_id}"), &Params::new())?;
        tracing::debug!(id = image.id, name = %image.name, "fetched image");
        Ok(image)
    }

    /// Signed download URL of the original image file.
    pub fn image_download(&self, image_id: i64) -> Result<String> {
        self.proxy.get_redirect(&format!("images/{image_id}/download"))
    }

    /// Upload a local image file into an imageset.
    ///
    /// The image record is created first; if moving the data fails, the
    /// record is deleted again before the error is returned. On success the
    /// image is switched to optimizing and the refreshed record is returned.
    pub fn image_upload(
        &self,
        path: &Path,
        imageset_id: i64,
        folder_parent_id: Option<i64>,
        observer: &dyn UploadObserver,
    ) -> Result<Image> {
        let size = fs::metadata(path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Upload(format!("{} has no file name", path.display())))?;

        let created: Created = self.proxy.post_form(
            "images",
            &CreateImage {
                name: &name,
                size,
                source: "native",
                image_set_id: imageset_id,
                folder_parent_id,
            },
        )?;
        let image_id = created.id;
        tracing::info!(image_id, %name, size, "created image record");

        if let Err(err) = self.transfer_image_data(image_id, path, size, observer) {
            tracing::warn!(image_id, error = %err, "upload failed, deleting image record");
            if let Err(cleanup) = self.image_delete(image_id) {
                tracing::warn!(image_id, error = %cleanup, "could not delete image record");
            }
            return Err(err);
        }

        let image = self.image_get(image_id)?;
        if image.image_status() != Some(ImageStatus::Uploading) {
            return Err(Error::Upload(format!(
                "image {image_id} should be uploading but has status {}",
                image.status
            )));
        }
        let _: Value = self.proxy.patch_form(
            &format!("images/{image_id}"),
            &StatusUpdate {
                id: image_id,
                status: ImageStatus::Optimizing.code(),
            },
        )?;
        self.image_get(image_id)
    }

    fn transfer_image_data(
        &self,
        image_id: i64,
        path: &Path,
        size: u64,
        observer: &dyn UploadObserver,
    ) -> Result<()> {
        let image = self.image_get(image_id)?;
        let key = image
            .storage_key_for_upload()
            .ok_or_else(|| Error::Upload(format!("image {image_id} has no storage key")))?
            .to_string();
        let signed_url = image
            .signed_thumb_url()
            .ok_or_else(|| Error::Upload(format!("image {image_id} has no signed thumbnail url")))?;

        let mut uploader = S3Uploader::from_signed_url(signed_url)?;
        if let Some(endpoint) = &self.storage_endpoint {
            uploader = uploader.with_endpoint(endpoint)?;
        }

        let sign = |req: &SigningRequest| -> Result<String> {
            let data: Signature = self.proxy.get(
                &format!("auth/sign/s3-multipart-url/image/{image_id}"),
                &req.to_params(),
            )?;
            Ok(data.signature)
        };

        let upload_id = uploader.create_multipart_upload(&key, &sign)?;
        let total_parts = upload::part_count(size, self.chunk_size);
        tracing::debug!(%upload_id, total_parts, chunk_size = self.chunk_size, "initiated multipart upload");
        observer.initiated(&upload_id, total_parts, size);

        let mut parts = Vec::with_capacity(total_parts as usize);
        for chunk in Chunks::new(File::open(path)?, self.chunk_size) {
            let (part_number, bytes) = chunk?;
            let len = bytes.len() as u64;
            let etag = uploader.upload_part(part_number, bytes, &upload_id, &key, &sign)?;
            observer.part_uploaded(part_number, len, &etag);
            parts.push((part_number, etag));
        }

        let final_etag = uploader.complete_multipart_upload(&parts, &upload_id, &key, &sign)?;
        observer.completed(&final_etag);
        Ok(())
    }

    pub fn image_delete(&self, image_id: i64) -> Result<bool> {
        let data: Value = self.proxy.delete(&format!("images/{image_id}"))?;
        Ok(deleted(&data))
    }

    // --- annotations ---

    pub fn annotation_list(&self, filters: Option<&AnnotationFilters>) -> Result<Vec<Annotation>> {
        let params = list_params(None, filters.map(|f| f as &dyn FilterQuery))?;
        field(self.proxy.get("annotations", &params)?, "annotations")
    }

    pub fn annotation_get(&self, annotation_id: i64) -> Result<Annotation> {
        self.proxy
            .get(&format!("annotations/{annotation_id}"), &Params::new())
    }

    pub fn annotation_create(&self, annotation: &Annotation) -> Result<Annotation> {
        self.proxy.post_json("annotations", annotation)
    }

    pub fn annotation_delete(&self, annotation_id: i64) -> Result<bool> {
        let data: Value = self.proxy.delete(&format!("annotations/{annotation_id}"))?;
        Ok(deleted(&data))
    }

    /// Create annotations on an image from a GeoJSON file.
    ///
    /// Features with unsupported geometry are always skipped. A feature the
    /// server rejects is retried once with a repaired outline. With
    /// `skip_errors`, features that fail to convert or that are still
    /// rejected are logged and skipped; otherwise the first failure is
    /// returned.
    pub fn annotation_import_geojson(
        &self,
        path: &Path,
        image_id: i64,
        skip_errors: bool,
    ) -> Result<Vec<Annotation>> {
        let image = self.image_get(image_id)?;
        let features = annotations::parse_features(&fs::read_to_string(path)?)?;

        let mut created = Vec::with_capacity(features.len());
        for (idx, feature) in features.into_iter().enumerate() {
            let converted = annotations::decode_feature(feature)
                .and_then(|f| annotations::from_geojson(&f, &image));
            let annotation = match converted {
                Ok(a) => a,
                Err(err) if err.is_unsupported() || skip_errors => {
                    tracing::warn!(idx, error = %err, "skipping annotation");
                    continue;
                }
                Err(err) => return Err(err),
            };
            match self.create_or_repair(idx, &annotation) {
                Ok(a) => created.push(a),
                Err(Error::Api(err)) if skip_errors => {
                    tracing::warn!(idx, error = %err, "server rejected annotation, skipping");
                }
                Err(err) => {
                    tracing::error!(idx, error = %err, "failed to import annotation");
                    return Err(err);
                }
            }
        }
        Ok(created)
    }

    fn create_or_repair(&self, idx: usize, annotation: &Annotation) -> Result<Annotation> {
        match self.annotation_create(annotation) {
            Err(Error::Api(err)) => {
                tracing::debug!(idx, error = %err, "annotation rejected, repairing outline");
                match annotations::repair(annotation) {
                    Ok(repaired) => self.annotation_create(&repaired),
                    Err(repair_err) => {
                        tracing::debug!(idx, error = %repair_err, "outline cannot be repaired");
                        Err(Error::Api(err))
                    }
                }
            }
            other => other,
        }
    }

    /// All annotations of an image as GeoJSON features.
    pub fn annotation_export_geojson(
        &self,
        image_id: i64,
        ignore_unsupported: bool,
    ) -> Result<Vec<Feature>> {
        let image = self.image_get(image_id)?;
        let filters = AnnotationFilters {
            image_id: Some(vec![image.id]),
            ..Default::default()
        };
        let mut features = Vec::new();
        for annotation in self.annotation_list(Some(&filters))? {
            match annotations::to_geojson(&annotation, &image) {
                Ok(f) => features.push(f),
                Err(err) if ignore_unsupported && err.is_unsupported() => {
                    tracing::debug!(id = ?annotation.id, error = %err, "ignoring annotation");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(features)
    }

    /// Upload a Concentriq XML annotation export onto an image.
    pub fn annotation_import_xml(&self, path: &Path, image_id: i64) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "annotations.xml".into());
        let part = multipart::Part::reader(File::open(path)?)
            .file_name(file_name)
            .mime_str("application/xml")?;
        let form = multipart::Form::new().part("files[0]", part);
        // the server answers 201 even when some annotations were not imported
        let _: Value = self
            .proxy
            .post_multipart(&format!("images/{image_id}/annotations/import"), form)?;
        Ok(())
    }

    pub fn annotation_export_xml(&self, image_id: i64) -> Result<String> {
        self.proxy.get_text(
            &format!("images/{image_id}/annotations/export/xml"),
            &Params::new(),
        )
    }
}
