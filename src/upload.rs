//! S3 multipart uploads for image files.
//!
//! Concentriq stores slides in S3 but never hands out upload credentials.
//! Each S3 request is prepared here in AWS SigV4 layout (canonical request
//! and string to sign); the signature itself comes from the Concentriq API
//! through a signing callback. The access key is the one embedded in the
//! signed thumbnail URL the API returns for the image.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use md5::{Digest as _, Md5};
use reqwest::blocking::{Client, Response};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{Params, USER_AGENT};

pub const DEFAULT_REGION: &str = "eu-central-1";
pub const SERVICE: &str = "s3";
pub const BUCKET: &str = "concentriq-image-store";
pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
/// Size of every part but the last.
pub const CHUNK_SIZE: usize = 16 * 1024 * 1024;
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

fn amz_date(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%SZ").to_string()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Base64 of the MD5 digest, as S3 expects in `Content-MD5`.
pub fn b64_md5(data: &[u8]) -> String {
    BASE64.encode(Md5::digest(data))
}

/// The parameters the Concentriq signing endpoint expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// url-encoded string to sign
    pub payload: String,
    pub nonce: String,
    pub canonical_request: String,
}

impl SigningRequest {
    pub fn to_params(&self) -> Params {
        vec![
            ("payload", self.payload.clone()),
            ("nonce", self.nonce.clone()),
            ("canonicalRequest", self.canonical_request.clone()),
        ]
    }
}

/// A SigV4 canonical request plus the pieces later reused in headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub text: String,
    pub payload_hash: String,
    pub signed_headers: String,
}

/// Build the SigV4 canonical request.
///
/// `params` are sorted by name before encoding; `extra_headers` must use
/// lowercase names.
#[allow(clippy::too_many_arguments)]
pub fn canonical_request(
    method: &Method,
    host: &str,
    timestamp: &DateTime<Utc>,
    uri: &str,
    params: &[(&str, String)],
    payload: &[u8],
    hash_payload: bool,
    extra_headers: &BTreeMap<String, String>,
) -> CanonicalRequest {
    let mut params = params.to_vec();
    params.sort_by(|a, b| a.0.cmp(b.0));
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut headers = BTreeMap::new();
    headers.insert("host".to_string(), host.trim().to_lowercase());
    headers.insert("x-amz-date".to_string(), amz_date(timestamp));
    headers.extend(extra_headers.iter().map(|(k, v)| (k.clone(), v.clone())));

    let canonical_headers: String = headers.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
    let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
    let payload_hash = if hash_payload {
        sha256_hex(payload)
    } else {
        UNSIGNED_PAYLOAD.to_string()
    };

    let text = format!(
        "{method}\n{uri}\n{query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );
    CanonicalRequest {
        text,
        payload_hash,
        signed_headers,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    bucket: String,
    key: String,
    upload_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteMultipartUploadResult {
    #[serde(default)]
    location: String,
    bucket: String,
    key: String,
    #[serde(rename = "ETag")]
    etag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct S3ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    parts: Vec<CompletedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct CompletedPart<'a> {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: &'a str,
}

/// Receives progress events while an image is uploaded.
pub trait UploadObserver {
    fn initiated(&self, _upload_id: &str, _total_parts: u32, _total_bytes: u64) {}
    fn part_uploaded(&self, _part_number: u32, _bytes: u64, _etag: &str) {}
    fn completed(&self, _etag: &str) {}
}

/// Observer that ignores every event.
pub struct NoProgress;

impl UploadObserver for NoProgress {}

/// Multipart uploader for the Concentriq image bucket.
#[derive(Debug, Clone)]
pub struct S3Uploader {
    client: Client,
    access_key: String,
    region: String,
    bucket: String,
    host: String,
    endpoint: Url,
}

impl S3Uploader {
    pub fn new(access_key: impl Into<String>) -> Result<Self> {
        let host = format!("{SERVICE}-{DEFAULT_REGION}.amazonaws.com");
        let endpoint = Url::parse(&format!("https://{host}/"))
            .map_err(|e| Error::Upload(format!("invalid S3 endpoint: {e}")))?;
        Ok(Self {
            client: Client::builder()
                .user_agent(USER_AGENT)
                .timeout(UPLOAD_TIMEOUT)
                .build()?,
            access_key: access_key.into(),
            region: DEFAULT_REGION.into(),
            bucket: BUCKET.into(),
            host,
            endpoint,
        })
    }

    /// Build an uploader from a signed thumbnail URL of the target image.
    ///
    /// The access key is the first segment of its `X-Amz-Credential`.
    pub fn from_signed_url(signed_url: &str) -> Result<Self> {
        let url = Url::parse(signed_url)
            .map_err(|e| Error::Upload(format!("invalid signed url: {e}")))?;
        let credential = url
            .query_pairs()
            .find(|(k, _)| k == "X-Amz-Credential")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| Error::Upload("signed url carries no X-Amz-Credential".into()))?;
        let access_key = credential.split('/').next().unwrap_or_default();
        if access_key.is_empty() {
            return Err(Error::Upload("empty access key in X-Amz-Credential".into()));
        }
        Self::new(access_key)
    }

    /// Send requests to another S3-compatible endpoint.
    pub fn with_endpoint(mut self, endpoint: &str) -> Result<Self> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| Error::Upload(format!("invalid S3 endpoint {endpoint:?}: {e}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Upload(format!("S3 endpoint {endpoint:?} has no host")))?;
        self.host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        self.endpoint = url;
        Ok(self)
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn credential_scope(&self, ts: &DateTime<Utc>) -> String {
        format!(
            "{}/{}/{SERVICE}/aws4_request",
            ts.format("%Y%m%d"),
            self.region
        )
    }

    /// The SigV4 string to sign for a canonical request.
    pub fn string_to_sign(&self, ts: &DateTime<Utc>, canonical: &CanonicalRequest) -> String {
        format!(
            "{ALGORITHM}\n{}\n{}\n{}",
            amz_date(ts),
            self.credential_scope(ts),
            sha256_hex(canonical.text.as_bytes())
        )
    }

    fn object_uri(&self, key: &str) -> String {
        format!("/{}/{}", self.bucket, key.trim_start_matches('/'))
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        self.endpoint
            .join(&format!("{}/{}", self.bucket, key.trim_start_matches('/')))
            .map_err(|e| Error::Upload(format!("invalid storage key {key:?}: {e}")))
    }

    /// Prepare, sign and send one S3 request.
    #[allow(clippy::too_many_arguments)]
    fn send_signed<F>(
        &self,
        method: Method,
        key: &str,
        params: &[(&str, String)],
        body: Vec<u8>,
        hash_payload: bool,
        extra_headers: BTreeMap<String, String>,
        sign: &F,
    ) -> Result<Response>
    where
        F: Fn(&SigningRequest) -> Result<String>,
    {
        let ts = Utc::now();
        let canonical = canonical_request(
            &method,
            &self.host,
            &ts,
            &self.object_uri(key),
            params,
            &body,
            hash_payload,
            &extra_headers,
        );
        let to_sign = self.string_to_sign(&ts, &canonical);
        let signature = sign(&SigningRequest {
            payload: urlencoding::encode(&to_sign).into_owned(),
            nonce: amz_date(&ts),
            canonical_request: canonical.text.clone(),
        })?;

        let authorization = format!(
            "{ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={signature}",
            self.access_key,
            self.credential_scope(&ts),
            canonical.signed_headers
        );

        let mut request = self
            .client
            .request(method.clone(), self.object_url(key)?)
            .query(params)
            .header("x-amz-date", amz_date(&ts))
            .header("authorization", authorization)
            .header("x-amz-content-sha256", &canonical.payload_hash);
        for (name, value) in &extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        tracing::debug!(%method, key, "s3 request");
        let response = request.body(body).send()?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            let detail = quick_xml::de::from_str::<S3ErrorBody>(&text)
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or(text);
            return Err(Error::Upload(format!("S3 answered {status}: {detail}")));
        }
        Ok(response)
    }

    /// Start a multipart upload and return its upload id.
    pub fn create_multipart_upload<F>(&self, key: &str, sign: &F) -> Result<String>
    where
        F: Fn(&SigningRequest) -> Result<String>,
    {
        let params = [("uploads", String::new())];
        let response = self.send_signed(
            Method::POST,
            key,
            &params,
            Vec::new(),
            true,
            BTreeMap::new(),
            sign,
        )?;
        let body = response.text()?;
        let result: InitiateMultipartUploadResult = quick_xml::de::from_str(&body)
            .map_err(|e| Error::Upload(format!("unexpected initiate response: {e}")))?;
        if result.bucket != self.bucket || result.key != key || result.upload_id.is_empty() {
            return Err(Error::Upload(format!(
                "initiate response does not match request: {result:?}"
            )));
        }
        Ok(result.upload_id)
    }

    /// Upload one part and return its ETag.
    pub fn upload_part<F>(
        &self,
        part_number: u32,
        chunk: Vec<u8>,
        upload_id: &str,
        key: &str,
        sign: &F,
    ) -> Result<String>
    where
        F: Fn(&SigningRequest) -> Result<String>,
    {
        let params = [
            ("partNumber", part_number.to_string()),
            ("uploadId", upload_id.to_string()),
        ];
        let mut headers = BTreeMap::new();
        headers.insert("content-md5".to_string(), b64_md5(&chunk));
        let response =
            self.send_signed(Method::PUT, key, &params, chunk, false, headers, sign)?;
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::Upload(format!("part {part_number} returned no ETag")))
    }

    /// Finish the upload from `(part_number, etag)` pairs; returns the final ETag.
    pub fn complete_multipart_upload<F>(
        &self,
        parts: &[(u32, String)],
        upload_id: &str,
        key: &str,
        sign: &F,
    ) -> Result<String>
    where
        F: Fn(&SigningRequest) -> Result<String>,
    {
        let params = [("uploadId", upload_id.to_string())];
        let body = completion_body(parts)?;
        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/xml; charset=UTF-8".to_string(),
        );
        let response = self.send_signed(
            Method::POST,
            key,
            &params,
            body.into_bytes(),
            true,
            headers,
            sign,
        )?;
        let text = response.text()?;
        let result: CompleteMultipartUploadResult = quick_xml::de::from_str(&text)
            .map_err(|e| Error::Upload(format!("unexpected completion response: {e}")))?;
        if result.bucket != self.bucket || result.key != key || result.etag.is_empty() {
            return Err(Error::Upload(format!(
                "completion response does not match request: {result:?}"
            )));
        }
        tracing::debug!(location = %result.location, "multipart upload completed");
        Ok(result.etag)
    }
}

fn completion_body(parts: &[(u32, String)]) -> Result<String> {
    let doc = CompleteMultipartUpload {
        parts: parts
            .iter()
            .map(|(n, etag)| CompletedPart {
                part_number: *n,
                etag,
            })
            .collect(),
    };
    quick_xml::se::to_string(&doc).map_err(|e| Error::Upload(format!("encoding part list: {e}")))
}

/// Number of parts a file of `size` bytes is split into.
pub fn part_count(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// Reads a source in fixed-size chunks, numbering them from 1.
pub struct Chunks<R> {
    reader: R,
    size: usize,
    next_part: u32,
}

impl<R: Read> Chunks<R> {
    pub fn new(reader: R, size: usize) -> Self {
        Self {
            reader,
            size,
            next_part: 1,
        }
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = std::io::Result<(u32, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut buf = Vec::with_capacity(self.size);
        match self
            .reader
            .by_ref()
            .take(self.size as u64)
            .read_to_end(&mut buf)
        {
            Ok(0) => None,
            Ok(_) => {
                let part = self.next_part;
                self.next_part += 1;
                Some(Ok((part, buf)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
