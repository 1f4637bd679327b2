//! End-to-end upload tests against a mocked Concentriq API and S3 store.
//!
//! Both services are served by one mock server; the client's storage
//! endpoint is pointed at it instead of AWS.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::{json, Value};
use wiremock::matchers::{header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use concentriq_cli::config::Credentials;
use concentriq_cli::upload::UploadObserver;
use concentriq_cli::{ApiClient, Error};

const KEY: &str = "uploads/7/slide.svs";
const OBJECT_PATH: &str = "/concentriq-image-store/uploads/7/slide.svs";

fn client(uri: &str) -> ApiClient {
    ApiClient::new(&Credentials {
        api_url: format!("{uri}/api"),
        user: "user@example.com".into(),
        password: SecretString::from("secret".to_string()),
        ssl_certificate: None,
    })
    .unwrap()
    .with_storage_endpoint(uri)
    .with_chunk_size(4)
}

fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
}

fn image(status: i64) -> Value {
    json!({
        "id": 7,
        "name": "slide.svs",
        "imageSetId": 3,
        "ownerId": 1,
        "imgWidth": 0,
        "imgHeight": 0,
        "status": status,
        "created": "2021-06-01T12:00:00.000Z",
        "thumbURL": {
            "signedURL": "https://s3.eu-central-1.amazonaws.com/thumb.jpg?X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Credential=AKIATEST%2F20210601%2Feu-central-1%2Fs3%2Faws4_request"
        },
        "selectedStorageSystemEntry": { "imageStorageKey": KEY }
    })
}

#[derive(Default)]
struct Recorder {
    parts: AtomicU32,
    completed: AtomicU32,
}

impl UploadObserver for Recorder {
    fn part_uploaded(&self, _part_number: u32, _bytes: u64, _etag: &str) {
        self.parts.fetch_add(1, Ordering::SeqCst);
    }

    fn completed(&self, _etag: &str) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn mount_image_api(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/images"))
        .respond_with(ok(json!({ "id": 7 })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/auth/sign/s3-multipart-url/image/7"))
        .and(|req: &Request| {
            let keys: Vec<String> = req.url.query_pairs().map(|(k, _)| k.into_owned()).collect();
            ["payload", "nonce", "canonicalRequest"]
                .iter()
                .all(|k| keys.iter().any(|have| have == k))
        })
        .respond_with(ok(json!({ "signature": "deadbeef" })))
        .mount(server)
        .await;
}

fn write_slide(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("slide.svs");
    std::fs::write(&file, bytes).unwrap();
    (dir, file)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upload_sends_parts_and_starts_optimizing() {
    let server = MockServer::start().await;
    mount_image_api(&server).await;

    // two reads while uploading, one after the status change
    Mock::given(method("GET"))
        .and(path("/api/images/7"))
        .respond_with(ok(image(0)))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/images/7"))
        .respond_with(ok(image(1)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/images/7"))
        .respond_with(ok(json!({ "id": 7 })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(OBJECT_PATH))
        .and(query_param("uploadId", "up-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<CompleteMultipartUploadResult><Location>https://s3/x</Location>\
             <Bucket>concentriq-image-store</Bucket><Key>{KEY}</Key>\
             <ETag>\"final\"</ETag></CompleteMultipartUploadResult>"
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(OBJECT_PATH))
        .and(query_param("uploads", ""))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<InitiateMultipartUploadResult>\
             <Bucket>concentriq-image-store</Bucket><Key>{KEY}</Key>\
             <UploadId>up-1</UploadId></InitiateMultipartUploadResult>"
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(OBJECT_PATH))
        .and(query_param("uploadId", "up-1"))
        .and(header_exists("content-md5"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part\""))
        .expect(3)
        .mount(&server)
        .await;

    let (_dir, file) = write_slide(b"0123456789");
    let recorder = Arc::new(Recorder::default());
    let observed = Arc::clone(&recorder);
    let uri = server.uri();
    let uploaded = tokio::task::spawn_blocking(move || {
        client(&uri).image_upload(&file, 3, None, observed.as_ref())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(uploaded.id, 7);
    assert_eq!(uploaded.status, 1);
    assert_eq!(recorder.parts.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_transfer_deletes_image_record() {
    let server = MockServer::start().await;
    mount_image_api(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/images/7"))
        .respond_with(ok(image(0)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(OBJECT_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            "<Error><Code>SignatureDoesNotMatch</Code><Message>bad signature</Message></Error>",
        ))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/images/7"))
        .respond_with(ok(json!({ "success": "deleted" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/images/7"))
        .respond_with(ok(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let (_dir, file) = write_slide(b"abc");
    let uri = server.uri();
    let err = tokio::task::spawn_blocking(move || {
        client(&uri).image_upload(&file, 3, None, &concentriq_cli::upload::NoProgress)
    })
    .await
    .unwrap()
    .unwrap_err();

    match err {
        Error::Upload(msg) => assert!(msg.contains("SignatureDoesNotMatch"), "{msg}"),
        other => panic!("expected upload error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_must_be_uploading_before_optimizing() {
    let server = MockServer::start().await;
    mount_image_api(&server).await;

    // the server already moved the image on
    Mock::given(method("GET"))
        .and(path("/api/images/7"))
        .respond_with(ok(image(2)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(OBJECT_PATH))
        .and(query_param("uploadId", "up-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<CompleteMultipartUploadResult><Bucket>concentriq-image-store</Bucket>\
             <Key>{KEY}</Key><ETag>\"final\"</ETag></CompleteMultipartUploadResult>"
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(OBJECT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "<InitiateMultipartUploadResult><Bucket>concentriq-image-store</Bucket>\
             <Key>{KEY}</Key><UploadId>up-1</UploadId></InitiateMultipartUploadResult>"
        )))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(OBJECT_PATH))
        .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"part\""))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/api/images/7"))
        .respond_with(ok(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let (_dir, file) = write_slide(b"abcd");
    let uri = server.uri();
    let err = tokio::task::spawn_blocking(move || {
        client(&uri).image_upload(&file, 3, None, &concentriq_cli::upload::NoProgress)
    })
    .await
    .unwrap()
    .unwrap_err();
    assert!(err.to_string().contains("should be uploading"), "{err}");
}
