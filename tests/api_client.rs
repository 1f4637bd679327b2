//! Mock HTTP tests for ApiClient.
//!
//! The client is blocking, so every call runs on a blocking thread while
//! the mock server lives on the test runtime.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use secrecy::SecretString;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use concentriq_cli::api::ImageSetUpdate;
use concentriq_cli::config::Credentials;
use concentriq_cli::models::{FolderFilters, ImageFilters, Pagination, SortBy};
use concentriq_cli::{ApiClient, Error};

// Blocking clients must be built and dropped off the async runtime.
fn client(uri: &str) -> ApiClient {
    ApiClient::new(&Credentials {
        api_url: format!("{uri}/api"),
        user: "user@example.com".into(),
        password: SecretString::from("secret".to_string()),
        ssl_certificate: None,
    })
    .unwrap()
}

async fn blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap()
}

fn ok(data: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
}

fn paginated(data: Value, rows_returned: i64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "data": data,
        "meta": { "pagination": {
            "rowsPerPage": 10, "page": 1, "rowsReturned": rows_returned, "totalRows": 2
        }}
    }))
}

fn image(id: i64, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "imageSetId": 3,
        "imageSetName": "biopsies",
        "ownerId": 1,
        "imgWidth": 20000,
        "imgHeight": 10000,
        "status": 2,
        "filesize": "1.2 GB",
        "created": "2021-06-01T12:00:00.000Z"
    })
}

fn group(id: i64) -> Value {
    json!({
        "id": id,
        "name": "pathology",
        "ownerName": "Jo",
        "ownerId": 1,
        "created": "2021-06-01T12:00:00.000Z",
        "lastModified": "2021-06-02T12:00:00.000Z"
    })
}

// === Envelope handling ===

#[tokio::test(flavor = "multi_thread")]
async fn test_group_list_sends_basic_auth() {
    let server = MockServer::start().await;
    let auth = format!("Basic {}", BASE64.encode("user@example.com:secret"));
    Mock::given(method("GET"))
        .and(path("/api/imageSetGroups"))
        .and(header("authorization", auth.as_str()))
        .respond_with(ok(json!({ "groups": [group(1), group(2)] })))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let groups = blocking(move || client(&uri).group_list()).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[1].id, 2);
    assert_eq!(groups[0].owner_name, "Jo");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_group_get_reads_image_count_as_imageset_count() {
    let server = MockServer::start().await;
    let mut body = group(5);
    body["imageCount"] = json!(12);
    Mock::given(method("GET"))
        .and(path("/api/imageSetGroups/5"))
        .respond_with(ok(body))
        .mount(&server)
        .await;

    let uri = server.uri();
    let group = blocking(move || client(&uri).group_get(5)).await.unwrap();
    assert_eq!(group.image_set_count, Some(12));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_envelope_becomes_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/images/404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "status": 404, "name": "NotFound", "code": 404, "message": "image not found" }
        })))
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = blocking(move || client(&uri).image_get(404)).await.unwrap_err();
    match err {
        Error::Api(api_err) => {
            assert_eq!(api_err.status, 404);
            assert_eq!(api_err.name, "NotFound");
            assert_eq!(api_err.message, "image not found");
        }
        other => panic!("expected api error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unexpected_pagination_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/imageSets"))
        .respond_with(paginated(json!({ "imageSets": [] }), 0))
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = blocking(move || client(&uri).imageset_list()).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_json_body_is_unexpected_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/imageSetGroups"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = blocking(move || client(&uri).group_list()).await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("502"), "{text}");
    assert!(text.contains("bad gateway"), "{text}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_error_status_without_envelope_error_is_unexpected_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/imageSetGroups"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Unauthorized" })))
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = blocking(move || client(&uri).group_list()).await.unwrap_err();
    match err {
        Error::UnexpectedResponse(msg) => {
            assert!(msg.contains("401"), "{msg}");
            assert!(msg.contains("Unauthorized"), "{msg}");
        }
        other => panic!("expected unexpected response, got {other:?}"),
    }
}

// === Organizations and folders ===

#[tokio::test(flavor = "multi_thread")]
async fn test_organization_list_reads_plain_array() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/organizations"))
        .respond_with(ok(json!([
            { "id": 1, "name": "Proscia", "billingEmail": "billing@example.com" },
            { "id": 2, "name": "Lab" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let orgs = blocking(move || client(&uri).organization_list()).await.unwrap();
    assert_eq!(orgs.len(), 2);
    assert_eq!(orgs[0].billing_email, "billing@example.com");
    assert_eq!(orgs[1].name, "Lab");
    assert_eq!(orgs[1].billing_email, "");
}

fn folder(id: i64) -> Value {
    json!({
        "id": id,
        "label": "cases",
        "imageSetId": 3,
        "imageSetName": "biopsies",
        "hasMetadata": true,
        "ownerId": 1
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_folder_list_sends_metadata_flag_and_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/folders"))
        .and(query_param("includeMetadata", "true"))
        .and(query_param("filters", r#"{"imageSetId":[3]}"#))
        .and(|req: &Request| !req.url.query_pairs().any(|(k, _)| k == "pagination"))
        .respond_with(ok(json!({ "folders": [folder(5)] })))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let folders = blocking(move || {
        let filters = FolderFilters {
            image_set_id: Some(vec![3]),
            ..Default::default()
        };
        client(&uri).folder_list(true, None, Some(&filters))
    })
    .await
    .unwrap();

    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0].id, 5);
    assert!(folders[0].has_metadata);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_folder_list_paginated_expects_pagination_meta() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/folders"))
        .and(query_param(
            "pagination",
            r#"{"rowsPerPage":10,"page":1,"sortBy":"name","descending":false}"#,
        ))
        .and(|req: &Request| !req.url.query_pairs().any(|(k, _)| k == "includeMetadata"))
        .respond_with(paginated(json!({ "folders": [folder(5), folder(6)] }), 2))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let folders = blocking(move || {
        let pagination = Pagination::new(10, 1, SortBy::Name, false);
        client(&uri).folder_list(false, Some(&pagination), None)
    })
    .await
    .unwrap();
    let ids: Vec<i64> = folders.iter().map(|f| f.id).collect();
    assert_eq!(ids, vec![5, 6]);
}

// === Images ===

#[tokio::test(flavor = "multi_thread")]
async fn test_image_list_sends_pagination_and_filters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/images"))
        .and(query_param(
            "pagination",
            r#"{"rowsPerPage":10,"page":2,"sortBy":"name","descending":true}"#,
        ))
        .and(query_param("filters", r#"{"imageSetId":[3],"hasAnnotations":false}"#))
        .respond_with(paginated(json!({ "images": [image(1, "a.svs")] }), 1))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let (images, info) = blocking(move || {
        let filters = ImageFilters {
            image_set_id: Some(vec![3]),
            has_annotations: Some(false),
            ..Default::default()
        };
        let pagination = Pagination::new(10, 2, SortBy::Name, true);
        client(&uri).image_list(Some(&pagination), Some(&filters))
    })
    .await
    .unwrap();

    assert_eq!(images.len(), 1);
    assert_eq!(images[0].filesize, "1.2 GB");
    let info = info.unwrap();
    assert_eq!(info.rows_returned, 1);
    assert_eq!(info.total_rows, Some(2));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_pages_stop_at_empty_page() {
    let server = MockServer::start().await;
    let page = |n: u32| format!(r#"{{"rowsPerPage":10,"page":{n},"sortBy":"created","descending":false}}"#);
    Mock::given(method("GET"))
        .and(path("/api/images"))
        .and(query_param("pagination", page(1).as_str()))
        .respond_with(paginated(json!({ "images": [image(1, "a"), image(2, "b")] }), 2))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/images"))
        .and(query_param("pagination", page(2).as_str()))
        .respond_with(paginated(json!({ "images": [] }), 0))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/images"))
        .and(query_param("pagination", page(3).as_str()))
        .respond_with(paginated(json!({ "images": [image(9, "never")] }), 1))
        .expect(0)
        .mount(&server)
        .await;

    let uri = server.uri();
    let batches = blocking(move || {
        let api = client(&uri);
        let pages = api.image_pages(None, 10, SortBy::Created, false)?;
        pages.collect::<Result<Vec<_>, _>>()
    })
    .await
    .unwrap();

    assert_eq!(batches.len(), 1);
    let ids: Vec<i64> = batches[0].iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_download_returns_redirect_target() {
    let server = MockServer::start().await;
    let target = "https://s3.example.com/bucket/slide.svs?X-Amz-Signature=abc";
    Mock::given(method("GET"))
        .and(path("/api/images/8/download"))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", target))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let url = blocking(move || client(&uri).image_download(8)).await.unwrap();
    assert_eq!(url, target);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_image_download_without_redirect_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/images/8/download"))
        .respond_with(ok(json!({})))
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = blocking(move || client(&uri).image_download(8)).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse(_)));
}

// === Imagesets ===

#[tokio::test(flavor = "multi_thread")]
async fn test_imageset_update_patches_then_refetches() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/imageSets/4"))
        .respond_with(ok(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/imageSets/4"))
        .respond_with(ok(json!({
            "id": 4,
            "name": "renamed",
            "created": "2021-06-01T12:00:00.000Z",
            "lastModified": "2021-06-03T12:00:00.000Z",
            "imageCount": "7",
            "totalSize": 0,
            "ownerId": 1,
            "customField": "kept"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let set = blocking(move || {
        client(&uri).imageset_update(
            4,
            &ImageSetUpdate {
                name: Some("renamed".into()),
                description: None,
            },
        )
    })
    .await
    .unwrap();

    assert_eq!(set.name, "renamed");
    assert_eq!(set.image_count, 7);
    assert_eq!(set.extra.get("customField"), Some(&json!("kept")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_imageset_delete_reports_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/imageSets/4"))
        .respond_with(ok(json!({ "success": "Image set deleted" })))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    assert!(blocking(move || client(&uri).imageset_delete(4)).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_csv_is_returned_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/imageSets/4/export/csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string("id,name\n1,a.svs\n"))
        .mount(&server)
        .await;

    let uri = server.uri();
    let csv = blocking(move || client(&uri).imageset_export_metadata_csv(4)).await.unwrap();
    assert_eq!(csv, "id,name\n1,a.svs\n");
}

// === Annotations ===

#[tokio::test(flavor = "multi_thread")]
async fn test_annotation_export_geojson_converts_polygons() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/images/1"))
        .respond_with(ok(image(1, "a.svs")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/annotations"))
        .and(query_param("filters", r#"{"imageId":[1]}"#))
        .respond_with(ok(json!({ "annotations": [
            {
                "id": 11,
                "text": "tumor",
                "shape": "free",
                "shapeString": "0,0 5000,0 5000,2500 0,0",
                "imageId": 1,
                "color": "#c80000"
            },
            {
                "id": 12,
                "text": "note",
                "shape": "arrow",
                "shapeString": "0,0 1,1",
                "imageId": 1,
                "color": "#00ff00"
            }
        ]})))
        .mount(&server)
        .await;

    let uri = server.uri();
    let features = blocking(move || client(&uri).annotation_export_geojson(1, true))
        .await
        .unwrap();
    assert_eq!(features.len(), 1);
    let value = serde_json::to_value(&features[0]).unwrap();
    assert_eq!(value["geometry"]["type"], "Polygon");
    assert_eq!(value["properties"]["classification"]["name"], "tumor");
    assert_eq!(value["geometry"]["coordinates"][0][1], json!([10000.0, 0.0]));

    let uri = server.uri();
    let err = blocking(move || client(&uri).annotation_export_geojson(1, false))
        .await
        .unwrap_err();
    assert!(err.is_unsupported());
}

fn created_annotation(id: i64, text: &str) -> ResponseTemplate {
    ok(json!({
        "id": id,
        "text": text,
        "shape": "free",
        "shapeString": "0,0 1,1 1,0 0,0",
        "imageId": 1,
        "color": "#c80000"
    }))
}

fn rejected() -> ResponseTemplate {
    ResponseTemplate::new(400).set_body_json(json!({
        "error": { "status": 400, "name": "BadRequest", "code": 400, "message": "invalid shape" }
    }))
}

fn polygon_feature(name: &str, ring: Value) -> Value {
    json!({
        "type": "Feature",
        "geometry": { "type": "Polygon", "coordinates": [ring] },
        "properties": { "classification": { "name": name, "colorRGB": -3670016 } }
    })
}

fn write_geojson(document: &Value) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("shapes.geojson");
    std::fs::write(&file, serde_json::to_string(document).unwrap()).unwrap();
    (dir, file)
}

async fn mount_image(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/images/1"))
        .respond_with(ok(image(1, "a.svs")))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_annotation_import_skips_rejected_features() {
    let server = MockServer::start().await;
    mount_image(&server).await;
    // "tumor" is rejected on the first try and after repair
    Mock::given(method("POST"))
        .and(path("/api/annotations"))
        .and(body_string_contains("\"tumor\""))
        .respond_with(rejected())
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/annotations"))
        .respond_with(created_annotation(99, "stroma"))
        .expect(1)
        .mount(&server)
        .await;

    let square = json!([[0, 0], [100, 0], [100, 100], [0, 0]]);
    let point = json!({
        "type": "Feature",
        "geometry": { "type": "Point", "coordinates": [1, 2] },
        "properties": {}
    });
    let (_dir, file) = write_geojson(&json!({
        "type": "FeatureCollection",
        "features": [polygon_feature("tumor", square.clone()), point, polygon_feature("stroma", square)]
    }));

    let uri = server.uri();
    let created = blocking(move || client(&uri).annotation_import_geojson(&file, 1, true))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].id, Some(99));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_annotation_import_retries_with_repaired_outline() {
    let server = MockServer::start().await;
    mount_image(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/annotations"))
        .respond_with(rejected())
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    // the repaired bowtie gains its crossing point, 1000px = 500 viewport units
    Mock::given(method("POST"))
        .and(path("/api/annotations"))
        .and(body_string_contains("500.000000,500.000000"))
        .respond_with(created_annotation(7, "tumor"))
        .expect(1)
        .mount(&server)
        .await;

    let bowtie = json!([[0, 0], [2000, 2000], [2000, 0], [0, 2000], [0, 0]]);
    let (_dir, file) = write_geojson(&json!([polygon_feature("tumor", bowtie)]));

    let uri = server.uri();
    let created = blocking(move || client(&uri).annotation_import_geojson(&file, 1, false))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].id, Some(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_annotation_import_skips_geometry_collection_feature() {
    let server = MockServer::start().await;
    mount_image(&server).await;
    Mock::given(method("POST"))
        .and(path("/api/annotations"))
        .respond_with(created_annotation(11, "tumor"))
        .expect(1)
        .mount(&server)
        .await;

    let collection = json!({
        "type": "Feature",
        "geometry": {
            "type": "GeometryCollection",
            "geometries": [{ "type": "Point", "coordinates": [1, 2] }]
        },
        "properties": {}
    });
    let square = json!([[0, 0], [100, 0], [100, 100], [0, 0]]);
    let (_dir, file) = write_geojson(&json!([polygon_feature("tumor", square), collection]));

    let uri = server.uri();
    let created = blocking(move || client(&uri).annotation_import_geojson(&file, 1, false))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].id, Some(11));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_annotation_import_xml_posts_file_as_multipart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/images/1/annotations/import"))
        .and(|req: &Request| {
            let body = String::from_utf8_lossy(&req.body);
            body.contains(r#"name="files[0]""#)
                && body.contains(r#"filename="regions.xml""#)
                && body.contains("<Annotations/>")
        })
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "data": { "imported": 1 } })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("regions.xml");
    std::fs::write(&file, "<Annotations/>").unwrap();

    let uri = server.uri();
    blocking(move || client(&uri).annotation_import_xml(&file, 1))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_annotation_export_xml_returns_body() {
    let server = MockServer::start().await;
    let xml = r#"<Annotations><Annotation Id="1"/></Annotations>"#;
    Mock::given(method("GET"))
        .and(path("/api/images/1/annotations/export/xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(xml))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let body = blocking(move || client(&uri).annotation_export_xml(1)).await.unwrap();
    assert_eq!(body, xml);
}
