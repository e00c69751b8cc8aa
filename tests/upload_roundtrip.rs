#![cfg(feature = "test-utils")]

mod support;

use axum::http::StatusCode;

#[tokio::test]
async fn upload_then_download_round_trips() {
    let h = support::harness().await;
    let data = vec![0u8; 10 * 1024 * 1024];

    let response = support::send(
        &h,
        support::multipart_upload("/api/upload", "a.bin", "application/octet-stream", &data, None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = support::body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["file"]["size"], 10_485_760);
    assert_eq!(body["file"]["mime_type"], "application/octet-stream");
    let object_key = body["file"]["file_path"].as_str().unwrap();
    assert!(object_key.starts_with("uploads/"));
    assert!(h.store.contains(object_key));
    let file_id = body["file"]["id"].as_i64().unwrap();

    // Full download: byte-for-byte identical, attachment disposition
    let response = support::send(&h, support::get(&format!("/api/files/{}/download", file_id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-length"],
        "10485760",
        "download must announce the full size"
    );
    assert!(response.headers()["content-disposition"]
        .to_str()
        .unwrap()
        .contains("a.bin"));
    let downloaded = support::body_bytes(response).await;
    assert_eq!(downloaded, data);

    // First-megabyte range on the same object
    let response = support::send(
        &h,
        support::get_with_range(
            &format!("/api/files/{}/stream", file_id),
            "bytes=0-1048575",
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-length"], "1048576");
    assert_eq!(
        response.headers()["content-range"],
        "bytes 0-1048575/10485760"
    );
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(support::body_bytes(response).await.len(), 1_048_576);
}

#[tokio::test]
async fn upload_records_description_and_hash() {
    let h = support::harness().await;

    let response = support::send(
        &h,
        support::multipart_upload(
            "/api/upload",
            "notes.txt",
            "text/plain",
            b"hello nebula",
            Some("shopping list"),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = support::body_json(response).await;
    assert_eq!(body["file"]["description"], "shopping list");

    let file_id = body["file"]["id"].as_i64().unwrap();
    let file = h.catalog.get_file(file_id).await.unwrap().unwrap();
    // SHA-256 of "hello nebula", computed while spooling
    assert_eq!(file.file_hash.as_deref().map(str::len), Some(64));
}

#[tokio::test]
async fn zero_byte_upload_round_trips() {
    let h = support::harness().await;

    let response = support::send(
        &h,
        support::multipart_upload("/api/upload", "empty.bin", "application/octet-stream", b"", None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = support::body_json(response).await;
    assert_eq!(body["file"]["size"], 0);
    let file_id = body["file"]["id"].as_i64().unwrap();

    let response = support::send(&h, support::get(&format!("/api/files/{}/download", file_id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "0");
    assert!(support::body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn upload_without_file_part_is_rejected() {
    let h = support::harness().await;

    // A multipart body with only a description and no file part
    let response = support::send(
        &h,
        support::multipart_upload("/api/upload", "", "text/plain", b"", None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = support::body_json(response).await;
    assert!(body["detail"].as_str().unwrap().contains("filename"));
}

#[tokio::test]
async fn presigned_flow_registers_after_out_of_band_put() {
    let h = support::harness().await;

    let response = support::send(
        &h,
        support::post_json(
            "/api/upload/presign?network=local",
            serde_json::json!({ "filename": "b.mp4", "content_type": "video/mp4" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = support::body_json(response).await;
    let object_key = body["object_key"].as_str().unwrap().to_string();
    assert!(object_key.starts_with("uploads/"));
    assert!(object_key.ends_with(".mp4"));
    let upload_url = body["upload_url"].as_str().unwrap();
    assert!(upload_url.contains(&object_key));
    assert!(upload_url.contains("network=Local"));

    // The client PUTs directly to the store out of band
    let payload = b"presigned video bytes".to_vec();
    h.store.insert(&object_key, payload.clone(), "video/mp4");

    let response = support::send(
        &h,
        support::post_json(
            "/api/upload/complete",
            serde_json::json!({ "object_key": object_key, "filename": "b.mp4" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = support::body_json(response).await;
    assert_eq!(body["success"], true);
    // The store-reported size is authoritative
    assert_eq!(body["file"]["size"], payload.len() as i64);
    assert_eq!(body["file"]["mime_type"], "video/mp4");
}

#[tokio::test]
async fn complete_rejects_bad_keys() {
    let h = support::harness().await;

    // Outside the uploads/ prefix
    let response = support::send(
        &h,
        support::post_json(
            "/api/upload/complete",
            serde_json::json!({ "object_key": "transcoded/1/evil.mp4", "filename": "evil.mp4" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Inside the prefix but never uploaded
    let response = support::send(
        &h,
        support::post_json(
            "/api/upload/complete",
            serde_json::json!({ "object_key": "uploads/2024/11/ghost.mp4", "filename": "ghost.mp4" }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn registering_the_same_object_twice_conflicts() {
    let h = support::harness().await;
    h.store
        .insert("uploads/2024/11/once.bin", b"payload".to_vec(), "application/octet-stream");

    let request = serde_json::json!({
        "object_key": "uploads/2024/11/once.bin",
        "filename": "once.bin",
    });
    let response = support::send(&h, support::post_json("/api/upload/complete", request.clone())).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = support::send(&h, support::post_json("/api/upload/complete", request)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
