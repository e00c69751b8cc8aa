#![cfg(feature = "test-utils")]

mod support;

use axum::http::StatusCode;

/// 1000 bytes with a recognizable pattern so slicing mistakes show up.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn full_stream_advertises_ranges() {
    let h = support::harness().await;
    let data = patterned(1000);
    let id = support::seed_file(&h, "clip.mp4", "uploads/2024/11/clip.mp4", "video/mp4", &data).await;

    let response = support::send(&h, support::get(&format!("/api/files/{}/stream", id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["accept-ranges"], "bytes");
    assert_eq!(response.headers()["content-length"], "1000");
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert_eq!(support::body_bytes(response).await, data);
}

#[tokio::test]
async fn single_byte_range() {
    let h = support::harness().await;
    let data = patterned(1000);
    let id = support::seed_file(&h, "one.bin", "uploads/2024/11/one.bin", "application/octet-stream", &data).await;

    let response = support::send(
        &h,
        support::get_with_range(&format!("/api/files/{}/stream", id), "bytes=0-0"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-length"], "1");
    assert_eq!(response.headers()["content-range"], "bytes 0-0/1000");
    assert_eq!(support::body_bytes(response).await, vec![data[0]]);
}

#[tokio::test]
async fn open_ended_and_clamped_ranges() {
    let h = support::harness().await;
    let data = patterned(1000);
    let id = support::seed_file(&h, "two.bin", "uploads/2024/11/two.bin", "application/octet-stream", &data).await;

    let response = support::send(
        &h,
        support::get_with_range(&format!("/api/files/{}/stream", id), "bytes=500-"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-range"], "bytes 500-999/1000");
    assert_eq!(support::body_bytes(response).await, data[500..].to_vec());

    // End past the object is clamped, not rejected
    let response = support::send(
        &h,
        support::get_with_range(&format!("/api/files/{}/stream", id), "bytes=900-2000"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-range"], "bytes 900-999/1000");
    assert_eq!(support::body_bytes(response).await.len(), 100);
}

#[tokio::test]
async fn suffix_range_returns_the_tail() {
    let h = support::harness().await;
    let data = patterned(1000);
    let id = support::seed_file(&h, "tail.bin", "uploads/2024/11/tail.bin", "application/octet-stream", &data).await;

    let response = support::send(
        &h,
        support::get_with_range(&format!("/api/files/{}/stream", id), "bytes=-100"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["content-range"], "bytes 900-999/1000");
    assert_eq!(support::body_bytes(response).await, data[900..].to_vec());
}

#[tokio::test]
async fn range_past_end_is_416_with_total_size() {
    let h = support::harness().await;
    let data = patterned(1000);
    let id = support::seed_file(&h, "off.bin", "uploads/2024/11/off.bin", "application/octet-stream", &data).await;

    for range in ["bytes=1000-2000", "bytes=1000-"] {
        let response = support::send(
            &h,
            support::get_with_range(&format!("/api/files/{}/stream", id), range),
        )
        .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
        assert_eq!(response.headers()["content-range"], "bytes */1000");
    }
}

#[tokio::test]
async fn malformed_range_is_rejected() {
    let h = support::harness().await;
    let data = patterned(100);
    let id = support::seed_file(&h, "bad.bin", "uploads/2024/11/bad.bin", "application/octet-stream", &data).await;

    let response = support::send(
        &h,
        support::get_with_range(&format!("/api/files/{}/stream", id), "bytes=ten-twenty"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn non_overlapping_ranges_reassemble_the_whole_body() {
    let h = support::harness().await;
    let data = patterned(1000);
    let id = support::seed_file(&h, "parts.bin", "uploads/2024/11/parts.bin", "application/octet-stream", &data).await;

    let mut reassembled = Vec::new();
    for range in ["bytes=0-333", "bytes=334-666", "bytes=667-999"] {
        let response = support::send(
            &h,
            support::get_with_range(&format!("/api/files/{}/stream", id), range),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        reassembled.extend(support::body_bytes(response).await);
    }
    assert_eq!(reassembled, data);
}

#[tokio::test]
async fn unknown_file_is_404() {
    let h = support::harness().await;
    let response = support::send(&h, support::get("/api/files/9999/stream")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = support::body_json(response).await;
    assert!(body["detail"].as_str().is_some());
}

#[tokio::test]
async fn presigned_download_url_points_at_the_object() {
    let h = support::harness().await;
    let data = patterned(64);
    let id = support::seed_file(&h, "pre.mp4", "uploads/2024/11/pre.mp4", "video/mp4", &data).await;

    let response = support::send(
        &h,
        support::get(&format!("/api/files/{}/presign?network=remote", id)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = support::body_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["object_key"], "uploads/2024/11/pre.mp4");
    let url = body["download_url"].as_str().unwrap();
    assert!(url.contains("uploads/2024/11/pre.mp4"));
    assert!(url.contains("network=Remote"));
}

#[tokio::test]
async fn missing_quality_falls_back_to_original() {
    let h = support::harness().await;
    let data = patterned(500);
    let id = support::seed_file(&h, "fb.mp4", "uploads/2024/11/fb.mp4", "video/mp4", &data).await;

    let response = support::send(
        &h,
        support::get(&format!("/api/files/{}/stream?quality=720", id)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "500");
    assert_eq!(support::body_bytes(response).await, data);
}
