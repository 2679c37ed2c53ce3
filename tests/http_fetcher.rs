use airquality_ingest::error::IngestError;
use airquality_ingest::ingestion::{Envelope, HttpFetcher, RemoteFetcher};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Serve one canned HTTP response; the handle yields the request line.
async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let mut request = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            request.extend_from_slice(&buf[..n]);
            if n == 0 || request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.ok();

        let text = String::from_utf8_lossy(&request).to_string();
        text.lines().next().unwrap_or_default().to_string()
    });

    (format!("http://{}", addr), handle)
}

fn params() -> Vec<(String, String)> {
    vec![
        ("email".to_string(), "me@example.org".to_string()),
        ("key".to_string(), "secret".to_string()),
        ("state".to_string(), "06".to_string()),
    ]
}

#[tokio::test]
async fn test_fetch_parses_data_rows() {
    let (base, server) = serve_once(
        "200 OK",
        r#"{"Header":[{"status":"Success","rows":2}],"Data":[{"code":"073","value_represented":"San Diego"},{"code":"001","value_represented":"Alameda"}]}"#,
    )
    .await;

    let fetcher = HttpFetcher::new(base, Duration::from_secs(5)).unwrap();
    let batch = fetcher
        .fetch("list/countiesByState", Envelope::Data, &params())
        .await
        .unwrap();

    assert_eq!(batch.len(), 2);
    assert_eq!(batch.columns(), &["code", "value_represented"]);

    let request_line = server.await.unwrap();
    assert!(request_line.starts_with("GET /list/countiesByState?"));
    assert!(request_line.contains("email=me%40example.org"));
    assert!(request_line.contains("state=06"));
}

#[tokio::test]
async fn test_non_success_status_is_remote_error() {
    let (base, server) = serve_once(
        "400 Bad Request",
        r#"{"Header":[{"status":"Failed","error":["Invalid Parameter: bdate"]}],"Data":[]}"#,
    )
    .await;

    let fetcher = HttpFetcher::new(base, Duration::from_secs(5)).unwrap();
    let err = fetcher
        .fetch("dailyData/byCounty", Envelope::Data, &params())
        .await
        .unwrap_err();

    match err {
        IngestError::Remote { status, message } => {
            assert_eq!(status, 400);
            assert_eq!(message, "Invalid Parameter: bdate");
        }
        other => panic!("unexpected error: {}", other),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_empty_error_body_falls_back_to_reason() {
    let (base, server) = serve_once("503 Service Unavailable", "").await;

    let fetcher = HttpFetcher::new(base, Duration::from_secs(5)).unwrap();
    let err = fetcher.fetch("list/states", Envelope::Data, &[]).await.unwrap_err();

    assert!(matches!(
        err,
        IngestError::Remote { status: 503, ref message } if message == "Service Unavailable"
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_success_without_envelope_is_malformed() {
    let (base, server) = serve_once("200 OK", r#"{"Header":[{"status":"Success"}]}"#).await;

    let fetcher = HttpFetcher::new(base, Duration::from_secs(5)).unwrap();
    let err = fetcher.fetch("list/states", Envelope::Data, &[]).await.unwrap_err();

    assert!(matches!(err, IngestError::MalformedResponse(_)));
    assert!(err.is_fetch_failure());
    server.await.unwrap();
}

#[tokio::test]
async fn test_header_row_envelope() {
    let (base, server) = serve_once(
        "200 OK",
        r#"[["NAME","DP05_0001E","state","county"],["San Diego County, California","3298634","06","073"]]"#,
    )
    .await;

    let fetcher = HttpFetcher::new(base, Duration::from_secs(5)).unwrap();
    let batch = fetcher
        .fetch("2020/acs/acs5/profile", Envelope::HeaderRow, &[])
        .await
        .unwrap();

    assert_eq!(batch.len(), 1);
    assert_eq!(batch.get(0, "county").unwrap(), "073");
    server.await.unwrap();
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
    let err = fetcher.fetch("list/states", Envelope::Data, &[]).await.unwrap_err();
    assert!(matches!(err, IngestError::Transport(_)));
}
