//! `HttpJobService` against a minimal local HTTP stub.

use assert_matches::assert_matches;
use metascan_core::entity::EntityName;
use metascan_core::metadata::{JobRequest, MetadataKind};
use metascan_jobs::api::{HttpJobService, JobService, JobServiceError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A request captured by the stub.
struct Captured {
    head: String,
    body: String,
}

/// Serve exactly one request with `status` and a JSON `body`.
async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        let (req_head, req_body) = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let head = text[..split].to_string();
                let body = text[split + 4..].to_string();
                let expected = head
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if body.len() >= expected {
                    break (head, body);
                }
            }
            if n == 0 {
                panic!("connection closed before request was complete");
            }
        };

        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len(),
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = tx.send(Captured {
            head: req_head,
            body: req_body,
        });
    });

    (url, rx)
}

fn request(entity: &str, kinds: &[MetadataKind]) -> JobRequest {
    JobRequest::new([EntityName::new(entity).unwrap()], kinds.iter().copied()).unwrap()
}

#[tokio::test]
async fn submit_posts_scope_endpoint_with_option_values() {
    let (url, captured) = serve_once("200 OK", r#"{"jobId":"707xx0001"}"#).await;
    let service = HttpJobService::new(url);

    let job_id = service
        .submit_job(&request("Invoice__c", &[MetadataKind::Field, MetadataKind::ValidationRule]))
        .await
        .unwrap();
    assert_eq!(job_id.as_str(), "707xx0001");

    let captured = captured.await.unwrap();
    assert!(captured.head.starts_with("POST /jobs/custom "));
    let body: serde_json::Value = serde_json::from_str(&captured.body).unwrap();
    assert_eq!(body["objects"], serde_json::json!(["Invoice__c"]));
    assert_eq!(
        body["metadataOptions"],
        serde_json::json!(["customFieldMetadata", "customValidationRulesMetadata"])
    );
}

#[tokio::test]
async fn error_body_message_is_exposed() {
    let (url, _captured) =
        serve_once("400 Bad Request", r#"{"body":{"message":"Too many objects"}}"#).await;
    let service = HttpJobService::new(url);

    let err = service
        .submit_job(&request("Account", &[MetadataKind::Field]))
        .await
        .unwrap_err();

    assert_matches!(err, JobServiceError::Api { status: 400, .. });
    assert_eq!(err.message(), Some("Too many objects"));
}

#[tokio::test]
async fn list_entities_reads_name_array() {
    let (url, captured) = serve_once("200 OK", r#"["Account","Invoice__c"]"#).await;
    let service = HttpJobService::new(url);

    let names = service.list_entities().await.unwrap();

    assert_eq!(names, ["Account", "Invoice__c"]);
    assert!(captured.await.unwrap().head.starts_with("GET /objects "));
}
