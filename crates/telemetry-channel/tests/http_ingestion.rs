// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use mockito::{Matcher, Server};
use serde_json::json;
use telemetry_channel::{
    Batch, BatchId, Credentials, HttpIngestion, Ingestion, LogEntry, LogUrl, StoredLog,
    TransportError,
};
use uuid::Uuid;

fn batch() -> Batch {
    Batch {
        id: BatchId(3),
        group: "analytics".to_string(),
        attempt: 0,
        logs: vec![
            StoredLog {
                id: 1,
                entry: LogEntry::new("analytics", json!({"event": "start"})),
            },
            StoredLog {
                id: 2,
                entry: LogEntry::new("analytics", json!({"event": "stop"})),
            },
        ],
    }
}

fn credentials() -> Credentials {
    Credentials {
        app_secret: "secret".to_string(),
        install_id: Uuid::nil(),
    }
}

fn ingestion() -> HttpIngestion {
    HttpIngestion::new(Duration::from_secs(5), None)
}

#[tokio::test]
async fn posts_batch_with_credentials() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/logs")
        .match_query(Matcher::UrlEncoded(
            "api-version".to_string(),
            "1.0.0".to_string(),
        ))
        .match_header("App-Secret", "secret")
        .match_header("Install-ID", Uuid::nil().to_string().as_str())
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""event":"start""#.to_string()),
            Matcher::Regex(r#""event":"stop""#.to_string()),
        ]))
        .with_status(200)
        .create_async()
        .await;

    let url = LogUrl::parse(&server.url()).unwrap();
    let ack = ingestion()
        .send(&batch(), &credentials(), &url)
        .await
        .unwrap();

    assert_eq!(ack.status, 200);
    mock.assert_async().await;
}

#[tokio::test]
async fn compressed_batches_are_flagged() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/logs")
        .match_header("Content-Encoding", "zstd")
        .with_status(202)
        .create_async()
        .await;

    let url = LogUrl::parse(&server.url()).unwrap();
    let ack = HttpIngestion::new(Duration::from_secs(5), Some(3))
        .send(&batch(), &credentials(), &url)
        .await
        .unwrap();

    assert_eq!(ack.status, 202);
    mock.assert_async().await;
}

#[tokio::test]
async fn status_codes_are_classified() {
    let cases = [
        (503, TransportError::Server(503)),
        (429, TransportError::Server(429)),
        (401, TransportError::Unauthorized(401)),
        (404, TransportError::InvalidEndpoint(404)),
        (400, TransportError::Rejected(400)),
    ];
    for (status, expected) in cases {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logs")
            .match_query(Matcher::Any)
            .with_status(status)
            .with_body("nope")
            .create_async()
            .await;

        let url = LogUrl::parse(&server.url()).unwrap();
        let result = ingestion().send(&batch(), &credentials(), &url).await;

        assert_eq!(result, Err(expected), "status {status}");
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = LogUrl::parse(&format!("http://127.0.0.1:{port}")).unwrap();

    let result = ingestion().send(&batch(), &credentials(), &url).await;

    let err = result.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)), "{err:?}");
    assert!(err.is_retryable());
}
