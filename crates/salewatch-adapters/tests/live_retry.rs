use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use salewatch_adapters::{live_extractor, ExtractError, RecordExtractor};
use salewatch_core::GroupSource;
use salewatch_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Answers every request with 503 and counts them.
async fn unavailable_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                if socket.read(&mut buf).await.unwrap_or(0) > 0 {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}/"), requests)
}

#[tokio::test]
async fn unavailable_county_is_requested_once_per_attempt() {
    let (base_url, requests) = unavailable_server().await;
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("salewatch-test".to_string()),
    })
    .unwrap();
    let retry = BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let extractor = live_extractor(http, &base_url, retry).unwrap();

    let err = extractor
        .fetch(&GroupSource::new("52", "Cape May County, NJ"))
        .await
        .unwrap_err();

    match err {
        ExtractError::Exhausted { attempts, last, .. } => {
            assert_eq!(attempts, retry.attempts());
            assert!(matches!(*last, ExtractError::Fetch(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(requests.load(Ordering::SeqCst), retry.attempts());
}
