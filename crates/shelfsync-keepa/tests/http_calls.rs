use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shelfsync_core::Locale;
use shelfsync_keepa::{CatalogApi, DetailRequest, KeepaClient, KeepaConfig, DEFAULT_OFFERS};
use shelfsync_storage::{BackoffPolicy, HttpClientConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Local HTTP endpoint answering every request with the same response; counts requests received.
async fn serve(status_line: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let response = format!(
                    "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}"), hits)
}

fn client(base_url: String) -> KeepaClient {
    let config = KeepaConfig {
        base_url,
        http: HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..HttpClientConfig::default()
        },
        ..KeepaConfig::new("test-key")
    };
    KeepaClient::with_default_budget(config).unwrap()
}

#[tokio::test]
async fn failed_product_call_is_sent_once() {
    let (base, hits) = serve("HTTP/1.1 503 Service Unavailable", "").await;
    let api = client(base);

    let err = api
        .fetch_product_details(Locale::It, &DetailRequest::competitive_stats(vec!["B01".into()], DEFAULT_OFFERS))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "TransportError");
    assert!(err.to_string().contains("503"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn throttled_best_seller_and_seller_calls_are_sent_once() {
    let (base, hits) = serve("HTTP/1.1 429 Too Many Requests", "").await;
    let api = client(base);

    assert!(api.fetch_best_sellers(Locale::It, 412609031).await.is_err());
    assert!(api.fetch_seller_info(Locale::It, "A11IL2PNWYJU7H").await.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn token_status_retries_transient_failures() {
    let (base, hits) = serve("HTTP/1.1 503 Service Unavailable", "").await;
    let api = client(base);

    assert!(api.refresh_token_status().await.is_err());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn responses_update_the_budget_and_reservations_lower_it() {
    let (base, _) = serve(
        "HTTP/1.1 200 OK",
        r#"{"tokensLeft": 42, "refillRate": 20, "products": []}"#,
    )
    .await;
    let api = client(base);

    api.fetch_product_details(Locale::It, &DetailRequest::detail(vec!["B01".into()], DEFAULT_OFFERS))
        .await
        .unwrap();
    let observed = api.token_budget().await;
    assert!((42.0..43.0).contains(&observed.available));
    assert_eq!(observed.refill_per_minute, 20.0);

    api.reserve_tokens(11.4).await;
    let reserved = api.token_budget().await;
    assert!((30.6..31.6).contains(&reserved.available));
}
