//! End-to-end tests of the HTTP API against in-memory storage fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use gleafd_core::segment::{Segment, SegmentRepository};
use gleafd_core::snowflake::{MachineStorage, Metadata};
use gleafd_core::{Error, IdService, Result};
use gleafd_server::server::http;

struct MemoryRepo {
    rows: Mutex<Vec<Segment>>,
}

impl MemoryRepo {
    fn with_example() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(vec![Segment {
                biz_tag: "example".to_string(),
                max_id: 1,
                step: 1000,
                description: Some("gleafd example".to_string()),
                updated: Utc::now(),
            }]),
        })
    }

    fn advance(&self, biz_tag: &str, step: Option<i32>) -> Result<Segment> {
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.biz_tag == biz_tag)
            .ok_or(Error::NotFound)?;
        row.max_id += i64::from(step.unwrap_or(row.step));
        Ok(row.clone())
    }
}

#[async_trait]
impl SegmentRepository for MemoryRepo {
    async fn list(&self) -> Result<Vec<Segment>> {
        Ok(self.rows.lock().clone())
    }

    async fn get(&self, biz_tag: &str) -> Result<Segment> {
        self.rows
            .lock()
            .iter()
            .find(|row| row.biz_tag == biz_tag)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn list_biz_tags(&self) -> Result<Vec<String>> {
        Ok(self.rows.lock().iter().map(|row| row.biz_tag.clone()).collect())
    }

    async fn update_max_id(&self, biz_tag: &str) -> Result<Segment> {
        self.advance(biz_tag, None)
    }

    async fn update_max_id_with_step(&self, biz_tag: &str, step: i32) -> Result<Segment> {
        self.advance(biz_tag, Some(step))
    }
}

#[derive(Default)]
struct MemoryStorage {
    records: Mutex<HashMap<String, Metadata>>,
    next_id: AtomicI32,
}

#[async_trait]
impl MachineStorage for MemoryStorage {
    async fn get_or_new(&self, name: &str, addr: &str) -> Result<Metadata> {
        let key = format!("{name}@{addr}");
        let mut records = self.records.lock();
        if let Some(found) = records.get(&key) {
            return Ok(found.clone());
        }
        let md = Metadata {
            name: name.to_string(),
            addr: addr.to_string(),
            machine_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: 0,
        };
        records.insert(key, md.clone());
        Ok(md)
    }

    async fn list(&self) -> Result<Vec<Metadata>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    async fn update(&self, md: &Metadata) -> Result<()> {
        let key = format!("{}@{}", md.name, md.addr);
        self.records.lock().insert(key, md.clone());
        Ok(())
    }
}

async fn test_router() -> Router {
    let svc = IdService::builder()
        .name("gleafd-test")
        .addr("127.0.0.1:9060")
        .segment_repository(MemoryRepo::with_example())
        .machine_storage(Arc::new(MemoryStorage::default()))
        .build()
        .await
        .unwrap();
    http::router(Arc::new(svc), CancellationToken::new())
}

async fn get_json(router: Router, uri: &str) -> Value {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn ids_of(body: &Value) -> Vec<i64> {
    body["data"]
        .as_array()
        .expect("data should be an array")
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn segment_ids_round_trip() {
    let body = get_json(test_router().await, "/api/v1/segments/example?count=10").await;

    assert_eq!(body["code"], 0);
    assert_eq!(body["msg"], "Ok");
    let ids = ids_of(&body);
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
}

#[tokio::test]
async fn count_defaults_to_one() {
    let body = get_json(test_router().await, "/api/v1/segments/example").await;

    assert_eq!(body["code"], 0);
    assert_eq!(ids_of(&body).len(), 1);
}

#[tokio::test]
async fn zero_count_returns_an_empty_array() {
    let body = get_json(test_router().await, "/api/v1/segments/example?count=0").await;

    assert_eq!(body["code"], 0);
    assert!(ids_of(&body).is_empty());
}

#[tokio::test]
async fn malformed_count_is_a_request_error() {
    let body = get_json(test_router().await, "/api/v1/segments/example?count=ten").await;

    assert_eq!(body["code"], 400);
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn unknown_biztag_is_a_request_error() {
    let body = get_json(test_router().await, "/api/v1/segments/missing?count=1").await;

    assert_eq!(body["code"], 400);
    assert_eq!(body["msg"], "biztag not found");
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn snowflake_ids_are_strictly_increasing() {
    let body = get_json(test_router().await, "/api/v1/snowflakes/example?count=5").await;

    assert_eq!(body["code"], 0);
    let ids = ids_of(&body);
    assert_eq!(ids.len(), 5);
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "not increasing: {ids:?}");
}

#[tokio::test]
async fn health_reports_serving() {
    let body = get_json(test_router().await, "/api/v1/health").await;

    assert_eq!(body["code"], 0);
    assert_eq!(body["data"], 1);
}

#[tokio::test]
async fn disabled_engine_is_reported() {
    let svc = IdService::builder()
        .name("segments-only")
        .segment_repository(MemoryRepo::with_example())
        .build()
        .await
        .unwrap();
    let router = http::router(Arc::new(svc), CancellationToken::new());

    let body = get_json(router, "/api/v1/snowflakes/example?count=1").await;
    assert_eq!(body["code"], 400);
    assert_eq!(body["msg"], "service disabled");
    assert!(body["data"].is_null());
}
