pub mod dashboard;
pub mod health;
pub mod history;
pub mod ingress;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(ingress::router())
        .merge(history::router())
        .merge(dashboard::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Ingestor;
    use crate::store::{MemoryStore, Record, Store, StoreError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ingestor = Ingestor::new(store.clone(), "iot_readings", 28.0);
        (router(AppState::new(ingestor, 20)), store)
    }

    struct OfflineStore;

    #[async_trait]
    impl Store for OfflineStore {
        async fn add(&self, _: &str, _: Record) -> Result<String, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<Record>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn offline_app() -> Router {
        let ingestor = Ingestor::new(Arc::new(OfflineStore), "iot_readings", 28.0);
        router(AppState::new(ingestor, 20))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Body) -> (StatusCode, Vec<u8>) {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn push_body(payload: &Value) -> Body {
        let envelope = json!({ "message": { "data": STANDARD.encode(payload.to_string()) } });
        Body::from(envelope.to_string())
    }

    #[tokio::test]
    async fn push_stores_decoded_payload() {
        let (app, store) = app();
        let (status, body) = send(&app, Method::POST, "/", push_body(&json!({"a": 1}))).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "OK");

        let stored = store.query("iot_readings", "received_at", 20).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["a"], json!(1));
        assert!(stored[0].contains_key("received_at"));
    }

    #[tokio::test]
    async fn push_without_message_is_client_error_and_stores_nothing() {
        let (app, store) = app();
        let (status, _) = send(&app, Method::POST, "/", Body::from(r#"{"subscription":"s"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.len("iot_readings").await, 0);

        let (_, body) = send(&app, Method::GET, "/", Body::empty()).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["ingest"]["rejected"], 1);
        assert_eq!(body["ingest"]["stored"], 0);
    }

    #[tokio::test]
    async fn push_with_store_down_is_server_error() {
        let app = offline_app();
        let (status, body) = send(&app, Method::POST, "/", push_body(&json!({"a": 1}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(String::from_utf8(body).unwrap(), "Failed to store reading");

        let (_, body) = send(&app, Method::GET, "/", Body::empty()).await;
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["ingest"]["failed"], 1);
        assert_eq!(body["ingest"]["rejected"], 0);

        let (status, body) = send(&app, Method::GET, "/history", Body::empty()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(String::from_utf8(body).unwrap(), "Failed to load readings");
    }

    #[tokio::test]
    async fn history_returns_twenty_newest_descending() {
        let (app, _) = app();
        for i in 0..25 {
            let (status, _) = send(&app, Method::POST, "/", push_body(&json!({"seq": i}))).await;
            assert_eq!(status, StatusCode::OK);
            // Receipt stamps have microsecond resolution; keep them distinct.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let (status, body) = send(&app, Method::GET, "/history", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(records.len(), 20);
        let seqs: Vec<i64> = records.iter().map(|r| r["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, (5..25).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn dashboard_renders_stored_readings() {
        let (app, _) = app();
        let reading = json!({"device_id": "t-1", "device_type": "temperature", "value": 21.5});
        send(&app, Method::POST, "/", push_body(&reading)).await;

        let (status, body) = send(&app, Method::GET, "/dashboard", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        let html = String::from_utf8(body).unwrap();
        assert!(html.contains("<td>t-1</td>"));
        assert!(html.contains("<td>21.5</td>"));
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (app, _) = app();
        let (status, body) = send(&app, Method::GET, "/healthz", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["status"], "ok");
    }
}
