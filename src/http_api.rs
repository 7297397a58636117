use crate::acceptor::StorageSink;
use crate::config::Config;
use crate::models::{rules_from_settings, SettingsResponse, StoreRequest, SubscriptionRule};
use crate::reconciler::SettingsSource;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
}

/// Client for the settings and storage endpoints.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    settings_url: String,
    store_url: String,
}

impl HttpApi {
    pub fn new(settings_url: &str, store_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            settings_url: settings_url.to_string(),
            store_url: store_url.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            &config.settings_api_url,
            &config.store_api_url,
            config.http_timeout(),
        )
    }
}

fn check_status(url: &str, response: &reqwest::Response) -> Result<(), ApiError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ApiError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl SettingsSource for HttpApi {
    async fn fetch_rules(&self) -> Result<Vec<SubscriptionRule>, ApiError> {
        let response = self.client.get(&self.settings_url).send().await?;
        check_status(&self.settings_url, &response)?;

        let body: SettingsResponse = response.json().await?;
        debug!("Settings API returned {} records", body.settings.len());
        Ok(rules_from_settings(body.settings))
    }
}

#[async_trait]
impl StorageSink for HttpApi {
    async fn store(&self, request: &StoreRequest) -> Result<(), ApiError> {
        let response = self
            .client
            .post(&self.store_url)
            .json(request)
            .send()
            .await?;
        check_status(&self.store_url, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceId;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Stored = Arc<Mutex<Vec<Value>>>;

    async fn settings() -> Json<Value> {
        Json(json!({
            "settings": [
                {
                    "topic": "sensors/room1",
                    "interval": 10,
                    "device_id": 99,
                    "device": {"id": 7, "serial_number": "SN001", "broker_ip": "10.0.0.5", "broker_port": 1883}
                },
                {"topic": "sensors/orphan", "device": null}
            ]
        }))
    }

    async fn store(State(stored): State<Stored>, Json(body): Json<Value>) -> StatusCode {
        stored.lock().unwrap().push(body);
        StatusCode::CREATED
    }

    async fn broken() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    async fn serve() -> (String, Stored) {
        let stored: Stored = Arc::default();
        let app = Router::new()
            .route("/settings", get(settings))
            .route("/empty", get(|| async { Json(json!({})) }))
            .route("/garbage", get(|| async { "not json" }))
            .route("/store", post(store))
            .route("/broken", get(broken).post(broken))
            .with_state(stored.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), stored)
    }

    fn api(base: &str, settings: &str, store: &str) -> HttpApi {
        HttpApi::new(
            &format!("{}{}", base, settings),
            &format!("{}{}", base, store),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fetches_and_converts_settings() {
        let (base, _) = serve().await;
        let rules = api(&base, "/settings", "/store").fetch_rules().await.unwrap();

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].topic, "sensors/room1");
        assert_eq!(rules[0].device.id, DeviceId::Number(7));
        assert_eq!(rules[0].interval_secs, 10);
    }

    #[tokio::test]
    async fn missing_settings_key_is_an_empty_list() {
        let (base, _) = serve().await;
        let rules = api(&base, "/empty", "/store").fetch_rules().await.unwrap();
        assert!(rules.is_empty());
    }

    #[tokio::test]
    async fn error_status_and_bad_body_fail_the_fetch() {
        let (base, _) = serve().await;

        let err = api(&base, "/broken", "/store").fetch_rules().await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));

        let err = api(&base, "/garbage", "/store").fetch_rules().await.unwrap_err();
        assert!(matches!(err, ApiError::Request(_)));
    }

    #[tokio::test]
    async fn posts_store_request_as_json() {
        let (base, stored) = serve().await;
        let request = StoreRequest {
            topic: "sensors/room1".to_string(),
            payload: "SN001,22.5,55%,40,2024-01-01T10:00:00Z".to_string(),
            device_id: DeviceId::Number(7),
            temperature: Some(22.5),
            humidity: Some(55.0),
            noise: Some(40.0),
            timestamp: "2024-01-01T10:00:00Z".to_string(),
        };

        api(&base, "/settings", "/store").store(&request).await.unwrap();

        let stored = stored.lock().unwrap().clone();
        assert_eq!(
            stored,
            vec![json!({
                "topic": "sensors/room1",
                "payload": "SN001,22.5,55%,40,2024-01-01T10:00:00Z",
                "device_id": 7,
                "temperature": 22.5,
                "humidity": 55.0,
                "noise": 40.0,
                "timestamp": "2024-01-01T10:00:00Z"
            })]
        );
    }

    #[tokio::test]
    async fn store_reports_non_success_status() {
        let (base, _) = serve().await;
        let request = StoreRequest {
            topic: "t".to_string(),
            payload: "p".to_string(),
            device_id: DeviceId::Text("d".to_string()),
            temperature: None,
            humidity: None,
            noise: None,
            timestamp: "2024-01-01T10:00:00Z".to_string(),
        };

        let err = api(&base, "/settings", "/broken").store(&request).await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = api(&format!("http://{}", addr), "/settings", "/store")
            .fetch_rules()
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Request(_)));
    }
}
