//! Snapshot fetcher backed by the Kismet REST API.

use std::future::Future;
use std::time::Duration;

use log::trace;
use mac_address::MacAddress;
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::KismetConfig;
use crate::messages::DeviceSnapshot;

const LAST_TIME_FIELD: &str = "kismet.device.base.last_time";
const COMMON_NAME_FIELD: &str = "kismet.device.base.commonname";

#[derive(Debug, Error)]
pub enum FetchError {
    /// The server has no (or no usable) record for the address yet.
    #[error("no record found")]
    NotFound,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Source of device snapshots, one call per poll.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(
        &self,
        address: &MacAddress,
    ) -> impl Future<Output = Result<DeviceSnapshot, FetchError>> + Send;
}

/// Field simplification request: only ask Kismet for what the tracker reads.
#[derive(Debug, Serialize)]
struct FieldRequest {
    fields: [[&'static str; 2]; 2],
}

impl Default for FieldRequest {
    fn default() -> Self {
        FieldRequest {
            fields: [
                [LAST_TIME_FIELD, "last_seen"],
                [COMMON_NAME_FIELD, "name"],
            ],
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceRecord {
    #[serde(default)]
    last_seen: i64,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct KismetClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl KismetClient {
    pub fn new(config: &KismetConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(KismetClient {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn device_url(&self, address: &MacAddress) -> String {
        format!("{}/devices/by-mac/{}/devices.json", self.base_url, address)
    }
}

impl SnapshotFetcher for KismetClient {
    async fn fetch(&self, address: &MacAddress) -> Result<DeviceSnapshot, FetchError> {
        let response = self
            .client
            .post(self.device_url(address))
            .query(&[("KISMET", self.api_key.as_str())])
            .json(&FieldRequest::default())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        let body = response.error_for_status()?.bytes().await?;
        let records: Vec<DeviceRecord> = serde_json::from_slice(&body)?;
        trace!("{} record(s) for {}", records.len(), address);

        let record = records
            .into_iter()
            .next()
            .filter(|r| r.last_seen > 0)
            .ok_or(FetchError::NotFound)?;

        Ok(DeviceSnapshot {
            last_seen: record.last_seen,
            identity: record
                .name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| address.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const DEVICE_PATH: &str = "/devices/by-mac/A4:50:46:3B:4F:4D/devices.json";

    async fn setup() -> (MockServer, KismetClient, MacAddress) {
        let server = MockServer::start().await;
        let client = KismetClient::new(&KismetConfig {
            url: format!("{}/", server.uri()),
            api_key: "secret".to_string(),
            timeout_seconds: 5,
        })
        .unwrap();
        (server, client, "A4:50:46:3B:4F:4D".parse().unwrap())
    }

    async fn respond_with(server: &MockServer, template: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_fetch_sends_field_request() {
        let (server, client, address) = setup().await;

        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .and(query_param("KISMET", "secret"))
            .and(body_json(json!({
                "fields": [
                    ["kismet.device.base.last_time", "last_seen"],
                    ["kismet.device.base.commonname", "name"]
                ]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "last_seen": 1_700_000_000, "name": "Pixel" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let snapshot = client.fetch(&address).await.unwrap();
        assert_eq!(snapshot.last_seen, 1_700_000_000);
        assert_eq!(snapshot.identity, "Pixel");
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_address_identity() {
        let (server, client, address) = setup().await;
        respond_with(
            &server,
            ResponseTemplate::new(200).set_body_json(json!([{ "last_seen": 42, "name": "" }])),
        )
        .await;

        let snapshot = client.fetch(&address).await.unwrap();
        assert_eq!(snapshot.identity, "A4:50:46:3B:4F:4D");
    }

    #[tokio::test]
    async fn test_empty_list_is_not_found() {
        let (server, client, address) = setup().await;
        respond_with(&server, ResponseTemplate::new(200).set_body_json(json!([]))).await;

        let result = client.fetch(&address).await;
        assert!(matches!(result, Err(FetchError::NotFound)), "got {result:?}");
    }

    #[tokio::test]
    async fn test_zero_last_seen_is_not_found() {
        let (server, client, address) = setup().await;
        respond_with(&server, ResponseTemplate::new(200).set_body_json(json!([{}]))).await;

        let result = client.fetch(&address).await;
        assert!(matches!(result, Err(FetchError::NotFound)), "got {result:?}");
    }

    #[tokio::test]
    async fn test_http_404_is_not_found() {
        let (server, client, address) = setup().await;
        respond_with(&server, ResponseTemplate::new(404)).await;

        let result = client.fetch(&address).await;
        assert!(matches!(result, Err(FetchError::NotFound)), "got {result:?}");
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let (server, client, address) = setup().await;
        respond_with(&server, ResponseTemplate::new(401).set_body_string("bad key")).await;

        let result = client.fetch(&address).await;
        assert!(matches!(result, Err(FetchError::Transport(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn test_bad_body_is_malformed() {
        let (server, client, address) = setup().await;
        respond_with(&server, ResponseTemplate::new(200).set_body_string("<html>")).await;

        let result = client.fetch(&address).await;
        assert!(matches!(result, Err(FetchError::Malformed(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport() {
        let client = KismetClient::new(&KismetConfig {
            url: "http://127.0.0.1:9".to_string(),
            api_key: "secret".to_string(),
            timeout_seconds: 1,
        })
        .unwrap();
        let address = "A4:50:46:3B:4F:4D".parse().unwrap();

        let result = client.fetch(&address).await;
        assert!(matches!(result, Err(FetchError::Transport(_))), "got {result:?}");
    }
}
