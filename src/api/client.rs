use crate::error::{AppError, Result};
use crate::trend::TrendKind;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the aggregate trend endpoints.
///
/// Payloads are handed over as-is; shaping them is the dashboard's business.
#[derive(Debug, Clone)]
pub struct TrendClient {
    base_url: String,
    http: reqwest::Client,
}

impl TrendClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn trend_url(&self, kind: TrendKind) -> String {
        format!("{}/power/trend/{}", self.base_url, kind)
    }

    /// Fetch one trend series for a meter
    pub async fn fetch_trend(&self, kind: TrendKind, target_id: &str) -> Result<Value> {
        let url = self.trend_url(kind);
        debug!(url = %url, target_id = %target_id, "fetching trend");

        self.get(&url, &[("meter_id", target_id)]).await
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self.http.get(url).query(query).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_url() {
        let client = TrendClient::new("http://localhost:8000/api/").unwrap();

        assert_eq!(
            client.trend_url(TrendKind::Day),
            "http://localhost:8000/api/power/trend/day"
        );
        assert_eq!(
            client.trend_url(TrendKind::Month),
            "http://localhost:8000/api/power/trend/month"
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error() {
        let client = TrendClient::new("http://127.0.0.1:1").unwrap();
        let result = client.fetch_trend(TrendKind::Week, "METER001").await;

        assert!(matches!(result, Err(AppError::Http(_))));
    }
}
