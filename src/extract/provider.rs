use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::error::{Classify, ExtractError};

/// Source of raw forecast points for one location.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `steps` forecast points for `location`, as untyped JSON.
    async fn fetch(&self, location: &str, steps: u32) -> Result<Vec<Value>, ExtractError>;
}

/// Provider speaking `GET {base}/forecast?location={id}&window={n}&appid={key}`.
pub struct HttpForecastProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    breaker: Arc<CircuitBreaker>,
}

impl HttpForecastProvider {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ExtractError> {
        let endpoint = format!("{}/forecast", base_url.trim_end_matches('/'));
        Url::parse(&endpoint).map_err(|e| ExtractError::InvalidEndpoint(format!("{endpoint}: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("forecast-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExtractError::InvalidEndpoint(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            breaker,
        })
    }

    fn request_url(&self, location: &str, steps: u32) -> Result<Url, ExtractError> {
        let window = steps.to_string();
        Url::parse_with_params(
            &self.endpoint,
            &[
                ("location", location),
                ("window", window.as_str()),
                ("appid", self.api_key.as_str()),
            ],
        )
        .map_err(|e| ExtractError::InvalidEndpoint(e.to_string()))
    }

    async fn send(&self, location: &str, steps: u32) -> Result<Vec<Value>, ExtractError> {
        let url = self.request_url(location, steps)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(e, location))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(60);
            return Err(ExtractError::RateLimited { retry_after_secs });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ExtractError::Unauthorized(format!(
                "HTTP {} for location {location}",
                status.as_u16()
            )));
        }
        if status.is_server_error() {
            return Err(ExtractError::ProviderStatus {
                status: status.as_u16(),
                location: location.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ExtractError::MalformedPayload {
                location: location.to_string(),
                reason: format!("provider rejected request with HTTP {}", status.as_u16()),
            });
        }

        // A body cut off mid-read is a transport failure, not a bad payload
        let bytes = resp.bytes().await.map_err(|e| transport_error(e, location))?;
        let body: Value =
            serde_json::from_slice(&bytes).map_err(|e| ExtractError::MalformedPayload {
                location: location.to_string(),
                reason: format!("response is not JSON: {e}"),
            })?;
        points_from_body(body, location)
    }
}

fn transport_error(e: reqwest::Error, location: &str) -> ExtractError {
    if e.is_decode() {
        ExtractError::MalformedPayload {
            location: location.to_string(),
            reason: e.to_string(),
        }
    } else {
        ExtractError::Network(e.without_url().to_string())
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, location: &str, steps: u32) -> Result<Vec<Value>, ExtractError> {
        if !self.breaker.is_allowed() {
            return Err(ExtractError::CircuitOpen {
                remaining_secs: self.breaker.remaining_cooldown().as_secs(),
            });
        }

        match self.send(location, steps).await {
            Ok(points) => {
                self.breaker.record_success();
                debug!(location, points = points.len(), "provider call succeeded");
                Ok(points)
            }
            Err(err) => {
                if err.is_retryable() {
                    self.breaker.record_failure();
                }
                warn!(location, error = %err, "provider call failed");
                Err(err)
            }
        }
    }
}

/// Accepts a bare array of points or an object wrapping them in `list`.
///
/// A wrapper's `city` object is copied onto each point that has none, so
/// location ids travel with the point.
pub fn points_from_body(body: Value, location: &str) -> Result<Vec<Value>, ExtractError> {
    match body {
        Value::Array(points) => Ok(points),
        Value::Object(mut map) => {
            let city = map.remove("city");
            match map.remove("list") {
                Some(Value::Array(mut points)) => {
                    if let Some(city) = city {
                        for point in points.iter_mut() {
                            if let Value::Object(fields) = point {
                                fields.entry("city").or_insert_with(|| city.clone());
                            }
                        }
                    }
                    Ok(points)
                }
                _ => Err(ExtractError::MalformedPayload {
                    location: location.to_string(),
                    reason: "expected a JSON array of forecast points".to_string(),
                }),
            }
        }
        other => Err(ExtractError::MalformedPayload {
            location: location.to_string(),
            reason: format!(
                "expected a JSON array of forecast points, got {}",
                crate::utils::json_path::json_type_name(&other)
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response, then close the connection.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn local_provider(base: &str) -> HttpForecastProvider {
        HttpForecastProvider::new(
            base,
            "key",
            Duration::from_secs(5),
            Arc::new(CircuitBreaker::new(Duration::from_secs(60))),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_body_cut_off_midway_is_retryable() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 200\r\n\r\n[{\"dt\":",
        )
        .await;
        let err = local_provider(&base).fetch("1", 4).await.unwrap_err();
        assert!(matches!(err, ExtractError::Network(_)), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_complete_non_json_body_is_malformed() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 9\r\n\r\nnot json!",
        )
        .await;
        let err = local_provider(&base).fetch("1", 4).await.unwrap_err();
        assert!(matches!(err, ExtractError::MalformedPayload { .. }), "got {err:?}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_array_body_is_returned() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 19\r\n\r\n[{\"dt\":1},{\"dt\":2}]",
        )
        .await;
        let points = local_provider(&base).fetch("1", 4).await.unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn test_bare_array_is_accepted() {
        let points = points_from_body(json!([{"dt": 1}, {"dt": 2}]), "1").unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn test_list_wrapper_carries_city() {
        let body = json!({
            "cod": "200",
            "city": {"id": 2643743, "name": "London"},
            "list": [{"dt": 1}, {"dt": 2, "city": {"id": 1}}]
        });
        let points = points_from_body(body, "2643743").unwrap();
        assert_eq!(points[0]["city"]["id"], json!(2643743));
        assert_eq!(points[1]["city"]["id"], json!(1));
    }

    #[test]
    fn test_other_shapes_are_malformed() {
        let err = points_from_body(json!({"message": "oops"}), "1").unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(
            points_from_body(json!("text"), "1"),
            Err(ExtractError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_request_url_encodes_parameters() {
        let provider = HttpForecastProvider::new(
            "https://api.example.com/data/2.5/",
            "k&y",
            Duration::from_secs(5),
            Arc::new(CircuitBreaker::new(Duration::from_secs(60))),
        )
        .unwrap();
        let url = provider.request_url("London,GB", 8).unwrap();
        assert_eq!(url.path(), "/data/2.5/forecast");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("location".to_string(), "London,GB".to_string()),
                ("window".to_string(), "8".to_string()),
                ("appid".to_string(), "k&y".to_string()),
            ]
        );
    }

    #[test]
    fn test_invalid_base_url_is_a_configuration_error() {
        let err = HttpForecastProvider::new(
            "not a url",
            "key",
            Duration::from_secs(5),
            Arc::new(CircuitBreaker::new(Duration::from_secs(60))),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ExtractError::InvalidEndpoint(_)));
    }
}
