use crate::error::AppError;
use crate::types::{Credential, UsageRecordSet};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Source of usage records for one subscription.
#[async_trait]
pub trait CostFetcher: Send + Sync {
    /// Fetches every usage record for the subscription, following continuation links.
    ///
    /// # Errors
    /// `AppError::Api` for non-success responses, `AppError::Transport` for
    /// connection failures and timeouts, `AppError::Cancelled` on cancellation.
    async fn fetch_usage(
        &self,
        credential: &Credential,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> Result<UsageRecordSet, AppError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageDetailsPage {
    // Null and absent both mean an empty page.
    #[serde(default)]
    value: Option<Vec<Value>>,
    #[serde(default)]
    next_link: Option<String>,
}

/// Client for the Microsoft.Consumption usage-details endpoint.
#[derive(Clone)]
pub struct ConsumptionClient {
    client: Client,
    management_url: String,
    api_version: String,
    max_pages: usize,
}

impl ConsumptionClient {
    /// Creates a client with a per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        management_url: impl Into<String>,
        api_version: impl Into<String>,
        max_pages: usize,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("azure-cost-report/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            management_url: management_url.into(),
            api_version: api_version.into(),
            max_pages,
        })
    }

    /// Resolves a continuation link against the management URL. Links to any
    /// other origin are rejected so the bearer token stays on that host.
    ///
    /// # Errors
    /// Returns `AppError::Api` if the link is malformed or points elsewhere.
    pub fn continuation_url(&self, link: &str) -> Result<Url, AppError> {
        let base = Url::parse(&self.management_url)
            .map_err(|e| AppError::Config(format!("invalid management URL: {e}")))?;
        let next = base.join(link.trim()).map_err(|e| AppError::Api {
            status: 0,
            body: format!("invalid nextLink '{link}': {e}"),
        })?;
        if next.origin() != base.origin() {
            return Err(AppError::Api {
                status: 0,
                body: format!(
                    "nextLink host {} does not match {}",
                    next.origin().ascii_serialization(),
                    base.origin().ascii_serialization()
                ),
            });
        }
        Ok(next)
    }

    /// First-page URL with the pinned `api-version`.
    ///
    /// # Errors
    /// Returns an error if the management URL is malformed.
    pub fn usage_details_url(&self, subscription_id: &str) -> Result<Url, AppError> {
        let base = format!(
            "{}/subscriptions/{}/providers/Microsoft.Consumption/usageDetails",
            self.management_url.trim_end_matches('/'),
            subscription_id
        );
        Url::parse_with_params(&base, &[("api-version", self.api_version.as_str())])
            .map_err(|e| AppError::Config(format!("invalid usage details URL: {e}")))
    }

    async fn fetch_page(
        &self,
        url: &str,
        credential: &Credential,
    ) -> Result<UsageDetailsPage, AppError> {
        debug!(url = %url, "GET usage details page");

        let response = self
            .client
            .get(url)
            .header("Authorization", credential.bearer_header())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(AppError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, "Failed to parse usage details page");
            AppError::Json(e)
        })
    }
}

#[async_trait]
impl CostFetcher for ConsumptionClient {
    async fn fetch_usage(
        &self,
        credential: &Credential,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> Result<UsageRecordSet, AppError> {
        let mut records = UsageRecordSet::new();
        let mut seen = HashSet::new();
        let mut next = Some(self.usage_details_url(subscription_id)?.to_string());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages >= self.max_pages {
                return Err(AppError::Api {
                    status: 0,
                    body: format!("pagination exceeded {} pages", self.max_pages),
                });
            }
            if !seen.insert(url.clone()) {
                return Err(AppError::Api {
                    status: 0,
                    body: format!("pagination loop detected at {url}"),
                });
            }

            let page = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                page = self.fetch_page(&url, credential) => page?,
            };
            pages += 1;

            for item in page.value.iter().flatten() {
                if let Err(reason) = records.ingest(item) {
                    debug!(%reason, "Skipping usage item");
                }
            }

            next = match page.next_link.filter(|link| !link.trim().is_empty()) {
                Some(link) => Some(self.continuation_url(&link)?.to_string()),
                None => None,
            };
        }

        if records.skipped() > 0 {
            warn!(skipped = records.skipped(), "Some usage items were invalid and skipped");
        }
        info!(
            pages,
            records = records.len(),
            skipped = records.skipped(),
            "Fetched usage details"
        );

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SUB: &str = "sub-123";
    const USAGE_PATH: &str = "/subscriptions/sub-123/providers/Microsoft.Consumption/usageDetails";

    fn client(server: &MockServer) -> ConsumptionClient {
        ConsumptionClient::new(server.uri(), "2021-10-01", 10, Duration::from_secs(5))
            .expect("client should build")
    }

    fn credential() -> Credential {
        Credential::new("token-abc".to_string())
    }

    fn usage(date: &str, cost: &str) -> Value {
        json!({"properties": {"usageStart": date, "pretaxCost": cost}})
    }

    #[test]
    fn test_usage_details_url() {
        let client = ConsumptionClient::new(
            "https://management.azure.com/",
            "2021-10-01",
            10,
            Duration::from_secs(5),
        )
        .expect("client should build");
        let url = client.usage_details_url("abc").expect("url should build");
        assert_eq!(
            url.as_str(),
            "https://management.azure.com/subscriptions/abc/providers/Microsoft.Consumption/usageDetails?api-version=2021-10-01"
        );
    }

    #[tokio::test]
    async fn test_fetch_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .and(query_param("api-version", "2021-10-01"))
            .and(header("Authorization", "Bearer token-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    usage("2024-05-01T00:00:00Z", "12.50"),
                    {"properties": {"usageStart": "2024-05-02T00:00:00Z"}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let set = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect("fetch should succeed");

        assert_eq!(set.len(), 1);
        assert_eq!(set.skipped(), 1);
        assert_eq!(set.records()[0].line(), "2024-05-01\t12.50");
    }

    #[tokio::test]
    async fn test_fetch_follows_next_link() {
        let server = MockServer::start().await;
        let next_link = format!("{}/next/usageDetails?$skiptoken=p2", server.uri());

        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    usage("2024-05-01T00:00:00Z", "1.00"),
                    usage("2024-05-02T00:00:00Z", "2.00")
                ],
                "nextLink": next_link
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/next/usageDetails"))
            .and(query_param("$skiptoken", "p2"))
            .and(header("Authorization", "Bearer token-abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [usage("2024-05-03T00:00:00Z", "3.00")],
                "nextLink": null
            })))
            .expect(1)
            .mount(&server)
            .await;

        let set = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect("fetch should succeed");

        let lines: Vec<String> = set.records().iter().map(|r| r.line()).collect();
        assert_eq!(
            lines,
            vec![
                "2024-05-01\t1.00".to_string(),
                "2024-05-02\t2.00".to_string(),
                "2024-05-03\t3.00".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_forbidden_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("AuthorizationFailed"))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect_err("403 should fail");

        match err {
            AppError::Api { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "AuthorizationFailed");
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_empty_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .mount(&server)
            .await;

        let set = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect("fetch should succeed");
        assert!(set.is_empty());
        assert_eq!(set.skipped(), 0);
    }

    #[tokio::test]
    async fn test_fetch_detects_pagination_loop() {
        let server = MockServer::start().await;
        let self_link = format!("{}{USAGE_PATH}?api-version=2021-10-01", server.uri());
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [usage("2024-05-01T00:00:00Z", "1.00")],
                "nextLink": self_link
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect_err("looping pagination should fail");
        assert!(err.is_api());
    }

    #[tokio::test]
    async fn test_fetch_null_value_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": null, "nextLink": null})),
            )
            .mount(&server)
            .await;

        let set = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect("null value should read as an empty page");
        assert!(set.is_empty());
        assert_eq!(set.skipped(), 0);
    }

    #[tokio::test]
    async fn test_fetch_refuses_foreign_next_link() {
        let server = MockServer::start().await;
        let foreign = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [usage("2024-05-01T00:00:00Z", "1.00")],
                "nextLink": format!("{}/steal?$skiptoken=p2", foreign.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(0)
            .mount(&foreign)
            .await;

        let err = client(&server)
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect_err("foreign nextLink should fail");
        assert!(matches!(err, AppError::Api { status: 0, .. }));
    }

    #[test]
    fn test_continuation_url_accepts_relative_link() {
        let client = ConsumptionClient::new(
            "https://management.azure.com",
            "2021-10-01",
            10,
            Duration::from_secs(5),
        )
        .expect("client should build");
        let url = client
            .continuation_url("/subscriptions/abc/usageDetails?$skiptoken=p2")
            .expect("same-host link should resolve");
        assert_eq!(url.host_str(), Some("management.azure.com"));
        assert_eq!(url.path(), "/subscriptions/abc/usageDetails");
    }

    #[tokio::test]
    async fn test_fetch_stops_at_page_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [usage("2024-05-01T00:00:00Z", "1.00")],
                "nextLink": format!("{}/next/usageDetails?$skiptoken=p2", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/next/usageDetails"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(0)
            .mount(&server)
            .await;

        let client =
            ConsumptionClient::new(server.uri(), "2021-10-01", 1, Duration::from_secs(5))
                .expect("client should build");
        let err = client
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect_err("second page should exceed the cap");
        match err {
            AppError::Api { status, body } => {
                assert_eq!(status, 0);
                assert!(body.contains("exceeded 1 pages"));
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client(&server)
            .fetch_usage(&credential(), SUB, &cancel)
            .await
            .expect_err("cancelled fetch should fail");
        assert!(matches!(err, AppError::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(USAGE_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"value": []}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = ConsumptionClient::new(
            server.uri(),
            "2021-10-01",
            10,
            Duration::from_millis(200),
        )
        .expect("client should build");

        let err = client
            .fetch_usage(&credential(), SUB, &CancellationToken::new())
            .await
            .expect_err("slow response should time out");
        assert!(matches!(err, AppError::Transport(_)));
    }
}
