//! The external data source behind the download step.

use super::egress::EgressPath;
use super::ledger::LedgerKey;
use crate::dataset::Row;
use crate::errors::FetchError;
use async_trait::async_trait;

/// Fetches the records of one `(entity, period)` pair.
///
/// Implementations classify failures: `RateLimited` when the service is
/// throttling the given egress path, `Transient` when a retry may succeed,
/// `Permanent` when it never will.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    /// Fetches all records for `key` through `egress`.
    async fn fetch(&self, key: &LedgerKey, egress: &EgressPath) -> Result<Vec<Row>, FetchError>;
}

#[cfg(feature = "http")]
pub use http::HttpRecordFetcher;

#[cfg(feature = "http")]
mod http {
    use super::{EgressPath, FetchError, LedgerKey, RecordFetcher, Row};
    use crate::errors::ConfigError;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use reqwest::StatusCode;
    use std::time::Duration;
    use tracing::debug;

    /// Fetches JSON records over HTTP.
    ///
    /// The URL template may contain `{entity}`, `{period}`, `{start}` and
    /// `{end}`; the last two are the period's first and last calendar day
    /// (`YYYY-MM-DD`). The body must be a JSON array of objects or an
    /// object with a `records` array.
    #[derive(Debug)]
    pub struct HttpRecordFetcher {
        url_template: String,
        timeout: Duration,
        direct: reqwest::Client,
        proxied: DashMap<String, reqwest::Client>,
    }

    impl HttpRecordFetcher {
        /// Creates a fetcher.
        ///
        /// # Errors
        ///
        /// Returns `ConfigError::Invalid` if the HTTP client cannot be built.
        pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
            let direct = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ConfigError::Invalid {
                    field: "http.client".to_string(),
                    reason: e.to_string(),
                })?;
            Ok(Self {
                url_template: url_template.into(),
                timeout,
                direct,
                proxied: DashMap::new(),
            })
        }

        /// The URL for `key`.
        #[must_use]
        pub fn url_for(&self, key: &LedgerKey) -> String {
            self.url_template
                .replace("{entity}", &key.entity_id)
                .replace("{period}", &key.period.to_string())
                .replace("{start}", &key.period.start_date().to_string())
                .replace("{end}", &key.period.end_date().to_string())
        }

        fn client_for(&self, egress: &EgressPath) -> Result<reqwest::Client, FetchError> {
            let Some(proxy_url) = &egress.proxy else {
                return Ok(self.direct.clone());
            };
            if let Some(client) = self.proxied.get(proxy_url) {
                return Ok(client.clone());
            }
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| FetchError::Permanent(format!("invalid proxy '{proxy_url}': {e}")))?;
            let client = reqwest::Client::builder()
                .timeout(self.timeout)
                .proxy(proxy)
                .build()
                .map_err(|e| FetchError::Permanent(format!("cannot build client for '{proxy_url}': {e}")))?;
            self.proxied.insert(proxy_url.clone(), client.clone());
            Ok(client)
        }
    }

    /// Error bodies kept in ledger messages are cut to this many bytes.
    const MAX_ERROR_BODY: usize = 512;

    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... ({} bytes truncated)", &body[..end], body.len() - end)
    }

    fn classify_status(status: StatusCode, egress: &EgressPath, body: &str) -> FetchError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            FetchError::RateLimited {
                egress: egress.name.clone(),
            }
        } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            FetchError::Transient(format!("HTTP {status}: {body}"))
        } else {
            FetchError::Permanent(format!("HTTP {status}: {body}"))
        }
    }

    fn decode_records(value: serde_json::Value) -> Result<Vec<Row>, FetchError> {
        let items = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => match map.remove("records") {
                Some(serde_json::Value::Array(items)) => items,
                _ => return Err(FetchError::Permanent("response has no 'records' array".to_string())),
            },
            _ => return Err(FetchError::Permanent("response is not a JSON array".to_string())),
        };
        items
            .into_iter()
            .map(|item| {
                serde_json::from_value(item)
                    .map_err(|e| FetchError::Permanent(format!("record is not an object: {e}")))
            })
            .collect()
    }

    #[async_trait]
    impl RecordFetcher for HttpRecordFetcher {
        async fn fetch(&self, key: &LedgerKey, egress: &EgressPath) -> Result<Vec<Row>, FetchError> {
            let client = self.client_for(egress)?;
            let url = self.url_for(key);
            debug!(%key, %egress, url = %url, "Fetching records");

            let response = client.get(&url).send().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Transient(format!("timed out after {:?}", self.timeout))
                } else {
                    FetchError::Transient(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status, egress, &truncate_body(&body)));
            }

            let value: serde_json::Value = response
                .json()
                .await
                .map_err(|e| FetchError::Permanent(format!("invalid JSON body: {e}")))?;
            decode_records(value)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        fn key() -> LedgerKey {
            LedgerKey::new("store-7", "202402B".parse().unwrap())
        }

        #[test]
        fn test_url_template() {
            let fetcher = HttpRecordFetcher::new(
                "https://api.example.test/weather?site={entity}&p={period}&from={start}&to={end}",
                Duration::from_secs(5),
            )
            .unwrap();
            assert_eq!(
                fetcher.url_for(&key()),
                "https://api.example.test/weather?site=store-7&p=202402B&from=2024-02-16&to=2024-02-29"
            );
        }

        #[test]
        fn test_status_classification() {
            let egress = EgressPath::direct();
            assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, &egress, "").is_rate_limited());
            assert!(matches!(
                classify_status(StatusCode::BAD_GATEWAY, &egress, ""),
                FetchError::Transient(_)
            ));
            assert!(matches!(
                classify_status(StatusCode::NOT_FOUND, &egress, "no such site"),
                FetchError::Permanent(_)
            ));
        }

        #[test]
        fn test_error_body_is_truncated() {
            let short = "upstream overloaded";
            assert_eq!(truncate_body(short), short);

            let page = "é".repeat(400);
            let cut = truncate_body(&page);
            assert!(cut.len() < page.len());
            assert!(cut.starts_with(&"é".repeat(256)));
            assert!(cut.ends_with("... (288 bytes truncated)"));

            let err = classify_status(StatusCode::BAD_GATEWAY, &EgressPath::direct(), &truncate_body(&page));
            let FetchError::Transient(message) = err else {
                panic!("unexpected {err:?}");
            };
            assert!(message.len() < 600);
        }

        #[test]
        fn test_decode_records_shapes() {
            let rows = decode_records(json!([{"temp": 21.5}, {"temp": 19.0}])).unwrap();
            assert_eq!(rows.len(), 2);

            let rows = decode_records(json!({"records": [{"temp": 1}]})).unwrap();
            assert_eq!(rows[0]["temp"], json!(1));

            assert!(decode_records(json!({"data": []})).is_err());
            assert!(decode_records(json!([1, 2])).is_err());
        }
    }
}
