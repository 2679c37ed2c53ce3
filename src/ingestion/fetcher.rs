//! Remote Fetcher - one bounded HTTP GET per call, JSON envelope to rows

use crate::error::{IngestError, Result};
use crate::ingestion::batch::RowBatch;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Shape of a successful response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    /// `{"Header": [...], "Data": [{...}, ...]}` (EPA AQS)
    #[default]
    Data,
    /// `[["col", ...], [cell, ...], ...]` (Census)
    HeaderRow,
}

/// Remote Fetcher Trait
///
/// Implementations perform exactly one round trip per call and never retry;
/// retry policy belongs to the caller.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &str,
        envelope: Envelope,
        params: &[(String, String)],
    ) -> Result<RowBatch>;
}

/// reqwest-backed fetcher bound to one API base URL
pub struct HttpFetcher {
    client: Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(
        &self,
        endpoint: &str,
        envelope: Envelope,
        params: &[(String, String)],
    ) -> Result<RowBatch> {
        let url = self.url_for(endpoint);
        debug!("GET {}", url);

        let response = self.client.get(&url).query(params).send().await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let mut message = extract_error_message(&body);
            if message.is_empty() {
                message = status.canonical_reason().unwrap_or("request failed").to_string();
            }
            return Err(IngestError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        parse_envelope(&body, envelope)
    }
}

/// Parse a success body into rows according to its envelope.
pub fn parse_envelope(body: &str, envelope: Envelope) -> Result<RowBatch> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        IngestError::MalformedResponse(format!("response body is not JSON: {}", e))
    })?;

    match envelope {
        Envelope::Data => {
            let data = value
                .get("Data")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    IngestError::MalformedResponse("response has no 'Data' array".to_string())
                })?;
            RowBatch::from_objects(data)
        }
        Envelope::HeaderRow => {
            let rows = value.as_array().ok_or_else(|| {
                IngestError::MalformedResponse("response is not an array of rows".to_string())
            })?;
            RowBatch::from_header_rows(rows)
        }
    }
}

/// Pull a readable message out of an error body, falling back to the raw text.
pub fn extract_error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };

    for key in ["message", "error"] {
        if let Some(msg) = value.get(key).and_then(Value::as_str) {
            return msg.to_string();
        }
    }

    // AQS reports failures as Header[0].error = ["...", ...]
    let header_errors: Vec<&str> = value
        .get("Header")
        .and_then(Value::as_array)
        .and_then(|h| h.first())
        .and_then(|h| h.get("error"))
        .and_then(Value::as_array)
        .map(|errs| errs.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !header_errors.is_empty() {
        return header_errors.join("; ");
    }

    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_envelope() {
        let body = r#"{"Header":[{"status":"Success","rows":2}],
            "Data":[{"state_code":"06","county_code":"073","sample_measurement":4.1},
                    {"state_code":"06","county_code":"001","sample_measurement":9.0}]}"#;
        let batch = parse_envelope(body, Envelope::Data).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.columns()[0], "state_code");
    }

    #[test]
    fn test_empty_data_is_not_malformed() {
        let body = r#"{"Header":[{"status":"No data matched your selection"}],"Data":[]}"#;
        let batch = parse_envelope(body, Envelope::Data).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_missing_data_is_malformed() {
        for body in [r#"{"Header":[{"status":"Success"}]}"#, "not json", r#"{"Data": 3}"#] {
            let err = parse_envelope(body, Envelope::Data).unwrap_err();
            assert!(matches!(err, IngestError::MalformedResponse(_)), "{}", body);
        }
    }

    #[test]
    fn test_parse_header_row_envelope() {
        let body = r#"[["NAME","DP03_0062E","state","county"],["Kern County, California","63883","06","029"]]"#;
        let batch = parse_envelope(body, Envelope::HeaderRow).unwrap();
        assert_eq!(batch.columns(), &["NAME", "DP03_0062E", "state", "county"]);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(extract_error_message(r#"{"message":"bad key"}"#), "bad key");
        assert_eq!(
            extract_error_message(r#"{"Header":[{"status":"Failed","error":["Invalid param","Bad date"]}]}"#),
            "Invalid param; Bad date"
        );
        assert_eq!(extract_error_message("  Service Unavailable \n"), "Service Unavailable");
        assert_eq!(extract_error_message(r#"{"other":1}"#), r#"{"other":1}"#);
    }

    #[test]
    fn test_url_join() {
        let fetcher = HttpFetcher::new("https://aqs.epa.gov/data/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            fetcher.url_for("/dailyData/byCounty"),
            "https://aqs.epa.gov/data/api/dailyData/byCounty"
        );
    }
}
