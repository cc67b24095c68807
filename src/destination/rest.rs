// ABOUTME: PostgREST destination (Supabase-style /rest/v1 endpoints)
// ABOUTME: Upserts JSON arrays with merge-duplicates resolution and reads counts from Content-Range

use super::Destination;
use crate::postgres::TlsPolicy;
use crate::record::{records_to_json_array, Record};
use crate::tables::{validate_table_name, TableDescriptor};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal";

/// Writes through a PostgREST API
///
/// PostgREST has no TRUNCATE; [`Destination::clear_table`] issues a filtered
/// DELETE instead, which removes the rows but does not reset identity
/// sequences or cascade to child tables.
pub struct RestDestination {
    client: Option<reqwest::Client>,
    base_url: String,
}

impl RestDestination {
    /// Build an HTTP client carrying the API key on every request
    pub fn new(api_url: &str, api_key: &str, tls_policy: TlsPolicy) -> Result<Self> {
        crate::utils::validate_api_url(api_url)?;

        let client = reqwest::Client::builder()
            .default_headers(auth_headers(api_key)?)
            .danger_accept_invalid_certs(tls_policy == TlsPolicy::AcceptInvalidCerts)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client for destination API")?;

        Ok(Self {
            client: Some(client),
            base_url: api_url.trim().trim_end_matches('/').to_string(),
        })
    }

    /// Check that the API answers and the key is accepted
    ///
    /// Probes the first table so a bad key or unreachable host fails before
    /// the run touches any data.
    pub async fn check_connectivity(&self, table: &TableDescriptor) -> Result<()> {
        self.count_rows(table)
            .await
            .map(|_| ())
            .context("Destination API is not reachable or rejected the API key")
    }

    fn client(&self) -> Result<&reqwest::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("destination API client is already closed"))
    }

    fn endpoint(&self, table: &str) -> Result<String> {
        table_endpoint(&self.base_url, table)
    }
}

/// `{base}/rest/v1/{table}`
pub fn table_endpoint(base_url: &str, table: &str) -> Result<String> {
    validate_table_name(table)?;
    Ok(format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table))
}

fn auth_headers(api_key: &str) -> Result<HeaderMap> {
    if api_key.trim().is_empty() {
        bail!("Destination API key cannot be empty");
    }

    let mut key = HeaderValue::from_str(api_key).context("API key contains invalid characters")?;
    key.set_sensitive(true);
    let mut bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .context("API key contains invalid characters")?;
    bearer.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert("apikey", key);
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`
///
/// Returns `None` when the total is unknown (`0-24/*`) or the header is malformed.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// Number of rows a write touched, from a `Content-Range` header like `*/50` or `0-49/*`
fn parse_content_range_span(value: &str) -> Option<u64> {
    if let Some(total) = parse_content_range_total(value) {
        return Some(total);
    }
    let (range, _) = value.trim().rsplit_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    end.checked_sub(start).map(|span| span + 1)
}

/// A non-success answer from the API, with the start of its body
#[derive(Debug)]
pub struct ApiError {
    pub action: String,
    pub status: StatusCode,
    pub body: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with HTTP {}: {}",
            self.action, self.status, self.body
        )
    }
}

impl std::error::Error for ApiError {}

async fn error_for_status(
    response: reqwest::Response,
    action: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError {
        action: action.to_string(),
        status,
        body: body.chars().take(500).collect(),
    }
    .into())
}

#[async_trait]
impl Destination for RestDestination {
    fn kind(&self) -> &'static str {
        "rest"
    }

    async fn count_rows(&self, table: &TableDescriptor) -> Result<u64> {
        let url = self.endpoint(&table.name)?;
        let select = table.conflict_key.join(",");

        let response = self
            .client()?
            .head(&url)
            .query(&[("select", select.as_str())])
            .header("Prefer", "count=exact")
            .header("Range-Unit", "items")
            .header("Range", "0-0")
            .send()
            .await
            .with_context(|| {
                format!("Failed to count rows in destination table '{}'", table.name)
            })?;
        let response = error_for_status(response, &format!("Counting '{}'", table.name)).await?;

        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Destination did not report a row count for '{}'",
                    table.name
                )
            })
    }

    async fn clear_table(&self, table: &TableDescriptor) -> Result<()> {
        let url = self.endpoint(&table.name)?;
        let filter_column = table
            .conflict_key
            .first()
            .ok_or_else(|| anyhow::anyhow!("Table '{}' has no conflict key", table.name))?;

        let response = self
            .client()?
            .delete(&url)
            .query(&[(filter_column.as_str(), "not.is.null")])
            .header("Prefer", "return=minimal")
            .send()
            .await
            .with_context(|| format!("Failed to clear destination table '{}'", table.name))?;
        error_for_status(response, &format!("Clearing '{}'", table.name)).await?;

        Ok(())
    }

    fn clear_cascades(&self) -> bool {
        false
    }

    async fn upsert_many(
        &self,
        table: &TableDescriptor,
        records: &[Record],
    ) -> Result<Option<u64>> {
        if records.is_empty() {
            return Ok(Some(0));
        }
        let url = self.endpoint(&table.name)?;
        let on_conflict = table.conflict_key.join(",");

        let response = self
            .client()?
            .post(&url)
            .query(&[("on_conflict", on_conflict.as_str())])
            .header("Prefer", UPSERT_PREFER)
            .json(&records_to_json_array(records))
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to send {} rows to destination table '{}'",
                    records.len(),
                    table.name
                )
            })?;
        let response = error_for_status(
            response,
            &format!("Upserting {} rows into '{}'", records.len(), table.name),
        )
        .await?;

        Ok(response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_span))
    }

    async fn upsert_one(&self, table: &TableDescriptor, record: &Record) -> Result<()> {
        self.upsert_many(table, std::slice::from_ref(record))
            .await
            .with_context(|| {
                format!(
                    "Failed to upsert {} into '{}'",
                    record.identity(&table.conflict_key),
                    table.name
                )
            })?;
        Ok(())
    }

    fn is_table_unavailable(&self, error: &anyhow::Error) -> bool {
        error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<ApiError>())
            .any(|e| {
                matches!(
                    e.status,
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
                )
            })
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            tracing::debug!("Closed destination API client");
        }
    }
}
