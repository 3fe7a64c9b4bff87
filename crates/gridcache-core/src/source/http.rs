//! HTTP record source.
//!
//! Talks to a tabular data service exposing
//! `GET {base}/{resource}?page=&pageSize=&search=&filter[col]=value`
//! (answering `{"rows": [...], "totalCount": n}`) and
//! `GET {base}/{resource}/summary` (answering `{"metric": number, ...}`).
//!
//! Retries are not done here: the query cache retries failed fetches with
//! its own backoff policy.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{validate_rows, Page, PageRequest, RecordSource, Row, Summary};
use crate::error::SourceError;

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageResponse<R> {
    rows: Vec<R>,
    total_count: usize,
}

/// Record source backed by a remote service.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
pub struct HttpRecordSource<R> {
    client: Client,
    base_url: String,
    token: Option<Arc<String>>,
    _row: PhantomData<fn() -> R>,
}

impl<R> Clone for HttpRecordSource<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            _row: PhantomData,
        }
    }
}

impl<R> HttpRecordSource<R> {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            _row: PhantomData,
        })
    }

    /// Create a source with the given bearer token, sharing the connection pool.
    pub fn with_token(&self, token: impl Into<Arc<String>>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token.into()),
            _row: PhantomData,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, SourceError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SourceError::InvalidResponse(format!("Invalid token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, SourceError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::from_status(status, &body))
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .query(query)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            SourceError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }
}

/// Query string for a page request
fn page_query(request: &PageRequest) -> Vec<(String, String)> {
    let mut query = vec![
        ("page".to_string(), request.page_index.to_string()),
        ("pageSize".to_string(), request.page_size.to_string()),
    ];
    if let Some(ref search) = request.search {
        query.push(("search".to_string(), search.clone()));
    }
    for (column, value) in request.filters.iter() {
        query.push((format!("filter[{}]", column), value.to_string()));
    }
    query
}

fn into_page<R: Row>(
    request: &PageRequest,
    response: PageResponse<R>,
) -> Result<Page<R>, SourceError> {
    validate_rows(&request.resource, &response.rows)?;
    Ok(Page {
        rows: response.rows,
        total_count: response.total_count,
        page_index: request.page_index,
    })
}

impl<R: Row + DeserializeOwned> RecordSource for HttpRecordSource<R> {
    type Row = R;

    async fn fetch_page(&self, request: PageRequest) -> Result<Page<R>, SourceError> {
        let url = format!("{}/{}", self.base_url, request.resource);
        let response: PageResponse<R> = self.get(&url, &page_query(&request)).await?;
        debug!(
            resource = %request.resource,
            page = request.page_index,
            rows = response.rows.len(),
            total = response.total_count,
            "Page fetched"
        );
        into_page(&request, response)
    }

    async fn fetch_summary(&self, resource: &str) -> Result<Summary, SourceError> {
        let url = format!("{}/{}/summary", self.base_url, resource);
        let summary: Summary = self.get(&url, &[]).await?;
        debug!(resource = %resource, metrics = summary.len(), "Summary fetched");
        Ok(summary)
    }
}
