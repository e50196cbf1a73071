//! Thin HTTP transport over reqwest.
//!
//! Keep-alive pooled connections, gzip/deflate, per-request timeout, and
//! body decoding by content type. Non-2xx statuses and transport faults
//! both surface as [`HttpError`]; transport faults carry status 0 so the
//! retry layer can treat them uniformly.

use chrono::Utc;
use ingest_core::retry::parse_retry_after;
use reqwest::RequestBuilder;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const ERROR_BODY_SNIPPET: usize = 200;

#[derive(Debug, Error)]
#[error("{method} {url}: status {status}: {detail}")]
pub struct HttpError {
    /// HTTP status, or 0 for transport-level failures.
    pub status: u16,
    pub method: &'static str,
    pub url: String,
    /// Pacing hint parsed from `Retry-After`, when the server sent one.
    pub retry_after: Option<Duration>,
    pub detail: String,
}

impl HttpError {
    fn transport(method: &'static str, url: &str, err: &reqwest::Error) -> Self {
        HttpError {
            status: 0,
            method,
            url: url.to_owned(),
            retry_after: None,
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration, pool_width: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_width)
            .tcp_keepalive(TCP_KEEPALIVE)
            .gzip(true)
            .deflate(true)
            .timeout(timeout)
            .build()?;
        Ok(HttpClient { client })
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        self.execute(self.client.get(url), "GET", url, headers).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        self.execute(self.client.post(url).json(body), "POST", url, headers)
            .await
    }

    pub async fn post_text(
        &self,
        url: &str,
        body: String,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(body);
        self.execute(request, "POST", url, headers).await
    }

    async fn execute(
        &self,
        mut request: RequestBuilder,
        method: &'static str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, HttpError> {
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| HttpError::transport(method, url, &e))?;
        let status = response.status().as_u16();
        let response_headers = response.headers().clone();

        if !(200..300).contains(&status) {
            let retry_after = response_headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError {
                status,
                method,
                url: url.to_owned(),
                retry_after,
                detail: snippet(&body),
            });
        }

        let is_json = response_headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let body = if is_json {
            let value = response
                .json::<Value>()
                .await
                .map_err(|e| HttpError::transport(method, url, &e))?;
            ResponseBody::Json(value)
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| HttpError::transport(method, url, &e))?;
            ResponseBody::Text(text)
        };

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

fn snippet(body: &str) -> String {
    if body.len() <= ERROR_BODY_SNIPPET {
        body.to_owned()
    } else {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < ERROR_BODY_SNIPPET)
            .last()
            .map_or(0, |(i, c)| i + c.len_utf8());
        format!("{}…", &body[..cut])
    }
}
