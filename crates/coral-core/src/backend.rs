//! Hosted-backend request helpers.
//!
//! The CRM's data lives behind a hosted backend-as-a-service exposing
//! table-shaped REST endpoints. [`BackendClient`] layers those HTTP semantics
//! on top of the transport seam: a non-2xx response becomes an [`ApiError`]
//! carrying the status (and the backend's error code/details when the body
//! parses), so retry classification can inspect it.
//!
//! [`BackendResponse`] models the backend SDK's `{data, error}` call shape
//! for collaborators that never throw; `retry::execute_backend_call` consumes
//! it.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ApiError, ValidationError};
use crate::http::{HttpAuth, HttpClient, HttpRequest, HttpResponse};

/// Path prefix for table endpoints on the hosted backend.
const TABLE_ENDPOINT_PREFIX: &str = "rest/v1";

/// Error object carried in a backend response body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendErrorBody {
    pub code: Option<String>,
    pub message: String,
    pub details: Option<String>,
}

impl BackendErrorBody {
    pub fn into_api_error(self) -> ApiError {
        let mut error = ApiError::backend(self.message);
        if let Some(code) = self.code {
            error = error.with_code(code);
        }
        if let Some(details) = self.details {
            error = error.with_details(details);
        }
        error
    }
}

/// The `{data, error}` call shape of the hosted backend's client SDK.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendResponse<T> {
    pub data: Option<T>,
    pub error: Option<BackendErrorBody>,
}

impl<T> BackendResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(BackendErrorBody {
                code: None,
                message: message.into(),
                details: None,
            }),
        }
    }
}

/// Narrow request-execution surface over the hosted backend's table REST API.
#[derive(Clone)]
pub struct BackendClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    auth: HttpAuth,
    timeout_ms: u64,
}

impl BackendClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        auth: HttpAuth,
    ) -> Result<Self, ValidationError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(ValidationError::EmptyBaseUrl);
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth,
            timeout_ms: 10_000,
        })
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Fetch rows from a table, optionally filtered to `column = value`.
    pub async fn select(
        &self,
        table: &str,
        filter: Option<(&str, &str)>,
    ) -> Result<Value, ApiError> {
        let mut url = self.table_url(table)?;
        if let Some((column, value)) = filter {
            url.push_str(&format!(
                "?{}=eq.{}",
                urlencoding::encode(column),
                urlencoding::encode(value)
            ));
        }

        self.run(HttpRequest::get(url)).await
    }

    /// Insert a row, asking the backend to echo the stored representation.
    pub async fn insert(&self, table: &str, payload: &Value) -> Result<Value, ApiError> {
        let url = self.table_url(table)?;
        self.run(
            HttpRequest::post(url)
                .with_json_body(payload.to_string())
                .with_header("prefer", "return=representation"),
        )
        .await
    }

    /// Update the row whose `id` equals `key`.
    pub async fn update(&self, table: &str, key: &str, payload: &Value) -> Result<Value, ApiError> {
        let url = self.row_url(table, key)?;
        self.run(
            HttpRequest::put(url)
                .with_json_body(payload.to_string())
                .with_header("prefer", "return=representation"),
        )
        .await
    }

    /// Delete the row whose `id` equals `key`.
    pub async fn delete(&self, table: &str, key: &str) -> Result<Value, ApiError> {
        let url = self.row_url(table, key)?;
        self.run(HttpRequest::delete(url)).await
    }

    fn table_url(&self, table: &str) -> Result<String, ApiError> {
        if table.trim().is_empty() {
            return Err(ApiError::internal(ValidationError::EmptyTableName.to_string()));
        }

        Ok(format!(
            "{}/{}/{}",
            self.base_url,
            TABLE_ENDPOINT_PREFIX,
            urlencoding::encode(table)
        ))
    }

    fn row_url(&self, table: &str, key: &str) -> Result<String, ApiError> {
        let mut url = self.table_url(table)?;
        url.push_str(&format!("?id=eq.{}", urlencoding::encode(key)));
        Ok(url)
    }

    async fn run(&self, request: HttpRequest) -> Result<Value, ApiError> {
        let request = request.with_auth(&self.auth).with_timeout_ms(self.timeout_ms);
        let response = self.http.execute(request).await.map_err(ApiError::from)?;

        if !response.is_success() {
            return Err(error_from_response(&response));
        }

        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&response.body)
            .map_err(|e| ApiError::internal(format!("malformed backend response body: {e}")))
    }
}

fn error_from_response(response: &HttpResponse) -> ApiError {
    match serde_json::from_str::<BackendErrorBody>(&response.body) {
        Ok(body) => {
            let mut error = ApiError::http(response.status, body.message);
            if let Some(code) = body.code {
                error = error.with_code(code);
            }
            if let Some(details) = body.details {
                error = error.with_details(details);
            }
            error
        }
        Err(_) => ApiError::http(
            response.status,
            format!("backend returned status {}", response.status),
        ),
    }
}
