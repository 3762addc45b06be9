//! The `api_request` tool: an outbound HTTP call against a project-scoped
//! data source.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::error::{AppError, AppResult};

use super::registry::{DataSourceRequirement, SideEffectClass, Tool, ToolExecutionContext};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH"];

#[derive(Debug)]
pub struct ApiRequestTool {
    http: Client,
}

impl ApiRequestTool {
    pub fn new() -> Self {
        Self { http: Client::new() }
    }
}

impl Default for ApiRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the final URL: an input beginning with `/` is a path joined
/// against the data source's configured base URL; anything else is taken
/// as absolute.
fn compose_url(input: &str, base_url: Option<&str>) -> AppResult<String> {
    if let (true, Some(base)) = (input.starts_with('/'), base_url) {
        Ok(format!("{}{}", base.trim_end_matches('/'), input))
    } else if input.starts_with("http://") || input.starts_with("https://") {
        Ok(input.to_string())
    } else {
        Err(AppError::ToolValidationFailed(format!(
            "url '{input}' is neither absolute nor a path against a configured base URL"
        )))
    }
}

#[async_trait]
impl Tool for ApiRequestTool {
    fn name(&self) -> &str {
        "api_request"
    }

    fn side_effect_class(&self) -> SideEffectClass {
        SideEffectClass::Mutate
    }

    fn data_source_requirement(&self) -> DataSourceRequirement {
        DataSourceRequirement::Http
    }

    fn description(&self) -> &str {
        "Issue an HTTP request against a project-scoped API data source."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "datasource_id": {"type": "string"},
                "method": {"type": "string", "enum": ALLOWED_METHODS},
                "url": {"type": "string"},
                "headers": {"type": "object"},
                "body": {"type": "string"},
                "timeout_seconds": {"type": "integer"},
            },
            "required": ["method", "url"],
        })
    }

    fn validate(&self, args: &Value) -> AppResult<()> {
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ToolValidationFailed("missing required field 'method'".into()))?;
        if !ALLOWED_METHODS.contains(&method.to_uppercase().as_str()) {
            return Err(AppError::ToolValidationFailed(format!(
                "method '{method}' must be one of {ALLOWED_METHODS:?}"
            )));
        }
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ToolValidationFailed("missing required field 'url'".into()))?;
        if url.trim().is_empty() {
            return Err(AppError::ToolValidationFailed("'url' must not be empty".into()));
        }
        if let Some(headers) = args.get("headers") {
            if !headers.is_object() {
                return Err(AppError::ToolValidationFailed("'headers' must be an object".into()));
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        args: &Value,
        data_source_config: Option<&Value>,
    ) -> AppResult<Value> {
        let method: Method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .parse()
            .map_err(|_| AppError::ToolValidationFailed("invalid HTTP method".into()))?;
        let raw_url = args.get("url").and_then(Value::as_str).unwrap_or_default();

        let base_url = data_source_config
            .and_then(|c| c.get("base_url"))
            .and_then(Value::as_str);
        let url = compose_url(raw_url, base_url)?;

        let mut request = self.http.request(method, &url);

        // Merge headers: configured (data source) first, then per-call
        // overrides.
        if let Some(configured) = data_source_config.and_then(|c| c.get("headers")).and_then(Value::as_object) {
            for (key, value) in configured {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }
        if let Some(per_call) = args.get("headers").and_then(Value::as_object) {
            for (key, value) in per_call {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }

        // Auth: bearer, basic, or api_key(header_name).
        if let Some(auth) = data_source_config.and_then(|c| c.get("auth")) {
            match auth.get("type").and_then(Value::as_str) {
                Some("bearer") => {
                    if let Some(token) = auth.get("token").and_then(Value::as_str) {
                        request = request.bearer_auth(token);
                    }
                }
                Some("basic") => {
                    let username = auth.get("username").and_then(Value::as_str).unwrap_or_default();
                    let password = auth.get("password").and_then(Value::as_str);
                    request = request.basic_auth(username, password);
                }
                Some("api_key") => {
                    let header_name = auth.get("header_name").and_then(Value::as_str).unwrap_or("X-Api-Key");
                    if let Some(value) = auth.get("value").and_then(Value::as_str) {
                        request = request.header(header_name, value);
                    }
                }
                _ => {}
            }
        }

        if let Some(body) = args.get("body").and_then(Value::as_str) {
            request = request.body(body.to_string());
        }

        let timeout = args
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(ctx.timeout);
        request = request.timeout(timeout);

        let response = request
            .send()
            .await
            .map_err(|e| AppError::ToolExecutionFailed(format!("http request failed: {e}")))?;

        let status = response.status().as_u16();
        let body_text = response
            .text()
            .await
            .map_err(|e| AppError::ToolExecutionFailed(format!("failed to read response body: {e}")))?;

        let body_json: Value = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        Ok(serde_json::json!({
            "status": status,
            "body": body_json,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_path_against_base_url() {
        let url = compose_url("/v1/users", Some("https://api.example.com")).unwrap();
        assert_eq!(url, "https://api.example.com/v1/users");
    }

    #[test]
    fn absolute_url_passes_through() {
        let url = compose_url("https://other.example.com/x", Some("https://api.example.com")).unwrap();
        assert_eq!(url, "https://other.example.com/x");
    }

    #[test]
    fn path_without_base_url_is_rejected() {
        assert!(compose_url("/v1/users", None).is_err());
    }

    #[test]
    fn validate_rejects_unknown_method() {
        let tool = ApiRequestTool::new();
        let err = tool
            .validate(&serde_json::json!({"method": "TRACE", "url": "https://x"}))
            .unwrap_err();
        assert_eq!(err.code(), "tool_validation_failed");
    }

    #[test]
    fn validate_accepts_known_method() {
        let tool = ApiRequestTool::new();
        assert!(tool
            .validate(&serde_json::json!({"method": "GET", "url": "https://x"}))
            .is_ok());
    }
}
