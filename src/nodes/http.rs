use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::engine::registry::{HandlerContext, HandlerResult, NodeHandler};
use crate::error::EngineResult;

/// Outbound HTTP webhook call. Parameters: `url` (required), `method`
/// (default POST), optional `headers` object and JSON `body`.
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl HttpRequestHandler {
    pub fn new() -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeHandler for HttpRequestHandler {
    fn validate(&self, parameters: &Value) -> Result<(), String> {
        match parameters.get("url").and_then(Value::as_str) {
            Some(url) if !url.is_empty() => Ok(()),
            _ => Err("missing 'url' parameter".to_string()),
        }
    }

    async fn execute(
        &self,
        parameters: &Value,
        _ctx: &HandlerContext,
    ) -> EngineResult<HandlerResult> {
        let url = parameters["url"].as_str().unwrap_or_default();
        let method = parameters
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST");

        let mut request = match method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            other => {
                return Ok(HandlerResult::failure(format!(
                    "unsupported HTTP method '{other}'"
                )))
            }
        };

        if let Some(headers) = parameters.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(key, v);
                }
            }
        }

        if let Some(body) = parameters.get("body") {
            if !body.is_null() {
                request = request.json(body);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: Value =
            serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.clone()));

        if status.is_success() {
            Ok(HandlerResult::success(Some(json!({
                "statusCode": status.as_u16(),
                "body": body,
            }))))
        } else {
            Ok(HandlerResult::failure(format!(
                "webhook returned {}",
                status.as_u16()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> HandlerContext {
        HandlerContext {
            workflow_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            node_id: "http-1".into(),
            user_id: Uuid::new_v4(),
            action: String::new(),
            is_test: false,
        }
    }

    #[test]
    fn validate_requires_url() {
        let handler = HttpRequestHandler::new().expect("client");
        assert!(handler.validate(&json!({})).is_err());
        assert!(handler.validate(&json!({"url": ""})).is_err());
        assert!(handler
            .validate(&json!({"url": "http://example.com"}))
            .is_ok());
    }

    #[tokio::test]
    async fn posts_body_and_returns_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let handler = HttpRequestHandler::new().expect("client");
        let params = json!({
            "url": format!("{}/hook", server.uri()),
            "body": {"name": "Ann"},
        });

        let result = handler.execute(&params, &ctx()).await.expect("execute");
        assert!(result.success);
        let data = result.data.expect("data");
        assert_eq!(data["statusCode"], 200);
        assert_eq!(data["body"]["ok"], true);
    }

    #[tokio::test]
    async fn server_error_is_a_failure_result_not_an_engine_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let handler = HttpRequestHandler::new().expect("client");
        let params = json!({"url": server.uri()});

        let result = handler.execute(&params, &ctx()).await.expect("execute");
        assert!(!result.success);
        assert!(result.error.expect("error").contains("500"));
    }

    #[tokio::test]
    async fn unsupported_method_fails_cleanly() {
        let handler = HttpRequestHandler::new().expect("client");
        let params = json!({"url": "http://localhost", "method": "PATCH"});
        let result = handler.execute(&params, &ctx()).await.expect("execute");
        assert!(!result.success);
    }
}
