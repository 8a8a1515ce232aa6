use async_trait::async_trait;
use flowcore::{task_types, TaskContext, TaskError, TaskExecutor, TaskOutcome, TaskResult};
use reqwest::Method;
use serde_json::Value;

/// HTTP request task
///
/// `url`, `method`, `headers` and `body` come from the resolved input when
/// mapped, otherwise from the step config. The parsed response body is the
/// step output; non-2xx responses are unsuccessful results.
pub struct HttpTask {
    client: reqwest::Client,
}

impl HttpTask {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTask {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpTask {
    fn task_type(&self) -> &str {
        task_types::HTTP
    }

    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        let url = ctx
            .input_str("url")
            .or(ctx.config.url.as_deref())
            .ok_or_else(|| TaskError::MissingInput("url".to_string()))?;

        let method_name = ctx
            .input_str("method")
            .or(ctx.config.method.as_deref())
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| TaskError::Configuration(format!("Unsupported method: {}", method_name)))?;

        tracing::info!(step_id = %ctx.step_id, "{} {}", method, url);

        let mut request = self.client.request(method.clone(), url);

        for (key, value) in &ctx.config.headers {
            request = request.header(key, value);
        }
        if let Some(Value::Object(headers)) = ctx.input.get("headers") {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str() {
                    request = request.header(key, val_str);
                }
            }
        }

        let body = ctx.input.get("body").or(ctx.config.body.as_ref());
        if let Some(body) = body.filter(|_| method != Method::GET && method != Method::HEAD) {
            request = match body {
                Value::String(text) => request.body(text.clone()),
                json => request.json(json),
            };
        }

        let response = request
            .send()
            .await
            .map_err(|e| TaskError::Http(e.to_string()))?;

        let status = response.status();
        let body_text = response
            .text()
            .await
            .map_err(|e| TaskError::Http(format!("Failed to read response: {}", e)))?;

        tracing::info!(step_id = %ctx.step_id, status = status.as_u16(), "Response received");

        let output = if body_text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text))
        };

        Ok(TaskOutcome::Finished(TaskResult {
            success: status.is_success(),
            output,
        }))
    }

    fn description(&self) -> &str {
        "Make HTTP requests"
    }
}
