//! HTTP 推送适配器
//!
//! 把推送请求以 JSON POST 到配置的端点，按用户ID展开设备的工作
//! 由端点侧完成。

use std::time::Duration;

use application::{PushError, PushRequest, PushSender};
use async_trait::async_trait;

/// 通过 HTTP 端点投递推送
pub struct HttpPushSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushSender {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| PushError::failed(format!("build http client: {}", error)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PushSender for HttpPushSender {
    async fn send(&self, request: PushRequest) -> Result<(), PushError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|error| PushError::failed(error.to_string()))?;

        if !response.status().is_success() {
            return Err(PushError::failed(format!(
                "push endpoint returned {}",
                response.status()
            )));
        }

        tracing::debug!(recipients = request.user_ids.len(), "push delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use domain::UserId;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn sample_request() -> PushRequest {
        PushRequest {
            title: "Alice".to_string(),
            message: "hello there".to_string(),
            user_ids: vec![UserId::from(Uuid::new_v4())],
            url: "/conversations/42".to_string(),
        }
    }

    #[tokio::test]
    async fn posts_request_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push"))
            .and(body_partial_json(serde_json::json!({
                "title": "Alice",
                "message": "hello there",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = HttpPushSender::new(format!("{}/push", server.uri()), Duration::from_secs(2))
            .expect("build sender");
        sender
            .send(sample_request())
            .await
            .expect("push should succeed");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender =
            HttpPushSender::new(server.uri(), Duration::from_secs(2)).expect("build sender");
        let result = sender.send(sample_request()).await;
        assert!(result.is_err());
    }
}
