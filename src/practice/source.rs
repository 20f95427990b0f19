use super::{PracticeError, PracticeResult, QuestionSet};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Read-only access to question sets
#[async_trait]
pub trait QuestionSource: Send + Sync {
    async fn fetch(&self, id: &str) -> PracticeResult<QuestionSet>;
}

/// Fetches `GET {base_url}/question-sets/{id}`
pub struct HttpQuestionSource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpQuestionSource {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl QuestionSource for HttpQuestionSource {
    async fn fetch(&self, id: &str) -> PracticeResult<QuestionSet> {
        let url = format!(
            "{}/question-sets/{}",
            self.base_url,
            urlencoding::encode(id)
        );

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PracticeError::Fetch(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(PracticeError::NotFound(id.to_string())),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(PracticeError::Fetch(format!("{}: {}", status, body)))
            }
            _ => {
                let set: QuestionSet = response
                    .json()
                    .await
                    .map_err(|e| PracticeError::Fetch(e.to_string()))?;
                tracing::debug!("Fetched question set {} ({} questions)", set.id, set.questions.len());
                Ok(set)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_question_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/question-sets/qs-7"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "qs-7",
                "title": "System design",
                "time_limit": 900,
                "questions": ["Design a chat service"]
            })))
            .mount(&server)
            .await;

        let source = HttpQuestionSource::new(&server.uri(), Some("secret".into()));
        let set = source.fetch("qs-7").await.unwrap();

        assert_eq!(set.title, "System design");
        assert_eq!(set.time_limit(), Some(Duration::from_secs(900)));
        assert_eq!(set.questions.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_missing_set() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = HttpQuestionSource::new(&server.uri(), None);
        assert_matches!(source.fetch("nope").await, Err(PracticeError::NotFound(id)) if id == "nope");
    }
}
