//! Client for the external classification service.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::future::Future;
use tabshare_protocol::Cluster;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::error::ClassifyError;
use crate::partition::{ClassificationResponse, TabDescriptor};

/// Most questions returned per cluster.
pub const MAX_QUESTIONS: usize = 3;

/// Semantic grouping and discussion prompts for a tab set.
pub trait Classifier: Send + Sync + 'static {
    fn classify(
        &self,
        tabs: &[TabDescriptor],
    ) -> impl Future<Output = Result<ClassificationResponse, ClassifyError>> + Send;

    fn discussion_questions(
        &self,
        cluster: &Cluster,
    ) -> impl Future<Output = Result<Vec<String>, ClassifyError>> + Send;
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    tabs: &'a [TabDescriptor],
}

#[derive(Serialize)]
struct QuestionTab<'a> {
    title: &'a str,
    url: &'a str,
}

#[derive(Serialize)]
struct QuestionsRequest<'a> {
    cluster: &'a str,
    tabs: Vec<QuestionTab<'a>>,
}

#[derive(Deserialize)]
struct QuestionsResponse {
    #[serde(default)]
    questions: Vec<String>,
}

/// JSON-over-HTTP classifier.
///
/// `classify` posts to `<endpoint>/classify`, `discussion_questions` to
/// `<endpoint>/questions`, both with a bearer credential.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifyError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            endpoint: config
                .endpoint
                .as_ref()
                .map(|e| e.trim_end_matches('/').to_string()),
            api_key: config.api_key.clone(),
        })
    }

    /// Use `key` when the configuration carries none.
    pub fn with_fallback_key(mut self, key: Option<String>) -> Self {
        if self.api_key.is_none() {
            self.api_key = key.filter(|k| !k.trim().is_empty());
        }
        self
    }

    fn target(&self, path: &str) -> Result<(String, &str), ClassifyError> {
        let key = self.api_key.as_deref().ok_or(ClassifyError::MissingCredential)?;
        let endpoint = self.endpoint.as_deref().ok_or(ClassifyError::NotConfigured)?;
        Ok((format!("{endpoint}/{path}"), key))
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ClassifyError> {
        let (url, key) = self.target(path)?;
        debug!(url = %url, "Calling classification service");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClassifyError::Service {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }

        let bytes = resp.bytes().await.map_err(map_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| ClassifyError::Malformed(e.to_string()))
    }
}

fn map_reqwest(err: reqwest::Error) -> ClassifyError {
    if err.is_timeout() {
        ClassifyError::Timeout
    } else {
        ClassifyError::Http(err)
    }
}

impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        tabs: &[TabDescriptor],
    ) -> Result<ClassificationResponse, ClassifyError> {
        self.post("classify", &ClassifyRequest { tabs }).await
    }

    async fn discussion_questions(&self, cluster: &Cluster) -> Result<Vec<String>, ClassifyError> {
        let body = QuestionsRequest {
            cluster: &cluster.name,
            tabs: cluster
                .tabs
                .iter()
                .map(|t| QuestionTab {
                    title: &t.title,
                    url: &t.url,
                })
                .collect(),
        };
        let resp: QuestionsResponse = self.post("questions", &body).await?;
        let questions: Vec<String> = resp
            .questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .take(MAX_QUESTIONS)
            .collect();
        if questions.is_empty() {
            return Err(ClassifyError::Malformed("no questions returned".into()));
        }
        Ok(questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode, header};
    use axum::routing::post;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// A request as the mock service saw it.
    struct Received {
        path: &'static str,
        authorization: Option<String>,
        body: Value,
    }

    /// Serve `reply` with `status` on both service routes and report every
    /// request received.
    async fn mock_service(
        status: StatusCode,
        reply: Value,
    ) -> (String, mpsc::UnboundedReceiver<Received>) {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let route = |path: &'static str| {
            let seen_tx = seen_tx.clone();
            let reply = reply.clone();
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let authorization = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let _ = seen_tx.send(Received {
                    path,
                    authorization,
                    body,
                });
                async move { (status, Json(reply)) }
            })
        };
        let app = Router::new()
            .route("/classify", route("classify"))
            .route("/questions", route("questions"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen_rx)
    }

    fn classifier(endpoint: Option<String>, api_key: Option<&str>) -> HttpClassifier {
        HttpClassifier::new(&ClassifierConfig {
            endpoint,
            api_key: api_key.map(str::to_string),
            timeout: TIMEOUT,
        })
        .unwrap()
    }

    fn descriptors() -> Vec<TabDescriptor> {
        vec![TabDescriptor {
            index: 0,
            title: "Tokio".into(),
            url: "https://tokio.rs/".into(),
        }]
    }

    #[tokio::test]
    async fn test_missing_credential_checked_first() {
        let err = classifier(None, None).classify(&descriptors()).await.unwrap_err();
        assert!(matches!(err, ClassifyError::MissingCredential));
    }

    #[tokio::test]
    async fn test_missing_endpoint() {
        let err = classifier(None, Some("sk")).classify(&descriptors()).await.unwrap_err();
        assert!(matches!(err, ClassifyError::NotConfigured));
    }

    #[tokio::test]
    async fn test_fallback_key_used_when_config_has_none() {
        let c = classifier(None, None).with_fallback_key(Some("from-store".into()));
        let err = c.classify(&descriptors()).await.unwrap_err();
        assert!(matches!(err, ClassifyError::NotConfigured));
    }

    #[tokio::test]
    async fn test_classify_posts_descriptors() {
        let (url, mut seen) = mock_service(
            StatusCode::OK,
            json!({"clusters": [{"name": "Async", "theme": "Runtimes", "tabs": [0]}]}),
        )
        .await;
        let resp = classifier(Some(url), Some("sk")).classify(&descriptors()).await.unwrap();
        assert_eq!(resp.clusters[0].name, "Async");

        let sent = seen.recv().await.unwrap();
        assert_eq!(sent.path, "classify");
        assert_eq!(sent.authorization.as_deref(), Some("Bearer sk"));
        assert_eq!(sent.body["tabs"][0]["url"], "https://tokio.rs/");
        assert_eq!(sent.body["tabs"][0]["index"], 0);
    }

    #[tokio::test]
    async fn test_service_error_surfaces_status() {
        let (url, _seen) =
            mock_service(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "boom"})).await;
        let err = classifier(Some(url), Some("sk")).classify(&descriptors()).await.unwrap_err();
        assert!(matches!(err, ClassifyError::Service { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_questions_truncated_to_three() {
        let (url, mut seen) = mock_service(
            StatusCode::OK,
            json!({"questions": ["a?", "b?", " ", "c?", "d?"]}),
        )
        .await;
        let cluster = Cluster {
            name: "Async".into(),
            theme: String::new(),
            tabs: vec![],
        };
        let qs = classifier(Some(url), Some("sk"))
            .discussion_questions(&cluster)
            .await
            .unwrap();
        assert_eq!(qs, vec!["a?", "b?", "c?"]);
        assert_eq!(seen.recv().await.unwrap().path, "questions");
    }

    #[tokio::test]
    async fn test_empty_questions_rejected() {
        let (url, _seen) = mock_service(StatusCode::OK, json!({"questions": []})).await;
        let cluster = Cluster {
            name: "Async".into(),
            theme: String::new(),
            tabs: vec![],
        };
        let err = classifier(Some(url), Some("sk"))
            .discussion_questions(&cluster)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::Malformed(_)));
    }
}
