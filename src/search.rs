// Search dispatcher - writes documents into a tenant's index
//
// DESIGN: One document per request, addressed by {index}/{type}:
//   POST {url}/{index}/{type}
//   {"message":"...","datetime":"2025-12-03T14:23:45Z"}
// Any non-2xx status, transport error or timeout is a failure; the caller
// decides what to do with the message.

use crate::document::Document;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait SearchEngine: Send + Sync {
    async fn create(&self, index: &str, doc_type: &str, document: &Document) -> Result<()>;
}

pub struct ElasticsearchClient {
    client: reqwest::Client,
    url: String,
}

impl ElasticsearchClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SearchEngine for ElasticsearchClient {
    async fn create(&self, index: &str, doc_type: &str, document: &Document) -> Result<()> {
        let target = format!("{}/{}/{}", self.url, index, doc_type);
        let response = self.client.post(&target).json(document).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            anyhow::bail!("Elasticsearch HTTP {} from {}: {}", status, target, body);
        }

        tracing::debug!(index, doc_type, status = %response.status(), "document created");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::document::build_document;
    use chrono::{TimeZone, Utc};
    use mockito::{Matcher, Server};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Keeps created documents in memory; can be switched to failing
    #[derive(Default)]
    pub(crate) struct FakeSearchEngine {
        pub created: Mutex<Vec<(String, String, Document)>>,
        pub fail: AtomicBool,
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl SearchEngine for FakeSearchEngine {
        async fn create(&self, index: &str, doc_type: &str, document: &Document) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("Elasticsearch HTTP 500 Internal Server Error");
            }
            self.created.lock().unwrap().push((
                index.to_string(),
                doc_type.to_string(),
                document.clone(),
            ));
            Ok(())
        }
    }

    fn client(url: &str) -> ElasticsearchClient {
        ElasticsearchClient::new(url, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_posts_to_index_and_type() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant1/app")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "message": "Hello world",
                "datetime": "2025-12-03T14:23:45Z"
            })))
            .with_status(201)
            .with_body(r#"{"_id":"1","created":true}"#)
            .create_async()
            .await;

        let now = Utc.with_ymd_and_hms(2025, 12, 3, 14, 23, 45).unwrap();
        let doc = build_document("Hello world", now);
        client(&server.url())
            .create("tenant1", "app", &doc)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_fails() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/tenant1/app")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let doc = build_document("x", Utc::now());
        let err = client(&server.url())
            .create("tenant1", "app", &doc)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_trailing_slash_in_url() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant1/app")
            .with_status(200)
            .create_async()
            .await;

        let doc = build_document("x", Utc::now());
        client(&format!("{}/", server.url()))
            .create("tenant1", "app", &doc)
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
