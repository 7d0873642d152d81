// User directory - finds the tenant owning an api key
//
// DESIGN: Tenants live in a users index in Elasticsearch. A lookup is a
// term query on "apiKey". A tenant's index name is its api key.
//
// Result shape matters for failure routing:
//   Err(_)      -> the query itself failed (transient, retried later)
//   Ok(None)    -> no such tenant (permanent, dropped)
//   Ok(Some(i)) -> index name to write into

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_index_by_api_key(&self, api_key: &str) -> Result<Option<String>>;
}

pub struct ElasticDirectory {
    client: reqwest::Client,
    url: String,
    users_index: String,
}

impl ElasticDirectory {
    pub fn new(url: &str, users_index: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            users_index,
        })
    }

    fn search_query(api_key: &str) -> Value {
        json!({
            "query": {
                "bool": {
                    "must": {
                        "term": { "apiKey": { "value": api_key } }
                    }
                }
            }
        })
    }

    /// Pull the tenant's index name out of a search response.
    /// Hits without an apiKey in _source are treated as no match.
    fn index_from_response(response: &Value) -> Option<String> {
        response
            .pointer("/hits/hits/0/_source/apiKey")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[async_trait]
impl UserDirectory for ElasticDirectory {
    async fn find_index_by_api_key(&self, api_key: &str) -> Result<Option<String>> {
        let search_url = format!("{}/{}/user/_search", self.url, self.users_index);
        let response = self
            .client
            .post(&search_url)
            .json(&Self::search_query(api_key))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            anyhow::bail!("Elasticsearch HTTP {} from {}: {}", status, search_url, body);
        }

        let body: Value = response.json().await?;
        Ok(Self::index_from_response(&body))
    }
}
