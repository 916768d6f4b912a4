use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{check, transport};
use crate::error::ServerError;

/// What the full-name index knows about a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub id: String,
    pub full_name: String,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, entry: &SearchEntry) -> Result<(), ServerError>;

    async fn remove(&self, id: &str) -> Result<(), ServerError>;

    /// External IDs of the best matches for `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ServerError>;
}

pub struct HttpSearchIndex {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSearchIndex {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: String) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct SearchHits {
    hits: Vec<SearchEntry>,
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn upsert(&self, entry: &SearchEntry) -> Result<(), ServerError> {
        let response = self
            .http
            .put(format!("{}/users/{}", self.base_url, entry.id))
            .bearer_auth(&self.api_key)
            .json(entry)
            .send()
            .await
            .map_err(transport("search"))?;
        check("search", response).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ServerError> {
        let response = self
            .http
            .delete(format!("{}/users/{}", self.base_url, id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport("search"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check("search", response).await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ServerError> {
        let limit = limit.to_string();
        let response = self
            .http
            .get(format!("{}/users/search", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("q", query), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(transport("search"))?;
        let hits: SearchHits = check("search", response)
            .await?
            .json()
            .await
            .map_err(transport("search"))?;
        Ok(hits.hits.into_iter().map(|h| h.id).collect())
    }
}

/// In-process index: every word of the query must prefix a word of the name.
#[derive(Default)]
pub struct MemorySearchIndex {
    entries: RwLock<HashMap<String, String>>,
}

impl MemorySearchIndex {
    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn upsert(&self, entry: &SearchEntry) -> Result<(), ServerError> {
        self.entries
            .write()
            .await
            .insert(entry.id.clone(), entry.full_name.to_lowercase());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ServerError> {
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ServerError> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries
            .iter()
            .filter(|(_, name)| {
                terms
                    .iter()
                    .all(|t| name.split_whitespace().any(|w| w.starts_with(t.as_str())))
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_search_prefix_match() {
        let index = MemorySearchIndex::default();
        index
            .upsert(&SearchEntry {
                id: "a".into(),
                full_name: "Ada Lovelace".into(),
            })
            .await
            .unwrap();
        index
            .upsert(&SearchEntry {
                id: "b".into(),
                full_name: "Alan Turing".into(),
            })
            .await
            .unwrap();

        assert_eq!(index.search("lov", 10).await.unwrap(), vec!["a"]);
        assert_eq!(index.search("a", 10).await.unwrap(), vec!["a", "b"]);
        assert!(index.search("", 10).await.unwrap().is_empty());

        index.remove("a").await.unwrap();
        assert!(!index.contains("a").await);
    }
}
