use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use convo_store::Link;
use regex::Regex;

use super::{check, transport};
use crate::error::ServerError;

const MAX_PAGE_BYTES: usize = 512 * 1024;

#[async_trait]
pub trait LinkPreviewer: Send + Sync {
    /// OpenGraph summary of `url`, or `None` when the page has nothing usable.
    async fn preview(&self, url: &str) -> Result<Option<Link>, ServerError>;
}

/// Fetches the page and reads its `og:` meta tags, falling back to `<title>`.
pub struct HttpLinkPreviewer {
    http: reqwest::Client,
}

impl HttpLinkPreviewer {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl LinkPreviewer for HttpLinkPreviewer {
    async fn preview(&self, url: &str) -> Result<Option<Link>, ServerError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "text/html")
            .send()
            .await
            .map_err(transport("link preview"))?;
        let response = check("link preview", response).await?;
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(false);
        if !is_html {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(transport("link preview"))?;
        let page = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_PAGE_BYTES)]);
        Ok(parse_open_graph(url, &page))
    }
}

fn meta_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<meta\s[^>]*>").expect("valid regex"))
}

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)([a-z][a-z:_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
    })
}

fn title_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"))
}

pub fn parse_open_graph(url: &str, page: &str) -> Option<Link> {
    let mut og: HashMap<String, String> = HashMap::new();
    for tag in meta_regex().find_iter(page) {
        let mut key = None;
        let mut content = None;
        for cap in attr_regex().captures_iter(tag.as_str()) {
            let name = cap[1].to_ascii_lowercase();
            let value = cap.get(2).or_else(|| cap.get(3)).map(|m| m.as_str());
            match (name.as_str(), value) {
                ("property" | "name", Some(v)) => key = Some(v.to_ascii_lowercase()),
                ("content", Some(v)) => content = Some(decode_entities(v.trim())),
                _ => {}
            }
        }
        if let (Some(key), Some(content)) = (key, content) {
            if let Some(field) = key.strip_prefix("og:") {
                og.entry(field.to_string()).or_insert(content);
            }
        }
    }

    let title = og.remove("title").or_else(|| {
        title_regex()
            .captures(page)
            .map(|c| decode_entities(c[1].trim()))
    });
    let link = Link {
        url: url.to_string(),
        title: title.unwrap_or_default(),
        description: og.remove("description").unwrap_or_default(),
        image: og.remove("image").unwrap_or_default(),
    };
    if link.title.is_empty() && link.description.is_empty() && link.image.is_empty() {
        None
    } else {
        Some(link)
    }
}

fn decode_entities(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Fixed previews keyed by URL.
#[derive(Default)]
pub struct StaticLinkPreviewer {
    links: HashMap<String, Link>,
}

impl StaticLinkPreviewer {
    pub fn with(mut self, link: Link) -> Self {
        self.links.insert(link.url.clone(), link);
        self
    }
}

#[async_trait]
impl LinkPreviewer for StaticLinkPreviewer {
    async fn preview(&self, url: &str) -> Result<Option<Link>, ServerError> {
        Ok(self.links.get(url).cloned())
    }
}
