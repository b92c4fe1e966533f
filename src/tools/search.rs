//! Web 搜索工具：DuckDuckGo HTML 端点
//!
//! GET 请求带超时与 User-Agent；结果经 html2text 提取可读文本，超过 max_result_chars 截断。

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config::HttpSection;
use crate::tools::http::{html_to_text, truncate_chars};
use crate::tools::Tool;

const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// web_search 工具：关键词搜索，返回可读文本结果
pub struct WebSearchTool {
    client: Client,
    max_result_chars: usize,
}

impl WebSearchTool {
    pub fn new(cfg: &HttpSection) -> Self {
        const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_result_chars: cfg.max_result_chars,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for a query. Args: {\"query\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search keywords" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("").trim();
        if query.is_empty() {
            return Err("Missing query".to_string());
        }
        tracing::info!(query = %query, "web_search tool execute");

        let resp = self
            .client
            .get(SEARCH_ENDPOINT)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| format!("Search request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let html = resp
            .text()
            .await
            .map_err(|e| format!("Body read failed: {}", e))?;
        let text = html_to_text(&html);
        if text.trim().is_empty() {
            return Err("Empty search result".to_string());
        }
        Ok(truncate_chars(&text, self.max_result_chars))
    }
}
