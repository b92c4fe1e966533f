//! HTTP 工具：GET/POST 请求，超时与结果大小限制
//!
//! 响应超过 max_result_chars 时截断并追加 ...[truncated]；HTML 响应用 html2text 提取可读文本。

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use serde_json::Value;

use crate::config::HttpSection;
use crate::tools::Tool;

/// 简易去除 HTML 标签（html2text 失败时的回退）
pub(crate) fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut prev_whitespace = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => {
                let is_whitespace = c.is_whitespace();
                if is_whitespace && prev_whitespace {
                    continue;
                }
                prev_whitespace = is_whitespace;
                out.push(if is_whitespace { ' ' } else { c });
            }
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// 判断内容是否像 HTML（需提取可读文本）
pub(crate) fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20
            && s.contains('<')
            && (s.contains("</") || s.contains("<meta") || s.contains("<head") || s.contains("<title")))
}

/// 将 HTML 转为可读文本（去除 script/style 等）
pub(crate) fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

/// 按字符数截断并标注
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let head: String = s.chars().take(max_chars).collect();
    format!("{}...[truncated]", head)
}

/// http_request 工具：GET 或 POST（JSON body），可选域名白名单
pub struct HttpTool {
    client: Client,
    max_result_chars: usize,
    /// 空表示不限制；否则主机名须后缀匹配其中之一
    allowed_domains: Vec<String>,
}

impl HttpTool {
    pub fn new(cfg: &HttpSection) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .user_agent("hornet-agent/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_result_chars: cfg.max_result_chars,
            allowed_domains: cfg.allowed_domains.clone(),
        }
    }

    fn check_domain(&self, url: &str) -> Result<(), String> {
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let host = reqwest::Url::parse(url)
            .map_err(|e| format!("Invalid url: {}", e))?
            .host_str()
            .map(|h| h.to_lowercase())
            .ok_or_else(|| "Invalid url: no host".to_string())?;
        let allowed = self.allowed_domains.iter().any(|d| {
            let d = d.to_lowercase();
            host == d || host.ends_with(&format!(".{}", d))
        });
        if allowed {
            Ok(())
        } else {
            Err(format!(
                "Domain '{}' not allowed. Allowed domains: {}",
                host,
                self.allowed_domains.join(", ")
            ))
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP request. Args: {\"url\": \"...\", \"method\": \"GET|POST\", \"body\": {...}}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "enum": ["GET", "POST"], "default": "GET" },
                "body": { "type": "object", "description": "JSON body for POST" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        if url.is_empty() {
            return Err("Missing url".to_string());
        }
        self.check_domain(url)?;
        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        tracing::info!(url = %url, method = %method, "http tool execute");

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let body = args.get("body").cloned().unwrap_or(Value::Null);
                self.client.post(url).json(&body)
            }
            other => return Err(format!("Unsupported method: {}", other)),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| format!("Body read failed: {}", e))?;
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, truncate_chars(&text, 500)));
        }

        let readable = if looks_like_html(&text) {
            html_to_text(&text)
        } else {
            text
        };
        Ok(truncate_chars(&readable, self.max_result_chars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_marks_overflow() {
        let long = "x".repeat(100);
        let out = truncate_chars(&long, 10);
        assert!(out.ends_with("...[truncated]"));
        assert!(out.starts_with("xxxxxxxxxx"));
    }

    #[test]
    fn test_strip_html_tags() {
        let out = strip_html_tags("<p>hello <b>world</b></p>");
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("<!DOCTYPE html><html><head></head></html>"));
        assert!(!looks_like_html("{\"json\": true}"));
    }

    #[test]
    fn test_domain_allowlist_suffix_match() {
        let tool = HttpTool::new(&HttpSection {
            timeout_secs: 5,
            max_result_chars: 1000,
            allowed_domains: vec!["example.com".to_string()],
        });
        assert!(tool.check_domain("https://example.com/page").is_ok());
        assert!(tool.check_domain("https://api.example.com/v1").is_ok());
        assert!(tool.check_domain("https://evil-example.com/").is_err());
        assert!(tool.check_domain("https://other.org/").is_err());
    }
}
