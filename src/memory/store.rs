//! 三层记忆：工作（有界）/ 情景（有界）/ 语义（无界，按 id 索引）
//!
//! 工作记忆逐出时，重要度高于阈值的条目降级写入情景记忆而非丢弃；情景记忆满了无条件丢最旧；
//! 语义记忆只通过 consolidate 升格或显式写入产生，永不由逐出产生。
//! 语义检索优先用嵌入向量（余弦相似度），无嵌入时退化为关键词重叠。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::MemorySection;
use crate::llm::LlmClient;

/// 记忆层级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Working,
    Episodic,
    Semantic,
}

/// 单条记忆
#[derive(Clone, Debug, Serialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub metadata: serde_json::Value,
    /// 重要度 0-1，决定逐出降级与 consolidate 升格
    pub importance: f64,
    pub timestamp: DateTime<Utc>,
}

impl MemoryEntry {
    fn new(kind: MemoryKind, content: String, importance: f64, metadata: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content,
            embedding: None,
            metadata,
            importance: importance.clamp(0.0, 1.0),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Tiers {
    working: VecDeque<MemoryEntry>,
    episodic: VecDeque<MemoryEntry>,
    semantic: HashMap<Uuid, MemoryEntry>,
}

/// 记忆存储：内部 Mutex，可被 Orchestrator 与观察者共享（Arc）
pub struct MemoryStore {
    tiers: Mutex<Tiers>,
    cfg: MemorySection,
    /// 嵌入能力（依赖注入；None 时语义检索走关键词匹配）
    embedder: Option<Arc<dyn LlmClient>>,
}

/// 将文本切分为小写词集合，用于关键词重叠评分
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

impl MemoryStore {
    pub fn new(cfg: MemorySection) -> Self {
        Self {
            tiers: Mutex::new(Tiers::default()),
            cfg,
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn LlmClient>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// 写入工作记忆；容量满时逐出最旧条目，重要条目降级到情景记忆
    pub fn add_working(
        &self,
        content: impl Into<String>,
        importance: f64,
        metadata: serde_json::Value,
    ) -> MemoryEntry {
        let entry = MemoryEntry::new(MemoryKind::Working, content.into(), importance, metadata);
        let mut tiers = self.tiers.lock().unwrap();
        tiers.working.push_back(entry.clone());
        while tiers.working.len() > self.cfg.working_capacity {
            if let Some(mut evicted) = tiers.working.pop_front() {
                if evicted.importance > self.cfg.demote_importance_threshold {
                    evicted.kind = MemoryKind::Episodic;
                    Self::push_episodic_bounded(&mut tiers, evicted, self.cfg.episodic_capacity);
                }
            }
        }
        entry
    }

    /// 写入情景记忆；容量满时无条件丢最旧
    pub fn add_episodic(
        &self,
        content: impl Into<String>,
        importance: f64,
        metadata: serde_json::Value,
    ) -> MemoryEntry {
        let entry = MemoryEntry::new(MemoryKind::Episodic, content.into(), importance, metadata);
        let mut tiers = self.tiers.lock().unwrap();
        Self::push_episodic_bounded(&mut tiers, entry.clone(), self.cfg.episodic_capacity);
        entry
    }

    fn push_episodic_bounded(tiers: &mut Tiers, entry: MemoryEntry, capacity: usize) {
        tiers.episodic.push_back(entry);
        while tiers.episodic.len() > capacity {
            tiers.episodic.pop_front();
        }
    }

    /// 显式写入语义记忆（尝试附带嵌入向量，嵌入失败不阻塞写入）
    pub async fn add_semantic(
        &self,
        content: impl Into<String>,
        importance: f64,
        metadata: serde_json::Value,
    ) -> MemoryEntry {
        let mut entry = MemoryEntry::new(MemoryKind::Semantic, content.into(), importance, metadata);
        entry.embedding = self.embed(&entry.content).await;
        let mut tiers = self.tiers.lock().unwrap();
        tiers.semantic.insert(entry.id, entry.clone());
        entry
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.generate_embedding(text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "embedding failed, storing without vector");
                None
            }
        }
    }

    /// 整理：把高重要度情景条目升格为语义记忆（从情景层迁出，避免重复升格）
    pub async fn consolidate(&self) {
        let candidates: Vec<MemoryEntry> = {
            let mut tiers = self.tiers.lock().unwrap();
            let threshold = self.cfg.consolidate_importance_threshold;
            let (keep, promote): (VecDeque<_>, VecDeque<_>) = tiers
                .episodic
                .drain(..)
                .partition(|e| e.importance < threshold);
            tiers.episodic = keep;
            promote.into_iter().collect()
        };
        if candidates.is_empty() {
            return;
        }
        tracing::info!(count = candidates.len(), "consolidating episodic memories into semantic");
        for mut entry in candidates {
            entry.kind = MemoryKind::Semantic;
            if entry.embedding.is_none() {
                entry.embedding = self.embed(&entry.content).await;
            }
            self.tiers.lock().unwrap().semantic.insert(entry.id, entry);
        }
    }

    pub fn working(&self) -> Vec<MemoryEntry> {
        self.tiers.lock().unwrap().working.iter().cloned().collect()
    }

    /// 最近的情景记忆（新在前）
    pub fn episodic(&self, limit: usize) -> Vec<MemoryEntry> {
        self.tiers
            .lock()
            .unwrap()
            .episodic
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn semantic_len(&self) -> usize {
        self.tiers.lock().unwrap().semantic.len()
    }

    /// 语义检索：query 嵌入可用时按余弦排序，否则关键词重叠
    pub async fn search_semantic(&self, query: &str, limit: usize) -> Vec<MemoryEntry> {
        let query_embedding = self.embed(query).await;
        let entries: Vec<MemoryEntry> = {
            let tiers = self.tiers.lock().unwrap();
            tiers.semantic.values().cloned().collect()
        };

        let mut scored: Vec<(f32, MemoryEntry)> = match query_embedding {
            Some(ref qe) => entries
                .into_iter()
                .filter_map(|e| {
                    let score = cosine(qe, e.embedding.as_deref()?);
                    (score > 0.0).then_some((score, e))
                })
                .collect(),
            None => {
                let query_tokens = tokenize_lower(query);
                if query_tokens.is_empty() {
                    return Vec::new();
                }
                entries
                    .into_iter()
                    .filter_map(|e| {
                        let overlap = query_tokens
                            .intersection(&tokenize_lower(&e.content))
                            .count();
                        (overlap > 0).then_some((overlap as f32, e))
                    })
                    .collect()
            }
        };
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(limit).map(|(_, e)| e).collect()
    }

    /// 构建供 Think 阶段使用的上下文摘要（最近工作记忆 + 各层规模）
    pub fn context_summary(&self) -> String {
        let tiers = self.tiers.lock().unwrap();
        let mut s = format!(
            "Memory: {} working, {} episodic, {} semantic entries.\n",
            tiers.working.len(),
            tiers.episodic.len(),
            tiers.semantic.len()
        );
        if !tiers.working.is_empty() {
            s.push_str("## Recent context\n");
            for e in tiers.working.iter().rev().take(10) {
                s.push_str(&format!("- {}\n", e.content));
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySection;
    use crate::llm::MockLlmClient;

    fn small_store() -> MemoryStore {
        MemoryStore::new(MemorySection {
            working_capacity: 3,
            episodic_capacity: 5,
            demote_importance_threshold: 0.5,
            consolidate_importance_threshold: 0.8,
        })
    }

    #[test]
    fn test_working_memory_bounded() {
        let store = small_store();
        for i in 0..10 {
            store.add_working(format!("entry {}", i), 0.1, serde_json::json!({}));
        }
        assert_eq!(store.working().len(), 3);
        // 最旧的被逐出，保留最近的
        assert_eq!(store.working()[0].content, "entry 7");
    }

    #[test]
    fn test_important_entry_demoted_to_episodic_on_eviction() {
        let store = small_store();
        store.add_working("keep me", 0.9, serde_json::json!({}));
        store.add_working("drop me", 0.2, serde_json::json!({}));
        for i in 0..4 {
            store.add_working(format!("filler {}", i), 0.1, serde_json::json!({}));
        }
        let episodic: Vec<String> = store.episodic(10).into_iter().map(|e| e.content).collect();
        assert!(episodic.contains(&"keep me".to_string()));
        assert!(!episodic.contains(&"drop me".to_string()));
    }

    #[test]
    fn test_episodic_evicts_oldest_unconditionally() {
        let store = small_store();
        for i in 0..8 {
            store.add_episodic(format!("ep {}", i), 0.99, serde_json::json!({}));
        }
        let contents: Vec<String> = store.episodic(10).into_iter().map(|e| e.content).collect();
        assert_eq!(contents.len(), 5);
        assert!(!contents.contains(&"ep 0".to_string()));
        assert!(contents.contains(&"ep 7".to_string()));
    }

    #[tokio::test]
    async fn test_consolidate_promotes_high_importance() {
        let store = small_store();
        store.add_episodic("vital insight", 0.9, serde_json::json!({}));
        store.add_episodic("mundane detail", 0.3, serde_json::json!({}));
        store.consolidate().await;
        assert_eq!(store.semantic_len(), 1);
        // 升格后的条目从情景层迁出
        let episodic: Vec<String> = store.episodic(10).into_iter().map(|e| e.content).collect();
        assert_eq!(episodic, vec!["mundane detail".to_string()]);
    }

    #[tokio::test]
    async fn test_keyword_search_without_embedder() {
        let store = small_store();
        store
            .add_semantic("rust borrow checker rules", 0.9, serde_json::json!({}))
            .await;
        store
            .add_semantic("weather in tokyo", 0.9, serde_json::json!({}))
            .await;
        let hits = store.search_semantic("borrow checker", 5).await;
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("borrow"));
    }

    #[tokio::test]
    async fn test_embedding_attached_when_embedder_present() {
        let embedder = Arc::new(MockLlmClient::new().with_embedding(vec![1.0, 0.0]));
        let store = small_store().with_embedder(embedder);
        let entry = store
            .add_semantic("vectorized", 0.9, serde_json::json!({}))
            .await;
        assert_eq!(entry.embedding, Some(vec![1.0, 0.0]));
        let hits = store.search_semantic("anything", 5).await;
        assert_eq!(hits.len(), 1);
    }
}
