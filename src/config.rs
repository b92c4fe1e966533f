//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HORNET__*` 覆盖（双下划线表示嵌套，如 `HORNET__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub memory: MemorySection,
    pub tools: ToolsSection,
}

/// [agent] 段：循环预算与重规划阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单个指令最多迭代次数
    pub max_iterations: u32,
    /// 单个指令最长执行时间（秒）
    pub max_execution_secs: u64,
    /// 单会话成本上限（美元）
    pub max_cost_per_session: f64,
    /// 每 N 次迭代触发一次记忆整理
    pub consolidation_interval: u32,
    /// 单任务内 LLM 对话最大尝试次数
    pub max_task_attempts: u32,
    /// 失败任务数超过此值时强制重规划
    pub max_failed_tasks_before_replan: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_execution_secs: 300,
            max_cost_per_session: 1.0,
            consolidation_interval: 10,
            max_task_attempts: 5,
            max_failed_tasks_before_replan: 3,
        }
    }
}

/// [llm] 段：后端选择、各任务类型的模型与计价
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（兼容端点）/ mock（测试）
    pub provider: String,
    pub base_url: Option<String>,
    /// 嵌入模型；为空时禁用嵌入（语义检索退化为关键词匹配）
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub models: LlmModelsSection,
    #[serde(default)]
    pub pricing: LlmPricingSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: None,
            embedding_model: Some("text-embedding-3-small".to_string()),
            models: LlmModelsSection::default(),
            pricing: LlmPricingSection::default(),
        }
    }
}

/// [llm.models] 段：任务类型 -> 模型名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmModelsSection {
    pub planning: String,
    pub reasoning: String,
    pub coding: String,
    /// 快速轻量模型（完成校验等低成本调用）
    pub fast: String,
    pub general: String,
}

impl Default for LlmModelsSection {
    fn default() -> Self {
        Self {
            planning: "gpt-4o".to_string(),
            reasoning: "gpt-4o".to_string(),
            coding: "gpt-4o".to_string(),
            fast: "gpt-4o-mini".to_string(),
            general: "gpt-4o-mini".to_string(),
        }
    }
}

/// [llm.pricing] 段：每千 token 价格（美元），用于会话成本统计
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmPricingSection {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl Default for LlmPricingSection {
    fn default() -> Self {
        Self {
            prompt_per_1k: 0.0025,
            completion_per_1k: 0.01,
        }
    }
}

/// [memory] 段：各层容量与重要度阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 工作记忆容量（条）
    pub working_capacity: usize,
    /// 情景记忆容量（条）
    pub episodic_capacity: usize,
    /// 工作记忆逐出时，重要度高于此值的条目降级到情景记忆而非丢弃
    pub demote_importance_threshold: f64,
    /// consolidate 时，重要度不低于此值的情景条目升格为语义记忆
    pub consolidate_importance_threshold: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            working_capacity: 50,
            episodic_capacity: 500,
            demote_importance_threshold: 0.5,
            consolidate_importance_threshold: 0.8,
        }
    }
}

/// [tools] 段：文件系统根、工具超时、Shell 网关、HTTP
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub http: HttpSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            tool_timeout_secs: 30,
            shell: ShellSection::default(),
            http: HttpSection::default(),
        }
    }
}

/// [tools.shell] 段：Secure Command Gate 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    /// 关闭后跳过全部校验（仅限可信环境）
    pub sandbox_enabled: bool,
    /// 允许执行的命令名（仅首词，如 ls、grep、cargo）
    pub allowed_commands: Vec<String>,
    /// 单条命令最长执行时间（秒），超时强杀
    pub max_execution_secs: u64,
    /// 捕获输出最大字节数，超出截断
    pub max_output_bytes: usize,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            allowed_commands: vec![
                "ls".into(),
                "cat".into(),
                "echo".into(),
                "grep".into(),
                "head".into(),
                "tail".into(),
                "wc".into(),
                "find".into(),
                "pwd".into(),
                "date".into(),
            ],
            max_execution_secs: 30,
            max_output_bytes: 100_000,
        }
    }
}

/// [tools.http] 段：抓取 URL 的超时与结果大小限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    /// 允许访问的域名（后缀匹配）；空表示不限制
    pub allowed_domains: Vec<String>,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: Vec::new(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HORNET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HORNET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HORNET")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 50);
        assert_eq!(cfg.agent.max_task_attempts, 5);
        assert!(cfg.tools.shell.sandbox_enabled);
        assert!(cfg.tools.shell.allowed_commands.iter().any(|c| c == "ls"));
        assert!(cfg.memory.demote_importance_threshold > 0.0);
    }
}
