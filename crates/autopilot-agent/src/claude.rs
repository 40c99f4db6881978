use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use autopilot_core::{
    agent::RemediationAgent,
    types::{Defect, FixOutput, ReviewOutput, SecurityOutput, Workspace},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::event::{parse_stream, StreamSummary};
use crate::instruction::{
    fix_prompt, review_prompt, security_prompt, AUDIT_TOOLS, FIX_SYSTEM_PROMPT,
    REVIEW_SYSTEM_PROMPT, SECURITY_SYSTEM_PROMPT,
};
use crate::verdict::{extract_pr_url, is_approved, is_passed};

/// Runs the `claude` CLI as a subprocess for each capability call.
pub struct ClaudeBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    pub fix_model: String,
    /// Empty means the CLI's default model.
    pub audit_model: String,
    pub fix_max_turns: u32,
    pub audit_max_turns: u32,
    /// Enables the Sentry MCP server for the fix session when non-empty.
    pub sentry_token: String,
    pub npx_path: String,
    /// Kill the subprocess after this many seconds (0 = no limit).
    pub timeout_s: u64,
}

/// One CLI session.
pub struct Invocation<'a> {
    pub label: &'static str,
    pub cwd: &'a str,
    pub model: &'a str,
    pub system_prompt: &'a str,
    /// `None` leaves every tool available.
    pub allowed_tools: Option<&'a str>,
    pub max_turns: u32,
    pub mcp_config: Option<String>,
    pub env: Vec<(&'static str, String)>,
    pub prompt: String,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self {
            claude_bin: claude_bin.into(),
            fix_model: "opus".into(),
            audit_model: String::new(),
            fix_max_turns: 50,
            audit_max_turns: 10,
            sentry_token: String::new(),
            npx_path: "npx".into(),
            timeout_s: 0,
        }
    }

    pub fn with_models(mut self, fix: impl Into<String>, audit: impl Into<String>) -> Self {
        self.fix_model = fix.into();
        self.audit_model = audit.into();
        self
    }

    pub fn with_turns(mut self, fix: u32, audit: u32) -> Self {
        self.fix_max_turns = fix;
        self.audit_max_turns = audit;
        self
    }

    pub fn with_sentry_mcp(mut self, token: impl Into<String>, npx_path: impl Into<String>) -> Self {
        self.sentry_token = token.into();
        self.npx_path = npx_path.into();
        self
    }

    pub fn with_timeout(mut self, timeout_s: u64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    /// `--mcp-config` payload wiring the Sentry MCP server through `npx`.
    pub fn sentry_mcp_config(&self) -> Option<String> {
        if self.sentry_token.is_empty() {
            return None;
        }
        let node_bin = std::path::Path::new(&self.npx_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty());
        let path = match node_bin {
            Some(dir) => format!("{dir}:/usr/local/bin:/usr/bin:/bin"),
            None => "/usr/local/bin:/usr/bin:/bin".to_string(),
        };
        let config = serde_json::json!({
            "mcpServers": {
                "sentry": {
                    "command": self.npx_path,
                    "args": ["-y", "@sentry/mcp-server"],
                    "env": {
                        "SENTRY_AUTH_TOKEN": self.sentry_token,
                        "PATH": path,
                    }
                }
            }
        });
        Some(config.to_string())
    }

    pub fn build_args(&self, inv: &Invocation<'_>) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            inv.max_turns.to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
        if !inv.model.is_empty() {
            args.push("--model".to_string());
            args.push(inv.model.to_string());
        }
        if let Some(tools) = inv.allowed_tools {
            args.push("--allowedTools".to_string());
            args.push(tools.to_string());
        }
        if let Some(mcp) = &inv.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(mcp.clone());
        }
        if !inv.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(inv.system_prompt.to_string());
        }
        args.push("--print".to_string());
        args.push(inv.prompt.clone());
        args
    }

    /// Run one session to completion and summarize its stream.
    ///
    /// Fails only when the process could not run or exited non-zero
    /// without producing any output.
    pub async fn invoke(&self, inv: Invocation<'_>) -> Result<StreamSummary> {
        let args = self.build_args(&inv);
        let label = inv.label;
        info!(label, cwd = inv.cwd, model = inv.model, max_turns = inv.max_turns, "spawning claude subprocess");

        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .envs(inv.env.iter().map(|(k, v)| (*k, v.as_str())))
            .kill_on_drop(true)
            .current_dir(inv.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;

        let io_future = async move {
            let mut raw_stream = String::new();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line.context("error reading stdout")? {
                            Some(l) => {
                                raw_stream.push_str(&l);
                                raw_stream.push('\n');
                            }
                            None => break,
                        }
                    }
                    line = stderr_reader.next_line() => {
                        if let Ok(Some(l)) = line {
                            if !l.is_empty() {
                                warn!(label, "claude stderr: {}", l);
                            }
                        }
                    }
                }
            }

            while let Ok(Some(l)) = stderr_reader.next_line().await {
                if !l.is_empty() {
                    warn!(label, "claude stderr: {}", l);
                }
            }

            let exit_status = child.wait().await.context("failed to wait for claude")?;
            anyhow::Ok((raw_stream, exit_status))
        };

        let (raw_stream, status) = if self.timeout_s > 0 {
            match tokio::time::timeout(Duration::from_secs(self.timeout_s), io_future).await {
                Ok(res) => res?,
                Err(_elapsed) => bail!("claude {label} session timed out after {}s", self.timeout_s),
            }
        } else {
            io_future.await?
        };

        let summary = parse_stream(&raw_stream);
        info!(
            label,
            success = status.success(),
            session_id = ?summary.session_id,
            turns = summary.num_turns,
            tool_calls = summary.tool_calls.len(),
            output_len = summary.output.len(),
            "claude subprocess finished"
        );
        if !summary.failed_mcp_servers.is_empty() {
            warn!(label, servers = ?summary.failed_mcp_servers, "MCP servers failed to connect");
        }
        if !status.success() && summary.output.trim().is_empty() {
            bail!("claude {label} session exited with {status} and no output");
        }
        Ok(summary)
    }
}

#[async_trait]
impl RemediationAgent for ClaudeBackend {
    async fn fix(&self, defect: &Defect, workspace: &Workspace) -> Result<FixOutput> {
        let summary = self
            .invoke(Invocation {
                label: "fix",
                cwd: &workspace.path,
                model: &self.fix_model,
                system_prompt: FIX_SYSTEM_PROMPT,
                allowed_tools: None,
                max_turns: self.fix_max_turns,
                mcp_config: self.sentry_mcp_config(),
                env: vec![("CLAUDE_CODE_TASK_LIST_ID", workspace.branch.clone())],
                prompt: fix_prompt(defect),
            })
            .await?;

        let pr_url = extract_pr_url(&summary.output);
        Ok(FixOutput {
            success: !summary.output.trim().is_empty() && pr_url.is_some(),
            summary: summary.output,
            pr_url,
        })
    }

    async fn review(
        &self,
        diff: &str,
        defect_context: &str,
        repo_root: &str,
    ) -> Result<ReviewOutput> {
        let summary = self
            .invoke(Invocation {
                label: "review",
                cwd: repo_root,
                model: &self.audit_model,
                system_prompt: REVIEW_SYSTEM_PROMPT,
                allowed_tools: Some(AUDIT_TOOLS),
                max_turns: self.audit_max_turns,
                mcp_config: None,
                env: Vec::new(),
                prompt: review_prompt(diff, defect_context),
            })
            .await?;
        Ok(ReviewOutput {
            approved: is_approved(&summary.output),
            summary: summary.output,
        })
    }

    async fn security(
        &self,
        diff: &str,
        defect_context: &str,
        repo_root: &str,
    ) -> Result<SecurityOutput> {
        let summary = self
            .invoke(Invocation {
                label: "security",
                cwd: repo_root,
                model: &self.audit_model,
                system_prompt: SECURITY_SYSTEM_PROMPT,
                allowed_tools: Some(AUDIT_TOOLS),
                max_turns: self.audit_max_turns,
                mcp_config: None,
                env: Vec::new(),
                prompt: security_prompt(diff, defect_context),
            })
            .await?;
        Ok(SecurityOutput {
            passed: is_passed(&summary.output),
            summary: summary.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(mcp: Option<String>) -> Invocation<'static> {
        Invocation {
            label: "review",
            cwd: "/repo",
            model: "",
            system_prompt: REVIEW_SYSTEM_PROMPT,
            allowed_tools: Some(AUDIT_TOOLS),
            max_turns: 10,
            mcp_config: mcp,
            env: Vec::new(),
            prompt: "Review this".into(),
        }
    }

    #[test]
    fn audit_args_restrict_tools_and_skip_empty_model() {
        let backend = ClaudeBackend::new("claude");
        let args = backend.build_args(&invocation(None));
        assert!(args.windows(2).any(|w| w == ["--max-turns", "10"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Read,Glob,Grep"]));
        assert!(!args.iter().any(|a| a == "--model"));
        assert!(!args.iter().any(|a| a == "--mcp-config"));
        assert_eq!(args[args.len() - 2..], ["--print", "Review this"]);
    }

    #[test]
    fn mcp_config_requires_token() {
        assert!(ClaudeBackend::new("claude").sentry_mcp_config().is_none());

        let backend = ClaudeBackend::new("claude")
            .with_sentry_mcp("sntrys_abc", "/opt/node/bin/npx");
        let raw = backend.sentry_mcp_config().unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let sentry = &v["mcpServers"]["sentry"];
        assert_eq!(sentry["command"], "/opt/node/bin/npx");
        assert_eq!(sentry["args"][1], "@sentry/mcp-server");
        assert_eq!(sentry["env"]["SENTRY_AUTH_TOKEN"], "sntrys_abc");
        assert!(sentry["env"]["PATH"]
            .as_str()
            .unwrap()
            .starts_with("/opt/node/bin:"));

        let args = backend.build_args(&invocation(Some(raw.clone())));
        assert!(args.windows(2).any(|w| w[0] == "--mcp-config" && w[1] == raw));
    }
}
