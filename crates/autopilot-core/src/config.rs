use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::hosting::MergeMethod;
use crate::pipeline::PipelineConfig;

/// Full service configuration. Process env wins over `.env`.
#[derive(Debug, Clone)]
pub struct Config {
    // Sentry
    pub sentry_auth_token: String,
    pub sentry_org: String,
    pub sentry_project: String,
    pub sentry_api_url: String,
    pub sentry_webhook_secret: String,
    pub poll_interval_s: u64,
    pub poll_limit: u32,

    // GitHub
    pub github_pat: String,
    /// `owner/name`; empty means infer from the repo's remote.
    pub github_repo: String,
    pub merge_method: MergeMethod,
    pub open_missing_pr: bool,

    // Repository / storage
    pub repo_path: String,
    pub mainline: String,
    pub data_dir: String,
    pub runs_dir: String,

    // CI gate
    pub ci_timeout_s: u64,
    pub ci_poll_interval_s: u64,

    // Agent
    pub claude_bin: String,
    pub fix_model: String,
    pub audit_model: String,
    pub fix_max_turns: u32,
    pub audit_max_turns: u32,
    pub npx_path: String,

    // HTTP
    pub bind: String,
    pub port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn get_str(get: Lookup, key: &str, default: &str) -> String {
    get(key).unwrap_or_else(|| default.to_string())
}

fn get_bool(get: Lookup, key: &str, default: bool) -> bool {
    match get(key).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u64(get: Lookup, key: &str, default: u64) -> u64 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u32(get: Lookup, key: &str, default: u32) -> u32 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn get_u16(get: Lookup, key: &str, default: u16) -> u16 {
    get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let dotenv = parse_dotenv();
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get: Lookup = &lookup;
        let merge_method = get_str(get, "MERGE_METHOD", "squash")
            .parse()
            .unwrap_or_else(|e| {
                tracing::warn!("{e}, falling back to squash");
                MergeMethod::Squash
            });

        Self {
            sentry_auth_token: get_str(get, "SENTRY_AUTH_TOKEN", ""),
            sentry_org: get_str(get, "SENTRY_ORG", ""),
            sentry_project: get_str(get, "SENTRY_PROJECT", ""),
            sentry_api_url: get_str(get, "SENTRY_API_URL", "https://sentry.io/api/0"),
            sentry_webhook_secret: get_str(get, "SENTRY_WEBHOOK_SECRET", ""),
            poll_interval_s: get_u64(get, "POLL_INTERVAL_SECONDS", 300),
            poll_limit: get_u32(get, "POLL_LIMIT", 10),
            github_pat: get_str(get, "GITHUB_PAT", ""),
            github_repo: get_str(get, "GITHUB_REPO", ""),
            merge_method,
            open_missing_pr: get_bool(get, "OPEN_MISSING_PR", false),
            repo_path: get_str(get, "REPO_PATH", "."),
            mainline: get_str(get, "MAINLINE", "main"),
            data_dir: get_str(get, "DATA_DIR", "autopilot/data"),
            runs_dir: get_str(get, "RUNS_DIR", "autopilot/runs"),
            ci_timeout_s: get_u64(get, "CI_TIMEOUT_S", 300),
            ci_poll_interval_s: get_u64(get, "CI_POLL_INTERVAL_S", 15),
            claude_bin: get_str(get, "CLAUDE_BIN", "claude"),
            fix_model: get_str(get, "FIX_MODEL", "opus"),
            audit_model: get_str(get, "AUDIT_MODEL", ""),
            fix_max_turns: get_u32(get, "FIX_MAX_TURNS", 50),
            audit_max_turns: get_u32(get, "AUDIT_MAX_TURNS", 10),
            npx_path: get_str(get, "NPX_PATH", "npx"),
            bind: get_str(get, "BIND", "0.0.0.0"),
            port: get_u16(get, "PORT", 8002),
        }
    }

    /// Env keys the poll loop cannot run without.
    pub fn missing_poller_keys(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.sentry_auth_token.is_empty() {
            missing.push("SENTRY_AUTH_TOKEN");
        }
        if self.sentry_org.is_empty() {
            missing.push("SENTRY_ORG");
        }
        if self.sentry_project.is_empty() {
            missing.push("SENTRY_PROJECT");
        }
        missing
    }

    pub fn processed_file(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("processed_issues.json")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            repo_root: self.repo_path.clone(),
            mainline: self.mainline.clone(),
            ci_timeout: Duration::from_secs(self.ci_timeout_s),
            // 0 would re-poll checks in a tight loop
            ci_poll_interval: Duration::from_secs(self.ci_poll_interval_s.max(1)),
            merge_method: self.merge_method,
            open_missing_pr: self.open_missing_pr,
        }
    }
}
