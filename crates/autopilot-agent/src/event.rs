use serde::Deserialize;
use serde_json::Value;

/// One NDJSON line of `claude --output-format stream-json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    /// Tool results fed back to the model; only counted.
    User(Value),
    Result(ResultEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    /// Names of connected MCP servers with their status, on `init`.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerStatus {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String },
    #[serde(other)]
    Unknown,
}

/// Emitted once when the agent stops.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub num_turns: Option<u64>,
    #[serde(alias = "cost_usd")]
    pub total_cost_usd: Option<f64>,
}

/// What a finished agent session produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    /// The final result text, or the last assistant text block when the
    /// result was empty.
    pub output: String,
    pub session_id: Option<String>,
    pub is_error: bool,
    pub num_turns: u64,
    pub tool_calls: Vec<String>,
    /// MCP servers that did not report `connected` at startup.
    pub failed_mcp_servers: Vec<String>,
}

pub fn parse_stream(data: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();
    let mut last_text = String::new();
    let mut result_text = String::new();

    for line in data.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(event) = serde_json::from_str::<AgentEvent>(line) else {
            continue;
        };
        match event {
            AgentEvent::System(e) => {
                if e.session_id.is_some() {
                    summary.session_id = e.session_id;
                }
                summary.failed_mcp_servers.extend(
                    e.mcp_servers
                        .into_iter()
                        .filter(|s| s.status != "connected")
                        .map(|s| s.name),
                );
            }
            AgentEvent::Assistant(e) => {
                for block in e.message.and_then(|m| m.content).unwrap_or_default() {
                    match block {
                        ContentBlock::Text { text } if !text.trim().is_empty() => last_text = text,
                        ContentBlock::ToolUse { name } => summary.tool_calls.push(name),
                        _ => {}
                    }
                }
            }
            AgentEvent::Result(e) => {
                if e.session_id.is_some() {
                    summary.session_id = e.session_id;
                }
                summary.is_error = e.is_error.unwrap_or(false)
                    || e.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
                summary.num_turns = e.num_turns.unwrap_or(0);
                result_text = e.result.unwrap_or_default();
            }
            AgentEvent::User(_) | AgentEvent::Unknown => {}
        }
    }

    summary.output = if result_text.trim().is_empty() {
        last_text
    } else {
        result_text
    };
    summary
}
