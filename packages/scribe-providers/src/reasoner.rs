//! OpenAI-compatible chat-completions client with tool calling.
//!
//! One call per agent iteration. Calls are never retried here; the orchestrator records a failed
//! call into the run instead.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{Error, Result};

/// One turn of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
	System { content: String },
	User { content: String },
	Assistant { content: String },
	/// The model's own tool invocation, replayed so the following result has a call to answer.
	ToolCall { call_id: String, name: String, arguments: Value },
	ToolResult { call_id: String, content: Value },
}
impl Turn {
	fn to_message(&self) -> Value {
		match self {
			Self::System { content } => serde_json::json!({ "role": "system", "content": content }),
			Self::User { content } => serde_json::json!({ "role": "user", "content": content }),
			Self::Assistant { content } =>
				serde_json::json!({ "role": "assistant", "content": content }),
			Self::ToolCall { call_id, name, arguments } => serde_json::json!({
				"role": "assistant",
				"content": Value::Null,
				"tool_calls": [{
					"id": call_id,
					"type": "function",
					"function": { "name": name, "arguments": arguments.to_string() },
				}],
			}),
			Self::ToolResult { call_id, content } => serde_json::json!({
				"role": "tool",
				"tool_call_id": call_id,
				"content": content.to_string(),
			}),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
	pub name: &'static str,
	pub description: &'static str,
	/// JSON schema of the arguments object.
	pub parameters: Value,
}
impl ToolSpec {
	fn to_function(&self) -> Value {
		serde_json::json!({
			"type": "function",
			"function": {
				"name": self.name,
				"description": self.description,
				"parameters": self.parameters,
			},
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
	pub call_id: String,
	pub name: String,
	pub arguments: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
	pub input_tokens: u64,
	pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReasonerReply {
	pub tool_call: Option<ToolCall>,
	pub text: Option<String>,
	pub usage: Usage,
}

pub async fn reason(
	cfg: &scribe_config::LlmProviderConfig,
	turns: &[Turn],
	tools: &[ToolSpec],
) -> Result<ReasonerReply> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = format!("{}{}", cfg.api_base, cfg.path);
	let body = request_body(cfg, turns, tools);
	let res = client
		.post(&url)
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&body)
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_reply(json)
}

fn request_body(cfg: &scribe_config::LlmProviderConfig, turns: &[Turn], tools: &[ToolSpec]) -> Value {
	let messages: Vec<Value> = turns.iter().map(Turn::to_message).collect();
	let tools: Vec<Value> = tools.iter().map(ToolSpec::to_function).collect();

	serde_json::json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": messages,
		"tools": tools,
		"tool_choice": "auto",
	})
}

fn parse_reply(json: Value) -> Result<ReasonerReply> {
	let message = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.and_then(|choice| choice.get("message"))
		.ok_or_else(|| invalid("Reasoner response is missing choices[0].message."))?;
	let text = message
		.get("content")
		.and_then(|c| c.as_str())
		.map(str::trim)
		.filter(|c| !c.is_empty())
		.map(ToString::to_string);
	let tool_call = match message
		.get("tool_calls")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
	{
		Some(call) => Some(parse_tool_call(call)?),
		None => None,
	};

	if tool_call.is_none() && text.is_none() {
		return Err(invalid("Reasoner response has neither a tool call nor text."));
	}

	let usage = json.get("usage");
	let count = |field: &str| usage.and_then(|u| u.get(field)).and_then(|v| v.as_u64()).unwrap_or(0);

	Ok(ReasonerReply {
		tool_call,
		text,
		usage: Usage {
			input_tokens: count("prompt_tokens"),
			output_tokens: count("completion_tokens"),
		},
	})
}

fn parse_tool_call(call: &Value) -> Result<ToolCall> {
	let function = call.get("function").ok_or_else(|| invalid("Tool call is missing function."))?;
	let name = function
		.get("name")
		.and_then(|n| n.as_str())
		.filter(|n| !n.trim().is_empty())
		.ok_or_else(|| invalid("Tool call is missing a function name."))?;
	let call_id = call.get("id").and_then(|id| id.as_str()).unwrap_or(name).to_string();
	let arguments = match function.get("arguments") {
		None | Some(Value::Null) => Value::Object(Default::default()),
		Some(Value::String(raw)) if raw.trim().is_empty() => Value::Object(Default::default()),
		Some(Value::String(raw)) => serde_json::from_str(raw)
			.map_err(|_| invalid(&format!("Arguments for tool {name} are not valid JSON.")))?,
		Some(other) => other.clone(),
	};

	if !arguments.is_object() {
		return Err(invalid(&format!("Arguments for tool {name} must be a JSON object.")));
	}

	Ok(ToolCall { call_id, name: name.to_string(), arguments })
}

fn invalid(message: &str) -> Error {
	Error::InvalidResponse { message: message.to_string() }
}
