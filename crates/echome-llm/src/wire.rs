//! OpenAI-compatible chat-completion request and stream-chunk shapes.

use echome_types::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub(crate) const SEARCH_TOOL_NAME: &str = "perform_search";

#[derive(Debug, Serialize)]
pub(crate) struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "no_tools")]
    pub tools: &'a [Value],
}

fn no_tools(tools: &&[Value]) -> bool {
    tools.is_empty()
}

pub(crate) fn search_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": SEARCH_TOOL_NAME,
            "description": "Search the web for current information the character does not know.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query."
                    }
                },
                "required": ["query"]
            }
        }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct StreamChunk {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    #[serde(default)]
    pub delta: Delta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallDelta>,
}

/// One tool-call fragment. Providers either stream `function.arguments` in
/// pieces keyed by `index`, or send a complete flat `{name, parameters}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// A fully assembled tool invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ToolCall {
    pub name: String,
    pub arguments: String,
    pub parameters: Option<Value>,
}

impl ToolCall {
    /// The `query` argument, from either the structured parameters or the
    /// concatenated JSON argument string.
    pub fn query(&self) -> Option<String> {
        let args = match &self.parameters {
            Some(value) => value.clone(),
            None => serde_json::from_str::<Value>(&self.arguments).ok()?,
        };
        let query = args.get("query")?.as_str()?.trim();
        if query.is_empty() {
            None
        } else {
            Some(query.to_string())
        }
    }
}

/// Assembles streamed tool-call fragments by index.
#[derive(Debug, Default)]
pub(crate) struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, delta: ToolCallDelta) {
        if let Some(function) = delta.function {
            let index = delta.index.unwrap_or(0);
            if self.calls.len() <= index {
                self.calls.resize_with(index + 1, ToolCall::default);
            }
            let call = &mut self.calls[index];
            if let Some(name) = function.name {
                if !name.is_empty() {
                    call.name = name;
                }
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        } else if let Some(name) = delta.name {
            self.calls.push(ToolCall {
                name,
                arguments: String::new(),
                parameters: delta.parameters,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.iter().all(|c| c.name.is_empty())
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls.into_iter().filter(|c| !c.name.is_empty()).collect()
    }
}
