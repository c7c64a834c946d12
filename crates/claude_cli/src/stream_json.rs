use agent_engine::{
    InitMeta, Message, MessageType, ParseError, StopReason, ToolCall, Usage,
};
use serde_json::Value;

/// Translates one `claude --output-format stream-json` line into the engine
/// vocabulary.
///
/// Returns `Ok(None)` for blank lines and frames with no consumer-visible
/// payload (ping stream events, plain user echoes). Unknown top-level types
/// pass through with the raw value attached so new CLI versions stay visible.
pub fn parse_stream_json_line(line: &str) -> Result<Option<Message>, ParseError> {
    let line = line.trim_end_matches('\r');
    if line.chars().all(|ch| ch.is_whitespace()) {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(line).map_err(|err| ParseError::new(err.to_string()))?;
    let Some(event_type) = value.get("type").and_then(Value::as_str) else {
        return Err(ParseError::new("event has no `type` field"));
    };

    let message = match event_type {
        "system" => parse_system(&value),
        "assistant" => parse_assistant(&value),
        "user" => parse_user(&value),
        "stream_event" => parse_stream_event(&value),
        "result" => parse_result(&value),
        other => {
            let mut message = Message::new(MessageType::new(other));
            message.raw = Some(value.clone());
            Some(message)
        }
    };
    Ok(message)
}

fn parse_system(value: &Value) -> Option<Message> {
    let subtype = value.get("subtype").and_then(Value::as_str);
    if subtype != Some("init") {
        let mut message = Message::new(MessageType::SYSTEM);
        message.content = subtype.unwrap_or_default().to_string();
        message.raw = Some(value.clone());
        return Some(message);
    }

    let mut message = Message::new(MessageType::INIT);
    let session_id = str_field(value, "session_id");
    let meta = InitMeta {
        session_id: session_id.clone().unwrap_or_default(),
        model: str_field(value, "model").unwrap_or_default(),
        tools: value
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    };
    if meta != InitMeta::default() {
        message.init = Some(meta);
    }
    message.resume_id = session_id;
    Some(message)
}

fn parse_assistant(value: &Value) -> Option<Message> {
    let content = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array);

    let mut text = String::new();
    let mut tool: Option<ToolCall> = None;
    if let Some(blocks) = content {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(piece) = block.get("text").and_then(Value::as_str) {
                        text.push_str(piece);
                    }
                }
                Some("thinking") => {
                    // Reported separately below when it is the only payload.
                }
                Some("tool_use") if tool.is_none() => {
                    tool = Some(ToolCall {
                        id: str_field(block, "id").unwrap_or_default(),
                        name: str_field(block, "name").unwrap_or_default(),
                        input: block.get("input").cloned(),
                    });
                }
                _ => {}
            }
        }
    }

    let mut message = if let Some(tool) = tool {
        let mut message = Message::new(MessageType::TOOL_USE);
        message.tool = Some(tool);
        message.content = text;
        message
    } else if !text.is_empty() {
        Message::text(text)
    } else if let Some(thought) = first_block_text(value, "thinking", "thinking") {
        let mut message = Message::new(MessageType::THINKING);
        message.content = thought;
        message
    } else {
        return None;
    };

    if let Some(reason) = value
        .get("message")
        .and_then(|m| m.get("stop_reason"))
        .and_then(Value::as_str)
    {
        message.stop_reason = Some(StopReason::new(reason));
    }
    Some(message)
}

fn parse_user(value: &Value) -> Option<Message> {
    let blocks = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)?;
    let result_block = blocks
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))?;

    let mut message = Message::new(MessageType::TOOL_RESULT);
    message.content = match result_block.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    if let Some(id) = str_field(result_block, "tool_use_id") {
        message.tool = Some(ToolCall {
            id,
            ..ToolCall::default()
        });
    }
    Some(message)
}

fn parse_stream_event(value: &Value) -> Option<Message> {
    let event = value.get("event")?;
    match event.get("type").and_then(Value::as_str)? {
        "content_block_delta" => {
            let delta = event.get("delta")?;
            match delta.get("type").and_then(Value::as_str)? {
                "text_delta" => {
                    let mut message = Message::new(MessageType::TEXT_DELTA);
                    message.content = str_field(delta, "text").unwrap_or_default();
                    Some(message)
                }
                "thinking_delta" => {
                    let mut message = Message::new(MessageType::THINKING_DELTA);
                    message.content = str_field(delta, "thinking").unwrap_or_default();
                    Some(message)
                }
                "input_json_delta" => {
                    let mut message = Message::new(MessageType::TOOL_USE_DELTA);
                    message.content = str_field(delta, "partial_json").unwrap_or_default();
                    Some(message)
                }
                _ => None,
            }
        }
        // The lifecycle fragment that carries the authoritative stop reason
        // ahead of the result event.
        "message_delta" => {
            let reason = event
                .get("delta")
                .and_then(|delta| delta.get("stop_reason"))
                .and_then(Value::as_str)?;
            let mut message = Message::new(MessageType::new("message_delta"));
            message.stop_reason = Some(StopReason::new(reason));
            Some(message)
        }
        _ => None,
    }
}

fn parse_result(value: &Value) -> Option<Message> {
    let mut message = Message::new(MessageType::RESULT);
    message.content = str_field(value, "result").unwrap_or_default();
    message.resume_id = str_field(value, "session_id");

    if let Some(usage) = value.get("usage") {
        let usage = Usage {
            input_tokens: u64_field(usage, "input_tokens"),
            output_tokens: u64_field(usage, "output_tokens"),
            cache_read_tokens: u64_field(usage, "cache_read_input_tokens"),
        };
        if usage != Usage::default() {
            message.usage = Some(usage);
        }
    }
    if let Some(reason) = str_field(value, "stop_reason") {
        message.stop_reason = Some(StopReason::new(reason));
    }

    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_error {
        message.error_code = value
            .get("subtype")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    Some(message)
}

fn first_block_text(value: &Value, block_type: &str, field: &str) -> Option<String> {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)?
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some(block_type))
        .and_then(|block| block.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn str_field(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_string)
}

fn u64_field(value: &Value, field: &str) -> u64 {
    value.get(field).and_then(Value::as_u64).unwrap_or(0)
}
