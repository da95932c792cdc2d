//! ChatML prompt rendering
//!
//! The native chat template is left empty, so the bridge hands the runtime a
//! fully rendered prompt: `<|im_start|>role\ncontent<|im_end|>\n` per message,
//! tool schemas folded into the system block, then the assistant header.

use serde_json::Value;

use crate::types::{ChatMessage, ChatRole};

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

/// Appended after the assistant header when reasoning is switched off
pub const EMPTY_THINK_BLOCK: &str = "<think>\n\n</think>\n\n";

/// Renders a whole conversation, including the tool block
pub fn render_conversation(messages: &[ChatMessage], tools: &[Value], enable_thinking: bool) -> String {
    let mut prompt = String::new();
    let mut rest = messages;

    if !tools.is_empty() {
        let system = match messages.first() {
            Some(first) if first.role == ChatRole::System => {
                rest = &messages[1..];
                Some(first.content.as_str())
            }
            _ => None,
        };
        push_message(&mut prompt, ChatRole::System, &system_with_tools(system, tools));
    }

    for message in rest {
        push_message(&mut prompt, message.role, &message.content);
    }
    push_generation_prompt(&mut prompt, enable_thinking);
    prompt
}

/// Renders only the messages the native context has not seen yet
pub fn render_continuation(new_messages: &[ChatMessage], enable_thinking: bool) -> String {
    render_conversation(new_messages, &[], enable_thinking)
}

fn push_message(prompt: &mut String, role: ChatRole, content: &str) {
    prompt.push_str(IM_START);
    prompt.push_str(role.as_str());
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str(IM_END);
    prompt.push('\n');
}

fn push_generation_prompt(prompt: &mut String, enable_thinking: bool) {
    prompt.push_str(IM_START);
    prompt.push_str(ChatRole::Assistant.as_str());
    prompt.push('\n');
    if !enable_thinking {
        prompt.push_str(EMPTY_THINK_BLOCK);
    }
}

fn system_with_tools(system: Option<&str>, tools: &[Value]) -> String {
    let mut content = String::new();
    if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
        content.push_str(system);
        content.push_str("\n\n");
    }
    content.push_str("# Tools\n\n");
    content.push_str("You may call one or more functions to assist with the user query.\n\n");
    content.push_str(
        "You are provided with function signatures within <tools></tools> XML tags:\n<tools>",
    );
    for tool in tools {
        content.push('\n');
        content.push_str(&tool.to_string());
    }
    content.push_str("\n</tools>\n\n");
    content.push_str(
        "For each function call, return a json object with function name and arguments within <tool_call></tool_call> XML tags:\n",
    );
    content.push_str("<tool_call>\n{\"name\": <function-name>, \"arguments\": <args-json-object>}\n</tool_call>");
    content
}
