use crate::types::Message;

/// Approximate a token count for a string. Implementations may be exact
/// tokenizers or heuristics — the core only depends on monotonicity (more
/// text never yields a smaller estimate), never on absolute accuracy.
pub fn estimate(text: &str, _model_id: &str) -> u32 {
    (text.len() as u32) / 4
}

/// Per-message and total token estimates for a full message list.
pub fn estimate_messages(messages: &[Message], model_id: &str) -> (u32, Vec<u32>) {
    let per_message: Vec<u32> = messages
        .iter()
        .map(|m| {
            let mut tokens = estimate(&m.content, model_id);
            for call in &m.tool_calls {
                tokens += estimate(&call.name, model_id);
                tokens += estimate(&call.arguments.to_string(), model_id);
            }
            tokens
        })
        .collect();
    let total = per_message.iter().sum();
    (total, per_message)
}

/// Deterministic context-window lookup for an opaque model identifier.
/// Known prefixes map to fixed values; unknown ids fall back to 8,192.
pub fn heuristic_context_window(model_id: &str) -> u32 {
    let id = model_id.to_lowercase();

    if id.starts_with("claude") {
        return 200_000;
    }
    if id.starts_with("gpt-4-32k") {
        return 32_768;
    }
    if id.starts_with("gpt-4-turbo") || id.starts_with("gpt-4o") {
        return 128_000;
    }
    if id.starts_with("o1") || id.starts_with("o3") || id.starts_with("o4") {
        return 128_000;
    }
    if id.starts_with("devstral") {
        return 128_000;
    }
    if id.starts_with("gpt-4") {
        return 8_192;
    }
    if id.starts_with("gpt-3.5-turbo-16k") {
        return 16_384;
    }
    if id.starts_with("gpt-3.5") {
        return 4_096;
    }

    8_192
}
