/// Extract the JSON payload from model output.
///
/// Models wrap structured answers in markdown fences or prose more often
/// than not; this finds the first balanced JSON object or array in the
/// text. Returns the raw slice so callers deserialize into their own
/// record types.
pub fn extract_json(content: &str) -> Option<&str> {
    let trimmed = content.trim();

    // Fenced block first: ```json ... ``` or plain ``` ... ```.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if !inner.is_empty() {
                return balanced_json(inner);
            }
        }
    }

    balanced_json(trimmed)
}

/// Find the first balanced `{...}` or `[...]` region.
fn balanced_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let open = text.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
