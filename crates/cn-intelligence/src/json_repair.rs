//! Cleanup of model output before and after the first parse attempt.
//!
//! [`strip_code_fences`] always runs. [`repair_json`] is the one-shot fallback
//! used only after a parse failure; it is deliberately narrow and does not try
//! to make arbitrary text into JSON.

/// Remove a surrounding markdown code fence (```` ```json ... ``` ````), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// One-shot repair: cut to the outermost object, drop control characters and
/// drop trailing commas before `}` or `]`. String contents are preserved apart
/// from raw control characters, which JSON forbids there anyway.
pub fn repair_json(text: &str) -> String {
    let text = outermost_object(text);
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;

        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
            } else if c == '\\' {
                escaped = true;
                out.push(c);
            } else if c == '"' {
                in_string = false;
                out.push(c);
            } else if c.is_control() {
                // Raw newlines inside strings become escaped ones; the rest go.
                if c == '\n' {
                    out.push_str("\\n");
                }
            } else {
                out.push(c);
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            c if c.is_control() && !matches!(c, '\n' | '\r' | '\t') => {}
            c => out.push(c),
        }
    }
    out
}

fn outermost_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn strips_bare_fence_and_whitespace() {
        let raw = "  ```\n{\"a\": 1}\n```  \n";
        assert_eq!(strip_code_fences(raw), "{\"a\": 1}");
    }

    #[test]
    fn unfenced_text_is_trimmed_only() {
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn removes_trailing_commas() {
        let fixed = repair_json("{\"a\": [1, 2, ], \"b\": {\"c\": 3,},}");
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["a"][1], 2);
        assert_eq!(v["b"]["c"], 3);
    }

    #[test]
    fn keeps_commas_inside_strings() {
        let fixed = repair_json("{\"a\": \"x, }\",}");
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["a"], "x, }");
    }

    #[test]
    fn escapes_raw_newline_in_string() {
        let fixed = repair_json("{\"a\": \"line1\nline2\u{0007}\"}");
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["a"], "line1\nline2");
    }

    #[test]
    fn cuts_surrounding_prose() {
        let fixed = repair_json("Here is the plan: {\"tasks\": []} Hope it helps!");
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert!(v["tasks"].as_array().unwrap().is_empty());
    }
}
