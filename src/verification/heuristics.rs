//! 自动审批启发式
//!
//! 先匹配正向模板（工具摘要句式），未命中再用关键词判断：
//! 至少一个成功关键词，且没有任何错误关键词。

use std::sync::OnceLock;

use regex::Regex;

const TEMPLATES: &[&str] = &[
    r"(?i)\bfile\b.*\b(created|written|saved|updated|deleted|read)\s+successfully\b",
    r"(?i)\bsearch completed\b",
    r"(?i)\bcommand (succeeded|completed successfully)\b",
    r"(?i)\btodo\b.*\b(created|updated)\b",
];

const SUCCESS_KEYWORDS: &[&str] = &[
    "success",
    "completed",
    "done",
    "created",
    "updated",
    "saved",
    "written",
    "deleted",
    "found",
    "retrieved",
];

const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "exception",
    "timeout",
    "not found",
    "permission denied",
    "access denied",
    "invalid",
];

static TEMPLATE_RE: OnceLock<Vec<Regex>> = OnceLock::new();

fn templates() -> &'static [Regex] {
    TEMPLATE_RE.get_or_init(|| TEMPLATES.iter().filter_map(|p| Regex::new(p).ok()).collect())
}

/// 结果文本是否可以不经人工确认直接通过
pub fn should_auto_approve(result_text: &str) -> bool {
    let text = result_text.trim();
    if text.is_empty() {
        return false;
    }
    if templates().iter().any(|re| re.is_match(text)) {
        return true;
    }
    let lower = text.to_lowercase();
    let has_success = SUCCESS_KEYWORDS.iter().any(|k| lower.contains(k));
    let has_error = ERROR_KEYWORDS.iter().any(|k| lower.contains(k));
    has_success && !has_error
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates() {
        assert!(should_auto_approve("File test.js created successfully"));
        assert!(should_auto_approve("Search completed: 4 matches for '*.rs'"));
        assert!(should_auto_approve("Command succeeded (exit code 0)"));
        assert!(should_auto_approve("TODO todo_2 updated"));
    }

    #[test]
    fn test_keyword_heuristic() {
        assert!(should_auto_approve("All records retrieved"));
        assert!(!should_auto_approve("Command failed with error"));
        assert!(!should_auto_approve("Config found but invalid"));
        assert!(!should_auto_approve("Working on it"));
        assert!(!should_auto_approve("   "));
    }
}
