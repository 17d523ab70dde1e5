//! 模型响应的防御式解析
//!
//! 三段式，永不失败：
//! 1. 整体直接按 JSON 解析；
//! 2. 提取 ```json 代码块或第一个括号配平的 {...} 片段再解析；
//! 3. 兜底：phase=execution、message=原文，其余字段为空。

use serde::Serialize;

use crate::llm::ModelReply;
use crate::phase::ModelResponse;

/// 解析命中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStage {
    Direct,
    Extracted,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub response: ModelResponse,
    pub stage: ParseStage,
}

pub fn parse_reply(reply: &ModelReply) -> ParsedResponse {
    match reply {
        ModelReply::Text(text) => parse_text(text),
        ModelReply::Raw(serde_json::Value::String(text)) => parse_text(text),
        ModelReply::Raw(value) => match serde_json::from_value::<ModelResponse>(value.clone()) {
            Ok(response) => ParsedResponse {
                response,
                stage: ParseStage::Direct,
            },
            Err(_) => parse_text(&value.to_string()),
        },
    }
}

pub fn parse_text(raw: &str) -> ParsedResponse {
    let trimmed = raw.trim();
    if let Ok(response) = serde_json::from_str::<ModelResponse>(trimmed) {
        return ParsedResponse {
            response,
            stage: ParseStage::Direct,
        };
    }
    for candidate in fenced_blocks(trimmed).into_iter().chain(balanced_objects(trimmed)) {
        if let Ok(response) = serde_json::from_str::<ModelResponse>(candidate) {
            tracing::debug!("model response extracted from surrounding text");
            return ParsedResponse {
                response,
                stage: ParseStage::Extracted,
            };
        }
    }
    tracing::warn!(preview = %trimmed.chars().take(120).collect::<String>(), "unstructured model response, using fallback");
    ParsedResponse {
        response: ModelResponse::fallback(trimmed),
        stage: ParseStage::Fallback,
    }
}

/// ```json ... ``` 与 ``` ... ``` 代码块内容
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let header = after[..body_start].trim();
        if !header.is_empty() && !header.eq_ignore_ascii_case("json") {
            // 其他语言的代码块：跳过整个块
            match after[body_start..].find("```") {
                Some(end) => {
                    rest = &after[body_start + end + 3..];
                    continue;
                }
                None => break,
            }
        }
        let body = &after[body_start..];
        match body.find("```") {
            Some(end) => {
                blocks.push(body[..end].trim());
                rest = &body[end + 3..];
            }
            None => {
                blocks.push(body.trim());
                break;
            }
        }
    }
    blocks
}

/// 按起点顺序返回所有括号配平的 {...} 片段（外层在前）
///
/// 单遍扫描，用栈记录未闭合的 `{`；只在对象内部识别字符串，字符串中的括号不计。
fn balanced_objects(text: &str) -> Vec<&str> {
    let mut open: Vec<usize> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if !open.is_empty() => in_string = true,
            '{' => open.push(i),
            '}' => {
                if let Some(start) = open.pop() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }
    spans.sort_unstable_by_key(|&(start, _)| start);
    spans.into_iter().map(|(start, end)| &text[start..end]).collect()
}
