//! 错误记录与分类体系
//!
//! 所有失败最终都落成一个 ErrorRecord（类别 / 严重度 / 稳定错误码 / 建议），
//! 工具层与阶段层把它作为结构化结果返回，只有基础设施级失败才作为致命错误向上抛出。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Timeout,
    FileSystem,
    Permission,
    Validation,
    Parsing,
    System,
    /// 宿主能力（编辑器命令、终端、通知等）报错
    Host,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::Network,
        ErrorCategory::Timeout,
        ErrorCategory::FileSystem,
        ErrorCategory::Permission,
        ErrorCategory::Validation,
        ErrorCategory::Parsing,
        ErrorCategory::System,
        ErrorCategory::Host,
    ];

    /// 默认可重试性：权限与校验错误重试也不会成功
    pub fn default_retryable(self) -> bool {
        !matches!(self, ErrorCategory::Permission | ErrorCategory::Validation)
    }

    pub fn default_severity(self) -> Severity {
        match self {
            ErrorCategory::Validation | ErrorCategory::Parsing => Severity::Low,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::FileSystem
            | ErrorCategory::Host => Severity::Medium,
            ErrorCategory::Permission | ErrorCategory::System => Severity::High,
        }
    }

    pub fn default_code(self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK_ERROR",
            ErrorCategory::Timeout => "TIMEOUT_ERROR",
            ErrorCategory::FileSystem => "FILE_SYSTEM_ERROR",
            ErrorCategory::Permission => "PERMISSION_ERROR",
            ErrorCategory::Validation => "VALIDATION_ERROR",
            ErrorCategory::Parsing => "PARSING_ERROR",
            ErrorCategory::System => "SYSTEM_ERROR",
            ErrorCategory::Host => "HOST_ERROR",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::FileSystem => "file_system",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Parsing => "parsing",
            ErrorCategory::System => "system",
            ErrorCategory::Host => "host",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 严重度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 已分类的失败。构造完成后不再修改，builder 方法按值消费并返回新值。
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub code: String,
    pub context: BTreeMap<String, String>,
    pub recoverable: bool,
    pub retryable: bool,
    pub suggestions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// 按类别默认值构造（严重度、错误码、可重试性）
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let severity = category.default_severity();
        Self {
            message: message.into(),
            category,
            severity,
            code: category.default_code().to_string(),
            context: BTreeMap::new(),
            recoverable: severity != Severity::Critical,
            retryable: category.default_retryable(),
            suggestions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Permission, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Host, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        if severity == Severity::Critical {
            self.recoverable = false;
        }
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        let s = suggestion.into();
        if !self.suggestions.contains(&s) {
            self.suggestions.push(s);
        }
        self
    }

    pub fn with_suggestions<I, S>(self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        suggestions
            .into_iter()
            .fold(self, |rec, s| rec.with_suggestion(s))
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn unrecoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    /// 对外暴露的错误信封（致命错误时返回给调用方）
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            category: self.category,
            code: self.code.clone(),
            message: self.message.clone(),
            suggestions: self.suggestions.clone(),
            recoverable: self.recoverable,
        }
    }
}

/// 致命错误信封：类别、稳定错误码、可读信息、建议、是否可恢复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub recoverable: bool,
}
