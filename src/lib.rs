//! TaskFlow - 自主任务执行编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与重试、恢复计划、编排器构建与 execute 入口
//! - **llm**: 模型传输抽象与实现（OpenAI 兼容 / 脚本化）
//! - **observability**: 日志初始化与运行指标
//! - **phase**: 阶段状态机（响应解析、prompt、阶段处理器、过程事件）
//! - **session**: 会话与上下文管理
//! - **todo**: TODO 生命周期
//! - **tools**: 工具网关、宿主能力与本地适配器
//! - **verification**: 校验闸门（自动审批、超时、历史）

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod phase;
pub mod session;
pub mod todo;
pub mod tools;
pub mod verification;

pub use crate::core::{ExecuteRequest, ExecuteResponse, ExecutionResult, Orchestrator, OrchestratorBuilder};
