//! Weaver - 双智能体开放式深度研究（OEDR）引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、运行状态重建、错误分类
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Scripted）
//! - **search**: Web 搜索提供方（Tavily / DuckDuckGo）
//! - **fetch**: 网页抓取与正文提取
//! - **bank**: 证据库（Memory Bank）：追加式 JSONL + 内容哈希去重
//! - **protocol**: 智能体动作标签语法的解析与纠错
//! - **outline**: 大纲 AST 与 Markdown 往返、引用校验
//! - **journal**: 事件日志（追加式 JSONL），重放与续跑的基础
//! - **agents**: Planner（搜索 + 大纲迭代）与 Writer（按节写作）
//! - **judge**: 大纲质量评审（外部协作者，尽力而为）

pub mod agents;
pub mod bank;
pub mod config;
pub mod core;
pub mod fetch;
pub mod journal;
pub mod judge;
pub mod llm;
pub mod outline;
pub mod protocol;
pub mod search;
