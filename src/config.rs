//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WEAVER__*` 覆盖（双下划线表示嵌套，
//! 如 `WEAVER__PLANNER__MAX_STEPS=8`）。密钥类配置不进 TOML，仅从专用环境变量读取：
//! `LLM_API_KEY` / `LLM_BASE_URL` / `LLM_MODEL` / `SEARCH_API_KEY` / `SEARCH_PROVIDER` / `ARTIFACTS_DIR`。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub writer: WriterSection,
    #[serde(default)]
    pub run: RunSection,
}

/// [llm] 段：模型名、端点与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    /// OpenAI 兼容端点；未设置时用官方端点，可被 LLM_BASE_URL 覆盖
    pub base_url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_llm_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_llm_max_retries() -> u32 {
    3
}

fn default_llm_backoff_ms() -> u64 {
    750
}

fn default_llm_max_backoff_ms() -> u64 {
    8_000
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
            retry_backoff_ms: default_llm_backoff_ms(),
            retry_max_backoff_ms: default_llm_max_backoff_ms(),
        }
    }
}

/// [search] 段：提供方选择与 Tavily 重试参数
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    /// tavily / duckduckgo；可被环境变量 SEARCH_PROVIDER 覆盖
    #[serde(default = "default_search_provider")]
    pub provider: String,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_search_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_search_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_search_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "default_tavily_base_url")]
    pub tavily_base_url: String,
    /// basic / advanced
    #[serde(default = "default_search_depth")]
    pub search_depth: String,
}

fn default_search_provider() -> String {
    "tavily".to_string()
}

fn default_search_max_results() -> usize {
    10
}

fn default_search_timeout_secs() -> u64 {
    30
}

fn default_search_max_retries() -> u32 {
    3
}

fn default_search_backoff_ms() -> u64 {
    750
}

fn default_search_max_backoff_ms() -> u64 {
    8_000
}

fn default_tavily_base_url() -> String {
    "https://api.tavily.com".to_string()
}

fn default_search_depth() -> String {
    "basic".to_string()
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            max_results: default_search_max_results(),
            timeout_secs: default_search_timeout_secs(),
            max_retries: default_search_max_retries(),
            retry_backoff_ms: default_search_backoff_ms(),
            retry_max_backoff_ms: default_search_max_backoff_ms(),
            tavily_base_url: default_tavily_base_url(),
            search_depth: default_search_depth(),
        }
    }
}

/// [fetch] 段：网页抓取的超时、并发与正文门限
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    /// 单次 Search 动作内的抓取并发上限
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,
    /// 瞬时失败（超时 / 5xx）的重试次数
    #[serde(default = "default_fetch_max_retries")]
    pub max_retries: u32,
    /// 正文短于此字符数的页面直接丢弃
    #[serde(default = "default_min_body_chars")]
    pub min_body_chars: usize,
    #[serde(default = "default_max_page_chars")]
    pub max_page_chars: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_fetch_concurrency() -> usize {
    6
}

fn default_fetch_max_retries() -> u32 {
    2
}

fn default_min_body_chars() -> usize {
    200
}

fn default_max_page_chars() -> usize {
    25_000
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
        .to_string()
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            concurrency: default_fetch_concurrency(),
            max_retries: default_fetch_max_retries(),
            min_body_chars: default_min_body_chars(),
            max_page_chars: default_max_page_chars(),
            user_agent: default_user_agent(),
        }
    }
}

/// [planner] 段：规划循环的步数、预算与停滞判定
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerSection {
    #[serde(default = "default_planner_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_queries_per_step")]
    pub max_queries_per_step: usize,
    #[serde(default = "default_max_urls_per_query")]
    pub max_urls_per_query: usize,
    /// 连续多少步既无新证据也无大纲变化即判定停滞
    #[serde(default = "default_stagnation_limit")]
    pub stagnation_limit: usize,
    /// 就绪判定的最小证据数（只用于提示，不会自动终止）
    #[serde(default = "default_min_evidence")]
    pub min_evidence: usize,
    /// 证据总量预算，达到后强制终止规划
    #[serde(default = "default_max_evidence")]
    pub max_evidence: usize,
    /// 单步内动作解析失败的重试预算
    #[serde(default = "default_protocol_retries")]
    pub max_retries: usize,
}

fn default_planner_max_steps() -> usize {
    12
}

fn default_max_queries_per_step() -> usize {
    4
}

fn default_max_urls_per_query() -> usize {
    4
}

fn default_stagnation_limit() -> usize {
    3
}

fn default_min_evidence() -> usize {
    5
}

fn default_max_evidence() -> usize {
    60
}

fn default_protocol_retries() -> usize {
    3
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_steps: default_planner_max_steps(),
            max_queries_per_step: default_max_queries_per_step(),
            max_urls_per_query: default_max_urls_per_query(),
            stagnation_limit: default_stagnation_limit(),
            min_evidence: default_min_evidence(),
            max_evidence: default_max_evidence(),
            max_retries: default_protocol_retries(),
        }
    }
}

/// [writer] 段：写作层级、每节预算与证据复用策略
#[derive(Debug, Clone, Deserialize)]
pub struct WriterSection {
    /// 在大纲的哪一级标题上切分章节（默认 H2）
    #[serde(default = "default_write_level")]
    pub write_level: u8,
    #[serde(default = "default_max_steps_per_section")]
    pub max_steps_per_section: usize,
    #[serde(default = "default_section_max_chars")]
    pub section_max_chars: usize,
    #[serde(default = "default_retrieve_top_k")]
    pub retrieve_top_k: usize,
    #[serde(default = "default_section_max_evidences")]
    pub section_max_evidences: usize,
    #[serde(default = "default_items_per_evidence")]
    pub items_per_evidence: usize,
    #[serde(default = "default_tool_response_max_chars")]
    pub tool_response_max_chars: usize,
    /// 是否允许通过显式 citation_ids 复用已被其它章节消费的证据
    #[serde(default = "default_allow_reuse")]
    pub allow_reuse: bool,
    #[serde(default = "default_protocol_retries")]
    pub max_retries: usize,
}

fn default_write_level() -> u8 {
    2
}

fn default_max_steps_per_section() -> usize {
    18
}

fn default_section_max_chars() -> usize {
    20_000
}

fn default_retrieve_top_k() -> usize {
    12
}

fn default_section_max_evidences() -> usize {
    12
}

fn default_items_per_evidence() -> usize {
    8
}

fn default_tool_response_max_chars() -> usize {
    25_000
}

fn default_allow_reuse() -> bool {
    true
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            write_level: default_write_level(),
            max_steps_per_section: default_max_steps_per_section(),
            section_max_chars: default_section_max_chars(),
            retrieve_top_k: default_retrieve_top_k(),
            section_max_evidences: default_section_max_evidences(),
            items_per_evidence: default_items_per_evidence(),
            tool_response_max_chars: default_tool_response_max_chars(),
            allow_reuse: default_allow_reuse(),
            max_retries: default_protocol_retries(),
        }
    }
}

/// [run] 段：产物目录与全局时钟预算
#[derive(Debug, Clone, Deserialize)]
pub struct RunSection {
    /// 运行产物根目录；可被 ARTIFACTS_DIR 覆盖
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    /// 整次运行的墙钟预算（秒），0 表示不限制
    #[serde(default = "default_wall_clock_secs")]
    pub wall_clock_secs: u64,
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_wall_clock_secs() -> u64 {
    0
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            artifacts_dir: default_artifacts_dir(),
            wall_clock_secs: default_wall_clock_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 WEAVER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 WEAVER__*（双下划线表示嵌套键）
/// 4. 最后应用专用环境变量：SEARCH_PROVIDER、ARTIFACTS_DIR
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WEAVER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;

    if let Ok(provider) = std::env::var("SEARCH_PROVIDER") {
        if !provider.is_empty() {
            cfg.search.provider = provider;
        }
    }
    if let Ok(dir) = std::env::var("ARTIFACTS_DIR") {
        if !dir.is_empty() {
            cfg.run.artifacts_dir = PathBuf::from(dir);
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_app_config() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.planner.max_steps, 12);
        assert_eq!(cfg.writer.write_level, 2);
        assert!(cfg.writer.allow_reuse);
        assert_eq!(cfg.search.provider, "tavily");
    }
}
