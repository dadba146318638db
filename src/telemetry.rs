//! 日志初始化

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::InfraResult;

/// 初始化结构化日志
///
/// 优先使用 `RUST_LOG` 环境变量，否则使用配置中的级别；`format = "json"` 时输出 JSON。
/// 全局订阅者已经存在时返回错误
pub fn init_logging(config: &LoggingConfig) -> InfraResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow::anyhow!("Invalid log level {}: {}", config.level, e))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()?;
    }

    Ok(())
}
