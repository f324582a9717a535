//! 日志初始化
//!
//! `RUST_LOG` 优先于配置中的级别。重复初始化不会报错，方便测试和嵌入方调用。

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::LogConfig;

/// 构造过滤器：环境变量优先，其次配置级别
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// 安装全局 tracing subscriber，返回是否由本次调用完成安装
pub fn init(config: &LogConfig) -> bool {
    let filter = env_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: "debug".to_string(),
            json: false,
        };
        init(&config);
        assert!(!init(&config));
    }
}
