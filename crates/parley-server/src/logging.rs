//! 日志初始化

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `level` accepts anything `EnvFilter` does, e.g. `info` or
/// `parley_gateway=debug,info`.
pub fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

/// Span wrapping everything one WebSocket client does
pub fn connection_span(user_id: &str) -> Span {
    tracing::info_span!(
        "connection",
        user_id = %user_id,
        connection_id = tracing::field::Empty
    )
}
