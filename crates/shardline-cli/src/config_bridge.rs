//! Bridge from `shardline_config::Config` to telemetry types.

use shardline_config::Config;
use shardline_telemetry::{LogConfig, LogFormat};

/// Convert config to [`LogConfig`].
#[must_use]
pub(crate) fn to_log_config(cfg: &Config) -> LogConfig {
    let format = match cfg.logging.format.as_str() {
        "pretty" => LogFormat::Pretty,
        "json" => LogFormat::Json,
        "full" => LogFormat::Full,
        _ => LogFormat::Compact,
    };

    let mut log_config = LogConfig::new(&cfg.logging.level).with_format(format);

    for directive in &cfg.logging.directives {
        log_config = log_config.with_directive(directive);
    }

    log_config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_format_and_directives() {
        let mut cfg = Config::default();
        cfg.logging.level = "warn".to_owned();
        cfg.logging.format = "json".to_owned();
        cfg.logging.directives = vec!["shardline_gateway=trace".to_owned()];

        let lc = to_log_config(&cfg);
        assert_eq!(lc.level, "warn");
        assert_eq!(lc.format, LogFormat::Json);
        assert_eq!(lc.directives, vec!["shardline_gateway=trace".to_owned()]);
    }

    #[test]
    fn unknown_format_is_compact() {
        let mut cfg = Config::default();
        cfg.logging.format = "fancy".to_owned();
        assert_eq!(to_log_config(&cfg).format, LogFormat::Compact);
    }
}
