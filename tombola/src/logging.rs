pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Build the process root logger, writing to stderr at the supplied level.
/// The level string has already been validated by the configuration layer, so
/// a failure here is a programming error.
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("logger configuration must parse");

    config.build_logger().expect("logger construction failed")
}

/// Logger that drops every record.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
