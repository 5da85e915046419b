//! Shared helpers for the command-line tools.

use log::LevelFilter;

/// Map `-v` occurrences onto a log level, with the `LOGLEVEL` environment
/// variable as the fallback (WARN when unset).
pub fn select_log_level_filter(verbosity: i32) -> LevelFilter {
    if verbosity > 1 {
        return LevelFilter::Debug;
    }
    if verbosity > 0 {
        return LevelFilter::Info;
    }
    match std::env::var("LOGLEVEL")
        .unwrap_or_default()
        .to_ascii_uppercase()
        .as_str()
    {
        "TRACE" => LevelFilter::Trace,
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "ERROR" => LevelFilter::Error,
        "OFF" => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}

/// Initialize terminal logging on stderr.
pub fn init_logging(verbosity: i32) -> Result<(), log::SetLoggerError> {
    simplelog::TermLogger::init(
        select_log_level_filter(verbosity),
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_wins() {
        assert_eq!(select_log_level_filter(1), LevelFilter::Info);
        assert_eq!(select_log_level_filter(2), LevelFilter::Debug);
        assert_eq!(select_log_level_filter(5), LevelFilter::Debug);
    }
}
