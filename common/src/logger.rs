use std::str::FromStr;

use redox_log::{OutputBuilder, RedoxLogger};

/// Default console level, overridable per driver through its configuration.
pub fn output_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// Parse a level name such as `"debug"`, falling back to `default` for unknown names.
pub fn parse_level(name: &str, default: log::LevelFilter) -> log::LevelFilter {
    log::LevelFilter::from_str(name).unwrap_or(default)
}

/// Configures logging for a single driver.
///
/// Returns `false` if a logger had already been installed for this process, in which case the
/// existing one stays in place.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> bool {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    match OutputBuilder::in_redox_logging_scheme(
        category,
        subcategory,
        format!("{logfile_base}.log"),
    ) {
        Ok(b) => {
            logger = logger.with_output(b.with_filter(file_level).flush_on_newline(true).build())
        }
        Err(error) => eprintln!("Failed to create {logfile_base}.log: {}", error),
    }

    logger.enable().is_ok()
}
