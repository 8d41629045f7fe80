use fern::colors::{Color, ColoredLevelConfig};
use link::config::LoggingConfig;
use log::LevelFilter;
use std::fs::OpenOptions;

pub fn setup_logger(config: &LoggingConfig) -> Result<(), log::SetLoggerError> {
    let log_level = match config.level().to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };

    let colors = ColoredLevelConfig::new()
        .trace(Color::BrightBlack)
        .debug(Color::BrightBlue)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    let base_config = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(log_level);

    match config.file() {
        Some(file_path) => match OpenOptions::new().create(true).append(true).open(file_path) {
            Ok(file) => {
                base_config.chain(file).apply()?;
                println!("Logging to file: {file_path}");
            }
            Err(e) => {
                eprintln!("Warning: Failed to open log file '{file_path}': {e}");
                base_config.chain(std::io::stderr()).apply()?;
            }
        },
        None => base_config.chain(std::io::stderr()).apply()?,
    }

    log::info!("Logger initialized with level: {}", config.level());
    Ok(())
}
