use crate::configuration::{LogConfig, LogFormat, LogOutput};
use slog::{o, Drain, Logger};
use slog_json::Json;
use slog_logfmt::Logfmt;
use std::io;
use std::sync::Mutex;

/// Builds the supervisor's root logger as configured. Records get
/// written from a background thread.
pub fn root_logger(config: &LogConfig) -> Logger {
    let output: Box<dyn io::Write + Send + Sync> = match config.output {
        LogOutput::Stderr => Box::new(io::stderr()),
        LogOutput::Stdout => Box::new(io::stdout()),
    };
    match config.format {
        LogFormat::Json => {
            let drain = Json::new(output)
                .add_default_keys()
                .build()
                .filter_level(config.level.into())
                .fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("logger" => "zwilling"))
        }
        LogFormat::Logfmt => {
            let mut builder = Logfmt::new(output);
            if !config.print_prefix {
                builder = builder.no_prefix().print_msg(true);
            }
            let drain = builder.build().filter_level(config.level.into()).fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, o!("logger" => "zwilling"))
        }
    }
}

/// Builds a logger for an application process. It writes to stderr
/// synchronously: no background thread that would go missing in a
/// duplicated process.
pub fn process_logger(app: &str) -> Logger {
    let drain = Logfmt::new(io::stderr())
        .no_prefix()
        .print_msg(true)
        .build();
    Logger::root(
        Mutex::new(drain).fuse(),
        o!("logger" => "zwilling-loader", "app" => app.to_string(), "pid" => std::process::id()),
    )
}
