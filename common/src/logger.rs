use std::fs::{create_dir, metadata};
use std::path::Path;
use std::sync::Arc;

use fern::{DateBased, Dispatch};
use log::LevelFilter;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error(transparent)]
    LogError(#[from] log::SetLoggerError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Installs the process-wide logger.
///
/// Mirrors the teacher's `fern`-based setup: a level filter, a format that
/// prints level/file/message, stdout always chained, and an optional
/// date-rotated file sink. Noisy third-party crates used by the GPU-interop
/// backends are held to `Warn` so a `Trace`-level capture session stays
/// readable.
pub fn init_logger(level: LevelFilter, path: Option<&Path>) -> Result<(), LoggerInitError> {
    let mut logger = Dispatch::new()
        .level(level)
        .level_for("wgpu", LevelFilter::Warn)
        .level_for("wgpu_core", LevelFilter::Warn)
        .level_for("wgpu_hal", LevelFilter::Warn)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}] - ({}) - {}",
                record.level(),
                record.file_static().unwrap_or("*"),
                message
            ))
        })
        .chain(std::io::stdout())
        .chain(Box::new(CallbackLogger) as Box<dyn log::Log>);

    if let Some(path) = path {
        if metadata(path).is_err() {
            create_dir(path)?;
        }

        logger = logger.chain(DateBased::new(
            path.to_string_lossy().to_string(),
            "%Y-%m-%d-miniav.log",
        ));
    }

    logger.apply()?;
    Ok(())
}

/// Installs a panic hook that routes panic messages through `log::error!`
/// instead of only writing to stderr, so a host application's log sink (file,
/// syslog, the process-global callback below) sees capture-thread panics
/// too.
pub fn enable_panic_logger() {
    std::panic::set_hook(Box::new(|info| {
        log::error!(
            "panic: location={:?}, message={:?}",
            info.location(),
            info.payload()
                .downcast_ref::<&str>()
                .map(|it| Some(it.to_string()))
                .unwrap_or_else(|| info.payload().downcast_ref::<String>().cloned())
        );
    }));
}

type Callback = Arc<dyn Fn(log::Level, &str) + Send + Sync>;

static LOG_CALLBACK: RwLock<Option<Callback>> = RwLock::new(None);

/// Installs the process-global log callback described by the external
/// interface: `(level, utf8_message, user_data)`, invoked synchronously from
/// whichever core thread produced the log line (a producer thread, the
/// calling thread during `Configure`/`Start`, etc).
///
/// The callback itself must be reentrant and must not block, since it may be
/// called from inside a capture callback's call stack. Only one callback is
/// installed at a time; installing a new one replaces the previous one.
pub fn set_log_callback<F>(callback: F)
where
    F: Fn(log::Level, &str) + Send + Sync + 'static,
{
    LOG_CALLBACK.write().replace(Arc::new(callback));
}

/// Removes any installed log callback.
pub fn clear_log_callback() {
    LOG_CALLBACK.write().take();
}

/// A `log::Log` sink that fans every record out to the installed callback,
/// if any. Chained onto the `fern::Dispatch` in [`init_logger`] so the same
/// `log::info!`/`log::warn!`/`log::error!` call sites throughout the core
/// serve both a normal stdout/file setup and a future C-binding layer that
/// wants log lines delivered through a function pointer.
struct CallbackLogger;

impl log::Log for CallbackLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if let Some(callback) = LOG_CALLBACK.read().as_ref() {
            callback(record.level(), &format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_receives_dispatched_records() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();

        set_log_callback(move |_level, _message| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let logger = CallbackLogger;
        log::logger();
        let record = log::Record::builder()
            .args(format_args!("hello"))
            .level(log::Level::Info)
            .build();
        log::Log::log(&logger, &record);

        assert_eq!(count.load(Ordering::SeqCst), 1);

        clear_log_callback();
    }
}
