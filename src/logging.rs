use chrono::Utc;
use slog::Drain;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// LevelSwitch is the process-wide log verbosity, shared between the drain that filters on it
/// and whoever is allowed to change it (the coordinator, on `set_log_level`).
#[derive(Clone)]
pub struct LevelSwitch {
    level: Arc<AtomicUsize>,
}

impl LevelSwitch {
    pub fn new(initial: slog::Level) -> Self {
        LevelSwitch {
            level: Arc::new(AtomicUsize::new(initial.as_usize())),
        }
    }

    pub fn level(&self) -> slog::Level {
        // Only ever stores values produced by `Level::as_usize()`.
        slog::Level::from_usize(self.level.load(Ordering::Acquire)).unwrap_or(slog::Level::Info)
    }

    pub fn set(&self, level: slog::Level) {
        self.level.store(level.as_usize(), Ordering::Release);
    }
}

impl Default for LevelSwitch {
    fn default() -> Self {
        LevelSwitch::new(slog::Level::Info)
    }
}

impl fmt::Debug for LevelSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LevelSwitch({})", level_name(self.level()))
    }
}

/// Parses the level names operators send in `set_log_level` commands.
pub fn parse_level(name: &str) -> Option<slog::Level> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(slog::Level::Trace),
        "debug" => Some(slog::Level::Debug),
        "info" => Some(slog::Level::Info),
        "warn" | "warning" => Some(slog::Level::Warning),
        "error" => Some(slog::Level::Error),
        "fatal" | "critical" => Some(slog::Level::Critical),
        _ => None,
    }
}

pub fn level_name(level: slog::Level) -> &'static str {
    match level {
        slog::Level::Trace => "trace",
        slog::Level::Debug => "debug",
        slog::Level::Info => "info",
        slog::Level::Warning => "warn",
        slog::Level::Error => "error",
        slog::Level::Critical => "fatal",
    }
}

/// Drops records below whatever level the `LevelSwitch` currently holds.
pub struct RuntimeLevelFilter<D> {
    drain: D,
    switch: LevelSwitch,
}

impl<D> RuntimeLevelFilter<D> {
    pub fn new(drain: D, switch: LevelSwitch) -> Self {
        RuntimeLevelFilter { drain, switch }
    }
}

impl<D: Drain> Drain for RuntimeLevelFilter<D> {
    type Ok = ();
    type Err = D::Err;

    fn log(&self, record: &slog::Record, values: &slog::OwnedKVList) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.switch.level()) {
            self.drain.log(record, values).map(|_| ())
        } else {
            Ok(())
        }
    }
}

pub fn create_root_logger_for_stdout(switch: LevelSwitch, worker_tag: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = RuntimeLevelFilter::new(drain, switch);

    slog::Logger::root(drain, slog::o!("Worker" => worker_tag))
}

pub fn create_root_logger_for_file(
    switch: LevelSwitch,
    directory_prefix: &str,
    worker_tag: String,
) -> Result<slog::Logger, io::Error> {
    let now = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let log_path = format!("{}/{}_{}_info.log", directory_prefix, worker_tag, now);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;

    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = RuntimeLevelFilter::new(drain, switch);

    Ok(slog::Logger::root(drain, slog::o!("Worker" => worker_tag)))
}

pub fn discard_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
