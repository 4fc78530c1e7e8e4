use anyhow::{Context, Result};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use std::{collections::VecDeque, env::var, fs::create_dir_all, io, path::Path, sync::Arc};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, fmt::MakeWriter, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

pub const LOG_LEVEL_ENV_VAR: &str = "PATCH_POSTURE_LOG_LEVEL";
const DEFAULT_LOG_SPEC: &str = "info";
const LOG_FILE_NAME: &str = "patch_posture.log";
const MAX_LOG_LINES: usize = 20000;

// Hardware identifiers end up in bug reports, mask them
const SENSITIVE_KEYWORDS: [&str; 6] = ["serial", "board-id", "uuid", "MLB", "system-id", "device_id"];

lazy_static! {
    static ref SENSITIVE_PATTERNS: Vec<Regex> = SENSITIVE_KEYWORDS
        .iter()
        .filter_map(|keyword| keyword_pattern(keyword).ok())
        .collect();
}

fn keyword_pattern(keyword: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(
        r#"(?P<key>"?(\b{})"?\s*[:=]?\s*)("(?P<val1>[^"]+)"|(?P<val2>\b[^\s",}}]+))"#,
        regex::escape(keyword)
    ))
}

pub struct MemoryWriterData {
    logs: VecDeque<String>,
    lines: usize,
    to_take: usize,
}

impl MemoryWriterData {
    pub fn new() -> Self {
        Self {
            logs: VecDeque::new(),
            lines: 0,
            to_take: 0,
        }
    }
}

impl Default for MemoryWriterData {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps the latest log lines in memory for the front end, newest first.
#[derive(Clone)]
pub struct MemoryWriter {
    data: Arc<Mutex<MemoryWriterData>>,
}

impl MemoryWriter {
    pub fn new(data: Arc<Mutex<MemoryWriterData>>) -> Self {
        Self { data }
    }

    fn sanitize_keywords(input: &str, patterns: &[Regex]) -> String {
        let mut output = input.to_string();

        for re in patterns {
            output = re
                .replace_all(&output, |caps: &regex::Captures| {
                    let key = &caps["key"];
                    let val1 = caps.name("val1").map_or("", |m| m.as_str());
                    let val2 = caps.name("val2").map_or("", |m| m.as_str());
                    let val = if !val1.is_empty() { val1 } else { val2 };
                    let quotes = if !val1.is_empty() { "\"" } else { "" };

                    format!("{}{}{}{}", key, quotes, "*".repeat(val.len()), quotes)
                })
                .to_string();
        }

        output
    }

    fn push_line(&self, line: &str) {
        let line = Self::sanitize_keywords(line.trim_end(), &SENSITIVE_PATTERNS);
        let mut locked_data = self.data.lock();

        // If we have more than MAX_LOG_LINES, remove the oldest one
        if locked_data.logs.len() >= MAX_LOG_LINES {
            locked_data.logs.pop_back();
            locked_data.lines -= 1;
        }

        locked_data.logs.push_front(line);
        if locked_data.lines < MAX_LOG_LINES {
            locked_data.lines += 1;
        }
        if locked_data.to_take < MAX_LOG_LINES {
            locked_data.to_take += 1;
        }
    }
}

impl io::Write for MemoryWriter {
    // The fmt layer hands over one formatted event per write
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push_line(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MemoryWriter {
    type Writer = MemoryWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

pub struct PostureLogger {
    memory_writer_data: Arc<Mutex<MemoryWriterData>>,
    filter_handle: reload::Handle<EnvFilter, Registry>,
    // Flushes the file writer when dropped
    _file_guard: Option<WorkerGuard>,
}

impl PostureLogger {
    pub fn set_log_spec(&self, spec: &str) -> Result<()> {
        let filter = EnvFilter::try_new(spec).with_context(|| format!("Invalid log spec {:?}", spec))?;
        self.filter_handle
            .reload(filter)
            .context("Failed to apply the new log spec")?;
        info!("Log spec set to {}", spec);
        Ok(())
    }

    pub fn get_new_logs(&self) -> String {
        let mut locked_data = self.memory_writer_data.lock();
        let new_logs: String = locked_data
            .logs
            .iter()
            .take(locked_data.to_take)
            .fold(String::new(), |acc, x| format!("{}\n{}", acc, x));
        locked_data.to_take = 0;
        new_logs
    }

    pub fn get_all_logs(&self) -> String {
        let locked_data = self.memory_writer_data.lock();
        locked_data
            .logs
            .iter()
            .fold(String::new(), |acc, x| format!("{}\n{}", acc, x))
    }
}

/// Installs the global subscriber: stdout, the in-memory buffer and, when
/// `log_dir` is given, a log file. Fails if a subscriber is already set.
pub fn init_logger(log_dir: Option<&Path>) -> Result<PostureLogger> {
    let memory_writer_data = Arc::new(Mutex::new(MemoryWriterData::new()));

    let log_spec = var(LOG_LEVEL_ENV_VAR).unwrap_or_else(|_| DEFAULT_LOG_SPEC.to_string());
    let filter = EnvFilter::try_new(&log_spec)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_SPEC))
        .context("Failed to build the log filter")?;
    let (filter, filter_handle) = reload::Layer::new(filter);

    let (file_layer, file_guard) = match log_dir {
        Some(dir) => {
            create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE_NAME));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stdout))
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(MemoryWriter::new(memory_writer_data.clone())),
        )
        .with(file_layer)
        .try_init()
        .context("Logger already initialized")?;

    info!("Logger initialized with spec {}", log_spec);

    Ok(PostureLogger {
        memory_writer_data,
        filter_handle,
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tracing::{debug, warn};

    #[test]
    fn test_memory_writer_initialization() {
        let data = Arc::new(Mutex::new(MemoryWriterData::new()));
        let writer = MemoryWriter::new(data.clone());

        assert!(writer.data.lock().logs.is_empty());
    }

    #[test]
    fn test_log_sanitization() {
        let test_log = r#"{"serial": "C02XK0AAJGH5", "model": "iMac12,2"}"#;
        let sanitized_log = MemoryWriter::sanitize_keywords(test_log, &SENSITIVE_PATTERNS);

        assert_eq!(sanitized_log, r#"{"serial": "************", "model": "iMac12,2"}"#);
    }

    #[test]
    fn test_log_sanitization_unquoted() {
        let sanitized_log =
            MemoryWriter::sanitize_keywords("board-id=Mac-F2268DC8 reported", &SENSITIVE_PATTERNS);
        assert_eq!(sanitized_log, "board-id=************ reported");
    }

    #[test]
    fn test_log_storage_in_memory_writer() {
        let data = Arc::new(Mutex::new(MemoryWriterData::new()));
        let mut writer = MemoryWriter::new(data.clone());

        writer.write_all(b"first line\n").unwrap();
        writer.write_all(b"second line\n").unwrap();

        let locked_data = data.lock();
        assert_eq!(locked_data.logs.len(), 2);
        // Latest first
        assert_eq!(locked_data.logs[0], "second line");
        assert_eq!(locked_data.to_take, 2);
    }

    #[test]
    fn test_memory_writer_is_bounded() {
        let data = Arc::new(Mutex::new(MemoryWriterData::new()));
        let mut writer = MemoryWriter::new(data.clone());

        for i in 0..MAX_LOG_LINES + 10 {
            writer.write_all(format!("line {}\n", i).as_bytes()).unwrap();
        }

        let locked_data = data.lock();
        assert_eq!(locked_data.logs.len(), MAX_LOG_LINES);
        assert_eq!(locked_data.lines, MAX_LOG_LINES);
        assert_eq!(locked_data.logs[0], format!("line {}", MAX_LOG_LINES + 9));
    }

    // Can only be called once per process
    #[test]
    #[serial]
    fn test_logger_initialization() {
        let log_dir = std::env::temp_dir().join(format!("patch_posture_logs_{}", std::process::id()));
        let logger = init_logger(Some(&log_dir)).expect("first initialization");

        warn!("csr-active-config unreadable, serial=C02XK0AAJGH5");
        let new_logs = logger.get_new_logs();
        assert!(new_logs.contains("csr-active-config unreadable"));
        assert!(!new_logs.contains("C02XK0AAJGH5"));
        assert!(logger.get_all_logs().contains("csr-active-config unreadable"));

        logger.set_log_spec("debug").unwrap();
        debug!("now visible");
        assert!(logger.get_new_logs().contains("now visible"));
        assert!(logger.set_log_spec("patch_posture=loudest").is_err());

        assert!(init_logger(None).is_err());
    }
}
