use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};
use std::path::Path;

use anyhow::anyhow;
use chrono::{Duration as ChronoDuration, Local};
use slog::{b, o, Drain, Record, RecordStatic};
use slog_logfmt::Logfmt;

use crate::settings::{self, To};
use crate::Result;

/// Install the global `log` facade backed by an slog logfmt drain.
pub fn logger_init(cfg: &settings::Log) -> Result<()> {
    let level = cfg.level.inner();
    let logger = config_logger(cfg.filename(), cfg.to, level);
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| anyhow!(e))?;
    log::set_max_level(slog_log_to_level(level).to_level_filter());
    Ok(())
}

struct LoggerEx(slog::Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = RecordStatic { location, level, tag: target };
        self.0.log(&Record::new(&s, args, b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();
    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(filename: String, to: To, level: slog::Level) -> slog::Logger {
    let drain = Logfmt::new(RotatingWriter::new(filename, to))
        .set_prefix(move |io: &mut dyn io::Write, rec: &Record| -> slog::Result {
            write!(
                io,
                "{date} {level_str} {module}.{line} | {msg}\t",
                date = Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level_str = rec.level().as_short_str(),
                msg = rec.msg(),
                line = rec.line(),
                module = rec.module(),
            )?;
            Ok(())
        })
        .build()
        .fuse();

    let drain = slog::LevelFilter::new(drain, level).fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    slog::Logger::root(drain, o!())
}

/// File/console writer. The file target rotates on the first write after a
/// calendar-day boundary: the active file is `<stem>-YYYY-MM-DD<ext>` and a
/// new one is opened lazily when the day changes.
struct RotatingWriter {
    filename: String,
    to: To,

    file: Option<File>,
    next_rotate: i64,
    console: Stdout,
}

impl RotatingWriter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, next_rotate: 0, console: io::stdout() }
    }

    fn dated_path(&self) -> String {
        let path = Path::new(&self.filename);
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("noticemq");
        let date = Local::now().format("%Y-%m-%d");
        let name =
            if ext.is_empty() { format!("{stem}-{date}") } else { format!("{stem}-{date}.{ext}") };
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                format!("{}/{}", dir.display(), name)
            }
            _ => name,
        }
    }

    fn next_rotate_time() -> i64 {
        let tomorrow = Local::now().date_naive() + ChronoDuration::days(1);
        tomorrow
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| dt.and_local_timezone(Local).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(i64::MAX)
    }

    fn file(&mut self) -> io::Result<&File> {
        let now = Local::now().timestamp();
        if self.file.is_some() && now >= self.next_rotate {
            self.file = None;
        }
        if self.file.is_none() {
            let path = self.dated_path();
            if let Some(dir) = Path::new(&path).parent() {
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
            }
            self.file = Some(open_file(&path)?);
            self.next_rotate = Self::next_rotate_time();
        }
        match self.file.as_ref() {
            Some(f) => Ok(f),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file unavailable")),
        }
    }
}

impl io::Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.file()?.write(buf)?,
            To::Both => {
                let _ = self.console.write(buf)?;
                self.file()?.write(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush()?,
            To::File => {
                if let Some(f) = self.file.as_mut() {
                    f.flush()?;
                }
            }
            To::Both => {
                self.console.flush()?;
                if let Some(f) = self.file.as_mut() {
                    f.flush()?;
                }
            }
            To::Off => {}
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dated_path() {
        let w = RotatingWriter::new("logs/noticemq.log".into(), To::File);
        let path = w.dated_path();
        assert!(path.starts_with("logs/noticemq-"));
        assert!(path.ends_with(".log"));

        let w = RotatingWriter::new("noticemq.log".into(), To::File);
        let path = w.dated_path();
        assert!(path.starts_with("noticemq-"));
        assert!(!path.contains('/'));
    }

    #[test]
    fn test_next_rotate_is_in_the_future() {
        let next = RotatingWriter::next_rotate_time();
        assert!(next > Local::now().timestamp());
    }

    #[test]
    fn test_file_writer_creates_and_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("app.log");
        let mut w = RotatingWriter::new(base.to_string_lossy().into_owned(), To::File);
        w.write_all(b"hello\n").expect("write");
        w.flush().expect("flush");

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("app-"));
        assert!(entries[0].ends_with(".log"));
    }
}
