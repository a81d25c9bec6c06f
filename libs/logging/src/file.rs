//! Date-stamped, size-rotated file logging.
//!
//! Two streams are written under the log directory: `<base>_<date>.log`
//! with every record that passes the file filter, and `error_<date>.log`
//! with errors only. When a file grows past the rotation threshold it is
//! shifted to `.1`, existing backups move down, and anything beyond the
//! backup count is deleted.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, fmt};

use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{registry::LookupSpan, Layer};

/// How many lines the non-blocking writer buffers before dropping.
/// Bursts only; the background thread drains continuously.
const MAX_BUFFERED_LINES: usize = 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    pub directory: PathBuf,
    pub rotation_bytes: u64,
    pub backup_count: usize,
}

/// Create the file logging layer.
///
/// Returns the layer plus a [`Handle`] owning the writer guards. The
/// handle MUST be kept alive for as long as log lines should reach disk.
pub fn layer<T>(settings: Settings, base_name: &'static str) -> (Box<dyn Layer<T> + Send + Sync + 'static>, Handle)
where
    T: Subscriber + for<'a> LookupSpan<'a>,
{
    let (all_writer, all_guard) = new_appender(settings.clone(), base_name);
    let (error_writer, error_guard) = new_appender(settings, "error");

    let all_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(all_writer)
        .boxed();
    let error_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(error_writer)
        .with_filter(LevelFilter::ERROR)
        .boxed();

    let layers: Vec<Box<dyn Layer<T> + Send + Sync + 'static>> = vec![all_layer, error_layer];

    let handle = Handle {
        _guards: Arc::new([all_guard, error_guard]),
    };

    (Box::new(layers), handle)
}

fn new_appender(settings: Settings, base_name: &'static str) -> (NonBlocking, WorkerGuard) {
    tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(MAX_BUFFERED_LINES)
        .finish(Appender {
            settings,
            base_name,
            current: None,
        })
}

/// A handle to the file logger.
///
/// Houses the [`WorkerGuard`]s of the non-blocking appenders; dropping it
/// stops log lines from reaching the files.
#[must_use]
#[derive(Clone)]
pub struct Handle {
    _guards: Arc<[WorkerGuard; 2]>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

struct Appender {
    settings: Settings,
    base_name: &'static str,
    // Kept open between writes; errors surface through `write` instead of
    // panicking inside the layer.
    current: Option<(fs::File, PathBuf, u64)>,
}

impl Appender {
    fn target_path(&self) -> PathBuf {
        let format = time::macros::format_description!("[year]-[month]-[day]");
        let date = time::OffsetDateTime::now_utc()
            .date()
            .format(&format)
            .unwrap_or_else(|_| "unknown-date".to_owned());

        self.settings
            .directory
            .join(format!("{}_{date}.log", self.base_name))
    }

    fn open(&self, path: &Path) -> io::Result<(fs::File, u64)> {
        fs::create_dir_all(&self.settings.directory)?;
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok((file, len))
    }

    /// Shift `path` -> `path.1`, `path.1` -> `path.2`, ... dropping backups
    /// beyond the configured count.
    fn rotate(&self, path: &Path) -> io::Result<()> {
        let backups = self.settings.backup_count;

        let numbered = |n: usize| PathBuf::from(format!("{}.{n}", path.display()));

        if backups == 0 {
            return fs::remove_file(path);
        }

        let oldest = numbered(backups);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..backups).rev() {
            let from = numbered(n);
            if from.exists() {
                fs::rename(&from, numbered(n + 1))?;
            }
        }
        fs::rename(path, numbered(1))
    }

    fn with_current_file<R>(
        &mut self,
        cb: impl FnOnce(&mut fs::File) -> io::Result<R>,
    ) -> io::Result<R> {
        let target = self.target_path();

        // Reopen on the first write and across midnight.
        let stale = match &self.current {
            Some((_, path, _)) => *path != target,
            None => true,
        };
        if stale {
            let (file, len) = self.open(&target)?;
            self.current = Some((file, target.clone(), len));
        }

        let over_limit = self
            .current
            .as_ref()
            .is_some_and(|(_, _, written)| *written >= self.settings.rotation_bytes);
        if over_limit {
            self.rotate(&target)?;
            let (file, len) = self.open(&target)?;
            self.current = Some((file, target, len));
        }

        let (file, _, _) = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::other("no open log file"))?;

        cb(file)
    }
}

impl io::Write for Appender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use std::io::Write as _;

        self.with_current_file(|file| file.write_all(buf))?;
        if let Some((_, _, written)) = self.current.as_mut() {
            *written += buf.len() as u64;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        use std::io::Write as _;

        match self.current.as_mut() {
            Some((file, _, _)) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn appender(dir: &Path, rotation_bytes: u64, backup_count: usize) -> Appender {
        Appender {
            settings: Settings {
                directory: dir.to_owned(),
                rotation_bytes,
                backup_count,
            },
            base_name: "robolink",
            current: None,
        }
    }

    #[test]
    fn writes_date_stamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut appender = appender(dir.path(), 1024, 3);

        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("robolink_"));
        assert!(entries[0].ends_with(".log"));
    }

    #[test]
    fn rotates_once_past_the_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut appender = appender(dir.path(), 8, 3);

        appender.write_all(b"0123456789\n").unwrap();
        // Second write sees the file over the limit and rotates first.
        appender.write_all(b"fresh\n").unwrap();
        appender.flush().unwrap();

        let target = appender.target_path();
        let backup = PathBuf::from(format!("{}.1", target.display()));

        assert_eq!(fs::read_to_string(&backup).unwrap(), "0123456789\n");
        assert_eq!(fs::read_to_string(&target).unwrap(), "fresh\n");
    }

    #[test]
    fn prunes_backups_beyond_the_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut appender = appender(dir.path(), 4, 1);

        for chunk in ["aaaaaa\n", "bbbbbb\n", "cccccc\n"] {
            appender.write_all(chunk.as_bytes()).unwrap();
        }
        appender.flush().unwrap();

        let target = appender.target_path();
        let first = PathBuf::from(format!("{}.1", target.display()));
        let second = PathBuf::from(format!("{}.2", target.display()));

        assert!(first.exists());
        assert!(!second.exists(), "only one backup should be kept");
    }
}
