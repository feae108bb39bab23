//! Polling tail-diff over the access log.
//!
//! Every tick the tailer asks its [`ScanStrategy`] for the grammar-matching
//! lines of the log, forwards the ones beyond `last_line_count`, and records
//! the new count. The count is the only state carried between ticks:
//!
//! ```text
//!   tick n:   [ l0 l1 l2 ]            last_line_count = 3
//!   tick n+1: [ l0 l1 l2 l3 l4 ]      forward l3, l4; last_line_count = 5
//!   tick n+2: [ ]                     last_line_count = 0
//! ```
//!
//! Only newline-terminated lines are counted, so a line the web server is
//! still writing is picked up on a later tick once it is complete.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs::File;
use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{LogConfig, ScanKind};
use crate::parser;

/// Downstream stage that receives each newly observed raw line.
#[async_trait]
pub trait LineForwarder: Send {
    /// Runs at the start of every tick, before any line is forwarded.
    async fn begin_tick(&mut self) -> Result<()> {
        Ok(())
    }

    async fn forward(&mut self, line: &str) -> Result<()>;
}

/// Result of one scan: the total number of matching lines, and the matching
/// lines whose index is at or beyond the requested `seen` count.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Scan {
    pub total: usize,
    pub fresh: Vec<String>,
}

pub trait ScanStrategy: Send {
    fn scan(&mut self, path: &Path, seen: usize) -> Result<Scan>;
}

/// Newline-terminated lines of `content`, without their terminators.
fn complete_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .split_inclusive('\n')
        .filter(|line| line.ends_with('\n'))
        .map(|line| line.trim_end_matches(['\r', '\n']))
}

/// Re-reads and re-matches the whole file on every scan.
///
/// `total` counts newline-terminated matching lines only. A last line
/// without its `\n` is not counted until the newline arrives, unlike a plain
/// match over the whole content.
#[derive(Debug, Default)]
pub struct FullRescan;

impl ScanStrategy for FullRescan {
    fn scan(&mut self, path: &Path, seen: usize) -> Result<Scan> {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let content = String::from_utf8_lossy(&bytes);

        let lines: Vec<&str> = complete_lines(&content)
            .filter(|line| parser::is_match(line))
            .collect();

        let fresh = lines
            .get(seen..)
            .map(|rest| rest.iter().map(|l| l.to_string()).collect())
            .unwrap_or_default();

        Ok(Scan {
            total: lines.len(),
            fresh,
        })
    }
}

/// Reads only the bytes appended since the last consumed newline.
///
/// Keeps a running match count so `total` means the same thing as in
/// [`FullRescan`]. Lines not yet acknowledged by a larger `seen` stay in a
/// backlog and are returned again.
#[derive(Debug, Default)]
pub struct OffsetScan {
    offset: u64,
    count: usize,
    backlog: Vec<(usize, String)>,
}

impl ScanStrategy for OffsetScan {
    fn scan(&mut self, path: &Path, seen: usize) -> Result<Scan> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata()?.len();

        if len < self.offset {
            warn!(path = %path.display(), "log shrank; restarting from the beginning");
            *self = Self::default();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let consumed = buf
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let content = String::from_utf8_lossy(&buf[..consumed]);

        for line in complete_lines(&content) {
            if parser::is_match(line) {
                self.backlog.push((self.count, line.to_string()));
                self.count += 1;
            }
        }
        self.offset += consumed as u64;

        self.backlog.retain(|(index, _)| *index >= seen);

        Ok(Scan {
            total: self.count,
            fresh: self.backlog.iter().map(|(_, line)| line.clone()).collect(),
        })
    }
}

pub fn strategy_for(kind: ScanKind) -> Box<dyn ScanStrategy> {
    match kind {
        ScanKind::Rescan => Box::new(FullRescan),
        ScanKind::Offset => Box::new(OffsetScan::default()),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TailState {
    /// Number of grammar-matching lines seen on the previous tick.
    pub last_line_count: usize,
}

pub struct LogTailer {
    path: PathBuf,
    strategy: Box<dyn ScanStrategy>,
    state: TailState,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, strategy: Box<dyn ScanStrategy>) -> Self {
        Self {
            path: path.into(),
            strategy,
            state: TailState::default(),
        }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(&config.path, strategy_for(config.strategy))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Marks every line currently in the log as already seen.
    pub fn prime(&mut self) -> Result<usize> {
        let scan = self.strategy.scan(&self.path, usize::MAX)?;
        self.state.last_line_count = scan.total;
        Ok(scan.total)
    }

    /// Runs one tail-diff step and returns the number of lines forwarded.
    ///
    /// If forwarding fails part-way, only the lines already forwarded are
    /// counted as seen, so the failed line is retried on the next tick.
    pub async fn tick(&mut self, forwarder: &mut dyn LineForwarder) -> Result<usize> {
        let scan = self
            .strategy
            .scan(&self.path, self.state.last_line_count)?;

        forwarder.begin_tick().await?;

        if scan.total == 0 {
            self.state.last_line_count = 0;
            return Ok(0);
        }

        let mut forwarded = 0;
        for line in &scan.fresh {
            if let Err(err) = forwarder.forward(line).await {
                self.state.last_line_count += forwarded;
                return Err(err.context(format!(
                    "forwarded {} of {} new lines",
                    forwarded,
                    scan.fresh.len()
                )));
            }
            forwarded += 1;
        }

        self.state.last_line_count = scan.total;
        Ok(forwarded)
    }

    /// Polls on a fixed interval until `shutdown` resolves.
    ///
    /// Ticks never overlap: the next one starts only after the previous
    /// delta has been fully forwarded.
    pub async fn run(
        &mut self,
        forwarder: &mut dyn LineForwarder,
        every: Duration,
        shutdown: impl Future<Output = ()> + Send,
    ) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(path = %self.path.display(), interval_ms = every.as_millis() as u64, "tailing access log");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("tailer stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(forwarder).await {
                        Ok(0) => {}
                        Ok(lines) => debug!(lines, total = self.state.last_line_count, "forwarded new lines"),
                        Err(err) => error!(error = %format!("{:#}", err), "tail cycle failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const LINE_A: &str = r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "GET /a HTTP/1.0" 200 1"#;
    const LINE_B: &str = r#"127.0.0.1 - - [10/Oct/2020:13:55:37] "GET /b HTTP/1.0" 200 2"#;
    const LINE_C: &str = r#"127.0.0.1 - - [10/Oct/2020:13:55:38] "GET /c HTTP/1.0" 404 -"#;

    #[derive(Default)]
    struct Collect {
        lines: Vec<String>,
        ticks: usize,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl LineForwarder for Collect {
        async fn begin_tick(&mut self) -> Result<()> {
            self.ticks += 1;
            Ok(())
        }

        async fn forward(&mut self, line: &str) -> Result<()> {
            if self.fail_on.as_deref() == Some(line) {
                self.fail_on = None;
                anyhow::bail!("disk full");
            }
            self.lines.push(line.to_string());
            Ok(())
        }
    }

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn tailers(path: &Path) -> Vec<LogTailer> {
        vec![
            LogTailer::new(path, Box::new(FullRescan)),
            LogTailer::new(path, Box::new(OffsetScan::default())),
        ]
    }

    #[tokio::test]
    async fn test_forwards_only_delta() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");
        std::fs::write(&log, "").unwrap();

        for mut tailer in tailers(&log) {
            std::fs::write(&log, "").unwrap();
            let mut out = Collect::default();

            append(&log, &format!("{}\n", LINE_A));
            assert_eq!(tailer.tick(&mut out).await.unwrap(), 1);

            append(&log, &format!("{}\n{}\n", LINE_B, LINE_C));
            assert_eq!(tailer.tick(&mut out).await.unwrap(), 2);

            assert_eq!(tailer.tick(&mut out).await.unwrap(), 0);
            assert_eq!(out.lines, vec![LINE_A, LINE_B, LINE_C]);
            assert_eq!(tailer.state().last_line_count, 3);
            assert_eq!(out.ticks, 3);
        }
    }

    #[tokio::test]
    async fn test_skips_non_matching_lines() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");

        for mut tailer in tailers(&log) {
            std::fs::write(&log, format!("garbage\n{}\nnot a log line\n{}\n", LINE_A, LINE_B))
                .unwrap();
            let mut out = Collect::default();
            tailer.tick(&mut out).await.unwrap();
            assert_eq!(out.lines, vec![LINE_A, LINE_B]);
            assert_eq!(tailer.state().last_line_count, 2);
        }
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");

        for mut tailer in tailers(&log) {
            std::fs::write(&log, format!("{}\n{}", LINE_A, &LINE_B[..20])).unwrap();
            let mut out = Collect::default();
            tailer.tick(&mut out).await.unwrap();
            assert_eq!(out.lines, vec![LINE_A]);

            append(&log, &format!("{}\n", &LINE_B[20..]));
            tailer.tick(&mut out).await.unwrap();
            assert_eq!(out.lines, vec![LINE_A, LINE_B]);
        }
    }

    #[tokio::test]
    async fn test_prime_skips_existing_content() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");

        for mut tailer in tailers(&log) {
            std::fs::write(&log, format!("{}\n{}\n", LINE_A, LINE_B)).unwrap();
            assert_eq!(tailer.prime().unwrap(), 2);

            let mut out = Collect::default();
            assert_eq!(tailer.tick(&mut out).await.unwrap(), 0);

            append(&log, &format!("{}\n", LINE_C));
            tailer.tick(&mut out).await.unwrap();
            assert_eq!(out.lines, vec![LINE_C]);
        }
    }

    #[tokio::test]
    async fn test_empty_log_resets_count() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");
        std::fs::write(&log, format!("{}\n{}\n", LINE_A, LINE_B)).unwrap();

        let mut tailer = LogTailer::new(&log, Box::new(FullRescan));
        let mut out = Collect::default();
        tailer.tick(&mut out).await.unwrap();
        assert_eq!(tailer.state().last_line_count, 2);

        std::fs::write(&log, "").unwrap();
        tailer.tick(&mut out).await.unwrap();
        assert_eq!(tailer.state().last_line_count, 0);

        append(&log, &format!("{}\n", LINE_C));
        tailer.tick(&mut out).await.unwrap();
        assert_eq!(out.lines, vec![LINE_A, LINE_B, LINE_C]);
    }

    #[tokio::test]
    async fn test_failed_forward_is_retried_next_tick() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");

        for mut tailer in tailers(&log) {
            std::fs::write(&log, format!("{}\n{}\n{}\n", LINE_A, LINE_B, LINE_C)).unwrap();
            let mut out = Collect {
                fail_on: Some(LINE_B.to_string()),
                ..Default::default()
            };

            assert!(tailer.tick(&mut out).await.is_err());
            assert_eq!(tailer.state().last_line_count, 1);
            assert_eq!(out.lines, vec![LINE_A]);

            assert_eq!(tailer.tick(&mut out).await.unwrap(), 2);
            assert_eq!(out.lines, vec![LINE_A, LINE_B, LINE_C]);
            assert_eq!(tailer.state().last_line_count, 3);
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut tailer = LogTailer::new(tmp.path().join("nope"), Box::new(FullRescan));
        let mut out = Collect::default();
        assert!(tailer.tick(&mut out).await.is_err());
        assert_eq!(tailer.state().last_line_count, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("access_log");
        std::fs::write(&log, format!("{}\n", LINE_A)).unwrap();

        let mut tailer = LogTailer::new(&log, Box::new(FullRescan));
        let mut out = Collect::default();
        tailer
            .run(
                &mut out,
                Duration::from_millis(20),
                tokio::time::sleep(Duration::from_millis(150)),
            )
            .await;

        assert_eq!(out.lines, vec![LINE_A]);
        assert!(out.ticks >= 2);
    }
}
