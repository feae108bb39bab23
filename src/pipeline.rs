//! Parse-and-persist stage shared by the monolithic process and the collector.
//!
//! [`CsvPipeline`] owns the only writable [`CsvSink`] and decides which day
//! file it points at. The day key is recomputed from the wall clock once per
//! tail tick (monolithic) or once per relayed line (collector); when the key
//! changes it opens the new file, writes the header if the registry has
//! never seen that key, and registers it. Every line of one tick lands in the
//! file the tick started on, even if midnight passes while it is forwarded.
//!
//! The open key is published on a `watch` channel so the download API can
//! serve "the current file" without sharing the sink.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::clock::Clock;
use crate::parser;
use crate::registry::Registry;
use crate::sink::CsvSink;
use crate::tailer::LineForwarder;

pub struct CsvPipeline {
    registry: Arc<dyn Registry>,
    clock: Arc<dyn Clock>,
    sink: CsvSink,
    current: watch::Sender<Option<String>>,
    /// Key whose header this process wrote but has not yet registered.
    header_written_for: Option<String>,
}

impl CsvPipeline {
    pub fn new(
        registry: Arc<dyn Registry>,
        clock: Arc<dyn Clock>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            registry,
            clock,
            sink: CsvSink::new(output_dir),
            current,
            header_written_for: None,
        }
    }

    /// Receiver that always holds the key of the day file open for writing.
    pub fn current_key_receiver(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    pub fn current_key(&self) -> Option<&str> {
        self.sink.current_key()
    }

    /// Makes sure today's file is the open one.
    ///
    /// Returns `true` when a file was (re)opened.
    pub async fn roll_over(&mut self) -> Result<bool> {
        let today = self.clock.today();
        if self.sink.current_key() == Some(today.as_str()) {
            return Ok(false);
        }
        self.open_day(&today).await?;
        Ok(true)
    }

    async fn open_day(&mut self, date_key: &str) -> Result<()> {
        let is_new = !self
            .registry
            .exists(date_key)
            .await
            .context("Failed to query registry")?;

        self.sink.open(date_key)?;
        let header = is_new && self.header_written_for.as_deref() != Some(date_key);
        if header {
            if let Err(err) = self.sink.write_header() {
                self.sink.close();
                return Err(err);
            }
            self.header_written_for = Some(date_key.to_string());
        }
        if let Err(err) = self.registry.put(date_key).await {
            // header_written_for stays set so the retry does not repeat the header
            self.sink.close();
            return Err(err.context("Failed to register day file"));
        }
        self.header_written_for = None;

        let previous = self.current.send_replace(Some(date_key.to_string()));
        info!(
            date_key,
            previous = previous.as_deref().unwrap_or("-"),
            header,
            "opened day file"
        );
        Ok(())
    }

    /// Parses one raw line and appends it to today's file.
    ///
    /// Returns `Ok(false)` for lines that do not match the grammar.
    pub async fn persist_line(&mut self, raw: &str) -> Result<bool> {
        self.roll_over().await?;
        self.append(raw).await
    }

    /// Appends to the file already chosen for this tick, without looking at
    /// the clock.
    async fn append(&mut self, raw: &str) -> Result<bool> {
        let Some(record) = parser::parse_line(raw) else {
            return Ok(false);
        };

        if self.sink.current_key().is_none() {
            // closed by an earlier write error; reopen the same day
            let key = self.current.borrow().clone();
            match key {
                Some(key) => self.open_day(&key).await?,
                None => {
                    self.roll_over().await?;
                }
            }
        }

        if let Err(err) = self.sink.write_record(&record) {
            self.sink.close();
            return Err(err);
        }
        Ok(true)
    }
}

#[async_trait]
impl LineForwarder for CsvPipeline {
    async fn begin_tick(&mut self) -> Result<()> {
        self.roll_over().await?;
        Ok(())
    }

    async fn forward(&mut self, line: &str) -> Result<()> {
        self.append(line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::RegistryEntry;
    use crate::registry::InMemoryRegistry;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    const HEADER: &str =
        "IP;IDENTIDAD;USER;FECHA Y HORA;METODO;PETICION URL;PROTOCOLO;CODIGO ESTADO;TAMAÑO";
    const LINE: &str = r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "GET /test HTTP/1.0" 200 1043"#;
    const ROW: &str = "127.0.0.1;0;0;10/Oct/2020:13:55:36;GET;/test;HTTP/1.0;200;1043";

    fn pipeline(
        tmp: &TempDir,
        registry: Arc<dyn Registry>,
        clock: Arc<ManualClock>,
    ) -> CsvPipeline {
        CsvPipeline::new(registry, clock, tmp.path().join("files"))
    }

    fn read(tmp: &TempDir, key: &str) -> String {
        std::fs::read_to_string(tmp.path().join("files").join(format!("{}.csv", key))).unwrap()
    }

    #[tokio::test]
    async fn test_first_line_creates_file_with_header() {
        let tmp = TempDir::new().unwrap();
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, registry.clone(), clock);

        assert!(p.persist_line(LINE).await.unwrap());
        assert_eq!(read(&tmp, "2020-10-10"), format!("{}\r\n{}\r\n", HEADER, ROW));
        assert!(registry.exists("2020-10-10").await.unwrap());
        assert_eq!(*p.current_key_receiver().borrow(), Some("2020-10-10".to_string()));
    }

    #[tokio::test]
    async fn test_non_matching_line_is_not_written() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, Arc::new(InMemoryRegistry::new()), clock);

        assert!(!p.persist_line("127.0.0.1 - - [x] 200 1").await.unwrap());
        assert_eq!(read(&tmp, "2020-10-10"), format!("{}\r\n", HEADER));
    }

    #[tokio::test]
    async fn test_header_not_repeated_after_restart() {
        let tmp = TempDir::new().unwrap();
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let clock = Arc::new(ManualClock::new("2020-10-10"));

        let mut first = pipeline(&tmp, registry.clone(), clock.clone());
        first.persist_line(LINE).await.unwrap();
        drop(first);

        let mut second = pipeline(&tmp, registry, clock);
        second.persist_line(LINE).await.unwrap();

        let content = read(&tmp, "2020-10-10");
        assert_eq!(content.matches(HEADER).count(), 1);
        assert_eq!(content.matches(ROW).count(), 2);
    }

    #[tokio::test]
    async fn test_rotation_switches_file() {
        let tmp = TempDir::new().unwrap();
        let registry: Arc<dyn Registry> = Arc::new(InMemoryRegistry::new());
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, registry.clone(), clock.clone());
        let rx = p.current_key_receiver();

        p.persist_line(LINE).await.unwrap();
        clock.set("2020-10-11");
        assert!(p.roll_over().await.unwrap());
        assert!(!p.roll_over().await.unwrap());
        p.persist_line(LINE).await.unwrap();

        assert_eq!(read(&tmp, "2020-10-10"), format!("{}\r\n{}\r\n", HEADER, ROW));
        assert_eq!(read(&tmp, "2020-10-11"), format!("{}\r\n{}\r\n", HEADER, ROW));
        assert_eq!(*rx.borrow(), Some("2020-10-11".to_string()));

        let keys: Vec<String> = registry
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.date_key)
            .collect();
        assert_eq!(keys, vec!["2020-10-10", "2020-10-11"]);
    }

    struct FailingPut {
        inner: InMemoryRegistry,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Registry for FailingPut {
        async fn exists(&self, date_key: &str) -> Result<bool> {
            self.inner.exists(date_key).await
        }
        async fn put(&self, date_key: &str) -> Result<bool> {
            if self.fail.swap(false, Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            self.inner.put(date_key).await
        }
        async fn get(&self, date_key: &str) -> Result<Option<RegistryEntry>> {
            self.inner.get(date_key).await
        }
        async fn list_all(&self) -> Result<Vec<RegistryEntry>> {
            self.inner.list_all().await
        }
    }

    #[tokio::test]
    async fn test_failed_registration_is_retried_without_second_header() {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(FailingPut {
            inner: InMemoryRegistry::new(),
            fail: AtomicBool::new(true),
        });
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, registry.clone(), clock);

        assert!(p.persist_line(LINE).await.is_err());
        assert_eq!(p.current_key(), None);

        assert!(p.persist_line(LINE).await.unwrap());
        assert!(registry.exists("2020-10-10").await.unwrap());
        assert_eq!(read(&tmp, "2020-10-10"), format!("{}\r\n{}\r\n", HEADER, ROW));
    }

    #[tokio::test]
    async fn test_unregistered_key_over_existing_rows_gets_header() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("files");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("2020-10-10.csv"), "old;row\r\n").unwrap();

        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, Arc::new(InMemoryRegistry::new()), clock);
        p.persist_line(LINE).await.unwrap();

        assert_eq!(
            read(&tmp, "2020-10-10"),
            format!("old;row\r\n{}\r\n{}\r\n", HEADER, ROW)
        );
    }

    #[tokio::test]
    async fn test_tick_lines_stay_in_the_tick_day() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, Arc::new(InMemoryRegistry::new()), clock.clone());

        p.begin_tick().await.unwrap();
        p.forward(LINE).await.unwrap();
        clock.set("2020-10-11");
        p.forward(LINE).await.unwrap();

        assert_eq!(
            read(&tmp, "2020-10-10"),
            format!("{}\r\n{}\r\n{}\r\n", HEADER, ROW, ROW)
        );
        assert!(!tmp.path().join("files").join("2020-10-11.csv").exists());

        p.begin_tick().await.unwrap();
        p.forward(LINE).await.unwrap();
        assert_eq!(read(&tmp, "2020-10-11"), format!("{}\r\n{}\r\n", HEADER, ROW));
    }

    #[tokio::test]
    async fn test_closed_sink_reopens_the_tick_day() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, Arc::new(InMemoryRegistry::new()), clock.clone());

        p.begin_tick().await.unwrap();
        clock.set("2020-10-11");
        p.sink.close();
        p.forward(LINE).await.unwrap();

        assert_eq!(read(&tmp, "2020-10-10"), format!("{}\r\n{}\r\n", HEADER, ROW));
        assert_eq!(p.current_key(), Some("2020-10-10"));
    }

    #[tokio::test]
    async fn test_write_error_reopens_on_next_line() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new("2020-10-10"));
        let mut p = pipeline(&tmp, Arc::new(InMemoryRegistry::new()), clock);

        p.persist_line(LINE).await.unwrap();
        p.sink.close();
        p.persist_line(LINE).await.unwrap();

        let content = read(&tmp, "2020-10-10");
        assert_eq!(content.matches(HEADER).count(), 1);
        assert_eq!(content.matches(ROW).count(), 2);
    }
}
