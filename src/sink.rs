//! Append-only CSV writer for one day file.
//!
//! Rows are `;`-joined and `\r\n`-terminated. Nothing is quoted: the line
//! grammar cannot produce a `;` or newline in a field without first failing
//! to match.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::{file_name_for, LogRecord, CSV_HEADER, FIELD_SEPARATOR, LINE_TERMINATOR};

pub struct CsvSink {
    dir: PathBuf,
    open: Option<OpenFile>,
}

struct OpenFile {
    date_key: String,
    file: File,
}

impl CsvSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the CSV file for `date_key` inside the output directory.
    pub fn path_for(&self, date_key: &str) -> PathBuf {
        csv_path(&self.dir, date_key)
    }

    /// Key of the file currently open for writing.
    pub fn current_key(&self) -> Option<&str> {
        self.open.as_ref().map(|o| o.date_key.as_str())
    }

    /// Opens `{dir}/{date_key}.csv` for appending, creating it if needed.
    ///
    /// Existing content is never truncated. Any previously open file is closed.
    pub fn open(&mut self, date_key: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create output directory: {}", self.dir.display())
        })?;

        let path = self.path_for(date_key);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

        self.open = Some(OpenFile {
            date_key: date_key.to_string(),
            file,
        });
        Ok(())
    }

    /// Drops the open handle; the next write needs a fresh [`open`](Self::open).
    pub fn close(&mut self) {
        self.open = None;
    }

    pub fn write_header(&mut self) -> Result<()> {
        let line = format!("{}{}", CSV_HEADER.join(FIELD_SEPARATOR), LINE_TERMINATOR);
        self.write_raw(&line)
    }

    pub fn write_record(&mut self, record: &LogRecord) -> Result<()> {
        let line = format!("{}{}", record.to_row(), LINE_TERMINATOR);
        self.write_raw(&line)
    }

    fn write_raw(&mut self, line: &str) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No CSV file is open for writing"))?;

        // unbuffered: the download API reads this file while it grows
        open.file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", file_name_for(&open.date_key)))?;
        Ok(())
    }
}

pub fn csv_path(dir: &Path, date_key: &str) -> PathBuf {
    dir.join(file_name_for(date_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;
    use tempfile::TempDir;

    #[test]
    fn test_header_and_record() {
        let tmp = TempDir::new().unwrap();
        let mut sink = CsvSink::new(tmp.path().join("files"));
        sink.open("2020-10-10").unwrap();
        sink.write_header().unwrap();
        let record =
            parse_line(r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "GET /test HTTP/1.0" 200 1043"#)
                .unwrap();
        sink.write_record(&record).unwrap();

        let content = std::fs::read_to_string(sink.path_for("2020-10-10")).unwrap();
        assert_eq!(
            content,
            "IP;IDENTIDAD;USER;FECHA Y HORA;METODO;PETICION URL;PROTOCOLO;CODIGO ESTADO;TAMAÑO\r\n\
             127.0.0.1;0;0;10/Oct/2020:13:55:36;GET;/test;HTTP/1.0;200;1043\r\n"
        );
    }

    #[test]
    fn test_open_appends_without_truncating() {
        let tmp = TempDir::new().unwrap();
        let mut sink = CsvSink::new(tmp.path());
        sink.open("2020-10-10").unwrap();
        sink.write_header().unwrap();
        sink.close();

        sink.open("2020-10-10").unwrap();
        let record = parse_line(r#"10.0.0.1 - - [d] "GET / HTTP/1.1" 200 1"#).unwrap();
        sink.write_record(&record).unwrap();

        let content = std::fs::read_to_string(sink.path_for("2020-10-10")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("IP;"));
    }

    #[test]
    fn test_write_without_open_fails() {
        let tmp = TempDir::new().unwrap();
        let mut sink = CsvSink::new(tmp.path());
        assert!(sink.write_header().is_err());
        assert!(sink.current_key().is_none());
    }

    #[test]
    fn test_reopen_switches_file() {
        let tmp = TempDir::new().unwrap();
        let mut sink = CsvSink::new(tmp.path());
        sink.open("2020-10-10").unwrap();
        sink.open("2020-10-11").unwrap();
        assert_eq!(sink.current_key(), Some("2020-10-11"));
        sink.write_header().unwrap();

        let old = std::fs::read_to_string(sink.path_for("2020-10-10")).unwrap();
        assert!(old.is_empty());
    }
}
