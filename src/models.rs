//! Core data models.
//!
//! [`LogRecord`] is one parsed access-log line; [`RegistryEntry`] is the
//! persisted record of a day's CSV file.

use serde::{Deserialize, Serialize};

/// Column headers written once at the top of every day file.
pub const CSV_HEADER: [&str; 9] = [
    "IP",
    "IDENTIDAD",
    "USER",
    "FECHA Y HORA",
    "METODO",
    "PETICION URL",
    "PROTOCOLO",
    "CODIGO ESTADO",
    "TAMAÑO",
];

pub const FIELD_SEPARATOR: &str = ";";
pub const LINE_TERMINATOR: &str = "\r\n";

/// One parsed access-log entry, already normalized for persistence.
///
/// Field order matches [`CSV_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub ip: String,
    pub separator: String,
    pub user: String,
    pub date: String,
    pub method: String,
    pub url: String,
    pub protocol: String,
    pub status_code: String,
    pub byte_count: String,
}

impl LogRecord {
    pub fn fields(&self) -> [&str; 9] {
        [
            &self.ip,
            &self.separator,
            &self.user,
            &self.date,
            &self.method,
            &self.url,
            &self.protocol,
            &self.status_code,
            &self.byte_count,
        ]
    }

    /// Renders the record as a `;`-joined row without the line terminator.
    ///
    /// Fields are not quoted or escaped.
    pub fn to_row(&self) -> String {
        self.fields().join(FIELD_SEPARATOR)
    }
}

/// Registry record of one day-partitioned CSV file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// `yyyy-MM-dd`, taken from the local wall clock when the file was created.
    pub date_key: String,
    pub file_name: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl RegistryEntry {
    pub fn new(date_key: &str, created_at: i64) -> Self {
        Self {
            date_key: date_key.to_string(),
            file_name: file_name_for(date_key),
            created_at,
        }
    }
}

pub fn file_name_for(date_key: &str) -> String {
    format!("{}.csv", date_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_row() {
        assert_eq!(
            CSV_HEADER.join(FIELD_SEPARATOR),
            "IP;IDENTIDAD;USER;FECHA Y HORA;METODO;PETICION URL;PROTOCOLO;CODIGO ESTADO;TAMAÑO"
        );
    }

    #[test]
    fn test_registry_entry_json_shape() {
        let entry = RegistryEntry::new("2024-03-01", 1_709_251_200_000);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["dateKey"], "2024-03-01");
        assert_eq!(json["fileName"], "2024-03-01.csv");
        assert_eq!(json["createdAt"], 1_709_251_200_000i64);
    }
}
