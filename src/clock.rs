//! Wall-clock source for day keys.

use chrono::Local;
use std::sync::Mutex;

/// Format of a day key, e.g. `2024-03-01`.
pub const DATE_KEY_FORMAT: &str = "%Y-%m-%d";

pub trait Clock: Send + Sync {
    /// Today's day key in local time.
    fn today(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> String {
        Local::now().format(DATE_KEY_FORMAT).to_string()
    }
}

/// A clock whose date only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    today: Mutex<String>,
}

impl ManualClock {
    pub fn new(today: &str) -> Self {
        Self {
            today: Mutex::new(today.to_string()),
        }
    }

    pub fn set(&self, today: &str) {
        *self.today.lock().unwrap() = today.to_string();
    }
}

impl Clock for ManualClock {
    fn today(&self) -> String {
        self.today.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_system_clock_format() {
        let today = SystemClock.today();
        assert!(NaiveDate::parse_from_str(&today, DATE_KEY_FORMAT).is_ok());
        assert_eq!(today.len(), 10);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new("2024-01-01");
        assert_eq!(clock.today(), "2024-01-01");
        clock.set("2024-01-02");
        assert_eq!(clock.today(), "2024-01-02");
    }
}
