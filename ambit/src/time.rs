use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, LocalResult, TimeZone, Timelike};
use color_eyre::eyre::{eyre, Report};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute wall-clock instant carried by START_AT, broken into calendar
/// parts so that the wire form stays a plain record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAt {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl StartAt {
    /// The instant `delta_seconds` from now, in local time.
    pub fn after(delta_seconds: u64) -> Self {
        let at = Local::now() + ChronoDuration::seconds(delta_seconds as i64);
        Self {
            year: at.year(),
            month: at.month(),
            day: at.day(),
            hour: at.hour(),
            minute: at.minute(),
            second: at.second(),
        }
    }

    pub fn to_datetime(self) -> Result<DateTime<Local>, Report> {
        match Local.with_ymd_and_hms(
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        ) {
            LocalResult::Single(at) => Ok(at),
            LocalResult::Ambiguous(at, _) => Ok(at),
            LocalResult::None => Err(eyre!("invalid wall-clock instant {}", self)),
        }
    }

    /// Suspends the caller until the instant. Workers await this on
    /// START_AT so that every node unsuspends at the same wall-clock time.
    pub async fn pause_until(self) -> Result<(), Report> {
        let at = self.to_datetime()?;
        let now = Local::now();
        if let Ok(wait) = (at - now).to_std() {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }
}

impl fmt::Display for StartAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "y:{}, mo:{}, d:{}, h:{}, mi:{}, s:{}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Name of a per-run experiment directory, e.g. `2026_08_01_14_03_59`.
pub fn experiment_dir_name() -> String {
    Local::now().format("%Y_%m_%d_%H_%M_%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_at_round_trips_through_chrono() {
        let start = StartAt::after(60);
        let at = start.to_datetime().unwrap();
        assert_eq!(at.second(), start.second);
        assert!(at > Local::now());
    }

    #[tokio::test]
    async fn past_instants_do_not_block() {
        let start = StartAt::after(0);
        // already elapsed (or elapsing now); must return immediately
        start.pause_until().await.unwrap();
    }

    #[test]
    fn rejects_nonsense_dates() {
        let start = StartAt {
            year: 2026,
            month: 13,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert!(start.to_datetime().is_err());
    }
}
