use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Abstraction over "current time" to make behavior deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Start of the portal fetch lookback window.
    fn yesterday(&self) -> NaiveDate {
        self.today() - Duration::days(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn yesterday_crosses_month_boundary() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap());
        assert_eq!(
            clock.yesterday(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }
}
