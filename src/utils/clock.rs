use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use now::DateTimeNow;
use tokio::time::Instant;

use super::time::next_day_start;

/// Source of time for everything that asks "when is now" or "what day is it".
/// Day boundaries are resolved by the implementation, so the rest of the code
/// never touches the device timezone directly and tests can pin both the
/// instant and the date.
#[async_trait]
pub trait Clock: Sync + Send + 'static {
    fn time(&self) -> DateTime<Utc>;

    /// Calendar date the user currently sees. Usage snapshots and goal
    /// history roll over at this date's boundaries.
    fn today(&self) -> NaiveDate;

    /// Start of the current day as a UTC instant.
    fn day_start(&self) -> DateTime<Utc>;

    /// Start of the next day as a UTC instant.
    fn next_midnight(&self) -> DateTime<Utc>;

    fn instant(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    async fn sleep_until(&self, instant: tokio::time::Instant);
}

/// Clock pinned to a chosen start instant, advancing with tokio's (possibly
/// paused) timer. Resolves days as UTC days so tests are independent of the
/// machine's timezone.
#[cfg(test)]
pub struct TestClock {
    pub start_time: DateTime<Utc>,
    pub reference: Instant,
}

#[cfg(test)]
impl TestClock {
    pub fn new(start_time: chrono::NaiveDateTime) -> Self {
        use chrono::TimeZone;

        Self {
            start_time: Utc.from_utc_datetime(&start_time),
            reference: Instant::now(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for TestClock {
    fn time(&self) -> DateTime<Utc> {
        self.start_time + self.reference.elapsed()
    }

    fn today(&self) -> NaiveDate {
        self.time().date_naive()
    }

    fn day_start(&self) -> DateTime<Utc> {
        self.time().beginning_of_day()
    }

    fn next_midnight(&self) -> DateTime<Utc> {
        next_day_start(self.time())
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, instant: tokio::time::Instant) {
        tokio::time::sleep_until(instant).await;
    }
}

/// Resolves days in the device-local timezone.
pub struct DefaultClock;

#[async_trait]
impl Clock for DefaultClock {
    fn time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    fn day_start(&self) -> DateTime<Utc> {
        Local::now().beginning_of_day().with_timezone(&Utc)
    }

    fn next_midnight(&self) -> DateTime<Utc> {
        next_day_start(Local::now()).with_timezone(&Utc)
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, instant: tokio::time::Instant) {
        tokio::time::sleep_until(instant).await;
    }
}
