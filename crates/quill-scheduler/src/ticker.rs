//! Periodic triggers for the fetch scheduler.
//!
//! The scheduler only depends on [`Ticker`], so tests drive it with
//! [`ManualTicker`] while the binary uses [`CronTicker`].

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;

#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next trigger. `None` means the ticker is exhausted.
    async fn tick(&mut self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone)]
/// Fires on the occurrences of a cron expression evaluated in `timezone`.
pub struct CronTicker {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronTicker {
    pub fn new(expression: &str, timezone: Tz) -> Result<Self> {
        let expression = expression.trim();
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("invalid cron expression '{expression}'"))?;
        if schedule.after(&Utc::now().with_timezone(&timezone)).next().is_none() {
            return Err(anyhow!("cron expression '{expression}' has no future occurrence"));
        }
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&from.with_timezone(&self.timezone))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

#[async_trait]
impl Ticker for CronTicker {
    async fn tick(&mut self) -> Option<DateTime<Utc>> {
        let next = self.next_after(Utc::now())?;
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;
        Some(next)
    }
}

#[derive(Debug)]
/// Fires every `period`, starting one period from now.
pub struct IntervalTicker {
    interval: tokio::time::Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Result<Self> {
        if period.is_zero() {
            return Err(anyhow!("ticker interval must be greater than zero"));
        }
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Ok(Self { interval })
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> Option<DateTime<Utc>> {
        self.interval.tick().await;
        Some(Utc::now())
    }
}

#[derive(Debug)]
/// Fires only when its [`ManualTickTrigger`] says so.
pub struct ManualTicker {
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ManualTickTrigger {
    sender: mpsc::UnboundedSender<DateTime<Utc>>,
}

impl ManualTicker {
    pub fn channel() -> (Self, ManualTickTrigger) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { receiver }, ManualTickTrigger { sender })
    }
}

impl ManualTickTrigger {
    /// Queues one tick. Returns false once the ticker has been dropped.
    pub fn fire(&self) -> bool {
        self.sender.send(Utc::now()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> Option<DateTime<Utc>> {
        self.receiver.recv().await
    }
}
