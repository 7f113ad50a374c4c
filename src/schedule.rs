//! Recurring job schedules.
//!
//! A job may carry a `Schedule`. The `JobScheduler` polls the store on an
//! interval, and starts every scheduled job whose next occurrence after its
//! last run has passed, through the same `JobRegistry` the trigger API uses.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::registry::JobRegistry;
use crate::store::JobStore;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// When a recurring job fires (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum Schedule {
    Daily { hour: u32, minute: u32 },
    /// `day_of_week`: 0 = Sunday .. 6 = Saturday.
    Weekly {
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
    /// Crontab expression. The classic 5-field form is accepted, with
    /// day-of-week numbered from Sunday = 0.
    Custom { cron_expression: String },
}

impl Schedule {
    /// Render as a `cron` crate expression (seconds field first).
    pub fn to_cron_expression(&self) -> Result<String, JobError> {
        match self {
            Self::Daily { hour, minute } => {
                check_time(*hour, *minute)?;
                Ok(format!("0 {minute} {hour} * * *"))
            }
            Self::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                check_time(*hour, *minute)?;
                let day = WEEKDAYS.get(*day_of_week as usize).ok_or_else(|| {
                    JobError::InvalidSchedule(format!("day_of_week {day_of_week} not in 0..=6"))
                })?;
                Ok(format!("0 {minute} {hour} * * {day}"))
            }
            Self::Custom { cron_expression } => {
                let fields = cron_expression.split_whitespace().count();
                match fields {
                    5 => {
                        let parts: Vec<&str> = cron_expression.split_whitespace().collect();
                        let day_of_week = crontab_weekdays(parts[4])?;
                        Ok(format!("0 {} {day_of_week}", parts[..4].join(" ")))
                    }
                    6 | 7 => Ok(cron_expression.trim().to_string()),
                    n => Err(JobError::InvalidSchedule(format!(
                        "cron expression has {n} fields, expected 5-7"
                    ))),
                }
            }
        }
    }

    /// Next occurrence strictly after `anchor`.
    pub fn next_after(&self, anchor: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, JobError> {
        let expression = self.to_cron_expression()?;
        let schedule = cron::Schedule::from_str(&expression)
            .map_err(|e| JobError::InvalidSchedule(format!("invalid cron '{expression}': {e}")))?;
        Ok(schedule.after(&anchor).next())
    }

    /// Whether an occurrence fell between `anchor` and `now`.
    pub fn is_due(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, JobError> {
        Ok(self.next_after(anchor)?.is_some_and(|next| next <= now))
    }
}

/// Rewrite a crontab day-of-week field (0-7, Sunday as 0 or 7) with day
/// names, which the `cron` crate reads unambiguously.
fn crontab_weekdays(field: &str) -> Result<String, JobError> {
    let day = |token: &str| -> Result<String, JobError> {
        match token.parse::<usize>() {
            Ok(n) if n <= 7 => Ok(WEEKDAYS[n % 7].to_string()),
            Ok(n) => Err(JobError::InvalidSchedule(format!(
                "day of week {n} not in 0..=7"
            ))),
            Err(_) => Ok(token.to_string()),
        }
    };

    let items = field
        .split(',')
        .map(|item| -> Result<String, JobError> {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let rendered = match (range.split_once('-'), step) {
                // 7 closes a range as Saturday's successor, so `5-7` is Fri-Sun.
                (Some((from, "7")), None) => format!("{}-Sat,Sun", day(from)?),
                (Some((_, "7")), Some(_)) => {
                    return Err(JobError::InvalidSchedule(format!(
                        "stepped day-of-week range '{item}' ending in 7"
                    )));
                }
                (Some((from, to)), _) => format!("{}-{}", day(from)?, day(to)?),
                (None, _) => day(range)?,
            };
            Ok(match step {
                Some(step) => format!("{rendered}/{step}"),
                None => rendered,
            })
        })
        .collect::<Result<Vec<_>, JobError>>()?;
    Ok(items.join(","))
}

fn check_time(hour: u32, minute: u32) -> Result<(), JobError> {
    if hour > 23 || minute > 59 {
        return Err(JobError::InvalidSchedule(format!(
            "time {hour:02}:{minute:02} out of range"
        )));
    }
    Ok(())
}

/// Fires due recurring jobs.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>) -> Self {
        Self { store, registry }
    }

    /// Start every due scheduled job. Returns how many were started.
    ///
    /// A due job that is still running is skipped; its occurrence is
    /// consumed so it does not fire again the moment the current run ends.
    pub async fn check_due(&self) -> usize {
        let jobs = match self.store.list_scheduled_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Failed to load scheduled jobs: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut fired = 0;

        for job in jobs {
            let Some(schedule) = job.schedule.as_ref() else {
                continue;
            };
            let anchor = job.last_scheduled_run.unwrap_or(job.created_at);

            match schedule.is_due(anchor, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, "Skipping job with bad schedule: {}", e);
                    continue;
                }
            }

            if let Err(e) = self.store.mark_scheduled_run(job.id, now).await {
                tracing::warn!(job_id = %job.id, "Failed to record scheduled run: {}", e);
                continue;
            }

            if self.registry.is_running(job.id).await {
                tracing::info!(job_id = %job.id, "Scheduled job already running, skipping");
                continue;
            }

            match self.registry.start_job(job.spec()).await {
                Ok(true) => {
                    tracing::info!(job_id = %job.id, "Started scheduled job");
                    fired += 1;
                }
                Ok(false) => {
                    tracing::info!(job_id = %job.id, "Scheduled job already running, skipping");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, "Failed to start scheduled job: {}", e);
                }
            }
        }

        fired
    }
}

/// Spawn the schedule ticker background task.
pub fn spawn_schedule_ticker(
    scheduler: Arc<JobScheduler>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            scheduler.check_due().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    use super::*;

    #[test]
    fn daily_expression() {
        let schedule = Schedule::Daily { hour: 9, minute: 30 };
        assert_eq!(schedule.to_cron_expression().unwrap(), "0 30 9 * * *");
    }

    #[test]
    fn weekly_uses_sunday_zero() {
        let schedule = Schedule::Weekly {
            day_of_week: 0,
            hour: 6,
            minute: 0,
        };
        assert_eq!(schedule.to_cron_expression().unwrap(), "0 0 6 * * Sun");

        let anchor = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(); // Monday
        let next = schedule.next_after(anchor).unwrap().unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next.hour(), 6);
    }

    #[test]
    fn five_field_crontab_is_normalised() {
        let schedule = Schedule::Custom {
            cron_expression: "15 8 * * *".to_string(),
        };
        assert_eq!(schedule.to_cron_expression().unwrap(), "0 15 8 * * *");
    }

    #[test]
    fn crontab_weekday_numbers_count_from_sunday() {
        let anchor = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap(); // Wednesday
        let next = |expression: &str| {
            Schedule::Custom {
                cron_expression: expression.to_string(),
            }
            .next_after(anchor)
            .unwrap()
            .unwrap()
        };

        let monday = next("0 9 * * 1");
        assert_eq!(monday, Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap());
        assert_eq!(monday.weekday(), Weekday::Mon);

        assert_eq!(next("0 9 * * 0").weekday(), Weekday::Sun);
        assert_eq!(next("0 9 * * 7").weekday(), Weekday::Sun);
        assert_eq!(next("0 9 * * 1-5").weekday(), Weekday::Thu);
        assert_eq!(next("0 9 * * 6,0").weekday(), Weekday::Sat);
        assert_eq!(next("0 9 * * 5-7"), Utc.with_ymd_and_hms(2026, 3, 6, 9, 0, 0).unwrap());
    }

    #[test]
    fn crontab_weekday_rendering() {
        let render = |expression: &str| {
            Schedule::Custom {
                cron_expression: expression.to_string(),
            }
            .to_cron_expression()
        };
        assert_eq!(render("30 6 * * 1-5").unwrap(), "0 30 6 * * Mon-Fri");
        assert_eq!(render("0 0 1 * Tue").unwrap(), "0 0 0 1 * Tue");
        assert_eq!(render("0 0 * * */2").unwrap(), "0 0 0 * * */2");
        assert!(render("0 0 * * 8").is_err());
        // Six-field expressions already use the cron crate's numbering.
        assert_eq!(render("0 0 9 * * 2").unwrap(), "0 0 9 * * 2");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(Schedule::Daily { hour: 24, minute: 0 }.to_cron_expression().is_err());
        assert!(
            Schedule::Weekly {
                day_of_week: 7,
                hour: 1,
                minute: 0
            }
            .to_cron_expression()
            .is_err()
        );
        assert!(
            Schedule::Custom {
                cron_expression: "* *".to_string()
            }
            .next_after(Utc::now())
            .is_err()
        );
    }

    #[test]
    fn due_only_after_next_occurrence() {
        let schedule = Schedule::Daily { hour: 9, minute: 0 };
        let anchor = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

        let before = Utc.with_ymd_and_hms(2026, 3, 3, 8, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap();

        assert!(!schedule.is_due(anchor, before).unwrap());
        assert!(schedule.is_due(anchor, after).unwrap());
    }

    #[test]
    fn schedule_serde_matches_trigger_payload() {
        let json = serde_json::json!({
            "schedule_type": "weekly",
            "day_of_week": 1,
            "hour": 9,
            "minute": 0
        });
        let schedule: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(
            schedule,
            Schedule::Weekly {
                day_of_week: 1,
                hour: 9,
                minute: 0
            }
        );
    }
}
