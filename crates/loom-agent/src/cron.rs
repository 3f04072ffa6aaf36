//! Cron Scheduler (spec C11): persisted `{expression, task, enabled,
//! next_run, last_run, run_count}` records, fired by a single background
//! ticker. Grounded in the teacher's time-triggered invocation idea
//! (`agenticlaw-consciousness/src/stack.rs`'s scheduled cascade ticks), with
//! a hand-rolled UTC-only 5-field cron evaluator plus the sugar forms
//! (`@hourly`, `@daily`, `@weekly`, `@every <duration>`) spec §4.11 names.

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use loom_core::types::CronJob;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Invoked with `(task, session_id)` when a job fires. Never awaited for a
/// result beyond completion — per spec, firing failures still advance
/// `next_run`, so the executor has no way to signal "retry me sooner".
pub type CronExecutor =
    Arc<dyn Fn(String, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct CronScheduler {
    jobs: DashMap<String, CronJob>,
    data_dir: PathBuf,
    persist_lock: Mutex<()>,
    executor: CronExecutor,
}

impl CronScheduler {
    pub async fn load(data_dir: impl Into<PathBuf>, executor: CronExecutor) -> loom_core::Result<Arc<Self>> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir).await?;
        let path = data_dir.join("cron.json");
        let jobs = DashMap::new();
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            match serde_json::from_str::<Vec<CronJob>>(&content) {
                Ok(loaded) => {
                    for job in loaded {
                        jobs.insert(job.id.clone(), job);
                    }
                }
                Err(e) => warn!(error = %e, "failed to parse persisted cron.json, starting empty"),
            }
        }
        Ok(Arc::new(Self {
            jobs,
            data_dir,
            persist_lock: Mutex::new(()),
            executor,
        }))
    }

    async fn persist(&self) -> loom_core::Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot: Vec<CronJob> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let path = self.data_dir.join("cron.json");
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn add(
        &self,
        expression: impl Into<String>,
        task: impl Into<String>,
        session_id: impl Into<String>,
    ) -> loom_core::Result<CronJob> {
        let expression = expression.into();
        let next_run = next_occurrence(&expression, Utc::now())
            .ok_or_else(|| loom_core::Error::ConfigError(format!("invalid cron expression: {expression}")))?;
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            expression,
            task: task.into(),
            session_id: session_id.into(),
            enabled: true,
            next_run,
            last_run: None,
            run_count: 0,
        };
        self.jobs.insert(job.id.clone(), job.clone());
        self.persist().await?;
        Ok(job)
    }

    pub async fn remove(&self, id: &str) -> loom_core::Result<bool> {
        let existed = self.jobs.remove(id).is_some();
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> loom_core::Result<bool> {
        let found = self.jobs.get_mut(id).map(|mut job| job.enabled = enabled).is_some();
        if found {
            self.persist().await?;
        }
        Ok(found)
    }

    pub fn list(&self) -> Vec<CronJob> {
        self.jobs.iter().map(|e| e.value().clone()).collect()
    }

    /// Spawns the background ticker. `tick_interval` governs how often the
    /// scheduler wakes to check for due jobs, independent of any job's own
    /// period.
    pub fn spawn_ticker(self: Arc<Self>, tick_interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick_interval) => {}
                }
                self.tick().await;
            }
        });
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<CronJob> = self
            .jobs
            .iter()
            .filter(|e| e.value().enabled && e.value().next_run <= now)
            .map(|e| e.value().clone())
            .collect();

        for job in due {
            info!(job_id = %job.id, expression = %job.expression, "cron job firing");
            (self.executor)(job.task.clone(), job.session_id.clone()).await;

            let next_run = match next_occurrence(&job.expression, now) {
                Some(n) => n,
                None => {
                    error!(job_id = %job.id, "failed to compute next occurrence, disabling job");
                    now + chrono::Duration::days(365 * 100)
                }
            };
            if let Some(mut entry) = self.jobs.get_mut(&job.id) {
                entry.last_run = Some(now);
                entry.run_count += 1;
                entry.next_run = next_run;
            }
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "failed to persist cron state after tick");
        }
    }
}

fn next_occurrence(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(duration_str) = expression.strip_prefix("@every ") {
        let duration = parse_duration(duration_str.trim())?;
        return Some(after + chrono::Duration::from_std(duration).ok()?);
    }
    let resolved = match expression {
        "@hourly" => "0 * * * *",
        "@daily" => "0 0 * * *",
        "@weekly" => "0 0 * * 0",
        other => other,
    };
    cron_next(resolved, &after)
}

/// Parses `<n><unit>` durations (`30s`, `5m`, `2h`, `1d`), optionally chained
/// (`1h30m`). No external duration-parsing crate is in the workspace's
/// dependency stack, so this stays intentionally small.
fn parse_duration(spec: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in spec.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match ch {
            's' => Duration::from_secs(n),
            'm' => Duration::from_secs(n * 60),
            'h' => Duration::from_secs(n * 3600),
            'd' => Duration::from_secs(n * 86400),
            _ => return None,
        };
        total += unit;
    }
    if !digits.is_empty() {
        return None;
    }
    if total.is_zero() {
        return None;
    }
    Some(total)
}

fn cron_field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

fn cron_matches(expression: &str, dt: &DateTime<Utc>) -> bool {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    cron_field_matches(fields[0], dt.minute())
        && cron_field_matches(fields[1], dt.hour())
        && cron_field_matches(fields[2], dt.day())
        && cron_field_matches(fields[3], dt.month())
        && cron_field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

fn cron_next(expression: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next_min_secs = 60 - after.second() as i64;
    let mut candidate = *after + chrono::Duration::seconds(next_min_secs);
    candidate = candidate.with_second(0).unwrap_or(candidate).with_nanosecond(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60;
    for _ in 0..max_checks {
        if cron_matches(expression, &candidate) {
            return Some(candidate);
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noop_executor() -> CronExecutor {
        Arc::new(|_task, _session| Box::pin(async move {}))
    }

    #[test]
    fn cron_every_5_minutes() {
        let dt = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert!(cron_matches("*/5 * * * *", &dt));
        let dt2 = Utc.with_ymd_and_hms(2024, 6, 15, 10, 3, 0).unwrap();
        assert!(!cron_matches("*/5 * * * *", &dt2));
    }

    #[test]
    fn sugar_forms_resolve() {
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let hourly = next_occurrence("@hourly", after).unwrap();
        assert_eq!(hourly.minute(), 0);
        assert!(hourly > after);

        let every = next_occurrence("@every 5m", after).unwrap();
        assert_eq!(every, after + chrono::Duration::minutes(5));
    }

    #[test]
    fn parse_duration_handles_compound_spec() {
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("bogus"), None);
    }

    #[tokio::test]
    async fn add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = CronScheduler::load(dir.path(), noop_executor()).await.unwrap();
        scheduler.add("@daily", "check inbox", "s1").await.unwrap();

        let reloaded = CronScheduler::load(dir.path(), noop_executor()).await.unwrap();
        let jobs = reloaded.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task, "check inbox");
    }

    #[tokio::test]
    async fn tick_fires_due_job_and_advances_next_run() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let executor: CronExecutor = Arc::new(move |_task, _session| {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = CronScheduler::load(dir.path(), executor).await.unwrap();
        let job = scheduler.add("@every 1s", "ping", "s1").await.unwrap();
        // Force it due immediately for the test instead of waiting a second.
        if let Some(mut entry) = scheduler.jobs.get_mut(&job.id) {
            entry.next_run = Utc::now() - chrono::Duration::seconds(1);
        }
        scheduler.tick().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let updated = scheduler.list().into_iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(updated.run_count, 1);
        assert!(updated.next_run > Utc::now());
    }

    #[tokio::test]
    async fn disabled_job_is_not_fired() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let dir = tempfile::tempdir().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let executor: CronExecutor = Arc::new(move |_task, _session| {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });
        let scheduler = CronScheduler::load(dir.path(), executor).await.unwrap();
        let job = scheduler.add("@every 1s", "ping", "s1").await.unwrap();
        scheduler.set_enabled(&job.id, false).await.unwrap();
        if let Some(mut entry) = scheduler.jobs.get_mut(&job.id) {
            entry.next_run = Utc::now() - chrono::Duration::seconds(1);
        }
        scheduler.tick().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
