//! Wall-clock aligned periodic jobs.
//!
//! A job scheduled with `(interval_minutes, target_second)` runs at the next minute that is a
//! multiple of `interval_minutes`, at `target_second` past that minute, in market local time.
//! Any job error stops that job's loop; an operator restarts it via the [`JobRegistry`].

use crate::{
    clock::{LocalTime, now_local},
    error::JobError,
    notify::{Notifier, notify_best_effort},
};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Timelike};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// When a periodic job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSpec {
    interval_minutes: u32,
    target_second: u32,
}

impl ScheduleSpec {
    pub fn new(interval_minutes: u32, target_second: u32) -> Result<Self, JobError> {
        if interval_minutes == 0 || target_second >= 60 {
            return Err(JobError::App(format!(
                "invalid schedule: every {interval_minutes} minutes at second {target_second}"
            )));
        }
        Ok(Self {
            interval_minutes,
            target_second,
        })
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    pub fn target_second(&self) -> u32 {
        self.target_second
    }

    /// Next aligned run strictly after `now`.
    pub fn next_run_after(&self, now: LocalTime) -> LocalTime {
        let interval = self.interval_minutes;
        let bucket = (now.minute() / interval + 1) * interval;

        let hour_start = now - ChronoDuration::minutes(i64::from(now.minute()))
            - ChronoDuration::seconds(i64::from(now.second()))
            - ChronoDuration::nanoseconds(i64::from(now.nanosecond()));

        let mut next = hour_start
            + ChronoDuration::minutes(i64::from(bucket % 60))
            + ChronoDuration::seconds(i64::from(self.target_second));

        if bucket >= 60 {
            next += ChronoDuration::hours(1);
        }
        if next <= now {
            next += ChronoDuration::minutes(i64::from(interval));
        }

        next
    }

    /// Time to sleep from `now` until the next run.
    pub fn delay_from(&self, now: LocalTime) -> Duration {
        (self.next_run_after(now) - now)
            .to_std()
            .unwrap_or_default()
    }
}

/// A named unit of periodic work.
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<(), JobError>;
}

/// Why a scheduling loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExit {
    Cancelled,
    Failed(JobError),
}

/// Run `job` on `spec` until it fails or `cancel` fires.
///
/// Cancellation during the sleep skips that cycle's run entirely.
pub async fn run_schedule(
    spec: ScheduleSpec,
    job: Arc<dyn ScheduledJob>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) -> ScheduleExit {
    let name = job.name().to_owned();

    let failure = loop {
        let now = now_local();
        let next_run = spec.next_run_after(now);
        let delay = spec.delay_from(now);
        info!(
            job = %name,
            next_run = %next_run.format("%Y-%m-%d %H:%M:%S"),
            delay_secs = delay.as_secs_f64(),
            "scheduled next run"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job = %name, "schedule cancelled");
                return ScheduleExit::Cancelled;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let started = tokio::time::Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(job = %name, "schedule cancelled during run");
                return ScheduleExit::Cancelled;
            }
            outcome = job.run() => outcome,
        };

        match outcome {
            Ok(()) => info!(
                job = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cycle completed"
            ),
            Err(JobError::App(reason)) => {
                error!(job = %name, %reason, "error in scheduled job");
                notify_best_effort(
                    notifier.as_ref(),
                    &format!("[Scheduler] {reason} for task {name}"),
                )
                .await;
                break JobError::App(reason);
            }
            Err(JobError::Unexpected(reason)) => {
                error!(job = %name, %reason, "unexpected error in scheduled job");
                notify_best_effort(
                    notifier.as_ref(),
                    &format!("[Scheduler] Unexpected error: {reason} for task {name}"),
                )
                .await;
                break JobError::Unexpected(reason);
            }
        }
    };

    info!(job = %name, "exiting scheduler");
    notify_best_effort(
        notifier.as_ref(),
        &format!("[Scheduler] Exiting the scheduler for task {name}"),
    )
    .await;

    ScheduleExit::Failed(failure)
}

/// Errors returned by [`JobRegistry`] control operations.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum RegistryError {
    #[error("unknown job: {0}")]
    UnknownJob(SmolStr),

    #[error("job {0} is already running")]
    AlreadyRunning(SmolStr),

    #[error("job {0} is not running")]
    NotRunning(SmolStr),
}

struct Entry {
    spec: ScheduleSpec,
    job: Arc<dyn ScheduledJob>,
    running: Option<Running>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<ScheduleExit>,
}

/// Status of one registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub name: SmolStr,
    pub interval_minutes: u32,
    pub target_second: u32,
    pub running: bool,
}

/// Named scheduled jobs that can be started and stopped independently.
pub struct JobRegistry {
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
    jobs: Mutex<FnvHashMap<SmolStr, Entry>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.status())
            .finish()
    }
}

impl JobRegistry {
    /// Every started job runs under a child of `shutdown`.
    pub fn new(notifier: Arc<dyn Notifier>, shutdown: CancellationToken) -> Self {
        Self {
            notifier,
            shutdown,
            jobs: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn register(&self, spec: ScheduleSpec, job: Arc<dyn ScheduledJob>) {
        let name = SmolStr::new(job.name());
        self.jobs.lock().insert(
            name,
            Entry {
                spec,
                job,
                running: None,
            },
        );
    }

    pub fn start(&self, name: &str) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownJob(SmolStr::new(name)))?;

        if entry
            .running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            return Err(RegistryError::AlreadyRunning(SmolStr::new(name)));
        }

        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(run_schedule(
            entry.spec,
            Arc::clone(&entry.job),
            Arc::clone(&self.notifier),
            cancel.clone(),
        ));
        entry.running = Some(Running { cancel, task });

        info!(job = name, "started scheduled job");
        Ok(())
    }

    pub fn stop(&self, name: &str) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock();
        let entry = jobs
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownJob(SmolStr::new(name)))?;

        match entry.running.take() {
            Some(running) if !running.task.is_finished() => {
                running.cancel.cancel();
                info!(job = name, "stopped scheduled job");
                Ok(())
            }
            _ => Err(RegistryError::NotRunning(SmolStr::new(name))),
        }
    }

    /// Run a registered job once, outside its schedule.
    pub async fn run_once(&self, name: &str) -> Result<Result<(), JobError>, RegistryError> {
        let job = self
            .jobs
            .lock()
            .get(name)
            .map(|entry| Arc::clone(&entry.job))
            .ok_or_else(|| RegistryError::UnknownJob(SmolStr::new(name)))?;

        Ok(job.run().await)
    }

    pub fn status(&self) -> Vec<JobStatus> {
        let mut status = self
            .jobs
            .lock()
            .iter()
            .map(|(name, entry)| JobStatus {
                name: name.clone(),
                interval_minutes: entry.spec.interval_minutes,
                target_second: entry.spec.target_second,
                running: entry
                    .running
                    .as_ref()
                    .is_some_and(|running| !running.task.is_finished()),
            })
            .collect::<Vec<_>>();

        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Cancel every running job.
    pub fn stop_all(&self) {
        for entry in self.jobs.lock().values_mut() {
            if let Some(running) = entry.running.take() {
                running.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{RecordingNotifier, time};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        name: &'static str,
        runs: AtomicUsize,
        outcome: Result<(), JobError>,
    }

    impl CountingJob {
        fn new(name: &'static str, outcome: Result<(), JobError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                runs: AtomicUsize::new(0),
                outcome,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScheduledJob for CountingJob {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[test]
    fn test_schedule_spec_next_run_after() {
        struct TestCase {
            spec: ScheduleSpec,
            now: LocalTime,
            expected: LocalTime,
        }

        let tests = vec![
            TestCase {
                // TC0: every minute at second 5
                spec: ScheduleSpec::new(1, 5).unwrap(),
                now: time(9, 15, 7),
                expected: time(9, 16, 5),
            },
            TestCase {
                // TC1: rounds up to the next multiple of the interval
                spec: ScheduleSpec::new(5, 0).unwrap(),
                now: time(9, 17, 30),
                expected: time(9, 20, 0),
            },
            TestCase {
                // TC2: exactly on a boundary schedules the following one
                spec: ScheduleSpec::new(5, 0).unwrap(),
                now: time(9, 20, 0),
                expected: time(9, 25, 0),
            },
            TestCase {
                // TC3: carries into the next hour
                spec: ScheduleSpec::new(15, 30).unwrap(),
                now: time(9, 50, 0),
                expected: time(10, 0, 30),
            },
            TestCase {
                // TC4: target second earlier in the current minute still moves forward
                spec: ScheduleSpec::new(1, 5).unwrap(),
                now: time(9, 15, 3),
                expected: time(9, 16, 5),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.spec.next_run_after(test.now);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_schedule_spec_delay_and_validation() {
        let spec = ScheduleSpec::new(1, 5).unwrap();
        assert_eq!(spec.delay_from(time(9, 15, 7)), Duration::from_secs(58));

        assert!(ScheduleSpec::new(0, 5).is_err());
        assert!(ScheduleSpec::new(1, 60).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_schedule_cancel_mid_sleep_skips_job() {
        let job = CountingJob::new("refresh", Ok(()));
        let notifier = Arc::new(RecordingNotifier::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_schedule(
            ScheduleSpec::new(1, 0).unwrap(),
            job.clone(),
            notifier.clone(),
            cancel.clone(),
        ));

        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), ScheduleExit::Cancelled);
        assert_eq!(job.runs(), 0);
        assert!(notifier.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_schedule_job_error_ends_loop_and_notifies() {
        let job = CountingJob::new("update_oi", Err(JobError::App("Upstream rejected".into())));
        let notifier = Arc::new(RecordingNotifier::default());

        let actual = run_schedule(
            ScheduleSpec::new(1, 0).unwrap(),
            job.clone(),
            notifier.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(actual, ScheduleExit::Failed(JobError::App("Upstream rejected".into())));
        assert_eq!(job.runs(), 1);
        assert_eq!(
            notifier.messages(),
            vec![
                "[Scheduler] Upstream rejected for task update_oi".to_string(),
                "[Scheduler] Exiting the scheduler for task update_oi".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_schedule_repeats_until_failure() {
        struct FailsOnThird(AtomicUsize);

        #[async_trait]
        impl ScheduledJob for FailsOnThird {
            fn name(&self) -> &str {
                "flaky"
            }

            async fn run(&self) -> Result<(), JobError> {
                match self.0.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Ok(()),
                    _ => Err(JobError::Unexpected("boom".into())),
                }
            }
        }

        let job = Arc::new(FailsOnThird(AtomicUsize::new(0)));
        let notifier = Arc::new(RecordingNotifier::default());

        let actual = run_schedule(
            ScheduleSpec::new(1, 0).unwrap(),
            job.clone(),
            notifier.clone(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(actual, ScheduleExit::Failed(JobError::Unexpected("boom".into())));
        assert_eq!(job.0.load(Ordering::SeqCst), 3);
        assert_eq!(
            notifier.messages()[0],
            "[Scheduler] Unexpected error: boom for task flaky"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_registry_start_stop_status() {
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = JobRegistry::new(notifier, CancellationToken::new());
        let job = CountingJob::new("refresh", Ok(()));
        registry.register(ScheduleSpec::new(5, 0).unwrap(), job.clone());

        assert_eq!(
            registry.start("missing"),
            Err(RegistryError::UnknownJob("missing".into()))
        );
        assert_eq!(
            registry.stop("refresh"),
            Err(RegistryError::NotRunning("refresh".into()))
        );

        registry.start("refresh").unwrap();
        assert_eq!(
            registry.start("refresh"),
            Err(RegistryError::AlreadyRunning("refresh".into()))
        );
        assert!(registry.status()[0].running);

        registry.stop("refresh").unwrap();
        tokio::task::yield_now().await;
        assert!(!registry.status()[0].running);
        assert_eq!(job.runs(), 0);

        assert_eq!(registry.run_once("refresh").await, Ok(Ok(())));
        assert_eq!(job.runs(), 1);
    }
}
