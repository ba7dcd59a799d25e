//! Cron-style job dispatch with an event bus.
//!
//! Jobs are registered with a cron expression and a handler; the scheduler
//! owns one task that sleeps until the earliest due fire time, plus one
//! spawned task per in-flight run.  A job that is still running when its
//! next tick arrives is skipped for that tick, so at most one run per job
//! is ever in flight.  The broadcast bus carries run lifecycle events and
//! accepts on-demand run requests, which are serialised with scheduled
//! runs through the same in-flight flag.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Work a job performs on each run.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Returns a short human outcome line for the bus.
    async fn run(&self) -> Result<String>;
}

/// Bus traffic: lifecycle notifications plus on-demand run requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    JobStarted { job: String },
    JobCompleted { job: String, outcome: String },
    JobFailed { job: String, error: String },
    /// Tick arrived while the previous run was still in flight.
    JobSkipped { job: String },
    /// Ask the scheduler to run a job now, outside its cron schedule.
    JobRequested { job: String },
}

#[derive(Debug, Default)]
pub struct JobStats {
    pub runs: AtomicU64,
    pub failures: AtomicU64,
}

struct Job {
    schedule: Schedule,
    handler: Arc<dyn JobHandler>,
    running: Arc<AtomicBool>,
    stats: Arc<JobStats>,
    next_fire: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    jobs: Mutex<HashMap<String, Job>>,
    bus: broadcast::Sender<BusEvent>,
    /// Subscription created at construction so run requests sent before the
    /// loop starts are not lost.  Taken once by [`Scheduler::run`].
    requests: Mutex<Option<broadcast::Receiver<BusEvent>>>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        let (bus, requests) = broadcast::channel(64);
        Self {
            jobs: Mutex::new(HashMap::new()),
            bus,
            requests: Mutex::new(Some(requests)),
            shutdown,
        }
    }

    /// Register a job.  The first fire time is computed immediately.
    pub fn register(
        &self,
        name: impl Into<String>,
        cron_expr: &str,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        let name = name.into();
        let schedule = Schedule::from_str(cron_expr)
            .with_context(|| format!("job '{name}' has an invalid schedule '{cron_expr}'"))?;
        let next_fire = schedule.upcoming(Utc).next();
        info!(job = %name, schedule = cron_expr, ?next_fire, "job registered");
        self.jobs.lock().unwrap().insert(
            name,
            Job {
                schedule,
                handler,
                running: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(JobStats::default()),
                next_fire,
            },
        );
        Ok(())
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Publish a run request onto the bus.  The scheduler loop picks it up.
    pub fn request_run(&self, job: &str) {
        let _ = self.bus.send(BusEvent::JobRequested {
            job: job.to_string(),
        });
    }

    pub fn stats_of(&self, job: &str) -> Option<Arc<JobStats>> {
        self.jobs.lock().unwrap().get(job).map(|entry| Arc::clone(&entry.stats))
    }

    /// Main loop.  Returns when the shutdown signal trips.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut bus_rx = self
            .requests
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| self.bus.subscribe());
        info!("scheduler started");
        loop {
            let sleep_duration = self.time_until_next_fire();
            tokio::select! {
                _ = shutdown.changed() => break,
                event = bus_rx.recv() => {
                    if let Ok(BusEvent::JobRequested { job }) = event {
                        self.fire(&job);
                    }
                }
                _ = tokio::time::sleep(sleep_duration) => {
                    for job in self.due_jobs() {
                        self.fire(&job);
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    fn time_until_next_fire(&self) -> std::time::Duration {
        let jobs = self.jobs.lock().unwrap();
        let next = jobs
            .values()
            .filter_map(|job| job.next_fire)
            .min();
        match next {
            Some(at) => (at - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
            // No jobs registered: just idle until a bus event or shutdown.
            None => std::time::Duration::from_secs(3600),
        }
    }

    /// Names of jobs whose fire time has passed; advances their schedules.
    fn due_jobs(&self) -> Vec<String> {
        let now = Utc::now();
        let mut due = Vec::new();
        let mut jobs = self.jobs.lock().unwrap();
        for (name, job) in jobs.iter_mut() {
            if let Some(at) = job.next_fire {
                if at <= now {
                    job.next_fire = job.schedule.upcoming(Utc).next();
                    due.push(name.clone());
                }
            }
        }
        due
    }

    /// Spawn one run of a job unless one is already in flight.
    fn fire(&self, name: &str) {
        let (handler, running, stats) = {
            let jobs = self.jobs.lock().unwrap();
            let Some(job) = jobs.get(name) else {
                warn!(job = name, "run requested for unknown job");
                return;
            };
            (
                Arc::clone(&job.handler),
                Arc::clone(&job.running),
                Arc::clone(&job.stats),
            )
        };

        if running.swap(true, Ordering::SeqCst) {
            debug!(job = name, "previous run still in flight — skipping tick");
            let _ = self.bus.send(BusEvent::JobSkipped {
                job: name.to_string(),
            });
            return;
        }

        let bus = self.bus.clone();
        let job_name = name.to_string();
        tokio::spawn(async move {
            let _ = bus.send(BusEvent::JobStarted {
                job: job_name.clone(),
            });
            let result = handler.run().await;
            stats.runs.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(outcome) => {
                    info!(job = %job_name, %outcome, "job completed");
                    let _ = bus.send(BusEvent::JobCompleted {
                        job: job_name.clone(),
                        outcome,
                    });
                }
                Err(err) => {
                    stats.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(job = %job_name, %err, "job failed");
                    let _ = bus.send(BusEvent::JobFailed {
                        job: job_name.clone(),
                        error: err.to_string(),
                    });
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct CountingHandler {
        runs: Arc<AtomicU64>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn run(&self) -> Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok("done".to_string())
        }
    }

    fn counting(delay: Duration, fail: bool) -> (Arc<CountingHandler>, Arc<AtomicU64>) {
        let runs = Arc::new(AtomicU64::new(0));
        (
            Arc::new(CountingHandler {
                runs: Arc::clone(&runs),
                delay,
                fail,
            }),
            runs,
        )
    }

    async fn wait_for_event(
        rx: &mut broadcast::Receiver<BusEvent>,
        want: impl Fn(&BusEvent) -> bool,
    ) -> BusEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for bus event")
                .expect("bus closed");
            if want(&event) {
                return event;
            }
        }
    }

    #[test]
    fn register_rejects_bad_cron() {
        let (_tx, rx) = watch::channel(false);
        let scheduler = Scheduler::new(rx);
        let (handler, _) = counting(Duration::ZERO, false);
        assert!(scheduler.register("bad", "whenever", handler).is_err());
    }

    #[tokio::test]
    async fn requested_run_executes_and_publishes_lifecycle() {
        let (_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(shutdown_rx));
        let (handler, runs) = counting(Duration::ZERO, false);
        // A schedule far in the future: only the explicit request fires it.
        scheduler
            .register("evolution", "0 0 0 1 1 * 2099", handler)
            .unwrap();

        let mut events = scheduler.subscribe();
        let task = tokio::spawn(Arc::clone(&scheduler).run());
        scheduler.request_run("evolution");

        wait_for_event(&mut events, |event| {
            matches!(event, BusEvent::JobCompleted { job, .. } if job == "evolution")
        })
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let (_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(shutdown_rx));
        let (handler, runs) = counting(Duration::from_secs(10), false);
        scheduler
            .register("slow", "0 0 0 1 1 * 2099", handler)
            .unwrap();

        let mut events = scheduler.subscribe();
        let task = tokio::spawn(Arc::clone(&scheduler).run());

        scheduler.request_run("slow");
        wait_for_event(&mut events, |event| {
            matches!(event, BusEvent::JobStarted { job } if job == "slow")
        })
        .await;

        // Second request while the first run is still sleeping.
        scheduler.request_run("slow");
        wait_for_event(&mut events, |event| {
            matches!(event, BusEvent::JobSkipped { job } if job == "slow")
        })
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[tokio::test]
    async fn failures_are_published_and_counted() {
        let (_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(shutdown_rx));
        let (handler, _) = counting(Duration::ZERO, true);
        scheduler
            .register("flaky", "0 0 0 1 1 * 2099", handler)
            .unwrap();

        let mut events = scheduler.subscribe();
        let task = tokio::spawn(Arc::clone(&scheduler).run());
        scheduler.request_run("flaky");

        let event = wait_for_event(&mut events, |event| {
            matches!(event, BusEvent::JobFailed { job, .. } if job == "flaky")
        })
        .await;
        match event {
            BusEvent::JobFailed { error, .. } => assert!(error.contains("handler exploded")),
            _ => unreachable!(),
        }
        let stats = scheduler.stats_of("flaky").unwrap();
        assert_eq!(stats.failures.load(Ordering::Relaxed), 1);
        task.abort();
    }

    #[tokio::test]
    async fn cron_tick_fires_due_job() {
        let (_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(shutdown_rx));
        let (handler, runs) = counting(Duration::ZERO, false);
        // Every second.
        scheduler.register("tick", "* * * * * *", handler).unwrap();

        let mut events = scheduler.subscribe();
        let task = tokio::spawn(Arc::clone(&scheduler).run());
        wait_for_event(&mut events, |event| {
            matches!(event, BusEvent::JobCompleted { job, .. } if job == "tick")
        })
        .await;
        assert!(runs.load(Ordering::SeqCst) >= 1);
        task.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(Scheduler::new(shutdown_rx));
        let task = tokio::spawn(Arc::clone(&scheduler).run());
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("scheduler did not stop on shutdown")
            .unwrap();
    }
}
