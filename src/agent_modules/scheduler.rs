//! Dispatch of due checks.
//!
//! Every cycle the scheduler picks the jobs whose `runat` has passed, spreads
//! their start times over the burst window, and runs each one in its own task
//! through the envelope and the debounce machine until it finalizes.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::checklist::Checklist;
use super::context::AgentContext;
use super::debounce::{self, Transition, Verdict};
use super::job::{CheckJob, CheckResult, now_ms};

/// Window over which a batch of due jobs is spread.
pub const BURST_WINDOW_MS: i64 = 50_000;
/// Batches outside this range start all at once.
pub const STAGGER_MIN_JOBS: usize = 5;
pub const STAGGER_MAX_JOBS: usize = 500;
/// How far behind "now" a rescheduled job may be placed after downtime.
pub const CATCH_UP_MS: i64 = 5_000;
/// New or changed jobs are placed this far in the past so the next cycle
/// picks them up.
pub const NEW_JOB_LEAD_MS: i64 = 5_000;

/// Builds the next checklist from a control-plane list.
///
/// An incoming job keeps the schedule and debounce state of the entry with
/// the same id. If its descriptor is newer than that entry it is also moved
/// to the front of the queue; unknown ids are queued immediately. Ids absent
/// from `incoming` are dropped.
pub fn reconcile(old: &Checklist, incoming: Vec<CheckJob>, now: i64) -> Checklist {
    let mut next = Checklist::new();
    for mut job in incoming {
        match old.get(&job.id) {
            Some(previous) => {
                let changed = job.modified > previous.modified;
                job.inherit_engine_state(previous);
                if changed {
                    job.runat = now - NEW_JOB_LEAD_MS;
                }
            }
            None => job.runat = now - NEW_JOB_LEAD_MS,
        }
        next.insert(job);
    }
    next
}

/// Due jobs ordered by `runat`, ties in arrival order. Jobs in `skip` are
/// still executing and are left out.
pub fn select_due(checklist: &Checklist, now: i64, skip: &HashSet<String>) -> Vec<CheckJob> {
    let mut due: Vec<CheckJob> = checklist
        .iter()
        .filter(|job| job.runat <= now && !skip.contains(&job.id))
        .cloned()
        .collect();
    due.sort_by_key(|job| job.runat);
    due
}

/// Gap between consecutive dispatches for a batch of `n` jobs.
pub fn stagger_step_ms(n: usize, heartbeat_offset_ms: i64) -> i64 {
    if !(STAGGER_MIN_JOBS..=STAGGER_MAX_JOBS).contains(&n) {
        return 0;
    }
    (BURST_WINDOW_MS - heartbeat_offset_ms).max(0) / n as i64
}

pub fn stagger_delays(n: usize, heartbeat_offset_ms: i64) -> Vec<Duration> {
    let step = stagger_step_ms(n, heartbeat_offset_ms);
    (0..n)
        .map(|i| Duration::from_millis((i as i64 * step) as u64))
        .collect()
}

/// Next due time after a finalized run. Never more than [`CATCH_UP_MS`]
/// behind `now`, so a long outage produces one catch-up run rather than one
/// per missed interval.
pub fn reschedule(runat: i64, interval_ms: i64, now: i64) -> i64 {
    let next = runat + interval_ms;
    if next < now { now - CATCH_UP_MS } else { next }
}

/// Copies the engine-owned fields of a finalized job onto the current entry.
/// A descriptor replaced while the job ran keeps its own `runat`.
fn write_back(entry: &mut CheckJob, finalized: &CheckJob) {
    if entry.modified <= finalized.modified {
        entry.runat = finalized.runat;
    }
    entry.state = finalized.state;
    entry.retry = finalized.retry;
    entry.newpass = finalized.newpass;
    entry.newfail = finalized.newfail;
    entry.firstdown = finalized.firstdown;
    entry.eventinfo = finalized.eventinfo.clone();
    entry.location = finalized.location.clone();
    entry.results = finalized.results.clone();
}

/// Removes a job from the in-flight set when its task ends, however it ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<AgentContext>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<AgentContext>) -> Self {
        Self {
            ctx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs a cycle immediately and then every `check_interval` seconds
    /// until shutdown.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            self.run_cycle();
            let interval = Duration::from_secs(self.ctx.config().check_interval_secs());
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!(in_flight = self.in_flight(), "Shutdown signal received, scheduler stops dispatching.");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Dispatches every due job. A job leaves the in-flight set once it is
    /// written back; the returned handles complete after its result has been
    /// handed to the publisher.
    pub fn run_cycle(&self) -> Vec<JoinHandle<()>> {
        let now = now_ms();
        self.ctx.mark_cycle(now);

        let due = {
            let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            self.ctx
                .store
                .read(|checklist| select_due(checklist, now, &in_flight))
        };
        let offset_ms = self.ctx.config().heartbeat_offset_secs() as i64 * 1000;
        let delays = stagger_delays(due.len(), offset_ms);
        // An empty cycle must not supersede one still completing.
        let cycle_id = if due.is_empty() {
            0
        } else {
            info!(
                due = due.len(),
                step_ms = stagger_step_ms(due.len(), offset_ms),
                "Dispatching due checks."
            );
            self.ctx.store.begin_cycle(due.len())
        };

        let mut handles = Vec::with_capacity(due.len());
        for (job, delay) in due.into_iter().zip(delays) {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(job.id.clone());
            let guard = InFlightGuard {
                in_flight: Arc::clone(&self.in_flight),
                id: job.id.clone(),
            };
            let ctx = Arc::clone(&self.ctx);
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let (job, result) = attempt_job(&ctx, job).await;
                let job = settle_job(&ctx, job, result, now_ms());
                ctx.store.record_completion(cycle_id).await;
                // The next run may be due while delivery is still retrying.
                drop(guard);
                ctx.publish(&job).await;
            }));
        }
        handles
    }
}

/// Attempts one job until the debounce machine accepts a result.
pub async fn attempt_job(ctx: &AgentContext, mut job: CheckJob) -> (CheckJob, CheckResult) {
    loop {
        let result = ctx.envelope.invoke(&mut job).await;
        match debounce::evaluate(&mut job, &result) {
            Verdict::Finalize => return (job, result),
            Verdict::Retry => {
                debug!(
                    check_id = %job.id,
                    retry = job.retry,
                    success = result.success,
                    "Result not yet confirmed; retrying."
                );
                tokio::time::sleep(debounce::RETRY_DELAY).await;
            }
        }
    }
}

/// Accepts `result`, reschedules the job and writes it back to the
/// checklist. Returns the finalized job, ready to publish.
pub fn settle_job(ctx: &AgentContext, mut job: CheckJob, result: CheckResult, now: i64) -> CheckJob {
    let transition = debounce::finalize(&mut job, result, &ctx.check_id());
    job.runat = reschedule(job.runat, job.interval_ms(), now);

    let written = ctx.store.update(|checklist| match checklist.get_mut(&job.id) {
        Some(entry) => {
            write_back(entry, &job);
            true
        }
        None => false,
    });

    match transition {
        Transition::WentDown | Transition::WentUp | Transition::Declared(_) => {
            info!(check_id = %job.id, label = %job.label, ?transition, "Check status changed.")
        }
        Transition::Confirmed(_) => {
            debug!(check_id = %job.id, ?transition, "Check status confirmed.")
        }
    }
    if !written {
        warn!(check_id = %job.id, "Check was removed while running; result is reported but not kept.");
    }
    job
}

/// Settles `result` outside any dispatch cycle and ships it.
pub async fn finalize_job(ctx: &AgentContext, job: CheckJob, result: CheckResult, now: i64) {
    let job = settle_job(ctx, job, result, now);
    ctx.publish(&job).await;
}

/// Runs one job to completion outside any dispatch cycle.
pub async fn run_job(ctx: &AgentContext, job: CheckJob) {
    let (job, result) = attempt_job(ctx, job).await;
    finalize_job(ctx, job, result, now_ms()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_modules::job::JobState;

    fn job(id: &str, runat: i64) -> CheckJob {
        let mut job = CheckJob::new(id, "http", 1);
        job.runat = runat;
        job
    }

    #[test]
    fn test_reconcile_carries_state_for_unchanged_jobs() {
        let now = 1_000_000;
        let mut known = job("a", 900_000);
        known.modified = 50;
        known.state = Some(JobState::Down);
        known.retry = 1;
        known.firstdown = 800_000;
        let old = Checklist::from_jobs(vec![known, job("gone", 0)]);

        let mut same = CheckJob::new("a", "http", 1);
        same.modified = 50;
        let incoming = vec![CheckJob::new("fresh", "port", 1), same];

        let next = reconcile(&old, incoming, now);
        let a = next.get("a").unwrap();
        assert_eq!(a.runat, 900_000);
        assert_eq!(a.state, Some(JobState::Down));
        assert_eq!(a.retry, 1);
        assert_eq!(a.firstdown, 800_000);
        assert_eq!(next.get("fresh").unwrap().runat, now - NEW_JOB_LEAD_MS);
        assert!(next.get("gone").is_none());
        let ids: Vec<&str> = next.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "a"]);
    }

    #[test]
    fn test_reconcile_newer_descriptor_runs_next_cycle_keeping_state() {
        let now = 1_000_000;
        let mut known = job("a", 1_200_000);
        known.modified = 50;
        known.state = Some(JobState::Up);
        known.newpass = Some(1);
        let old = Checklist::from_jobs(vec![known]);

        let mut updated = CheckJob::new("a", "http", 10);
        updated.modified = 60;
        let next = reconcile(&old, vec![updated], now);

        let a = next.get("a").unwrap();
        assert_eq!(a.runat, now - NEW_JOB_LEAD_MS);
        assert_eq!(a.interval, 10);
        assert_eq!(a.state, Some(JobState::Up));
        assert_eq!(a.newpass, Some(1));
    }

    #[test]
    fn test_select_due_orders_by_runat_then_arrival() {
        let checklist = Checklist::from_jobs(vec![
            job("late", 300),
            job("tie-1", 100),
            job("future", 5_000),
            job("tie-2", 100),
            job("early", 50),
        ]);
        let due = select_due(&checklist, 1_000, &HashSet::new());
        let ids: Vec<&str> = due.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "tie-1", "tie-2", "late"]);

        let skip: HashSet<String> = ["tie-1".to_string()].into_iter().collect();
        let due = select_due(&checklist, 1_000, &skip);
        assert_eq!(due.len(), 3);
        assert!(due.iter().all(|j| j.id != "tie-1"));
    }

    #[test]
    fn test_stagger_bounds() {
        for n in [0usize, 1, 4, 501, 1000] {
            assert!(stagger_delays(n, 10_000).iter().all(|d| d.is_zero()), "n = {n}");
        }

        for (n, offset) in [(5usize, 0i64), (10, 12_000), (123, 39_000), (500, 7_000)] {
            let delays = stagger_delays(n, offset);
            let step = (BURST_WINDOW_MS - offset) / n as i64;
            assert_eq!(delays.len(), n);
            assert!(delays[0].is_zero());
            for pair in delays.windows(2) {
                assert_eq!((pair[1] - pair[0]).as_millis() as i64, step);
            }
            assert!(delays[n - 1].as_millis() as i64 <= BURST_WINDOW_MS);
        }
    }

    #[test]
    fn test_reschedule_bounded_catch_up() {
        let minute = 60_000;
        assert_eq!(reschedule(1_000_000, minute, 1_000_500), 1_060_000);
        assert_eq!(reschedule(1_000_000, minute, 5_000_000), 5_000_000 - CATCH_UP_MS);

        let mut runat = 0;
        let mut now = 10_000_000;
        for _ in 0..20 {
            let next = reschedule(runat, minute, now);
            assert!(next >= now - CATCH_UP_MS);
            assert!(next >= runat);
            runat = next;
            now += 7 * minute;
        }
    }

    #[test]
    fn test_write_back_respects_replaced_descriptor() {
        let mut finalized = job("a", 2_000);
        finalized.modified = 10;
        finalized.state = Some(JobState::Up);

        let mut same = job("a", 1_000);
        same.modified = 10;
        write_back(&mut same, &finalized);
        assert_eq!(same.runat, 2_000);
        assert_eq!(same.state, Some(JobState::Up));

        let mut replaced = job("a", 500);
        replaced.modified = 11;
        replaced.interval = 15;
        write_back(&mut replaced, &finalized);
        assert_eq!(replaced.runat, 500);
        assert_eq!(replaced.interval, 15);
        assert_eq!(replaced.state, Some(JobState::Up));
    }
}
