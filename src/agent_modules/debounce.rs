//! Flap suppression: decides whether a checker result is accepted as the
//! job's status or whether the job is attempted again first.
//!
//! A job with no settled state needs `sens + 1` agreeing results before its
//! first status is declared. A settled job needs `sens` consecutive
//! disagreeing results before its status flips. `sens <= 0`, or a result
//! flagged as a validation error, is accepted immediately.
use std::time::Duration;

use super::job::{CheckJob, CheckResult, EventInfo, JobState};

/// Pause between debounce re-attempts of the same job.
pub const RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Location entries kept per job.
pub const LOCATION_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Attempt the same job again after [`RETRY_DELAY`].
    Retry,
    /// Accept the result.
    Finalize,
}

/// How a finalized result changed the job's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Result agrees with the settled state.
    Confirmed(JobState),
    /// First settled state for a new job.
    Declared(JobState),
    WentDown,
    WentUp,
}

/// Feeds one result into the job's debounce counters.
pub fn evaluate(job: &mut CheckJob, result: &CheckResult) -> Verdict {
    if result.override_debounce || job.sens <= 0 {
        return Verdict::Finalize;
    }
    let threshold = job.sens as u32;

    match job.state {
        None => {
            let counter = if result.success {
                job.newpass.get_or_insert(0)
            } else {
                job.newfail.get_or_insert(0)
            };
            *counter += 1;
            if *counter > threshold {
                Verdict::Finalize
            } else {
                job.retry += 1;
                Verdict::Retry
            }
        }
        Some(state) if state.is_up() == result.success => Verdict::Finalize,
        Some(_) => {
            job.retry += 1;
            if job.retry < threshold {
                Verdict::Retry
            } else {
                Verdict::Finalize
            }
        }
    }
}

/// Accepts `result` as the job's status: resets debounce counters, records
/// the down episode, drops per-attempt context and stamps the reporting agent.
pub fn finalize(job: &mut CheckJob, result: CheckResult, agent_id: &str) -> Transition {
    job.retry = 0;
    job.newpass = None;
    job.newfail = None;

    let new_state = JobState::from_success(result.success);
    let transition = match (job.state, new_state) {
        (None, state) => Transition::Declared(state),
        (Some(previous), state) if previous == state => Transition::Confirmed(state),
        (Some(_), JobState::Down) => Transition::WentDown,
        (Some(_), JobState::Up) => Transition::WentUp,
    };

    match transition {
        Transition::WentDown | Transition::Declared(JobState::Down) => {
            job.firstdown = result.end;
            job.eventinfo = Some(EventInfo {
                code: result.status_code.clone(),
                message: result.message.clone(),
                start: result.start,
                end: 0,
                event_type: "down".to_string(),
            });
        }
        Transition::WentUp => {
            job.firstdown = 0;
            if let Some(event) = job.eventinfo.as_mut() {
                event.end = result.end;
            }
        }
        _ => {}
    }

    job.state = Some(new_state);
    job.attempt.clear();
    job.location.insert(result.end.to_string(), agent_id.to_string());
    while job.location.len() > LOCATION_HISTORY {
        job.location.pop_first();
    }
    job.results = Some(result);
    transition
}
