//! Wall-clock scheduler
//!
//! Fires the per-timeframe pipelines at local wall-clock boundaries,
//! sleeping until the next boundary rather than polling. A missed boundary
//! (process pause, slow analysis) fires exactly once on wake; multiple
//! missed firings are never replayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analysis::types::Timeframe;
use crate::pipeline::{Pipeline, PipelineError};
use crate::trading::records::TriggerKind;

/// Local hours at which the 4h pass fires.
const H4_HOURS: [u32; 6] = [1, 5, 9, 13, 17, 21];
/// Local hour of the daily pass.
const D1_HOUR: u32 = 1;

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Draining,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Resolve a naive local time in `tz`, falling forward across DST gaps.
fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive).earliest().unwrap_or_else(|| {
        tz.from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .expect("time exists one hour past a DST gap")
    })
}

fn at(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Tz> {
    resolve_local(
        tz,
        date.and_time(NaiveTime::from_hms_opt(hour, minute, 0).expect("valid wall-clock time")),
    )
}

/// The next firing instant for `tf` strictly after `after`: truncate down to
/// the period boundary, then add one period.
pub fn next_fire(tf: Timeframe, after: DateTime<Tz>) -> DateTime<Tz> {
    let tz = after.timezone();
    let local = after.naive_local();
    let date = local.date();

    match tf {
        Timeframe::M15 => {
            let block = local.minute() / 15 * 15;
            at(&tz, date, local.hour(), block) + chrono::Duration::minutes(15)
        }
        Timeframe::H1 => at(&tz, date, local.hour(), 0) + chrono::Duration::hours(1),
        Timeframe::H4 => {
            for hour in H4_HOURS {
                let candidate = at(&tz, date, hour, 0);
                if candidate > after {
                    return candidate;
                }
            }
            at(&tz, date.succ_opt().expect("valid next day"), H4_HOURS[0], 0)
        }
        Timeframe::D1 => {
            let today = at(&tz, date, D1_HOUR, 0);
            if today > after {
                today
            } else {
                at(&tz, date.succ_opt().expect("valid next day"), D1_HOUR, 0)
            }
        }
        Timeframe::Final => unreachable!("the combined pass is not boundary-scheduled"),
    }
}

/// The boundary that is due given the last recorded firing, if any. When
/// several boundaries were missed, only the most recent elapsed one is
/// returned (fire once, resume).
fn due_boundary(
    tf: Timeframe,
    last_fired: DateTime<Tz>,
    now: DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    let mut candidate = next_fire(tf, last_fired);
    if candidate > now {
        return None;
    }
    loop {
        let following = next_fire(tf, candidate);
        if following > now {
            return Some(candidate);
        }
        candidate = following;
    }
}

pub struct Scheduler {
    state: Arc<StdMutex<SchedulerState>>,
    shutdown_tx: watch::Sender<bool>,
    loop_handle: JoinHandle<()>,
    dispatched: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Start the schedule loop. `enable_15m` adds the quarter-hour pass.
    pub fn start(pipeline: Arc<Pipeline>, timezone: Tz, enable_15m: bool) -> Self {
        let mut timeframes = vec![Timeframe::H1, Timeframe::H4, Timeframe::D1];
        if enable_15m {
            timeframes.insert(0, Timeframe::M15);
        }

        let state = Arc::new(StdMutex::new(SchedulerState::Running));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatched = Arc::new(StdMutex::new(Vec::new()));

        let loop_handle = tokio::spawn(run_loop(
            pipeline,
            timezone,
            timeframes,
            shutdown_rx,
            dispatched.clone(),
        ));

        Self {
            state,
            shutdown_tx,
            loop_handle,
            dispatched,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Stop firing and let in-flight passes finish within `grace`.
    pub async fn stop(self, grace: Duration) {
        *self.state.lock().expect("state lock poisoned") = SchedulerState::Draining;
        let _ = self.shutdown_tx.send(true);
        let _ = self.loop_handle.await;

        let pending: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.dispatched.lock().expect("dispatch lock poisoned"));
        if pending.is_empty() {
            info!("scheduler stopped, no passes in flight");
        } else {
            info!("scheduler draining {} in-flight pass(es)", pending.len());
            let drain = async {
                for handle in pending {
                    let _ = handle.await;
                }
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                warn!("in-flight passes exceeded {:?} grace, abandoning", grace);
            }
        }
        *self.state.lock().expect("state lock poisoned") = SchedulerState::Stopped;
    }
}

async fn run_loop(
    pipeline: Arc<Pipeline>,
    timezone: Tz,
    timeframes: Vec<Timeframe>,
    mut shutdown: watch::Receiver<bool>,
    dispatched: Arc<StdMutex<Vec<JoinHandle<()>>>>,
) {
    let mut last_fired: HashMap<Timeframe, DateTime<Tz>> = HashMap::new();
    info!(
        "scheduler started ({}), timeframes: {}",
        timezone,
        timeframes
            .iter()
            .map(|tf| tf.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    loop {
        let now = chrono::Utc::now().with_timezone(&timezone);

        // Fire whatever is due (catch-up fires at most once per timeframe).
        for &tf in &timeframes {
            // First pass after startup anchors at `now`: nothing fires until
            // the next boundary.
            let last = *last_fired.entry(tf).or_insert(now);
            if let Some(scheduled) = due_boundary(tf, last, now) {
                // Record the scheduled instant, not receipt time, so
                // alignment survives process pauses.
                last_fired.insert(tf, scheduled);
                info!("{} boundary {} fired", tf, scheduled);
                dispatch(&pipeline, tf, &dispatched);
            }
        }

        // Sleep until the earliest upcoming boundary.
        let wake = timeframes
            .iter()
            .map(|&tf| next_fire(tf, now))
            .min()
            .expect("at least one timeframe scheduled");
        let sleep_for = (wake - now).to_std().unwrap_or(Duration::from_secs(1));

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => {
                info!("scheduler loop stopping");
                break;
            }
        }
    }
}

fn dispatch(pipeline: &Arc<Pipeline>, tf: Timeframe, dispatched: &Arc<StdMutex<Vec<JoinHandle<()>>>>) {
    let pipeline = pipeline.clone();
    let handle = tokio::spawn(async move {
        match pipeline.run_timeframe(tf).await {
            // Every successful 4h pass chains the combined pass.
            Ok(_) if tf == Timeframe::H4 => {
                if let Err(PipelineError::Busy(_)) = pipeline.run_final(TriggerKind::Auto).await {
                    warn!("combined pass dropped: previous one still in flight");
                }
            }
            Ok(_) => {}
            Err(PipelineError::Busy(_)) => {
                // Single-flight: the previous run is still going; drop.
            }
            Err(_) => {
                // Failure events were already published by the pipeline.
            }
        }
    });

    let mut handles = dispatched.lock().expect("dispatch lock poisoned");
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
}
