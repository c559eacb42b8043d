//! Fixed-cadence frame fan-out.
//!
//! One tick task pulls the newest frame and offers it to every sink through
//! that sink's own bounded queue; one worker task per sink drains its queue.
//! The tick task never awaits a sink, so a slow sink only loses frames.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SessionPolicy;
use crate::media::{Frame, FrameSource};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Dropped,
    /// Shed because the output is gone. Counted as dropped, never as overrun.
    NoOutput,
}

/// The narrow contract the scheduler needs from an output.
#[async_trait]
pub trait FrameSink: Send {
    fn name(&self) -> &str;

    async fn submit(&mut self, frame: Frame) -> Result<SubmitOutcome>;

    /// Release every resource. Must be idempotent.
    async fn close(&mut self);
}

/// Things sinks and the scheduler report to the owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    SinkOverrun { sink: String, drop_ratio: f64 },
    SinkRecovered { sink: String },
    SinkFailed { sink: String, error: String },
    SourceLost { sink: String },
    SourceRestored { sink: String },
    InvariantViolation { sink: String, detail: String },
}

/// Report without ever blocking the caller.
pub(crate) fn notify(events: &mpsc::Sender<SchedulerEvent>, event: SchedulerEvent) {
    if let Err(e) = events.try_send(event) {
        match e {
            mpsc::error::TrySendError::Full(event) => warn!("Session event queue full, dropping {:?}", event),
            mpsc::error::TrySendError::Closed(_) => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub queue_depth: usize,
    pub overrun_threshold: f64,
    pub overrun_window: Duration,
}

impl SchedulerConfig {
    pub fn new(interval: Duration, policy: &SessionPolicy) -> Self {
        Self {
            interval,
            queue_depth: policy.sink_queue_depth.max(1),
            overrun_threshold: policy.overrun_threshold,
            overrun_window: policy.overrun_window(),
        }
    }
}

#[derive(Default)]
struct SinkCounters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    window_offered: AtomicU64,
    window_dropped: AtomicU64,
    overrun: AtomicBool,
    failed: AtomicBool,
}

impl SinkCounters {
    fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.window_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct TickCounters {
    ticks: AtomicU64,
    max_lateness_us: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SinkStats {
    pub name: String,
    pub delivered: u64,
    pub dropped: u64,
    pub overrun: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub max_lateness: Duration,
    pub sinks: Vec<SinkStats>,
}

struct SinkLane {
    name: String,
    tx: mpsc::Sender<Frame>,
    counters: Arc<SinkCounters>,
}

pub struct FrameScheduler {
    stop_tx: Option<oneshot::Sender<()>>,
    tick_task: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    ticks: Arc<TickCounters>,
    sinks: Vec<(String, Arc<SinkCounters>)>,
}

impl FrameScheduler {
    pub fn start(
        config: SchedulerConfig,
        source: Arc<dyn FrameSource>,
        sinks: Vec<Box<dyn FrameSink>>,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        let mut lanes = Vec::with_capacity(sinks.len());
        let mut workers = Vec::with_capacity(sinks.len());
        let mut registered = Vec::with_capacity(sinks.len());

        for sink in sinks {
            let name = sink.name().to_string();
            let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
            let counters = Arc::new(SinkCounters::default());
            workers.push(tokio::spawn(run_worker(sink, rx, counters.clone(), events.clone())));
            registered.push((name.clone(), counters.clone()));
            lanes.push(SinkLane { name, tx, counters });
        }

        let ticks = Arc::new(TickCounters::default());
        let (stop_tx, stop_rx) = oneshot::channel();
        info!(
            "Frame scheduler started: {:?} interval, {} sink(s)",
            config.interval,
            lanes.len()
        );
        let tick_task = tokio::spawn(run_ticks(config, source, lanes, ticks.clone(), events, stop_rx));

        Self {
            stop_tx: Some(stop_tx),
            tick_task: Some(tick_task),
            workers,
            ticks,
            sinks: registered,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let sinks: Vec<SinkStats> = self
            .sinks
            .iter()
            .map(|(name, c)| SinkStats {
                name: name.clone(),
                delivered: c.delivered.load(Ordering::Relaxed),
                dropped: c.dropped.load(Ordering::Relaxed),
                overrun: c.overrun.load(Ordering::Relaxed),
                failed: c.failed.load(Ordering::Relaxed),
            })
            .collect();
        SchedulerStats {
            ticks: self.ticks.ticks.load(Ordering::Relaxed),
            delivered: sinks.iter().map(|s| s.delivered).sum(),
            dropped: sinks.iter().map(|s| s.dropped).sum(),
            max_lateness: Duration::from_micros(self.ticks.max_lateness_us.load(Ordering::Relaxed)),
            sinks,
        }
    }

    /// Stop ticking, let each sink finish its current frame and close, and
    /// abort whatever has not finished within `timeout`. Idempotent.
    pub async fn stop(&mut self, timeout: Duration) -> SchedulerStats {
        let deadline = Instant::now() + timeout;

        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.tick_task.take() {
            // The tick task owns the queue senders; when it ends the workers
            // see their queues close.
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("Tick task did not stop in time");
            }
        }
        for worker in self.workers.drain(..) {
            let abort = worker.abort_handle();
            if tokio::time::timeout_at(deadline, worker).await.is_err() {
                warn!("Sink worker did not close in time, aborting");
                abort.abort();
            }
        }

        let stats = self.stats();
        debug!("Frame scheduler stopped: {:?}", stats);
        stats
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.tick_task.take() {
            task.abort();
        }
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

async fn run_ticks(
    config: SchedulerConfig,
    source: Arc<dyn FrameSource>,
    lanes: Vec<SinkLane>,
    ticks: Arc<TickCounters>,
    events: mpsc::Sender<SchedulerEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last: Option<Frame> = None;
    let mut window_started = Instant::now();

    loop {
        let scheduled = tokio::select! {
            _ = &mut stop_rx => break,
            scheduled = ticker.tick() => scheduled,
        };

        let lateness = scheduled.elapsed().as_micros() as u64;
        ticks.max_lateness_us.fetch_max(lateness, Ordering::Relaxed);
        ticks.ticks.fetch_add(1, Ordering::Relaxed);

        // Newest frame, or the previous one again if the producer is idle.
        if let Some(frame) = source.latest_frame() {
            last = Some(frame);
        }

        if let Some(frame) = &last {
            for lane in &lanes {
                lane.counters.window_offered.fetch_add(1, Ordering::Relaxed);
                match lane.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => lane.counters.drop_one(),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }

        if window_started.elapsed() >= config.overrun_window {
            window_started = Instant::now();
            evaluate_overrun(&lanes, config.overrun_threshold, &events);
        }
    }
    debug!("Tick loop exited after {} ticks", ticks.ticks.load(Ordering::Relaxed));
}

fn evaluate_overrun(lanes: &[SinkLane], threshold: f64, events: &mpsc::Sender<SchedulerEvent>) {
    for lane in lanes {
        let offered = lane.counters.window_offered.swap(0, Ordering::Relaxed);
        let dropped = lane.counters.window_dropped.swap(0, Ordering::Relaxed);
        if offered == 0 {
            continue;
        }
        let ratio = dropped as f64 / offered as f64;
        let was_overrun = lane.counters.overrun.load(Ordering::Relaxed);

        if ratio >= threshold && !was_overrun {
            lane.counters.overrun.store(true, Ordering::Relaxed);
            warn!("Sink {} overrun: dropped {}/{} frames", lane.name, dropped, offered);
            notify(
                events,
                SchedulerEvent::SinkOverrun {
                    sink: lane.name.clone(),
                    drop_ratio: ratio,
                },
            );
        } else if ratio < threshold && was_overrun {
            lane.counters.overrun.store(false, Ordering::Relaxed);
            info!("Sink {} keeping up again ({:.0}% dropped)", lane.name, ratio * 100.0);
            notify(events, SchedulerEvent::SinkRecovered { sink: lane.name.clone() });
        }
    }
}

async fn run_worker(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<Frame>,
    counters: Arc<SinkCounters>,
    events: mpsc::Sender<SchedulerEvent>,
) {
    let name = sink.name().to_string();
    let mut last_sequence: Option<u64> = None;

    while let Some(frame) = rx.recv().await {
        // Re-delivery of the same frame is fine; going backwards is not.
        if let Some(prev) = last_sequence {
            if frame.sequence() < prev {
                let detail = format!("frame {} delivered after frame {}", frame.sequence(), prev);
                error!("Sink {}: ordering violated, {}", name, detail);
                notify(&events, SchedulerEvent::InvariantViolation { sink: name.clone(), detail });
                break;
            }
        }
        last_sequence = Some(frame.sequence());

        match sink.submit(frame).await {
            Ok(SubmitOutcome::Accepted) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
                if counters.failed.swap(false, Ordering::Relaxed) {
                    info!("Sink {} recovered", name);
                    notify(&events, SchedulerEvent::SinkRecovered { sink: name.clone() });
                }
            }
            Ok(SubmitOutcome::Dropped) => counters.drop_one(),
            Ok(SubmitOutcome::NoOutput) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.drop_one();
                if !counters.failed.swap(true, Ordering::Relaxed) {
                    warn!("Sink {} failed: {}", name, e);
                    notify(
                        &events,
                        SchedulerEvent::SinkFailed {
                            sink: name.clone(),
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    sink.close().await;
    debug!("Sink worker {} finished", name);
}
