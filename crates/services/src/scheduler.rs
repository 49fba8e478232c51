//! # Scheduler
//!
//! Drives the upkeep tasks on three fixed tiers:
//!
//! * every second: flush open post bodies and spam scores
//! * every minute: close dangling posts, drop expired rows
//! * every hour: identity removal, thread and board pruning, vacuum and
//!   orphaned image cleanup
//!
//! The hour tier also runs once shortly after startup. It runs in the
//! background, and an hourly tick that finds the previous run still busy is
//! skipped. Every task runs in its own spawned task; a failure or panic is
//! logged and never stops the tier or the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use domains::{DomainResult, ImagerMode};

/// The task set the [`Scheduler`] runs.
#[async_trait]
pub trait Upkeep: Send + Sync + 'static {
    fn imager_mode(&self) -> ImagerMode;

    async fn flush_open_post_bodies(&self) -> DomainResult<()>;
    async fn sync_spam_scores(&self) -> DomainResult<()>;

    async fn close_dangling_posts(&self) -> DomainResult<()>;
    async fn clean_up_expiries(&self) -> DomainResult<()>;

    async fn remove_identity_info(&self) -> DomainResult<()>;
    async fn delete_old_threads(&self) -> DomainResult<()>;
    async fn delete_unused_boards(&self) -> DomainResult<()>;
    async fn vacuum(&self) -> DomainResult<()>;
    async fn delete_unused_images(&self) -> DomainResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerIntervals {
    pub second: Duration,
    pub minute: Duration,
    pub hour: Duration,
    /// Delay before the out-of-band hour tier run after startup
    pub startup_delay: Duration,
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        Self {
            second: Duration::from_secs(1),
            minute: Duration::from_secs(60),
            hour: Duration::from_secs(60 * 60),
            startup_delay: Duration::from_secs(60),
        }
    }
}

pub struct Scheduler {
    upkeep: Arc<dyn Upkeep>,
    intervals: SchedulerIntervals,
}

impl Scheduler {
    pub fn new(upkeep: Arc<dyn Upkeep>, intervals: SchedulerIntervals) -> Self {
        Self { upkeep, intervals }
    }

    /// Runs until `shutdown` turns `true` or its sender is dropped.
    /// A tier already running is finished before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = Instant::now();
        let mut seconds = time::interval_at(start + self.intervals.second, self.intervals.second);
        let mut minutes = time::interval_at(start + self.intervals.minute, self.intervals.minute);
        let mut hours = time::interval_at(start + self.intervals.hour, self.intervals.hour);
        for interval in [&mut seconds, &mut minutes, &mut hours] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        let startup = time::sleep(self.intervals.startup_delay);
        tokio::pin!(startup);
        let mut started = false;
        // The hour tier runs beside the loop so it never holds up the faster tiers.
        let mut hourly: Option<JoinHandle<()>> = None;

        tracing::info!(intervals = ?self.intervals, "Upkeep scheduler started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = seconds.tick() => run_second_tier(&self.upkeep).await,
                _ = minutes.tick() => run_minute_tier(&self.upkeep).await,
                _ = hours.tick() => self.start_hour_tier(&mut hourly),
                _ = &mut startup, if !started => {
                    started = true;
                    self.start_hour_tier(&mut hourly);
                }
            }
        }
        if let Some(run) = hourly {
            if let Err(error) = run.await {
                tracing::error!(%error, "Hour tier did not finish");
            }
        }
        tracing::info!("Upkeep scheduler stopped");
    }

    fn start_hour_tier(&self, running: &mut Option<JoinHandle<()>>) {
        if running.as_ref().is_some_and(|run| !run.is_finished()) {
            tracing::warn!("Previous hour tier still running, skipping this tick");
            return;
        }
        *running = Some(tokio::spawn(run_hour_tier(Arc::clone(&self.upkeep))));
    }
}

async fn run_second_tier(upkeep: &Arc<dyn Upkeep>) {
    run_task(upkeep, "flush_open_post_bodies", |u| async move { u.flush_open_post_bodies().await })
        .await;
    run_task(upkeep, "sync_spam_scores", |u| async move { u.sync_spam_scores().await }).await;
}

async fn run_minute_tier(upkeep: &Arc<dyn Upkeep>) {
    if upkeep.imager_mode().handles_boards() {
        run_task(upkeep, "close_dangling_posts", |u| async move { u.close_dangling_posts().await })
            .await;
    }
    run_task(upkeep, "clean_up_expiries", |u| async move { u.clean_up_expiries().await }).await;
}

async fn run_hour_tier(upkeep: Arc<dyn Upkeep>) {
    let mode = upkeep.imager_mode();
    if mode.handles_boards() {
        run_task(&upkeep, "remove_identity_info", |u| async move { u.remove_identity_info().await })
            .await;
        run_task(&upkeep, "delete_old_threads", |u| async move { u.delete_old_threads().await })
            .await;
        run_task(&upkeep, "delete_unused_boards", |u| async move { u.delete_unused_boards().await })
            .await;
        run_task(&upkeep, "vacuum", |u| async move { u.vacuum().await }).await;
    }
    if mode.handles_media() {
        run_task(&upkeep, "delete_unused_images", |u| async move { u.delete_unused_images().await })
            .await;
    }
}

/// Runs one task to completion in its own tokio task and logs how it ended.
async fn run_task<F, Fut>(upkeep: &Arc<dyn Upkeep>, task: &'static str, f: F)
where
    F: FnOnce(Arc<dyn Upkeep>) -> Fut,
    Fut: Future<Output = DomainResult<()>> + Send + 'static,
{
    match tokio::spawn(f(Arc::clone(upkeep))).await {
        Ok(Ok(())) => tracing::trace!(task, "Upkeep task finished"),
        Ok(Err(error)) => tracing::error!(task, %error, "Upkeep task failed"),
        Err(join) if join.is_panic() => tracing::error!(task, "Upkeep task panicked"),
        Err(join) => tracing::warn!(task, error = %join, "Upkeep task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use domains::DomainError;

    #[derive(Default)]
    struct Counts {
        flush: AtomicUsize,
        spam: AtomicUsize,
        dangling: AtomicUsize,
        expiries: AtomicUsize,
        identity: AtomicUsize,
        threads: AtomicUsize,
        boards: AtomicUsize,
        vacuum: AtomicUsize,
        images: AtomicUsize,
    }

    fn bump(counter: &AtomicUsize) -> DomainResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Counts calls. Dangling post closing always fails and thread pruning
    /// always panics.
    struct Recorder {
        mode: ImagerMode,
        counts: Counts,
        vacuum_time: Duration,
    }

    impl Recorder {
        fn new(mode: ImagerMode) -> Arc<Self> {
            Arc::new(Self { mode, counts: Counts::default(), vacuum_time: Duration::ZERO })
        }

        fn with_slow_vacuum(vacuum_time: Duration) -> Arc<Self> {
            Arc::new(Self { mode: ImagerMode::Full, counts: Counts::default(), vacuum_time })
        }
    }

    #[async_trait]
    impl Upkeep for Recorder {
        fn imager_mode(&self) -> ImagerMode {
            self.mode
        }

        async fn flush_open_post_bodies(&self) -> DomainResult<()> {
            bump(&self.counts.flush)
        }

        async fn sync_spam_scores(&self) -> DomainResult<()> {
            bump(&self.counts.spam)
        }

        async fn close_dangling_posts(&self) -> DomainResult<()> {
            bump(&self.counts.dangling)?;
            Err(DomainError::store("connection reset"))
        }

        async fn clean_up_expiries(&self) -> DomainResult<()> {
            bump(&self.counts.expiries)
        }

        async fn remove_identity_info(&self) -> DomainResult<()> {
            bump(&self.counts.identity)
        }

        async fn delete_old_threads(&self) -> DomainResult<()> {
            bump(&self.counts.threads)?;
            panic!("corrupt thread row");
        }

        async fn delete_unused_boards(&self) -> DomainResult<()> {
            bump(&self.counts.boards)
        }

        async fn vacuum(&self) -> DomainResult<()> {
            bump(&self.counts.vacuum)?;
            time::sleep(self.vacuum_time).await;
            Ok(())
        }

        async fn delete_unused_images(&self) -> DomainResult<()> {
            bump(&self.counts.images)
        }
    }

    /// Starts a scheduler on paused time, lets `elapsed` pass and stops it.
    async fn run_for(upkeep: Arc<Recorder>, elapsed: Duration) {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Scheduler::new(upkeep, SchedulerIntervals::default()).run(rx));
        time::sleep(elapsed).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tiers_fire_on_their_intervals() {
        let upkeep = Recorder::new(ImagerMode::Full);
        run_for(upkeep.clone(), Duration::from_millis(120_500)).await;

        let c = &upkeep.counts;
        assert_eq!(load(&c.flush), 120);
        assert_eq!(load(&c.spam), 120);
        assert_eq!(load(&c.expiries), 2);
        // Only the startup run; the first regular hour tick is an hour out.
        assert_eq!(load(&c.vacuum), 1);
        assert_eq!(load(&c.images), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_other_tasks() {
        let upkeep = Recorder::new(ImagerMode::Full);
        run_for(upkeep.clone(), Duration::from_secs(2 * 60 * 60 + 1)).await;

        let c = &upkeep.counts;
        // The failing task is retried on every tick of its tier.
        assert_eq!(load(&c.dangling), 120);
        assert_eq!(load(&c.expiries), 120);
        // Startup run plus two hourly ticks, past a panicking sibling.
        assert_eq!(load(&c.threads), 3);
        assert_eq!(load(&c.boards), 3);
        assert_eq!(load(&c.vacuum), 3);
        assert!(load(&c.flush) >= 7200);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_hour_tier_does_not_hold_up_flushes() {
        let upkeep = Recorder::with_slow_vacuum(Duration::from_secs(30 * 60));
        run_for(upkeep.clone(), Duration::from_millis(600_500)).await;

        let c = &upkeep.counts;
        assert_eq!(load(&c.vacuum), 1);
        assert_eq!(load(&c.flush), 600);
        assert_eq!(load(&c.expiries), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn hourly_tick_is_skipped_while_the_last_run_is_busy() {
        // The startup run lasts until 1h31m, past the first hourly tick.
        let upkeep = Recorder::with_slow_vacuum(Duration::from_secs(90 * 60));
        run_for(upkeep.clone(), Duration::from_secs(2 * 60 * 60 + 1)).await;

        let c = &upkeep.counts;
        assert_eq!(load(&c.vacuum), 2);
        assert_eq!(load(&c.identity), 2);
        assert_eq!(load(&c.expiries), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn imager_only_nodes_skip_board_upkeep() {
        let upkeep = Recorder::new(ImagerMode::ImagerOnly);
        run_for(upkeep.clone(), Duration::from_secs(61 * 60)).await;

        let c = &upkeep.counts;
        assert_eq!(load(&c.dangling), 0);
        assert_eq!(load(&c.identity), 0);
        assert_eq!(load(&c.boards), 0);
        assert_eq!(load(&c.vacuum), 0);
        assert_eq!(load(&c.images), 2);
        assert_eq!(load(&c.expiries), 61);
    }

    #[tokio::test(start_paused = true)]
    async fn no_imager_nodes_skip_media_cleanup() {
        let upkeep = Recorder::new(ImagerMode::NoImager);
        run_for(upkeep.clone(), Duration::from_secs(61 * 60)).await;

        let c = &upkeep.counts;
        assert_eq!(load(&c.images), 0);
        assert_eq!(load(&c.vacuum), 2);
        assert_eq!(load(&c.dangling), 61);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_sender_is_dropped() {
        let upkeep = Recorder::new(ImagerMode::Full);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Scheduler::new(upkeep.clone(), SchedulerIntervals::default()).run(rx));
        time::sleep(Duration::from_millis(1500)).await;
        drop(tx);
        handle.await.unwrap();

        assert_eq!(load(&upkeep.counts.flush), 1);
    }
}
