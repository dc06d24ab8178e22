//! Integration tests for the resource schedulers.
//!
//! These tests exercise the scheduler contract through the public API
//! with real pipeline contexts:
//! - Pool conservation across admit/complete cycles
//! - Queueing and abort behavior of the LIFO scheduler
//! - Aging, reranking and reserved capacity of the priority scheduler
//! - Viewport-driven scoring through the frustum prioritizer
//!
//! Run with: `cargo test --test scheduler_integration`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tilestream::fetch::{FrustumData, FrustumPrioritizerOptions, FrustumRequestsPrioritizer};
use tilestream::region::{ImagePartParams, JobContext, Rect, RequestPriorityData};
use tilestream::scheduler::{
    LifoScheduler, PriorityScheduler, PrioritySchedulerOptions, Prioritizer, ResourceScheduler,
    ScheduledJob,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn ctx_at(min_x: u32, min_y: u32) -> Arc<JobContext> {
    Arc::new(JobContext::new(ImagePartParams::new(
        min_x,
        min_y,
        min_x + 256,
        min_y + 256,
        0,
    )))
}

/// Job that records the tile it ran for, keeping its resource.
fn recording_job(
    ctx: Arc<JobContext>,
    ran: &Arc<Mutex<Vec<(u32, u32)>>>,
    aborted: &Arc<AtomicUsize>,
) -> ScheduledJob<u32, JobContext> {
    let ran = Arc::clone(ran);
    let aborted = Arc::clone(aborted);
    ScheduledJob::new(
        ctx,
        Box::new(move |_resource, ctx| {
            ran.lock()
                .unwrap()
                .push((ctx.image_part_params.min_x, ctx.image_part_params.min_y));
        }),
        Box::new(move |_ctx| {
            aborted.fetch_add(1, Ordering::SeqCst);
        }),
    )
}

/// Job that immediately completes, returning its resource.
fn completing_job(
    ctx: Arc<JobContext>,
    scheduler: Arc<dyn ResourceScheduler<u32, JobContext>>,
) -> ScheduledJob<u32, JobContext> {
    ScheduledJob::new(
        ctx,
        Box::new(move |resource, ctx| scheduler.job_done(resource, &ctx)),
        Box::new(|_ctx| {}),
    )
}

// ============================================================================
// Pool conservation
// ============================================================================

#[test]
fn test_lifo_pool_conservation_over_many_cycles() {
    let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> =
        Arc::new(LifoScheduler::new(vec![1, 2, 3]));

    for round in 0..50 {
        scheduler.enqueue_job(completing_job(
            ctx_at(round * 256, 0),
            Arc::clone(&scheduler),
        ));
        assert_eq!(
            scheduler.free_count() + scheduler.in_use_count(),
            scheduler.jobs_limit()
        );
    }
    assert_eq!(scheduler.free_count(), 3);
    assert_eq!(scheduler.pending_count(), 0);
}

#[test]
fn test_priority_pool_conservation_over_many_cycles() {
    let prioritizer = |ctx: &JobContext| (ctx.image_part_params.min_x / 256) as i32;
    let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> = Arc::new(
        PriorityScheduler::new(vec![1, 2], Arc::new(prioritizer), Default::default()),
    );

    for round in 0..50 {
        scheduler.enqueue_job(completing_job(
            ctx_at(round * 256, 0),
            Arc::clone(&scheduler),
        ));
        assert_eq!(
            scheduler.free_count() + scheduler.in_use_count(),
            scheduler.jobs_limit()
        );
    }
    assert_eq!(scheduler.free_count(), 2);
    assert_eq!(scheduler.pending_count(), 0);
}

// ============================================================================
// LIFO queueing
// ============================================================================

/// Two enqueues against a single slot: the second queues until the
/// first's resource comes back.
#[test]
fn test_lifo_second_job_waits_for_freed_resource() {
    let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> =
        Arc::new(LifoScheduler::new(vec![7]));
    let ran = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(AtomicUsize::new(0));

    let first_ctx = ctx_at(0, 0);
    scheduler.enqueue_job(recording_job(Arc::clone(&first_ctx), &ran, &aborted));
    scheduler.enqueue_job(recording_job(ctx_at(256, 0), &ran, &aborted));

    assert_eq!(*ran.lock().unwrap(), vec![(0, 0)]);
    assert_eq!(scheduler.pending_count(), 1);

    scheduler.job_done(7, &first_ctx);
    assert_eq!(*ran.lock().unwrap(), vec![(0, 0), (256, 0)]);
    assert_eq!(scheduler.pending_count(), 0);
    assert_eq!(aborted.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Priority admission
// ============================================================================

/// A small recent list demotes the oldest pending job into the aged
/// buckets at a stale score. After the viewport moves onto its tile, a
/// rerank re-scores it and it wins admission over its peers.
#[test]
fn test_aged_job_recovers_after_viewport_change() {
    let prioritizer = Arc::new(FrustumRequestsPrioritizer::new(
        FrustumPrioritizerOptions::default(),
    ));
    let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> = Arc::new(PriorityScheduler::new(
        vec![42],
        Arc::clone(&prioritizer) as Arc<dyn Prioritizer<JobContext>>,
        PrioritySchedulerOptions {
            num_new_jobs: 2,
            num_jobs_before_rerank_old_priorities: 1,
            ..Default::default()
        },
    ));
    // Viewport over the origin tile: far tiles score at the floor.
    prioritizer.set_frustum_data(Some(FrustumData {
        frustum_rect: Rect::new(0, 0, 256, 256),
        resolution_level: 0,
    }));

    let ran = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(AtomicUsize::new(0));

    // A holder job takes the only resource so everything else waits.
    let holder_ctx = ctx_at(0, 9984);
    scheduler.enqueue_job(recording_job(Arc::clone(&holder_ctx), &ran, &aborted));

    // Three pending jobs; the oldest (a far-away tile) overflows the
    // recent list and is bucketed at its current low score.
    scheduler.enqueue_job(recording_job(ctx_at(4096, 0), &ran, &aborted));
    let o1_ctx = ctx_at(0, 0);
    scheduler.enqueue_job(recording_job(Arc::clone(&o1_ctx), &ran, &aborted));
    scheduler.enqueue_job(recording_job(ctx_at(0, 256), &ran, &aborted));
    assert_eq!(scheduler.pending_count(), 3);

    // The viewport jumps onto the aged tile.
    prioritizer.set_frustum_data(Some(FrustumData {
        frustum_rect: Rect::new(4096, 0, 4352, 256),
        resolution_level: 0,
    }));

    // First admission after the holder finishes still favors the recent
    // tier, but it triggers the rerank that re-scores the aged tile.
    scheduler.job_done(42, &holder_ctx);
    assert_eq!(ran.lock().unwrap().len(), 2);

    // The next free resource goes to the re-scored far tile, ahead of
    // the remaining origin tile.
    scheduler.job_done(42, &o1_ctx);
    assert_eq!(ran.lock().unwrap().last(), Some(&(4096, 0)));
    assert_eq!(scheduler.pending_count(), 1);
    assert_eq!(aborted.load(Ordering::SeqCst), 0);
}

/// Reserved capacity: with the whole pool held in reserve, only jobs at
/// or above the threshold priority are admitted until a low-priority
/// job's score rises past it.
#[test]
fn test_reserved_capacity_blocks_low_priority() {
    let score = Arc::new(Mutex::new(3_i32));
    let prioritizer = {
        let score = Arc::clone(&score);
        move |ctx: &JobContext| {
            if ctx.overrides_highest_priority() {
                9
            } else {
                *score.lock().unwrap()
            }
        }
    };
    let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> = Arc::new(PriorityScheduler::new(
        vec![1, 2],
        Arc::new(prioritizer),
        PrioritySchedulerOptions {
            resources_guaranteed_for_high_priority: 2,
            high_priority_to_guarantee_resource: 5,
            ..Default::default()
        },
    ));

    let ran = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(AtomicUsize::new(0));

    // Low-priority job: both free resources are reserved, so it waits.
    scheduler.enqueue_job(recording_job(ctx_at(0, 0), &ran, &aborted));
    assert!(ran.lock().unwrap().is_empty());
    assert_eq!(scheduler.pending_count(), 1);

    // A high-priority job cuts straight through the reserve, completes,
    // and still leaves the low-priority job waiting.
    let urgent = Arc::new(JobContext::new(
        ImagePartParams::new(256, 0, 512, 256, 0)
            .with_priority_data(RequestPriorityData::highest()),
    ));
    scheduler.enqueue_job(completing_job(urgent, Arc::clone(&scheduler)));
    assert_eq!(scheduler.pending_count(), 1);
    assert!(ran.lock().unwrap().is_empty());

    // Once its score clears the threshold, the next completion admits it
    // out of the reserve.
    *score.lock().unwrap() = 6;
    let urgent = Arc::new(JobContext::new(
        ImagePartParams::new(512, 0, 768, 256, 0)
            .with_priority_data(RequestPriorityData::highest()),
    ));
    scheduler.enqueue_job(completing_job(urgent, Arc::clone(&scheduler)));
    assert_eq!(*ran.lock().unwrap(), vec![(0, 0)]);
    assert_eq!(scheduler.pending_count(), 0);
}

// ============================================================================
// Abort
// ============================================================================

/// Negative priority aborts a pending job: `on_abort` fires exactly
/// once and the run callback never does.
#[test]
fn test_negative_priority_aborts_pending_job_once() {
    let prioritizer = |_ctx: &JobContext| -1;
    let scheduler: Arc<dyn ResourceScheduler<u32, JobContext>> = Arc::new(
        PriorityScheduler::new(vec![1], Arc::new(prioritizer), Default::default()),
    );

    let ran = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(AtomicUsize::new(0));
    scheduler.enqueue_job(recording_job(ctx_at(0, 0), &ran, &aborted));

    assert!(ran.lock().unwrap().is_empty());
    assert_eq!(aborted.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending_count(), 0);
    assert_eq!(scheduler.free_count(), 1);
}
