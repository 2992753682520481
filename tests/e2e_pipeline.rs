// logsieve - tests/e2e_pipeline.rs
//
// End-to-end tests for the filtering pipeline.
//
// These tests drive the public library API with real worker threads: a
// session wraps records, filters run in the background over a shared
// source, and the combiner publishes the merged view. Synchronisation is
// done through `Combiner::wait_until_settled` and `Combiner::sync`, never
// with fixed sleeps.

use logsieve::app::combiner::Combiner;
use logsieve::app::log_filter::{LogFilter, LogFilterOptions};
use logsieve::app::session::Session;
use logsieve::core::change::ViewChange;
use logsieve::core::entity::Entity;
use logsieve::core::filter::{apply_filters, Filter, FilterCriteria};
use logsieve::core::model::{CombinationMode, Level, Record};
use logsieve::core::policy::{MemoryUsagePolicy, RetainAll};
use logsieve::core::processor::{ProcessingPriority, Processor, ProcessorState};
use logsieve::core::source::SourceSequence;
use logsieve::platform::config::load_config;
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

// =============================================================================
// Helpers
// =============================================================================

fn unlimited_session() -> Session {
    Session::new(MemoryUsagePolicy::Unlimited, Duration::ZERO)
}

fn chunked(size: usize) -> LogFilterOptions {
    LogFilterOptions {
        priority: ProcessingPriority::Realtime,
        chunk_size: Some(size),
    }
}

fn pattern(re: &str) -> FilterCriteria {
    let mut criteria = FilterCriteria::new();
    criteria.add_inclusive_pattern(re).unwrap();
    criteria
}

fn start(
    session: &Session,
    combiner: &Combiner,
    source: &SourceSequence,
    criteria: FilterCriteria,
    options: LogFilterOptions,
) -> LogFilter {
    let mut filter = LogFilter::new(session.accessor(), combiner.sink(), criteria, options);
    filter.attach(source).unwrap();
    filter.process().unwrap();
    filter
}

/// The five-record sample: errors at 0, 2, 4; "disk" at 2, 3.
fn sample() -> Vec<Record> {
    vec![
        Record::new(Level::Error, "cache miss"),
        Record::new(Level::Info, "startup complete"),
        Record::new(Level::Error, "disk full"),
        Record::new(Level::Info, "disk slow"),
        Record::new(Level::Error, "request timeout"),
    ]
}

/// Deterministic pseudo-random records.
fn generated(count: usize, seed: u64) -> Vec<Record> {
    let words = ["alpha", "beta", "gamma", "delta", "omega"];
    let mut state = seed;
    (0..count)
        .map(|i| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let level = Level::all()[(state >> 33) as usize % 5];
            let word = words[(state >> 40) as usize % words.len()];
            Record::new(level, format!("{word} event {i}"))
                .with_ids(Some((state >> 50) as u32 % 3), None)
        })
        .collect()
}

/// Reference membership: recompute every filter over the whole source.
fn expected(entities: &[Entity], all: &[FilterCriteria], mode: CombinationMode) -> Vec<usize> {
    let sets: Vec<BTreeSet<usize>> = all
        .iter()
        .map(|criteria| apply_filters(entities, criteria, &RetainAll).into_iter().collect())
        .collect();
    (0..entities.len())
        .filter(|i| match mode {
            CombinationMode::Intersection => sets.iter().all(|s| s.contains(i)),
            CombinationMode::Union => sets.iter().any(|s| s.contains(i)),
        })
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Replayed {
    resets: usize,
    removed: usize,
}

/// Replay change notifications onto a mirror of the view. Only empty
/// resets can be replayed without re-reading the view.
fn replay(mirror: &mut Vec<Entity>, changes: &Receiver<ViewChange>) -> Replayed {
    let mut replayed = Replayed::default();
    for change in changes.try_iter() {
        match change {
            ViewChange::Added { index, entities } => {
                mirror.splice(index..index, entities);
            }
            ViewChange::Removed { index, entities } => {
                let removed: Vec<Entity> = mirror.drain(index..index + entities.len()).collect();
                assert_eq!(removed, entities, "removed entities must match the view");
                replayed.removed += removed.len();
            }
            ViewChange::Reset { len } => {
                assert_eq!(len, 0, "non-empty reset cannot be replayed");
                mirror.clear();
                replayed.resets += 1;
            }
        }
    }
    replayed
}

// =============================================================================
// Combination modes
// =============================================================================

#[test]
fn test_sample_intersection_and_union() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    source.append(session.wrap_all(sample()).unwrap());
    let mut combiner = Combiner::new(&source, CombinationMode::Intersection, 16);
    let _errors = start(&session, &combiner, &source, FilterCriteria::errors_only(), chunked(2));
    let _disk = start(&session, &combiner, &source, pattern("disk"), chunked(2));

    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![2]);

    combiner.set_mode(CombinationMode::Union);
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![0, 2, 3, 4]);
}

#[test]
fn test_no_filters_mirror_source() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let combiner = Combiner::new(&source, CombinationMode::Union, 16);
    source.append(session.wrap_all(sample()).unwrap());
    combiner.sync();
    assert_eq!(combiner.view().len(), 5);
}

#[test]
fn test_modes_agree_with_full_recompute() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let entities = session.wrap_all(generated(600, 7)).unwrap();
    source.append(entities.clone());

    let all = vec![
        FilterCriteria::levels([Level::Error, Level::Warning, Level::Info]),
        pattern("alpha|gamma|omega"),
        FilterCriteria::new().with_process_id(1),
    ];
    for mode in [CombinationMode::Intersection, CombinationMode::Union] {
        let combiner = Combiner::new(&source, mode, 8);
        let _filters: Vec<LogFilter> = all
            .iter()
            .map(|c| start(&session, &combiner, &source, c.clone(), chunked(37)))
            .collect();
        assert!(combiner.wait_until_settled(WAIT));
        assert_eq!(
            combiner.view().source_indices(),
            expected(&entities, &all, mode),
            "mode {mode}"
        );
    }
}

#[test]
fn test_mode_switch_emits_single_reset() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let entities = session.wrap_all(generated(200, 11)).unwrap();
    source.append(entities.clone());
    let all = vec![pattern("beta"), FilterCriteria::levels([Level::Debug])];

    let mut combiner = Combiner::new(&source, CombinationMode::Intersection, 8);
    let _filters: Vec<LogFilter> = all
        .iter()
        .map(|c| start(&session, &combiner, &source, c.clone(), chunked(16)))
        .collect();
    assert!(combiner.wait_until_settled(WAIT));

    let changes = combiner.subscribe();
    combiner.set_mode(CombinationMode::Union);
    combiner.sync();
    let received: Vec<ViewChange> = changes.try_iter().collect();
    let union = expected(&entities, &all, CombinationMode::Union);
    assert_eq!(received, vec![ViewChange::Reset { len: union.len() }]);
    assert_eq!(combiner.view().source_indices(), union);
}

// =============================================================================
// Incremental processing
// =============================================================================

#[test]
fn test_incremental_appends_match_full_recompute() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let combiner = Combiner::new(&source, CombinationMode::Union, 4);
    let changes = combiner.subscribe();
    let all = vec![pattern("delta"), FilterCriteria::errors_only()];
    let _filters: Vec<LogFilter> = all
        .iter()
        .map(|c| start(&session, &combiner, &source, c.clone(), chunked(5)))
        .collect();

    let mut entities = Vec::new();
    for batch in generated(300, 3).chunks(23) {
        let wrapped = session.wrap_all(batch.to_vec()).unwrap();
        entities.extend(wrapped.iter().cloned());
        source.append(wrapped);
    }
    assert!(combiner.wait_until_settled(WAIT));

    let want = expected(&entities, &all, CombinationMode::Union);
    assert_eq!(combiner.view().source_indices(), want);

    let mut mirror = Vec::new();
    assert_eq!(replay(&mut mirror, &changes), Replayed::default());
    assert_eq!(mirror, combiner.view().snapshot());
}

#[test]
fn test_filters_over_existing_records_never_remove() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    source.append(session.wrap_all(sample()).unwrap());
    let combiner = Combiner::new(&source, CombinationMode::Intersection, 16);
    let changes = combiner.subscribe();

    let mut filters: Vec<LogFilter> = [FilterCriteria::errors_only(), pattern("disk")]
        .into_iter()
        .map(|criteria| {
            let mut filter =
                LogFilter::new(session.accessor(), combiner.sink(), criteria, chunked(1));
            filter.attach(&source).unwrap();
            filter
        })
        .collect();
    for filter in &mut filters {
        filter.process().unwrap();
    }
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![2]);

    // At most the mirror of the unfiltered source, replaced by one reset.
    let mut mirror = Vec::new();
    let replayed = replay(&mut mirror, &changes);
    assert_eq!(replayed.removed, 0);
    assert!(replayed.resets <= 1);
    assert_eq!(mirror, combiner.view().snapshot());
}

#[test]
fn test_cancelled_filter_stops_contributing() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    source.append(session.wrap_all(sample()).unwrap());
    let combiner = Combiner::new(&source, CombinationMode::Intersection, 16);
    let filter = start(&session, &combiner, &source, FilterCriteria::errors_only(), chunked(1));
    assert!(combiner.wait_until_settled(WAIT));
    let before = combiner.view().source_indices();
    let version = combiner.view().version();

    filter.cancel();
    source.append(session.wrap_all(sample()).unwrap());
    combiner.sync();

    assert_eq!(filter.state(), ProcessorState::Cancelled);
    assert_eq!(combiner.view().source_indices(), before);
    assert_eq!(combiner.view().version(), version);
}

#[test]
fn test_cancel_mid_pass_publishes_nothing_more() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let mut records = generated(400, 13);
    records.insert(200, Record::new(Level::Error, "hold"));
    let entities = session.wrap_all(records).unwrap();
    source.append(entities.clone());
    let combiner = Combiner::new(&source, CombinationMode::Union, 4);

    // The predicate parks the worker on the "hold" record until released.
    let (reached_tx, reached_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = Mutex::new((reached_tx, release_rx));
    let mut criteria = FilterCriteria::errors_only();
    criteria.set_custom(move |entity| {
        if entity.record()?.message == "hold" {
            let gate = gate.lock().unwrap();
            let _ = gate.0.send(());
            let _ = gate.1.recv();
        }
        Ok(true)
    });
    let filter = start(&session, &combiner, &source, criteria, chunked(3));
    reached_rx.recv_timeout(WAIT).unwrap();
    combiner.sync();

    let before = combiner.view().source_indices();
    let own_before = filter.filtered().source_indices();
    let version = combiner.view().version();
    assert!(!before.is_empty());
    assert_eq!(own_before, before);

    let changes = combiner.subscribe();
    let own_changes = filter.subscribe();
    filter.cancel();
    drop(release_tx);
    combiner.sync();

    assert_eq!(filter.state(), ProcessorState::Cancelled);
    assert!(changes.try_recv().is_err());
    assert!(own_changes.try_recv().is_err());
    assert_eq!(combiner.view().version(), version);
    assert_eq!(combiner.view().source_indices(), before);
    assert_eq!(filter.filtered().source_indices(), own_before);

    // No torn entries: the view is a prefix of the complete result.
    let full = expected(&entities, &[FilterCriteria::errors_only()], CombinationMode::Union);
    assert_eq!(before[..], full[..before.len()]);
}

#[test]
fn test_marking_with_invalidate() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let entities = session.wrap_all(sample()).unwrap();
    source.append(entities.clone());
    let combiner = Combiner::new(&source, CombinationMode::Intersection, 16);
    let mut criteria = pattern("disk");
    criteria.include_marked = true;
    let filter = start(&session, &combiner, &source, criteria, chunked(2));
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![2, 3]);

    entities[1].set_marked(true).unwrap();
    entities[4].set_marked(true).unwrap();
    filter.invalidate(&[1, 4]);
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![1, 2, 3, 4]);

    entities[4].set_marked(false).unwrap();
    filter.invalidate(&[4]);
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![1, 2, 3]);
}

// =============================================================================
// Failure handling
// =============================================================================

#[test]
fn test_faulted_filter_is_isolated() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    let mut records = sample();
    records.insert(3, Record::new(Level::Info, "boom"));
    source.append(session.wrap_all(records).unwrap());
    let combiner = Combiner::new(&source, CombinationMode::Union, 16);

    let errors = start(&session, &combiner, &source, FilterCriteria::errors_only(), chunked(1));
    let mut exploding = FilterCriteria::new();
    exploding.set_custom(|entity| {
        if entity.record()?.message == "boom" {
            panic!("custom predicate failed");
        }
        Ok(false)
    });
    let faulty = start(&session, &combiner, &source, exploding, chunked(1));

    assert_eq!(
        faulty
            .handle()
            .wait_for_state(|s| s == ProcessorState::Faulted, WAIT),
        Some(ProcessorState::Faulted)
    );
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(errors.state(), ProcessorState::Completed);
    assert_eq!(combiner.view().source_indices(), vec![0, 2, 5]);

    // The healthy filter keeps following the source.
    source.append(session.wrap_all(vec![Record::new(Level::Fatal, "late")]).unwrap());
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().source_indices(), vec![0, 2, 5, 6]);
    assert_eq!(faulty.state(), ProcessorState::Faulted);
}

#[test]
fn test_session_end_makes_entities_stale() {
    let session = unlimited_session();
    let source = SourceSequence::new();
    source.append(session.wrap_all(sample()).unwrap());
    let combiner = Combiner::new(&source, CombinationMode::Intersection, 16);
    let mut filter = start(&session, &combiner, &source, pattern("disk"), chunked(2));
    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(combiner.view().len(), 2);

    session.end();
    assert_eq!(session.memory_usage(), 0);
    filter.set_criteria(pattern("timeout")).unwrap();
    assert!(combiner.wait_until_settled(WAIT));

    assert_eq!(filter.skipped(), 5);
    assert!(combiner.view().is_empty());
}

// =============================================================================
// Memory policy
// =============================================================================

#[test]
fn test_fixed_quota_denies_caches_but_not_results() {
    let run = |policy: MemoryUsagePolicy| {
        let session = Session::new(policy, Duration::ZERO);
        let source = SourceSequence::new();
        let entities = session.wrap_all(generated(100, 5)).unwrap();
        source.append(entities.clone());
        let combiner = Combiner::new(&source, CombinationMode::Intersection, 16);
        let criteria = FilterCriteria::new().with_text_search("GAMMA");
        let _filter = start(&session, &combiner, &source, criteria, chunked(10));
        assert!(combiner.wait_until_settled(WAIT));
        let cached = entities.iter().filter(|e| e.has_cached_message()).count();
        (combiner.view().source_indices(), cached)
    };

    let (unlimited, cached) = run(MemoryUsagePolicy::Unlimited);
    assert_eq!(cached, 100);
    let (fixed, cached) = run(MemoryUsagePolicy::Fixed { quota_bytes: 1 });
    assert_eq!(cached, 0);
    assert_eq!(fixed, unlimited);
    assert!(!fixed.is_empty());
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_pipeline_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "[processing]\n\
         default_chunk_size = 3\n\
         queue_capacity = 2\n\
         \n\
         [memory]\n\
         policy = \"fixed\"\n\
         quota_mb = 4\n\
         max_pause_ms = 0\n",
    )
    .unwrap();
    let (config, warnings) = load_config(dir.path());
    assert!(warnings.is_empty(), "{warnings:?}");
    assert_eq!(config.queue_capacity, 2);
    assert_eq!(
        config.memory_policy,
        MemoryUsagePolicy::Fixed {
            quota_bytes: 4 * 1_024 * 1_024
        }
    );

    let session = Session::from_config(&config);
    let source = SourceSequence::new();
    let entities = session.wrap_all(generated(50, 9)).unwrap();
    source.append(entities.clone());
    let combiner = Combiner::new(&source, CombinationMode::Intersection, config.queue_capacity);
    let options = LogFilterOptions::from_config(&config, ProcessingPriority::Default);
    assert_eq!(options.chunk_size, Some(3));
    let criteria = FilterCriteria::levels([Level::Warning]);
    let _filter = start(&session, &combiner, &source, criteria.clone(), options);

    assert!(combiner.wait_until_settled(WAIT));
    assert_eq!(
        combiner.view().source_indices(),
        expected(&entities, &[criteria], CombinationMode::Intersection)
    );
    assert_eq!(combiner.saving_options().len(), combiner.view().len());
}
