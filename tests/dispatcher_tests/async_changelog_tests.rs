//! Tests for the async changelog and its dispatcher
//!
//! These tests verify:
//! - Flush futures resolve only once records are durable
//! - Reads stitch flushed and queued records together
//! - Concurrent readers never observe holes
//! - Finalize, truncate and close go through the queue
//! - Idle queues are swept and shutdown drains everything

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use changelog::changelog::verify;
use changelog::{AsyncChangelog, ChangelogError, Config, Dispatcher, EpochId};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const WAIT: Duration = Duration::from_secs(10);

/// Flushes only when asked to
fn manual_flush_config() -> Config {
    Config::builder()
        .enable_sync(false)
        .flush_period(Duration::from_secs(3600))
        .flush_quantum(Duration::from_millis(5))
        .build()
}

/// Flushes almost immediately
fn eager_flush_config() -> Config {
    Config::builder()
        .enable_sync(false)
        .index_block_size(256)
        .flush_period(Duration::from_millis(1))
        .flush_quantum(Duration::from_millis(1))
        .build()
}

fn setup(config: Config) -> (TempDir, PathBuf, Dispatcher, AsyncChangelog) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000000005.log");
    let dispatcher = Dispatcher::new(config).unwrap();
    let log = dispatcher
        .create_changelog(&path, 5, EpochId::from_u128(9), 17)
        .unwrap();
    (temp_dir, path, dispatcher, log)
}

fn payload(i: u32) -> Bytes {
    Bytes::from(format!("entry-{}", i))
}

fn payloads(range: std::ops::Range<u32>) -> Vec<Bytes> {
    range.map(payload).collect()
}

fn append_range(log: &AsyncChangelog, range: std::ops::Range<u32>) {
    for i in range {
        log.append(i, payload(i)).unwrap();
    }
}

/// Record count a freshly opened reader would see on disk
fn durable_count(path: &PathBuf) -> u32 {
    verify(path).unwrap().1.record_count
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// =============================================================================
// Flush Future Tests
// =============================================================================

#[test]
fn test_future_resolves_after_record_is_durable() {
    let (_temp, path, _dispatcher, log) = setup(eager_flush_config());

    for i in 0..50 {
        let future = log.append(i, payload(i)).unwrap();
        future.wait_timeout(WAIT).expect("flush timed out").unwrap();
        assert!(durable_count(&path) > i);
    }
}

#[test]
fn test_queued_records_are_not_durable_before_flush() {
    let (_temp, path, _dispatcher, log) = setup(manual_flush_config());

    let future = log.append(0, payload(0)).unwrap();
    assert!(!future.is_ready());
    assert_eq!(log.record_count(), 1);
    assert_eq!(durable_count(&path), 0);
    assert!(future.wait_timeout(Duration::from_millis(50)).is_none());

    log.flush().unwrap();
    assert!(future.is_ready());
    future.wait().unwrap();
    assert_eq!(durable_count(&path), 1);
}

#[test]
fn test_records_of_one_batch_share_a_generation() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());

    let first = log.append(0, payload(0)).unwrap();
    let second = log.append(1, payload(1)).unwrap();
    assert_eq!(first.generation(), second.generation());

    log.flush().unwrap();
    let third = log.append(2, payload(2)).unwrap();
    assert!(third.generation() > first.generation());
    assert!(first.is_ready() && second.is_ready());
    assert!(!third.is_ready());
}

#[test]
fn test_flush_async_resolves() {
    let (_temp, path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..20);

    let future = log.flush_async().unwrap();
    future.wait_timeout(WAIT).expect("flush timed out").unwrap();
    assert_eq!(durable_count(&path), 20);

    // Nothing queued: already resolved
    assert!(log.flush_async().unwrap().is_ready());
}

#[test]
fn test_buffer_size_triggers_flush() {
    let config = Config::builder()
        .enable_sync(false)
        .flush_period(Duration::from_secs(3600))
        .flush_buffer_size(64)
        .flush_quantum(Duration::from_millis(5))
        .build();
    let (_temp, path, _dispatcher, log) = setup(config);

    // Every record alone exceeds the buffer size
    let mut last = None;
    for i in 0..10 {
        last = Some(log.append(i, Bytes::from(vec![b'z'; 100])).unwrap());
    }
    last.unwrap().wait_timeout(WAIT).expect("flush timed out").unwrap();
    assert_eq!(durable_count(&path), 10);
}

// =============================================================================
// Append Contract Tests
// =============================================================================

#[test]
fn test_out_of_order_append_rejected() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..3);

    match log.append(7, payload(7)) {
        Err(ChangelogError::OutOfOrder {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 3);
            assert_eq!(actual, 7);
        }
        other => panic!("expected OutOfOrder, got {:?}", other),
    }
    assert!(matches!(
        log.append(2, payload(2)),
        Err(ChangelogError::OutOfOrder { .. })
    ));
    assert_eq!(log.record_count(), 3);
}

#[test]
fn test_empty_payload_rejected() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());

    assert!(matches!(
        log.append(0, Bytes::new()),
        Err(ChangelogError::InvalidRecord { .. })
    ));
    assert_eq!(log.record_count(), 0);
    log.append(0, payload(0)).unwrap();
}

#[test]
fn test_record_count_is_never_below_durable_count() {
    let (_temp, path, _dispatcher, log) = setup(eager_flush_config());

    for i in 0..200 {
        log.append(i, payload(i)).unwrap();
        if i % 20 == 0 {
            assert!(log.record_count() >= durable_count(&path));
        }
    }
    log.flush().unwrap();
    assert_eq!(log.record_count(), durable_count(&path));
}

// =============================================================================
// Read Tests
// =============================================================================

#[test]
fn test_read_merges_disk_and_memory() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());

    append_range(&log, 0..10);
    assert_eq!(log.read(0, 100).unwrap(), payloads(0..10));

    log.flush().unwrap();
    append_range(&log, 10..15);

    assert_eq!(log.read(0, 100).unwrap(), payloads(0..15));
    assert_eq!(log.read(8, 4).unwrap(), payloads(8..12));
    assert_eq!(log.read(12, 100).unwrap(), payloads(12..15));
    assert!(log.read(15, 100).unwrap().is_empty());
}

#[test]
fn test_read_limited_by_bytes() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..10);
    log.flush().unwrap();
    append_range(&log, 10..20);

    // "entry-N" is 7 bytes for N < 10 and 8 bytes otherwise
    let records = log.read_limited(8, 100, 20).unwrap();
    assert_eq!(records, payloads(8..11));

    let records = log.read_limited(15, 100, 1).unwrap();
    assert_eq!(records, payloads(15..16));
}

#[test]
fn test_concurrent_readers_see_no_holes() {
    let (_temp, _path, _dispatcher, log) = setup(eager_flush_config());
    let total = 2000u32;

    let writer = {
        let log = log.clone();
        thread::spawn(move || {
            for i in 0..total {
                log.append(i, payload(i)).unwrap();
            }
            log.flush().unwrap();
        })
    };

    let readers: Vec<_> = (0..4u32)
        .map(|r| {
            let log = log.clone();
            thread::spawn(move || {
                let mut first = r * 7;
                let mut seen = 0u32;
                while seen < total {
                    let records = log.read(first % total, 64).unwrap();
                    for (offset, record) in records.iter().enumerate() {
                        assert_eq!(*record, payload(first % total + offset as u32));
                    }
                    seen = seen.max(log.record_count());
                    first = first.wrapping_add(13);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(log.read(0, total as usize).unwrap(), payloads(0..total));
}

// =============================================================================
// Finalize / Truncate / Close Tests
// =============================================================================

#[test]
fn test_finalize_flushes_and_rejects_appends() {
    let (_temp, path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..5);

    log.finalize().unwrap();
    assert!(log.is_finalized());
    assert_eq!(durable_count(&path), 5);
    assert!(verify(&path).unwrap().0.finalized);

    assert!(matches!(
        log.append(5, payload(5)),
        Err(ChangelogError::LogClosed { .. })
    ));
    assert_eq!(log.read(0, 10).unwrap(), payloads(0..5));

    // Finalizing twice is fine
    log.finalize().unwrap();
}

#[test]
fn test_definalize_allows_appends_again() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..2);

    assert!(matches!(
        log.definalize(),
        Err(ChangelogError::NotFinalized { .. })
    ));

    log.finalize().unwrap();
    log.definalize().unwrap();
    assert!(!log.is_finalized());

    append_range(&log, 2..4);
    log.flush().unwrap();
    assert_eq!(log.read(0, 10).unwrap(), payloads(0..4));
}

#[test]
fn test_truncate_then_append_new_tail() {
    let (_temp, path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..20);

    log.truncate(8).unwrap();
    assert_eq!(log.record_count(), 8);
    assert_eq!(log.read(0, 100).unwrap(), payloads(0..8));
    assert_eq!(durable_count(&path), 8);

    let tail: Vec<Bytes> = (8..12).map(|i| Bytes::from(format!("new-{}", i))).collect();
    for (i, record) in tail.iter().enumerate() {
        log.append(8 + i as u32, record.clone()).unwrap();
    }
    log.flush().unwrap();

    let records = log.read(0, 100).unwrap();
    assert_eq!(&records[..8], payloads(0..8).as_slice());
    assert_eq!(&records[8..], tail.as_slice());
}

#[test]
fn test_truncate_beyond_count_rejected() {
    let (_temp, _path, _dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..3);

    assert!(matches!(
        log.truncate(4),
        Err(ChangelogError::InvalidTruncate { .. })
    ));
    // The failed truncate leaves the changelog writable
    log.append(3, payload(3)).unwrap();
}

#[test]
fn test_close_and_reopen() {
    let (_temp, path, dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..30);
    assert_eq!(log.id(), 5);
    assert_eq!(log.epoch(), EpochId::from_u128(9));
    assert_eq!(log.prev_record_count(), 17);
    assert_eq!(log.path(), path.as_path());
    log.close().unwrap();

    let log = dispatcher.open_changelog(&path).unwrap();
    assert_eq!(log.id(), 5);
    assert_eq!(log.record_count(), 30);
    assert_eq!(log.read(0, 100).unwrap(), payloads(0..30));
}

#[test]
fn test_close_while_another_handle_appends() {
    let total = 2000u32;
    for _ in 0..20 {
        let (_temp, path, _dispatcher, log) = setup(eager_flush_config());

        let appender = {
            let log = log.clone();
            thread::spawn(move || {
                let futures: Vec<_> = (0..total)
                    .map(|i| log.append(i, payload(i)).unwrap())
                    .collect();
                for future in futures {
                    future.wait_timeout(WAIT).expect("flush timed out").unwrap();
                }
                log
            })
        };

        assert!(wait_for(|| log.record_count() >= 100));
        log.close().unwrap();

        let log = appender.join().unwrap();
        assert_eq!(log.record_count(), total);
        assert_eq!(log.read(0, total as usize).unwrap(), payloads(0..total));
        assert_eq!(durable_count(&path), total);
    }
}

#[test]
fn test_append_flush_reopen_truncate_scenario() {
    let (_temp, path, dispatcher, log) = setup(Config::default());

    for (i, s) in ["a", "bb", "ccc"].iter().enumerate() {
        log.append(i as u32, Bytes::from(s.to_string())).unwrap();
    }
    log.flush().unwrap();
    log.close().unwrap();

    let log = dispatcher.open_changelog(&path).unwrap();
    assert_eq!(
        log.read(0, 3).unwrap(),
        vec![Bytes::from("a"), Bytes::from("bb"), Bytes::from("ccc")]
    );
    log.truncate(1).unwrap();
    log.close().unwrap();

    let log = dispatcher.open_changelog(&path).unwrap();
    assert_eq!(log.read(0, 10).unwrap(), vec![Bytes::from("a")]);
    assert_eq!(log.record_count(), 1);
}

// =============================================================================
// Dispatcher Lifecycle Tests
// =============================================================================

#[test]
fn test_idle_queue_is_swept() {
    let (_temp, _path, dispatcher, log) = setup(manual_flush_config());
    assert_eq!(dispatcher.active_queue_count(), 0);

    append_range(&log, 0..10);
    assert_eq!(dispatcher.active_queue_count(), 1);
    log.flush().unwrap();

    assert!(wait_for(|| dispatcher.active_queue_count() == 0));

    // A swept changelog keeps working
    assert_eq!(log.record_count(), 10);
    log.append(10, payload(10)).unwrap();
    assert_eq!(log.read(0, 100).unwrap(), payloads(0..11));
}

#[test]
fn test_many_changelogs_share_one_dispatcher() {
    let temp_dir = TempDir::new().unwrap();
    let dispatcher = Arc::new(Dispatcher::new(eager_flush_config()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|id| {
            let dispatcher = Arc::clone(&dispatcher);
            let path = temp_dir.path().join(format!("{:09}.log", id));
            thread::spawn(move || {
                let log = dispatcher
                    .create_changelog(&path, id, EpochId::default(), 0)
                    .unwrap();
                let mut last = None;
                for i in 0..100 {
                    last = Some(log.append(i, payload(i)).unwrap());
                }
                last.unwrap().wait_timeout(WAIT).expect("flush timed out").unwrap();
                path
            })
        })
        .collect();

    for handle in handles {
        let path = handle.join().unwrap();
        assert_eq!(durable_count(&path), 100);
    }
}

#[test]
fn test_shutdown_drains_queues() {
    let (_temp, path, dispatcher, log) = setup(manual_flush_config());

    let futures: Vec<_> = (0..100).map(|i| log.append(i, payload(i)).unwrap()).collect();
    dispatcher.shutdown();

    assert!(dispatcher.is_shutdown());
    assert_eq!(dispatcher.active_queue_count(), 0);
    assert_eq!(durable_count(&path), 100);
    for future in futures {
        assert!(future.is_ready());
        future.wait().unwrap();
    }
}

#[test]
fn test_operations_after_shutdown() {
    let (_temp, path, dispatcher, log) = setup(manual_flush_config());
    append_range(&log, 0..5);
    dispatcher.shutdown();
    dispatcher.shutdown();

    assert!(matches!(
        log.append(5, payload(5)),
        Err(ChangelogError::DispatcherShutdown)
    ));
    assert!(matches!(
        dispatcher.open_changelog(&path),
        Err(ChangelogError::DispatcherShutdown)
    ));

    // Reads go straight to disk
    assert_eq!(log.record_count(), 5);
    assert_eq!(log.read(0, 10).unwrap(), payloads(0..5));
    log.close().unwrap();
}

#[test]
fn test_reads_agree_with_count_during_shutdown() {
    for _ in 0..20 {
        let (_temp, _path, dispatcher, log) = setup(manual_flush_config());
        append_range(&log, 0..50);

        let dispatcher = Arc::new(dispatcher);
        let stopper = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.shutdown())
        };

        while !stopper.is_finished() {
            assert_eq!(log.record_count(), 50);
            assert_eq!(log.read(0, 100).unwrap(), payloads(0..50));
            thread::yield_now();
        }
        stopper.join().unwrap();

        assert_eq!(log.record_count(), 50);
        assert_eq!(log.read(0, 100).unwrap(), payloads(0..50));
        log.close().unwrap();
    }
}

#[test]
fn test_drop_drains_queues() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("000000001.log");
    {
        let dispatcher = Dispatcher::new(manual_flush_config()).unwrap();
        let log = dispatcher
            .create_changelog(&path, 1, EpochId::default(), 0)
            .unwrap();
        append_range(&log, 0..25);
    }
    assert_eq!(durable_count(&path), 25);
}
