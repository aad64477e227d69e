use astronomy_service::fetch::FetchError;
use astronomy_service::pipeline::{Delivered, DeliveryReport, LoadStatus};

use crate::{Grid, Script, ScriptedFetcher, payload, png, setup_pipeline, wait_for_cache};

#[tokio::test]
async fn test_fetch_and_deliver() {
    let fetcher = ScriptedFetcher::new().with_payload(42, png());
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 42);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    assert!(pipeline.is_in_flight(0));

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!(
        report,
        DeliveryReport {
            applied: 1,
            ..Default::default()
        }
    );

    let shown = grid.shown(0).unwrap();
    assert_eq!(&shown[..4], &[0x89, 0x50, 0x4e, 0x47]);
    assert_eq!(shown, &png());
    assert_eq!(wait_for_cache(pipeline.cache(), 42).await, png());

    assert_eq!(fetcher.calls(42), 1);
    assert_eq!(pipeline.in_flight(), 0);
    assert!(!pipeline.is_in_flight(0));
}

#[tokio::test]
async fn test_cache_hit_skips_fetch() {
    let fetcher = ScriptedFetcher::new().with_payload(42, png());
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    pipeline.cache().put(42, png());

    grid.assign(3, 42);
    assert_eq!(pipeline.load(&mut grid, 3).await, LoadStatus::Cached);
    assert_eq!(grid.shown(3), Some(&png()));

    assert_eq!(pipeline.in_flight(), 0);
    assert_eq!(pipeline.next_delivery().await.map(|d| d.id()), None);
    assert_eq!(fetcher.total_calls(), 0);
}

#[tokio::test]
async fn test_second_load_served_from_cache() {
    let fetcher = ScriptedFetcher::new().with_payload(5, payload(5));
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 5);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    pipeline.run_until_idle(&mut grid).await;
    wait_for_cache(pipeline.cache(), 5).await;

    // scrolling brings the same photo into another cell
    grid.assign(1, 5);
    assert_eq!(pipeline.load(&mut grid, 1).await, LoadStatus::Cached);
    assert_eq!(grid.shown(1), Some(&payload(5)));
    assert_eq!(fetcher.calls(5), 1);
}

#[tokio::test]
async fn test_stale_delivery_is_discarded() {
    let fetcher = ScriptedFetcher::new()
        .with_payload(1, payload(1))
        .with_payload(2, payload(2));
    let gate = fetcher.gate(1);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 1);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);

    // the cell is reused before photo 1 arrives
    grid.assign(0, 2);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    gate.open();

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!((report.applied, report.stale), (1, 1));

    assert_eq!(grid.shown(0), Some(&payload(2)));
    assert!(grid.applied().iter().all(|(_, p)| *p != payload(1)));

    // a stale result still ends up in the cache
    assert_eq!(wait_for_cache(pipeline.cache(), 1).await, payload(1));
    assert_eq!(pipeline.in_flight(), 0);
}

#[tokio::test]
async fn test_stale_delivery_after_late_reassignment() {
    let fetcher = ScriptedFetcher::new().with_payload(1, payload(1));
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 1);
    pipeline.load(&mut grid, 0).await;
    let delivery = pipeline.next_delivery().await.unwrap();
    assert_eq!((*delivery.key(), *delivery.slot()), (1, 0));

    // reassigned after the fetch completed, but before the delivery is processed
    grid.assign(0, 9);
    assert_eq!(pipeline.deliver(&mut grid, delivery), Delivered::Stale);
    assert_eq!(grid.shown(0), None);
}

#[tokio::test]
async fn test_slot_reassigned_back_is_applied_once() {
    let fetcher = ScriptedFetcher::new()
        .with_payload(1, payload(1))
        .with_payload(2, payload(2));
    let gate = fetcher.gate(1);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 1);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    grid.assign(0, 2);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);

    // scrolled back while photo 1 is still being fetched
    grid.assign(0, 1);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Attached);
    assert_eq!(pipeline.in_flight(), 1);
    gate.open();

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!((report.applied, report.stale), (1, 2));
    assert_eq!(grid.applied(), &[(0, payload(1))]);
    assert_eq!(fetcher.calls(1), 1);
    assert_eq!(pipeline.in_flight(), 0);
}

#[tokio::test]
async fn test_cache_hit_supersedes_pending_request() {
    let fetcher = ScriptedFetcher::new().with_payload(1, payload(1));
    let gate = fetcher.gate(1);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 1);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);

    // the photo reaches the cache some other way before the fetch completes
    pipeline.cache().put(1, payload(1));
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Cached);
    assert!(!pipeline.is_in_flight(0));
    gate.open();

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!((report.applied, report.stale), (0, 1));
    assert_eq!(grid.applied(), &[(0, payload(1))]);
    assert_eq!(grid.shown(0), Some(&payload(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cache_written_when_idle() {
    let fetcher = ScriptedFetcher::new()
        .with_payload(1, payload(1))
        .with_payload(2, payload(2))
        .with_payload(3, payload(3));
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    for slot in 0..3 {
        grid.assign(slot, slot as u64 + 1);
        pipeline.load(&mut grid, slot).await;
    }
    // reused before its photo arrives, the fetch is still cached
    grid.assign(2, 9);

    pipeline.run_until_idle(&mut grid).await;
    assert_eq!(pipeline.cache().len_async().await, 3);
    for key in 1..=3 {
        assert_eq!(pipeline.cache().get_async(&key).await, Some(payload(key)));
    }
}

#[tokio::test]
async fn test_failed_fetch_leaves_slot_untouched() {
    let error = FetchError::DownloadError("503 Service Unavailable".into());
    let fetcher = ScriptedFetcher::new()
        .with_payload(1, payload(1))
        .with(5, Script::Fail(error.clone()));
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 1);
    pipeline.load(&mut grid, 0).await;
    pipeline.run_until_idle(&mut grid).await;
    assert_eq!(grid.shown(0), Some(&payload(1)));

    grid.assign(0, 5);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    let delivery = pipeline.next_delivery().await.unwrap();
    assert_eq!(delivery.result(), &Err(error.clone()));
    assert_eq!(pipeline.deliver(&mut grid, delivery), Delivered::Failed(error));

    assert_eq!(grid.shown(0), Some(&payload(1)));
    assert_eq!(grid.applied().len(), 1);
    assert_eq!(pipeline.cache().get_async(&5).await, None);
    assert_eq!(pipeline.in_flight(), 0);
}

#[tokio::test]
async fn test_failures_are_not_retried() {
    let fetcher = ScriptedFetcher::new();
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    for _ in 0..2 {
        grid.assign(0, 404);
        assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
        let report = pipeline.run_until_idle(&mut grid).await;
        assert_eq!(report.failed, 1);
    }

    // every load after a failure is a fresh attempt, nothing is retried in between
    assert_eq!(fetcher.calls(404), 2);
    assert_eq!(pipeline.cache().len_async().await, 0);
}

#[tokio::test]
async fn test_panicking_fetcher() {
    let fetcher = ScriptedFetcher::new().with(13, Script::Panic);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 13);
    pipeline.load(&mut grid, 0).await;

    let delivery = pipeline.next_delivery().await.unwrap();
    assert_eq!(delivery.result(), &Err(FetchError::InternalError));
    assert_eq!(
        pipeline.deliver(&mut grid, delivery),
        Delivered::Failed(FetchError::InternalError)
    );
    assert_eq!(grid.shown(0), None);
    assert_eq!(pipeline.in_flight(), 0);
}

#[tokio::test]
async fn test_unassigned_slot() {
    let fetcher = ScriptedFetcher::new().with_payload(1, payload(1));
    let gate = fetcher.gate(1);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    assert_eq!(pipeline.load(&mut grid, 4).await, LoadStatus::Unassigned);
    assert_eq!(fetcher.total_calls(), 0);

    grid.assign(4, 1);
    assert_eq!(pipeline.load(&mut grid, 4).await, LoadStatus::Fetching);

    // the cell scrolled out of view
    grid.clear(4);
    assert_eq!(pipeline.load(&mut grid, 4).await, LoadStatus::Unassigned);
    assert!(!pipeline.is_in_flight(4));
    gate.open();

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!(report.stale, 1);
    assert_eq!(grid.shown(4), None);
}

#[tokio::test]
async fn test_same_key_in_two_slots_fetches_once() {
    let fetcher = ScriptedFetcher::new().with_payload(7, payload(7));
    let gate = fetcher.gate(7);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 7);
    grid.assign(1, 7);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    assert_eq!(pipeline.load(&mut grid, 1).await, LoadStatus::Attached);
    assert_eq!(pipeline.in_flight(), 2);
    gate.open();

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!(report.applied, 2);
    assert_eq!(grid.shown(0), Some(&payload(7)));
    assert_eq!(grid.shown(1), Some(&payload(7)));
    assert_eq!(fetcher.calls(7), 1);
}

#[tokio::test]
async fn test_repeated_load_is_in_flight() {
    let fetcher = ScriptedFetcher::new().with_payload(7, payload(7));
    let gate = fetcher.gate(7);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 7);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::Fetching);
    assert_eq!(pipeline.load(&mut grid, 0).await, LoadStatus::InFlight);
    assert_eq!(pipeline.in_flight(), 1);
    gate.open();

    let report = pipeline.run_until_idle(&mut grid).await;
    assert_eq!(report.total(), 1);
    assert_eq!(grid.applied().len(), 1);
    assert_eq!(fetcher.calls(7), 1);
}

#[tokio::test]
async fn test_try_next_delivery() {
    let fetcher = ScriptedFetcher::new().with_payload(3, payload(3));
    let gate = fetcher.gate(3);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    grid.assign(0, 3);
    pipeline.load(&mut grid, 0).await;
    assert!(pipeline.try_next_delivery().is_none());
    gate.open();

    // frame ticks until the photo shows up
    let delivery = loop {
        if let Some(delivery) = pipeline.try_next_delivery() {
            break delivery;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    };
    assert_eq!(pipeline.deliver(&mut grid, delivery), Delivered::Applied);
    assert_eq!(grid.shown(0), Some(&payload(3)));
    assert!(pipeline.next_delivery().await.is_none());
}

#[tokio::test]
async fn test_registry_empty_after_every_outcome() {
    let fetcher = ScriptedFetcher::new()
        .with_payload(1, payload(1))
        .with_payload(2, payload(2))
        .with_payload(4, payload(4))
        .with(3, Script::Fail(FetchError::NotFound));
    let gate = fetcher.gate(4);
    let mut pipeline = setup_pipeline(&fetcher, 8);
    let mut grid = Grid::default();

    // success
    grid.assign(0, 1);
    pipeline.load(&mut grid, 0).await;
    // stale
    grid.assign(1, 2);
    pipeline.load(&mut grid, 1).await;
    grid.assign(1, 1);
    // failure
    grid.assign(2, 3);
    pipeline.load(&mut grid, 2).await;
    // cancel
    grid.assign(3, 4);
    pipeline.load(&mut grid, 3).await;
    assert!(pipeline.cancel(3));

    let report = pipeline.run_until_idle(&mut grid).await;
    drop(gate);

    assert_eq!(report.applied, 1);
    assert_eq!(report.stale, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.canceled, 1);
    assert_eq!(pipeline.in_flight(), 0);
    for slot in 0..4 {
        assert!(!pipeline.is_in_flight(slot));
    }
}
