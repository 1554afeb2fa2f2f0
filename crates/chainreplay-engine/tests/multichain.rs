//! Two networks with different block times replayed as one ordered stream.

mod common;

use std::sync::Arc;

use chainreplay_core::config::SyncTuning;
use chainreplay_core::handler::HandlerFunctions;
use chainreplay_sync::mock::{named_filter, MockProvider, TOKEN_ADDRESS};

use common::{eventually, harness, network, recording, schema, Seen};

#[tokio::test]
async fn events_are_replayed_in_global_order_below_the_slowest_network() {
    // Chain 1: 12 s blocks up to t=1240. Chain 2: 2 s blocks up to t=1200.
    let slow = Arc::new(MockProvider::with_chain(1, 1_000, 12));
    slow.extend_canonical("a", 0, 20, |n| if n % 2 == 0 { vec![0] } else { vec![] });
    let fast = Arc::new(MockProvider::with_chain(2, 1_000, 2));
    fast.extend_canonical("b", 0, 100, |n| if n % 5 == 0 { vec![0, 1] } else { vec![] });

    let tuning = SyncTuning {
        event_page_size: 3,
        max_block_range: 7,
        ..SyncTuning::default()
    };
    let h = harness(
        vec![network("mainnet", 1, 2), network("base", 2, 2)],
        vec![
            named_filter("Token", "mainnet", 1, TOKEN_ADDRESS, 0),
            named_filter("BaseToken", "base", 2, TOKEN_ADDRESS, 0),
        ],
        tuning,
        vec![slow.clone(), fast.clone()],
    );

    let seen = Seen::default();
    let handlers = recording(
        recording(HandlerFunctions::new(), "Token", seen.clone()),
        "BaseToken",
        seen.clone(),
    );
    h.pipeline.start(handlers, schema()).await.unwrap();

    let aggregator = h.pipeline.aggregator().clone();
    let service = h.pipeline.handler_service().clone();
    eventually("both networks at head", || aggregator.checkpoint() >= 1_200).await;
    eventually("replay to checkpoint", || service.watermark() >= 1_200).await;

    // The faster network bounds the checkpoint: nothing past t=1200 yet.
    assert_eq!(aggregator.checkpoint(), 1_200);
    let seen = seen.lock().unwrap().clone();
    // Chain 1 blocks 0, 2, .., 16 (one log each) + chain 2 every fifth block (two logs each).
    assert_eq!(seen.len(), 9 + 21 * 2);
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order or duplicated: {seen:?}");
    assert!(seen.iter().all(|(ts, ..)| *ts <= 1_200));

    let stats = service.stats();
    assert_eq!(stats.processed_events["Token:Transfer"], 9);
    assert_eq!(stats.processed_events["BaseToken:Transfer"], 42);

    h.pipeline.kill().await;
}
