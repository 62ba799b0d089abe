//! UDP flow-map scenarios over pipe streams
//!
//! Covers flow reuse within the idle window, distinct streams after a
//! flow closes, and teardown signaling: the mapping half of the UDP
//! forwarding path, with pipe streams standing in for tunnel streams.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::timeout;

use phantom_proxy::flow::{UdpFlowMap, UDP_IDLE_TIMEOUT};
use phantom_proxy::session::{pipe_pair, DynStream};

#[tokio::test]
async fn test_datagrams_within_window_share_stream() {
    let map = UdpFlowMap::new();
    let opened = Arc::new(AtomicU32::new(0));

    // Five datagrams from the same source to the same target: one stream.
    let mut sids = Vec::new();
    for i in 0..5u32 {
        let opened = Arc::clone(&opened);
        let entry = map
            .get_or_create("127.0.0.1:5000", "127.0.0.1:9002", move || async move {
                let sid = opened.fetch_add(1, Ordering::SeqCst) + 1;
                let (a, b) = pipe_pair(sid);
                // Keep the far end alive for the duration of the test.
                tokio::spawn(async move {
                    let mut b = b;
                    let mut sink = Vec::new();
                    let _ = b.read_to_end(&mut sink).await;
                });
                Ok(Box::new(a) as DynStream)
            })
            .await
            .expect("flow");
        entry.flow.forward(format!("ping-{i}").as_bytes()).await.unwrap();
        sids.push(entry.flow.sid());
    }

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert!(sids.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_flow_closed_then_reopened_gets_new_stream() {
    let map = UdpFlowMap::new();
    let opened = Arc::new(AtomicU32::new(0));

    let open = |opened: Arc<AtomicU32>| {
        move || async move {
            let sid = opened.fetch_add(1, Ordering::SeqCst) + 1;
            let (a, _b) = pipe_pair(sid);
            Ok(Box::new(a) as DynStream)
        }
    };

    let first = map
        .get_or_create("127.0.0.1:5000", "127.0.0.1:9002", open(Arc::clone(&opened)))
        .await
        .expect("first flow");
    let first_sid = first.flow.sid();

    // Idle expiry closes the flow (the handler calls close on deadline).
    map.close(first.key);

    let second = map
        .get_or_create("127.0.0.1:5000", "127.0.0.1:9002", open(Arc::clone(&opened)))
        .await
        .expect("second flow");

    assert_eq!(opened.load(Ordering::SeqCst), 2);
    assert_ne!(first_sid, second.flow.sid());
    assert!(second.reader.is_some());
}

#[tokio::test]
async fn test_close_signal_reaches_handler() {
    let map = UdpFlowMap::new();
    let entry = map
        .get_or_create("src", "dst", || async {
            let (a, _b) = pipe_pair(1);
            Ok(Box::new(a) as DynStream)
        })
        .await
        .expect("flow");

    let flow = Arc::clone(&entry.flow);
    let waiter = tokio::spawn(async move {
        flow.closed().await;
    });

    map.close(entry.key);
    timeout(Duration::from_secs(1), waiter)
        .await
        .expect("close must signal promptly")
        .unwrap();
    assert!(map.is_empty());
}

#[tokio::test]
async fn test_idle_deadline_is_eight_seconds() {
    assert_eq!(UDP_IDLE_TIMEOUT, Duration::from_secs(8));
}

#[tokio::test]
async fn test_distinct_sources_get_distinct_flows() {
    let map = UdpFlowMap::new();
    let opened = Arc::new(AtomicU32::new(0));

    for port in [5000u16, 5001, 5002] {
        let opened = Arc::clone(&opened);
        map.get_or_create(
            &format!("127.0.0.1:{port}"),
            "127.0.0.1:9002",
            move || async move {
                let sid = opened.fetch_add(1, Ordering::SeqCst) + 1;
                let (a, _b) = pipe_pair(sid);
                Ok(Box::new(a) as DynStream)
            },
        )
        .await
        .expect("flow");
    }

    assert_eq!(opened.load(Ordering::SeqCst), 3);
    assert_eq!(map.len(), 3);
}
