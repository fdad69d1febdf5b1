mod common;

use common::{node, packets_in, queue_netmail, shared, uplink, wait_until};
use ftnbbs::binkp::{BinkpClient, BinkpServer, SessionError};
use ftnbbs::queue::InboundQueue;
use ftnbbs::sessionlog::FileSessionLog;
use std::sync::Arc;

const HUB: &str = "1:153/149";
const LEAF: &str = "1:153/150";

/// Mail flows both ways in one poll: the leaf sends its packet, the hub
/// answers with what it holds for the leaf, and both outbounds end empty.
#[tokio::test]
async fn poll_exchanges_mail_both_ways() {
    let hub_dir = tempfile::tempdir().unwrap();
    let hub_cfg = node(hub_dir.path(), HUB, vec![uplink(LEAF, 0, "secret", &["1:153/150"])]);
    queue_netmail(&hub_cfg, LEAF, "hub to leaf");
    let hub_cfg = shared(hub_cfg);
    let hub_log = Arc::new(FileSessionLog::new(hub_dir.path().join("sessions.jsonl")));
    let mut server = BinkpServer::new(hub_cfg.clone()).with_session_log(hub_log.clone());
    let addr = server.start().await.unwrap();
    let handle = server.handle();
    let task = tokio::spawn(async move { server.run().await });

    let leaf_dir = tempfile::tempdir().unwrap();
    let leaf_cfg = node(leaf_dir.path(), LEAF, vec![uplink(HUB, addr.port(), "secret", &["1:*"])]);
    queue_netmail(&leaf_cfg, HUB, "leaf to hub");
    let leaf_cfg = shared(leaf_cfg);

    let client = BinkpClient::new(leaf_cfg.clone());
    let reports = client.poll_all_uplinks().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success, "{:?}", reports[0].error);
    let result = reports[0].result.as_ref().unwrap();
    assert_eq!(result.files_sent.len(), 1);
    assert_eq!(result.files_received.len(), 1);

    assert!(packets_in(&leaf_cfg.outbound_dir()).is_empty());
    assert_eq!(packets_in(&leaf_cfg.inbound_dir()).len(), 1);
    assert_eq!(packets_in(&hub_cfg.inbound_dir()).len(), 1);
    let hub_out = hub_cfg.outbound_dir();
    assert!(wait_until(|| packets_in(&hub_out).is_empty()).await);

    // The received packets import cleanly on both sides.
    let leaf_report = InboundQueue::new(leaf_cfg.inbound_dir())
        .process(&common::packet_store(&leaf_cfg))
        .unwrap();
    assert_eq!((leaf_report.processed, leaf_report.messages), (1, 1));
    let hub_report = InboundQueue::new(hub_cfg.inbound_dir())
        .process(&common::packet_store(&hub_cfg))
        .unwrap();
    assert_eq!(hub_report.processed, 1);

    assert!(wait_until(|| hub_log.recent(10).map(|r| !r.is_empty()).unwrap_or(false)).await);
    let record = hub_log.recent(1).unwrap().remove(0);
    assert!(record.success);
    assert_eq!(record.auth_method.as_deref(), Some("password"));

    handle.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn wrong_password_moves_nothing() {
    let hub_dir = tempfile::tempdir().unwrap();
    let hub_cfg = node(hub_dir.path(), HUB, vec![uplink(LEAF, 0, "secret", &["1:153/150"])]);
    queue_netmail(&hub_cfg, LEAF, "held");
    let hub_cfg = shared(hub_cfg);
    let mut server = BinkpServer::new(hub_cfg.clone());
    let addr = server.start().await.unwrap();
    let handle = server.handle();
    let task = tokio::spawn(async move { server.run().await });

    let leaf_dir = tempfile::tempdir().unwrap();
    let leaf_cfg = node(leaf_dir.path(), LEAF, vec![uplink(HUB, addr.port(), "bad", &["1:*"])]);
    queue_netmail(&leaf_cfg, HUB, "not sent");
    let leaf_cfg = shared(leaf_cfg);

    let client = BinkpClient::new(leaf_cfg.clone());
    let err = client
        .connect(HUB, None, None, None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::Auth(_) | SessionError::Remote { .. }),
        "unexpected error: {}",
        err
    );

    assert_eq!(packets_in(&leaf_cfg.outbound_dir()).len(), 1);
    assert!(packets_in(&leaf_cfg.inbound_dir()).is_empty());
    assert!(packets_in(&hub_cfg.inbound_dir()).is_empty());
    let hub_out = hub_cfg.outbound_dir();
    assert!(wait_until(|| packets_in(&hub_out).len() == 1).await);

    handle.stop();
    task.await.unwrap().unwrap();
}
