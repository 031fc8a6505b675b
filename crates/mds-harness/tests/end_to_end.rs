//! End-to-end scenarios driving a real router over a real socket.

use std::time::Duration;

use mds_harness::SimCluster;
use mds_proto::{HeaderList, control};

#[test]
fn assign_id_round_trip() {
    let cluster = SimCluster::start();
    let mut a = cluster.connect();
    let mut b = cluster.connect();

    assert_eq!(a.assign_id().to_string(), "1:1");
    assert_eq!(b.assign_id().to_string(), "1:2");
}

#[test]
fn simple_multicast_reaches_subscriber_but_not_originator() {
    let cluster = SimCluster::start();
    let mut a = cluster.connect();
    let mut b = cluster.connect();

    b.intercept("Command: ping", 0, false);
    // Give the subscription a moment to land before A's ping can race it.
    std::thread::sleep(Duration::from_millis(50));

    let mut headers = HeaderList::new();
    headers.push(control::COMMAND, "ping").unwrap();
    a.send_headers(headers);

    let delivered = b.recv().expect("subscriber receives the multicast");
    assert_eq!(delivered.control().command(), Some("ping"));
    assert!(!delivered.headers.contains(control::MODIFY_ID));

    assert!(a.recv_timeout(Duration::from_millis(200)).is_none());
}

#[test]
fn modifying_subscriber_rewrites_payload_before_lower_priority_receives_it() {
    let cluster = SimCluster::start();
    let mut a = cluster.connect();
    let mut m = cluster.connect();
    let mut l = cluster.connect();

    m.intercept("Command: ping", 10, true);
    l.intercept("Command: ping", 0, false);
    std::thread::sleep(Duration::from_millis(50));

    let mut headers = HeaderList::new();
    headers.push(control::COMMAND, "ping").unwrap();
    a.send_headers(headers);

    let to_modify = m.recv().expect("modifying subscriber sees the message first");
    let modify_id =
        to_modify.control().modify_id().expect("a fresh Modify ID was prepended").to_string();
    m.reply_modify(&modify_id, "bye!\n");

    let delivered = l.recv().expect("non-modifying subscriber receives the rewrite");
    assert_eq!(delivered.payload.as_ref(), b"bye!\n");
}

#[test]
fn modifying_subscriber_can_consume_the_message() {
    let cluster = SimCluster::start();
    let mut a = cluster.connect();
    let mut m = cluster.connect();
    let mut l = cluster.connect();

    m.intercept("Command: ping", 10, true);
    l.intercept("Command: ping", 0, false);
    std::thread::sleep(Duration::from_millis(50));

    let mut headers = HeaderList::new();
    headers.push(control::COMMAND, "ping").unwrap();
    a.send_headers(headers);

    let to_modify = m.recv().expect("modifying subscriber sees the message first");
    let modify_id =
        to_modify.control().modify_id().expect("a fresh Modify ID was prepended").to_string();
    m.reply_modify(&modify_id, "");

    assert!(l.recv_timeout(Duration::from_millis(300)).is_none(), "consumed message must not reach a lower-priority target");
}

#[test]
fn closed_client_fans_out_to_subscribers() {
    let cluster = SimCluster::start();
    let mut c = cluster.connect();
    c.intercept("Client closed", 0, false);
    std::thread::sleep(Duration::from_millis(50));

    let mut a = cluster.connect();
    let id = a.assign_id();
    drop(a);

    let notice = c.recv().expect("subscriber hears about the closed client");
    assert_eq!(notice.control().command(), None);
    let header = notice
        .headers
        .iter()
        .find(|(name, _)| *name == control::CLIENT_CLOSED)
        .map(|(_, value)| value.to_string())
        .expect("Client closed header present");
    assert_eq!(header, id.to_string());
}

#[test]
fn reexec_preserves_subscriptions() {
    let mut cluster = SimCluster::start();
    let mut a = cluster.connect();
    let mut b = cluster.connect();

    b.intercept("Command: ping", 0, false);
    std::thread::sleep(Duration::from_millis(50));

    cluster.reexec_in_place();
    std::thread::sleep(Duration::from_millis(50));

    let mut headers = HeaderList::new();
    headers.push(control::COMMAND, "ping").unwrap();
    a.send_headers(headers);

    let delivered = b.recv().expect("subscription survives the re-exec");
    assert_eq!(delivered.control().command(), Some("ping"));
    assert!(b.recv_timeout(Duration::from_millis(200)).is_none(), "ping reaches B exactly once");
}
