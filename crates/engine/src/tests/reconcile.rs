use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use test_log::test;

use super::{accept_incoming, bound_addr, connection, key_of, test_config, wait_snapshot, wait_status, WAIT};
use crate::{BridgeRegistry, BridgeStatus, ConfigError, EngineError, ForwardRule, LocalForward, MemoryRelay, RelayTransport, RemoteForward, TransportError};

#[test(tokio::test)]
async fn update_keeps_unchanged_bridge_and_its_sessions() {
    let relay = MemoryRelay::new();
    let (registry, mut events) = BridgeRegistry::new(relay.clone(), test_config(), Some(connection()));

    let a: ForwardRule = LocalForward::tcp("a", "127.0.0.1", 0).into();
    let b: ForwardRule = LocalForward::tcp("b", "127.0.0.1", 0).into();
    let c: ForwardRule = LocalForward::tcp("c", "127.0.0.1", 0).into();
    let (key_a, key_b, key_c) = (key_of(&a), key_of(&b), key_of(&c));

    let report = registry.start(vec![a.clone(), b.clone()]).await.expect("should start");
    assert_eq!(report.started.len(), 2);
    let bridge_a = registry.bridge(&key_a).await.expect("a is active").bridge;
    let bridge_b = registry.bridge(&key_b).await.expect("b is active").bridge;

    // live session through b
    let mut listener = relay.listen(&b.endpoint(Some(&connection())).expect("endpoint")).await.expect("should listen");
    let mut client = TcpStream::connect(bound_addr(&registry, &key_b).await).await.expect("should connect");
    let mut far = accept_incoming(&mut listener).await;
    wait_snapshot(&registry, &key_b, |s| s.active_sessions == 1).await;

    let report = registry.update_config(vec![b.clone(), c.clone()]).await.expect("should update");
    assert_eq!(report.stopped, vec![key_a.clone()]);
    assert_eq!(report.unchanged, vec![key_b.clone()]);
    assert_eq!(report.started, vec![key_c.clone()]);
    assert!(report.is_complete());

    let closed = wait_status(&mut events, &key_a, BridgeStatus::Closed).await;
    assert_eq!(closed.bridge, bridge_a);
    assert!(registry.bridge(&key_a).await.is_none());
    assert_eq!(registry.bridge(&key_c).await.expect("c is active").status, BridgeStatus::Online);

    let snapshot_b = registry.bridge(&key_b).await.expect("b is still active");
    assert_eq!(snapshot_b.bridge, bridge_b);
    assert_eq!(snapshot_b.active_sessions, 1);

    client.write_all(b"still here").await.expect("write");
    let mut buf = [0u8; 10];
    timeout(WAIT, far.read_exact(&mut buf)).await.expect("in time").expect("read");
    assert_eq!(&buf, b"still here");

    let keys: Vec<_> = registry.snapshot().await.into_iter().map(|s| s.key).collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&key_b) && keys.contains(&key_c));
}

#[test(tokio::test)]
async fn changed_rule_under_same_key_is_replaced() {
    let relay = MemoryRelay::new();
    let (registry, _events) = BridgeRegistry::new(relay, test_config(), Some(connection()));

    let first: ForwardRule = LocalForward::tcp("svc", "127.0.0.1", 0).into();
    let second: ForwardRule = LocalForward::tcp("svc", "127.0.0.1", 0).with_host_name("svc.internal").into();
    let key = key_of(&first);
    assert_eq!(key, key_of(&second));

    registry.start(vec![first]).await.expect("should start");
    let before = registry.bridge(&key).await.expect("active").bridge;

    let report = registry.update_config(vec![second]).await.expect("should update");
    assert_eq!(report.stopped, vec![key.clone()]);
    assert_eq!(report.started, vec![key.clone()]);
    let after = registry.bridge(&key).await.expect("active").bridge;
    assert_ne!(before, after);
}

#[test(tokio::test)]
async fn partial_failure_still_starts_valid_rules() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind");
    let port = taken.local_addr().expect("addr").port();

    let relay = MemoryRelay::new();
    let (registry, mut events) = BridgeRegistry::new(relay, test_config(), Some(connection()));
    let a: ForwardRule = LocalForward::tcp("a", "127.0.0.1", 0).into();
    let b: ForwardRule = LocalForward::tcp("b", "127.0.0.1", port).into();
    let invalid: ForwardRule = LocalForward::default().into();

    let report = registry.start(vec![a.clone(), b.clone(), invalid]).await.expect("partial failures are not fatal");
    assert_eq!(report.started, vec![key_of(&a)]);
    assert_eq!(report.failed.len(), 2);
    // invalid rules are rejected before any bridge is opened
    assert!(matches!(report.failed[0].error, EngineError::Config(ConfigError::InvalidRule { .. })));
    assert!(report.failed[0].key.is_none());
    assert_eq!(report.failed[1].key.as_ref(), Some(&key_of(&b)));
    assert!(report.failed[1].rule.contains(&port.to_string()));

    wait_status(&mut events, &key_of(&a), BridgeStatus::Online).await;
    assert_eq!(registry.snapshot().await.len(), 1);
}

#[test(tokio::test)]
async fn duplicate_endpoint_keeps_first_rule() {
    let relay = MemoryRelay::new();
    let (registry, _events) = BridgeRegistry::new(relay, test_config(), Some(connection()));
    let first: ForwardRule = LocalForward::tcp("dup", "127.0.0.1", 0).into();
    let second: ForwardRule = LocalForward::tcp("dup", "127.0.0.1", 0).with_host_name("other").into();

    let report = registry.start(vec![first.clone(), second]).await.expect("should start");
    assert_eq!(report.started, vec![key_of(&first)]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].error, EngineError::Config(ConfigError::DuplicateEndpoint { .. })));

    // starting the identical rule again is a no-op
    let report = registry.start(vec![first.clone()]).await.expect("should start");
    assert_eq!(report.unchanged, vec![key_of(&first)]);
    assert!(report.started.is_empty());
}

#[test(tokio::test)]
async fn close_leaves_sessions_and_stop_ends_them() {
    let relay = MemoryRelay::new();
    let (registry, _events) = BridgeRegistry::new(relay.clone(), test_config(), Some(connection()));
    let rule: ForwardRule = LocalForward::tcp("drain", "127.0.0.1", 0).into();
    let key = key_of(&rule);

    let mut listener = relay.listen(&rule.endpoint(Some(&connection())).expect("endpoint")).await.expect("should listen");
    registry.start(vec![rule]).await.expect("should start");
    let addr = bound_addr(&registry, &key).await;
    let mut client = TcpStream::connect(addr).await.expect("should connect");
    let mut far = accept_incoming(&mut listener).await;
    wait_snapshot(&registry, &key, |s| s.active_sessions == 1).await;

    // removing the rule closes the listener, the session keeps flowing
    let report = registry.update_config(vec![]).await.expect("should update");
    assert_eq!(report.stopped, vec![key.clone()]);
    assert!(TcpStream::connect(addr).await.is_err());

    client.write_all(b"after close").await.expect("write");
    let mut buf = [0u8; 11];
    timeout(WAIT, far.read_exact(&mut buf)).await.expect("in time").expect("read");
    assert_eq!(&buf, b"after close");
    far.write_all(b"reply").await.expect("write back");
    let mut buf = [0u8; 5];
    timeout(WAIT, client.read_exact(&mut buf)).await.expect("in time").expect("read back");
    assert_eq!(&buf, b"reply");

    // process wide stop cancels what is left
    registry.stop().await.expect("should stop");
    let mut rest = Vec::new();
    let _ = timeout(WAIT, client.read_to_end(&mut rest)).await.expect("session should be cancelled");
    assert!(rest.is_empty());

    // and the registry can start again
    let rule: ForwardRule = LocalForward::tcp("drain", "127.0.0.1", 0).into();
    let report = registry.start(vec![rule]).await.expect("should restart");
    assert_eq!(report.started, vec![key]);
}

#[test(tokio::test)]
async fn fatal_open_error_aborts_reconciliation() {
    let relay = MemoryRelay::new();
    relay.crash("broken");
    let (registry, mut events) = BridgeRegistry::new(relay, test_config(), Some(connection()));
    let broken: ForwardRule = RemoteForward::tcp("broken", "localhost", 8080).into();
    let key = key_of(&broken);

    let err = registry.start(vec![broken.clone()]).await.expect_err("fatal open should fail start");
    assert!(err.is_fatal());
    assert!(matches!(err, EngineError::Transport(TransportError::Fatal(_))));
    wait_status(&mut events, &key, BridgeStatus::Faulted).await;
    assert!(registry.bridge(&key).await.is_none());

    let fine: ForwardRule = LocalForward::tcp("fine", "127.0.0.1", 0).into();
    let err = registry.update_config(vec![fine, broken]).await.expect_err("fatal open should fail update");
    assert!(err.is_fatal());
    wait_status(&mut events, &key, BridgeStatus::Faulted).await;
}
