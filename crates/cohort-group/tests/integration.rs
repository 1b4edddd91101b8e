//! Integration tests for group membership and shared-object replication.
//!
//! Tests cover:
//! - Commit across every member of a group
//! - Fail-fast abort on an explicit refusal, with compensating removal
//! - Deadline expiry on a hung member
//! - A crashed member counted as a failure
//! - Late joiners receiving committed objects
//! - Join, duplicate join and disconnect handling
//! - Orphan policies and removal
//! - Removal refused while a creation is still in flight
//! - Unbounded transaction timeouts and deadline timer cleanup

use cohort_core::object::{SharedValueInstantiator, SHARED_VALUE};
use cohort_core::{
    CohortError, DescriptionRegistry, EntryState, Id, SharedObject, SharedObjectDescriptor,
};
use cohort_group::{
    ContainerConfig, ContainerConfigBuilder, ContainerEvent, GroupMessage, MemoryHub,
    NetworkTransport, OrphanPolicy, SharedObjectContainer, TransactionState, TransportEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn value_factories() -> Arc<DescriptionRegistry<dyn SharedObject>> {
    let factories = Arc::new(DescriptionRegistry::new());
    factories.register(SharedValueInstantiator::description());
    factories
}

fn container(hub: &Arc<MemoryHub>, name: &str) -> SharedObjectContainer {
    container_with(hub, name, value_factories(), ContainerConfig::default())
}

fn container_with(
    hub: &Arc<MemoryHub>,
    name: &str,
    factories: Arc<DescriptionRegistry<dyn SharedObject>>,
    config: ContainerConfig,
) -> SharedObjectContainer {
    let transport = hub.transport(Id::from(name)).unwrap();
    SharedObjectContainer::new(Id::from(name), Arc::new(transport), factories, config).unwrap()
}

fn descriptor(id: &str, value: serde_json::Value) -> SharedObjectDescriptor {
    SharedObjectDescriptor::new(Id::from(id), SHARED_VALUE).with_init_args(value)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Found a group on the first container and join the rest through it.
async fn form_group(containers: &[&SharedObjectContainer]) {
    let founder = containers[0].id().clone();
    for c in containers {
        assert_ok!(c.connect(&founder).await);
    }
    let n = containers.len();
    wait_until(|| containers.iter().all(|c| c.get_members().len() == n)).await;
}

#[tokio::test]
async fn test_commit_replicates_to_every_member() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    let b = container(&hub, "b");
    form_group(&[&s, &a, &b]).await;

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(7))).await);
    assert_ok!(txn.wait_to_commit().await);
    assert_eq!(txn.state(), TransactionState::Committed);

    let object_id = Id::from("o1");
    wait_until(|| {
        [&s, &a, &b].iter().all(|c| {
            c.directory()
                .info(&object_id)
                .is_some_and(|i| i.state == EntryState::Active)
        })
    })
    .await;

    let replica = assert_ok!(b.get_shared_object(&object_id));
    assert_eq!(replica.replica_descriptor().init_args, json!(7));
    assert_eq!(b.directory().info(&object_id).unwrap().origin, Id::from("s"));
}

#[tokio::test]
async fn test_member_can_initiate() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    let b = container(&hub, "b");
    form_group(&[&s, &a, &b]).await;

    let txn = assert_ok!(b.create_shared_object(descriptor("o1", json!("x"))).await);
    assert_ok!(txn.wait_to_commit().await);

    let object_id = Id::from("o1");
    wait_until(|| s.directory().contains(&object_id) && a.directory().contains(&object_id)).await;
}

#[tokio::test]
async fn test_refusal_aborts_and_compensates() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let b = container(&hub, "b");
    // c cannot build shared values.
    let c = container_with(
        &hub,
        "c",
        Arc::new(DescriptionRegistry::new()),
        ContainerConfig::default(),
    );
    form_group(&[&s, &b, &c]).await;

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    let signal = assert_err!(txn.wait_to_commit().await);

    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(!signal.is_timeout());
    assert!(signal.cause.as_deref().unwrap_or_default().contains("c refused"));

    let object_id = Id::from("o1");
    assert!(!s.directory().contains(&object_id));
    wait_until(|| !b.directory().contains(&object_id)).await;
    assert!(!c.directory().contains(&object_id));
}

#[tokio::test]
async fn test_refusing_member_keeps_its_own_object() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let b = container(&hub, "b");
    form_group(&[&s, &b]).await;

    // b already holds an object under the same id.
    assert_ok!(b.directory().create_local(&descriptor("o1", json!("mine"))));

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!("theirs"))).await);
    let signal = assert_err!(txn.wait_to_commit().await);
    assert!(signal.cause.is_some());

    let kept = assert_ok!(b.get_shared_object(&Id::from("o1")));
    assert_eq!(kept.replica_descriptor().init_args, json!("mine"));
    assert!(!s.directory().contains(&Id::from("o1")));
}

#[tokio::test(start_paused = true)]
async fn test_hung_member_times_out() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let b = container(&hub, "b");
    let c = container(&hub, "c");
    form_group(&[&s, &b, &c]).await;

    hub.mute(c.id());
    let txn = assert_ok!(
        s.create_shared_object_with_timeout(descriptor("o1", json!(1)), Duration::from_millis(2000))
            .await
    );
    let signal = assert_err!(txn.wait_to_commit().await);

    assert_eq!(txn.state(), TransactionState::TimedOut);
    assert_eq!(signal.timeout_ms, Some(2000));
    assert!(signal.cause.is_none());

    // b acknowledged before the deadline and is told to drop its copy.
    let object_id = Id::from("o1");
    wait_until(|| !b.directory().contains(&object_id)).await;
    assert!(!s.directory().contains(&object_id));
    assert!(!c.directory().contains(&object_id));
}

#[tokio::test]
async fn test_crashed_member_is_implicit_failure() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let b = container(&hub, "b");
    let c = container(&hub, "c");
    form_group(&[&s, &b, &c]).await;

    hub.mute(c.id());
    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    hub.detach(c.id());

    let signal = assert_err!(txn.wait_to_commit().await);
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(!signal.is_timeout());

    wait_until(|| s.get_members().len() == 2 && b.get_members().len() == 2).await;
    wait_until(|| !b.directory().contains(&Id::from("o1"))).await;
}

#[tokio::test]
async fn test_wait_to_commit_twice() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    assert_ok!(txn.wait_to_commit().await);
    assert_ok!(txn.wait_to_commit().await);
}

#[tokio::test]
async fn test_late_joiner_receives_committed_objects() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let txn = assert_ok!(a.create_shared_object(descriptor("from-a", json!(1))).await);
    assert_ok!(txn.wait_to_commit().await);
    let txn = assert_ok!(s.create_shared_object(descriptor("from-s", json!(2))).await);
    assert_ok!(txn.wait_to_commit().await);

    let late = container(&hub, "late");
    assert_ok!(late.connect(s.id()).await);

    wait_until(|| late.directory().len() == 2).await;
    let info = late.directory().info(&Id::from("from-a")).unwrap();
    assert_eq!(info.origin, Id::from("a"));
    assert_eq!(info.state, EntryState::Active);
}

#[tokio::test]
async fn test_late_joiner_receives_orphaned_objects() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let txn = assert_ok!(a.create_shared_object(descriptor("o1", json!(1))).await);
    assert_ok!(txn.wait_to_commit().await);
    let object_id = Id::from("o1");
    wait_until(|| {
        s.directory()
            .info(&object_id)
            .is_some_and(|i| i.state == EntryState::Active)
    })
    .await;

    assert_ok!(a.disconnect().await);
    wait_until(|| s.directory().info(&object_id).is_some_and(|i| i.orphaned)).await;

    let late = container(&hub, "late");
    assert_ok!(late.connect(s.id()).await);
    wait_until(|| late.directory().contains(&object_id)).await;
    assert_eq!(late.directory().info(&object_id).unwrap().state, EntryState::Active);
}

#[tokio::test]
async fn test_standalone_create_commits_locally() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    assert_eq!(txn.state(), TransactionState::Committed);

    let err = assert_err!(s.create_shared_object(descriptor("o1", json!(2))).await);
    assert!(matches!(err, CohortError::DuplicateObject(_)));
}

#[tokio::test]
async fn test_duplicate_join_rejected() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    assert_ok!(s.connect(s.id()).await);

    let raw = hub.transport(Id::from("x")).unwrap();
    let mut inbound = raw.subscribe().unwrap();
    assert_ok!(raw.connect(s.id()).await);

    assert_ok!(raw.send(s.id(), GroupMessage::JoinRequest).await);
    match inbound.recv().await.unwrap() {
        TransportEvent::Message {
            message: GroupMessage::JoinAccepted { group, members },
            ..
        } => {
            assert_eq!(group, Id::from("s"));
            assert_eq!(members, vec![Id::from("s"), Id::from("x")]);
        }
        other => panic!("unexpected event {other:?}"),
    }

    assert_ok!(raw.send(s.id(), GroupMessage::JoinRequest).await);
    match inbound.recv().await.unwrap() {
        TransportEvent::Message {
            message: GroupMessage::JoinRejected { .. },
            ..
        } => {}
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(s.get_members(), vec![Id::from("s"), Id::from("x")]);
}

#[tokio::test]
async fn test_connect_twice_fails() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let err = assert_err!(a.connect(s.id()).await);
    assert!(matches!(err, CohortError::Connect(_)));
}

#[tokio::test]
async fn test_connect_to_unknown_rendezvous() {
    let hub = MemoryHub::new();
    let a = container(&hub, "a");

    let err = assert_err!(a.connect(&Id::from("nobody")).await);
    assert!(matches!(err, CohortError::Connect(_)));
    assert!(!a.is_connected());
}

#[tokio::test]
async fn test_join_through_unconnected_member_rejected() {
    let hub = MemoryHub::new();
    let idle = container(&hub, "idle");
    let a = container(&hub, "a");

    let err = assert_err!(a.connect(idle.id()).await);
    assert!(matches!(err, CohortError::Connect(_)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    assert_ok!(s.connect(s.id()).await);

    let config = ContainerConfigBuilder::new().connect_timeout_ms(500).build();
    let a = container_with(&hub, "a", value_factories(), config);
    hub.mute(s.id());

    let err = assert_err!(a.connect(s.id()).await);
    assert!(matches!(err, CohortError::Connect(_)));
    assert!(!a.is_connected());
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");

    assert_ok!(a.disconnect().await);

    form_group(&[&s, &a]).await;
    assert_ok!(a.disconnect().await);
    assert_ok!(a.disconnect().await);

    assert!(!a.is_connected());
    assert!(a.get_members().is_empty());
    wait_until(|| s.get_members() == vec![Id::from("s")]).await;
}

#[tokio::test]
async fn test_orphan_policies() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let retain = container(&hub, "retain");
    let remove = container_with(
        &hub,
        "remove",
        value_factories(),
        ContainerConfigBuilder::new()
            .orphan_policy(OrphanPolicy::Remove)
            .build(),
    );
    form_group(&[&s, &retain, &remove]).await;

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    assert_ok!(txn.wait_to_commit().await);
    let object_id = Id::from("o1");
    wait_until(|| {
        retain.directory().contains(&object_id) && remove.directory().contains(&object_id)
    })
    .await;

    assert_ok!(s.disconnect().await);

    wait_until(|| !remove.directory().contains(&object_id)).await;
    wait_until(|| retain.directory().info(&object_id).is_some_and(|i| i.orphaned)).await;
}

#[tokio::test(start_paused = true)]
async fn test_remove_during_creation_is_refused() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let b = container(&hub, "b");
    let c = container(&hub, "c");
    form_group(&[&s, &b, &c]).await;

    hub.mute(c.id());
    let txn = assert_ok!(
        s.create_shared_object_with_timeout(descriptor("o1", json!(1)), Duration::from_millis(500))
            .await
    );
    let object_id = Id::from("o1");
    wait_until(|| {
        b.directory()
            .info(&object_id)
            .is_some_and(|i| matches!(i.state, EntryState::Pending(_)))
    })
    .await;

    let err = assert_err!(s.remove_shared_object(&object_id).await);
    assert!(matches!(err, CohortError::NotFound(_)));
    let err = assert_err!(b.remove_shared_object(&object_id).await);
    assert!(matches!(err, CohortError::NotFound(_)));
    assert!(s.directory().contains(&object_id));

    // The transaction still decides the outcome for everyone.
    let signal = assert_err!(txn.wait_to_commit().await);
    assert!(signal.is_timeout());
    assert!(!s.directory().contains(&object_id));
    wait_until(|| !b.directory().contains(&object_id)).await;
}

#[tokio::test]
async fn test_unbounded_timeout_still_commits() {
    let hub = MemoryHub::new();
    let s = container_with(
        &hub,
        "s",
        value_factories(),
        ContainerConfigBuilder::new()
            .transaction_timeout_ms(u64::MAX)
            .build(),
    );
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    assert_ok!(txn.wait_to_commit().await);

    let txn = assert_ok!(
        s.create_shared_object_with_timeout(descriptor("o2", json!(2)), Duration::MAX)
            .await
    );
    assert_ok!(txn.wait_to_commit().await);
    wait_until(|| a.directory().len() == 2).await;
}

#[tokio::test]
async fn test_deadline_timers_released_on_commit() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let metrics = tokio::runtime::Handle::current().metrics();
    let baseline = metrics.num_alive_tasks();
    for i in 0..20 {
        let txn = assert_ok!(s.create_shared_object(descriptor(&format!("o{i}"), json!(i))).await);
        assert_ok!(txn.wait_to_commit().await);
    }

    // Each transaction armed a 30s timer; none may outlive its commit.
    wait_until(|| metrics.num_alive_tasks() == baseline).await;
}

#[tokio::test]
async fn test_leaving_drops_foreign_pending_objects() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let b = container(&hub, "b");
    let c = container(&hub, "c");
    form_group(&[&s, &b, &c]).await;

    hub.mute(c.id());
    let _txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    let object_id = Id::from("o1");
    wait_until(|| b.directory().contains(&object_id)).await;

    assert_ok!(b.disconnect().await);
    assert!(!b.directory().contains(&object_id));
}

#[tokio::test]
async fn test_remove_propagates() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let a = container(&hub, "a");
    form_group(&[&s, &a]).await;

    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);
    assert_ok!(txn.wait_to_commit().await);
    let object_id = Id::from("o1");
    wait_until(|| a.directory().contains(&object_id)).await;

    assert_ok!(a.remove_shared_object(&object_id).await);
    wait_until(|| !s.directory().contains(&object_id)).await;

    let err = assert_err!(a.remove_shared_object(&object_id).await);
    assert!(matches!(err, CohortError::NotFound(_)));
}

#[tokio::test]
async fn test_events() {
    let hub = MemoryHub::new();
    let s = container(&hub, "s");
    let mut events = s.subscribe();

    assert_ok!(s.connect(s.id()).await);
    let txn = assert_ok!(s.create_shared_object(descriptor("o1", json!(1))).await);

    assert_eq!(
        events.recv().await.unwrap(),
        ContainerEvent::Connected {
            group: Id::from("s")
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ContainerEvent::ObjectAdded {
            object_id: Id::from("o1")
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ContainerEvent::TransactionResolved {
            txn: txn.id(),
            object_id: Id::from("o1"),
            state: TransactionState::Committed,
        }
    );
}
