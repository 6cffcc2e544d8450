//! End-to-end exchanges between two engines over the loopback network.

use std::sync::Arc;

use distdb_codec::{
    DataItem, MAX_SYNC_BATCH_ITEMS, SOFTWARE_VERSION_CURRENT, SOFTWARE_VERSION_EARLIEST,
};
use distdb_storage::SyncStorage;
use distdb_sync_engine::{
    Metadata, PermissionFlags, StaticAccessControl, SyncConfig, SyncState, SyncStatus,
};
use distdb_sync_protocol::{DataRequestPacket, Message, SyncCode, SyncMode};
use distdb_testkit::{paired_devices, DeviceOptions, DevicePair, DEVICE_A, DEVICE_B};

fn seed(store: &distdb_storage::MemorySyncStore, entries: &[(&str, u64)]) {
    for (key, timestamp) in entries {
        store
            .put_at(key.as_bytes(), format!("{key}-value").into_bytes(), *timestamp)
            .unwrap();
    }
}

fn pair_with_b(options: DeviceOptions) -> DevicePair {
    DevicePair::builder().with_b(options).build()
}

#[test]
fn test_push_end_to_end() {
    let pair = paired_devices();
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("k1", 100), ("k2", 101)]);

    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(pair.store_b.get(b"k1").unwrap(), Some(b"k1-value".to_vec()));
    assert_eq!(pair.store_b.get(b"k2").unwrap(), Some(b"k2-value".to_vec()));
    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::SendFinished);
    assert_eq!(pair.metadata_a.get_local_water_mark(DEVICE_B), 102);
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 102);
    assert_eq!(pair.a.state(), SyncState::Idle);
    assert_eq!(pair.store_a.open_token_count(), 0);

    // nothing new: the second push is empty and changes nothing
    pair.a.start(SyncMode::Push).unwrap();
    pair.run();
    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::SendFinished);
    assert_eq!(pair.store_b.len(), 2);
    assert_eq!(pair.metadata_a.get_local_water_mark(DEVICE_B), 102);
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 102);
}

#[test]
fn test_pushed_records_remember_their_origin() {
    let pair = paired_devices();
    seed(&pair.store_a, &[("k1", 100)]);
    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    let record = pair.store_b.record(b"k1").unwrap();
    assert_eq!(record.orig_device, distdb_storage::hash_device_id(DEVICE_A));
    assert!(!record.is_local());
}

#[test]
fn test_pull_end_to_end() {
    let pair = paired_devices();
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_b, &[("k1", 100), ("k2", 101)]);

    pair.a.start(SyncMode::Pull).unwrap();
    pair.run();

    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::RecvFinished);
    assert_eq!(pair.store_a.len(), 2);
    assert_eq!(pair.metadata_a.get_peer_water_mark(DEVICE_B), 102);
    assert_eq!(pair.metadata_b.get_local_water_mark(DEVICE_A), 102);
    assert_eq!(pair.a.state(), SyncState::Idle);
    assert_eq!(pair.b.state(), SyncState::Idle);
    assert_eq!(pair.store_b.open_token_count(), 0);
}

#[test]
fn test_push_pull_end_to_end() {
    let pair = paired_devices();
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("a1", 100)]);
    seed(&pair.store_b, &[("b1", 200)]);

    pair.a.start(SyncMode::PushAndPull).unwrap();
    pair.run();

    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::Finished);
    for store in [&pair.store_a, &pair.store_b] {
        assert_eq!(store.get(b"a1").unwrap(), Some(b"a1-value".to_vec()));
        assert_eq!(store.get(b"b1").unwrap(), Some(b"b1-value".to_vec()));
    }
    // a1 came back from B and was recognised as this device's own write
    assert!(pair.store_a.record(b"a1").unwrap().orig_device.is_empty());
    assert_eq!(pair.metadata_a.get_peer_water_mark(DEVICE_B), 201);
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 101);
    assert_eq!(pair.a.state(), SyncState::Idle);
    assert_eq!(pair.b.state(), SyncState::Idle);
}

#[test]
fn test_earliest_peer_fallback() {
    let pair = pair_with_b(DeviceOptions {
        remote_version: 0,
        ..DeviceOptions::default()
    });
    pair.network.set_communicator_version(DEVICE_A, Some(0));
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("k1", 100)]);

    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::SendFinished);
    assert_eq!(
        pair.b.with_context(|ctx| ctx.remote_version()),
        SOFTWARE_VERSION_EARLIEST
    );
    assert_eq!(pair.store_b.len(), 1);
}

#[test]
fn test_receiver_requires_ability_sync() {
    let pair = pair_with_b(DeviceOptions {
        remote_version: 0,
        ..DeviceOptions::default()
    });
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("k1", 100)]);

    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(
        outcomes.try_recv().unwrap().status,
        SyncStatus::Failed(SyncCode::NeedAbilitySync)
    );
    assert!(pair.store_b.is_empty());
    assert_eq!(pair.a.state(), SyncState::Idle);
}

#[test]
fn test_unknown_peer_version_times_out() {
    let pair = pair_with_b(DeviceOptions {
        remote_version: 0,
        ..DeviceOptions::default()
    });
    pair.network.set_communicator_version(DEVICE_A, None);
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("k1", 100)]);

    pair.a.start(SyncMode::Push).unwrap();
    pair.run();
    assert_eq!(pair.a.state(), SyncState::RequestSent);
    assert!(outcomes.try_recv().is_err());

    pair.a.on_timeout();
    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::Timeout);
    assert_eq!(pair.a.state(), SyncState::Timeout);
    assert!(pair.store_b.is_empty());
}

#[test]
fn test_newer_packet_is_answered_with_version_not_supported() {
    let pair = paired_devices();
    let mut packet = DataRequestPacket::new(SOFTWARE_VERSION_CURRENT);
    packet.set_basic_info(SyncCode::Ok, SOFTWARE_VERSION_CURRENT, 0, 0, SyncMode::Push);
    let message = Message::request(DEVICE_B, 77, 1, packet);
    let mut bytes = message.encode_payload().unwrap();
    bytes[..4].copy_from_slice(&(SOFTWARE_VERSION_CURRENT + 1).to_be_bytes());

    let decoded = Message::decode(message.header.clone(), &bytes).unwrap();
    assert_eq!(
        decoded.request_packet().unwrap().send_code,
        SyncCode::VersionNotSupport
    );
    pair.b.on_message(decoded).unwrap();

    let reply = pair.network.pop().unwrap();
    assert_eq!(reply.from, DEVICE_B);
    assert_eq!(reply.message.header.session_id, 77);
    assert_eq!(
        reply.message.ack_packet().unwrap().recv_code,
        SyncCode::VersionNotSupport
    );
}

#[test]
fn test_oversized_batch_claim_changes_nothing() {
    let pair = paired_devices();
    seed(&pair.store_b, &[("mine", 100)]);
    let mut packet = DataRequestPacket::new(SOFTWARE_VERSION_CURRENT);
    packet.data = vec![DataItem::new(b"k1".to_vec(), b"v1".to_vec(), 100)];
    packet.set_basic_info(SyncCode::Ok, SOFTWARE_VERSION_CURRENT, 0, 0, SyncMode::Push);
    let message = Message::request(DEVICE_B, 77, 1, packet);
    let mut bytes = message.encode_payload().unwrap();
    // the entry count follows the packet version
    bytes[4..8].copy_from_slice(&(MAX_SYNC_BATCH_ITEMS + 1).to_be_bytes());

    let err = pair
        .b
        .on_wire_message(message.header.clone(), &bytes)
        .unwrap_err();

    assert_eq!(err.code(), SyncCode::OutOfMemory);
    assert_eq!(pair.store_b.len(), 1);
    assert!(pair.store_b.record(b"k1").is_none());
    assert_eq!(pair.store_b.get_max_timestamp(), 100);
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 0);
    assert_eq!(pair.metadata_b.get_local_water_mark(DEVICE_A), 0);
    assert_eq!(pair.network.pending(), 0);
    assert_eq!(pair.b.state(), SyncState::Idle);
    let stats = pair.b.stats();
    assert_eq!(stats.requests_received, 0);
    assert!(stats.last_error.is_some());

    // the same payload with its real count goes through
    let bytes = message.encode_payload().unwrap();
    pair.b.on_wire_message(message.header.clone(), &bytes).unwrap();
    assert_eq!(pair.store_b.get(b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 101);
}

#[test]
fn test_permission_denied() {
    let access = Arc::new(StaticAccessControl::new());
    access.deny(DEVICE_A, PermissionFlags::RECEIVE);
    let pair = pair_with_b(DeviceOptions {
        access,
        ..DeviceOptions::default()
    });
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("k1", 100)]);

    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(
        outcomes.try_recv().unwrap().status,
        SyncStatus::PermissionCheckFailed
    );
    assert!(pair.store_b.is_empty());
    assert_eq!(pair.store_a.open_token_count(), 0);
}

#[test]
fn test_rebuilt_peer_receives_full_history() {
    let mut pair = paired_devices();
    seed(&pair.store_a, &[("k1", 100), ("k2", 101)]);
    pair.a.start(SyncMode::Push).unwrap();
    pair.run();
    assert_eq!(pair.metadata_a.get_local_water_mark(DEVICE_B), 102);

    pair.rebuild_b();
    seed(&pair.store_a, &[("k3", 102)]);
    let mut outcomes = pair.a.subscribe();
    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::SendFinished);
    assert_eq!(pair.store_b.len(), 3);
    assert_eq!(pair.a.stats().resends, 1);
    assert_eq!(pair.metadata_a.get_local_water_mark(DEVICE_B), 103);
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 103);
}

#[test]
fn test_rebuilt_peer_stale_data_is_cleared() {
    let mut pair = DevicePair::builder()
        .with_a(DeviceOptions {
            config: SyncConfig::new().with_clear_remote_stale_data(true),
            ..DeviceOptions::default()
        })
        .build();
    seed(&pair.store_b, &[("old", 49)]);
    pair.b.start(SyncMode::Push).unwrap();
    pair.run();
    assert!(pair.store_a.get(b"old").unwrap().is_some());
    assert_eq!(pair.metadata_a.get_peer_water_mark(DEVICE_B), 50);

    pair.rebuild_b();
    seed(&pair.store_b, &[("new", 10)]);
    pair.b.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(pair.store_a.get(b"old").unwrap(), None);
    assert_eq!(pair.store_a.get(b"new").unwrap(), Some(b"new-value".to_vec()));
    assert_eq!(pair.metadata_a.get_peer_water_mark(DEVICE_B), 11);
}

#[test]
fn test_push_is_paginated() {
    let pair = DevicePair::builder()
        .with_config(SyncConfig::new().with_pack_item_sizes(2, 2))
        .build();
    let mut outcomes = pair.a.subscribe();
    for ts in 1..=7u64 {
        pair.store_a
            .put_at(format!("key-{ts}"), b"v".to_vec(), ts)
            .unwrap();
    }

    pair.a.start(SyncMode::Push).unwrap();
    pair.run();

    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::SendFinished);
    assert_eq!(pair.store_b.len(), 7);
    assert_eq!(pair.a.stats().acks_received, 4);
    assert_eq!(pair.b.stats().requests_received, 4);
    assert_eq!(pair.metadata_b.get_peer_water_mark(DEVICE_A), 8);
    assert_eq!(pair.store_a.open_token_count(), 0);
}

#[test]
fn test_pull_is_paginated_with_save_notify() {
    let pair = DevicePair::builder()
        .with_config(
            SyncConfig::new()
                .with_pack_item_sizes(2, 2)
                .with_save_notify_threshold(2),
        )
        .build();
    let mut outcomes = pair.a.subscribe();
    for ts in 1..=5u64 {
        pair.store_b
            .put_at(format!("key-{ts}"), b"v".to_vec(), ts)
            .unwrap();
    }

    pair.a.start(SyncMode::Pull).unwrap();
    pair.run();

    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::RecvFinished);
    assert_eq!(pair.store_a.len(), 5);
    // three acks plus a save notify for each full page
    assert_eq!(pair.b.stats().acks_received, 5);
    assert_eq!(pair.b.state(), SyncState::Idle);
    assert_eq!(pair.store_b.open_token_count(), 0);
    assert_eq!(pair.store_a.get_max_timestamp(), 5);
}

#[test]
fn test_offline_peer_fails_the_task() {
    let pair = paired_devices();
    let mut outcomes = pair.a.subscribe();
    seed(&pair.store_a, &[("k1", 100)]);
    pair.network.set_offline(DEVICE_B, true);

    assert!(pair.a.start(SyncMode::Push).is_err());
    assert!(matches!(
        outcomes.try_recv().unwrap().status,
        SyncStatus::Failed(_)
    ));
    assert_eq!(pair.a.state(), SyncState::Idle);
    assert_eq!(pair.metadata_a.get_local_water_mark(DEVICE_B), 0);

    pair.network.set_offline(DEVICE_B, false);
    pair.a.start(SyncMode::Push).unwrap();
    pair.run();
    assert_eq!(outcomes.try_recv().unwrap().status, SyncStatus::SendFinished);
    assert_eq!(pair.store_b.len(), 1);
}
