use std::sync::Arc;
use std::time::Duration;

use blockq::core::meta::{block_object_name, METADATA_NAME};
use blockq::core::{Context, Durability, Error, NewMessage, Queue, QueueConfig};
use blockq::storage::{MemoryStorage, Tiers};

fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(5))
}

fn memory_queue(count_limit: usize) -> (Queue, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let config = QueueConfig::default().with_count_limit(count_limit);
    let queue = Queue::new(config, Tiers::new("hot", storage.clone())).expect("queue");
    (queue, storage)
}

#[test]
fn ids_increase_in_append_order() {
    let (queue, _) = memory_queue(7);
    let mut appended = Vec::new();
    for i in 0..20u8 {
        appended.push(
            queue
                .add(&ctx(), NewMessage::new(vec![i]), Durability::NoSave)
                .expect("add"),
        );
    }
    appended.extend(
        queue
            .add_list(
                &ctx(),
                (20..30u8).map(|i| NewMessage::new(vec![i])).collect(),
                Durability::NoSave,
            )
            .expect("add list"),
    );

    let read = queue.get(&ctx(), 0, 100).expect("get");
    let ids: Vec<u64> = read.iter().map(|m| m.id()).collect();
    assert_eq!(ids, appended);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    let payloads: Vec<u8> = read.iter().map(|m| m.message.payload[0]).collect();
    assert_eq!(payloads, (0..30).collect::<Vec<u8>>());
}

#[test]
fn count_limit_splits_blocks() {
    let (queue, _) = memory_queue(5);
    queue
        .add_list(
            &ctx(),
            (0..10u8).map(|i| NewMessage::new(vec![i])).collect(),
            Durability::NoSave,
        )
        .expect("add");
    let infos = queue.block_infos(&ctx()).expect("infos");
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|info| info.length == 5));
    assert!(!infos[0].is_open);
    assert!(infos[1].is_open);
}

#[test]
fn byte_limit_splits_blocks() {
    let storage = Arc::new(MemoryStorage::new());
    let config = QueueConfig::default().with_count_limit(0).with_byte_limit(10);
    let queue = Queue::new(config, Tiers::new("hot", storage)).expect("queue");
    for _ in 0..4 {
        queue
            .add(&ctx(), NewMessage::new(vec![0u8; 6]), Durability::NoSave)
            .expect("add");
    }
    // Limit is checked before each append, so a block may overshoot once.
    let infos = queue.block_infos(&ctx()).expect("infos");
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].byte_len, 12);
}

#[test]
fn get_never_returns_offset_or_older() {
    let (queue, _) = memory_queue(3);
    let ids = queue
        .add_list(
            &ctx(),
            (0..10u8).map(|i| NewMessage::new(vec![i])).collect(),
            Durability::NoSave,
        )
        .expect("add");
    for &from in &ids {
        let read = queue.get(&ctx(), from, 4).expect("get");
        assert!(read.iter().all(|m| m.id() > from));
        let expected: Vec<u64> = ids.iter().copied().filter(|&id| id > from).take(4).collect();
        assert_eq!(read.iter().map(|m| m.id()).collect::<Vec<_>>(), expected);
    }
    // An offset between two ids behaves like the lower one.
    let read = queue.get(&ctx(), ids[4] + 1, 1).expect("get between");
    assert_eq!(read[0].id(), ids[5]);
}

#[test]
fn add_unique_is_idempotent() {
    let (queue, _) = memory_queue(5);
    let message = || NewMessage::new(b"order".to_vec()).source("gateway").external_id(99);
    let first = queue.add_unique(&ctx(), message(), Durability::SaveMark).expect("first");
    let second = queue.add_unique(&ctx(), message(), Durability::SaveMark).expect("second");
    assert_eq!(first, second);

    let matching = queue
        .get(&ctx(), 0, 100)
        .expect("get")
        .into_iter()
        .filter(|m| m.message.source == "gateway" && m.message.external_id == 99)
        .count();
    assert_eq!(matching, 1);
}

#[test]
fn add_unique_is_idempotent_across_blocks() {
    let (queue, _) = memory_queue(1);
    let message = |ext: u64| NewMessage::new(b"order".to_vec()).source("feed").external_id(ext);
    let first = queue.add_unique(&ctx(), message(1), Durability::NoSave).expect("first");
    queue.add_unique(&ctx(), message(2), Durability::NoSave).expect("second");
    let again = queue.add_unique(&ctx(), message(1), Durability::NoSave).expect("again");
    assert_eq!(first, again);
    assert_eq!(queue.block_count(&ctx()).expect("count"), 2);

    let matching = queue
        .get(&ctx(), 0, 100)
        .expect("get")
        .into_iter()
        .filter(|m| m.message.external_id == 1)
        .count();
    assert_eq!(matching, 1);
}

#[test]
fn add_unique_requires_external_id() {
    let (queue, _) = memory_queue(5);
    let result = queue.add_unique_list(
        &ctx(),
        vec![
            NewMessage::new(b"a".to_vec()).external_id(1),
            NewMessage::new(b"b".to_vec()),
        ],
        Durability::NoSave,
    );
    assert!(matches!(result, Err(Error::ZeroExternalId)));
    assert!(queue.get(&ctx(), 0, 10).expect("get").is_empty());
}

#[test]
fn save_mark_defers_metadata_until_save_all() {
    let (queue, storage) = memory_queue(5);
    queue
        .add(&ctx(), NewMessage::new(b"x".to_vec()), Durability::SaveMark)
        .expect("add");
    assert!(!storage.names().contains(&METADATA_NAME.to_string()));
    queue.save_all(&ctx()).expect("save");
    assert!(storage.names().contains(&METADATA_NAME.to_string()));
}

#[test]
fn save_immediate_writes_metadata_before_returning() {
    let (queue, storage) = memory_queue(5);
    let id = queue
        .add(&ctx(), NewMessage::new(b"x".to_vec()), Durability::SaveImmediate)
        .expect("add");
    let names = storage.names();
    assert!(names.contains(&METADATA_NAME.to_string()));
    assert!(names.contains(&block_object_name(id)));
    assert!(queue.get(&ctx(), 0, 1).expect("get")[0].is_saved);
}

#[test]
fn unload_and_reload_preserves_records() {
    let (queue, _) = memory_queue(4);
    queue
        .add_list(
            &ctx(),
            (0..10u8)
                .map(|i| NewMessage::new(vec![i; 16]).source("s").external_id(u64::from(i) + 1))
                .collect(),
            Durability::SaveMark,
        )
        .expect("add");
    let before = queue.get(&ctx(), 0, 100).expect("before");

    // Nothing saved yet: every unload is refused.
    assert!(queue.unload_blocks(&ctx(), |_| true).expect("unload").is_empty());

    queue.save_all(&ctx()).expect("save");
    let unloaded = queue.unload_blocks(&ctx(), |_| true).expect("unload");
    assert_eq!(unloaded.len(), 3);
    assert!(queue.block_infos(&ctx()).expect("infos").iter().all(|i| i.evicted));

    let after = queue.get(&ctx(), 0, 100).expect("after");
    let strip = |v: &[blockq::MessageWithMeta]| v.iter().map(|m| (*m.message).clone()).collect::<Vec<_>>();
    assert_eq!(strip(&before), strip(&after));
    assert!(after.iter().all(|m| m.is_saved));
}

#[test]
fn ten_records_in_two_blocks() {
    let (queue, storage) = memory_queue(5);
    for external_id in 1..=10 {
        queue
            .add(
                &ctx(),
                NewMessage::new(format!("record {external_id}").into_bytes()).external_id(external_id),
                Durability::SaveMark,
            )
            .expect("add");
    }
    assert_eq!(queue.block_count(&ctx()).expect("count"), 2);

    queue.save_all(&ctx()).expect("save");
    let names = storage.names();
    assert_eq!(names.len(), 3);
    assert!(names.contains(&METADATA_NAME.to_string()));
    assert_eq!(names.iter().filter(|n| n.ends_with(".blk")).count(), 2);

    let mut offset = 0;
    let mut externals = Vec::new();
    loop {
        let read = queue.get(&ctx(), offset, 1).expect("get");
        let Some(record) = read.first() else {
            break;
        };
        externals.push(record.message.external_id);
        offset = record.id();
    }
    assert_eq!(externals, (1..=10).collect::<Vec<u64>>());
}
