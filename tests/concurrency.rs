use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockq::core::meta::METADATA_NAME;
use blockq::core::{Context, Durability, Error, NewMessage, Queue, QueueConfig};
use blockq::storage::{MemoryStorage, Tiers};

fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(10))
}

#[test]
fn concurrent_writers_keep_global_order() {
    let config = QueueConfig::default().with_count_limit(16);
    let queue = Arc::new(Queue::new(config, Tiers::memory()).expect("queue"));
    let writers: Vec<_> = (0..8u8)
        .map(|writer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                (0..200u16)
                    .map(|seq| {
                        let mut payload = vec![writer];
                        payload.extend_from_slice(&seq.to_le_bytes());
                        queue
                            .add(&ctx(), NewMessage::new(payload), Durability::NoSave)
                            .expect("add")
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();
    let mut written: Vec<u64> = writers
        .into_iter()
        .flat_map(|handle| handle.join().expect("writer"))
        .collect();
    written.sort_unstable();

    let read = queue.get(&ctx(), 0, 10_000).expect("get");
    let ids: Vec<u64> = read.iter().map(|m| m.id()).collect();
    assert_eq!(ids, written);

    let infos = queue.block_infos(&ctx()).expect("infos");
    assert_eq!(infos.len(), 100);
    assert!(infos.iter().all(|info| info.length == 16));
    // Block ids are first-record ids and blocks never overlap.
    for pair in infos.windows(2) {
        assert!(pair[0].last_id < pair[1].id);
    }

    // Each writer's own records stay in its submission order.
    for writer in 0..8u8 {
        let seqs: Vec<u16> = read
            .iter()
            .filter(|m| m.message.payload[0] == writer)
            .map(|m| u16::from_le_bytes([m.message.payload[1], m.message.payload[2]]))
            .collect();
        assert_eq!(seqs, (0..200).collect::<Vec<u16>>());
    }
}

#[test]
fn save_wait_returns_once_a_save_covers_it() {
    let storage = Arc::new(MemoryStorage::new());
    let queue = Arc::new(Queue::new(QueueConfig::default(), Tiers::new("hot", storage.clone())).expect("queue"));
    let stop = Arc::new(AtomicBool::new(false));
    let saver = {
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                queue.save_all(&ctx()).expect("save");
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    let writers: Vec<_> = (0..4u8)
        .map(|writer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for _ in 0..10 {
                    let id = queue
                        .add(&ctx(), NewMessage::new(vec![writer]), Durability::SaveWait)
                        .expect("save-wait add");
                    assert!(queue.persisted_version() >= id);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }
    stop.store(true, Ordering::Release);
    saver.join().expect("saver");

    assert!(storage.names().contains(&METADATA_NAME.to_string()));
    assert!(queue.get(&ctx(), 0, 100).expect("get").iter().all(|m| m.is_saved));
}

#[test]
fn save_wait_without_saver_times_out() {
    let queue = Queue::new(QueueConfig::default(), Tiers::memory()).expect("queue");
    let short = Context::with_timeout(Duration::from_millis(50));
    let result = queue.add(&short, NewMessage::new(b"x".to_vec()), Durability::SaveWait);
    assert!(matches!(result, Err(Error::SaveTimeout)));
    // The record itself was appended; only the wait failed.
    assert_eq!(queue.get(&ctx(), 0, 10).expect("get").len(), 1);
}

#[test]
fn cancelled_context_stops_save_wait() {
    let queue = Arc::new(Queue::new(QueueConfig::default(), Tiers::memory()).expect("queue"));
    let call = Context::background();
    let waiter = {
        let queue = Arc::clone(&queue);
        let call = call.clone();
        thread::spawn(move || queue.add(&call, NewMessage::new(b"x".to_vec()), Durability::SaveWait))
    };
    thread::sleep(Duration::from_millis(30));
    call.cancel();
    let result = waiter.join().expect("waiter");
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[test]
fn concurrent_unique_appends_write_once() {
    let queue = Arc::new(Queue::new(QueueConfig::default().with_count_limit(4), Tiers::memory()).expect("queue"));
    // Stamped before any block exists, so every duplicate check scans back
    // through all blocks.
    let stamp = queue.now();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                (1..=20u64)
                    .map(|ext| {
                        queue
                            .add_unique(
                                &ctx(),
                                NewMessage::new(ext.to_le_bytes().to_vec())
                                    .source("feed")
                                    .external_id(ext)
                                    .external_timestamp(stamp),
                                Durability::NoSave,
                            )
                            .expect("add_unique")
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();
    let results: Vec<Vec<u64>> = workers.into_iter().map(|w| w.join().expect("worker")).collect();
    for other in &results[1..] {
        assert_eq!(other, &results[0]);
    }
    assert_eq!(queue.get(&ctx(), 0, 1000).expect("get").len(), 20);
}

fn spawn_unloader(queue: &Arc<Queue>, stop: &Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let queue = Arc::clone(queue);
    let stop = Arc::clone(stop);
    thread::spawn(move || {
        while !stop.load(Ordering::Acquire) {
            queue.unload_blocks(&ctx(), |info| !info.is_open).expect("unload");
        }
    })
}

#[test]
fn reads_see_every_record_while_blocks_unload() {
    let queue = Arc::new(Queue::new(QueueConfig::default().with_count_limit(10), Tiers::memory()).expect("queue"));
    let ids = queue
        .add_list(
            &ctx(),
            (0..30u8).map(|i| NewMessage::new(vec![i])).collect(),
            Durability::SaveImmediate,
        )
        .expect("add");
    let stop = Arc::new(AtomicBool::new(false));
    let unloader = spawn_unloader(&queue, &stop);

    for _ in 0..2_000 {
        let read = queue.get(&ctx(), 0, 100).expect("get");
        assert_eq!(read.iter().map(|m| m.id()).collect::<Vec<_>>(), ids);
    }
    stop.store(true, Ordering::Release);
    unloader.join().expect("unloader");
}

#[test]
fn unique_retries_find_records_while_blocks_unload() {
    let queue = Arc::new(Queue::new(QueueConfig::default().with_count_limit(10), Tiers::memory()).expect("queue"));
    let keyed = |ext: u64| NewMessage::new(ext.to_le_bytes().to_vec()).source("feed").external_id(ext);
    let ids = queue
        .add_unique_list(&ctx(), (1..=30).map(keyed).collect(), Durability::SaveImmediate)
        .expect("add");
    let stop = Arc::new(AtomicBool::new(false));
    let unloader = spawn_unloader(&queue, &stop);

    for _ in 0..100 {
        for ext in 1..=20u64 {
            let id = queue.add_unique(&ctx(), keyed(ext), Durability::NoSave).expect("retry");
            assert_eq!(id, ids[ext as usize - 1]);
        }
    }
    stop.store(true, Ordering::Release);
    unloader.join().expect("unloader");
    assert_eq!(queue.get(&ctx(), 0, 100).expect("get").len(), 30);
}
