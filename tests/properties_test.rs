//! Property-based checks for the round-trip and ordering laws in spec §8:
//! pointer wire round-trip, WAL record round-trip, and the B+ tree
//! range-concatenation law (`range(a, b) ++ range(b+1, c) = range(a, c)`).

use std::sync::Arc;

use ferrokv::heap::handle_pool::FileHandlePool;
use ferrokv::wal::record::{LogRecord, RecordBody, UpdatePayload};
use ferrokv::{BTree, Pointer, PointerKind};
use proptest::prelude::*;
use tempfile::tempdir;

fn any_pointer() -> impl Strategy<Value = Pointer> {
    (0u8..3, any::<i64>(), any::<i32>()).prop_map(|(tag, position, chunk)| {
        let kind = match tag {
            0 => PointerKind::Empty,
            1 => PointerKind::Data,
            _ => PointerKind::Node,
        };
        Pointer {
            kind,
            position,
            chunk,
        }
    })
}

proptest! {
    #[test]
    fn pointer_round_trips_through_bytes(p in any_pointer()) {
        let bytes = p.to_bytes();
        prop_assert_eq!(bytes.len(), ferrokv::pointer::POINTER_WIRE_SIZE);
        let back = Pointer::from_bytes(&bytes).unwrap();
        prop_assert_eq!(p, back);
    }

    #[test]
    fn wal_update_record_round_trips_every_field(
        lsn in any::<i64>(),
        txn_id in any::<i64>(),
        prev_lsn in any::<i64>(),
        timestamp in any::<i64>(),
        collection_id in any::<i32>(),
        undo_next_lsn in any::<i64>(),
        before in prop::collection::vec(any::<u8>(), 0..64),
        after in prop::collection::vec(any::<u8>(), 0..64),
        ptr in any_pointer(),
    ) {
        let rec = LogRecord::new(
            lsn,
            txn_id,
            prev_lsn,
            timestamp,
            RecordBody::Update(UpdatePayload {
                collection_id,
                pointer: ptr,
                undo_next_lsn,
                before_image: before.clone(),
                after_image: after.clone(),
            }),
        );
        let bytes = rec.to_bytes();
        let back = LogRecord::from_body_bytes(&bytes[4..]).unwrap();
        prop_assert_eq!(back.lsn, lsn);
        prop_assert_eq!(back.txn_id, txn_id);
        prop_assert_eq!(back.prev_lsn, prev_lsn);
        prop_assert_eq!(back.timestamp, timestamp);
        match back.body {
            RecordBody::Update(u) => {
                prop_assert_eq!(u.collection_id, collection_id);
                prop_assert_eq!(u.pointer, ptr);
                prop_assert_eq!(u.undo_next_lsn, undo_next_lsn);
                prop_assert_eq!(u.before_image, before);
                prop_assert_eq!(u.after_image, after);
            }
            _ => prop_assert!(false, "wrong record variant after round trip"),
        }
    }
}

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]
    #[test]
    fn range_concatenation_law(
        keys in prop::collection::hash_set(0u64..500, 1..120),
        split in 0u64..500,
    ) {
        init_log();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempdir().unwrap();
            let handle_pool = Arc::new(FileHandlePool::new(8));
            let tree: BTree<u64, Pointer> =
                BTree::open(1, 16, dir.path(), handle_pool, true).await.unwrap();

            let mut sorted: Vec<u64> = keys.iter().copied().collect();
            sorted.sort_unstable();
            for &k in &sorted {
                tree.put(k, Pointer::data(k as i64, 0)).await.unwrap();
            }
            tree.flush().await.unwrap();

            let min = *sorted.first().unwrap();
            let max = *sorted.last().unwrap();
            let whole = tree.range(&min, &max).await.unwrap();
            let whole_keys: Vec<u64> = whole.iter().map(|(k, _)| *k).collect();
            prop_assert!(whole_keys.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(&whole_keys, &sorted);

            if split > min && split < max {
                let left = tree.range(&min, &split).await.unwrap();
                let right = tree.range(&(split + 1), &max).await.unwrap();
                let combined: Vec<u64> =
                    left.iter().chain(right.iter()).map(|(k, _)| *k).collect();
                prop_assert_eq!(combined, whole_keys);
            }
            Ok(())
        })?;
    }
}
