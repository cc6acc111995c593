// Property tests: routing purity, codec round-trips, and the
// all-or-nothing recovery guarantee under arbitrary crash offsets.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use warp_engine::codec::{decode_frame, encode_frame, Decoded, WalRecord};
use warp_engine::wal::{generation_file, recover_dir};
use warp_engine::Router;

mod common;

fn record_strategy() -> impl Strategy<Value = WalRecord> {
    let key = prop::collection::vec(any::<u8>(), 1..64);
    let value = prop::collection::vec(any::<u8>(), 0..128);
    prop_oneof![
        (key.clone(), value, any::<u64>()).prop_map(|(key, value, ts)| WalRecord::Put {
            key,
            value: Bytes::from(value),
            ts,
        }),
        (key, any::<u64>()).prop_map(|(key, ts)| WalRecord::Delete { key, ts }),
    ]
}

proptest! {
    #[test]
    fn shard_of_is_pure_and_in_range(
        key in prop::collection::vec(any::<u8>(), 1..256),
        shard_count in 1u16..64,
    ) {
        let a = Router::new(shard_count, 0, 0);
        let b = Router::new(shard_count, 0, 0);
        let shard = a.shard_of(&key);
        prop_assert!(shard < shard_count);
        prop_assert_eq!(shard, a.shard_of(&key));
        prop_assert_eq!(shard, b.shard_of(&key));
    }

    #[test]
    fn frames_round_trip(record in record_strategy(), seq in 1u64..u64::MAX) {
        let mut buf = BytesMut::new();
        encode_frame(&record, seq, &mut buf);
        match decode_frame(&buf) {
            Decoded::Frame { seq: got_seq, record: got, frame_len } => {
                prop_assert_eq!(got_seq, seq);
                prop_assert_eq!(got, record);
                prop_assert_eq!(frame_len, buf.len());
            }
            other => prop_assert!(false, "expected frame, got {:?}", other),
        }
    }

    #[test]
    fn recovery_is_all_or_nothing_at_any_crash_offset(
        records in prop::collection::vec(record_strategy(), 1..16),
        cut_fraction in 0.0f64..=1.0,
    ) {
        common::init_tracing();
        let mut bytes = Vec::new();
        let mut boundaries = vec![0usize];
        for (index, record) in records.iter().enumerate() {
            let mut buf = BytesMut::new();
            encode_frame(record, index as u64 + 1, &mut buf);
            bytes.extend_from_slice(&buf);
            boundaries.push(bytes.len());
        }

        // Crash at an arbitrary byte offset: keep a prefix of the file.
        let cut = (bytes.len() as f64 * cut_fraction) as usize;
        let surviving = boundaries.iter().filter(|&&b| b > 0 && b <= cut).count();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(generation_file(dir.path(), 1), &bytes[..cut]).unwrap();

        let recovered = recover_dir(dir.path()).unwrap();
        // Every fully flushed record survives; the torn one never does.
        prop_assert_eq!(recovered.entries.len(), surviving);
        prop_assert_eq!(recovered.last_seq, surviving as u64);
        for (index, (seq, record)) in recovered.entries.iter().enumerate() {
            prop_assert_eq!(*seq, index as u64 + 1);
            prop_assert_eq!(record, &records[index]);
        }
        // The torn tail is gone from the file as well.
        let truncated = std::fs::metadata(generation_file(dir.path(), 1)).unwrap().len();
        prop_assert_eq!(truncated, boundaries[surviving] as u64);
    }
}
