#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use strata::storage::btree::{owner_index, split_ranges, Inode};
use strata::storage::{account_key, WriteBatch};
use strata::types::PageId;
use strata::{Tree, TreeOptions};

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(b'a'..=b'f', 1..6)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (arb_key(), prop::collection::vec(any::<u8>(), 0..48))
            .prop_map(|(k, v)| Op::Put(k, v)),
        1 => arb_key().prop_map(Op::Delete),
    ]
}

fn children(keys: &BTreeSet<Vec<u8>>) -> Vec<Inode> {
    keys.iter()
        .enumerate()
        .map(|(i, k)| Inode::child(k.clone(), PageId(i as u64 + 1), 0, [0; 20]))
        .collect()
}

proptest! {
    #[test]
    fn prop_batch_dump_is_sorted_last_write_wins(ops in prop::collection::vec(arb_op(), 1..200)) {
        let mut batch = WriteBatch::with_seed(7);
        let mut model: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Put(k, v) => {
                    batch.put(&k, &v).unwrap();
                    model.insert(k, Some(v));
                }
                Op::Delete(k) => {
                    batch.delete(&k).unwrap();
                    model.insert(k, None);
                }
            }
        }
        let dump = batch.dump();
        prop_assert_eq!(dump.len(), batch.size());
        let got: Vec<_> = dump.into_iter().map(|e| (e.key, e.value)).collect();
        let want: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(got, want);
    }

    #[test]
    fn prop_split_ranges_cover_batch(
        child_keys in prop::collection::btree_set(arb_key(), 1..12),
        batch_keys in prop::collection::btree_set(arb_key(), 1..80),
    ) {
        let children = children(&child_keys);
        let mut batch = WriteBatch::new();
        for key in &batch_keys {
            batch.put(key, b"v").unwrap();
        }
        let kvs = batch.dump();
        let ranges = split_ranges(&children, &kvs, 0..kvs.len());

        let mut next = 0;
        let mut last_child = None;
        for share in &ranges {
            prop_assert_eq!(share.range.start, next);
            prop_assert!(!share.range.is_empty());
            prop_assert!(last_child.map_or(true, |c| share.child > c));
            for kv in &kvs[share.range.clone()] {
                prop_assert_eq!(owner_index(&children, &kv.key), share.child);
            }
            next = share.range.end;
            last_child = Some(share.child);
        }
        prop_assert_eq!(next, kvs.len());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_commits_match_model(
        rounds in prop::collection::vec(prop::collection::vec(arb_op(), 1..60), 1..5),
    ) {
        let options = TreeOptions::new().page_size(512).no_sync(true).inline_value_max(16);
        let mut tree = Tree::in_memory(options).unwrap();
        let mut model = BTreeMap::new();
        for ops in rounds {
            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        let key = account_key(&k);
                        tree.put(&key, &v).unwrap();
                        model.insert(key, v);
                    }
                    Op::Delete(k) => {
                        let key = account_key(&k);
                        tree.delete(&key).unwrap();
                        model.remove(&key);
                    }
                }
            }
            tree.commit().unwrap();
            let scanned: BTreeMap<_, _> = tree.scan().unwrap().into_iter().collect();
            prop_assert_eq!(&scanned, &model);
        }
        prop_assert!(tree.verify().unwrap().success);
    }

    #[test]
    fn prop_repeated_delete_is_idempotent(keys in prop::collection::btree_set(arb_key(), 1..40)) {
        let options = TreeOptions::new().page_size(512).no_sync(true);
        let mut tree = Tree::in_memory(options).unwrap();
        for k in &keys {
            tree.put(&account_key(k), b"value").unwrap();
        }
        tree.commit().unwrap();
        let victims: Vec<_> = keys.iter().step_by(2).collect();
        for k in &victims {
            tree.delete(&account_key(k)).unwrap();
        }
        tree.commit().unwrap();
        let once = tree.scan().unwrap();
        for k in &victims {
            tree.delete(&account_key(k)).unwrap();
        }
        tree.commit().unwrap();
        prop_assert_eq!(tree.scan().unwrap(), once.clone());
        prop_assert_eq!(once.len(), keys.len() - victims.len());
        prop_assert!(tree.verify().unwrap().success);
    }
}
