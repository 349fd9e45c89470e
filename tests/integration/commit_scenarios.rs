#![allow(missing_docs)]

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use strata::primitives::compress::CompressionKind;
use strata::storage::{account_key, storage_key, SubTreeName, VerifyLevel};
use strata::types::TxId;
use strata::{Tree, TreeOptions};

fn options() -> TreeOptions {
    TreeOptions::new()
        .page_size(512)
        .no_sync(true)
        .inline_value_max(24)
        .verify(VerifyLevel::Full)
}

fn name(byte: u8) -> SubTreeName {
    SubTreeName([byte; 20])
}

fn assert_matches(tree: &Tree, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let scanned: BTreeMap<Vec<u8>, Vec<u8>> = tree.scan().expect("scan").into_iter().collect();
    assert_eq!(&scanned, model);
    let report = tree.verify().expect("verify");
    assert!(report.success, "verify findings: {:?}", report.findings);
}

#[test]
fn bulk_insert_then_partial_delete() {
    let mut tree = Tree::in_memory(options()).expect("tree");
    let mut model = BTreeMap::new();
    for i in 0..2_000u32 {
        let key = account_key(format!("user-{i:06}").as_bytes());
        let value = format!("balance-{i}").into_bytes();
        tree.put(&key, &value).expect("put");
        model.insert(key, value);
    }
    assert_eq!(tree.commit().expect("commit"), TxId(1));
    assert_matches(&tree, &model);
    assert!(tree.verify().expect("verify").counts.depth >= 2);

    for i in (0..2_000u32).step_by(3) {
        let key = account_key(format!("user-{i:06}").as_bytes());
        tree.delete(&key).expect("delete");
        model.remove(&key);
    }
    tree.commit().expect("commit");
    assert_matches(&tree, &model);
    assert_eq!(tree.write_sequence(), 2);
}

#[test]
fn subtrees_commit_together_with_main_tree() {
    let mut tree = Tree::in_memory(options()).expect("tree");
    let mut model = BTreeMap::new();
    for sub in 1..=6u8 {
        for i in 0..150u32 {
            let key = storage_key(&name(sub), format!("slot-{i:04}").as_bytes());
            let value = vec![sub; (i % 40) as usize + 1];
            tree.put(&key, &value).expect("put");
            model.insert(key, value);
        }
    }
    let key = account_key(b"owner");
    tree.put(&key, b"acct").expect("put");
    model.insert(key, b"acct".to_vec());
    tree.commit().expect("commit");

    let subtrees = tree.subtrees().expect("subtrees");
    let names: Vec<_> = subtrees.iter().map(|(n, _)| *n).collect();
    assert_eq!(names, (1..=6u8).map(name).collect::<Vec<_>>());
    assert!(subtrees.iter().all(|(_, d)| d.write_seq == 1));
    assert_matches(&tree, &model);
    assert_eq!(tree.verify().expect("verify").counts.subtrees, 6);
}

#[test]
fn emptied_subtree_loses_its_descriptor() {
    let mut tree = Tree::in_memory(options()).expect("tree");
    let keys: Vec<_> = (0..20u32)
        .map(|i| storage_key(&name(7), format!("k{i:02}").as_bytes()))
        .collect();
    for key in &keys {
        tree.put(key, b"v").expect("put");
    }
    tree.commit().expect("commit");
    assert_eq!(tree.subtrees().expect("subtrees").len(), 1);

    for key in &keys {
        tree.delete(key).expect("delete");
    }
    tree.commit().expect("commit");
    assert!(tree.subtrees().expect("subtrees").is_empty());
    assert!(tree.root().is_empty());
    assert!(tree.scan().expect("scan").is_empty());
}

#[test]
fn untouched_subtree_keeps_its_root() {
    let mut tree = Tree::in_memory(options()).expect("tree");
    tree.put(&storage_key(&name(1), b"a"), b"1").expect("put");
    tree.put(&storage_key(&name(2), b"b"), b"2").expect("put");
    tree.commit().expect("commit");
    let before = tree.subtrees().expect("subtrees");

    tree.put(&storage_key(&name(2), b"c"), b"3").expect("put");
    tree.commit().expect("commit");
    let after = tree.subtrees().expect("subtrees");
    assert_eq!(before[0], after[0]);
    assert_ne!(before[1].1.root, after[1].1.root);
    assert_eq!(after[1].1.write_seq, 2);
}

#[test]
fn large_values_are_stored_out_of_line() {
    let mut tree = Tree::in_memory(options()).expect("tree");
    let key = account_key(b"blob");
    let big = vec![0x5A; 4_000];
    tree.put(&key, &big).expect("put");
    tree.commit().expect("commit");
    assert_eq!(tree.get(&key).expect("get"), Some(big));
    let stats = tree.stats();
    assert_eq!(stats.vlog_updates, 1);
    assert_eq!(tree.verify().expect("verify").counts.indirect_values, 1);

    tree.put(&key, b"small").expect("put");
    tree.commit().expect("commit");
    assert_eq!(tree.get(&key).expect("get"), Some(b"small".to_vec()));
    assert_eq!(tree.stats().vlog_deletes, 1);
    assert_eq!(tree.verify().expect("verify").counts.indirect_values, 0);
}

#[test]
fn snappy_pages_match_uncompressed_contents() {
    let mut plain = Tree::in_memory(options()).expect("tree");
    let mut packed =
        Tree::in_memory(options().compression(CompressionKind::Snappy)).expect("tree");
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    for _ in 0..800 {
        let key = account_key(format!("k{:05}", rng.gen_range(0..5_000)).as_bytes());
        let value = vec![b'x'; rng.gen_range(1..20)];
        plain.put(&key, &value).expect("put");
        packed.put(&key, &value).expect("put");
    }
    plain.commit().expect("commit");
    packed.commit().expect("commit");
    assert_eq!(plain.scan().expect("scan"), packed.scan().expect("scan"));
    assert!(packed.verify().expect("verify").success);
}

#[test]
fn cursor_seeks_into_committed_keys() {
    let mut tree = Tree::in_memory(options()).expect("tree");
    for i in (0..400u32).step_by(2) {
        tree.put(&account_key(format!("{i:04}").as_bytes()), b"v")
            .expect("put");
    }
    tree.commit().expect("commit");

    let mut cursor = tree.cursor();
    assert!(cursor.seek(&account_key(b"0101")).expect("seek"));
    assert_eq!(cursor.key(), Some(&account_key(b"0102")[..]));
    assert!(cursor.next().expect("next"));
    assert_eq!(cursor.key(), Some(&account_key(b"0104")[..]));
    assert!(!cursor.seek(&account_key(b"9999")).expect("seek"));
}

#[test]
fn randomized_history_matches_model() {
    let mut tree = Tree::in_memory(options().workers(2, 2, 2)).expect("tree");
    let mut model = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
    for _ in 0..12 {
        for _ in 0..300 {
            let key = if rng.gen_bool(0.5) {
                account_key(format!("a{:04}", rng.gen_range(0..600)).as_bytes())
            } else {
                let sub = name(rng.gen_range(1..4));
                storage_key(&sub, format!("s{:04}", rng.gen_range(0..400)).as_bytes())
            };
            if rng.gen_bool(0.3) {
                tree.delete(&key).expect("delete");
                model.remove(&key);
            } else {
                let value = vec![rng.gen(); rng.gen_range(1..60)];
                tree.put(&key, &value).expect("put");
                model.insert(key, value);
            }
        }
        tree.commit().expect("commit");
        assert_matches(&tree, &model);
    }
    assert_eq!(tree.stats().commits, 12);
    assert_eq!(tree.stats().aborted_commits, 0);
}
