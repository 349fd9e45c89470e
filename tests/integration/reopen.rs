#![allow(missing_docs)]

use strata::storage::{account_key, storage_key, SubTreeName};
use strata::types::TxId;
use strata::{Tree, TreeOptions};
use tempfile::TempDir;

fn options() -> TreeOptions {
    TreeOptions::new()
        .page_size(1024)
        .inline_value_max(32)
        .meta_versions(3)
}

#[test]
fn committed_data_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let sub = SubTreeName([0x42; 20]);
    let big = vec![7u8; 3_000];
    let (root, seq) = {
        let mut tree = Tree::open(dir.path(), options()).expect("open");
        for i in 0..500u32 {
            tree.put(&account_key(format!("acct-{i:04}").as_bytes()), &i.to_be_bytes())
                .expect("put");
        }
        tree.put(&storage_key(&sub, b"slot"), &big).expect("put");
        tree.commit().expect("commit");
        (tree.root(), tree.write_sequence())
    };

    let tree = Tree::open(dir.path(), options()).expect("reopen");
    assert_eq!(tree.root(), root);
    assert_eq!(tree.write_sequence(), seq);
    assert_eq!(tree.tx(), Some(TxId(1)));
    assert_eq!(
        tree.get(&account_key(b"acct-0123")).expect("get"),
        Some(123u32.to_be_bytes().to_vec())
    );
    assert_eq!(tree.get(&storage_key(&sub, b"slot")).expect("get"), Some(big));
    assert_eq!(tree.subtrees().expect("subtrees").len(), 1);
    let report = tree.verify().expect("verify");
    assert!(report.success, "verify findings: {:?}", report.findings);
}

#[test]
fn uncommitted_writes_are_lost_on_reopen() {
    let dir = TempDir::new().expect("tempdir");
    {
        let mut tree = Tree::open(dir.path(), options()).expect("open");
        tree.put(&account_key(b"kept"), b"1").expect("put");
        tree.commit().expect("commit");
        tree.put(&account_key(b"dropped"), b"2").expect("put");
    }
    let tree = Tree::open(dir.path(), options()).expect("reopen");
    assert_eq!(tree.get(&account_key(b"kept")).expect("get"), Some(b"1".to_vec()));
    assert_eq!(tree.get(&account_key(b"dropped")).expect("get"), None);
}

#[test]
fn newest_meta_wins_after_rotation() {
    let dir = TempDir::new().expect("tempdir");
    let key = account_key(b"counter");
    {
        let mut tree = Tree::open(dir.path(), options()).expect("open");
        for round in 1..=7u8 {
            tree.put(&key, &[round]).expect("put");
            tree.commit().expect("commit");
        }
    }
    let mut tree = Tree::open(dir.path(), options()).expect("reopen");
    assert_eq!(tree.tx(), Some(TxId(7)));
    assert_eq!(tree.get(&key).expect("get"), Some(vec![7]));

    tree.put(&key, &[8]).expect("put");
    assert_eq!(tree.commit().expect("commit"), TxId(8));
    assert_eq!(tree.meta().expect("meta").map(|m| m.tx), Some(TxId(8)));
    assert!(tree.verify().expect("verify").success);
}

#[test]
fn reopened_tree_keeps_appending_pages() {
    let dir = TempDir::new().expect("tempdir");
    {
        let mut tree = Tree::open(dir.path(), options()).expect("open");
        tree.put(&account_key(b"a"), b"1").expect("put");
        tree.commit().expect("commit");
    }
    let mut tree = Tree::open(dir.path(), options()).expect("reopen");
    let first_root = tree.root();
    tree.put(&account_key(b"b"), b"2").expect("put");
    tree.commit().expect("commit");
    assert!(tree.root().page.0 > first_root.page.0);
    assert_eq!(tree.scan().expect("scan").len(), 2);
}
