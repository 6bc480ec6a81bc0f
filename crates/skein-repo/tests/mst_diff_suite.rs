//! Generated diff scenarios
//!
//! Each case builds a tree, applies a pseudo-random batch of creates, updates
//! and deletes, and checks the diff between the two trees:
//! - replaying the diff's ops over the old tree reproduces the new root
//! - the changed blocks plus the old tree's blocks are enough to walk the new tree
//! - no block of a subtree shared by both trees shows up as changed

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use skein_common::Cid;
use skein_repo::mst::diff::{collect_changed_blocks, diff};
use skein_repo::mst::{Mst, MstBlock};
use skein_repo::storage::{BlockStore, MemoryBlockStore};

/// Small deterministic generator so cases are reproducible
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn key(n: usize) -> String {
    format!("app.bsky.feed.post/{:013}", n)
}

async fn record(storage: &MemoryBlockStore, n: u64) -> Cid {
    let mut bytes = vec![0x1b];
    bytes.extend_from_slice(&n.to_be_bytes());
    storage.put(&bytes).await.unwrap()
}

async fn tree_blocks(mst: &Mst<MemoryBlockStore>) -> BTreeMap<Cid, Bytes> {
    let mut out = BTreeMap::new();
    for block in mst.walk_blocks().await.unwrap() {
        let cid = match block {
            MstBlock::Node(cid) | MstBlock::Record(cid) => cid,
        };
        if let Some(bytes) = mst.storage().get(&cid).await.unwrap() {
            out.insert(cid, bytes);
        }
    }
    out
}

async fn run_case(seed: u64, size: usize, churn: usize) {
    let mut rng = Lcg(seed);
    let storage = Arc::new(MemoryBlockStore::new());

    let mut live = BTreeSet::new();
    let mut old = Mst::new(storage.clone());
    for _ in 0..size {
        let n = rng.below(size * 4);
        let cid = record(&storage, rng.next()).await;
        old = old.add(&key(n), cid).await.unwrap();
        live.insert(n);
    }

    let mut new = old.clone();
    for _ in 0..churn {
        let n = rng.below(size * 4);
        if live.contains(&n) && rng.below(2) == 0 {
            new = new.delete(&key(n)).await.unwrap();
            live.remove(&n);
        } else {
            let cid = record(&storage, rng.next()).await;
            new = new.add(&key(n), cid).await.unwrap();
            live.insert(n);
        }
    }

    let d = diff(&storage, Some(old.root()), new.root()).await.unwrap();
    assert_eq!(
        old.batch(&d.to_verified_ops()).await.unwrap().root(),
        new.root(),
        "seed {} replay",
        seed
    );
    assert_eq!(
        new.batch(&{
            let reverse = diff(&storage, Some(new.root()), old.root()).await.unwrap();
            reverse.to_verified_ops()
        })
        .await
        .unwrap()
        .root(),
        old.root(),
        "seed {} inverse replay",
        seed
    );

    let old_blocks = tree_blocks(&old).await;
    let changed = collect_changed_blocks(&storage, Some(old.root()), new.root())
        .await
        .unwrap();
    for cid in changed.keys() {
        let is_new_record = d.new_leaf_cids.contains(cid);
        assert!(
            is_new_record || !old_blocks.contains_key(cid),
            "seed {}: unchanged block {} reported as changed",
            seed,
            cid
        );
    }

    // a consumer holding only the old tree can walk the new one after the update
    let consumer = Arc::new(MemoryBlockStore::new_from_blocks(old_blocks));
    consumer.put_many(changed).await.unwrap();
    let replica = Mst::load(consumer, new.root());
    assert_eq!(
        replica.leaves().await.unwrap(),
        new.leaves().await.unwrap(),
        "seed {} replica",
        seed
    );
}

#[tokio::test]
async fn small_trees() {
    for seed in 0..40 {
        run_case(seed, 8, 4).await;
    }
}

#[tokio::test]
async fn medium_trees() {
    for seed in 100..120 {
        run_case(seed, 120, 30).await;
    }
}

#[tokio::test]
async fn heavy_churn() {
    for seed in 500..505 {
        run_case(seed, 200, 200).await;
    }
}

#[tokio::test]
async fn full_tree_against_nothing() {
    let storage = Arc::new(MemoryBlockStore::new());
    let mut mst = Mst::new(storage.clone());
    for n in 0..50 {
        let cid = record(&storage, n).await;
        mst = mst.add(&key(n as usize), cid).await.unwrap();
    }

    let changed = collect_changed_blocks(&storage, None, mst.root()).await.unwrap();
    assert_eq!(changed, tree_blocks(&mst).await);

    let d = diff(&storage, None, mst.root()).await.unwrap();
    assert_eq!(d.creates.len(), 50);
    assert!(d.deletes.is_empty() && d.updates.is_empty());
}
