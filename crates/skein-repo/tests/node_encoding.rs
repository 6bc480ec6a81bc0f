//! MST node and commit blocks checked against serde_ipld_dagcbor and the cid crate

use std::sync::Arc;

use ipld_core::ipld::Ipld;
use skein_common::{Cid, Did, Tid};
use skein_repo::mst::Mst;
use skein_repo::storage::MemoryBlockStore;
use skein_repo::{Commit, SigningKey};

async fn sample_tree() -> Mst<MemoryBlockStore> {
    let value: Cid = "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454"
        .parse()
        .unwrap();
    let mut mst = Mst::new(Arc::new(MemoryBlockStore::new()));
    for n in 0..60 {
        mst = mst
            .add(&format!("com.example.record/{:04}", n), value)
            .await
            .unwrap();
    }
    mst
}

#[tokio::test]
async fn node_blocks_are_canonical_dag_cbor() {
    let mst = sample_tree().await;
    let blocks = mst.node_blocks().await.unwrap();
    assert!(blocks.len() > 1);

    for (cid, bytes) in blocks {
        let ipld: Ipld = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
        let reencoded = serde_ipld_dagcbor::to_vec(&ipld).unwrap();
        assert_eq!(hex::encode(&reencoded), hex::encode(&bytes), "node {}", cid);

        let Ipld::Map(fields) = ipld else {
            panic!("node {} is not a map", cid);
        };
        assert!(matches!(fields.get("l"), Some(Ipld::Null | Ipld::Link(_))));
        let Some(Ipld::List(entries)) = fields.get("e") else {
            panic!("node {} has no entry list", cid);
        };
        for entry in entries {
            let Ipld::Map(entry) = entry else {
                panic!("entry is not a map");
            };
            assert!(matches!(entry.get("p"), Some(Ipld::Integer(_))));
            assert!(matches!(entry.get("k"), Some(Ipld::Bytes(_))));
            assert!(matches!(entry.get("v"), Some(Ipld::Link(_))));
            assert!(matches!(entry.get("t"), Some(Ipld::Null | Ipld::Link(_))));
        }

        let theirs: cid::Cid = cid.to_string().parse().unwrap();
        assert_eq!(theirs.to_bytes(), cid.as_bytes());
        assert_eq!(theirs.codec(), 0x71);
    }
}

#[test]
fn commit_block_is_canonical_dag_cbor() {
    let key = k256::ecdsa::SigningKey::from_slice(&[3u8; 32]).unwrap();
    let commit = Commit::new_unsigned(
        Did::new("did:plc:l3rouwludahu3ui3bt66mfvj").unwrap(),
        Cid::for_raw_bytes(b"root"),
        Tid::from_parts(1_700_000_000_000_000, 9),
        Some(Cid::for_dag_cbor_bytes(&[0xa0])),
    )
    .sign(&key)
    .unwrap();
    commit.verify(&key.public_key()).unwrap();

    let bytes = commit.to_cbor();
    let ipld: Ipld = serde_ipld_dagcbor::from_slice(&bytes).unwrap();
    assert_eq!(serde_ipld_dagcbor::to_vec(&ipld).unwrap(), bytes);

    let Ipld::Map(fields) = ipld else {
        panic!("commit is not a map");
    };
    let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
    assert_eq!(keys, ["data", "did", "prev", "rev", "sig", "version"]);
    assert_eq!(fields.get("version"), Some(&Ipld::Integer(3)));
}
