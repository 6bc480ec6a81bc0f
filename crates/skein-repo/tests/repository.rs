//! End-to-end repository scenarios: writes, commits, firehose events, export

use std::sync::Arc;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use skein_common::cbor::DagCborValue;
use skein_common::{Cid, Did};
use skein_repo::car::{CarLimits, parse_car_bytes, write_car_bytes};
use skein_repo::commit::firehose::{Frame, decode_frame};
use skein_repo::mst::Mst;
use skein_repo::storage::{BlockStore, FileBlockStore, MemoryBlockStore};
use skein_repo::{
    Commit, FnSigner, RecordWrite, RepoConfig, RepoErrorKind, Repository, SigningKey,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

fn did() -> Did {
    Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").unwrap()
}

fn signing_key() -> p256::ecdsa::SigningKey {
    p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap()
}

fn post(text: &str) -> DagCborValue {
    DagCborValue::map([
        ("$type", "app.bsky.feed.post".into()),
        ("text", text.into()),
        ("createdAt", "2024-05-01T12:00:00.000Z".into()),
    ])
}

async fn new_repo() -> Repository<MemoryBlockStore> {
    Repository::create(
        Arc::new(MemoryBlockStore::new()),
        did(),
        &signing_key(),
        RepoConfig::new().clock_id(1).build(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn put_update_and_sign_scenario() {
    let storage = Arc::new(MemoryBlockStore::new());
    let cid_a = Cid::for_raw_bytes(b"a");
    let cid_b = Cid::for_raw_bytes(b"b");
    let cid_c = Cid::for_raw_bytes(b"c");

    let build = || {
        let storage = storage.clone();
        async move {
            Mst::new(storage)
                .add("app.bsky.feed.post/3k1", cid_a)
                .await
                .unwrap()
                .add("app.bsky.actor.profile/self", cid_b)
                .await
                .unwrap()
        }
    };

    let mst = build().await;
    let keys: Vec<_> = mst.leaves().await.unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, ["app.bsky.actor.profile/self", "app.bsky.feed.post/3k1"]);

    let before = mst.root();
    let updated = mst.add("app.bsky.feed.post/3k1", cid_c).await.unwrap();
    assert_ne!(updated.root(), before);
    let again = build()
        .await
        .add("app.bsky.feed.post/3k1", cid_c)
        .await
        .unwrap();
    assert_eq!(again.root(), updated.root());

    let rev = skein_common::Tid::from_parts(1_700_000_000_000_000, 0);
    let sign = || {
        Commit::new_unsigned(did(), updated.root(), rev.clone(), None)
            .sign(&signing_key())
            .unwrap()
    };
    assert_eq!(sign().cid(), sign().cid());
}

#[tokio::test]
async fn signer_failure_leaves_repository_untouched() {
    let repo = new_repo().await;
    repo.apply_writes(&[RecordWrite::create("app.bsky.feed.post", "3k1", post("one"))], &signing_key())
        .await
        .unwrap();

    let head = repo.head_cid().await;
    let snapshot = repo.storage().snapshot();

    let broken = FnSigner::new(signing_key().public_key(), |_: &[u8]| {
        Err::<Vec<u8>, _>(std::io::Error::other("signer unavailable"))
    });
    let err = repo
        .apply_writes(
            &[
                RecordWrite::create("app.bsky.feed.post", "3k2", post("two")),
                RecordWrite::delete("app.bsky.feed.post", "3k1"),
            ],
            &broken,
        )
        .await
        .unwrap_err();

    assert_eq!(*err.kind(), RepoErrorKind::Crypto);
    assert_eq!(repo.head_cid().await, head);
    assert_eq!(repo.storage().snapshot(), snapshot);
    assert!(repo.get_record("app.bsky.feed.post", "3k1").await.unwrap().is_some());
    assert!(repo.get_record("app.bsky.feed.post", "3k2").await.unwrap().is_none());
}

#[tokio::test]
async fn firehose_event_validates_against_previous_state() {
    let producer = new_repo().await;
    producer
        .apply_writes(
            &[
                RecordWrite::create("app.bsky.feed.post", "3k1", post("one")),
                RecordWrite::create("app.bsky.feed.post", "3k2", post("two")),
            ],
            &signing_key(),
        )
        .await
        .unwrap();

    // the consumer mirrors the producer up to here
    let consumer = Arc::new(MemoryBlockStore::new_from_blocks(producer.storage().snapshot()));
    let prev_root = producer.head_commit().await.data;

    let commit = producer
        .apply_writes(
            &[
                RecordWrite::update("app.bsky.feed.post", "3k1", post("one, edited")),
                RecordWrite::delete("app.bsky.feed.post", "3k2"),
                RecordWrite::create("app.bsky.feed.like", "3k3", post("like")),
            ],
            &signing_key(),
        )
        .await
        .unwrap();
    let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let event = commit.to_firehose_commit(7, time, vec![], producer.config());

    let frame = event.to_frame();
    let Frame::Commit(decoded) = decode_frame(&frame).unwrap() else {
        panic!("expected a commit frame");
    };
    assert_eq!(*decoded, event);

    let pubkey = signing_key().public_key();
    let limits = &producer.config().car;
    let data = decoded
        .validate(Some(prev_root), consumer.clone(), &pubkey, limits)
        .await
        .unwrap();
    assert_eq!(data, commit.data);
    // validation stages blocks and never writes to the consumer's store
    assert!(!consumer.has(&commit.cid).await.unwrap());

    // the same event without the consumer's tree falls back to prevData
    let data = decoded
        .validate(None, consumer.clone(), &pubkey, limits)
        .await
        .unwrap();
    assert_eq!(data, commit.data);

    // a consumer with tighter framing limits refuses the same event
    let tight = CarLimits::new().max_block_size(16).build();
    let err = decoded
        .validate(Some(prev_root), consumer.clone(), &pubkey, &tight)
        .await
        .unwrap_err();
    assert_eq!(*err.kind(), RepoErrorKind::TooLarge);

    // wrong key
    let other = p256::ecdsa::SigningKey::from_slice(&[8u8; 32]).unwrap();
    let err = decoded
        .validate(Some(prev_root), consumer.clone(), &other.public_key(), limits)
        .await
        .unwrap_err();
    assert_eq!(*err.kind(), RepoErrorKind::Crypto);

    // ops that do not describe the change
    let mut tampered = (*decoded).clone();
    tampered.ops.retain(|op| op.path != "app.bsky.feed.post/3k2");
    let err = tampered
        .validate(Some(prev_root), consumer.clone(), &pubkey, limits)
        .await
        .unwrap_err();
    assert_eq!(*err.kind(), RepoErrorKind::InvalidCommit);

    // event claims another repo
    let mut tampered = (*decoded).clone();
    tampered.repo = Did::new("did:plc:someoneelse").unwrap();
    assert!(
        tampered
            .validate(Some(prev_root), consumer.clone(), &pubkey, limits)
            .await
            .is_err()
    );

    // record block missing from the CAR
    let mut tampered = (*decoded).clone();
    let parsed = parse_car_bytes(&tampered.blocks, &Default::default()).unwrap();
    let created = commit.ops.iter().find_map(|op| op.cid).unwrap();
    let blocks = parsed.blocks.into_iter().filter(|(cid, _)| *cid != created);
    tampered.blocks = Bytes::from(write_car_bytes(&[commit.cid], blocks));
    let err = tampered
        .validate(Some(prev_root), consumer, &pubkey, limits)
        .await
        .unwrap_err();
    assert_eq!(*err.kind(), RepoErrorKind::NotFound);
}

#[tokio::test]
async fn concurrent_readers_and_export_snapshot() {
    let repo = Arc::new(new_repo().await);
    repo.apply_writes(&[RecordWrite::create("app.bsky.feed.post", "a", post("a"))], &signing_key())
        .await
        .unwrap();
    let head = repo.head_cid().await;

    let export = {
        let repo = repo.clone();
        tokio::spawn(async move { repo.export_car(Vec::new(), CancellationToken::new()).await })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let repo = repo.clone();
            tokio::spawn(async move { repo.list_records("app.bsky.feed.post").await })
        })
        .collect();

    let car = export.await.unwrap().unwrap();
    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap().len(), 1);
    }
    assert_eq!(parse_car_bytes(&car, &Default::default()).unwrap().root, head);
}

#[tokio::test]
async fn export_keeps_its_snapshot_across_a_commit_mid_stream() {
    let repo = Arc::new(new_repo().await);
    let creates: Vec<_> = (0..20)
        .map(|i| {
            RecordWrite::create(
                "app.bsky.feed.post",
                &format!("post{i:02}"),
                post(&format!("post number {i}")),
            )
        })
        .collect();
    repo.apply_writes(&creates, &signing_key()).await.unwrap();
    let head = repo.head_cid().await;
    let expected = repo
        .export_car(Vec::new(), CancellationToken::new())
        .await
        .unwrap();

    // a small pipe stalls the export after its first few blocks
    let (client, mut server) = tokio::io::duplex(64);
    let export = {
        let repo = repo.clone();
        tokio::spawn(async move {
            repo.export_car(client, CancellationToken::new())
                .await
                .map(drop)
        })
    };
    let mut streamed = vec![0u8; 64];
    server.read_exact(&mut streamed).await.unwrap();

    let deletes: Vec<_> = (0..20)
        .map(|i| RecordWrite::delete("app.bsky.feed.post", &format!("post{i:02}")))
        .collect();
    let commit = repo.apply_writes(&deletes, &signing_key()).await.unwrap();
    assert!(!commit.deleted_cids.is_empty());
    assert!(repo.list_records("app.bsky.feed.post").await.unwrap().is_empty());

    server.read_to_end(&mut streamed).await.unwrap();
    export.await.unwrap().unwrap();

    assert_eq!(streamed, expected);
    assert_eq!(parse_car_bytes(&streamed, &Default::default()).unwrap().root, head);
}

#[tokio::test]
async fn file_backed_repository_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo.car");

    let storage = Arc::new(FileBlockStore::new(&path));
    let repo = Repository::create(storage.clone(), did(), &signing_key(), RepoConfig::default())
        .await
        .unwrap();
    repo.apply_writes(&[RecordWrite::create("app.bsky.feed.post", "3k1", post("one"))], &signing_key())
        .await
        .unwrap();
    storage.flush().await.unwrap();

    let reloaded = Arc::new(FileBlockStore::load(&path).await.unwrap());
    let head = reloaded.roots()[0];
    assert_eq!(head, repo.head_cid().await);

    let reopened = Repository::load(reloaded, head, RepoConfig::default())
        .await
        .unwrap();
    reopened.verify_head(&signing_key().public_key()).await.unwrap();
    let value = reopened
        .get_record_value("app.bsky.feed.post", "3k1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, post("one"));

    let export = dir.path().join("export.car");
    reopened.export_car_file(&export).await.unwrap();
    let imported = Repository::import_car(
        Arc::new(MemoryBlockStore::new()),
        &tokio::fs::read(&export).await.unwrap(),
        RepoConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(imported.head_cid().await, head);
}
