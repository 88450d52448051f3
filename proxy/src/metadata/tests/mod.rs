//! Scenarios every [MetadataStore] needs to pass.

use std::sync::Arc;

use layerlift_delta::{
    optimizer::PriorityTable,
    toc::{RawEntry, RawToc, Toc},
    trace::{TraceEntry, TraceGroup},
    Collection, Digest, ImageRef,
};
use rstest::*;
use rstest_reuse::{self, *};

use super::{from_addr, MetadataStore, RedbMetadataStore};
use crate::upstream::LayerDescriptor;

#[template]
#[rstest]
#[case::memory(from_addr("memory://").await.unwrap())]
#[case::redb(from_addr("redb://").await.unwrap())]
pub fn metadata_stores(#[case] store: Arc<dyn MetadataStore>) {}

fn image() -> ImageRef {
    "redis:6.2".parse().unwrap()
}

fn toc() -> Toc {
    Toc::from_raw(
        RawToc {
            version: 1,
            entries: vec![RawEntry {
                name: "bin/redis".into(),
                entry_type: "reg".into(),
                size: 4,
                offset: 10,
                digest: Digest::of(b"data").to_string(),
                ..Default::default()
            }],
        },
        40,
    )
    .unwrap()
}

#[apply(metadata_stores)]
#[tokio::test]
async fn manifest_roundtrip(store: Arc<dyn MetadataStore>) {
    assert_eq!(None, store.get_manifest(&image()).await.unwrap());

    let layers = vec![LayerDescriptor {
        digest: Digest::of(b"layer"),
        size: 5,
    }];
    store.put_manifest(&image(), &layers).await.unwrap();
    assert_eq!(Some(layers), store.get_manifest(&image()).await.unwrap());
}

#[apply(metadata_stores)]
#[tokio::test]
async fn toc_roundtrip(store: Arc<dyn MetadataStore>) {
    let layer = Digest::of(b"layer");
    assert_eq!(None, store.get_toc(&layer).await.unwrap());
    store.put_toc(&layer, &toc()).await.unwrap();
    assert_eq!(Some(toc()), store.get_toc(&layer).await.unwrap());
}

/// Serials are assigned once per layer, starting at 1.
#[apply(metadata_stores)]
#[tokio::test]
async fn serials_are_stable(store: Arc<dyn MetadataStore>) {
    let a = Digest::of(b"a");
    let b = Digest::of(b"b");
    assert_eq!(1, store.layer_serial(&a).await.unwrap());
    assert_eq!(2, store.layer_serial(&b).await.unwrap());
    assert_eq!(1, store.layer_serial(&a).await.unwrap());
}

#[apply(metadata_stores)]
#[tokio::test]
async fn collection_cache(store: Arc<dyn MetadataStore>) {
    let layer = layerlift_delta::Layer {
        digest: Digest::of(b"layer"),
        size: 100,
        serial: 1,
        repository: "redis".into(),
    };
    let collection = Collection::build(vec![image()], vec![(layer, toc())]).unwrap();

    assert!(store
        .get_collection(&collection.signature())
        .await
        .unwrap()
        .is_none());
    store.put_collection(&collection).await.unwrap();

    let cached = store
        .get_collection("redis:6.2")
        .await
        .unwrap()
        .expect("must be cached");
    assert_eq!(collection.len(), cached.len());
    assert!(cached.content(&Digest::of(b"data")).is_some());
}

/// Later reports refine, but never drop what is already known.
#[apply(metadata_stores)]
#[tokio::test]
async fn priorities_accumulate(store: Arc<dyn MetadataStore>) {
    let layer = layerlift_delta::Layer {
        digest: Digest::of(b"layer"),
        size: 100,
        serial: 1,
        repository: "redis".into(),
    };
    let collection = Collection::build(vec![image()], vec![(layer, toc())]).unwrap();
    let now = std::time::SystemTime::now().into();
    let group = TraceGroup {
        images: vec![image()],
        entries: vec![TraceEntry {
            path: "/bin/redis".into(),
            requested_at: now,
            ready_at: now,
        }],
    };

    assert!(store.get_priorities("redis:6.2").await.unwrap().is_empty());

    store
        .merge_priorities("redis:6.2", PriorityTable::from_trace(&collection, &group))
        .await
        .unwrap();
    store
        .merge_priorities("redis:6.2", PriorityTable::default())
        .await
        .unwrap();
    store
        .merge_priorities("redis:6.2", PriorityTable::from_trace(&collection, &group))
        .await
        .unwrap();

    let stored = store.get_priorities("redis:6.2").await.unwrap();
    let rank = stored.rank(&Digest::of(b"data")).expect("must be ranked");
    assert_eq!(0, rank.best);
    assert_eq!(2, rank.observations);
}

#[tokio::test]
async fn redb_persists_across_reopen() {
    let tmpdir = tempfile::TempDir::new().unwrap();
    let path = tmpdir.path().join("proxy.redb");

    {
        let store = RedbMetadataStore::new(path.clone()).await.unwrap();
        assert_eq!(1, store.layer_serial(&Digest::of(b"a")).await.unwrap());
        store.put_toc(&Digest::of(b"a"), &toc()).await.unwrap();
    }

    let store = RedbMetadataStore::new(path).await.unwrap();
    assert_eq!(1, store.layer_serial(&Digest::of(b"a")).await.unwrap());
    assert_eq!(2, store.layer_serial(&Digest::of(b"b")).await.unwrap());
    assert_eq!(Some(toc()), store.get_toc(&Digest::of(b"a")).await.unwrap());
}
