use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use crate::{
    fixtures::{
        layer_for, LayerBlobBuilder, BINARY_CONTENTS, BINARY_DIGEST, CONFIG_CONTENTS,
        CONFIG_DIGEST, LIBRARY_CONTENTS, LIBRARY_DIGEST, README_CONTENTS,
    },
    optimizer::PriorityTable,
    toc::{EntryKind, RawEntry, RawToc, Toc},
    trace::{TraceEntry, TraceGroup},
    Collection, DeltaBundle, Error, HeldContent, ImageRef, Resolution,
};

async fn collection(images: &str, layers: Vec<LayerBlobBuilder>, first_serial: u64) -> Collection {
    let images = ImageRef::parse_list(images).expect("valid image list");
    let mut parsed = vec![];
    for (i, builder) in layers.into_iter().enumerate() {
        let blob = builder.build().await.expect("fixture must build");
        let toc = Toc::from_blob(&blob).await.expect("fixture TOC must parse");
        parsed.push((layer_for(&blob, first_serial + i as u64, "app"), toc));
    }
    Collection::build(images, parsed).expect("collection must build")
}

fn base_layer() -> LayerBlobBuilder {
    LayerBlobBuilder::new()
        .dir("usr")
        .dir("usr/bin")
        .executable("usr/bin/x", BINARY_CONTENTS.clone())
        .dir("usr/lib")
        .file("usr/lib/libx.so", LIBRARY_CONTENTS.clone())
        .symlink("usr/lib/libx.so.1", "libx.so")
        .file("usr/share/empty", "")
}

fn app_layer() -> LayerBlobBuilder {
    LayerBlobBuilder::new()
        .dir("etc")
        .file("etc/app.conf", CONFIG_CONTENTS.clone())
        .file("README", README_CONTENTS.clone())
}

fn resolution(bundle: &DeltaBundle, path: &str) -> Option<Resolution> {
    bundle
        .requested_files
        .iter()
        .find(|f| f.entry.path == path)
        .map(|f| f.resolution)
}

#[tokio::test]
async fn build_merges_layers() {
    let c = collection("app:1", vec![base_layer(), app_layer()], 1).await;

    let paths: Vec<&str> = c.entries().map(|(p, _)| p).collect();
    assert_eq!(
        vec![
            "/",
            "/README",
            "/etc",
            "/etc/app.conf",
            "/usr",
            "/usr/bin",
            "/usr/bin/x",
            "/usr/lib",
            "/usr/lib/libx.so",
            "/usr/lib/libx.so.1",
            "/usr/share",
            "/usr/share/empty",
        ],
        paths
    );

    // implicitly created parent
    assert_eq!(EntryKind::Dir, c.get("/usr/share").unwrap().entry.kind);
    assert_eq!(0o755, c.get("/usr/bin/x").unwrap().entry.mode);

    // the empty file has no content to transfer
    assert_eq!(4, c.contents().len());
    assert_eq!(*BINARY_DIGEST, c.contents()[0].digest);
    assert_eq!(1, c.content(&CONFIG_DIGEST).unwrap().stack);
}

#[tokio::test]
async fn diff_against_self_is_empty() {
    let c = collection("app:1", vec![base_layer(), app_layer()], 1).await;
    let bundle = c.diff(&c).expect("diff must succeed");

    assert!(bundle.output_queue.is_empty());
    assert_eq!(0, bundle.body_length);
    assert!(bundle.required_layers.iter().all(|r| !r));
    for f in &bundle.requested_files {
        assert!(
            matches!(
                f.resolution,
                Resolution::Local { .. } | Resolution::Sibling { .. }
            ),
            "{} resolved to {:?}",
            f.entry.path,
            f.resolution
        );
    }
}

#[tokio::test]
async fn diff_against_empty_requests_everything_once() {
    let c = collection("app:1", vec![base_layer(), app_layer()], 1).await;
    let bundle = c.diff(&Collection::empty()).expect("diff must succeed");

    // every path exactly once
    let paths: Vec<&str> = bundle
        .requested_files
        .iter()
        .map(|f| f.entry.path.as_str())
        .collect();
    let unique: HashSet<&str> = paths.iter().copied().collect();
    assert_eq!(c.len(), paths.len());
    assert_eq!(paths.len(), unique.len());

    // no range twice
    let ranges: HashSet<(u32, u64)> = bundle
        .output_queue
        .iter()
        .map(|r| (r.stack, r.source_offset))
        .collect();
    assert_eq!(bundle.output_queue.len(), ranges.len());
    assert_eq!(4, bundle.output_queue.len());

    // every queued content is needed by some path
    for (order, _) in bundle.output_queue.iter().enumerate() {
        assert!(bundle
            .requested_files
            .iter()
            .any(|f| f.resolution == Resolution::Payload { order: order as u32 }));
    }

    assert_eq!(vec![true, true], bundle.required_layers);
    assert_eq!(
        bundle.output_queue.iter().map(|r| r.compressed_size).sum::<u64>(),
        bundle.body_length
    );
    let mut expected_offset = 0;
    for r in &bundle.output_queue {
        assert_eq!(expected_offset, r.payload_offset);
        expected_offset += r.compressed_size;
    }

    assert_eq!(
        Some(Resolution::Sibling { stack: 0 }),
        resolution(&bundle, "/usr/share/empty")
    );
    assert_eq!(
        Some(Resolution::Sibling { stack: 0 }),
        resolution(&bundle, "/usr/lib/libx.so.1")
    );
}

#[tokio::test]
async fn diff_reconstructs_destination_namespace() {
    let base = collection("app:1", vec![base_layer()], 1).await;
    let c = collection("app:2", vec![base_layer(), app_layer()], 1).await;
    let bundle = c.diff(&base).expect("diff must succeed");

    assert_eq!(c.len(), bundle.requested_files.len());
    for f in &bundle.requested_files {
        let visible = c.get(&f.entry.path).expect("path must exist in destination");
        let mut expected = visible.entry.clone();
        expected.chunks.clear();
        assert_eq!(expected, f.entry);

        // every content-bearing file can be materialized
        if f.entry.has_content() {
            let digest = f.entry.digest.unwrap();
            match f.resolution {
                Resolution::Local { serial } => {
                    let held = base.content(&digest).expect("local content must exist");
                    assert_eq!(base.layers()[held.stack as usize].serial, serial);
                }
                Resolution::Payload { order } => {
                    assert_eq!(digest, bundle.output_queue[order as usize].digest)
                }
                Resolution::Sibling { stack } => assert!(bundle
                    .output_queue
                    .iter()
                    .any(|r| r.digest == digest && r.stack == stack)),
            }
        }
    }

    // only the application layer's content travels
    let queued: HashSet<_> = bundle.output_queue.iter().map(|r| r.digest).collect();
    assert_eq!(2, queued.len());
    assert!(queued.contains(&CONFIG_DIGEST));
    assert_eq!(vec![false, true], bundle.required_layers);
}

#[tokio::test]
async fn whiteout_removes_lower_path() {
    let c = collection(
        "app:1",
        vec![
            base_layer().dir("opt").dir("opt/app").file("opt/app/run", "run"),
            app_layer(),
            LayerBlobBuilder::new()
                .whiteout("usr/lib/libx.so")
                .whiteout("opt"),
        ],
        1,
    )
    .await;

    let bundle = c.diff(&Collection::empty()).expect("diff must succeed");
    for gone in ["/usr/lib/libx.so", "/opt", "/opt/app", "/opt/app/run"] {
        assert_eq!(None, resolution(&bundle, gone), "{} must be gone", gone);
    }
    // the dangling symlink stays, whiteouts are never listed
    assert!(resolution(&bundle, "/usr/lib/libx.so.1").is_some());
    assert!(!bundle
        .requested_files
        .iter()
        .any(|f| f.entry.path.contains(".wh.")));
    assert!(c.content(&LIBRARY_DIGEST).is_none());
}

#[tokio::test]
async fn opaque_directory_hides_lower_children() {
    let c = collection(
        "app:1",
        vec![
            base_layer(),
            LayerBlobBuilder::new()
                .opaque("usr/lib")
                .file("usr/lib/libnew.so", "new"),
        ],
        1,
    )
    .await;

    assert!(c.get("/usr/lib").is_some());
    assert!(c.get("/usr/lib/libnew.so").is_some());
    assert!(c.get("/usr/lib/libx.so").is_none());
    assert!(c.get("/usr/lib/libx.so.1").is_none());
    assert!(c.get("/usr/bin/x").is_some());
}

#[tokio::test]
async fn upper_file_replaces_lower_directory() {
    let c = collection(
        "app:1",
        vec![base_layer(), LayerBlobBuilder::new().file("usr/lib", "not a dir")],
        1,
    )
    .await;

    assert_eq!(EntryKind::Reg, c.get("/usr/lib").unwrap().entry.kind);
    assert!(c.get("/usr/lib/libx.so").is_none());
}

#[tokio::test]
async fn local_content_resolves_to_serial() {
    // The client already holds the binary, in the layer with serial 7.
    let base = collection(
        "tools:1",
        vec![LayerBlobBuilder::new()
            .dir("opt")
            .executable("opt/x", BINARY_CONTENTS.clone())],
        7,
    )
    .await;
    let c = collection(
        "app:1",
        vec![LayerBlobBuilder::new()
            .dir("usr")
            .dir("usr/bin")
            .executable("usr/bin/x", BINARY_CONTENTS.clone())
            .file("usr/bin/y", "y")],
        20,
    )
    .await;

    let bundle = c.diff(&base).expect("diff must succeed");
    assert_eq!(
        Some(Resolution::Local { serial: 7 }),
        resolution(&bundle, "/usr/bin/x")
    );
    assert!(bundle
        .output_queue
        .iter()
        .all(|r| r.digest != *BINARY_DIGEST));
    assert_eq!(1, bundle.output_queue.len());
    assert_eq!(
        vec![HeldContent {
            digest: *BINARY_DIGEST,
            serial: 7,
            stack: 0,
        }],
        bundle.held
    );
    assert_eq!(
        bundle.output_queue[0].compressed_size,
        bundle.body_length
    );
}

#[tokio::test]
async fn duplicate_content_is_sent_once() {
    let c = collection(
        "app:1",
        vec![
            LayerBlobBuilder::new().file("a", CONFIG_CONTENTS.clone()),
            LayerBlobBuilder::new().file("b", CONFIG_CONTENTS.clone()),
        ],
        1,
    )
    .await;
    let bundle = c.diff(&Collection::empty()).expect("diff must succeed");

    assert_eq!(1, bundle.output_queue.len());
    assert_eq!(0, bundle.output_queue[0].stack);
    assert_eq!(
        Some(Resolution::Payload { order: 0 }),
        resolution(&bundle, "/a")
    );
    assert_eq!(
        Some(Resolution::Sibling { stack: 0 }),
        resolution(&bundle, "/b")
    );
    assert_eq!(vec![true, false], bundle.required_layers);
}

#[tokio::test]
async fn hardlinks_share_their_target() {
    let c = collection(
        "app:1",
        vec![LayerBlobBuilder::new()
            .dir("bin")
            .executable("bin/busybox", BINARY_CONTENTS.clone())
            .hardlink("bin/sh", "bin/busybox")],
        1,
    )
    .await;
    let sh = c.get("/bin/sh").unwrap();
    assert_eq!(EntryKind::Reg, sh.entry.kind);
    assert_eq!(Some(*BINARY_DIGEST), sh.entry.digest);

    let bundle = c.diff(&Collection::empty()).unwrap();
    assert_eq!(1, bundle.output_queue.len());
    assert_eq!(
        resolution(&bundle, "/bin/busybox"),
        resolution(&bundle, "/bin/sh")
    );
}

#[tokio::test]
async fn dangling_hardlink_is_metadata_error() {
    let blob = LayerBlobBuilder::new()
        .hardlink("bin/sh", "bin/busybox")
        .build()
        .await
        .unwrap();
    let toc = Toc::from_blob(&blob).await.unwrap();
    let err = Collection::build(
        ImageRef::parse_list("app:1").unwrap(),
        vec![(layer_for(&blob, 1, "app"), toc)],
    )
    .expect_err("must fail");

    assert!(matches!(err, Error::Metadata { ref path, .. } if path == "/bin/sh"));
}

#[test]
fn file_without_digest_is_metadata_error() {
    let toc = Toc::from_raw(
        RawToc {
            version: 1,
            entries: vec![RawEntry {
                name: "bin/x".into(),
                entry_type: "reg".into(),
                size: 10,
                offset: 100,
                ..Default::default()
            }],
        },
        200,
    )
    .unwrap();

    let layer = crate::Layer {
        digest: crate::Digest::of(b"layer"),
        size: 300,
        serial: 1,
        repository: "app".into(),
    };
    let err = Collection::build(ImageRef::parse_list("app:1").unwrap(), vec![(layer, toc)])
        .expect_err("must fail");
    assert!(matches!(err, Error::Metadata { ref path, .. } if path == "/bin/x"));
    assert!(err.to_string().contains("corrupt or incomplete image metadata"));
}

fn layers_for_ordering() -> Vec<LayerBlobBuilder> {
    vec![LayerBlobBuilder::new()
        .file("c", "third")
        .file("a", "first")
        .file("b", "second")]
}

#[tokio::test]
async fn equal_priority_keeps_discovery_order() {
    let c = collection("app:1", layers_for_ordering(), 1).await;

    let first = c.diff(&Collection::empty()).unwrap();
    let second = c.diff(&Collection::empty()).unwrap();
    assert_eq!(first, second);

    // TOC order, not path order
    let order: Vec<_> = first.output_queue.iter().map(|r| r.size).collect();
    assert_eq!(vec![5, 5, 6], order);
    assert_eq!(crate::Digest::of(b"third"), first.output_queue[0].digest);
    assert_eq!(crate::Digest::of(b"first"), first.output_queue[1].digest);
}

#[tokio::test]
async fn priorities_move_hot_content_first() {
    let mut c = collection("app:1", layers_for_ordering(), 1).await;

    let at = |s| Utc.timestamp_opt(s, 0).unwrap();
    let group = TraceGroup {
        images: c.images().to_vec(),
        entries: vec![
            TraceEntry {
                path: "/b".into(),
                requested_at: at(10),
                ready_at: at(11),
            },
            TraceEntry {
                path: "/does/not/exist".into(),
                requested_at: at(5),
                ready_at: at(6),
            },
        ],
    };
    c.set_priorities(PriorityTable::from_trace(&c, &group));

    let bundle = c.diff(&Collection::empty()).unwrap();
    let order: Vec<_> = bundle.output_queue.iter().map(|r| r.digest).collect();
    assert_eq!(
        vec![
            crate::Digest::of(b"second"),
            crate::Digest::of(b"third"),
            crate::Digest::of(b"first"),
        ],
        order
    );
    assert_eq!(
        Some(Resolution::Payload { order: 0 }),
        resolution(&bundle, "/b")
    );
}

#[tokio::test]
async fn chunked_files_keep_their_chunks() {
    let c = collection(
        "app:1",
        vec![LayerBlobBuilder::new().chunked_file("big", BINARY_CONTENTS.clone(), 3000)],
        1,
    )
    .await;
    let content = c.content(&BINARY_DIGEST).unwrap();
    assert_eq!(3, content.chunks.len());
    assert_eq!(content.source_offset, content.chunks[0].offset);
    let last = content.chunks.last().unwrap();
    assert_eq!(
        content.source_offset + content.compressed_size,
        last.offset + last.compressed_size
    );
    assert_eq!(6000, last.chunk_offset);
}

#[tokio::test]
async fn header_survives_encoding() {
    let c = collection("app:1", vec![base_layer(), app_layer()], 1).await;
    let bundle = c.diff(&Collection::empty()).unwrap();

    let header = bundle.encode_header().await.unwrap();
    assert_eq!(bundle, DeltaBundle::decode_header(&header).await.unwrap());

    DeltaBundle::decode_header(b"not gzip")
        .await
        .expect_err("must fail");
}

#[tokio::test]
async fn stored_collection_keeps_content_index() {
    let c = collection("app:1", vec![base_layer(), app_layer()], 1).await;
    let restored = Collection::from_json(&c.to_json().unwrap()).unwrap();

    assert_eq!(c.signature(), restored.signature());
    assert_eq!(
        c.content(&CONFIG_DIGEST),
        restored.content(&CONFIG_DIGEST)
    );
    assert_eq!(c.diff(&Collection::empty()).unwrap(), restored.diff(&Collection::empty()).unwrap());
}
