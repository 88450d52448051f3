use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    optimizer::PriorityTable,
    toc::{is_within, parent_path, EntryKind, FileChunk, Toc, TocEntry, Whiteout},
    Digest, Error, ImageRef,
};

/// One layer of an image stack. Its position in the stack is its index in
/// [Collection::layers].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub digest: Digest,
    /// Size of the compressed blob.
    pub size: u64,
    /// Serial id handed out by the proxy's metadata store. Clients store the
    /// layer's content in a directory named after it.
    pub serial: u64,
    /// Repository the blob is fetched from.
    pub repository: String,
}

/// The entry visible at a path after shadowing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleEntry {
    pub entry: TocEntry,
    /// Layer the entry was taken from.
    pub stack: u32,
    /// Layer holding the entry's bytes. Differs from `stack` for hardlinks
    /// pointing into lower layers.
    pub content_stack: u32,
    /// Position of the entry in its layer's TOC.
    pub index: u32,
}

impl VisibleEntry {
    fn discovery(&self) -> (u32, u32) {
        (self.stack, self.index)
    }
}

/// A distinct unit of file content, identified by its digest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub digest: Digest,
    /// Layer owning the copy that gets transferred.
    pub stack: u32,
    /// Uncompressed size.
    pub size: u64,
    pub source_offset: u64,
    pub compressed_size: u64,
    pub chunks: Vec<FileChunk>,
    /// Where the content was first encountered, as (stack, TOC index).
    pub discovery: (u32, u32),
}

/// The merged namespace of an image stack.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Collection {
    images: Vec<ImageRef>,
    layers: Vec<Layer>,
    entries: BTreeMap<String, VisibleEntry>,
    contents: Vec<Content>,

    #[serde(skip)]
    by_digest: HashMap<Digest, usize>,

    #[serde(skip)]
    priorities: PriorityTable,
}

impl Collection {
    /// The collection of the empty image stack, used as base for fresh pulls.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merges the layers' TOCs, bottom (index 0) to top.
    #[instrument(skip_all, fields(collection.images = %ImageRef::signature(&images), collection.layers = layers.len()), err)]
    pub fn build(images: Vec<ImageRef>, layers: Vec<(Layer, Toc)>) -> Result<Self, Error> {
        let mut entries: BTreeMap<String, VisibleEntry> = BTreeMap::new();
        let mut stack_layers = Vec::with_capacity(layers.len());

        for (stack, (layer, toc)) in layers.into_iter().enumerate() {
            let stack = stack as u32;
            stack_layers.push(layer);

            // Whiteouts only affect lower layers, so apply them before adding
            // anything from this one.
            for e in toc.entries.iter() {
                match e.whiteout() {
                    Some(Whiteout::Remove(path)) => remove_subtree(&mut entries, &path, true),
                    Some(Whiteout::Opaque(dir)) => remove_subtree(&mut entries, &dir, false),
                    None => {}
                }
            }

            for (index, entry) in toc.entries.into_iter().enumerate() {
                if entry.whiteout().is_some() {
                    continue;
                }
                let index = index as u32;

                let visible = if entry.kind == EntryKind::Hardlink {
                    let target = entries
                        .get(&entry.link_target)
                        .filter(|t| t.entry.kind != EntryKind::Dir)
                        .ok_or_else(|| {
                            Error::metadata(
                                &entry.path,
                                format!("hardlink target {} not found", entry.link_target),
                            )
                        })?;
                    let mut linked = target.entry.clone();
                    linked.path = entry.path;
                    VisibleEntry {
                        entry: linked,
                        stack,
                        content_stack: target.content_stack,
                        index,
                    }
                } else {
                    VisibleEntry {
                        entry,
                        stack,
                        content_stack: stack,
                        index,
                    }
                };

                insert_entry(&mut entries, visible);
            }
        }

        let mut collection = Collection {
            images,
            layers: stack_layers,
            entries,
            contents: vec![],
            by_digest: HashMap::new(),
            priorities: PriorityTable::default(),
        };
        collection.collect_contents()?;

        debug!(
            collection.entries = collection.entries.len(),
            collection.contents = collection.contents.len(),
            "built collection"
        );

        Ok(collection)
    }

    /// Gathers the distinct contents, in discovery order.
    fn collect_contents(&mut self) -> Result<(), Error> {
        let mut visible: Vec<&VisibleEntry> = self
            .entries
            .values()
            .filter(|v| v.entry.kind == EntryKind::Reg)
            .collect();
        visible.sort_by_key(|v| v.discovery());

        let mut contents: Vec<Content> = vec![];
        let mut by_digest = HashMap::new();

        for v in visible {
            if !v.entry.has_content() {
                continue;
            }
            let digest = v
                .entry
                .digest
                .ok_or_else(|| Error::metadata(&v.entry.path, "regular file without digest"))?;
            if by_digest.contains_key(&digest) {
                continue;
            }

            let (source_offset, compressed_size) = v
                .entry
                .compressed_range()
                .filter(|(_, len)| *len > 0)
                .ok_or_else(|| {
                    Error::metadata(
                        &v.entry.path,
                        format!("no compressed location for {}", digest),
                    )
                })?;

            by_digest.insert(digest, contents.len());
            contents.push(Content {
                digest,
                stack: v.content_stack,
                size: v.entry.size,
                source_offset,
                compressed_size,
                chunks: v.entry.chunks.clone(),
                discovery: v.discovery(),
            });
        }

        self.contents = contents;
        self.by_digest = by_digest;
        Ok(())
    }

    /// Restores a collection from its serialized form.
    pub fn from_json(buf: &[u8]) -> Result<Self, Error> {
        let mut collection: Collection = serde_json::from_slice(buf)?;
        collection.by_digest = collection
            .contents
            .iter()
            .enumerate()
            .map(|(i, c)| (c.digest, i))
            .collect();
        Ok(collection)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn images(&self) -> &[ImageRef] {
        &self.images
    }

    /// The identity of this collection.
    pub fn signature(&self) -> String {
        ImageRef::signature(&self.images)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &VisibleEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, path: &str) -> Option<&VisibleEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contents(&self) -> &[Content] {
        &self.contents
    }

    pub fn content(&self, digest: &Digest) -> Option<&Content> {
        self.by_digest.get(digest).map(|i| &self.contents[*i])
    }

    pub fn priorities(&self) -> &PriorityTable {
        &self.priorities
    }

    /// Attaches the transmission-order hint used by [Collection::diff].
    pub fn set_priorities(&mut self, priorities: PriorityTable) {
        self.priorities = priorities;
    }
}

/// Removes everything below `path`, and `path` itself if requested.
fn remove_subtree(entries: &mut BTreeMap<String, VisibleEntry>, path: &str, including_self: bool) {
    let doomed: Vec<String> = entries
        .range(path.to_string()..)
        .map(|(k, _)| k)
        .take_while(|k| k.starts_with(path))
        .filter(|k| is_within(k, path) && (including_self || k.as_str() != path))
        .cloned()
        .collect();

    for k in doomed {
        entries.remove(&k);
    }
}

fn insert_entry(entries: &mut BTreeMap<String, VisibleEntry>, visible: VisibleEntry) {
    let path = visible.entry.path.clone();

    // A directory over a directory only replaces metadata. Anything else
    // replaces the whole subtree.
    let keeps_children = entries
        .get(&path)
        .map(|existing| {
            existing.entry.kind == EntryKind::Dir && visible.entry.kind == EntryKind::Dir
        })
        .unwrap_or(false);
    if !keeps_children {
        remove_subtree(entries, &path, true);
    }

    let mut ancestor = parent_path(&path);
    while let Some(dir) = ancestor {
        match entries.get(dir) {
            Some(e) if e.entry.kind == EntryKind::Dir => break,
            Some(_) => remove_subtree(entries, dir, true),
            None => {}
        }
        entries.insert(
            dir.to_string(),
            VisibleEntry {
                entry: TocEntry::implicit_dir(dir),
                stack: visible.stack,
                content_stack: visible.stack,
                index: visible.index,
            },
        );
        ancestor = parent_path(dir);
    }

    entries.insert(path, visible);
}
