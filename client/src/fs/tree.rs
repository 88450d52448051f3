//! The namespace of a mounted delta as an arena of nodes. Inode numbers are
//! arena positions plus one, so the root is inode 1.

use std::collections::HashMap;

use layerlift_delta::{
    toc::{parent_path, EntryKind, TocEntry},
    Error, RequestedFile, Resolution,
};

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
pub struct Node {
    pub ino: u64,
    pub parent: u64,
    pub file: RequestedFile,
    /// Child inodes, ordered by name.
    pub children: Vec<u64>,
}

impl Node {
    pub fn path(&self) -> &str {
        &self.file.entry.path
    }

    pub fn name(&self) -> &str {
        self.file.entry.name()
    }

    pub fn entry(&self) -> &TocEntry {
        &self.file.entry
    }

    pub fn is_dir(&self) -> bool {
        self.file.entry.kind == EntryKind::Dir
    }
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
    by_path: HashMap<String, u64>,
}

impl Tree {
    /// Builds the tree from the header's file list, which is sorted by path.
    pub fn build(files: &[RequestedFile]) -> Result<Self, Error> {
        let mut tree = Tree {
            nodes: Vec::with_capacity(files.len() + 1),
            by_path: HashMap::with_capacity(files.len() + 1),
        };

        if files.first().map(|f| f.entry.path.as_str()) != Some("/") {
            tree.push(
                ROOT_INO,
                RequestedFile {
                    entry: TocEntry::implicit_dir("/"),
                    stack: 0,
                    resolution: Resolution::Sibling { stack: 0 },
                },
            );
        }

        for file in files {
            let parent = match parent_path(&file.entry.path) {
                None => ROOT_INO,
                Some(parent) => {
                    let ino = tree.by_path.get(parent).copied().ok_or_else(|| {
                        Error::metadata(&file.entry.path, "parent directory missing from header")
                    })?;
                    if !tree.nodes[(ino - 1) as usize].is_dir() {
                        return Err(Error::metadata(&file.entry.path, "parent is not a directory"));
                    }
                    ino
                }
            };

            let ino = tree.push(parent, file.clone());
            if ino != parent {
                tree.nodes[(parent - 1) as usize].children.push(ino);
            }
        }

        Ok(tree)
    }

    fn push(&mut self, parent: u64, file: RequestedFile) -> u64 {
        let ino = self.nodes.len() as u64 + 1;
        self.by_path.insert(file.entry.path.clone(), ino);
        self.nodes.push(Node {
            ino,
            parent,
            file,
            children: vec![],
        });
        ino
    }

    pub fn get(&self, ino: u64) -> Option<&Node> {
        ino.checked_sub(1).and_then(|i| self.nodes.get(i as usize))
    }

    pub fn get_by_path(&self, path: &str) -> Option<&Node> {
        self.by_path.get(path).and_then(|ino| self.get(*ino))
    }

    pub fn child(&self, parent: &Node, name: &str) -> Option<&Node> {
        parent
            .children
            .iter()
            .filter_map(|ino| self.get(*ino))
            .find(|n| n.name() == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
