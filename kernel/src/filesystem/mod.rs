// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! filesystem provides the in-memory filesystem the system
//! call gateway is wired to.
//!
//! The filesystem is a flat tree of nodes (files and
//! directories) stored entirely on the kernel heap; there is
//! no disk backing. It exists to give the read/write/open/
//! close system calls something real to operate on, and its
//! interface is what a disk-backed implementation would
//! replace.
//!
//! Paths are absolute, `/`-separated. Descriptors index a
//! fixed-size open-file table; each open file carries its own
//! offset and mode.

use crate::interrupts::without_interrupts;
use crate::Guarded;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

/// The maximum number of files open at once.
///
pub const MAX_OPEN_FILES: usize = 64;

// The node id of the root directory.
const ROOT: u32 = 1;

bitflags! {
    /// The mode bits a file can be opened with.
    ///
    pub struct OpenMode: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
        const CREATE = 0x08;
        const TRUNCATE = 0x10;
    }
}

/// Distinguishes files from directories.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Describes a node, as returned by [`stat`].
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub node: u32,
    pub kind: NodeKind,
    pub size: usize,
}

/// One entry of a directory, as returned by [`read_dir`].
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub node: u32,
    pub name: String,
    pub kind: NodeKind,
}

// One node in the tree.
//
struct Node {
    parent: u32,
    name: String,
    kind: NodeKind,
    data: Vec<u8>,
}

// One slot in the open-file table.
//
struct OpenFile {
    node: u32,
    offset: usize,
    mode: OpenMode,
}

// The whole filesystem state: the node tree and the
// open-file table.
//
struct Filesystem {
    nodes: BTreeMap<u32, Node>,
    next_node: u32,
    open_files: [Option<OpenFile>; MAX_OPEN_FILES],
}

const NO_OPEN_FILE: Option<OpenFile> = None;

impl Filesystem {
    const fn new() -> Filesystem {
        Filesystem {
            nodes: BTreeMap::new(),
            next_node: ROOT,
            open_files: [NO_OPEN_FILE; MAX_OPEN_FILES],
        }
    }

    fn insert_node(&mut self, parent: u32, name: &str, kind: NodeKind) -> u32 {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                parent,
                name: String::from(name),
                kind,
                data: Vec::new(),
            },
        );

        id
    }

    // Returns the child of `parent` with the given name.
    //
    fn child(&self, parent: u32, name: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|(&id, node)| id != ROOT && node.parent == parent && node.name == name)
            .map(|(&id, _)| id)
    }

    // Resolves an absolute path to a node id.
    //
    fn resolve(&self, path: &str) -> Option<u32> {
        if !path.starts_with('/') {
            return None;
        }

        let mut current = ROOT;
        for component in path.split('/').filter(|component| !component.is_empty()) {
            current = self.child(current, component)?;
        }

        Some(current)
    }

    // Resolves the parent directory of the final path
    // component, returning (parent id, component).
    //
    fn resolve_parent<'p>(&self, path: &'p str) -> Option<(u32, &'p str)> {
        if !path.starts_with('/') {
            return None;
        }

        let path = path.trim_end_matches('/');
        let split = path.rfind('/')?;
        let (dir, name) = (&path[..split], &path[split + 1..]);
        if name.is_empty() {
            return None;
        }

        let parent = if dir.is_empty() {
            ROOT
        } else {
            self.resolve(dir)?
        };

        if self.nodes.get(&parent)?.kind != NodeKind::Directory {
            return None;
        }

        Some((parent, name))
    }

    fn free_descriptor(&self) -> Option<usize> {
        self.open_files.iter().position(|slot| slot.is_none())
    }
}

/// FILESYSTEM is the kernel's filesystem state.
///
static FILESYSTEM: Guarded<Filesystem> = Guarded::new(Filesystem::new());

/// Builds the initial filesystem: the root directory and a
/// greeting file.
///
pub fn init() {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();
        if !filesystem.nodes.is_empty() {
            return;
        }

        let root = filesystem.insert_node(ROOT, "/", NodeKind::Directory);
        debug_assert_eq!(root, ROOT);

        let motd = filesystem.insert_node(ROOT, "motd", NodeKind::File);
        if let Some(node) = filesystem.nodes.get_mut(&motd) {
            node.data.extend_from_slice(b"Welcome to the kernel.\n");
        }
    });
}

/// Opens the file at the given path, returning a descriptor.
///
/// With [`OpenMode::CREATE`], a missing file is created in an
/// existing parent directory. [`OpenMode::TRUNCATE`] discards
/// the file's contents (and requires write mode);
/// [`OpenMode::APPEND`] starts the offset at the end of the
/// file. Returns None on a missing file, a bad path, or an
/// exhausted descriptor table.
///
pub fn open(path: &str, mode: OpenMode) -> Option<usize> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();

        let node_id = match filesystem.resolve(path) {
            Some(node) => node,
            None if mode.contains(OpenMode::CREATE) => {
                let (parent, name) = filesystem.resolve_parent(path)?;
                if filesystem.child(parent, name).is_some() {
                    return None;
                }

                filesystem.insert_node(parent, name, NodeKind::File)
            }
            None => return None,
        };

        let node = filesystem.nodes.get(&node_id)?;
        if node.kind == NodeKind::Directory && mode.intersects(OpenMode::WRITE | OpenMode::APPEND | OpenMode::TRUNCATE) {
            return None;
        }

        if mode.contains(OpenMode::TRUNCATE) {
            if !mode.contains(OpenMode::WRITE) {
                return None;
            }

            let node = filesystem.nodes.get_mut(&node_id)?;
            node.data.clear();
        }

        let offset = if mode.contains(OpenMode::APPEND) {
            filesystem.nodes.get(&node_id)?.data.len()
        } else {
            0
        };

        let descriptor = filesystem.free_descriptor()?;
        filesystem.open_files[descriptor] = Some(OpenFile {
            node: node_id,
            offset,
            mode,
        });

        Some(descriptor)
    })
}

/// Closes the given descriptor. Closing a descriptor that is
/// not open returns None.
///
pub fn close(descriptor: usize) -> Option<()> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();
        let slot = filesystem.open_files.get_mut(descriptor)?;
        slot.take().map(|_| ())
    })
}

/// Reads from the descriptor's current offset into the given
/// buffer, returning the number of bytes read.
///
/// Reading past the end of the file returns 0 bytes. Reading
/// a directory, or a descriptor not opened for reading,
/// returns None.
///
pub fn read(descriptor: usize, buffer: &mut [u8]) -> Option<usize> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();

        let open = match filesystem.open_files.get(descriptor)? {
            Some(ref open) => OpenFile {
                node: open.node,
                offset: open.offset,
                mode: open.mode,
            },
            None => return None,
        };

        if !open.mode.contains(OpenMode::READ) {
            return None;
        }

        let node = filesystem.nodes.get(&open.node)?;
        if node.kind != NodeKind::File {
            return None;
        }

        let available = node.data.len().saturating_sub(open.offset);
        let count = available.min(buffer.len());
        buffer[..count].copy_from_slice(&node.data[open.offset..open.offset + count]);

        if let Some(Some(open)) = filesystem.open_files.get_mut(descriptor) {
            open.offset += count;
        }

        Some(count)
    })
}

/// Writes the given buffer at the descriptor's current offset,
/// returning the number of bytes written.
///
/// Writing past the end of the file extends it; a gap left by
/// a seek is filled with zeroes. Writing to a descriptor not
/// opened for writing returns None.
///
pub fn write(descriptor: usize, buffer: &[u8]) -> Option<usize> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();

        let (node_id, offset) = match filesystem.open_files.get(descriptor)? {
            Some(ref open) if open.mode.contains(OpenMode::WRITE) => (open.node, open.offset),
            _ => return None,
        };

        let node = filesystem.nodes.get_mut(&node_id)?;
        if node.kind != NodeKind::File {
            return None;
        }

        let end = offset + buffer.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }

        node.data[offset..end].copy_from_slice(buffer);

        if let Some(Some(open)) = filesystem.open_files.get_mut(descriptor) {
            open.offset = end;
        }

        Some(buffer.len())
    })
}

/// Where a [`seek`] offset is measured from.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Moves the descriptor's offset, returning the new offset.
///
/// Seeking before the start of the file returns None and
/// leaves the offset unchanged. Seeking past the end is
/// allowed; a later write fills the gap with zeroes.
///
pub fn seek(descriptor: usize, offset: i64, whence: Whence) -> Option<usize> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();

        let (node_id, current) = match filesystem.open_files.get(descriptor)? {
            Some(ref open) => (open.node, open.offset),
            None => return None,
        };

        let base = match whence {
            Whence::Start => 0,
            Whence::Current => current as i64,
            Whence::End => filesystem.nodes.get(&node_id)?.data.len() as i64,
        };

        let target = base + offset;
        if target < 0 {
            return None;
        }

        if let Some(Some(open)) = filesystem.open_files.get_mut(descriptor) {
            open.offset = target as usize;
        }

        Some(target as usize)
    })
}

/// Returns metadata for the node at the given path.
///
pub fn stat(path: &str) -> Option<FileStat> {
    without_interrupts(|| {
        let filesystem = FILESYSTEM.lock();
        let node_id = filesystem.resolve(path)?;
        let node = filesystem.nodes.get(&node_id)?;

        Some(FileStat {
            node: node_id,
            kind: node.kind,
            size: node.data.len(),
        })
    })
}

/// Creates a directory at the given path. The parent must
/// already exist. Returns None if the path already exists or
/// the parent is missing.
///
pub fn create_dir(path: &str) -> Option<()> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();
        if filesystem.resolve(path).is_some() {
            return None;
        }

        let (parent, name) = filesystem.resolve_parent(path)?;
        filesystem.insert_node(parent, name, NodeKind::Directory);

        Some(())
    })
}

/// Reads the next entry of a directory opened with [`open`],
/// or None once the directory is exhausted.
///
/// The descriptor's offset indexes the directory's children.
///
pub fn read_dir(descriptor: usize) -> Option<DirEntry> {
    without_interrupts(|| {
        let mut filesystem = FILESYSTEM.lock();

        let (node_id, index) = match filesystem.open_files.get(descriptor)? {
            Some(ref open) if open.mode.contains(OpenMode::READ) => (open.node, open.offset),
            _ => return None,
        };

        if filesystem.nodes.get(&node_id)?.kind != NodeKind::Directory {
            return None;
        }

        let entry = filesystem
            .nodes
            .iter()
            .filter(|(&id, node)| id != ROOT && node.parent == node_id)
            .nth(index)
            .map(|(&id, node)| DirEntry {
                node: id,
                name: node.name.clone(),
                kind: node.kind,
            })?;

        if let Some(Some(open)) = filesystem.open_files.get_mut(descriptor) {
            open.offset += 1;
        }

        Some(entry)
    })
}

// Tests

#[test_case]
fn filesystem_read_write_round_trip() {
    init();

    let mode = OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE;
    let fd = open("/round-trip.txt", mode).unwrap();

    let message = b"some file contents";
    assert_eq!(write(fd, message), Some(message.len()));

    // The offset is at the end, so an immediate read sees
    // end-of-file. Seek back and read the data.
    let mut buffer = [0u8; 32];
    assert_eq!(read(fd, &mut buffer), Some(0));
    assert_eq!(seek(fd, 0, Whence::Start), Some(0));
    assert_eq!(read(fd, &mut buffer), Some(message.len()));
    assert_eq!(&buffer[..message.len()], message);

    assert_eq!(close(fd), Some(()));
    assert_eq!(close(fd), None);
}

#[test_case]
fn filesystem_missing_paths() {
    init();

    assert_eq!(open("/no-such-file", OpenMode::READ), None);
    assert_eq!(open("relative/path", OpenMode::READ), None);
    assert_eq!(stat("/no-such-file"), None);

    // CREATE requires an existing parent directory.
    assert_eq!(
        open("/missing-dir/file", OpenMode::WRITE | OpenMode::CREATE),
        None
    );
}

#[test_case]
fn filesystem_append_and_truncate() {
    init();

    let mode = OpenMode::WRITE | OpenMode::CREATE;
    let fd = open("/log.txt", mode).unwrap();
    assert_eq!(write(fd, b"one"), Some(3));
    close(fd).unwrap();

    let fd = open("/log.txt", OpenMode::WRITE | OpenMode::APPEND).unwrap();
    assert_eq!(write(fd, b"two"), Some(3));
    close(fd).unwrap();
    assert_eq!(stat("/log.txt").unwrap().size, 6);

    // Truncation discards the contents; without write mode
    // it is refused.
    assert_eq!(open("/log.txt", OpenMode::READ | OpenMode::TRUNCATE), None);
    let fd = open("/log.txt", OpenMode::WRITE | OpenMode::TRUNCATE).unwrap();
    close(fd).unwrap();
    assert_eq!(stat("/log.txt").unwrap().size, 0);
}

#[test_case]
fn filesystem_directories() {
    init();

    assert_eq!(create_dir("/tmp"), Some(()));
    assert_eq!(create_dir("/tmp"), None);
    assert_eq!(stat("/tmp").unwrap().kind, NodeKind::Directory);

    let fd = open("/tmp/inner.txt", OpenMode::WRITE | OpenMode::CREATE).unwrap();
    assert_eq!(write(fd, b"x"), Some(1));
    close(fd).unwrap();

    // Directories can be opened for reading and listed, but
    // not written.
    assert_eq!(open("/tmp", OpenMode::WRITE), None);
    let dir = open("/tmp", OpenMode::READ).unwrap();
    let entry = read_dir(dir).unwrap();
    assert_eq!(entry.name, "inner.txt");
    assert_eq!(entry.kind, NodeKind::File);
    assert_eq!(read_dir(dir), None);
    close(dir).unwrap();

    // Reading a directory as a file fails.
    let dir = open("/tmp", OpenMode::READ).unwrap();
    let mut buffer = [0u8; 8];
    assert_eq!(read(dir, &mut buffer), None);
    close(dir).unwrap();
}

#[test_case]
fn filesystem_motd_exists() {
    init();

    let stat = stat("/motd").unwrap();
    assert_eq!(stat.kind, NodeKind::File);
    assert!(stat.size > 0);

    let fd = open("/motd", OpenMode::READ).unwrap();
    let mut buffer = [0u8; 64];
    let count = read(fd, &mut buffer).unwrap();
    assert_eq!(count, stat.size);
    close(fd).unwrap();
}
