//! Path resolution, creation, rename and unlink on a mounted volume.

use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use super::entry::{fat_epoch, short_name_bytes, DirEntry, EntryKind};
use super::node::{DirGuard, DirNode, FileNode, Node, NodeId, ParentRef};
use super::volume::{now, FatVolume};
use crate::error::{BestEffort, FatError, Result};

bitflags! {
    /// How `FatVolume::open` resolves and creates its target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Create the final component if it is missing.
        const CREATE = 1 << 2;
        /// With `CREATE`: fail if it already exists.
        const EXCLUSIVE = 1 << 3;
        /// Cut an existing file to zero length. Needs `WRITE`.
        const TRUNCATE = 1 << 4;
        /// The target must be a file.
        const FILE = 1 << 5;
        /// The target must be a directory.
        const DIRECTORY = 1 << 6;
    }
}

fn is_dot(name: &str) -> bool {
    name == "." || name == ".."
}

impl FatVolume {
    /// Resolve `path` relative to the directory `dir` and return a new
    /// handle on its target. Components are separated by `/`; an empty path
    /// names `dir` itself.
    pub fn open(&self, dir: &Node, path: &str, flags: OpenFlags) -> Result<Node> {
        let _shared = self.shared()?;
        let Node::Directory(start) = dir else {
            return Err(FatError::NotADir(format!("open '{path}' relative to a file")));
        };
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let (last, parents) = match components.split_last() {
            Some((last, parents)) => (*last, parents),
            None => (".", &[][..]),
        };

        self.dcache.hold(start);
        let mut current = start.clone();
        for component in parents {
            let next = self.step(&current, component);
            self.dcache.release(&current);
            current = next?;
        }

        let opened = if is_dot(last) {
            self.open_dot(&current, last, flags)
        } else {
            self.open_in(&current, last, flags)
        };
        self.dcache.release(&current);
        opened
    }

    /// Move one component down (or up) from `dir`. The result carries a
    /// cache hold.
    fn step(&self, dir: &Arc<DirNode>, name: &str) -> Result<Arc<DirNode>> {
        match name {
            "." => {
                self.dcache.hold(dir);
                Ok(dir.clone())
            }
            ".." => {
                if dir.id().is_root() {
                    self.dcache.hold(dir);
                    return Ok(dir.clone());
                }
                let start = dir.lock().start_cluster;
                let parent = self.codec.parent_of(start)?;
                self.load_dir(NodeId::of_cluster(parent, &self.boot))
            }
            _ => {
                let guard = dir.lock();
                let (entry, _) = self.codec.lookup(guard.start_cluster, name)?;
                if !entry.is_directory() {
                    return Err(FatError::NotADir(name.to_string()));
                }
                let id = NodeId::of_cluster(entry.start_cluster, &self.boot);
                Ok(self.dcache.create_or_acquire(id, id.0, entry.mtime))
            }
        }
    }

    /// Resident node for `id`, loading it from its `.` record if needed.
    /// The result carries a cache hold.
    fn load_dir(&self, id: NodeId) -> Result<Arc<DirNode>> {
        if let Some(node) = self.dcache.acquire(id) {
            return Ok(node);
        }
        let mtime = if id.is_root() {
            fat_epoch()
        } else {
            self.codec.lookup(id.0, ".")?.0.mtime
        };
        Ok(self.dcache.create_or_acquire(id, id.0, mtime))
    }

    fn open_dot(&self, dir: &Arc<DirNode>, name: &str, flags: OpenFlags) -> Result<Node> {
        if flags.intersects(OpenFlags::CREATE | OpenFlags::EXCLUSIVE | OpenFlags::FILE | OpenFlags::TRUNCATE) {
            return Err(FatError::InvalidArgs(format!("'{name}' can only be opened as a directory")));
        }
        if !flags.contains(OpenFlags::READ) {
            return Err(FatError::Permission(format!("'{name}' needs read access")));
        }
        let target = self.step(dir, name)?;
        self.dcache.add_ref(&target);
        self.dcache.release(&target);
        Ok(Node::Directory(target))
    }

    fn open_in(&self, dir: &Arc<DirNode>, name: &str, flags: OpenFlags) -> Result<Node> {
        if flags.contains(OpenFlags::FILE | OpenFlags::DIRECTORY) {
            return Err(FatError::InvalidArgs("FILE and DIRECTORY are exclusive".into()));
        }
        if flags.contains(OpenFlags::TRUNCATE) && !flags.contains(OpenFlags::WRITE) {
            return Err(FatError::Permission(format!("truncating '{name}' needs write access")));
        }
        if flags.contains(OpenFlags::WRITE) {
            self.check_writable()?;
        }

        let mut guard = dir.lock();
        match self.codec.lookup(guard.start_cluster, name) {
            Ok((entry, index)) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                    return Err(FatError::AlreadyExists(name.to_string()));
                }
                match entry.kind {
                    EntryKind::Directory => {
                        if flags.intersects(OpenFlags::FILE | OpenFlags::TRUNCATE) {
                            return Err(FatError::NotAFile(name.to_string()));
                        }
                        let id = NodeId::of_cluster(entry.start_cluster, &self.boot);
                        let node = self.dcache.create_or_acquire(id, id.0, entry.mtime);
                        self.dcache.add_ref(&node);
                        self.dcache.release(&node);
                        Ok(Node::Directory(node))
                    }
                    EntryKind::File => {
                        if flags.contains(OpenFlags::DIRECTORY) {
                            return Err(FatError::NotADir(name.to_string()));
                        }
                        let file = self.open_file_from_dirent(dir, &mut guard, &entry, index);
                        if flags.contains(OpenFlags::TRUNCATE) {
                            let truncated = {
                                let mut state = guard.lock_file(&file);
                                self.resize_locked(&mut *state, 0)
                            };
                            if let Err(e) = truncated {
                                let (last, _) = self.drop_file_ref(&mut guard, &file);
                                drop(guard);
                                if last {
                                    self.dcache.release(dir);
                                }
                                return Err(e);
                            }
                        }
                        Ok(Node::File(file))
                    }
                }
            }
            Err(FatError::NotFound(_)) if flags.contains(OpenFlags::CREATE) => {
                self.create_in(dir, &mut guard, name, flags)
            }
            Err(e) => Err(e),
        }
    }

    fn create_in(
        &self,
        dir: &Arc<DirNode>,
        guard: &mut DirGuard<'_>,
        name: &str,
        flags: OpenFlags,
    ) -> Result<Node> {
        self.check_writable()?;
        if !flags.contains(OpenFlags::WRITE) {
            return Err(FatError::Permission(format!("creating '{name}' needs write access")));
        }
        if !flags.intersects(OpenFlags::FILE | OpenFlags::DIRECTORY) {
            return Err(FatError::InvalidArgs(format!(
                "creating '{name}' needs FILE or DIRECTORY"
            )));
        }
        short_name_bytes(name)?;
        let mtime = now();

        if flags.contains(OpenFlags::FILE) {
            let entry = DirEntry::new_file(name, 0, 0, mtime);
            let index = self.codec.allocate(guard.start_cluster, &entry)?;
            debug!("created file '{name}' in {:?} slot {index}", dir.id());
            return Ok(Node::File(self.open_file_from_dirent(dir, guard, &entry, index)));
        }

        let cluster = self.clusters.extend(0)?;
        let created = self
            .codec
            .init_directory(cluster, dir.id().dotdot_cluster(), mtime)
            .and_then(|()| {
                self.codec
                    .allocate(guard.start_cluster, &DirEntry::new_directory(name, cluster, mtime))
            });
        if let Err(e) = created {
            BestEffort::new(self.clusters.delete(cluster)).ignore("releasing cluster of failed mkdir");
            return Err(e);
        }
        debug!("created directory '{name}' at cluster {cluster}");
        let node = self.dcache.create_or_acquire(NodeId(cluster), cluster, mtime);
        self.dcache.add_ref(&node);
        self.dcache.release(&node);
        Ok(Node::Directory(node))
    }

    /// Open handle on the file in slot `index` of the locked directory,
    /// sharing the node with any existing opener.
    pub(crate) fn open_file_from_dirent(
        &self,
        dir: &Arc<DirNode>,
        guard: &mut DirGuard<'_>,
        entry: &DirEntry,
        index: u32,
    ) -> Arc<FileNode> {
        if let Some(existing) = guard.children.get(&index).cloned() {
            guard.lock_file(&existing).refs += 1;
            return existing;
        }
        let file = Arc::new(FileNode::new(
            ParentRef {
                dir: dir.id(),
                index,
            },
            entry.start_cluster,
            entry.size,
            entry.mtime,
        ));
        guard.lock_file(&file).refs = 1;
        guard.children.insert(index, file.clone());
        // Open files keep their directory resident.
        self.dcache.hold(dir);
        file
    }

    /// Write a modified file's state into its directory entry.
    pub(crate) fn flush_locked(&self, guard: &DirGuard<'_>, file: &FileNode) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        let mut state = guard.lock_file(file);
        if state.deleted || !state.modified {
            return Ok(());
        }
        self.codec.update(
            guard.start_cluster,
            state.start_cluster,
            state.mtime,
            state.size,
            file.parent().index,
        )?;
        state.modified = false;
        Ok(())
    }

    /// Drop one handle. On the last one the node leaves the child table;
    /// returns whether it was the last and, for an unlinked file, the chain
    /// still to be released.
    fn drop_file_ref(&self, guard: &mut DirGuard<'_>, file: &Arc<FileNode>) -> (bool, Option<u32>) {
        let (last, deleted, start) = {
            let mut state = guard.lock_file(file);
            state.refs = state.refs.saturating_sub(1);
            (state.refs == 0, state.deleted, state.start_cluster)
        };
        if !last {
            return (false, None);
        }
        let index = file.parent().index;
        if guard.children.get(&index).is_some_and(|c| Arc::ptr_eq(c, file)) {
            guard.children.remove(&index);
        }
        (true, (deleted && start != 0).then_some(start))
    }

    /// Write back `file` and, with `should_close`, give up one handle.
    /// The handle is given up even when the write-back fails.
    pub(crate) fn flush_on_close(&self, file: &Arc<FileNode>, should_close: bool) -> Result<()> {
        let parent = self.file_parent(file)?;
        let mut guard = parent.lock();
        let flushed = self.flush_locked(&guard, file);
        if !should_close {
            return flushed;
        }

        let (last, orphan) = self.drop_file_ref(&mut guard, file);
        drop(guard);
        if last {
            self.dcache.release(&parent);
        }
        if let Some(start) = orphan {
            debug!("releasing chain {start} of unlinked file");
            self.clusters.delete(start)?;
        }
        flushed
    }

    /// A directory may be removed only when nothing has it resident and it
    /// holds nothing besides its dot entries.
    fn check_removable_dir(&self, entry: &DirEntry, name: &str) -> Result<()> {
        let id = NodeId::of_cluster(entry.start_cluster, &self.boot);
        if self.dcache.peek(id).is_some() {
            return Err(FatError::IsActive(name.to_string()));
        }
        if !self.codec.is_empty(entry.start_cluster)? {
            return Err(FatError::NotEmpty(name.to_string()));
        }
        Ok(())
    }

    /// Fail if the directory at `moving` is `dest` or one of its ancestors.
    fn check_not_ancestor(&self, moving: u32, dest: &Arc<DirNode>) -> Result<()> {
        let moving = NodeId::of_cluster(moving, &self.boot);
        let mut current = dest.id();
        for _ in 0..=self.boot.num_usable_clusters() {
            if current == moving {
                return Err(FatError::InvalidArgs(
                    "cannot move a directory into its own subtree".into(),
                ));
            }
            if current.is_root() {
                return Ok(());
            }
            let node = self.load_dir(current)?;
            let parent = {
                let guard = node.lock();
                self.codec.parent_of(guard.start_cluster)
            };
            self.dcache.release(&node);
            current = NodeId::of_cluster(parent?, &self.boot);
        }
        Err(FatError::MalformedChain("directory parents form a loop".into()))
    }

    /// Move `src_name` in `src_dir` to `dst_name` in `dst_dir`, replacing a
    /// destination of the same kind. Open handles follow the entry.
    pub fn rename(&self, src_dir: &Node, src_name: &str, dst_dir: &Node, dst_name: &str) -> Result<()> {
        let _exclusive = self.exclusive()?;
        self.check_writable()?;
        let (Node::Directory(src), Node::Directory(dst)) = (src_dir, dst_dir) else {
            return Err(FatError::NotADir("rename needs directory handles".into()));
        };
        for name in [src_name, dst_name] {
            if is_dot(name) {
                return Err(FatError::InvalidArgs(format!("cannot rename '{name}'")));
            }
        }
        let same_parent = src.id() == dst.id();
        if same_parent && short_name_bytes(src_name)? == short_name_bytes(dst_name)? {
            return Err(FatError::InvalidArgs(format!("'{src_name}' renamed onto itself")));
        }
        short_name_bytes(dst_name)?;

        let src_start = src.lock().start_cluster;
        let dst_start = dst.lock().start_cluster;
        let (src_entry, src_index) = self.codec.lookup(src_start, src_name)?;

        let src_open = {
            let guard = src.lock();
            guard.children.get(&src_index).cloned()
        };
        let mut moved = src_entry.clone();
        moved.name = dst_name.to_string();
        if let Some(file) = &src_open {
            let guard = src.lock();
            let state = guard.lock_file(file);
            moved.start_cluster = state.start_cluster;
            moved.size = state.size;
            moved.mtime = state.mtime;
        }

        if src_entry.is_directory() && !same_parent {
            self.check_not_ancestor(src_entry.start_cluster, dst)?;
        }

        let dst_index = match self.codec.lookup(dst_start, dst_name) {
            Ok((existing, index)) => {
                self.replace_entry(dst, dst_start, &moved, &existing, index, dst_name)?
            }
            Err(FatError::NotFound(_)) => self.codec.allocate(dst_start, &moved)?,
            Err(e) => return Err(e),
        };

        if src_entry.is_directory() && !same_parent {
            self.codec
                .set_parent(src_entry.start_cluster, dst.id().dotdot_cluster())?;
        }
        self.codec.free(src_start, src_index)?;

        if let Some(file) = src_open {
            src.lock().children.remove(&src_index);
            dst.lock().children.insert(dst_index, file.clone());
            file.relink(ParentRef {
                dir: dst.id(),
                index: dst_index,
            });
            if !same_parent {
                self.dcache.hold(dst);
                self.dcache.release(src);
            }
        }
        debug!("renamed '{src_name}' in {:?} to '{dst_name}' in {:?}", src.id(), dst.id());
        Ok(())
    }

    /// Point the existing destination entry at the moved data and release
    /// what it held before.
    fn replace_entry(
        &self,
        dst: &Arc<DirNode>,
        dst_start: u32,
        moved: &DirEntry,
        existing: &DirEntry,
        index: u32,
        name: &str,
    ) -> Result<u32> {
        match (moved.kind, existing.kind) {
            (EntryKind::Directory, EntryKind::File) => return Err(FatError::NotADir(name.to_string())),
            (EntryKind::File, EntryKind::Directory) => return Err(FatError::NotAFile(name.to_string())),
            _ => {}
        }
        if existing.is_directory() {
            self.check_removable_dir(existing, name)?;
        }
        let old = self
            .codec
            .update(dst_start, moved.start_cluster, moved.mtime, moved.size, index)?;
        let replaced = {
            let mut guard = dst.lock();
            let replaced = guard.children.remove(&index);
            if let Some(file) = &replaced {
                guard.lock_file(file).deleted = true;
            }
            replaced
        };
        if replaced.is_none() && old != 0 {
            self.clusters.delete(old)?;
        }
        Ok(index)
    }

    /// Remove `name` from `dir`. Directories must be empty and not open; an
    /// open file keeps its data until its last handle is closed.
    pub fn unlink(&self, dir: &Node, name: &str) -> Result<()> {
        let _shared = self.shared()?;
        let Node::Directory(dir) = dir else {
            return Err(FatError::NotADir(format!("unlink '{name}' from a file")));
        };
        if is_dot(name) {
            return Err(FatError::IsActive(name.to_string()));
        }
        self.check_writable()?;

        let mut guard = dir.lock();
        let (entry, index) = self.codec.lookup(guard.start_cluster, name)?;
        if entry.is_directory() {
            self.check_removable_dir(&entry, name)?;
            self.codec.free(guard.start_cluster, index)?;
            return self.clusters.delete(entry.start_cluster);
        }

        self.codec.free(guard.start_cluster, index)?;
        if let Some(file) = guard.children.remove(&index) {
            guard.lock_file(&file).deleted = true;
            debug!("'{name}' unlinked while open");
        } else if entry.start_cluster != 0 {
            self.clusters.delete(entry.start_cluster)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FormatOptions, MountOptions};
    use crate::device::MemoryDevice;
    use crate::fs::format::format_volume;
    use std::thread;

    const CREATE_FILE: OpenFlags = OpenFlags::READ
        .union(OpenFlags::WRITE)
        .union(OpenFlags::CREATE)
        .union(OpenFlags::FILE);
    const CREATE_DIR: OpenFlags = OpenFlags::READ
        .union(OpenFlags::WRITE)
        .union(OpenFlags::CREATE)
        .union(OpenFlags::DIRECTORY);

    fn mounted(opts: FormatOptions, size: usize) -> FatVolume {
        let dev = Arc::new(MemoryDevice::new(size));
        format_volume(dev.as_ref(), &opts).unwrap();
        FatVolume::mount(dev, MountOptions::default()).unwrap()
    }

    fn fat32() -> FatVolume {
        mounted(FormatOptions::fat32(1), 8 << 20)
    }

    #[test]
    fn test_open_nested_path() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let a = vol.open(&root, "a", CREATE_DIR).unwrap();
        let b = vol.open(&a, "b", CREATE_DIR).unwrap();
        let f = vol.open(&b, "f.txt", CREATE_FILE).unwrap();
        vol.write(&f, 0, b"nested").unwrap();
        vol.close(f).unwrap();

        let again = vol.open(&root, "a/b/f.txt", OpenFlags::READ).unwrap();
        assert_eq!(vol.node_info(&again).unwrap().size, 6);
        let up = vol.open(&b, "../..", OpenFlags::READ).unwrap();
        assert!(up.same_node(&root));
        let same = vol.open(&root, "/a//b/", OpenFlags::READ).unwrap();
        assert!(same.same_node(&b));
        for node in [again, up, same, b, a, root] {
            vol.close(node).unwrap();
        }
    }

    #[test]
    fn test_open_errors() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let f = vol.open(&root, "f", CREATE_FILE).unwrap();
        let d = vol.open(&root, "d", CREATE_DIR).unwrap();

        assert!(matches!(vol.open(&root, "missing", OpenFlags::READ), Err(FatError::NotFound(_))));
        assert!(matches!(
            vol.open(&root, "f", CREATE_FILE | OpenFlags::EXCLUSIVE),
            Err(FatError::AlreadyExists(_))
        ));
        assert!(matches!(
            vol.open(&root, "f", OpenFlags::READ | OpenFlags::DIRECTORY),
            Err(FatError::NotADir(_))
        ));
        assert!(matches!(
            vol.open(&root, "d", OpenFlags::READ | OpenFlags::FILE),
            Err(FatError::NotAFile(_))
        ));
        assert!(matches!(vol.open(&root, "f/x", OpenFlags::READ), Err(FatError::NotADir(_))));
        assert!(matches!(
            vol.open(&root, "f", OpenFlags::READ | OpenFlags::TRUNCATE),
            Err(FatError::Permission(_))
        ));
        assert!(matches!(
            vol.open(&root, "new", OpenFlags::READ | OpenFlags::CREATE | OpenFlags::FILE),
            Err(FatError::Permission(_))
        ));
        assert!(matches!(
            vol.open(&root, "new", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE),
            Err(FatError::InvalidArgs(_))
        ));
        assert!(matches!(
            vol.open(&root, ".", OpenFlags::READ | OpenFlags::CREATE),
            Err(FatError::InvalidArgs(_))
        ));
        assert!(matches!(vol.open(&root, "..", OpenFlags::WRITE), Err(FatError::Permission(_))));
        assert!(matches!(vol.open(&f, "x", OpenFlags::READ), Err(FatError::NotADir(_))));
        for node in [f, d, root] {
            vol.close(node).unwrap();
        }
    }

    #[test]
    fn test_truncate_on_open() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let f = vol.open(&root, "t", CREATE_FILE).unwrap();
        vol.write(&f, 0, &[1u8; 3000]).unwrap();
        vol.close(f).unwrap();

        let f = vol
            .open(&root, "t", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::TRUNCATE)
            .unwrap();
        let info = vol.node_info(&f).unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.start_cluster, 0);
        vol.close(f).unwrap();
        assert_eq!(vol.codec.lookup(0, "t").unwrap().0.size, 0);
    }

    #[test]
    fn test_file_node_shared_and_released() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let a = vol.open(&root, "shared", CREATE_FILE).unwrap();
        let b = vol.open(&root, "shared", OpenFlags::READ).unwrap();
        assert!(a.same_node(&b));
        vol.close(a).unwrap();
        vol.close(b).unwrap();
        let Node::Directory(dir) = &root else { unreachable!() };
        assert!(dir.lock().children.is_empty());
        vol.close(root).unwrap();
    }

    #[test]
    fn test_directory_evicted_after_last_close() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let d = vol.open(&root, "d", CREATE_DIR).unwrap();
        let Node::Directory(node) = &d else { unreachable!() };
        let id = node.id();
        assert_eq!(node.refs(), 1);
        vol.close(d).unwrap();
        assert!(vol.dcache.peek(id).is_none());
        // Root stays pinned.
        assert!(vol.dcache.peek(NodeId::ROOT).is_some());
        vol.close(root).unwrap();
    }

    #[test]
    fn test_unlink_rules() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let d = vol.open(&root, "d", CREATE_DIR).unwrap();
        let inner = vol.open(&d, "inner", CREATE_FILE).unwrap();
        vol.close(inner).unwrap();

        let entry = vol.codec.lookup(0, "d").unwrap();
        assert!(matches!(vol.unlink(&root, "d"), Err(FatError::IsActive(_))));
        assert_eq!(vol.codec.lookup(0, "d").unwrap(), entry);
        vol.close(d).unwrap();
        assert!(matches!(vol.unlink(&root, "d"), Err(FatError::NotEmpty(_))));
        assert_eq!(vol.codec.lookup(0, "d").unwrap(), entry);
        assert_eq!(vol.codec.lookup(entry.0.start_cluster, "inner").unwrap().1, 2);
        assert!(matches!(vol.unlink(&root, "."), Err(FatError::IsActive(_))));
        assert!(matches!(vol.unlink(&root, "nope"), Err(FatError::NotFound(_))));

        let free = vol.stat().unwrap().free_clusters;
        let d = vol.open(&root, "d", OpenFlags::READ).unwrap();
        vol.unlink(&d, "inner").unwrap();
        vol.close(d).unwrap();
        vol.unlink(&root, "d").unwrap();
        assert_eq!(vol.stat().unwrap().free_clusters, free + 1);
        assert!(vol.read_dir(&root).unwrap().is_empty());
        vol.close(root).unwrap();
    }

    #[test]
    fn test_unlinked_open_file_released_on_close() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let free = vol.stat().unwrap().free_clusters;
        let f = vol.open(&root, "ghost", CREATE_FILE).unwrap();
        vol.write(&f, 0, &[7u8; 1500]).unwrap();
        vol.unlink(&root, "ghost").unwrap();

        assert!(matches!(vol.open(&root, "ghost", OpenFlags::READ), Err(FatError::NotFound(_))));
        let mut buf = [0u8; 1500];
        assert_eq!(vol.read(&f, 0, &mut buf).unwrap(), 1500);
        assert!(buf.iter().all(|&b| b == 7));
        assert_eq!(vol.stat().unwrap().free_clusters, free - 3);

        vol.close(f).unwrap();
        assert_eq!(vol.stat().unwrap().free_clusters, free);
        vol.close(root).unwrap();
    }

    #[test]
    fn test_rename_within_and_across_directories() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let a = vol.open(&root, "a", CREATE_DIR).unwrap();
        let b = vol.open(&root, "b", CREATE_DIR).unwrap();
        let f = vol.open(&a, "f", CREATE_FILE).unwrap();
        vol.write(&f, 0, b"payload").unwrap();

        vol.rename(&a, "f", &a, "g").unwrap();
        vol.rename(&a, "g", &b, "h").unwrap();
        assert!(matches!(vol.open(&a, "g", OpenFlags::READ), Err(FatError::NotFound(_))));
        // The open handle follows the entry.
        vol.write(&f, 7, b"!").unwrap();
        vol.close(f).unwrap();
        let h = vol.open(&b, "h", OpenFlags::READ).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vol.read(&h, 0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"payload!");
        vol.close(h).unwrap();

        // Directory move rewrites '..'.
        vol.rename(&root, "a", &b, "a2").unwrap();
        let up = vol.open(&b, "a2/..", OpenFlags::READ).unwrap();
        assert!(up.same_node(&b));
        for node in [up, a, b, root] {
            vol.close(node).unwrap();
        }
    }

    #[test]
    fn test_rename_rejections() {
        let vol = fat32();
        let root = vol.root().unwrap();
        let a = vol.open(&root, "a", CREATE_DIR).unwrap();
        let sub = vol.open(&a, "sub", CREATE_DIR).unwrap();
        let f = vol.open(&root, "f", CREATE_FILE).unwrap();
        let a_entry = vol.codec.lookup(0, "a").unwrap();
        let a_parent = vol.codec.parent_of(a_entry.0.start_cluster).unwrap();

        assert!(matches!(vol.rename(&root, "a", &sub, "x"), Err(FatError::InvalidArgs(_))));
        assert!(matches!(vol.rename(&root, "a", &a, "x"), Err(FatError::InvalidArgs(_))));
        // Cycle rejection leaves both ends untouched.
        assert_eq!(vol.codec.lookup(0, "a").unwrap(), a_entry);
        assert_eq!(vol.codec.parent_of(a_entry.0.start_cluster).unwrap(), a_parent);
        assert!(matches!(vol.codec.lookup(a_entry.0.start_cluster, "x"), Err(FatError::NotFound(_))));
        assert!(matches!(vol.rename(&root, "f", &root, "F"), Err(FatError::InvalidArgs(_))));
        assert!(matches!(vol.rename(&root, ".", &root, "x"), Err(FatError::InvalidArgs(_))));
        assert!(matches!(vol.rename(&root, "f", &root, "a"), Err(FatError::NotAFile(_))));
        assert!(matches!(vol.rename(&root, "a", &root, "f"), Err(FatError::NotADir(_))));
        assert!(matches!(vol.rename(&root, "zz", &root, "x"), Err(FatError::NotFound(_))));
        for node in [f, sub, a, root] {
            vol.close(node).unwrap();
        }
    }

    #[test]
    fn test_rename_replaces_file() {
        let vol = fat32();
        let root = vol.root().unwrap();
        for (name, data) in [("old", &b"old data"[..]), ("new", &b"new"[..])] {
            let f = vol.open(&root, name, CREATE_FILE).unwrap();
            vol.write(&f, 0, data).unwrap();
            vol.close(f).unwrap();
        }
        let free = vol.stat().unwrap().free_clusters;
        vol.rename(&root, "new", &root, "old").unwrap();
        assert_eq!(vol.stat().unwrap().free_clusters, free + 1);
        let listed = vol.read_dir(&root).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "OLD");
        assert_eq!(listed[0].size, 3);
        vol.close(root).unwrap();
    }

    #[test]
    fn test_concurrent_creates_in_one_directory() {
        let vol = Arc::new(fat32());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let vol = vol.clone();
                thread::spawn(move || {
                    let root = vol.root().unwrap();
                    for i in 0..10 {
                        let f = vol.open(&root, &format!("t{t}f{i}"), CREATE_FILE).unwrap();
                        vol.write(&f, 0, &[t as u8; 600]).unwrap();
                        vol.close(f).unwrap();
                    }
                    vol.close(root).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let root = vol.root().unwrap();
        let listed = vol.read_dir(&root).unwrap();
        assert_eq!(listed.len(), 80);
        assert!(listed.iter().all(|e| e.size == 600));
        vol.close(root).unwrap();
    }
}
