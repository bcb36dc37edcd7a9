use super::{
    block_cache_sync_all, BlockDevice, DirOp, FsError, FsResult, InodeMode, MinixFileSystem,
    Vnode, VnodeInner,
};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// The state of a inode(file)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// inode number
    pub ino: u64,
    /// file type and mode
    pub mode: InodeMode,
    /// number of hard links
    pub nlink: u32,
    /// owner
    pub uid: u16,
    /// group
    pub gid: u16,
    /// byte size
    pub size: u64,
    /// device number of a device node, 0 otherwise
    pub rdev: u32,
    /// last modification
    pub mtime: u32,
}

/// Virtual filesystem layer over minix-fs
#[derive(Clone)]
pub struct Inode {
    vnode: Arc<Vnode>,
    fs: Arc<MinixFileSystem>,
}

impl Inode {
    /// Create a vfs inode
    pub fn new(vnode: Arc<Vnode>, fs: Arc<MinixFileSystem>) -> Self {
        Self { vnode, fs }
    }

    /// Inode number
    pub fn inode_number(&self) -> u32 {
        self.vnode.number()
    }

    /// The file system this inode lives on
    pub fn fs(&self) -> &Arc<MinixFileSystem> {
        &self.fs
    }

    fn wrap(&self, vnode: Arc<Vnode>) -> Arc<Inode> {
        Arc::new(Self::new(vnode, Arc::clone(&self.fs)))
    }

    /// Find inode under current inode by name
    pub fn find(&self, name: &str) -> FsResult<Arc<Inode>> {
        let number = self
            .fs
            .dir_scan(&self.vnode, name, DirOp::Lookup)?
            .ok_or(FsError::NotFound)?;
        Ok(self.wrap(self.fs.get_vnode(number)?))
    }

    /// Walk a slash separated path; empty components are skipped
    pub fn find_path(&self, path: &str) -> FsResult<Arc<Inode>> {
        let mut inode = Arc::new(self.clone());
        for name in path.split('/').filter(|name| !name.is_empty()) {
            inode = inode.find(name)?;
        }
        Ok(inode)
    }

    /// Create a regular file under current inode
    pub fn create(&self, name: &str) -> FsResult<Arc<Inode>> {
        self.mknod(name, InodeMode::FILE | InodeMode::from_bits_truncate(0o644), 0)
    }

    /// Create a directory under current inode
    pub fn mkdir(&self, name: &str) -> FsResult<Arc<Inode>> {
        self.mknod(name, InodeMode::DIR | InodeMode::from_bits_truncate(0o755), 0)
    }

    /// Create an object of `mode` under current inode. Device nodes keep
    /// `devno` in their first zone slot.
    pub fn mknod(&self, name: &str, mode: InodeMode, devno: u32) -> FsResult<Arc<Inode>> {
        let file_type = mode.file_type();
        if file_type != InodeMode::FILE && !file_type.is_dir() && !file_type.is_device() {
            return Err(FsError::InvalidArgument);
        }
        let fs = &self.fs;
        let mut dir = self.vnode.lock();
        if fs.dir_scan_locked(&mut dir, name, DirOp::Lookup)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let is_dir = mode.is_dir();
        // the ".." entry of a new directory
        if is_dir {
            fs.link_inc(&mut dir)?;
        }
        let child = match fs.alloc_vnode(mode) {
            Ok(child) => child,
            Err(err) => {
                if is_dir {
                    dir.disk.nlinks -= 1;
                }
                return Err(err);
            }
        };

        let mut inner = child.lock();
        let filled = self.fill_node(&mut dir, &child, &mut inner, name, mode, devno);
        if let Err(err) = filled {
            if is_dir {
                dir.disk.nlinks -= 1;
            }
            if let Err(destroy_err) = fs.destroy(&child, &mut inner) {
                warn!("mknod: reclaiming inode {}: {}", child.number(), destroy_err);
            }
            return Err(err);
        }
        trace!("mknod {} -> inode {}", name, child.number());
        drop(inner);
        Ok(self.wrap(child))
    }

    /// Set up a fresh vnode and enter it into the locked directory
    fn fill_node(
        &self,
        dir: &mut VnodeInner,
        child: &Vnode,
        inner: &mut VnodeInner,
        name: &str,
        mode: InodeMode,
        devno: u32,
    ) -> FsResult<()> {
        inner.disk.nlinks = 1;
        if mode.is_device() {
            inner.disk.zone[0] = devno;
        }
        if mode.is_dir() {
            self.fs.dir_scan_locked(inner, ".", DirOp::Add(child.number()))?;
            self.fs.dir_scan_locked(inner, "..", DirOp::Add(self.vnode.number()))?;
            inner.disk.nlinks = 2;
        }
        self.fs.dir_scan_locked(dir, name, DirOp::Add(child.number()))?;
        Ok(())
    }

    /// Add a directory entry `name` for `target`, which may not be a directory
    pub fn link(&self, name: &str, target: &Inode) -> FsResult<()> {
        if !Arc::ptr_eq(&self.fs, &target.fs) {
            return Err(FsError::InvalidArgument);
        }
        let fs = &self.fs;
        let mut dir = self.vnode.lock();
        if fs.dir_scan_locked(&mut dir, name, DirOp::Lookup)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        if Arc::ptr_eq(&self.vnode, &target.vnode) {
            return Err(FsError::IsDirectory);
        }
        let mut inner = target.vnode.lock();
        inner.check_live()?;
        if inner.disk.is_dir() {
            return Err(FsError::IsDirectory);
        }
        fs.link_inc(&mut inner)?;
        if let Err(err) = fs.dir_scan_locked(&mut dir, name, DirOp::Add(target.inode_number())) {
            inner.disk.nlinks -= 1;
            return Err(err);
        }
        Ok(())
    }

    /// Remove the entry `name`. The object goes away with its last link;
    /// directories must be empty first.
    pub fn unlink(&self, name: &str) -> FsResult<()> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        let fs = &self.fs;
        let mut dir = self.vnode.lock();
        let number = fs
            .dir_scan_locked(&mut dir, name, DirOp::Lookup)?
            .ok_or(FsError::NotFound)?;
        let child = fs.get_vnode(number)?;
        if Arc::ptr_eq(&child, &self.vnode) {
            return Err(FsError::InvalidArgument);
        }
        let mut inner = child.lock();
        let is_dir = inner.disk.is_dir();
        if is_dir && fs.dir_scan_locked(&mut inner, "", DirOp::EmptyCheck)?.is_some() {
            return Err(FsError::NotEmpty);
        }
        fs.dir_scan_locked(&mut dir, name, DirOp::Remove)?;
        if is_dir {
            // its "." entry, and its ".." entry held on us
            inner.disk.nlinks = inner.disk.nlinks.saturating_sub(1);
            fs.link_dec(&self.vnode, &mut dir)?;
        }
        fs.link_dec(&child, &mut inner)
    }

    /// List inodes under current inode
    pub fn ls(&self) -> FsResult<Vec<String>> {
        let entries = self.fs.list_entries(&mut self.vnode.lock())?;
        Ok(entries.into_iter().map(|(name, _)| name).collect())
    }

    /// Read data from current inode
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let mut inner = self.vnode.lock();
        check_data(&inner, false)?;
        self.fs.read_vnode(&mut inner, offset, buf)
    }

    /// Write data to current inode
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> FsResult<usize> {
        let mut inner = self.vnode.lock();
        check_data(&inner, true)?;
        self.fs.write_vnode(&mut inner, offset, buf)
    }

    /// Set the size of current inode
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        let mut inner = self.vnode.lock();
        check_data(&inner, true)?;
        self.fs.truncate_locked(&mut inner, size)
    }

    /// Clear the data in current inode
    pub fn clear(&self) -> FsResult<()> {
        self.truncate(0)
    }

    /// Read stat from current inode
    pub fn stat(&self) -> FsResult<Stat> {
        let inner = self.vnode.lock();
        inner.check_live()?;
        let disk = &inner.disk;
        let mode = disk.mode();
        Ok(Stat {
            ino: self.vnode.number() as u64,
            mode,
            nlink: disk.nlinks as u32,
            uid: disk.uid,
            gid: disk.gid,
            size: disk.size as u64,
            rdev: if mode.is_device() { disk.zone[0] } else { 0 },
            mtime: disk.mtime,
        })
    }

    /// Byte size of current inode
    pub fn size(&self) -> FsResult<u64> {
        let inner = self.vnode.lock();
        inner.check_live()?;
        Ok(inner.disk.size as u64)
    }

    /// Whether current inode is a directory
    pub fn is_dir(&self) -> FsResult<bool> {
        let inner = self.vnode.lock();
        inner.check_live()?;
        Ok(inner.disk.is_dir())
    }

    /// Write current inode and every dirty block back
    pub fn sync(&self) -> FsResult<()> {
        let mut inner = self.vnode.lock();
        inner.check_live()?;
        self.fs.sync_vnode(&self.vnode, &mut inner);
        drop(inner);
        block_cache_sync_all();
        Ok(())
    }
}

/// Byte I/O only reaches files and, for reading, directories. A device node
/// keeps its device number in zone slot 0, not a zone.
fn check_data(inner: &VnodeInner, for_write: bool) -> FsResult<()> {
    inner.check_live()?;
    let mode = inner.disk.mode();
    if mode.is_device() {
        return Err(FsError::InvalidArgument);
    }
    if for_write && mode.is_dir() {
        return Err(FsError::IsDirectory);
    }
    Ok(())
}

/// A file system type a kernel mount layer can instantiate
pub trait FileSystemType {
    /// Name used in mount tables
    fn name(&self) -> &'static str;
    /// Open the file system on `device`
    fn mount(&self, device: Arc<dyn BlockDevice>) -> FsResult<Arc<MinixFileSystem>>;
    /// Root directory of a mounted instance
    fn get_root(&self, fs: &Arc<MinixFileSystem>) -> FsResult<Arc<Inode>>;
}

/// The Minix v3 file system type
pub struct Minix3;

impl FileSystemType for Minix3 {
    fn name(&self) -> &'static str {
        "minix3"
    }

    fn mount(&self, device: Arc<dyn BlockDevice>) -> FsResult<Arc<MinixFileSystem>> {
        MinixFileSystem::mount(device)
    }

    fn get_root(&self, fs: &Arc<MinixFileSystem>) -> FsResult<Arc<Inode>> {
        MinixFileSystem::root_inode(fs).map(Arc::new)
    }
}

/// Operations a kernel mount layer calls on a vnode
pub trait VnodeOps {
    /// Entry `name` of a directory
    fn lookup(&self, name: &str) -> FsResult<Arc<Inode>>;
    /// New object `name` in a directory
    fn mknod(&self, name: &str, mode: InodeMode, devno: u32) -> FsResult<Arc<Inode>>;
    /// New entry `name` in a directory for `target`
    fn link(&self, name: &str, target: &Inode) -> FsResult<()>;
    /// Drop entry `name` of a directory
    fn unlink(&self, name: &str) -> FsResult<()>;
    /// Metadata of the vnode
    fn stat(&self) -> FsResult<Stat>;
    /// Write the vnode back
    fn sync(&self) -> FsResult<()>;
    /// The caller is done with its handle
    fn free(self: Arc<Self>);
}

impl VnodeOps for Inode {
    fn lookup(&self, name: &str) -> FsResult<Arc<Inode>> {
        self.find(name)
    }

    fn mknod(&self, name: &str, mode: InodeMode, devno: u32) -> FsResult<Arc<Inode>> {
        Inode::mknod(self, name, mode, devno)
    }

    fn link(&self, name: &str, target: &Inode) -> FsResult<()> {
        Inode::link(self, name, target)
    }

    fn unlink(&self, name: &str) -> FsResult<()> {
        Inode::unlink(self, name)
    }

    fn stat(&self) -> FsResult<Stat> {
        Inode::stat(self)
    }

    fn sync(&self) -> FsResult<()> {
        Inode::sync(self)
    }

    fn free(self: Arc<Self>) {
        // other clones of the handle keep using the vnode
        if let Ok(inode) = Arc::try_unwrap(self) {
            inode.fs.release_vnode(inode.vnode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::MemBlockDevice;
    use crate::ROOT_INODE;

    fn setup(blocks: usize, inodes: u32) -> (Arc<dyn BlockDevice>, Arc<Inode>) {
        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(blocks);
        let fs = MinixFileSystem::format(Arc::clone(&device), blocks, inodes, 0).unwrap();
        let root = Minix3.get_root(&fs).unwrap();
        (device, root)
    }

    fn nlink(inode: &Inode) -> u32 {
        inode.stat().unwrap().nlink
    }

    #[test]
    fn nested_directories() {
        let (_, root) = setup(4096, 64);
        let usr = root.mkdir("usr").unwrap();
        let bin = usr.mkdir("bin").unwrap();
        bin.create("ls").unwrap().write_at(0, b"elf").unwrap();

        let ls = root.find_path("/usr/bin/ls").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(ls.read_at(0, &mut buf).unwrap(), 3);
        assert_eq!(ls.inode_number(), bin.find("ls").unwrap().inode_number());
        assert_eq!(root.find_path("usr//bin/").unwrap().inode_number(), bin.inode_number());
        assert_eq!(
            bin.find("..").unwrap().inode_number(),
            usr.inode_number()
        );
        assert_eq!(usr.find("..").unwrap().inode_number(), ROOT_INODE);
        assert_eq!(usr.ls().unwrap(), [".", "..", "bin"]);
        assert_eq!(root.find_path("usr/lib").err(), Some(FsError::NotFound));
        assert_eq!(ls.find("x").err(), Some(FsError::NotDirectory));
        assert_eq!(root.mkdir("usr").err(), Some(FsError::AlreadyExists));
    }

    #[test]
    fn directory_link_counts() {
        let (_, root) = setup(4096, 64);
        assert_eq!(nlink(&root), 2);
        let d = root.mkdir("d").unwrap();
        assert_eq!(nlink(&root), 3);
        assert_eq!(nlink(&d), 2);
        d.mkdir("e").unwrap();
        assert_eq!(nlink(&d), 3);

        assert_eq!(root.unlink("d"), Err(FsError::NotEmpty));
        d.unlink("e").unwrap();
        assert_eq!(nlink(&d), 2);
        root.unlink("d").unwrap();
        assert_eq!(nlink(&root), 2);
        assert_eq!(d.stat(), Err(FsError::Stale));
        assert_eq!(root.ls().unwrap(), [".", ".."]);

        assert_eq!(root.unlink("."), Err(FsError::InvalidArgument));
        assert_eq!(root.unlink(".."), Err(FsError::InvalidArgument));
        assert_eq!(root.unlink("d"), Err(FsError::NotFound));
    }

    #[test]
    fn hard_links() {
        let (_, root) = setup(4096, 64);
        let fs = Arc::clone(root.fs());
        let zones_before = fs.statfs().free_zones;
        let inodes_before = fs.statfs().free_inodes;

        let a = root.create("a").unwrap();
        a.write_at(0, &[7u8; 9000]).unwrap();
        root.link("b", &a).unwrap();
        assert_eq!(nlink(&a), 2);
        assert_eq!(root.link("b", &a), Err(FsError::AlreadyExists));
        let dir = root.mkdir("dir").unwrap();
        assert_eq!(root.link("c", &dir), Err(FsError::IsDirectory));
        root.unlink("dir").unwrap();

        root.unlink("a").unwrap();
        assert_eq!(nlink(&a), 1);
        let b = root.find("b").unwrap();
        assert_eq!(b.size().unwrap(), 9000);

        root.unlink("b").unwrap();
        assert_eq!(a.read_at(0, &mut [0u8; 4]), Err(FsError::Stale));
        assert_eq!(fs.statfs().free_zones, zones_before);
        assert_eq!(fs.statfs().free_inodes, inodes_before);
    }

    #[test]
    fn freed_inode_numbers_come_back() {
        let (_, root) = setup(1024, 8);
        // root holds inode 1
        let files: Vec<_> = (2..=8)
            .map(|i| root.create(&format!("f{}", i)).unwrap())
            .collect();
        assert_eq!(files[2].inode_number(), 4);
        assert_eq!(root.create("full").err(), Some(FsError::ResourceExhausted));
        assert_eq!(root.find("full").err(), Some(FsError::NotFound));

        root.unlink("f4").unwrap();
        assert_eq!(root.create("again").unwrap().inode_number(), 4);
    }

    #[test]
    fn device_nodes() {
        let (_, root) = setup(1024, 16);
        let tty = root.mknod("tty", InodeMode::CHAR, 0x0401).unwrap();
        let stat = tty.stat().unwrap();
        assert_eq!(stat.rdev, 0x0401);
        assert_eq!(stat.size, 0);
        assert!(stat.mode.is_device());
        let free = root.fs().statfs().free_zones;
        root.unlink("tty").unwrap();
        assert_eq!(root.fs().statfs().free_zones, free);
    }

    #[test]
    fn device_numbers_are_not_zones() {
        let (_, root) = setup(4096, 16);
        let fs = Arc::clone(root.fs());
        let victim = root.create("victim").unwrap();
        victim.write_at(0, &[0x11; 1024]).unwrap();
        let zone = victim.vnode.lock().disk.zone[0];

        // a device number that happens to name the victim's zone
        let tty = root.mknod("tty", InodeMode::CHAR, zone).unwrap();
        assert_eq!(tty.write_at(0, b"OOPS"), Err(FsError::InvalidArgument));
        assert_eq!(tty.read_at(0, &mut [0u8; 4]), Err(FsError::InvalidArgument));
        assert_eq!(tty.truncate(10), Err(FsError::InvalidArgument));
        assert_eq!(tty.size().unwrap(), 0);

        let free = fs.statfs().free_zones;
        root.unlink("tty").unwrap();
        assert_eq!(fs.statfs().free_zones, free);
        let mut buf = [0u8; 4];
        victim.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0x11; 4]);
    }

    #[test]
    fn mknod_takes_files_directories_and_devices_only() {
        let (_, root) = setup(1024, 16);
        let free = root.fs().statfs().free_inodes;
        for mode in [
            InodeMode::SYMLINK,
            InodeMode::FIFO,
            InodeMode::SOCKET,
            InodeMode::from_bits_truncate(0o644),
        ] {
            assert_eq!(root.mknod("x", mode, 0).err(), Some(FsError::InvalidArgument));
        }
        assert_eq!(root.fs().statfs().free_inodes, free);
        assert_eq!(root.find("x").err(), Some(FsError::NotFound));
        assert!(root.mknod("b", InodeMode::BLOCK, 0x0800).is_ok());
    }

    #[test]
    fn freed_handles_leave_one_vnode_per_inode() {
        let (_, root) = setup(1024, 16);
        let f = root.create("f").unwrap();
        let kept = Arc::clone(&f);
        f.free();
        // the clone still works on the cached vnode
        kept.write_at(0, b"hello").unwrap();
        let found = root.find("f").unwrap();
        assert!(Arc::ptr_eq(&found.vnode, &kept.vnode));
        assert_eq!(found.size().unwrap(), 5);

        let other = root.find("f").unwrap();
        kept.free();
        found.free();
        assert!(Arc::ptr_eq(&other.vnode, &root.find("f").unwrap().vnode));
        other.free();
        // written back before leaving the cache
        let again = root.find("f").unwrap();
        assert_eq!(again.size().unwrap(), 5);
        assert!(!again.vnode.lock().is_dirty());
    }

    #[test]
    fn survives_remount() {
        let (device, root) = setup(4096, 64);
        let docs = root.mkdir("docs").unwrap();
        let note = docs.create("note").unwrap();
        let text = b"minix three";
        note.write_at(2000, text).unwrap();
        root.fs().sync();
        drop((root, docs, note));

        let fs = Minix3.mount(device).unwrap();
        let root = Minix3.get_root(&fs).unwrap();
        let note = root.find_path("docs/note").unwrap();
        assert_eq!(note.size().unwrap(), 2000 + text.len() as u64);
        let mut buf = [0u8; 11];
        assert_eq!(note.read_at(2000, &mut buf).unwrap(), text.len());
        assert_eq!(&buf, text);
        assert_eq!(nlink(&root.find("docs").unwrap()), 2);
    }

    #[test]
    fn vnode_ops_dispatch() {
        let (_, root) = setup(1024, 16);
        let ops: &dyn VnodeOps = &*root;
        let f = ops.mknod("f", InodeMode::FILE, 0).unwrap();
        assert_eq!(ops.lookup("f").unwrap().inode_number(), f.inode_number());
        ops.link("g", &f).unwrap();
        assert_eq!(f.stat().unwrap().nlink, 2);
        ops.unlink("f").unwrap();
        ops.sync().unwrap();
        f.free();
        assert_eq!(ops.stat().unwrap().ino, ROOT_INODE as u64);
        assert_eq!(Minix3.name(), "minix3");
    }
}
