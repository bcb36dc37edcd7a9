use clap::{App, Arg};
use minix_fs::{BlockDevice, FsError, Inode, MinixFileSystem};
use std::fs::{read_dir, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

const BLOCK_SZ: usize = 512;
/// 32 MiB
const DEFAULT_BLOCKS: usize = 64 * 1024;
const DEFAULT_INODES: u32 = 4096;

struct BlockFile(Mutex<File>);

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.read(buf).unwrap(), BLOCK_SZ, "Not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SZ) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.write(buf).unwrap(), BLOCK_SZ, "Not a complete block!");
    }
}

fn fs_error(err: FsError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

fn main() {
    minix_fs_pack().expect("Error when packing minix-fs!");
}

fn minix_fs_pack() -> io::Result<()> {
    let matches = App::new("Minix v3 FileSystem packer")
        .arg(
            Arg::with_name("source")
                .short("s")
                .long("source")
                .takes_value(true)
                .required(true)
                .help("Directory tree copied into the image"),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .long("target")
                .takes_value(true)
                .required(true)
                .help("Image file to create"),
        )
        .arg(
            Arg::with_name("blocks")
                .short("b")
                .long("blocks")
                .takes_value(true)
                .help("Image size in 512-byte blocks"),
        )
        .arg(
            Arg::with_name("inodes")
                .short("i")
                .long("inodes")
                .takes_value(true)
                .help("Number of inodes"),
        )
        .get_matches();
    let src_path = matches.value_of("source").unwrap();
    let target_path = matches.value_of("target").unwrap();
    let blocks = match matches.value_of("blocks") {
        Some(blocks) => blocks
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad --blocks"))?,
        None => DEFAULT_BLOCKS,
    };
    let inodes = match matches.value_of("inodes") {
        Some(inodes) => inodes
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad --inodes"))?,
        None => DEFAULT_INODES,
    };
    println!("src_path = {}\ntarget_path = {}", src_path, target_path);
    pack(Path::new(src_path), Path::new(target_path), blocks, inodes)
}

/// Format `image` and copy the tree under `src` into it
fn pack(src: &Path, image: &Path, blocks: usize, inodes: u32) -> io::Result<()> {
    let block_file = Arc::new(BlockFile(Mutex::new({
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(image)?;
        f.set_len((blocks * BLOCK_SZ) as u64)?;
        f
    })));
    let fs = MinixFileSystem::format(block_file, blocks, inodes, 0).map_err(fs_error)?;
    let root_inode = MinixFileSystem::root_inode(&fs).map_err(fs_error)?;
    copy_dir(src, &root_inode)?;
    fs.unmount();
    let stat = fs.statfs();
    println!(
        "{} of {} zones, {} of {} inodes in use",
        stat.total_zones - stat.free_zones,
        stat.total_zones,
        stat.total_inodes - stat.free_inodes,
        stat.total_inodes
    );
    Ok(())
}

fn copy_dir(src: &Path, dir: &Inode) -> io::Result<()> {
    for dir_entry in read_dir(src)? {
        let dir_entry = dir_entry?;
        let name = dir_entry.file_name().into_string().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "non UTF-8 file name")
        })?;
        let file_type = dir_entry.file_type()?;
        if file_type.is_dir() {
            let sub_dir = dir.mkdir(&name).map_err(fs_error)?;
            copy_dir(&dir_entry.path(), &sub_dir)?;
        } else if file_type.is_file() {
            let mut host_file = File::open(dir_entry.path())?;
            let mut all_data: Vec<u8> = Vec::new();
            host_file.read_to_end(&mut all_data)?;
            let inode = dir.create(&name).map_err(fs_error)?;
            let written = inode.write_at(0, all_data.as_slice()).map_err(fs_error)?;
            if written != all_data.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("{}: image full", name),
                ));
            }
        } else {
            println!("skipping {}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
fn image_file(name: &str, blocks: usize) -> io::Result<Arc<BlockFile>> {
    let path = std::env::temp_dir().join(name);
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    f.set_len((blocks * BLOCK_SZ) as u64)?;
    Ok(Arc::new(BlockFile(Mutex::new(f))))
}

#[test]
fn minix_fs_test() -> io::Result<()> {
    use minix_fs::{open_file, OpenFlags};

    let block_file = image_file("minix_fs_test.img", 8192)?;
    let fs = MinixFileSystem::format(block_file.clone(), 8192, 256, 0).map_err(fs_error)?;
    let root_inode = MinixFileSystem::root_inode(&fs).map_err(fs_error)?;
    root_inode.create("filea").map_err(fs_error)?;
    root_inode.create("fileb").map_err(fs_error)?;
    for name in root_inode.ls().map_err(fs_error)? {
        println!("{}", name);
    }
    let filea = root_inode.find("filea").map_err(fs_error)?;
    let greet_str = "Hello, world!";
    filea.write_at(0, greet_str.as_bytes()).map_err(fs_error)?;
    let mut buffer = [0u8; 233];
    let len = filea.read_at(0, &mut buffer).map_err(fs_error)?;
    assert_eq!(greet_str, core::str::from_utf8(&buffer[..len]).unwrap());

    let mut random_str_test = |len: usize| {
        filea.clear().unwrap();
        assert_eq!(filea.read_at(0, &mut buffer).unwrap(), 0);
        let mut str = String::new();
        // random digit
        for _ in 0..len {
            str.push(char::from('0' as u8 + rand::random::<u8>() % 10));
        }
        filea.write_at(0, str.as_bytes()).unwrap();
        let mut read_buffer = [0u8; 127];
        let mut offset = 0u64;
        let mut read_str = String::new();
        loop {
            let len = filea.read_at(offset, &mut read_buffer).unwrap();
            if len == 0 {
                break;
            }
            offset += len as u64;
            read_str.push_str(core::str::from_utf8(&read_buffer[..len]).unwrap());
        }
        assert_eq!(str, read_str);
    };

    random_str_test(4 * BLOCK_SZ);
    random_str_test(8 * BLOCK_SZ + BLOCK_SZ / 2);
    random_str_test(100 * BLOCK_SZ);
    random_str_test(70 * BLOCK_SZ + BLOCK_SZ / 7);
    random_str_test((12 + 128) * BLOCK_SZ);
    random_str_test(400 * BLOCK_SZ);
    random_str_test(1000 * BLOCK_SZ);
    random_str_test(2000 * BLOCK_SZ);

    let file = open_file(&root_inode, "fileb", OpenFlags::RDWR).map_err(fs_error)?;
    file.write(b"persisted").map_err(fs_error)?;
    file.close().map_err(fs_error)?;
    fs.unmount();
    drop((root_inode, filea, fs));

    let fs = MinixFileSystem::mount(block_file).map_err(fs_error)?;
    let root_inode = MinixFileSystem::root_inode(&fs).map_err(fs_error)?;
    let file = open_file(&root_inode, "fileb", OpenFlags::RDONLY).map_err(fs_error)?;
    assert_eq!(file.read_all().map_err(fs_error)?, b"persisted");
    Ok(())
}

#[test]
fn pack_test() -> io::Result<()> {
    use rand::Rng;

    let src = std::env::temp_dir().join("minix_pack_test_src");
    let _ = std::fs::remove_dir_all(&src);
    std::fs::create_dir_all(src.join("bin/sub"))?;
    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..40_000).map(|_| rng.gen()).collect();
    std::fs::write(src.join("bin/app"), &payload)?;
    std::fs::write(src.join("README"), b"readme")?;
    std::fs::write(src.join("bin/sub/empty"), b"")?;

    let image = std::env::temp_dir().join("minix_pack_test.img");
    pack(&src, &image, 4096, 128)?;

    let block_file = Arc::new(BlockFile(Mutex::new(
        OpenOptions::new().read(true).write(true).open(&image)?,
    )));
    let fs = MinixFileSystem::mount(block_file).map_err(fs_error)?;
    let root_inode = MinixFileSystem::root_inode(&fs).map_err(fs_error)?;
    let app = root_inode.find_path("bin/app").map_err(fs_error)?;
    let mut data = vec![0u8; payload.len() + 10];
    assert_eq!(app.read_at(0, &mut data).map_err(fs_error)?, payload.len());
    assert_eq!(&data[..payload.len()], payload.as_slice());
    assert_eq!(
        root_inode.find_path("bin/sub/empty").map_err(fs_error)?.size().map_err(fs_error)?,
        0
    );
    let mut names = root_inode.ls().map_err(fs_error)?;
    names.sort();
    assert_eq!(names, [".", "..", "README", "bin"]);
    Ok(())
}
