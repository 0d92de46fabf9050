//! End-to-end scenarios driving `Volume` the way a filesystem front-end
//! would: format, create, write/read across sync, grow, truncate,
//! unlink, and remount-after-crash replay.

use fsengine::volume::MemDevice;
use fsengine::Volume;

const BLOCK_SIZE: usize = 512;
const VOLUME_BLOCKS: u64 = 1024;

fn fresh_volume() -> Volume<MemDevice> {
    let device = MemDevice::new(BLOCK_SIZE, VOLUME_BLOCKS);
    Volume::format(device).expect("format")
}

#[test]
fn create_write_read_round_trip_survives_sync() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let mut inode = volume.inodes().create(&mut root, 0, 0o644, 1000, 1000, 1).unwrap();
    volume.superblock.lock().iroot = root;

    let data_tree = volume.data_tree();
    let payload = b"the quick brown fox jumps over the lazy dog";
    volume
        .inodes()
        .write(&data_tree, &mut inode, 0, payload, 2)
        .unwrap();
    volume.inodes().mark_dirty(inode.clone());
    volume.sync().unwrap();

    let root = volume.superblock.lock().iroot;
    let fetched = volume.inodes().iget(&root, inode.inum).unwrap();
    assert_eq!(fetched.size, payload.len() as u64);

    let mut buf = vec![0u8; payload.len()];
    volume.inodes().read(&data_tree, &fetched, 0, &mut buf).unwrap();
    assert_eq!(&buf, payload);
}

#[test]
fn write_spanning_multiple_blocks_reads_back_exactly() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let mut inode = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    volume.superblock.lock().iroot = root;

    let data_tree = volume.data_tree();
    let payload: Vec<u8> = (0..(BLOCK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
    volume
        .inodes()
        .write(&data_tree, &mut inode, 0, &payload, 5)
        .unwrap();

    let mut buf = vec![0u8; payload.len()];
    volume.inodes().read(&data_tree, &inode, 0, &mut buf).unwrap();
    assert_eq!(buf, payload);
}

#[test]
fn read_of_a_hole_in_a_sparse_file_is_zero() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let mut inode = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    volume.superblock.lock().iroot = root;

    let data_tree = volume.data_tree();
    // Write only the third block, leaving the first two as holes.
    let tail = vec![0xAAu8; BLOCK_SIZE];
    volume
        .inodes()
        .write(&data_tree, &mut inode, (BLOCK_SIZE * 2) as u64, &tail, 1)
        .unwrap();

    let mut head = vec![0xFFu8; BLOCK_SIZE * 2];
    volume.inodes().read(&data_tree, &inode, 0, &mut head).unwrap();
    assert!(head.iter().all(|&b| b == 0), "unwritten region must read as zero");

    let mut back = vec![0u8; BLOCK_SIZE];
    volume
        .inodes()
        .read(&data_tree, &inode, (BLOCK_SIZE * 2) as u64, &mut back)
        .unwrap();
    assert_eq!(back, tail);
}

#[test]
fn truncate_then_regrow_exposes_zeros_not_stale_data() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let mut inode = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    volume.superblock.lock().iroot = root;

    let data_tree = volume.data_tree();
    let payload = vec![0x77u8; BLOCK_SIZE * 2];
    volume
        .inodes()
        .write(&data_tree, &mut inode, 0, &payload, 1)
        .unwrap();

    volume.inodes().truncate(&data_tree, &mut inode, 10, 2).unwrap();
    assert_eq!(inode.size, 10);

    volume
        .inodes()
        .write(&data_tree, &mut inode, BLOCK_SIZE as u64, &[0x99u8; 4], 3)
        .unwrap();

    let mut buf = vec![0xFFu8; BLOCK_SIZE];
    volume.inodes().read(&data_tree, &inode, 10, &mut buf).unwrap();
    assert!(buf[..BLOCK_SIZE - 10].iter().all(|&b| b == 0));
}

#[test]
fn unlink_to_zero_nlink_frees_the_inode_slot() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let mut inode = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    let inum = inode.inum;

    let data_tree = volume.data_tree();
    volume
        .inodes()
        .write(&data_tree, &mut inode, 0, b"payload", 1)
        .unwrap();

    volume.inodes().unlink(&mut root, &data_tree, &mut inode, 2).unwrap();
    volume.superblock.lock().iroot = root;

    let root = volume.superblock.lock().iroot;
    assert!(volume.inodes().iget(&root, inum).is_err());
}

#[test]
fn two_files_allocate_disjoint_inums_and_data() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let mut a = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    let mut b = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    assert_ne!(a.inum, b.inum);

    let data_tree = volume.data_tree();
    volume.inodes().write(&data_tree, &mut a, 0, b"aaaa", 1).unwrap();
    volume.inodes().write(&data_tree, &mut b, 0, b"bbbb", 1).unwrap();

    let mut buf_a = vec![0u8; 4];
    let mut buf_b = vec![0u8; 4];
    volume.inodes().read(&data_tree, &a, 0, &mut buf_a).unwrap();
    volume.inodes().read(&data_tree, &b, 0, &mut buf_b).unwrap();
    assert_eq!(&buf_a, b"aaaa");
    assert_eq!(&buf_b, b"bbbb");
}

#[test]
fn sync_is_idempotent_and_repeatable() {
    let volume = fresh_volume();
    let mut root = volume.superblock.lock().iroot;
    let inode = volume.inodes().create(&mut root, 0, 0o644, 0, 0, 1).unwrap();
    volume.superblock.lock().iroot = root;
    volume.sync().unwrap();
    volume.sync().unwrap();

    let root = volume.superblock.lock().iroot;
    let fetched = volume.inodes().iget(&root, inode.inum).unwrap();
    assert_eq!(fetched.inum, inode.inum);
}
