//! Black-box scenarios against `MemoryBackend`, exercising the crate only
//! through its public API (no internal modules).

use rand::RngCore;

use fat_engine::backend::{DiskWindow, MemoryBackend};
use fat_engine::error::Error;
use fat_engine::fs::{FormatOptions, MountOptions};
use fat_engine::{Backend, Filesystem, OpenFlags, SeekFrom};

fn window_for(backend: &MemoryBackend) -> DiskWindow {
    DiskWindow::whole_backend(backend.size(), 512)
}

/// Scenario 1: format, write, close, remount, read back.
#[test]
fn format_write_remount_read_back() {
    let backend = MemoryBackend::new(10 * 1024 * 1024);
    let window = window_for(&backend);
    let opts = FormatOptions {
        volume_label: *b"TEST512    ",
        ..FormatOptions::default()
    };
    let mut fs = Filesystem::format(backend, window, opts).unwrap();

    let mut h = fs.open("greeting.txt", OpenFlags::create_write()).unwrap();
    fs.write(&mut h, b"hello, disk").unwrap();
    fs.close(h).unwrap();
    fs.sync().unwrap();

    let bytes = fs.into_backend().into_vec();

    let remounted_backend = MemoryBackend::from_vec(bytes);
    let window = window_for(&remounted_backend);
    let mut fs = Filesystem::mount(remounted_backend, window, MountOptions::default()).unwrap();

    assert_eq!(fs.label(), "TEST512");
    let mut h = fs.open("greeting.txt", OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; h.len() as usize];
    fs.read(&mut h, &mut buf).unwrap();
    assert_eq!(&buf, b"hello, disk");
}

/// Scenario 2: a file spanning many small clusters exposes the expected
/// cluster chain length and a coalesced disk-range view.
#[test]
fn cross_cluster_file_reports_its_chain() {
    let backend = MemoryBackend::new(10 * 1024 * 1024);
    let window = window_for(&backend);
    let opts = FormatOptions {
        sectors_per_cluster: Some(1), // 512-byte clusters
        ..FormatOptions::default()
    };
    let mut fs = Filesystem::format(backend, window, opts).unwrap();
    assert_eq!(fs.bytes_per_cluster(), 512);

    let mut payload = vec![0u8; 5142];
    rand::thread_rng().fill_bytes(&mut payload);
    let mut h = fs.open("spread.bin", OpenFlags::create_write()).unwrap();
    fs.write(&mut h, &payload).unwrap();

    let chain = fs.cluster_chain(&h).unwrap();
    assert_eq!(chain.len(), 11); // ceil(5142 / 512)

    let ranges = fs.disk_ranges(&h).unwrap();
    let total: u64 = ranges.iter().map(|(_, len)| *len).sum();
    assert_eq!(total, chain.len() as u64 * 512);

    fs.close(h).unwrap();
    let mut h = fs.open("spread.bin", OpenFlags::read_only()).unwrap();
    let mut buf = vec![0u8; payload.len()];
    fs.read(&mut h, &mut buf).unwrap();
    assert_eq!(buf, payload);
}

/// Scenario 3: a write that would push a file past the 4 GiB FAT size
/// ceiling is rejected before touching any cluster, leaving the file's
/// size unchanged. The check is pure offset arithmetic, so a small image
/// is enough to exercise it.
#[test]
fn write_past_four_gib_ceiling_leaves_size_unchanged() {
    let backend = MemoryBackend::new(2 * 1024 * 1024);
    let window = window_for(&backend);
    let mut fs = Filesystem::format(backend, window, FormatOptions::default()).unwrap();

    let mut h = fs.open("huge.bin", OpenFlags::create_write()).unwrap();
    h.seek(SeekFrom::Start((1u64 << 32) - 10)).unwrap();
    let len_before = h.len();
    let err = fs.write(&mut h, &[0u8; 100]).unwrap_err();
    assert!(matches!(err, Error::FileTooLarge));
    assert_eq!(h.len(), len_before);
}

/// Scenario 4: a long-filename entry renamed down to a short name keeps
/// its content and is visible under the new name only.
#[test]
fn rename_from_long_to_short_name_preserves_content() {
    let backend = MemoryBackend::new(10 * 1024 * 1024);
    let window = window_for(&backend);
    let mut fs = Filesystem::format(backend, window, FormatOptions::default()).unwrap();

    let long_name = format!("{}.txt", "a".repeat(250));
    let mut h = fs.open(&long_name, OpenFlags::create_write()).unwrap();
    fs.write(&mut h, b"orig").unwrap();
    fs.close(h).unwrap();

    fs.rename(&long_name, "new.txt").unwrap();

    let entries = fs.read_dir("/").unwrap();
    assert!(entries.iter().all(|e| e.display_name() != long_name));
    assert!(entries.iter().any(|e| e.display_name() == "new.txt"));

    let mut h = fs.open("new.txt", OpenFlags::read_only()).unwrap();
    let mut buf = [0u8; 4];
    fs.read(&mut h, &mut buf).unwrap();
    assert_eq!(&buf, b"orig");
}

/// Scenario 5: case-insensitive, idempotent directory creation.
#[test]
fn mkdir_is_case_insensitive_and_idempotent() {
    let backend = MemoryBackend::new(10 * 1024 * 1024);
    let window = window_for(&backend);
    let mut fs = Filesystem::format(backend, window, FormatOptions::default()).unwrap();

    fs.mkdir("EFI/BOOT").unwrap();
    fs.mkdir("efi/boot").unwrap();

    let entries = fs.read_dir("/").unwrap();
    assert_eq!(
        entries.iter().filter(|e| e.display_name().eq_ignore_ascii_case("efi")).count(),
        1
    );
}

/// Scenario 6: two images formatted with the same reproducibility inputs
/// are byte-identical, and every entry's timestamp matches the forced
/// epoch.
#[test]
fn reproducible_format_is_byte_identical() {
    std::env::remove_var("SOURCE_DATE_EPOCH");
    let opts = || FormatOptions {
        volume_label: *b"REPRO      ",
        reproducible: true,
        source_date_epoch: Some(1_609_459_200),
        ..FormatOptions::default()
    };

    let make = || {
        let backend = MemoryBackend::new(10 * 1024 * 1024);
        let window = window_for(&backend);
        let mut fs = Filesystem::format(backend, window, opts()).unwrap();
        let mut h = fs.open("a.txt", OpenFlags::create_write()).unwrap();
        fs.write(&mut h, b"reproducible").unwrap();
        fs.close(h).unwrap();
        fs.sync().unwrap();
        fs.into_backend().into_vec()
    };

    let first = make();
    let second = make();
    assert_eq!(first, second);

    let backend = MemoryBackend::from_vec(first);
    let window = window_for(&backend);
    let mut fs = Filesystem::mount(backend, window, MountOptions::default()).unwrap();
    let entry = fs
        .read_dir("/")
        .unwrap()
        .into_iter()
        .find(|e| e.display_name() == "a.txt")
        .unwrap();
    assert_eq!(entry.modified.year(), 2021);
    assert_eq!(entry.modified.month(), 1);
    assert_eq!(entry.modified.day(), 1);
}
