//! The estimator's core property: for archives of stored entries with
//! declared sizes, the predicted byte count equals the emitted byte count
//! exactly, across option combinations.

use std::io::Cursor;

use zipstream::{
    estimate_stream_size, ArchiveOptions, ArchiveSpec, EntryOptions, EntrySpec, ZipWriter,
};

struct EntryCase {
    name: &'static str,
    size: u64,
    directory: bool,
    options: EntryOptions,
}

fn entry(name: &'static str, size: u64) -> EntryCase {
    EntryCase {
        name,
        size,
        directory: false,
        options: EntryOptions {
            compression_level: Some(0),
            uncompressed_size: Some(size),
            ..EntryOptions::default()
        },
    }
}

fn directory(name: &'static str) -> EntryCase {
    EntryCase {
        name,
        size: 0,
        directory: true,
        options: EntryOptions::default(),
    }
}

/// Writes the archive and checks the post-hoc estimate, the pre-flight
/// estimate from specs, and the actual size all agree.
fn assert_exact(options: ArchiveOptions, entries: Vec<EntryCase>) {
    let specs: Vec<EntrySpec> = entries
        .iter()
        .map(|case| EntrySpec {
            name: case.name.to_string(),
            uncompressed_size: case.size,
            directory: case.directory,
            comment: case.options.comment.clone(),
            extended_timestamp: case.options.extended_timestamp,
            ntfs_timestamp: case.options.ntfs_timestamp,
            zip64: case.options.zip64,
            ..EntrySpec::default()
        })
        .collect();
    let pre_flight = estimate_stream_size(&ArchiveSpec {
        options: options.clone(),
        files: specs,
    })
    .unwrap();

    let mut zip = ZipWriter::new_with_options(Cursor::new(Vec::new()), options);
    for case in entries {
        if case.directory {
            zip.add_directory(case.name, case.options).unwrap();
        } else {
            let body = vec![0xa5u8; case.size as usize];
            zip.add(case.name, Cursor::new(body), case.options).unwrap();
        }
    }
    let post_hoc = zip.estimate_stream_size(&[]).unwrap();
    let archive = zip.finish(None).unwrap().into_inner();

    assert_eq!(post_hoc, archive.len() as u64, "post-hoc estimate drifted");
    assert_eq!(pre_flight, archive.len() as u64, "pre-flight estimate drifted");
}

#[test]
fn default_options_small_files() {
    assert_exact(
        ArchiveOptions::default(),
        vec![
            directory("folder"),
            entry("folder/a.txt", 1),
            entry("b.bin", 65_536),
            entry("empty", 0),
        ],
    );
}

#[test]
fn no_timestamp_fields() {
    assert_exact(
        ArchiveOptions {
            extended_timestamp: false,
            ntfs_timestamp: false,
            ..ArchiveOptions::default()
        },
        vec![entry("a", 10), entry("b", 20), directory("d")],
    );
}

#[test]
fn extended_timestamp_only() {
    assert_exact(
        ArchiveOptions {
            ntfs_timestamp: false,
            ..ArchiveOptions::default()
        },
        vec![entry("a", 10)],
    );
}

#[test]
fn forced_zip64_for_the_whole_archive() {
    assert_exact(
        ArchiveOptions {
            zip64: true,
            ..ArchiveOptions::default()
        },
        vec![
            directory("d"),
            entry("first", 100),
            entry("second", 200),
            entry("third", 300),
        ],
    );
}

#[test]
fn per_entry_zip64_and_comments() {
    let mut forced = entry("forced", 50);
    forced.options.zip64 = true;
    let mut commented = entry("commented", 5);
    commented.options.comment = Some("a fine file".to_string());
    assert_exact(
        ArchiveOptions {
            comment: Some("archive note".to_string()),
            ..ArchiveOptions::default()
        },
        vec![entry("plain", 10), forced, commented],
    );
}

#[test]
fn per_entry_timestamp_overrides() {
    let mut bare = entry("bare", 7);
    bare.options.extended_timestamp = Some(false);
    bare.options.ntfs_timestamp = Some(false);
    let mut ntfs_only = entry("ntfs-only", 7);
    ntfs_only.options.extended_timestamp = Some(false);
    assert_exact(
        ArchiveOptions::default(),
        vec![bare, ntfs_only, entry("full", 7)],
    );
}

#[test]
fn split_archive_accounting() {
    assert_exact(
        ArchiveOptions {
            zip64: true,
            split_archive: true,
            ..ArchiveOptions::default()
        },
        vec![entry("a", 10), entry("b", 20)],
    );
}

#[test]
fn many_entries() {
    let sizes = [0u64, 1, 7, 100, 511, 512, 513, 4096, 65_535, 65_536];
    let names = [
        "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    ];
    let entries = names
        .iter()
        .zip(sizes.iter())
        .map(|(name, size)| entry(name, *size))
        .collect();
    assert_exact(ArchiveOptions::default(), entries);
}

#[cfg(feature = "aes-crypto")]
#[test]
fn encrypted_entries_are_exact_too() {
    use zipstream::AesMode;

    for (strength, password) in [
        (AesMode::Aes128, "short"),
        (AesMode::Aes192, "medium-length"),
        (AesMode::Aes256, "a rather long passphrase"),
    ] {
        let options = ArchiveOptions {
            password: Some(password.to_string()),
            encryption_strength: strength,
            ..ArchiveOptions::default()
        };
        let mut zip = ZipWriter::new_with_options(Cursor::new(Vec::new()), options);
        zip.add(
            "secret.bin",
            Cursor::new(vec![1u8; 1000]),
            EntryOptions {
                compression_level: Some(0),
                uncompressed_size: Some(1000),
                ..EntryOptions::default()
            },
        )
        .unwrap();
        let estimate = zip.estimate_stream_size(&[]).unwrap();
        let archive = zip.finish(None).unwrap().into_inner();
        assert_eq!(estimate, archive.len() as u64);
    }
}

/// The single-entry overload: append one hypothetical entry to what has
/// already been added.
#[test]
fn appended_entry_estimate() {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.add(
        "present.bin",
        Cursor::new(vec![0u8; 500]),
        EntryOptions {
            compression_level: Some(0),
            uncompressed_size: Some(500),
            ..EntryOptions::default()
        },
    )
    .unwrap();

    let with_addition = zip
        .estimate_stream_size(&[EntrySpec {
            name: "future.bin".to_string(),
            uncompressed_size: 800,
            ..EntrySpec::default()
        }])
        .unwrap();

    zip.add(
        "future.bin",
        Cursor::new(vec![0u8; 800]),
        EntryOptions {
            compression_level: Some(0),
            uncompressed_size: Some(800),
            ..EntryOptions::default()
        },
    )
    .unwrap();
    let archive = zip.finish(None).unwrap().into_inner();
    assert_eq!(with_addition, archive.len() as u64);
}
