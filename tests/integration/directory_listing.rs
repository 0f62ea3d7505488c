//! Directory enumeration: filtering and short/long name collapsing.

use ntfs_index::types::{FILE_ATTR_HIDDEN, FILE_ATTR_SYSTEM};
use ntfs_index::{
    Directory, FileNameNamespace, FileNameRecord, FileReference, IndexOptions, MemberFilter,
    MemoryStore,
};

fn small_opts() -> IndexOptions {
    IndexOptions {
        block_size: 512,
        root_capacity: 256,
        ..IndexOptions::default()
    }
}

fn new_dir() -> Directory<MemoryStore> {
    Directory::create(MemoryStore::new(), small_opts()).unwrap()
}

fn record(name: &str, namespace: FileNameNamespace, attributes: u32) -> FileNameRecord {
    FileNameRecord {
        attributes,
        namespace,
        name: name.into(),
    }
}

#[test]
fn members_come_back_in_caseless_name_order() {
    let mut dir = new_dir();
    for (n, name) in ["zeta.txt", "Alpha.txt", "beta.txt"].iter().enumerate() {
        dir.add_member(&FileNameRecord::new(name), FileReference::new(30 + n as u64, 1))
            .unwrap();
    }
    let members = dir.get_members(MemberFilter::default()).unwrap();
    let names: Vec<&str> = members.iter().map(|m| m.record.name.as_str()).collect();
    assert_eq!(names, vec!["Alpha.txt", "beta.txt", "zeta.txt"]);
}

#[test]
fn short_and_long_names_collapse_to_the_long_form() {
    let mut dir = new_dir();
    let reference = FileReference::new(40, 2);
    dir.add_member(
        &record("QUARTE~1.PDF", FileNameNamespace::Dos, 0),
        reference,
    )
    .unwrap();
    dir.add_member(
        &record("Quarterly Report.pdf", FileNameNamespace::Win32, 0),
        reference,
    )
    .unwrap();
    dir.add_member(&record("notes.txt", FileNameNamespace::Win32AndDos, 0), FileReference::new(41, 1))
        .unwrap();

    let members = dir.get_members(MemberFilter::default()).unwrap();
    assert_eq!(members.len(), 2);
    let report = members
        .iter()
        .find(|m| m.reference == reference)
        .expect("hard-linked file listed once");
    assert_eq!(report.record.name, "Quarterly Report.pdf");
    assert_eq!(report.record.namespace, FileNameNamespace::Win32);
    assert!(members.iter().any(|m| m.record.name == "notes.txt"));
}

#[test]
fn long_form_wins_regardless_of_enumeration_order() {
    // The short name sorts after the long one here, so the long form is
    // seen first and must survive the later short-form entry.
    let mut dir = new_dir();
    let reference = FileReference::new(50, 1);
    dir.add_member(&record("agenda.doc", FileNameNamespace::Win32, 0), reference)
        .unwrap();
    dir.add_member(&record("AGENDA~1.DOC", FileNameNamespace::Dos, 0), reference)
        .unwrap();
    let members = dir.get_members(MemberFilter::default()).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].record.name, "agenda.doc");
}

#[test]
fn hidden_and_system_members_are_filtered_by_default() {
    let mut dir = new_dir();
    dir.add_member(
        &record("visible.txt", FileNameNamespace::Win32, 0),
        FileReference::new(60, 1),
    )
    .unwrap();
    dir.add_member(
        &record("hidden.txt", FileNameNamespace::Win32, FILE_ATTR_HIDDEN),
        FileReference::new(61, 1),
    )
    .unwrap();
    dir.add_member(
        &record("pagefile.sys", FileNameNamespace::Win32, FILE_ATTR_SYSTEM),
        FileReference::new(62, 1),
    )
    .unwrap();

    let members = dir.get_members(MemberFilter::default()).unwrap();
    let names: Vec<&str> = members.iter().map(|m| m.record.name.as_str()).collect();
    assert_eq!(names, vec!["visible.txt"]);

    let all = dir
        .get_members(MemberFilter {
            include_hidden: true,
            include_system: true,
            include_meta_files: false,
        })
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[test]
fn reserved_records_stay_out_of_listings_unless_asked_for() {
    let mut dir = new_dir();
    dir.add_member(
        &record("$MFT", FileNameNamespace::Win32, FILE_ATTR_SYSTEM),
        FileReference::new(0, 1),
    )
    .unwrap();
    dir.add_member(
        &record("report.txt", FileNameNamespace::Win32, 0),
        FileReference::new(30, 1),
    )
    .unwrap();

    let members = dir.get_members(MemberFilter::default()).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].record.name, "report.txt");

    let with_meta = dir
        .get_members(MemberFilter {
            include_hidden: false,
            include_system: true,
            include_meta_files: true,
        })
        .unwrap();
    let names: Vec<&str> = with_meta.iter().map(|m| m.record.name.as_str()).collect();
    assert_eq!(names, vec!["$MFT", "report.txt"]);
}

#[test]
fn find_and_remove_are_case_insensitive() {
    let mut dir = new_dir();
    let reference = FileReference::new(70, 3);
    dir.add_member(&record("ReadMe.md", FileNameNamespace::Win32, 0), reference)
        .unwrap();
    assert_eq!(dir.find("readme.MD").unwrap(), Some(reference));
    assert_eq!(dir.find("missing.md").unwrap(), None);
    assert!(dir.remove_member("README.md").unwrap());
    assert!(!dir.remove_member("README.md").unwrap());
    assert_eq!(dir.find("ReadMe.md").unwrap(), None);
}

#[test]
fn duplicate_names_are_rejected() {
    let mut dir = new_dir();
    dir.add_member(
        &record("unique.txt", FileNameNamespace::Win32, 0),
        FileReference::new(80, 1),
    )
    .unwrap();
    assert!(dir
        .add_member(
            &record("UNIQUE.TXT", FileNameNamespace::Win32, 0),
            FileReference::new(81, 1),
        )
        .is_err());
}

#[test]
fn large_directory_spills_into_blocks_and_stays_ordered() {
    let mut dir = new_dir();
    for n in 0..200u64 {
        let name = format!("file-{n:04}.dat");
        dir.add_member(&FileNameRecord::new(&name), FileReference::new(100 + n, 1))
            .unwrap();
    }
    let members = dir.get_members(MemberFilter::default()).unwrap();
    assert_eq!(members.len(), 200);
    for (n, member) in members.iter().enumerate() {
        assert_eq!(member.record.name, format!("file-{n:04}.dat"));
        assert_eq!(member.reference, FileReference::new(100 + n as u64, 1));
    }
}
