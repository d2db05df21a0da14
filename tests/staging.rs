use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use smrtlink_share::collection::FileCollection;
use smrtlink_share::staging::{DIR_MODE, Stager};

struct Fixture {
    _temp: TempDir,
    source: Utf8PathBuf,
    staging: Utf8PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let source = root.join("source");
        let staging = root.join("staging");
        fs::create_dir_all(source.as_std_path()).unwrap();
        fs::create_dir_all(staging.as_std_path()).unwrap();
        Self {
            _temp: temp,
            source,
            staging,
        }
    }

    fn file(&self, name: &str) -> Utf8PathBuf {
        let path = self.source.join(name);
        fs::write(path.as_std_path(), name.as_bytes()).unwrap();
        path
    }
}

fn mode(path: &Utf8Path) -> u32 {
    fs::metadata(path.as_std_path()).unwrap().permissions().mode() & 0o7777
}

#[test]
fn stage_hard_links_files_into_sticky_directory() {
    let fx = Fixture::new();
    let stager = Stager::new(&fx.staging, None).unwrap();
    let bam = fx.file("reads.bam");
    let pbi = fx.file("reads.bam.pbi");
    let collection = FileCollection::new("Movie m1 - s1", vec![bam.clone(), pbi]);

    assert!(stager.stage(&collection));

    let dir = fx.staging.join("Movie m1 - s1");
    assert_eq!(mode(&dir), DIR_MODE);
    let staged = dir.join("reads.bam");
    assert_eq!(
        fs::metadata(staged.as_std_path()).unwrap().ino(),
        fs::metadata(bam.as_std_path()).unwrap().ino()
    );
    assert!(dir.join("reads.bam.pbi").as_std_path().exists());
    // No temporary directories are left next to the staged one.
    assert_eq!(fs::read_dir(fx.staging.as_std_path()).unwrap().count(), 1);
}

#[test]
fn staging_twice_is_harmless() {
    let fx = Fixture::new();
    let stager = Stager::new(&fx.staging, None).unwrap();
    let collection = FileCollection::new("Movie m1 - s1", vec![fx.file("reads.bam")]);

    assert_eq!(stager.try_stage(&collection).unwrap(), 1);
    assert_eq!(stager.try_stage(&collection).unwrap(), 0);
}

#[test]
fn nested_collections_land_below_existing_directory() {
    let fx = Fixture::new();
    let stager = Stager::new(&fx.staging, None).unwrap();
    assert!(stager.stage(&FileCollection::new("Movie m2 - well (1 barcoded samples)", vec![])));
    let child = FileCollection::new(
        "Movie m2 - well (1 barcoded samples)/Leaf (bc1001)",
        vec![fx.file("bc1001.bam")],
    );

    assert!(stager.stage(&child));
    assert!(
        fx.staging
            .join("Movie m2 - well (1 barcoded samples)/Leaf (bc1001)/bc1001.bam")
            .as_std_path()
            .exists()
    );
}

#[test]
fn failed_stage_leaves_nothing_behind() {
    let fx = Fixture::new();
    let stager = Stager::new(&fx.staging, None).unwrap();
    let collection = FileCollection::new(
        "Movie m1 - s1",
        vec![fx.file("reads.bam"), fx.source.join("missing.bam")],
    );

    assert!(!stager.stage(&collection));
    assert_eq!(fs::read_dir(fx.staging.as_std_path()).unwrap().count(), 0);
}

#[test]
fn unstage_removes_service_files_and_empty_directories() {
    let fx = Fixture::new();
    let stager = Stager::new(&fx.staging, None).unwrap();
    stager.stage(&FileCollection::new("Movie m1 - s1", vec![fx.file("reads.bam")]));
    stager.stage(&FileCollection::new(
        "Movie m1 - s1/Analysis 3: Mapping",
        vec![fx.file("mapped.bam")],
    ));

    let summary = stager.unstage(Utf8Path::new("Movie m1 - s1"));

    assert_eq!(summary.removed_files, 2);
    assert_eq!(summary.kept_files, 0);
    assert!(!fx.staging.join("Movie m1 - s1").as_std_path().exists());
    assert!(fx.source.join("reads.bam").as_std_path().exists());
}

#[test]
fn unstage_keeps_files_owned_by_others() {
    let fx = Fixture::new();
    let owner = fs::metadata(fx.staging.as_std_path()).unwrap().uid();
    let stager = Stager::new(&fx.staging, Some(owner.wrapping_add(1))).unwrap();
    stager.stage(&FileCollection::new("Movie m1 - s1", vec![fx.file("reads.bam")]));

    let summary = stager.unstage(Utf8Path::new("Movie m1 - s1"));

    assert_eq!(summary.removed_files, 0);
    assert_eq!(summary.kept_files, 1);
    assert!(
        fx.staging
            .join("Movie m1 - s1/reads.bam")
            .as_std_path()
            .exists()
    );
}

#[test]
fn unstage_of_missing_directory_is_a_no_op() {
    let fx = Fixture::new();
    let stager = Stager::new(&fx.staging, None).unwrap();
    let summary = stager.unstage(Utf8Path::new("Movie gone - s1"));
    assert_eq!(summary.removed_files, 0);
    assert_eq!(summary.removed_dirs, 0);
}
