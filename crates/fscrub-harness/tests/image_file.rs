#![forbid(unsafe_code)]

use asupersync::Cx;
use fscrub_core::{ScrubOptions, ScrubType};
use fscrub_harness::{Image, ImageSpec, open_image, scrub_all};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

fn saved(dir: &Path, spec: &ImageSpec) -> (Image, PathBuf) {
    let cx = Cx::for_testing();
    let image = Image::build(&cx, spec).expect("image");
    let path = dir.join("fs.img");
    image.save(&cx, &path).expect("save");
    (image, path)
}

#[test]
fn saved_image_reopens_and_scrubs_clean() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (image, path) = saved(dir.path(), &ImageSpec::all_features());
    let geo = *image.geometry();
    assert_eq!(
        fs::metadata(&path).expect("metadata").len(),
        geo.dblocks * u64::from(geo.block_size)
    );

    let cx = Cx::for_testing();
    let mount = open_image(&cx, &path).expect("open");
    assert_eq!(mount.geometry().agcount, geo.agcount);
    assert!(mount.has_rmapbt() && mount.has_reflink() && mount.has_finobt());
    let report = scrub_all(&cx, &mount, &ScrubOptions::default());
    assert!(!report.has_problems(), "{report:#?}");
    assert_eq!(report.clean, report.entries.len());
}

#[test]
fn damaged_leaf_on_disk_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (image, path) = saved(dir.path(), &ImageSpec::default());
    let leaf = image.layout(2).expect("layout").bno.leaves()[1];
    let offset = image.fsb(2, leaf).0 * u64::from(image.geometry().block_size) + 300;

    let mut bytes = fs::read(&path).expect("read");
    let at = usize::try_from(offset).expect("offset");
    bytes[at] ^= 0x5a;
    fs::write(&path, &bytes).expect("write");

    let cx = Cx::for_testing();
    let mount = open_image(&cx, &path).expect("open");
    let report = scrub_all(&cx, &mount, &ScrubOptions::default());
    assert!(report.has_problems());
    let bnobt = report
        .entries
        .iter()
        .find(|e| e.scrub_type == ScrubType::Bnobt && e.agno == 2)
        .expect("bnobt entry");
    assert!(bnobt.is_corrupt(), "{bnobt:?}");
    for agno in [0, 1, 3] {
        let clean = report
            .entries
            .iter()
            .filter(|e| e.agno == agno)
            .all(|e| e.outcome.as_ref().is_some_and(fscrub_core::ScrubOutcome::is_clean));
        assert!(clean, "AG {agno} should be untouched");
    }
}

#[test]
fn short_image_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (image, path) = saved(dir.path(), &ImageSpec::default());
    let bs = u64::from(image.geometry().block_size);
    let len = fs::metadata(&path).expect("metadata").len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open")
        .set_len(len - bs)
        .expect("truncate");

    let err = open_image(&Cx::for_testing(), &path).expect_err("short image");
    assert!(format!("{err:#}").contains("blocks but device only"), "{err:#}");
}

#[test]
fn ragged_image_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, path) = saved(dir.path(), &ImageSpec::default());
    let len = fs::metadata(&path).expect("metadata").len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open")
        .set_len(len - 100)
        .expect("truncate");

    let err = open_image(&Cx::for_testing(), &path).expect_err("ragged image");
    assert!(format!("{err:#}").contains("not a whole number of blocks"), "{err:#}");
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = open_image(&Cx::for_testing(), &dir.path().join("absent.img")).expect_err("absent");
    assert!(format!("{err:#}").contains("absent.img"));
}
