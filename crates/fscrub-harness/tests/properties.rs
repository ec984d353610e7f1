#![forbid(unsafe_code)]

use asupersync::Cx;
use fscrub_btree::WalkControl;
use fscrub_core::ScrubOptions;
use fscrub_harness::{Image, ImageSpec, scrub_all};
use fscrub_ondisk::records::{AllocRec, CntFormat};
use proptest::prelude::*;

fn image_spec() -> impl Strategy<Value = ImageSpec> {
    (
        0_u32..48,
        0_u32..6,
        0_u32..4,
        prop::sample::select(vec![0_u32, 2, 3, 7]),
        2_usize..12,
        2_usize..6,
        any::<(bool, bool, bool)>(),
    )
        .prop_map(
            |(free_extents, inode_chunks, shared_extents, agfl_blocks, leaf_fill, node_fill, f)| {
                ImageSpec {
                    finobt: f.0,
                    rmapbt: f.1,
                    reflink: f.2,
                    free_extents,
                    inode_chunks,
                    shared_extents,
                    agfl_blocks,
                    leaf_fill,
                    node_fill,
                    agcount: 2,
                    ..ImageSpec::default()
                }
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn consistent_images_scrub_clean(spec in image_spec()) {
        let cx = Cx::for_testing();
        let image = Image::build(&cx, &spec).expect("image");
        let mount = image.mount(&cx).expect("mount");
        let report = scrub_all(&cx, &mount, &ScrubOptions::default());
        prop_assert!(!report.has_problems(), "{:#?}", report);

        let optional = usize::from(spec.finobt) + usize::from(spec.rmapbt) + usize::from(spec.reflink);
        prop_assert_eq!(report.entries.len(), 1 + (7 + optional) * 2);
    }

    #[test]
    fn conservative_start_finds_the_same(spec in image_spec()) {
        let cx = Cx::for_testing();
        let image = Image::build(&cx, &spec).expect("image");
        let mount = image.mount(&cx).expect("mount");
        let eager = scrub_all(&cx, &mount, &ScrubOptions::default());
        let careful = scrub_all(
            &cx,
            &mount,
            &ScrubOptions { start_conservative: true, ..ScrubOptions::default() },
        );
        prop_assert_eq!(eager, careful);
    }

    #[test]
    fn every_free_extent_is_found_by_size(spec in image_spec()) {
        let cx = Cx::for_testing();
        let image = Image::build(&cx, &spec).expect("image");
        let layout = image.layout(1).expect("layout");
        let mut cur = image.cursor::<CntFormat>(1, &layout.cnt);
        for ext in &layout.free {
            prop_assert_eq!(cur.lookup_le(&cx, ext).expect("lookup"), Some(*ext));
        }
        let low = AllocRec { startblock: 0, blockcount: 0 };
        let high = AllocRec { startblock: u32::MAX, blockcount: u32::MAX };
        let mut seen = Vec::new();
        cur.query_range(&cx, &low, &high, |rec| {
            seen.push(*rec);
            Ok(WalkControl::Continue)
        })
        .expect("query");
        let mut expected = layout.free.clone();
        expected.sort_by_key(|r| (r.blockcount, r.startblock));
        prop_assert_eq!(seen, expected);
    }
}
