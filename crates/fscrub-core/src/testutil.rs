//! Small in-memory filesystem for unit tests.

use crate::context::ScrubMount;
use asupersync::Cx;
use fscrub_block::{BlockDevice, MemBlockDevice};
use fscrub_ondisk::agheader::NULL_AGBNO;
use fscrub_ondisk::records::AllocRec;
use fscrub_ondisk::sb::{Features2, IncompatFeatures, RoCompatFeatures, SB_VERSION_5};
use fscrub_ondisk::{
    AGF_AGBNO, AGFL_AGBNO, AGI_AGBNO, Agf, Agfl, Agi, BtreeBlock, BtreeBody, BtreeHeader,
    BtreePtr, RecordFormat, SB_AGBNO, Superblock,
};
use fscrub_types::{AgBlock, AgNumber, FsGeometry};
use std::sync::Arc;

pub(crate) const BS: u32 = 512;
pub(crate) const AGBLOCKS: u32 = 64;
pub(crate) const AGCOUNT: u32 = 2;

pub(crate) fn ext(startblock: u32, blockcount: u32) -> AllocRec {
    AllocRec {
        startblock,
        blockcount,
    }
}

pub(crate) struct BuiltTree {
    pub root: AgBlock,
    pub nlevels: usize,
    /// Every block written, leaves first.
    pub blocks: Vec<AgBlock>,
}

pub(crate) struct TestFs {
    pub dev: Arc<MemBlockDevice>,
    pub sb: Superblock,
}

impl TestFs {
    pub fn new() -> Self {
        Self::with_features(RoCompatFeatures(0))
    }

    pub fn with_features(features: RoCompatFeatures) -> Self {
        let dev = MemBlockDevice::new(BS, u64::from(AGBLOCKS * AGCOUNT)).expect("device");
        Self {
            dev: Arc::new(dev),
            sb: Superblock {
                block_size: BS,
                dblocks: u64::from(AGBLOCKS * AGCOUNT),
                agblocks: AGBLOCKS,
                agcount: AGCOUNT,
                uuid: [0x5a; 16],
                versionnum: SB_VERSION_5,
                sectsize: 512,
                inodesize: 256,
                inopblock: 2,
                features_compat: 0,
                features_ro_compat: features,
                features_incompat: IncompatFeatures(0),
                rootino: 128,
                logstart: 0,
                logblocks: 0,
                fname: *b"unit\0\0\0\0\0\0\0\0",
                imax_pct: 25,
                unit: 0,
                width: 0,
                crc: 0,
                features2: Features2(0),
                bad_features2: Features2(0),
                spino_align: 0,
                pquotino: 0,
                meta_uuid: [0; 16],
            },
        }
    }

    pub fn geometry(&self) -> FsGeometry {
        self.sb.geometry().expect("geometry")
    }

    pub fn write(&self, agno: u32, agbno: AgBlock, bytes: &[u8]) {
        let cx = Cx::for_testing();
        let fsb = self.geometry().agb_to_fsb(AgNumber(agno), agbno);
        self.dev.write_block(&cx, fsb, bytes).expect("write");
    }

    pub fn read(&self, agno: u32, agbno: AgBlock) -> Vec<u8> {
        let cx = Cx::for_testing();
        let fsb = self.geometry().agb_to_fsb(AgNumber(agno), agbno);
        self.dev.read_block(&cx, fsb).expect("read").into_inner()
    }

    pub fn default_agf(&self, agno: u32) -> Agf {
        Agf {
            versionnum: 1,
            seqno: agno,
            length: self.geometry().ag_block_count(AgNumber(agno)),
            bno_root: 4,
            cnt_root: 5,
            rmap_root: 6,
            bno_level: 1,
            cnt_level: 1,
            rmap_level: 1,
            flfirst: 0,
            fllast: 0,
            flcount: 0,
            freeblks: 0,
            longest: 0,
            btreeblks: 0,
            uuid: self.sb.uuid,
            refcount_root: 7,
            refcount_level: 1,
            crc: 0,
        }
    }

    pub fn default_agi(&self, agno: u32) -> Agi {
        Agi {
            versionnum: 1,
            seqno: agno,
            length: self.geometry().ag_block_count(AgNumber(agno)),
            count: 0,
            root: 8,
            level: 1,
            freecount: 0,
            newino: NULL_AGBNO,
            dirino: NULL_AGBNO,
            uuid: self.sb.uuid,
            free_root: 9,
            free_level: 1,
            crc: 0,
        }
    }

    pub fn put_agf(&self, agf: &Agf) {
        self.write(agf.seqno, AGF_AGBNO, &agf.to_block(BS as usize).expect("agf"));
    }

    pub fn put_agi(&self, agi: &Agi) {
        self.write(agi.seqno, AGI_AGBNO, &agi.to_block(BS as usize).expect("agi"));
    }

    pub fn put_agfl(&self, agfl: &Agfl) {
        self.write(agfl.seqno, AGFL_AGBNO, &agfl.to_block(BS as usize).expect("agfl"));
    }

    /// Write default headers and an empty free list into every AG.
    pub fn format_headers(&self) {
        for agno in 0..AGCOUNT {
            self.put_agi(&self.default_agi(agno));
            self.put_agf(&self.default_agf(agno));
            self.put_agfl(&Agfl {
                seqno: agno,
                uuid: self.sb.uuid,
                bno: Vec::new(),
                crc: 0,
            });
        }
    }

    /// Write the superblock to every AG and open the mount.
    pub fn mount(&self) -> ScrubMount {
        let block = self.sb.to_block(BS as usize).expect("sb");
        for agno in 0..AGCOUNT {
            self.write(agno, SB_AGBNO, &block);
        }
        let cx = Cx::for_testing();
        let dev: Arc<dyn BlockDevice> = Arc::clone(&self.dev) as Arc<dyn BlockDevice>;
        ScrubMount::open(&cx, dev).expect("mount")
    }

    pub fn build<F: RecordFormat>(
        &self,
        first: AgBlock,
        recs: &[F::Rec],
        per_leaf: usize,
        per_node: usize,
    ) -> BuiltTree {
        self.build_in::<F>(0, first, recs, per_leaf, per_node)
    }

    /// Bulk-load `recs` into a tree in AG `agno`, blocks allocated upward
    /// from `first`.
    pub fn build_in<F: RecordFormat>(
        &self,
        agno: u32,
        first: AgBlock,
        recs: &[F::Rec],
        per_leaf: usize,
        per_node: usize,
    ) -> BuiltTree {
        let mut next = first.0;
        let mut written = Vec::new();
        let mut bodies: Vec<BtreeBody<F>> = if recs.is_empty() {
            vec![BtreeBody::Leaf { recs: Vec::new() }]
        } else {
            recs.chunks(per_leaf.max(1))
                .map(|c| BtreeBody::Leaf { recs: c.to_vec() })
                .collect()
        };
        let mut level: u16 = 0;
        loop {
            let count = u32::try_from(bodies.len()).expect("count");
            let base = next;
            next += count;
            let mut summaries: Vec<(F::Key, F::Key, BtreePtr)> = Vec::new();
            for (i, body) in bodies.into_iter().enumerate() {
                let i = u32::try_from(i).expect("index");
                let agbno = base + i;
                let sib = |present: bool, at: u32| {
                    if present {
                        BtreePtr::Short(at)
                    } else {
                        BtreePtr::null(false)
                    }
                };
                let block = BtreeBlock::<F> {
                    header: BtreeHeader {
                        magic: F::ID.magic(),
                        level,
                        numrecs: 0,
                        leftsib: sib(i > 0, agbno.wrapping_sub(1)),
                        rightsib: sib(i + 1 < count, agbno + 1),
                        blkno: self.geometry().agb_to_fsb(AgNumber(agno), AgBlock(agbno)).0,
                        owner: u64::from(agno),
                        crc: 0,
                    },
                    body,
                };
                self.write(agno, AgBlock(agbno), &block.encode(BS as usize).expect("encode"));
                written.push(AgBlock(agbno));
                if let (Some(low), Some(high)) = (block.low_key(), block.block_high_key()) {
                    summaries.push((low, high, BtreePtr::Short(agbno)));
                }
            }
            if count == 1 {
                return BuiltTree {
                    root: AgBlock(base),
                    nlevels: usize::from(level) + 1,
                    blocks: written,
                };
            }
            level += 1;
            bodies = summaries
                .chunks(per_node.max(2))
                .map(|c| BtreeBody::Node {
                    keys: c.iter().map(|s| s.0).collect(),
                    high_keys: if F::OVERLAPPING {
                        c.iter().map(|s| s.1).collect()
                    } else {
                        Vec::new()
                    },
                    ptrs: c.iter().map(|s| s.2).collect(),
                })
                .collect();
        }
    }
}
