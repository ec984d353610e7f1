//! Request validation, per-type setup and the conservative retry.

use crate::ag::{AgContext, AgTarget};
use crate::check::{ScrubFlags, ScrubOutcome};
use crate::config::{RetryPolicy, ScrubOptions};
use crate::context::{ScrubContext, ScrubMount, ScrubRequest, ScrubType};
use crate::{agheader, alloc};
use asupersync::Cx;
use fscrub_error::{Result, ScrubError};
use fscrub_ondisk::Superblock;
use fscrub_types::AgNumber;
use tracing::{debug, info, warn};

/// One kind of scrubber as seen by the dispatcher.
pub trait ScrubOps {
    /// Whether the filesystem carries this metadata at all.
    fn has(&self, _sb: &Superblock) -> bool {
        true
    }

    /// Validate the request and take whatever the scrub needs.
    fn setup(&self, cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()>;

    fn scrub(&self, cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()>;
}

type ScrubFn = fn(&Cx, &mut ScrubContext<'_>) -> Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setup {
    /// Nothing beyond the mount.
    Fs,
    /// One AG header; the scrubber reads it itself.
    AgHeader,
    /// One AG btree; headers and cursors are loaded up front.
    AgBtree,
}

#[derive(Clone, Copy)]
struct MetaScrubber {
    setup: Setup,
    has: fn(&Superblock) -> bool,
    scrub: ScrubFn,
}

fn always(_: &Superblock) -> bool {
    true
}

fn meta_scrubber(scrub_type: ScrubType) -> MetaScrubber {
    let (setup, has, scrub): (Setup, fn(&Superblock) -> bool, ScrubFn) = match scrub_type {
        ScrubType::Probe => (Setup::Fs, always, scrub_probe),
        ScrubType::Superblock => (Setup::AgHeader, always, agheader::scrub_superblock),
        ScrubType::Agf => (Setup::AgHeader, always, agheader::scrub_agf),
        ScrubType::Agfl => (Setup::AgHeader, always, agheader::scrub_agfl),
        ScrubType::Agi => (Setup::AgHeader, always, agheader::scrub_agi),
        ScrubType::Bnobt => (Setup::AgBtree, always, alloc::scrub_bnobt),
        ScrubType::Cntbt => (Setup::AgBtree, always, alloc::scrub_cntbt),
        ScrubType::Inobt => (Setup::AgBtree, always, alloc::scrub_inobt),
        ScrubType::Finobt => (Setup::AgBtree, Superblock::has_finobt, alloc::scrub_finobt),
        ScrubType::Rmapbt => (Setup::AgBtree, Superblock::has_rmapbt, alloc::scrub_rmapbt),
        ScrubType::Refcountbt => (
            Setup::AgBtree,
            Superblock::has_reflink,
            alloc::scrub_refcountbt,
        ),
    };
    MetaScrubber { setup, has, scrub }
}

impl ScrubOps for MetaScrubber {
    fn has(&self, sb: &Superblock) -> bool {
        (self.has)(sb)
    }

    fn setup(&self, cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
        match self.setup {
            Setup::Fs => Ok(()),
            Setup::AgHeader => {
                let req = sc.request;
                if req.agno >= sc.mount.geometry().agcount || req.ino != 0 || req.r#gen != 0 {
                    return Err(ScrubError::InvalidArgument(format!(
                        "{} wants an AG number only, got agno {} ino {} gen {}",
                        req.scrub_type, req.agno, req.ino, req.r#gen
                    )));
                }
                Ok(())
            }
            Setup::AgBtree => {
                let mount = sc.mount;
                let agno = AgNumber(sc.request.agno);
                sc.sa = AgContext::acquire(cx, mount, &mut sc.locks, agno, AgTarget::Btree)?;
                Ok(())
            }
        }
    }

    fn scrub(&self, cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
        (self.scrub)(cx, sc)
    }
}

/// Reports back whatever output flags the caller asked for in `gen`, so a
/// caller can test its own flag handling.
fn scrub_probe(_cx: &Cx, sc: &mut ScrubContext<'_>) -> Result<()> {
    let req = sc.request;
    if req.agno != 0 || req.ino != 0 {
        return Err(ScrubError::InvalidArgument(
            "probe takes no AG or inode".into(),
        ));
    }
    sc.outcome
        .flags
        .insert(ScrubFlags(req.r#gen & ScrubFlags::OUTPUT_MASK.0));
    if req.r#gen & !ScrubFlags::OUTPUT_MASK.0 != 0 {
        return Err(ScrubError::NotFound(format!(
            "probe cannot echo {:#x}",
            req.r#gen
        )));
    }
    Ok(())
}

/// Run `ops` for `request`, retrying once with every AG locked if it runs
/// into a lock-order hazard and `options` allow it.
pub fn run_scrub(
    cx: &Cx,
    mount: &ScrubMount,
    request: ScrubRequest,
    ops: &dyn ScrubOps,
    options: &ScrubOptions,
) -> Result<ScrubOutcome> {
    let mut try_harder = options.start_conservative;
    loop {
        let mut sc = ScrubContext::new(mount, request, try_harder)?;
        let result = ops.setup(cx, &mut sc).and_then(|()| ops.scrub(cx, &mut sc));
        sc.teardown();
        match result {
            Ok(()) => return Ok(std::mem::take(&mut sc.outcome)),
            Err(err)
                if err.is_retryable()
                    && !try_harder
                    && options.retry == RetryPolicy::OnceConservative =>
            {
                debug!(
                    scrub_type = %request.scrub_type,
                    agno = request.agno,
                    error = %err,
                    "scrub_retry_conservative"
                );
                try_harder = true;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Check one piece of metadata.
///
/// Output bits in `request.flags` are ignored; any input bit other than
/// [`ScrubFlags::REPAIR`] is rejected, and repair itself is unsupported.
pub fn scrub_metadata(
    cx: &Cx,
    mount: &ScrubMount,
    mut request: ScrubRequest,
    options: &ScrubOptions,
) -> Result<ScrubOutcome> {
    request.flags.remove(ScrubFlags::OUTPUT_MASK);
    let unknown = request.flags.0 & !ScrubFlags::INPUT_MASK.0;
    if unknown != 0 {
        return Err(ScrubError::InvalidArgument(format!(
            "unknown scrub flags {unknown:#x}"
        )));
    }

    let ops = meta_scrubber(request.scrub_type);
    if !ops.has(mount.superblock()) {
        return Err(ScrubError::NotFound(format!(
            "filesystem has no {}",
            request.scrub_type
        )));
    }
    if request.flags.contains(ScrubFlags::REPAIR) {
        return Err(ScrubError::Unsupported("online repair".into()));
    }

    let outcome = run_scrub(cx, mount, request, &ops, options)?;
    if outcome.is_corrupt() {
        warn!(
            scrub_type = %request.scrub_type,
            agno = request.agno,
            flags = %outcome.flags,
            findings = outcome.findings.len(),
            "scrub_corruption_detected"
        );
    } else {
        info!(
            scrub_type = %request.scrub_type,
            agno = request.agno,
            flags = %outcome.flags,
            "scrub_done"
        );
    }
    Ok(outcome)
}
