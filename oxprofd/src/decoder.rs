use log::{debug, warn};

use oxprof_db::SeparationFlags;

use crate::images::{ImageId, ImageRegistry};
use crate::kernel::{KernelHit, KernelRegistry};
use crate::procs::ProcessTable;
use crate::sfiles::{SampleFiles, SfileContext, SfileId, SfileKey};
use crate::stats::Stats;

// Control codes following the escape sentinel. Pinned: they are the wire
// contract with the buffer producer.
pub const CTX_SWITCH_CODE: u64 = 1;
pub const CPU_SWITCH_CODE: u64 = 2;
pub const COOKIE_SWITCH_CODE: u64 = 3;
pub const KERNEL_ENTER_SWITCH_CODE: u64 = 4;
pub const KERNEL_EXIT_SWITCH_CODE: u64 = 5;
pub const MODULE_LOADED_CODE: u64 = 6;
pub const CTX_TGID_CODE: u64 = 7;
pub const TRACE_BEGIN_CODE: u64 = 8;
pub const TRACE_END_CODE: u64 = 9;
pub const LAST_CODE: u64 = 9;

/// The null file cookie: a cookie switch to this value means the current
/// user-space PC has no permanent file-backed mapping (anonymous memory).
pub const NO_COOKIE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracing {
    Off,
    /// Saw a trace begin; the next sample is the leaf.
    Start,
    /// Subsequent samples are callers, recorded as arcs.
    On,
}

/// Decoder configuration: the buffer word width comes from the running
/// kernel, so the escape sentinel must be computed, not hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct EventDecoder {
    pointer_size: usize,
}

impl EventDecoder {
    pub fn new(pointer_size: usize) -> Self {
        assert!(pointer_size == 4 || pointer_size == 8);
        EventDecoder { pointer_size }
    }

    pub fn escape_code(&self) -> u64 {
        if self.pointer_size == 4 {
            u32::MAX as u64
        } else {
            u64::MAX
        }
    }
}

struct WordStream<'a> {
    data: &'a [u8],
    pointer_size: usize,
}

impl<'a> WordStream<'a> {
    fn new(data: &'a [u8], pointer_size: usize) -> Self {
        WordStream { data, pointer_size }
    }

    fn remaining(&self) -> usize {
        self.data.len() / self.pointer_size
    }

    fn pop(&mut self) -> Option<u64> {
        if self.data.len() < self.pointer_size {
            return None;
        }
        let (word, rest) = self.data.split_at(self.pointer_size);
        self.data = rest;
        Some(if self.pointer_size == 4 {
            u32::from_ne_bytes(word.try_into().unwrap()) as u64
        } else {
            u64::from_ne_bytes(word.try_into().unwrap())
        })
    }

    fn discard(&mut self) {
        self.data = &[];
    }
}

/// Per-buffer decoding state, reset at the start of every buffer read.
#[derive(Debug)]
pub struct Transient {
    pub pc: u64,
    /// Image-relative offset of `pc`, valid after resolution.
    pub offset: u64,
    pub event: usize,
    /// Image cookie of the current context; `None` until a cookie switch
    /// arrives, `Some(NO_COOKIE)` when the producer reported that the
    /// context has no file-backed mapping.
    pub cookie: Option<u64>,
    pub app_cookie: u64,
    pub tid: Option<u32>,
    pub tgid: Option<u32>,
    pub cpu: Option<u32>,
    /// `None` until the first kernel enter/exit code arrives.
    pub in_kernel: Option<bool>,
    pub current: Option<SfileId>,
    current_image: Option<(ImageId, bool)>,
    pub last: Option<SfileId>,
    last_offset: u64,
    last_image: Option<(ImageId, bool)>,
    pub tracing: Tracing,
}

impl Transient {
    fn new() -> Self {
        Transient {
            pc: 0,
            offset: 0,
            event: 0,
            cookie: None,
            app_cookie: 0,
            tid: None,
            tgid: None,
            cpu: None,
            in_kernel: None,
            current: None,
            current_image: None,
            last: None,
            last_offset: 0,
            last_image: None,
            tracing: Tracing::Off,
        }
    }

    fn clear_current(&mut self) {
        self.current = None;
        self.current_image = None;
    }
}

/// Everything a buffer's worth of samples is routed into.
pub struct SampleSink<'a> {
    pub images: &'a mut ImageRegistry,
    pub kernel: &'a mut KernelRegistry,
    pub procs: &'a mut ProcessTable,
    pub sfiles: &'a mut SampleFiles,
    pub stats: &'a mut Stats,
    pub ctx: &'a SfileContext<'a>,
    pub kernel_only: bool,
}

impl SampleSink<'_> {
    fn separation(&self) -> SeparationFlags {
        self.ctx.separation
    }

    /// The app image for dependent sample files, resolved through the
    /// context's app cookie when one is bound.
    fn app_image(&self, trans: &Transient) -> Option<ImageId> {
        self.images.find_by_cookie(trans.app_cookie)
    }

    fn axis_fields(&self, trans: &Transient) -> (Option<u32>, Option<u32>, Option<u32>) {
        let sep = self.separation();
        let tgid = if sep.contains(SeparationFlags::THREAD) { trans.tgid } else { None };
        let tid = if sep.contains(SeparationFlags::THREAD) { trans.tid } else { None };
        let cpu = if sep.contains(SeparationFlags::CPU) { trans.cpu } else { None };
        (tgid, tid, cpu)
    }
}

/// Decode one buffer of native-width words: samples are `(pc, event)`
/// pairs, the all-ones sentinel introduces a control code.
pub fn process_samples(decoder: &EventDecoder, sink: &mut SampleSink, buffer: &[u8]) {
    let mut trans = Transient::new();
    let mut words = WordStream::new(buffer, decoder.pointer_size);

    while let Some(code) = words.pop() {
        if code != decoder.escape_code() {
            put_sample(sink, &mut trans, &mut words, code);
            continue;
        }

        let Some(code) = words.pop() else {
            debug!("dangling escape code at end of buffer");
            sink.stats.dangling_code += 1;
            break;
        };

        match code {
            CTX_SWITCH_CODE => code_ctx_switch(sink, &mut trans, &mut words),
            CPU_SWITCH_CODE => code_cpu_switch(sink, &mut trans, &mut words),
            COOKIE_SWITCH_CODE => code_cookie_switch(sink, &mut trans, &mut words),
            KERNEL_ENTER_SWITCH_CODE => {
                // The cached cookie stays valid: there is not necessarily
                // a cookie switch on kernel exit.
                trans.in_kernel = Some(true);
                trans.clear_current();
            }
            KERNEL_EXIT_SWITCH_CODE => {
                trans.in_kernel = Some(false);
                trans.clear_current();
            }
            MODULE_LOADED_CODE => {
                sink.kernel.reread_modules(sink.images);
                // Dropping kernel sfiles renumbers the arena; every
                // cached id is stale now.
                sink.sfiles.clear_kernel();
                trans.clear_current();
                trans.last = None;
                trans.last_image = None;
            }
            TRACE_BEGIN_CODE => {
                trans.tracing = Tracing::Start;
                trans.last = None;
                trans.last_image = None;
            }
            TRACE_END_CODE => {
                trans.tracing = Tracing::Off;
            }
            code if code > LAST_CODE => {
                warn!("unknown escape code {code}, discarding buffer remainder");
                sink.stats.dangling_code += 1;
                words.discard();
            }
            code => {
                // CTX_TGID_CODE only occurs inside a context switch.
                warn!("unexpected escape code {code}");
            }
        }
    }
}

fn pop_or_dangle(sink: &mut SampleSink, words: &mut WordStream, need: usize) -> bool {
    if words.remaining() >= need {
        return true;
    }
    sink.stats.dangling_code += 1;
    words.discard();
    false
}

fn code_ctx_switch(sink: &mut SampleSink, trans: &mut Transient, words: &mut WordStream) {
    trans.clear_current();
    if !pop_or_dangle(sink, words, 5) {
        return;
    }
    trans.tid = Some(words.pop().unwrap() as u32);
    trans.app_cookie = words.pop().unwrap();
    // The tgid was a later, compatible addition: it arrives as its own
    // escape sequence inside the context switch.
    words.pop();
    words.pop();
    trans.tgid = Some(words.pop().unwrap() as u32);
    debug!(
        "CTX_SWITCH to tid {:?}, tgid {:?}, app cookie {:#x}",
        trans.tid, trans.tgid, trans.app_cookie
    );
}

fn code_cpu_switch(sink: &mut SampleSink, trans: &mut Transient, words: &mut WordStream) {
    trans.clear_current();
    if !pop_or_dangle(sink, words, 1) {
        return;
    }
    trans.cpu = Some(words.pop().unwrap() as u32);
    debug!("CPU_SWITCH to {:?}", trans.cpu);
}

fn code_cookie_switch(sink: &mut SampleSink, trans: &mut Transient, words: &mut WordStream) {
    trans.clear_current();
    if !pop_or_dangle(sink, words, 1) {
        return;
    }
    let cookie = words.pop().unwrap();
    trans.cookie = Some(cookie);
    debug!("COOKIE_SWITCH to {cookie:#x}");
}

/// Resolve the sample file for the current transient state, updating the
/// lost counters when a step fails.
fn find_sfile(sink: &mut SampleSink, trans: &mut Transient) -> Option<SfileId> {
    let (tgid_axis, tid_axis, cpu_axis) = sink.axis_fields(trans);
    let sep = sink.separation();

    if trans.in_kernel == Some(true) {
        let had_modules = sink.kernel.has_modules();
        let (image, offset, range, is_module) = match sink.kernel.resolve(trans.pc, sink.images) {
            KernelHit::Vmlinux { image, offset, start, end } => (image, offset, (start, end), false),
            KernelHit::Module { image, offset, start, end } => (image, offset, (start, end), true),
            KernelHit::Lost => {
                debug!("lost kernel sample at {:#x}", trans.pc);
                if had_modules {
                    sink.stats.lost_module += 1;
                } else {
                    sink.stats.lost_kernel += 1;
                }
                return None;
            }
        };
        if is_module {
            sink.stats.module += 1;
        } else {
            sink.stats.kernel += 1;
        }
        trans.offset = offset;
        trans.current_image = Some((image, true));
        let app = if sep.contains(SeparationFlags::KERNEL) { sink.app_image(trans) } else { None };
        let key = SfileKey {
            image,
            app,
            is_kernel: true,
            kernel_range: range,
            tgid: tgid_axis,
            tid: tid_axis,
            cpu: cpu_axis,
        };
        return Some(sink.sfiles.find(key));
    }

    if sink.kernel_only {
        return None;
    }

    // The producer told us outright that this context has no permanent
    // file mapping (anonymous memory); scanning the process's mapping
    // list would be pointless. Distinct from a scan miss below.
    if trans.cookie == Some(NO_COOKIE) {
        debug!("no permanent mapping for pc {:#x}", trans.pc);
        sink.stats.no_mapping += 1;
        return None;
    }

    let Some(tgid) = trans.tgid else {
        sink.stats.lost_process += 1;
        return None;
    };
    let Some(proc) = sink.procs.get(tgid) else {
        debug!("no process info for pid {tgid}");
        sink.stats.lost_process += 1;
        return None;
    };
    proc.mark_accessed();
    let Some(map) = proc.find_mapping(trans.pc) else {
        debug!("no mapping for pc {:#x} in pid {tgid}", trans.pc);
        sink.stats.lost_map_process += 1;
        return None;
    };
    let app_image = proc.app_image();

    sink.stats.process += 1;
    trans.offset = map.offset_of(trans.pc);
    trans.current_image = Some((map.image, false));
    let app = if sep.contains(SeparationFlags::LIB) && app_image != Some(map.image) {
        app_image
    } else {
        None
    };
    let key = SfileKey {
        image: map.image,
        app,
        is_kernel: false,
        kernel_range: (0, 0),
        tgid: tgid_axis,
        tid: tid_axis,
        cpu: cpu_axis,
    };
    Some(sink.sfiles.find(key))
}

fn put_sample(sink: &mut SampleSink, trans: &mut Transient, words: &mut WordStream, pc: u64) {
    let Some(event) = words.pop() else {
        sink.stats.dangling_code += 1;
        return;
    };

    trans.pc = pc;
    trans.event = event as usize;

    if trans.tracing != Tracing::On {
        sink.stats.samples += 1;
        sink.stats.sample_counts += 1;
    }

    if trans.in_kernel.is_none() {
        // A small race in the producer can emit samples before the first
        // kernel enter/exit code.
        debug!("losing sample at {pc:#x} of unknown provenance");
        sink.stats.no_ctx += 1;
        return;
    }

    // The kernel sfile can change at every sample; user-space resolution
    // depends on the mapping, so re-resolve each time as well.
    trans.clear_current();
    trans.current = find_sfile(sink, trans);

    match (trans.tracing, trans.current) {
        (Tracing::On, Some(current)) => {
            if let (Some(_last), Some((last_image, last_kernel))) = (trans.last, trans.last_image) {
                sink.sfiles.log_arc(
                    current,
                    trans.event,
                    last_image,
                    last_kernel,
                    trans.offset,
                    trans.last_offset,
                    sink.ctx,
                    sink.images,
                    sink.stats,
                );
            }
        }
        (_, Some(current)) => {
            sink.sfiles.log_sample(
                current,
                trans.event,
                trans.offset,
                sink.ctx,
                sink.images,
                sink.stats,
            );
        }
        (_, None) => return,
    }

    if trans.tracing == Tracing::Start {
        trans.tracing = Tracing::On;
    }
    trans.last = trans.current;
    trans.last_offset = trans.offset;
    trans.last_image = trans.current_image;
}
