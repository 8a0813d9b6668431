//! End-to-end ingestion: synthetic event buffers in, sample databases out.

use std::path::Path;

use oxprof_db::{Odb, OdbMode, SeparationFlags};

use oxprofd::config::EventConfig;
use oxprofd::decoder::{
    process_samples, EventDecoder, SampleSink, COOKIE_SWITCH_CODE, CTX_SWITCH_CODE,
    CTX_TGID_CODE, KERNEL_ENTER_SWITCH_CODE, KERNEL_EXIT_SWITCH_CODE, NO_COOKIE,
    TRACE_BEGIN_CODE, TRACE_END_CODE,
};
use oxprofd::images::ImageRegistry;
use oxprofd::kernel::KernelRegistry;
use oxprofd::notes::{encode_note, process_notes, NoteHeader, NOTE_EXEC, NOTE_FORK, NOTE_MAP};
use oxprofd::procs::ProcessTable;
use oxprofd::sfiles::{SampleFiles, SfileContext};
use oxprofd::stats::Stats;

const ESCAPE: u64 = u64::MAX;

struct Harness {
    dir: tempfile::TempDir,
    images: ImageRegistry,
    kernel: KernelRegistry,
    procs: ProcessTable,
    sfiles: SampleFiles,
    stats: Stats,
    events: Vec<EventConfig>,
    separation: SeparationFlags,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut images = ImageRegistry::new();
        let kernel =
            KernelRegistry::new(Some("/boot/vmlinux"), (0xc010_0000, 0xc040_0000), &mut images);
        Harness {
            dir,
            images,
            kernel,
            procs: ProcessTable::new(),
            sfiles: SampleFiles::new(1),
            stats: Stats::default(),
            events: vec![EventConfig {
                name: "CLK".to_string(),
                id: 60,
                counter: 0,
                count: 100_000,
                unit_mask: 0,
                kernel: true,
                user: true,
            }],
            separation: SeparationFlags::empty(),
        }
    }

    fn feed_notes(&mut self, notes: &[u8]) {
        let ctx = SfileContext {
            samples_dir: self.dir.path(),
            separation: self.separation,
            events: &self.events,
            cpu_type: 0,
            cpu_speed_mhz: 0.0,
        };
        let mut sink = SampleSink {
            images: &mut self.images,
            kernel: &mut self.kernel,
            procs: &mut self.procs,
            sfiles: &mut self.sfiles,
            stats: &mut self.stats,
            ctx: &ctx,
            kernel_only: false,
        };
        process_notes(&mut sink, notes);
    }

    fn feed_samples(&mut self, buffer: &[u8]) {
        let ctx = SfileContext {
            samples_dir: self.dir.path(),
            separation: self.separation,
            events: &self.events,
            cpu_type: 0,
            cpu_speed_mhz: 0.0,
        };
        let decoder = EventDecoder::new(8);
        let mut sink = SampleSink {
            images: &mut self.images,
            kernel: &mut self.kernel,
            procs: &mut self.procs,
            sfiles: &mut self.sfiles,
            stats: &mut self.stats,
            ctx: &ctx,
            kernel_only: false,
        };
        process_samples(&decoder, &mut sink, buffer);
    }

    fn odb_entries(&mut self, rel: &str) -> Vec<(u64, u32)> {
        self.sfiles.close_all();
        let path = self.dir.path().join(rel);
        assert!(path.is_file(), "no sample file at {}", path.display());
        let odb = Odb::open(&path, OdbMode::ReadOnly).unwrap();
        let mut entries: Vec<_> = odb.iter().collect();
        entries.sort();
        entries
    }

    fn has_sample_file(&self, rel: &str) -> bool {
        self.dir.path().join(rel).is_file()
    }
}

fn map_note(pid: u32, start: u64, len: u64, offset: u64, path: &str) -> Vec<u8> {
    let mut header = NoteHeader {
        code: NOTE_MAP,
        pid,
        addr: start,
        len,
        offset,
        cookie: 0,
        path_len: 0,
        pad: 0,
    };
    encode_note(&mut header, Some(path))
}

fn simple_note(code: u32, pid: u32, addr: u64) -> Vec<u8> {
    let mut header =
        NoteHeader { code, pid, addr, len: 0, offset: 0, cookie: 0, path_len: 0, pad: 0 };
    encode_note(&mut header, None)
}

struct Stream(Vec<u8>);

impl Stream {
    fn new() -> Self {
        Stream(Vec::new())
    }

    fn word(&mut self, value: u64) -> &mut Self {
        self.0.extend_from_slice(&value.to_ne_bytes());
        self
    }

    fn ctx_switch(&mut self, tid: u64, app_cookie: u64, tgid: u64) -> &mut Self {
        self.word(ESCAPE)
            .word(CTX_SWITCH_CODE)
            .word(tid)
            .word(app_cookie)
            .word(ESCAPE)
            .word(CTX_TGID_CODE)
            .word(tgid)
    }

    fn kernel_exit(&mut self) -> &mut Self {
        self.word(ESCAPE).word(KERNEL_EXIT_SWITCH_CODE)
    }

    fn cookie_switch(&mut self, cookie: u64) -> &mut Self {
        self.word(ESCAPE).word(COOKIE_SWITCH_CODE).word(cookie)
    }

    fn kernel_enter(&mut self) -> &mut Self {
        self.word(ESCAPE).word(KERNEL_ENTER_SWITCH_CODE)
    }

    fn sample(&mut self, pc: u64, event: u64) -> &mut Self {
        self.word(pc).word(event)
    }

    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

fn seed_two_images(h: &mut Harness, pid: u32) {
    let mut notes = map_note(pid, 0x40_0000, 0x1000, 0, "/bin/A");
    notes.extend(map_note(pid, 0x50_0000, 0x8_0000, 0, "/lib/libc.so"));
    h.feed_notes(&notes);
}

#[test]
fn linear_profile_lands_in_per_image_files() {
    let mut h = Harness::new();
    seed_two_images(&mut h, 1000);

    let mut s = Stream::new();
    s.ctx_switch(1000, 0, 1000).kernel_exit();
    s.sample(0x40_0100, 0).sample(0x40_0100, 0).sample(0x40_0100, 0);
    s.sample(0x50_0200, 0);
    h.feed_samples(s.bytes());

    assert_eq!(
        h.odb_entries("{root}/bin/A/CLK.100000.0.all.all.all"),
        vec![(0x100, 3)]
    );
    assert_eq!(
        h.odb_entries("{root}/lib/libc.so/CLK.100000.0.all.all.all"),
        vec![(0x200, 1)]
    );
    assert_eq!(h.stats.samples, 4);
    assert_eq!(h.stats.process, 4);
}

#[test]
fn fork_child_uses_parent_mappings() {
    let mut h = Harness::new();
    seed_two_images(&mut h, 1000);
    h.feed_notes(&simple_note(NOTE_FORK, 1000, 1001));

    let mut s = Stream::new();
    s.ctx_switch(1001, 0, 1001).kernel_exit().sample(0x40_0100, 0);
    h.feed_samples(s.bytes());

    assert_eq!(
        h.odb_entries("{root}/bin/A/CLK.100000.0.all.all.all"),
        vec![(0x100, 1)]
    );
}

#[test]
fn exec_clears_mappings_until_remapped() {
    let mut h = Harness::new();
    seed_two_images(&mut h, 1000);
    h.feed_notes(&simple_note(NOTE_FORK, 1000, 1001));
    h.feed_notes(&simple_note(NOTE_EXEC, 1001, 0));

    let mut s = Stream::new();
    s.ctx_switch(1001, 0, 1001).kernel_exit().sample(0x40_0100, 0);
    h.feed_samples(s.bytes());

    assert_eq!(h.stats.lost_map_process, 1);
    assert!(!h.has_sample_file("{root}/bin/A/CLK.100000.0.all.all.all"));

    // The mapping notification arrives; samples resolve again.
    h.feed_notes(&map_note(1001, 0x40_0000, 0x1000, 0, "/bin/A"));
    let mut s = Stream::new();
    s.ctx_switch(1001, 0, 1001).kernel_exit().sample(0x40_0100, 0);
    h.feed_samples(s.bytes());
    assert_eq!(
        h.odb_entries("{root}/bin/A/CLK.100000.0.all.all.all"),
        vec![(0x100, 1)]
    );
}

#[test]
fn kernel_samples_use_the_kernel_range() {
    let mut h = Harness::new();
    let mut s = Stream::new();
    s.ctx_switch(1000, 0, 1000).kernel_enter().sample(0xc010_0420, 0);
    h.feed_samples(s.bytes());

    assert_eq!(
        h.odb_entries("{root}/boot/vmlinux/CLK.100000.0.all.all.all"),
        vec![(0x420, 1)]
    );
    assert_eq!(h.stats.kernel, 1);
}

#[test]
fn null_cookie_samples_count_as_no_mapping() {
    let mut h = Harness::new();
    seed_two_images(&mut h, 1000);

    let mut s = Stream::new();
    s.ctx_switch(1000, 0, 1000).kernel_exit();
    // The producer reports an anonymous region: dropped without a scan,
    // even though the PC would resolve through the mapping list.
    s.cookie_switch(NO_COOKIE).sample(0x40_0100, 0);
    // A real cookie restores normal attribution.
    s.cookie_switch(0xbeef).sample(0x40_0100, 0);
    h.feed_samples(s.bytes());

    assert_eq!(h.stats.no_mapping, 1);
    assert_eq!(h.stats.lost_map_process, 0);
    assert_eq!(
        h.odb_entries("{root}/bin/A/CLK.100000.0.all.all.all"),
        vec![(0x100, 1)]
    );
}

#[test]
fn samples_before_any_context_are_counted_not_stored() {
    let mut h = Harness::new();
    seed_two_images(&mut h, 1000);
    let mut s = Stream::new();
    // No kernel enter/exit seen yet: provenance unknown.
    s.sample(0x40_0100, 0);
    h.feed_samples(s.bytes());
    assert_eq!(h.stats.no_ctx, 1);
    assert!(!h.has_sample_file("{root}/bin/A/CLK.100000.0.all.all.all"));
}

#[test]
fn dangling_escape_at_buffer_end_is_counted() {
    let mut h = Harness::new();
    let mut s = Stream::new();
    s.word(ESCAPE);
    h.feed_samples(s.bytes());
    assert_eq!(h.stats.dangling_code, 1);

    // A context switch cut short also dangles.
    let mut s = Stream::new();
    s.word(ESCAPE).word(CTX_SWITCH_CODE).word(7);
    h.feed_samples(s.bytes());
    assert_eq!(h.stats.dangling_code, 2);
}

#[test]
fn separate_cpu_splits_sample_files() {
    let mut h = Harness::new();
    h.separation = SeparationFlags::CPU;
    seed_two_images(&mut h, 1000);

    let mut s = Stream::new();
    s.ctx_switch(1000, 0, 1000).kernel_exit();
    s.word(ESCAPE).word(oxprofd::decoder::CPU_SWITCH_CODE).word(3);
    s.sample(0x40_0100, 0);
    h.feed_samples(s.bytes());

    assert_eq!(
        h.odb_entries("{root}/bin/A/CLK.100000.0.all.all.3"),
        vec![(0x100, 1)]
    );
}

#[test]
fn trace_samples_become_arcs() {
    let mut h = Harness::new();
    seed_two_images(&mut h, 1000);

    let mut s = Stream::new();
    s.ctx_switch(1000, 0, 1000).kernel_exit();
    // Leaf at 0x500200 (libc), caller at 0x400100 (A).
    s.word(ESCAPE).word(TRACE_BEGIN_CODE);
    s.sample(0x50_0200, 0);
    s.sample(0x40_0100, 0);
    s.word(ESCAPE).word(TRACE_END_CODE);
    h.feed_samples(s.bytes());

    // The leaf is recorded as a normal sample.
    assert_eq!(
        h.odb_entries("{root}/lib/libc.so/CLK.100000.0.all.all.all"),
        vec![(0x200, 1)]
    );
    // The caller sample becomes an arc from A into libc.
    assert_eq!(
        h.odb_entries("{root}/bin/A/{cg}/{root}/lib/libc.so/CLK.100000.0.all.all.all"),
        vec![((0x100 << 32) | 0x200, 1)]
    );
}

#[test]
fn exact_kernel_end_is_user_space() {
    let mut h = Harness::new();
    // Map user code exactly at the kernel end VMA to prove the boundary.
    h.feed_notes(&map_note(1000, 0xc040_0000, 0x1000, 0, "/bin/edge"));

    let mut s = Stream::new();
    s.ctx_switch(1000, 0, 1000).kernel_exit().sample(0xc040_0000, 0);
    h.feed_samples(s.bytes());

    assert_eq!(
        h.odb_entries("{root}/bin/edge/CLK.100000.0.all.all.all"),
        vec![(0, 1)]
    );
}
