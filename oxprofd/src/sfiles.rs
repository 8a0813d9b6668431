use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use rustc_hash::FxHashMap;

use oxprof_db::{Odb, OdbError, OdbMode, SampleFileHeader, SeparationFlags};
use oxprof_mangle::MangleValues;

use crate::config::EventConfig;
use crate::images::{ImageId, ImageRegistry};
use crate::stats::Stats;

/// How many sample files to close per eviction round when the process
/// runs out of file descriptors.
const LRU_AMOUNT: usize = 1000;

/// Identity of one sample file family (one per counter, plus callgraph
/// sub-files). Axis fields are `None` when the corresponding separation
/// is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SfileKey {
    pub image: ImageId,
    /// Owning application, under `separate_kernel`/`separate_lib`.
    pub app: Option<ImageId>,
    pub is_kernel: bool,
    /// Text range of the kernel region, used for callgraph identities.
    pub kernel_range: (u64, u64),
    pub tgid: Option<u32>,
    pub tid: Option<u32>,
    pub cpu: Option<u32>,
}

pub type SfileId = u32;

struct Sfile {
    key: SfileKey,
    last_used: u64,
    files: Vec<Option<Odb>>,
    cg_files: FxHashMap<(usize, ImageId), Odb>,
}

/// Ambient state needed when a sample file is first created.
pub struct SfileContext<'a> {
    pub samples_dir: &'a Path,
    pub separation: SeparationFlags,
    pub events: &'a [EventConfig],
    pub cpu_type: u32,
    pub cpu_speed_mhz: f64,
}

/// The open sample files of the session: lazily created, capped by the
/// process fd limit via LRU eviction.
pub struct SampleFiles {
    arena: Vec<Sfile>,
    by_key: FxHashMap<SfileKey, SfileId>,
    tick: u64,
    nr_counters: usize,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl SampleFiles {
    pub fn new(nr_counters: usize) -> Self {
        SampleFiles {
            arena: Vec::new(),
            by_key: FxHashMap::default(),
            tick: 0,
            nr_counters,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Find or create the sfile for `key`, refreshing its LRU position.
    pub fn find(&mut self, key: SfileKey) -> SfileId {
        self.tick += 1;
        if let Some(&id) = self.by_key.get(&key) {
            self.arena[id as usize].last_used = self.tick;
            return id;
        }
        let id = self.arena.len() as SfileId;
        self.arena.push(Sfile {
            key,
            last_used: self.tick,
            files: (0..self.nr_counters).map(|_| None).collect(),
            cg_files: FxHashMap::default(),
        });
        self.by_key.insert(key, id);
        id
    }

    pub fn key(&self, id: SfileId) -> SfileKey {
        self.arena[id as usize].key
    }

    fn header_for(&self, key: &SfileKey, event: &EventConfig, ctx: &SfileContext, images: &ImageRegistry) -> SampleFileHeader {
        SampleFileHeader {
            event_id: event.id,
            unit_mask: event.unit_mask,
            reset_count: event.count,
            cpu_type: ctx.cpu_type,
            is_kernel: key.is_kernel as u32,
            separation: ctx.separation.bits(),
            cpu_speed_mhz: ctx.cpu_speed_mhz,
            image_mtime: images.get(key.image).mtime,
            created_at: now_secs(),
            ..Default::default()
        }
    }

    fn mangled_path(
        &self,
        key: &SfileKey,
        counter: usize,
        ctx: &SfileContext,
        images: &ImageRegistry,
        cg_to: Option<ImageId>,
    ) -> PathBuf {
        let event = &ctx.events[counter];
        let image = images.get(key.image);
        let dep_name = match key.app {
            Some(app) => images.get(app).path.clone(),
            None => image.path.clone(),
        };
        let values = MangleValues {
            image_name: image.path.clone(),
            dep_name,
            cg_name: cg_to.map(|id| images.get(id).path.clone()),
            event_name: event.name.clone(),
            count: event.count,
            unit_mask: event.unit_mask,
            tgid: key.tgid,
            tid: key.tid,
            cpu: key.cpu,
            is_kernel: key.is_kernel,
        };
        ctx.samples_dir.join(values.mangle())
    }

    /// Open an ODB at `path`, evicting old files and retrying when the fd
    /// limit is hit. Fatal only once there is nothing left to evict.
    fn open_with_retry(&mut self, path: &Path, header: &SampleFileHeader) -> Result<Odb, OdbError> {
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("failed to create {}: {err}", parent.display());
            }
        }
        loop {
            match Odb::open(path, OdbMode::ReadWrite) {
                Ok(mut odb) => {
                    let existing = odb.header();
                    if existing.created_at == 0 {
                        odb.set_header(header)?;
                    } else if !existing.same_session_signature(header) {
                        warn!(
                            "{}: header does not match session configuration",
                            path.display()
                        );
                        return Err(OdbError::VersionMismatch { path: path.to_owned() });
                    }
                    return Ok(odb);
                }
                Err(OdbError::TooManyOpenFiles) => {
                    if !self.evict_batch() {
                        return Err(OdbError::TooManyOpenFiles);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the `LRU_AMOUNT` least recently used sfiles' databases.
    /// Returns false when there was nothing to close.
    fn evict_batch(&mut self) -> bool {
        let mut candidates: Vec<(u64, usize)> = self
            .arena
            .iter()
            .enumerate()
            .filter(|(_, sf)| sf.files.iter().any(Option::is_some) || !sf.cg_files.is_empty())
            .map(|(i, sf)| (sf.last_used, i))
            .collect();
        if candidates.is_empty() {
            return false;
        }
        candidates.sort_unstable();
        for &(_, i) in candidates.iter().take(LRU_AMOUNT) {
            let sf = &mut self.arena[i];
            for slot in &mut sf.files {
                *slot = None;
            }
            sf.cg_files.clear();
        }
        true
    }

    /// Record one sample: `offset_key` is already image-relative.
    pub fn log_sample(
        &mut self,
        id: SfileId,
        counter: usize,
        offset_key: u64,
        ctx: &SfileContext,
        images: &ImageRegistry,
        stats: &mut Stats,
    ) {
        if counter >= self.nr_counters {
            warn!("sample for unconfigured counter {counter}");
            stats.lost_samplefile += 1;
            return;
        }
        if self.arena[id as usize].files[counter].is_none() {
            let key = self.arena[id as usize].key;
            let path = self.mangled_path(&key, counter, ctx, images, None);
            let header = self.header_for(&key, &ctx.events[counter], ctx, images);
            match self.open_with_retry(&path, &header) {
                Ok(odb) => self.arena[id as usize].files[counter] = Some(odb),
                Err(err) => {
                    warn!("cannot open {}: {err}", path.display());
                    stats.lost_samplefile += 1;
                    return;
                }
            }
        }
        let odb = self.arena[id as usize].files[counter].as_mut().unwrap();
        if let Err(err) = odb.insert(offset_key, 1) {
            warn!("sample insert failed: {err}");
            stats.lost_samplefile += 1;
        }
    }

    /// Record one callgraph arc from the sfile `id` into `to_image`.
    /// `from` and `to` are image-relative offsets; the key packs them as
    /// `(from << 32) | to`.
    #[allow(clippy::too_many_arguments)]
    pub fn log_arc(
        &mut self,
        id: SfileId,
        counter: usize,
        to_image: ImageId,
        to_is_kernel: bool,
        from: u64,
        to: u64,
        ctx: &SfileContext,
        images: &ImageRegistry,
        stats: &mut Stats,
    ) {
        if counter >= self.nr_counters {
            stats.lost_samplefile += 1;
            return;
        }
        if !self.arena[id as usize].cg_files.contains_key(&(counter, to_image)) {
            let key = self.arena[id as usize].key;
            let path = self.mangled_path(&key, counter, ctx, images, Some(to_image));
            let mut header = self.header_for(&key, &ctx.events[counter], ctx, images);
            header.is_cg_to_kernel = to_is_kernel as u32;
            match self.open_with_retry(&path, &header) {
                Ok(odb) => {
                    self.arena[id as usize].cg_files.insert((counter, to_image), odb);
                }
                Err(err) => {
                    warn!("cannot open {}: {err}", path.display());
                    stats.lost_samplefile += 1;
                    return;
                }
            }
        }
        let odb = self.arena[id as usize].cg_files.get_mut(&(counter, to_image)).unwrap();
        let arc_key = (from << 32) | (to & 0xffff_ffff);
        if let Err(err) = odb.insert(arc_key, 1) {
            warn!("arc insert failed: {err}");
            stats.lost_samplefile += 1;
        }
    }

    /// Flush every open database; alarm-tick work.
    pub fn sync_all(&mut self) {
        for sf in &self.arena {
            for odb in sf.files.iter().flatten() {
                if let Err(err) = odb.sync() {
                    warn!("sync failed: {err}");
                }
            }
            for odb in sf.cg_files.values() {
                if let Err(err) = odb.sync() {
                    warn!("sync failed: {err}");
                }
            }
        }
    }

    /// Close every open database; they reopen lazily. SIGHUP work.
    pub fn close_all(&mut self) {
        for sf in &mut self.arena {
            for slot in &mut sf.files {
                *slot = None;
            }
            sf.cg_files.clear();
        }
    }

    /// Drop kernel sfiles entirely, for module reload: their ranges may
    /// no longer be valid.
    pub fn clear_kernel(&mut self) {
        let mut keep = Vec::new();
        let mut by_key = FxHashMap::default();
        for sf in self.arena.drain(..) {
            if sf.key.is_kernel {
                continue;
            }
            let id = keep.len() as SfileId;
            by_key.insert(sf.key, id);
            keep.push(sf);
        }
        self.arena = keep;
        self.by_key = by_key;
    }

    pub fn open_odb_count(&self) -> usize {
        self.arena
            .iter()
            .map(|sf| sf.files.iter().filter(|f| f.is_some()).count() + sf.cg_files.len())
            .sum()
    }
}
