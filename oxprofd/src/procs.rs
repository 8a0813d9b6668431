use crate::images::ImageId;

const HASH_BUCKETS: usize = 1024;

fn hash_pid(pid: u32) -> usize {
    (((pid >> 4) ^ pid) as usize) % HASH_BUCKETS
}

/// One VMA range of a process, pointing into an image at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub image: ImageId,
    pub start: u64,
    pub end: u64,
    pub offset: u64,
}

impl Mapping {
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc < self.end
    }

    /// Translate an absolute PC into an image offset.
    pub fn offset_of(&self, pc: u64) -> u64 {
        pc - self.start + self.offset
    }
}

#[derive(Debug)]
pub struct Process {
    pub pid: u32,
    maps: Vec<Mapping>,
    last_map: usize,
    /// Non-zero after exit; aged down by [`ProcessTable::age`].
    dead: u32,
    accessed: bool,
}

impl Process {
    fn new(pid: u32) -> Self {
        Process { pid, maps: Vec::new(), last_map: 0, dead: 0, accessed: false }
    }

    pub fn add_mapping(&mut self, mapping: Mapping) {
        self.maps.push(mapping);
        self.last_map = 0;
    }

    /// Record that a sample touched this process, delaying its reap.
    pub fn mark_accessed(&mut self) {
        self.accessed = true;
    }

    pub fn nr_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.maps
    }

    /// The application this process runs: the image of its first mapping,
    /// or `None` right after exec when no mapping has arrived yet.
    pub fn app_image(&self) -> Option<ImageId> {
        self.maps.first().map(|m| m.image)
    }

    /// Find the mapping containing `pc`. Scans backwards so that more
    /// recent mappings shadow older ones, which removes the need to
    /// observe munmap. A hit is cached in `last_map` for the common case
    /// of consecutive samples in the same mapping.
    pub fn find_mapping(&mut self, pc: u64) -> Option<Mapping> {
        if let Some(m) = self.maps.get(self.last_map) {
            if m.contains(pc) {
                return Some(*m);
            }
        }
        for i in (0..self.maps.len()).rev() {
            if self.maps[i].contains(pc) {
                self.last_map = i;
                return Some(self.maps[i]);
            }
        }
        None
    }
}

/// All tracked processes, hashed by pid with intra-bucket LRU reordering
/// on access. Entities live in an arena; buckets hold arena indices.
pub struct ProcessTable {
    arena: Vec<Option<Process>>,
    free: Vec<u32>,
    buckets: Vec<Vec<u32>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            arena: Vec::new(),
            free: Vec::new(),
            buckets: vec![Vec::new(); HASH_BUCKETS],
        }
    }

    pub fn len(&self) -> usize {
        self.arena.iter().filter(|p| p.is_some()).count()
    }

    fn slot(&mut self, process: Process) -> u32 {
        match self.free.pop() {
            Some(idx) => {
                self.arena[idx as usize] = Some(process);
                idx
            }
            None => {
                self.arena.push(Some(process));
                (self.arena.len() - 1) as u32
            }
        }
    }

    /// Look up a process, moving it to the front of its bucket.
    pub fn get(&mut self, pid: u32) -> Option<&mut Process> {
        let bucket = hash_pid(pid);
        let pos = self.buckets[bucket]
            .iter()
            .position(|&idx| self.arena[idx as usize].as_ref().map(|p| p.pid) == Some(pid))?;
        let idx = self.buckets[bucket].remove(pos);
        self.buckets[bucket].insert(0, idx);
        self.arena[idx as usize].as_mut()
    }

    pub fn add(&mut self, pid: u32) -> &mut Process {
        let bucket = hash_pid(pid);
        let idx = self.slot(Process::new(pid));
        self.buckets[bucket].insert(0, idx);
        self.arena[idx as usize].as_mut().unwrap()
    }

    pub fn get_or_add(&mut self, pid: u32) -> &mut Process {
        // Split lookup and insert to appease the borrow checker.
        if self.get(pid).is_some() {
            return self.get(pid).unwrap();
        }
        self.add(pid)
    }

    /// Mark a process accessed; used by the sample path so aging keeps
    /// recently-touched dead processes around.
    pub fn touch(&mut self, pid: u32) {
        if let Some(p) = self.get(pid) {
            p.accessed = true;
        }
    }

    /// Fork: the child inherits a copy of the parent's mappings. If the
    /// child already exists the notification raced with exec and is
    /// ignored.
    pub fn handle_fork(&mut self, parent: u32, child: u32) {
        if self.get(child).is_some() {
            return;
        }
        let parent_maps = match self.get(parent) {
            Some(p) => p.maps.clone(),
            None => Vec::new(),
        };
        let proc = self.add(child);
        proc.maps = parent_maps;
    }

    /// Exec drops every mapping; the process keeps existing and new
    /// mappings arrive through later notifications.
    pub fn handle_exec(&mut self, pid: u32) {
        match self.get(pid) {
            Some(p) => {
                p.maps.clear();
                p.last_map = 0;
            }
            None => {
                self.add(pid);
            }
        }
    }

    /// Exit marks the process dead but keeps it reachable: samples
    /// buffered before the exit notification must still resolve.
    pub fn handle_exit(&mut self, pid: u32) {
        if let Some(p) = self.get(pid) {
            p.dead = 1;
            p.accessed = true;
        }
    }

    pub fn handle_mmap(&mut self, pid: u32, mapping: Mapping) {
        self.get_or_add(pid).add_mapping(mapping);
    }

    /// Age dead processes and reap the ones no longer being touched. A
    /// process survives at least two ticks after exit, longer while late
    /// samples keep accessing it.
    pub fn age(&mut self) {
        for bucket in 0..HASH_BUCKETS {
            let mut pos = 0;
            while pos < self.buckets[bucket].len() {
                let idx = self.buckets[bucket][pos];
                let reap = {
                    let p = self.arena[idx as usize].as_mut().unwrap();
                    if p.dead != 0 {
                        p.dead += p.accessed as u32;
                        p.accessed = false;
                        p.dead -= 1;
                        p.dead == 0
                    } else {
                        false
                    }
                };
                if reap {
                    self.buckets[bucket].remove(pos);
                    self.arena[idx as usize] = None;
                    self.free.push(idx);
                } else {
                    pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(image: u32, start: u64, end: u64, offset: u64) -> Mapping {
        Mapping { image: ImageId(image), start, end, offset }
    }

    #[test]
    fn backward_scan_prefers_recent_mappings() {
        let mut table = ProcessTable::new();
        let proc = table.add(100);
        proc.add_mapping(map(0, 0x1000, 0x2000, 0));
        proc.add_mapping(map(1, 0x1000, 0x2000, 0));

        let hit = table.get(100).unwrap().find_mapping(0x1800).unwrap();
        assert_eq!(hit.image, ImageId(1));
    }

    #[test]
    fn last_map_hint_does_not_shadow_other_images() {
        let mut table = ProcessTable::new();
        let proc = table.add(100);
        proc.add_mapping(map(0, 0x400000, 0x401000, 0));
        proc.add_mapping(map(1, 0x500000, 0x580000, 0));

        let proc = table.get(100).unwrap();
        assert_eq!(proc.find_mapping(0x500200).unwrap().image, ImageId(1));
        assert_eq!(proc.find_mapping(0x400100).unwrap().image, ImageId(0));
        assert_eq!(proc.find_mapping(0x400101).unwrap().image, ImageId(0));
        assert!(proc.find_mapping(0x600000).is_none());
    }

    #[test]
    fn fork_copies_mappings_pointwise() {
        let mut table = ProcessTable::new();
        let parent = table.add(1000);
        parent.add_mapping(map(0, 0x400000, 0x401000, 0));
        parent.add_mapping(map(1, 0x500000, 0x580000, 0x100));

        table.handle_fork(1000, 1001);
        let child_maps = table.get(1001).unwrap().maps.clone();
        let parent_maps = table.get(1000).unwrap().maps.clone();
        assert_eq!(child_maps, parent_maps);
    }

    #[test]
    fn fork_after_exec_is_a_noop() {
        let mut table = ProcessTable::new();
        table.add(1001).add_mapping(map(7, 0x1000, 0x2000, 0));
        table.add(1000).add_mapping(map(0, 0x400000, 0x401000, 0));

        table.handle_fork(1000, 1001);
        assert_eq!(table.get(1001).unwrap().maps[0].image, ImageId(7));
    }

    #[test]
    fn exec_clears_mappings() {
        let mut table = ProcessTable::new();
        table.add(1001).add_mapping(map(0, 0x400000, 0x401000, 0));
        table.handle_exec(1001);
        assert_eq!(table.get(1001).unwrap().nr_maps(), 0);
    }

    #[test]
    fn dead_processes_survive_two_ticks() {
        let mut table = ProcessTable::new();
        table.add(42);
        table.handle_exit(42);

        table.age();
        assert!(table.get(42).is_some(), "still reachable after one tick");
        table.age();
        assert!(table.get(42).is_none(), "reaped after two ticks");
    }

    #[test]
    fn access_delays_reaping() {
        let mut table = ProcessTable::new();
        table.add(42);
        table.handle_exit(42);

        table.age();
        table.touch(42);
        table.age();
        assert!(table.get(42).is_some(), "late samples keep it alive");
        table.age();
        table.age();
        assert!(table.get(42).is_none());
    }

    #[test]
    fn pid_reuse_via_free_list() {
        let mut table = ProcessTable::new();
        table.add(1);
        table.handle_exit(1);
        table.age();
        table.age();
        assert_eq!(table.len(), 0);
        table.add(2);
        assert_eq!(table.len(), 1);
        assert!(table.get(2).is_some());
    }
}
