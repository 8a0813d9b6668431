use log::info;

/// Daemon-wide counters. Lost samples are counted, never reported
/// per-event; the whole struct is dumped on each alarm tick and at
/// shutdown.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub samples: u64,
    pub sample_counts: u64,
    pub kernel: u64,
    pub process: u64,
    pub module: u64,
    pub lost_kernel: u64,
    pub lost_module: u64,
    pub lost_process: u64,
    /// Mapping-list scan found nothing containing the PC.
    pub lost_map_process: u64,
    pub lost_samplefile: u64,
    pub no_ctx: u64,
    /// The producer reported a null file cookie for the context: the PC
    /// has no permanent file-backed mapping at all.
    pub no_mapping: u64,
    pub dangling_code: u64,
    pub dump_count: u64,
    pub notifications: u64,
}

impl Stats {
    pub fn log_summary(&self) {
        info!("-- statistics --");
        info!("samples received: {}", self.samples);
        info!("sample counts: {}", self.sample_counts);
        info!("kernel samples: {}", self.kernel);
        info!("process samples: {}", self.process);
        info!("module samples: {}", self.module);
        info!("lost kernel samples: {}", self.lost_kernel);
        info!("lost module samples: {}", self.lost_module);
        info!("lost process samples: {}", self.lost_process);
        info!("lost unmapped samples: {}", self.lost_map_process);
        info!("lost sample-file opens: {}", self.lost_samplefile);
        info!("samples with unknown provenance: {}", self.no_ctx);
        info!("samples with no mapping: {}", self.no_mapping);
        info!("dangling escape codes: {}", self.dangling_code);
        info!("buffer reads: {}", self.dump_count);
        info!("notifications: {}", self.notifications);
    }
}
