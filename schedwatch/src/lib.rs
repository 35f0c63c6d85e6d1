pub mod cache;
pub mod decode;
pub mod exporter;
pub mod output;
pub mod pipeline;
pub mod probes;
#[cfg(feature = "profiling")]
pub mod profiling;
pub mod server;
pub mod settings;
pub mod tasks;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::{Btf, Ebpf, EbpfLoader, Endianness};
use aya_log::EbpfLogger;
use log::{info, warn};
use schedwatch_common::SCHED_EVENTS_MAP;
use tokio_util::sync::CancellationToken;

use crate::cache::SchedCache;
use crate::exporter::SchedExporter;
use crate::output::Output;
use crate::probes::{
    PerfEventSource, ProgramKind, Tracing, attach_sched_tracepoints, load_sched_programs,
};
use crate::settings::Settings;
use crate::tasks::TaskManager;

const NOFILE_LIMIT: libc::rlim_t = 8192;

pub struct SchedWatchEngine {
    pub settings: Settings,
    bpf: Ebpf,
    btf: Btf,
}

impl SchedWatchEngine {
    pub fn new(settings: Settings) -> Result<Self> {
        bump_memlock_rlimit()?;
        raise_nofile_rlimit();

        let btf = match settings.kernel_btf() {
            Some(path) => Btf::parse_file(path, Endianness::default())
                .with_context(|| format!("Failed to load BTF from {}", path))?,
            None => Btf::from_sys_fs().context("Failed to load kernel BTF")?,
        };

        let mut bpf = EbpfLoader::new()
            .btf(Some(&btf))
            .load_file(&settings.bpf.object)
            .with_context(|| format!("Failed to load {}", settings.bpf.object.display()))?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        Ok(Self { settings, bpf, btf })
    }

    /// Attach, then ingest and serve until `cancel` fires or a task ends.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        load_sched_programs(&mut self.bpf, &self.btf)?;
        let tracing = Arc::new(
            attach_sched_tracepoints(&mut self.bpf).context("Failed to attach sched tracepoints")?,
        );
        publish_link_counts(&tracing);

        let source = PerfEventSource::open(&mut self.bpf, SCHED_EVENTS_MAP, cancel.clone())?;
        let output_type = self.settings.output.output_type;
        let output = Output::new(&self.settings.output)
            .await
            .with_context(|| format!("Failed to init {:?} output", output_type))?;

        let cache = Arc::new(SchedCache::new());
        let exporter = Arc::new(SchedExporter::new(cache.clone())?);

        let mut tasks = TaskManager::new(cancel);

        let addr = self.settings.server.address.clone();
        let (server_tracing, token) = (tracing.clone(), tasks.cancel_token());
        tasks.spawn("metrics-server", async move {
            server::serve(&addr, exporter, server_tracing, token).await
        });

        if self.settings.pprof.enable {
            self.spawn_pprof(&mut tasks);
        }

        let token = tasks.cancel_token();
        tasks.spawn(
            "sched-delay-ingestion",
            pipeline::run_ingestion(source, cache, output, token),
        );

        info!("Monitoring scheduler latency. Press Ctrl-C to exit.");
        let result = tasks.wait().await;

        let detaching = tracing.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || detaching.detach()).await {
            warn!("Detach task failed: {}", e);
        }
        publish_link_counts(&tracing);
        result
    }

    #[cfg(feature = "profiling")]
    fn spawn_pprof(&self, tasks: &mut TaskManager) {
        let addr = self.settings.pprof.address.clone();
        let token = tasks.cancel_token();
        tasks.spawn("pprof", async move { profiling::serve(&addr, token).await });
    }

    #[cfg(not(feature = "profiling"))]
    fn spawn_pprof(&self, _tasks: &mut TaskManager) {
        warn!("pprof.enable is set but this build has no profiling support");
    }
}

fn publish_link_counts(tracing: &Tracing) {
    for kind in [ProgramKind::TracePoint, ProgramKind::BtfTracing] {
        telemetry::record_attached_links(kind.as_str(), tracing.link_count_by_kind(kind) as u64);
    }
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("Failed to remove memlock limit");
    }
    Ok(())
}

/// Perf buffers take one descriptor per CPU.
fn raise_nofile_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: NOFILE_LIMIT,
        rlim_max: NOFILE_LIMIT,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if ret != 0 {
        warn!(
            "Failed to raise open file limit: {}",
            std::io::Error::last_os_error()
        );
    }
}
