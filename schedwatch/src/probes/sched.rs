//! aya bindings for the scheduler programs.

use std::path::Path;

use anyhow::{Context, Result, bail};
use aya::{
    Btf, Ebpf,
    programs::{Program, ProgramFd, links::Link as AyaLinkTrait},
};
use log::{info, warn};
use schedwatch_common::{SCHED_TRACEPOINT_GROUP, SCHED_TRACEPOINTS};

use super::{AttachmentError, BoxError, Link, ProgramHandle, ProgramKind, SchedProgram, Tracing};

fn tracepoint_exists(category: &str, name: &str) -> bool {
    const TRACEFS_MOUNT_POINTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

    TRACEFS_MOUNT_POINTS.iter().any(|base| {
        Path::new(base)
            .join("events")
            .join(category)
            .join(name)
            .exists()
    })
}

/// Load every known scheduler program found in the object.
///
/// Each program is loaded with the loader matching its compiled type; BTF
/// tracing programs are resolved against `btf`.
pub fn load_sched_programs(bpf: &mut Ebpf, btf: &Btf) -> Result<usize> {
    let mut loaded = 0;
    for name in SCHED_TRACEPOINTS {
        let Some(program) = bpf.program_mut(name) else {
            warn!("Program {} not found in object; skipping", name);
            continue;
        };

        info!("Loading program {}", name);
        match program {
            Program::TracePoint(tracepoint) => tracepoint
                .load()
                .with_context(|| format!("Failed to load tracepoint program {}", name))?,
            Program::BtfTracePoint(tp_btf) => tp_btf
                .load(name, btf)
                .with_context(|| format!("Failed to load tp_btf program {}", name))?,
            _ => bail!("Program {} is neither a tracepoint nor a tp_btf program", name),
        }
        loaded += 1;
    }

    if loaded == 0 {
        bail!("No scheduler programs found in object");
    }
    Ok(loaded)
}

/// Attach all loaded scheduler programs of the object.
pub fn attach_sched_tracepoints(bpf: &mut Ebpf) -> Result<Tracing, AttachmentError> {
    Tracing::attach(SCHED_TRACEPOINT_GROUP, bpf.programs_mut())
}

struct AyaLink<L> {
    link: L,
    kind: ProgramKind,
}

impl<L> Link for AyaLink<L>
where
    L: AyaLinkTrait + Send + 'static,
{
    fn kind(&self) -> ProgramKind {
        self.kind
    }

    fn close(self: Box<Self>) -> Result<(), BoxError> {
        self.link.detach().map_err(Into::into)
    }
}

impl ProgramHandle for ProgramFd {
    fn close(self: Box<Self>) {
        drop(self);
    }
}

impl SchedProgram for Program {
    fn kind(&self) -> Option<ProgramKind> {
        match self {
            Program::TracePoint(_) => Some(ProgramKind::TracePoint),
            Program::BtfTracePoint(_) => Some(ProgramKind::BtfTracing),
            _ => None,
        }
    }

    fn attach_tracepoint(&mut self, group: &str, name: &str) -> Result<Box<dyn Link>, BoxError> {
        let Program::TracePoint(program) = self else {
            return Err(format!("{} is not a tracepoint program", name).into());
        };
        if !tracepoint_exists(group, name) {
            return Err(format!("tracepoint {}:{} not found in tracefs", group, name).into());
        }

        let link_id = program.attach(group, name)?;
        let link = program.take_link(link_id)?;
        Ok(Box::new(AyaLink {
            link,
            kind: ProgramKind::TracePoint,
        }))
    }

    fn attach_btf(&mut self) -> Result<Box<dyn Link>, BoxError> {
        let Program::BtfTracePoint(program) = self else {
            return Err("not a tp_btf program".into());
        };

        let link_id = program.attach()?;
        let link = program.take_link(link_id)?;
        Ok(Box::new(AyaLink {
            link,
            kind: ProgramKind::BtfTracing,
        }))
    }

    fn handle(&self) -> Result<Box<dyn ProgramHandle>, BoxError> {
        let fd = self.fd()?.try_clone()?;
        Ok(Box::new(fd))
    }
}
