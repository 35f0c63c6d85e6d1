use std::{
    error::Error as StdError,
    fmt,
    sync::{Mutex, MutexGuard, mpsc},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use schedwatch_common::SCHED_TRACEPOINTS;
use thiserror::Error;

pub mod sched;
pub mod source;

pub use sched::{attach_sched_tracepoints, load_sched_programs};
pub use source::{EventSource, PerfEventSource};

pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Upper bound on how long `detach` waits for links to close.
pub const DETACH_TIMEOUT: Duration = Duration::from_secs(5);

/// How a program is bound to its tracepoint. Fixed when the program is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    /// Classic tracepoint through tracefs/perf.
    TracePoint,
    /// BTF-typed `tp_btf` attachment.
    BtfTracing,
}

impl ProgramKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramKind::TracePoint => "tracepoint",
            ProgramKind::BtfTracing => "tp_btf",
        }
    }
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attached program. Closing it detaches the program from the kernel hook.
pub trait Link: Send + 'static {
    fn kind(&self) -> ProgramKind;
    fn close(self: Box<Self>) -> Result<(), BoxError>;
}

/// An owned reference to a loaded program.
pub trait ProgramHandle: Send + 'static {
    fn close(self: Box<Self>);
}

/// A loaded program that can be bound to a scheduler tracepoint.
pub trait SchedProgram {
    /// `None` for program types the collector does not attach.
    fn kind(&self) -> Option<ProgramKind>;

    fn attach_tracepoint(&mut self, group: &str, name: &str) -> Result<Box<dyn Link>, BoxError>;

    fn attach_btf(&mut self) -> Result<Box<dyn Link>, BoxError>;

    fn handle(&self) -> Result<Box<dyn ProgramHandle>, BoxError>;
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("program {program} has a type that cannot be attached to {group}:{program}")]
    UnsupportedProgram { group: String, program: String },

    #[error("failed to attach {kind} program {group}:{program}")]
    Attach {
        group: String,
        program: String,
        kind: ProgramKind,
        #[source]
        source: BoxError,
    },

    #[error("failed to take program handle for {program}")]
    Handle {
        program: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Default)]
struct TracingInner {
    links: Vec<Box<dyn Link>>,
    progs: Vec<Box<dyn ProgramHandle>>,
}

/// Live links and program handles of one or more attached program groups.
///
/// A single lock serialises `merge` and `detach`, which may race between
/// setup code and shutdown.
#[derive(Default)]
pub struct Tracing {
    inner: Mutex<TracingInner>,
}

impl fmt::Debug for Tracing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Tracing")
            .field("links", &inner.links.len())
            .field("progs", &inner.progs.len())
            .finish()
    }
}

impl Tracing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach every known scheduler program among `candidates`.
    ///
    /// Candidates whose name is not a known scheduler tracepoint are
    /// ignored. If any attach fails, the links created so far are closed
    /// and nothing is returned.
    pub fn attach<'a, P, I>(group: &str, candidates: I) -> Result<Self, AttachmentError>
    where
        P: SchedProgram + 'a,
        I: IntoIterator<Item = (&'a str, &'a mut P)>,
    {
        info!("Attaching {} group programs", group);
        let mut attached = TracingInner::default();

        for (name, program) in candidates {
            if !SCHED_TRACEPOINTS.contains(&name) {
                debug!("Skipping program {}: not a {} tracepoint", name, group);
                continue;
            }
            if let Err(e) = attach_one(group, name, program, &mut attached) {
                warn!("Attach of {}:{} failed, releasing partial links", group, name);
                release(attached);
                return Err(e);
            }
        }

        Ok(Self {
            inner: Mutex::new(attached),
        })
    }

    /// Move links and programs of `others` into this handle so they are
    /// detached together.
    pub fn merge(&self, others: impl IntoIterator<Item = Tracing>) {
        let mut inner = self.lock();
        for other in others {
            let mut add = std::mem::take(&mut *other.lock());
            inner.links.append(&mut add.links);
            inner.progs.append(&mut add.progs);
        }
    }

    pub fn have_tracing(&self) -> bool {
        !self.lock().links.is_empty()
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Number of held links of the given kind.
    pub fn link_count_by_kind(&self, kind: ProgramKind) -> usize {
        self.lock()
            .links
            .iter()
            .filter(|link| link.kind() == kind)
            .count()
    }

    /// Close every link in parallel, then every program handle.
    ///
    /// Close errors are ignored. Calling it again is a no-op.
    pub fn detach(&self) {
        let mut inner = self.lock();
        if inner.links.is_empty() && inner.progs.is_empty() {
            return;
        }
        release(std::mem::take(&mut *inner));
    }

    fn lock(&self) -> MutexGuard<'_, TracingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Tracing {
    fn drop(&mut self) {
        self.detach();
    }
}

fn attach_one<P: SchedProgram>(
    group: &str,
    name: &str,
    program: &mut P,
    attached: &mut TracingInner,
) -> Result<(), AttachmentError> {
    let kind = program
        .kind()
        .ok_or_else(|| AttachmentError::UnsupportedProgram {
            group: group.to_string(),
            program: name.to_string(),
        })?;

    let link = match kind {
        ProgramKind::TracePoint => program.attach_tracepoint(group, name),
        ProgramKind::BtfTracing => program.attach_btf(),
    }
    .map_err(|source| AttachmentError::Attach {
        group: group.to_string(),
        program: name.to_string(),
        kind,
        source,
    })?;
    attached.links.push(link);

    let handle = program
        .handle()
        .map_err(|source| AttachmentError::Handle {
            program: name.to_string(),
            source,
        })?;
    attached.progs.push(handle);

    info!("Attached {} program {}:{}", kind, group, name);
    Ok(())
}

fn release(inner: TracingInner) {
    close_links(inner.links, DETACH_TIMEOUT);
    for prog in inner.progs {
        prog.close();
    }
}

/// Fan out one close per link and wait for all of them, at most `timeout`.
fn close_links(links: Vec<Box<dyn Link>>, timeout: Duration) {
    let total = links.len();
    if total == 0 {
        return;
    }

    let (done_tx, done_rx) = mpsc::channel();
    for link in links {
        let done_tx = done_tx.clone();
        std::thread::spawn(move || {
            let kind = link.kind();
            if let Err(e) = link.close() {
                debug!("Ignoring {} link close error: {}", kind, e);
            }
            let _ = done_tx.send(());
        });
    }
    drop(done_tx);

    let deadline = Instant::now() + timeout;
    for closed in 0..total {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if done_rx.recv_timeout(remaining).is_err() {
            warn!("Timed out closing links ({}/{} closed)", closed, total);
            return;
        }
    }
    info!("Detached {} links", total);
}
