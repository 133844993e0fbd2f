//! Readiness notification for target connections
//!
//! Idle targets far outnumber everything else the broker handles, so their
//! connections are not registered with the main reactor one by one. Instead
//! a `ReadinessSource` answers "which targets have something to read?":
//!
//! - `EpollWatcher` (preferred): a second `mio::Poll` that watches every
//!   target for its whole life. Its own descriptor is registered with the
//!   main reactor, so one wakeup covers any number of targets.
//! - `ScanWatcher` (fallback): no registration at all; every polling tick
//!   checks each target connection for waiting data.
//!
//! Both feed the same broker entry point for a readable target.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::ccbid::TargetId;
use crate::config::PollMode;
use crate::registry::TargetRegistry;

pub trait ReadinessSource {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// True if every target is watched for as long as it is registered.
    /// Otherwise targets expecting results need their own reactor
    /// registration to be noticed before the next scan.
    fn watches_all_targets(&self) -> bool;

    /// Descriptor the main reactor should wait on, if any
    fn wake_fd(&self) -> Option<RawFd>;

    fn watch(&mut self, id: TargetId, fd: RawFd) -> io::Result<()>;

    fn unwatch(&mut self, fd: RawFd) -> io::Result<()>;

    /// Targets with data (or a hangup) waiting, without blocking
    fn ready_targets(&mut self, targets: &TargetRegistry) -> io::Result<Vec<TargetId>>;
}

/// Pick the best available readiness source for `mode`
pub fn select(mode: PollMode, max_events: usize) -> Box<dyn ReadinessSource> {
    match mode {
        PollMode::Scan => Box::new(ScanWatcher),
        PollMode::Auto => match EpollWatcher::new(max_events) {
            Ok(watcher) => Box::new(watcher),
            Err(e) => {
                log::warn!("Readiness watcher unavailable ({}), scanning targets instead", e);
                Box::new(ScanWatcher)
            }
        },
    }
}

// ============================================================================
// Preferred: dedicated poll instance
// ============================================================================

pub struct EpollWatcher {
    poll: Poll,
    /// Capacity bounds how many targets one drain may return
    events: Events,
}

impl EpollWatcher {
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(EpollWatcher {
            poll: Poll::new()?,
            events: Events::with_capacity(max_events.max(1)),
        })
    }
}

impl ReadinessSource for EpollWatcher {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn watches_all_targets(&self) -> bool {
        true
    }

    fn wake_fd(&self) -> Option<RawFd> {
        Some(self.poll.as_raw_fd())
    }

    fn watch(&mut self, id: TargetId, fd: RawFd) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(id as usize), Interest::READABLE)
    }

    fn unwatch(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn ready_targets(&mut self, targets: &TargetRegistry) -> io::Result<Vec<TargetId>> {
        match self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut ready: Vec<TargetId> = Vec::new();
        for event in self.events.iter() {
            let id = event.token().0 as TargetId;
            if targets.contains(id) && !ready.contains(&id) {
                ready.push(id);
            }
        }
        Ok(ready)
    }
}

// ============================================================================
// Fallback: periodic scan
// ============================================================================

pub struct ScanWatcher;

impl ReadinessSource for ScanWatcher {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn watches_all_targets(&self) -> bool {
        false
    }

    fn wake_fd(&self) -> Option<RawFd> {
        None
    }

    fn watch(&mut self, _id: TargetId, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn unwatch(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn ready_targets(&mut self, targets: &TargetRegistry) -> io::Result<Vec<TargetId>> {
        Ok(targets
            .iter()
            .filter(|(_, target)| target.connection().read_ready())
            .map(|(id, _)| *id)
            .collect())
    }
}
