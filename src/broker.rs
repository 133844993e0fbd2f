//! The CCB broker
//!
//! A single-threaded reactor that:
//! - Accepts registrations from target daemons and keeps their connections
//! - Forwards client requests for a reverse connection to the right target
//! - Relays the target's result back to the waiting client
//! - Persists reconnect cookies so targets can reclaim their ccbid
//!
//! All registry mutation happens on the reactor thread; no locking needed.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

use crate::ccbid::{contact_string, parse_id, target_id_from_contact, IdAllocator, RequestId, TargetId};
use crate::config::BrokerConfig;
use crate::connection::Connection;
use crate::error::{BrokerError, ReconnectError};
use crate::message::{attr, Command, Record};
use crate::metrics::Metrics;
use crate::reconnect::{now_ts, ReconnectInfo, ReconnectStore};
use crate::registry::{ClientRequest, RequestTable, Target, TargetRegistry};
use crate::timeslice::Timeslice;
use crate::watcher::{self, ReadinessSource};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the target readiness watcher
const WATCHER_TOKEN: Token = Token(1);

/// First token handed to accepted connections
const FIRST_CONNECTION_TOKEN: usize = 2;

/// Upper bound on targets serviced per watcher drain
const MAX_WATCHER_EVENTS: usize = 100;

/// Messages read from one target per wakeup before deferring it
const MAX_MESSAGES_PER_WAKEUP: usize = 16;

/// Longest reactor wait, so control flags are noticed promptly
const MAX_POLL_WAIT: Duration = Duration::from_millis(250);

/// Ids skipped after a restart, covering records lost before a crash
const RECONNECT_ID_MARGIN: u64 = 100;

const TARGET_DISCONNECTED: &str = "target daemon disconnected";
const SHUTTING_DOWN: &str = "CCB server is shutting down";
const FORWARD_FAILED: &str = "failed to forward request to target";

// ============================================================================
// Control
// ============================================================================

/// Flags the reactor checks between wakeups (set from signal handlers)
#[derive(Debug, Clone, Default)]
pub struct Control {
    pub shutdown: Arc<AtomicBool>,
    pub reload: Arc<AtomicBool>,
}

/// Why `Broker::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    Reload,
}

/// What a reactor token refers to
#[derive(Debug, Clone, Copy)]
enum Endpoint {
    /// Accepted, waiting for its first command
    Pending,
    /// Client waiting for a result; readable means it hung up
    Client(RequestId),
    /// Target promoted to active observation
    Target(TargetId),
}

struct PendingConnection {
    conn: Connection,
    deadline: Instant,
}

// ============================================================================
// Broker
// ============================================================================

pub struct Broker {
    poll: Poll,
    listener: TcpListener,
    config: BrokerConfig,
    /// Address published in contact strings
    address: String,
    targets: TargetRegistry,
    requests: RequestTable,
    reconnect: ReconnectStore,
    watcher: Box<dyn ReadinessSource>,
    target_ids: IdAllocator,
    request_ids: IdAllocator,
    endpoints: HashMap<Token, Endpoint>,
    pending: HashMap<Token, PendingConnection>,
    next_token: usize,
    rng: SystemRandom,
    poll_slice: Timeslice,
    next_heartbeat: Option<Instant>,
    last_sweep: u64,
    /// Targets that still had data after a bounded service pass
    deferred: VecDeque<TargetId>,
    /// The last watcher drain hit its bound
    watcher_backlog: bool,
    metrics: Metrics,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;

        let poll = Poll::new()?;
        let listener = TcpListener::bind(config.listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;

        let address = match &config.advertise_address {
            Some(addr) => addr.clone(),
            None => {
                if local_addr.ip().is_unspecified() {
                    log::warn!(
                        "Listening on {}; contact strings will not be routable without --advertise",
                        local_addr
                    );
                }
                local_addr.to_string()
            }
        };

        let watcher = watcher::select(config.poll_mode, MAX_WATCHER_EVENTS);
        if let Some(fd) = watcher.wake_fd() {
            poll.registry()
                .register(&mut SourceFd(&fd), WATCHER_TOKEN, Interest::READABLE)?;
        }

        let mut reconnect = ReconnectStore::new(Some(config.reconnect_path(&address)));
        let mut target_ids = IdAllocator::new();
        match reconnect.load(now_ts()) {
            Ok(Some(highest)) => target_ids.advance_past(highest, RECONNECT_ID_MARGIN),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to load reconnect records: {}", e),
        }

        let poll_slice = Timeslice::new(
            config.polling_timeslice,
            config.polling_interval(),
            config.polling_max_interval(),
        );
        let next_heartbeat = config.heartbeat_interval().map(|i| Instant::now() + i);

        log::info!("CCB broker listening on {} (advertised as {})", local_addr, address);
        log::info!("  Target readiness: {}", watcher.name());
        if let Some(path) = reconnect.path() {
            log::info!("  Reconnect log:    {}", path.display());
        }

        Ok(Broker {
            poll,
            listener,
            config,
            address,
            targets: TargetRegistry::new(),
            requests: RequestTable::new(),
            reconnect,
            watcher,
            target_ids,
            request_ids: IdAllocator::new(),
            endpoints: HashMap::new(),
            pending: HashMap::new(),
            next_token: FIRST_CONNECTION_TOKEN,
            rng: SystemRandom::new(),
            poll_slice,
            next_heartbeat,
            last_sweep: now_ts(),
            deferred: VecDeque::new(),
            watcher_backlog: false,
            metrics: Metrics::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address published in contact strings
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ------------------------------------------------------------------------
    // Reactor
    // ------------------------------------------------------------------------

    /// Serve until a control flag is raised
    pub fn run(&mut self, control: &Control) -> Result<RunExit, BrokerError> {
        let mut events = Events::with_capacity(1024);

        loop {
            if control.shutdown.load(Ordering::Relaxed) {
                return Ok(RunExit::Shutdown);
            }
            if control.reload.swap(false, Ordering::Relaxed) {
                return Ok(RunExit::Reload);
            }

            let timeout = self.next_timeout(Instant::now());
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WATCHER_TOKEN => self.drain_watcher(),
                    token => self.handle_endpoint(token),
                }
            }

            self.run_deferred();
            self.run_timers(Instant::now());
        }
    }

    fn next_timeout(&self, now: Instant) -> Duration {
        if !self.deferred.is_empty() || self.watcher_backlog {
            return Duration::ZERO;
        }

        let mut next = self.poll_slice.next_start();
        if let Some(heartbeat) = self.next_heartbeat {
            next = next.min(heartbeat);
        }
        if let Some(deadline) = self.pending.values().map(|p| p.deadline).min() {
            next = next.min(deadline);
        }
        next.saturating_duration_since(now).min(MAX_POLL_WAIT)
    }

    fn run_timers(&mut self, now: Instant) {
        if self.poll_slice.is_due(now) {
            self.poll_sockets(now);
        }

        if let (Some(due), Some(interval)) = (self.next_heartbeat, self.config.heartbeat_interval()) {
            if now >= due {
                self.send_heartbeats();
                self.next_heartbeat = Some(now + interval);
            }
        }

        self.expire_pending(now);
    }

    fn register_endpoint(&mut self, fd: RawFd, endpoint: Endpoint) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.endpoints.insert(token, endpoint);
        Ok(token)
    }

    fn deregister_endpoint(&mut self, fd: RawFd, token: Token) {
        self.endpoints.remove(&token);
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::debug!("Failed to deregister token {:?}: {}", token, e);
        }
    }

    fn handle_endpoint(&mut self, token: Token) {
        // stale events for connections closed earlier in this batch are ignored
        let endpoint = match self.endpoints.get(&token) {
            Some(endpoint) => *endpoint,
            None => return,
        };
        match endpoint {
            Endpoint::Pending => self.handle_command(token),
            Endpoint::Client(request_id) => self.handle_request_disconnect(request_id),
            Endpoint::Target(target_id) => self.service_target(target_id),
        }
    }

    fn accept_connections(&mut self) {
        loop {
            let (stream, from) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    break;
                }
            };

            let conn = match Connection::new(stream, self.config.io_timeout()) {
                Ok(conn) => conn,
                Err(e) => {
                    log::debug!("Dropping connection from {}: {}", from, e);
                    continue;
                }
            };

            match self.register_endpoint(conn.raw_fd(), Endpoint::Pending) {
                Ok(token) => {
                    log::trace!("Accepted connection from {} ({:?})", from, token);
                    let deadline = Instant::now() + self.config.command_timeout();
                    self.pending.insert(token, PendingConnection { conn, deadline });
                }
                Err(e) => log::warn!("Failed to watch connection from {}: {}", from, e),
            }
        }
    }

    /// Read the first record of an accepted connection and dispatch it
    fn handle_command(&mut self, token: Token) {
        let mut pending = match self.pending.remove(&token) {
            Some(p) => p,
            None => return,
        };
        self.deregister_endpoint(pending.conn.raw_fd(), token);

        let msg = match pending.conn.read_record() {
            Ok(msg) => msg,
            Err(e) => {
                log::info!(
                    "Failed to receive command from {}: {}",
                    pending.conn.peer_description(),
                    e
                );
                return;
            }
        };

        match msg.command() {
            Some(Command::Register) => self.handle_registration(pending.conn, msg),
            Some(Command::Request) => self.handle_request(pending.conn, msg),
            _ => log::warn!(
                "Unexpected command from {}: {}",
                pending.conn.peer_description(),
                msg
            ),
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<Token> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(pending) = self.pending.remove(&token) {
                log::info!(
                    "Closing connection from {}: no command received",
                    pending.conn.peer_description()
                );
                self.deregister_endpoint(pending.conn.raw_fd(), token);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    fn handle_registration(&mut self, mut conn: Connection, msg: Record) {
        self.set_small_buffers(&conn);

        if let Some(name) = msg.lookup_str(attr::NAME) {
            conn.set_peer_name(name);
        }

        let claim = match (
            msg.lookup_str(attr::CLAIM_ID).and_then(parse_id),
            msg.lookup_str(attr::CCBID).and_then(target_id_from_contact),
        ) {
            (Some(cookie), Some(id)) => Some((id, cookie)),
            _ => None,
        };

        // a target that cannot prove its old identity just gets a new one
        let mut reclaimed = None;
        if let Some((id, cookie)) = claim {
            match self.reconnect_target(id, &conn, cookie) {
                Ok(()) => reclaimed = Some(id),
                Err(e) => {
                    Metrics::incr(&self.metrics.reconnect_rejections_total);
                    log::warn!(
                        "Reconnect from {} refused, registering as new target: {}",
                        conn.peer_description(),
                        e
                    );
                }
            }
        }

        let id = match reclaimed {
            Some(id) => id,
            None => match self.allocate_target(&conn) {
                Ok(id) => id,
                Err(e) => {
                    log::error!(
                        "Failed to register target {}: {}",
                        conn.peer_description(),
                        e
                    );
                    return;
                }
            },
        };

        let cookie = match self.reconnect.get(id) {
            Some(info) => info.cookie,
            None => {
                log::error!("Target ccbid {} has no reconnect record", id);
                return;
            }
        };

        let description = conn.peer_description().to_string();
        if let Err(target) = self.targets.insert(Target::new(id, conn)) {
            log::error!(
                "Failed to insert target {} with ccbid {}: id in use",
                target.connection().peer_description(),
                id
            );
            return;
        }
        if !self.watch_target(id) {
            return;
        }

        let mut reply = Record::with_command(Command::Register);
        reply
            .assign(attr::CCBID, contact_string(&self.address, id))
            .assign(attr::CLAIM_ID, cookie.to_string());

        let sent = match self.targets.get_mut(id) {
            Some(target) => target.connection_mut().send_record(&reply),
            None => return,
        };
        if let Err(e) = sent {
            log::warn!("Failed to send registration reply to {}: {}", description, e);
            self.remove_target(id, TARGET_DISCONNECTED);
            return;
        }

        if reclaimed.is_some() {
            Metrics::incr(&self.metrics.targets_reconnected_total);
            log::info!("Reconnected target {} with ccbid {}", description, id);
        } else {
            Metrics::incr(&self.metrics.targets_registered_total);
            log::info!("Registered target {} with ccbid {}", description, id);
        }
    }

    /// Check a claim on `id` and clear the way for the new connection
    fn reconnect_target(
        &mut self,
        id: TargetId,
        conn: &Connection,
        cookie: u64,
    ) -> Result<(), ReconnectError> {
        let allow_any_ip = self.config.reconnect_allow_any_ip;
        let peer_ip = conn.peer_ip();

        let info = self
            .reconnect
            .get_mut(id)
            .ok_or(ReconnectError::UnknownTarget(id))?;

        let moved = info.peer_ip != peer_ip;
        if moved && !allow_any_ip {
            return Err(ReconnectError::WrongIp {
                id,
                expected: info.peer_ip.clone(),
                actual: peer_ip,
            });
        }
        if cookie != info.cookie {
            return Err(ReconnectError::WrongCookie(id));
        }

        if moved {
            log::info!(
                "Target {} with ccbid {} moved from {} to {}",
                conn.peer_description(),
                id,
                info.peer_ip,
                peer_ip
            );
            info.peer_ip = peer_ip;
        }
        info.alive(now_ts());

        // the appended line still names the old IP; a restart would revert it
        if moved {
            if let Err(e) = self.reconnect.rewrite() {
                log::warn!("Failed to record new IP for ccbid {}: {}", id, e);
            }
        }

        if self.targets.contains(id) {
            // the old connection is stale but its hangup has not been seen yet
            log::info!(
                "Disconnecting existing connection for ccbid {} because {} is reconnecting",
                id,
                conn.peer_description()
            );
            self.remove_target(id, TARGET_DISCONNECTED);
        }
        Ok(())
    }

    /// Pick a fresh ccbid and record a reconnect cookie for it
    fn allocate_target(&mut self, conn: &Connection) -> Result<TargetId, BrokerError> {
        let cookie = self.random_cookie()?;

        let reconnect = &self.reconnect;
        let targets = &self.targets;
        let id = self
            .target_ids
            .allocate(|id| reconnect.contains(id) || targets.contains(id));

        let info = ReconnectInfo::new(id, cookie, conn.peer_ip(), now_ts());
        if let Err(e) = self.reconnect.append(&info) {
            log::warn!("Failed to save reconnect info for ccbid {}: {}", id, e);
        }
        self.reconnect.insert(info);
        Ok(id)
    }

    fn random_cookie(&self) -> Result<u64, BrokerError> {
        let mut bytes = [0u8; 8];
        self.rng.fill(&mut bytes).map_err(|_| BrokerError::Random)?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn set_small_buffers(&self, conn: &Connection) {
        if let Err(e) =
            conn.set_os_buffers(self.config.read_buffer_size, self.config.write_buffer_size)
        {
            log::debug!(
                "Failed to size socket buffers for {}: {}",
                conn.peer_description(),
                e
            );
        }
    }

    fn watch_target(&mut self, id: TargetId) -> bool {
        let fd = match self.targets.get(id) {
            Some(target) => target.connection().raw_fd(),
            None => return false,
        };
        match self.watcher.watch(id, fd) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to watch target ccbid {}: {}", id, e);
                self.remove_target(id, TARGET_DISCONNECTED);
                false
            }
        }
    }

    /// Tear down a target, failing every request routed to it
    fn remove_target(&mut self, id: TargetId, reason: &str) {
        let mut target = match self.targets.remove(id) {
            Some(target) => target,
            None => return,
        };

        let fd = target.connection().raw_fd();
        if let Some(token) = target.active_token() {
            target.set_active_token(None);
            self.deregister_endpoint(fd, token);
        }
        if let Err(e) = self.watcher.unwatch(fd) {
            log::debug!("Failed to unwatch target ccbid {}: {}", id, e);
        }
        self.deferred.retain(|deferred| *deferred != id);

        let mut request_ids: Vec<RequestId> = target.requests().iter().copied().collect();
        request_ids.sort_unstable();
        for request_id in request_ids {
            let mut request = match self.take_request(request_id) {
                Some(request) => request,
                None => continue,
            };
            if request.conn.read_ready() {
                log::debug!(
                    "Client {} for request {} already gone",
                    request.conn.peer_description(),
                    request_id
                );
                continue;
            }
            request_reply(&mut request.conn, false, reason, request_id, id);
            Metrics::incr(&self.metrics.requests_failed_total);
        }

        Metrics::incr(&self.metrics.target_disconnects_total);
        log::info!(
            "Unregistered target {} with ccbid {}",
            target.connection().peer_description(),
            id
        );
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn handle_request(&mut self, mut conn: Connection, msg: Record) {
        Metrics::incr(&self.metrics.requests_total);

        if let Some(name) = msg.lookup_str(attr::NAME) {
            conn.set_peer_name(name);
        }

        let (contact, return_addr, connect_id) = match (
            msg.lookup_str(attr::CCBID),
            msg.lookup_str(attr::MY_ADDRESS),
            msg.lookup_str(attr::CLAIM_ID),
        ) {
            (Some(contact), Some(addr), Some(secret)) => {
                (contact.to_string(), addr.to_string(), secret.to_string())
            }
            _ => {
                log::warn!("Invalid request from {}: {}", conn.peer_description(), msg);
                return;
            }
        };

        let target_id = match target_id_from_contact(&contact) {
            Some(id) => id,
            None => {
                log::warn!(
                    "Request from {} contains invalid ccbid {}",
                    conn.peer_description(),
                    contact
                );
                return;
            }
        };

        let target_desc = match self.targets.get(target_id) {
            Some(target) => target.connection().peer_description().to_string(),
            None => {
                log::info!(
                    "Rejecting request from {} for ccbid {}: no daemon registered with that id",
                    conn.peer_description(),
                    target_id
                );
                let error = format!(
                    "CCB server rejecting request for ccbid {} because no daemon is currently \
                     registered with that id (perhaps it recently disconnected).",
                    target_id
                );
                request_reply(&mut conn, false, &error, 0, target_id);
                Metrics::incr(&self.metrics.requests_rejected_total);
                return;
            }
        };

        self.set_small_buffers(&conn);

        let mut request = ClientRequest::new(target_id, conn, return_addr, connect_id);
        let requests = &self.requests;
        request.id = self.request_ids.allocate(|id| requests.contains(id));
        let request_id = request.id;

        // a waiting client that hangs up is forgotten right away
        match self.register_endpoint(request.conn.raw_fd(), Endpoint::Client(request_id)) {
            Ok(token) => request.token = Some(token),
            Err(e) => log::warn!("Failed to watch request {} client: {}", request_id, e),
        }

        let mut forward = Record::with_command(Command::Request);
        forward
            .assign(attr::MY_ADDRESS, request.return_addr.as_str())
            .assign(attr::CLAIM_ID, request.connect_id.as_str())
            .assign(attr::REQUEST_ID, request_id.to_string())
            .assign(attr::NAME, request.conn.peer_description());

        log::debug!(
            "Received request id {} from {} for target ccbid {} (registered as {})",
            request_id,
            request.conn.peer_description(),
            target_id,
            target_desc
        );

        if let Err(mut rejected) = self.requests.insert(request) {
            if let Some(token) = rejected.token.take() {
                self.deregister_endpoint(rejected.conn.raw_fd(), token);
            }
            log::error!("Request id {} already in use", request_id);
            return;
        }
        self.attach_request(target_id, request_id);
        self.forward_request(target_id, request_id, &forward);
    }

    /// Route a request to its target, promoting the target if needed
    fn attach_request(&mut self, target_id: TargetId, request_id: RequestId) {
        let first = match self.targets.get_mut(target_id) {
            Some(target) => target.add_request(request_id),
            None => return,
        };
        if first && !self.watcher.watches_all_targets() {
            self.activate_target(target_id);
        }
    }

    fn forward_request(&mut self, target_id: TargetId, request_id: RequestId, forward: &Record) {
        let sent = match self.targets.get_mut(target_id) {
            Some(target) => target.connection_mut().send_record(forward),
            None => return,
        };

        if let Err(e) = sent {
            log::warn!(
                "Failed to forward request id {} to target ccbid {}: {}",
                request_id,
                target_id,
                e
            );
            let idle = self
                .targets
                .get_mut(target_id)
                .map(|target| target.result_received())
                .unwrap_or(false);
            if idle {
                self.deactivate_target(target_id);
            }
            self.request_finished(request_id, false, FORWARD_FAILED);
        }
    }

    fn activate_target(&mut self, id: TargetId) {
        let fd = match self.targets.get(id) {
            Some(target) if target.active_token().is_none() => target.connection().raw_fd(),
            _ => return,
        };
        match self.register_endpoint(fd, Endpoint::Target(id)) {
            Ok(token) => {
                if let Some(target) = self.targets.get_mut(id) {
                    target.set_active_token(Some(token));
                }
            }
            Err(e) => log::debug!("Failed to watch busy target ccbid {}: {}", id, e),
        }
    }

    fn deactivate_target(&mut self, id: TargetId) {
        let (fd, token) = match self.targets.get_mut(id) {
            Some(target) => match target.active_token() {
                Some(token) => {
                    target.set_active_token(None);
                    (target.connection().raw_fd(), token)
                }
                None => return,
            },
            None => return,
        };
        self.deregister_endpoint(fd, token);
    }

    /// Remove a request from every index; the caller owns the connection
    fn take_request(&mut self, request_id: RequestId) -> Option<ClientRequest> {
        let mut request = self.requests.remove(request_id)?;
        if let Some(token) = request.token.take() {
            self.deregister_endpoint(request.conn.raw_fd(), token);
        }
        if let Some(target) = self.targets.get_mut(request.target_id) {
            target.remove_request(request_id);
        }
        Some(request)
    }

    fn request_finished(&mut self, request_id: RequestId, success: bool, error: &str) {
        let mut request = match self.take_request(request_id) {
            Some(request) => request,
            None => return,
        };
        request_reply(&mut request.conn, success, error, request_id, request.target_id);
        if success {
            Metrics::incr(&self.metrics.requests_succeeded_total);
        } else {
            Metrics::incr(&self.metrics.requests_failed_total);
        }
    }

    fn handle_request_disconnect(&mut self, request_id: RequestId) {
        if let Some(request) = self.take_request(request_id) {
            log::debug!(
                "Client {} for request {} disconnected before a result arrived",
                request.conn.peer_description(),
                request_id
            );
        }
    }

    // ------------------------------------------------------------------------
    // Target messages
    // ------------------------------------------------------------------------

    /// Service a readable target, bounded so one chatty target cannot
    /// starve the rest.
    fn service_target(&mut self, id: TargetId) {
        for _ in 0..MAX_MESSAGES_PER_WAKEUP {
            // a read on a drained socket would block for the full i/o timeout
            if !self.target_has_input(id) {
                self.deferred.retain(|deferred| *deferred != id);
                return;
            }
            self.handle_target_message(id);
        }
        if self.target_has_input(id) && !self.deferred.contains(&id) {
            self.deferred.push_back(id);
        }
    }

    fn target_has_input(&self, id: TargetId) -> bool {
        self.targets
            .get(id)
            .map(|target| target.connection().read_ready())
            .unwrap_or(false)
    }

    fn handle_target_message(&mut self, id: TargetId) {
        let read = match self.targets.get_mut(id) {
            Some(target) => target.connection_mut().read_record(),
            None => return,
        };
        let msg = match read {
            Ok(msg) => msg,
            Err(e) => {
                log::info!("Received disconnect from target ccbid {}: {}", id, e);
                self.remove_target(id, TARGET_DISCONNECTED);
                return;
            }
        };

        if msg.command() == Some(Command::Alive) {
            self.send_heartbeat_response(id);
            return;
        }

        let idle = self
            .targets
            .get_mut(id)
            .map(|target| target.result_received())
            .unwrap_or(false);
        if idle {
            self.deactivate_target(id);
        }

        let success = msg.lookup_bool(attr::RESULT).unwrap_or(false);
        let error = msg.lookup_str(attr::ERROR_STRING).unwrap_or("").to_string();
        let connect_id = msg.lookup_str(attr::CLAIM_ID).unwrap_or("");

        let request_id = match msg.lookup_str(attr::REQUEST_ID).and_then(parse_id) {
            Some(request_id) => request_id,
            None => {
                log::warn!(
                    "Received reply from target ccbid {} without a valid request id: {}",
                    id,
                    msg
                );
                self.remove_target(id, TARGET_DISCONNECTED);
                return;
            }
        };

        let client_gone = self
            .requests
            .get(request_id)
            .map(|request| request.conn.read_ready())
            .unwrap_or(false);
        if client_gone {
            // the client just hung up; writing to it would only fail
            self.take_request(request_id);
        }

        let request = match self.requests.get(request_id) {
            Some(request) => request,
            None => {
                if success {
                    log::debug!(
                        "Target ccbid {} connected request {} for a client which has gone away",
                        id,
                        request_id
                    );
                } else {
                    log::debug!(
                        "Client for request {} to target ccbid {} disappeared before \
                         receiving error details: {}",
                        request_id,
                        id,
                        error
                    );
                }
                return;
            }
        };

        if request.connect_id != connect_id {
            log::warn!(
                "Received wrong connect id from target ccbid {} for request {}; disconnecting it",
                id,
                request_id
            );
            self.remove_target(id, TARGET_DISCONNECTED);
            return;
        }

        if success {
            log::debug!("Target ccbid {} connected request {}", id, request_id);
        } else {
            log::debug!(
                "Target ccbid {} failed request {}: {}",
                id,
                request_id,
                error
            );
        }
        self.request_finished(request_id, success, &error);
    }

    fn send_heartbeat_response(&mut self, id: TargetId) {
        let sent = match self.targets.get_mut(id) {
            Some(target) => target
                .connection_mut()
                .send_record(&Record::with_command(Command::Alive)),
            None => return,
        };
        match sent {
            Ok(()) => log::debug!("Sent heartbeat response to target ccbid {}", id),
            Err(e) => {
                log::info!("Failed to send heartbeat to target ccbid {}: {}", id, e);
                self.remove_target(id, TARGET_DISCONNECTED);
            }
        }
    }

    fn send_heartbeats(&mut self) {
        for id in self.targets.ids() {
            self.send_heartbeat(id);
        }
    }

    /// Broker-initiated keepalive, or a shutdown notice for targets on
    /// their way out
    fn send_heartbeat(&mut self, id: TargetId) {
        let (shutting_down, sent) = match self.targets.get_mut(id) {
            Some(target) if target.is_shutdown_pending() => (
                true,
                target
                    .connection_mut()
                    .send_record(&Record::with_command(Command::Shutdown)),
            ),
            Some(target) => (
                false,
                target
                    .connection_mut()
                    .send_record(&Record::with_command(Command::Alive)),
            ),
            None => return,
        };

        match sent {
            Ok(()) => {}
            Err(e) if shutting_down => {
                log::debug!("Failed to send shutdown notice to target ccbid {}: {}", id, e);
            }
            Err(e) => {
                log::info!("Failed to send heartbeat to target ccbid {}: {}", id, e);
                self.remove_target(id, TARGET_DISCONNECTED);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Polling and sweeping
    // ------------------------------------------------------------------------

    fn drain_watcher(&mut self) {
        let ready = match self.watcher.ready_targets(&self.targets) {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("Target readiness check failed: {}", e);
                return;
            }
        };
        self.watcher_backlog = self.watcher.watches_all_targets() && ready.len() >= MAX_WATCHER_EVENTS;
        for id in ready {
            self.service_target(id);
        }
    }

    fn run_deferred(&mut self) {
        let deferred: Vec<TargetId> = self.deferred.drain(..).collect();
        for id in deferred {
            self.service_target(id);
        }
        if self.watcher_backlog {
            self.drain_watcher();
        }
    }

    /// Polling timer: look for target traffic, then maybe sweep
    fn poll_sockets(&mut self, started: Instant) {
        self.drain_watcher();
        self.sweep_reconnect_info(now_ts());
        self.poll_slice.record(started, started.elapsed());
    }

    /// Flush the reconnect log and, once per sweep interval, expire records
    pub fn sweep_reconnect_info(&mut self, now: u64) {
        self.reconnect.flush();

        let interval = self.config.sweep_interval_secs;
        if self.last_sweep.saturating_add(interval) > now {
            return;
        }
        self.last_sweep = now;

        let removed = self.reconnect.sweep(now, interval, self.targets.ids());
        self.metrics
            .reconnect_records_pruned_total
            .fetch_add(removed as u64, Ordering::Relaxed);

        log::debug!(
            "CCB statistics:\n{}",
            self.metrics.render(self.targets.len(), self.requests.len())
        );
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Apply a reloaded configuration without dropping connections
    pub fn reconfigure(&mut self, mut config: BrokerConfig) {
        if config.listen != self.config.listen {
            log::warn!("Listen address change to {} requires a restart", config.listen);
        }
        if config.advertise_address != self.config.advertise_address {
            log::warn!("Advertised address change requires a restart");
        }
        if config.poll_mode != self.config.poll_mode {
            log::warn!("Poll mode change requires a restart");
        }
        config.listen = self.config.listen;
        config.advertise_address = self.config.advertise_address.clone();
        config.poll_mode = self.config.poll_mode;

        self.reconnect
            .relocate(Some(config.reconnect_path(&self.address)));
        self.poll_slice = Timeslice::new(
            config.polling_timeslice,
            config.polling_interval(),
            config.polling_max_interval(),
        );
        if config.heartbeat_interval_secs != self.config.heartbeat_interval_secs {
            self.next_heartbeat = config.heartbeat_interval().map(|i| Instant::now() + i);
        }

        self.config = config;
        log::info!("Configuration reloaded");
    }

    /// Notify and drop every target, then flush the reconnect log
    pub fn shutdown(&mut self) {
        let ids = self.targets.ids();
        log::info!("Shutting down; notifying {} targets", ids.len());

        for id in &ids {
            if let Some(target) = self.targets.get_mut(*id) {
                target.mark_shutdown();
            }
            self.send_heartbeat(*id);
        }
        for id in ids {
            self.remove_target(id, SHUTTING_DOWN);
        }

        let pending: Vec<Token> = self.pending.keys().copied().collect();
        for token in pending {
            if let Some(p) = self.pending.remove(&token) {
                self.deregister_endpoint(p.conn.raw_fd(), token);
            }
        }
        for request_id in self.requests.ids() {
            self.request_finished(request_id, false, SHUTTING_DOWN);
        }

        self.reconnect.flush();
    }
}

/// Tell a client how its request ended
fn request_reply(
    conn: &mut Connection,
    success: bool,
    error: &str,
    request_id: RequestId,
    target_id: TargetId,
) {
    if success && conn.read_ready() {
        // the client already got its reverse connection and left
        return;
    }

    let mut msg = Record::new();
    msg.assign(attr::RESULT, success)
        .assign(attr::ERROR_STRING, error);

    if let Err(e) = conn.send_record(&msg) {
        if success {
            log::debug!(
                "Failed to send success for request id {} from {} to target ccbid {} \
                 (client may leave once connected): {}",
                request_id,
                conn.peer_description(),
                target_id,
                e
            );
        } else {
            log::warn!(
                "Failed to send failure for request id {} from {} to target ccbid {} ({}): {}",
                request_id,
                conn.peer_description(),
                target_id,
                error,
                e
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollMode;
    use std::net::{Shutdown, TcpListener as StdListener};
    use std::path::Path;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Fixture {
        broker: Broker,
        peers: StdListener,
        dir: TempDir,
    }

    impl Fixture {
        fn new(mode: PollMode) -> Self {
            Self::with_config(mode, |_| {})
        }

        fn with_config(mode: PollMode, adjust: impl FnOnce(&mut BrokerConfig)) -> Self {
            let dir = TempDir::new().unwrap();
            let mut config = BrokerConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                reconnect_file: Some(dir.path().join("test.ccb_reconnect")),
                sweep_interval_secs: 100,
                heartbeat_interval_secs: 0,
                poll_mode: mode,
                ..BrokerConfig::default()
            };
            adjust(&mut config);
            Fixture {
                broker: Broker::new(config).unwrap(),
                peers: StdListener::bind("127.0.0.1:0").unwrap(),
                dir,
            }
        }

        /// Make every later write from the broker to this target fail
        fn break_target(&self, id: TargetId) {
            self.broker
                .targets
                .get(id)
                .unwrap()
                .connection()
                .shutdown(Shutdown::Write)
                .unwrap();
        }

        /// (remote end, broker end)
        fn pair(&self) -> (Connection, Connection) {
            let remote = Connection::connect(self.peers.local_addr().unwrap(), TIMEOUT).unwrap();
            let (stream, _) = self.peers.accept().unwrap();
            (remote, Connection::new(stream, TIMEOUT).unwrap())
        }

        fn register(&mut self, claim: Option<(&str, &str)>) -> (Connection, Record) {
            let (mut remote, local) = self.pair();
            let mut msg = Record::with_command(Command::Register);
            msg.assign(attr::NAME, "startd");
            if let Some((contact, cookie)) = claim {
                msg.assign(attr::CCBID, contact).assign(attr::CLAIM_ID, cookie);
            }
            self.broker.handle_registration(local, msg);
            let reply = remote.read_record().unwrap();
            (remote, reply)
        }

        fn request(&mut self, contact: &str, secret: &str) -> Connection {
            let (remote, local) = self.pair();
            let mut msg = Record::with_command(Command::Request);
            msg.assign(attr::CCBID, contact)
                .assign(attr::MY_ADDRESS, "1.2.3.4:9")
                .assign(attr::CLAIM_ID, secret);
            self.broker.handle_request(local, msg);
            remote
        }
    }

    fn id_of(reply: &Record) -> TargetId {
        target_id_from_contact(reply.lookup_str(attr::CCBID).unwrap()).unwrap()
    }

    fn result(request_id: &str, secret: &str, success: bool, error: &str) -> Record {
        let mut msg = Record::new();
        msg.assign(attr::RESULT, success)
            .assign(attr::ERROR_STRING, error)
            .assign(attr::REQUEST_ID, request_id)
            .assign(attr::CLAIM_ID, secret);
        msg
    }

    #[test]
    fn test_registration_reply() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (_target, reply) = fx.register(None);

        assert_eq!(reply.command(), Some(Command::Register));
        let contact = reply.lookup_str(attr::CCBID).unwrap();
        let (addr, _) = crate::ccbid::split_contact(contact).unwrap();
        assert_eq!(addr, fx.broker.address());

        let id = id_of(&reply);
        assert!(fx.broker.targets.contains(id));
        let cookie: u64 = reply.lookup_str(attr::CLAIM_ID).unwrap().parse().unwrap();
        assert_eq!(fx.broker.reconnect.get(id).unwrap().cookie, cookie);
    }

    #[test]
    fn test_reconnect_evicts_stale_connection() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (_old, reply) = fx.register(None);
        let id = id_of(&reply);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let cookie = reply.lookup_str(attr::CLAIM_ID).unwrap().to_string();

        let (_new, again) = fx.register(Some((&contact, &cookie)));
        assert_eq!(id_of(&again), id);
        assert_eq!(again.lookup_str(attr::CLAIM_ID), Some(cookie.as_str()));
        assert_eq!(fx.broker.target_count(), 1);
        assert_eq!(fx.broker.metrics().targets_reconnected_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reconnect_with_wrong_cookie_gets_fresh_id() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (_old, reply) = fx.register(None);
        let id = id_of(&reply);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();

        let (_new, again) = fx.register(Some((&contact, "12345")));
        assert_ne!(id_of(&again), id);
        assert_eq!(fx.broker.target_count(), 2);
    }

    #[test]
    fn test_reconnect_ip_policy() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (_old, reply) = fx.register(None);
        let id = id_of(&reply);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let cookie = reply.lookup_str(attr::CLAIM_ID).unwrap().to_string();
        fx.broker.reconnect.get_mut(id).unwrap().peer_ip = "192.0.2.1".into();
        fx.broker.reconnect.rewrite().unwrap();

        let (_new, again) = fx.register(Some((&contact, &cookie)));
        assert_ne!(id_of(&again), id);

        fx.broker.config.reconnect_allow_any_ip = true;
        let (_newer, third) = fx.register(Some((&contact, &cookie)));
        assert_eq!(id_of(&third), id);
        assert_eq!(fx.broker.reconnect.get(id).unwrap().peer_ip, "127.0.0.1");

        // a restarted broker sees the new IP too
        let mut reloaded = ReconnectStore::new(fx.broker.reconnect.path().map(Path::to_path_buf));
        reloaded.load(now_ts()).unwrap();
        assert_eq!(reloaded.get(id).unwrap().peer_ip, "127.0.0.1");
    }

    #[test]
    fn test_unknown_target_rejected_immediately() {
        let mut fx = Fixture::new(PollMode::Auto);
        let mut client = fx.request("127.0.0.1:9618#999", "S");
        let reply = client.read_record().unwrap();
        assert_eq!(reply.lookup_bool(attr::RESULT), Some(false));
        assert!(reply.lookup_str(attr::ERROR_STRING).unwrap().contains("999"));
        assert_eq!(fx.broker.request_count(), 0);
    }

    #[test]
    fn test_forward_and_relay() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let id = id_of(&reply);

        let mut client = fx.request(&contact, "S");
        let forward = target.read_record().unwrap();
        assert_eq!(forward.command(), Some(Command::Request));
        assert_eq!(forward.lookup_str(attr::CLAIM_ID), Some("S"));
        assert_eq!(forward.lookup_str(attr::MY_ADDRESS), Some("1.2.3.4:9"));
        let request_id = forward.lookup_str(attr::REQUEST_ID).unwrap().to_string();
        assert_eq!(fx.broker.targets.get(id).unwrap().pending_results(), 1);

        target.send_record(&result(&request_id, "S", false, "connect refused")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(id);

        let outcome = client.read_record().unwrap();
        assert_eq!(outcome.lookup_bool(attr::RESULT), Some(false));
        assert_eq!(outcome.lookup_str(attr::ERROR_STRING), Some("connect refused"));
        assert_eq!(fx.broker.request_count(), 0);
        assert_eq!(fx.broker.targets.get(id).unwrap().pending_results(), 0);
    }

    #[test]
    fn test_scan_mode_promotes_busy_target() {
        let mut fx = Fixture::new(PollMode::Scan);
        let (mut target, reply) = fx.register(None);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let id = id_of(&reply);
        assert!(fx.broker.targets.get(id).unwrap().active_token().is_none());

        let _client = fx.request(&contact, "S");
        assert!(fx.broker.targets.get(id).unwrap().active_token().is_some());

        let forward = target.read_record().unwrap();
        let request_id = forward.lookup_str(attr::REQUEST_ID).unwrap().to_string();
        target.send_record(&result(&request_id, "S", true, "")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(id);
        assert!(fx.broker.targets.get(id).unwrap().active_token().is_none());
    }

    #[test]
    fn test_forged_secret_destroys_target() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let id = id_of(&reply);

        let mut client = fx.request(&contact, "S");
        let forward = target.read_record().unwrap();
        let request_id = forward.lookup_str(attr::REQUEST_ID).unwrap().to_string();

        target.send_record(&result(&request_id, "forged", true, "")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(id);

        assert!(!fx.broker.targets.contains(id));
        assert_eq!(fx.broker.request_count(), 0);
        let outcome = client.read_record().unwrap();
        assert_eq!(outcome.lookup_bool(attr::RESULT), Some(false));
        assert_eq!(outcome.lookup_str(attr::ERROR_STRING), Some(TARGET_DISCONNECTED));
    }

    #[test]
    fn test_bad_request_id_is_protocol_violation() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let id = id_of(&reply);

        target.send_record(&result("not-a-number", "S", true, "")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(id);
        assert!(!fx.broker.targets.contains(id));
    }

    #[test]
    fn test_target_disconnect_fails_every_request() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (target, reply) = fx.register(None);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let id = id_of(&reply);

        let mut clients: Vec<Connection> = (0..3).map(|i| fx.request(&contact, &format!("S{}", i))).collect();
        assert_eq!(fx.broker.request_count(), 3);

        drop(target);
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(id);

        assert!(!fx.broker.targets.contains(id));
        assert_eq!(fx.broker.request_count(), 0);
        for client in clients.iter_mut() {
            let outcome = client.read_record().unwrap();
            assert_eq!(outcome.lookup_bool(attr::RESULT), Some(false));
        }

        let mut late = fx.request(&contact, "T");
        let outcome = late.read_record().unwrap();
        assert_eq!(outcome.lookup_bool(attr::RESULT), Some(false));
    }

    #[test]
    fn test_heartbeat_answered() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let id = id_of(&reply);

        target.send_record(&Record::with_command(Command::Alive)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(id);
        assert_eq!(target.read_record().unwrap().command(), Some(Command::Alive));
        assert!(fx.broker.targets.contains(id));
    }

    #[test]
    fn test_sweep_expires_departed_targets() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (live, live_reply) = fx.register(None);
        let (gone, gone_reply) = fx.register(None);
        let live_id = id_of(&live_reply);
        let gone_id = id_of(&gone_reply);

        drop(gone);
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.handle_target_message(gone_id);
        assert!(fx.broker.reconnect.contains(gone_id));

        // age both records past the expiry threshold
        for id in [live_id, gone_id] {
            fx.broker.reconnect.get_mut(id).unwrap().last_alive = 0;
        }
        let now = fx.broker.last_sweep + 1000;
        fx.broker.sweep_reconnect_info(now);

        assert!(fx.broker.reconnect.contains(live_id));
        assert!(!fx.broker.reconnect.contains(gone_id));
        assert_eq!(fx.broker.reconnect.get(live_id).unwrap().last_alive, now);
        drop(live);
    }

    #[test]
    fn test_fresh_ids_skip_reserved_reconnect_records() {
        let mut fx = Fixture::new(PollMode::Auto);
        let next = fx.broker.target_ids.peek();
        fx.broker
            .reconnect
            .insert(ReconnectInfo::new(next, 1, "10.9.9.9", now_ts()));

        let (_target, reply) = fx.register(None);
        assert_ne!(id_of(&reply), next);
    }

    #[test]
    fn test_shutdown_notifies_targets_and_clients() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let mut client = fx.request(&contact, "S");
        let _forward = target.read_record().unwrap();

        fx.broker.shutdown();

        assert_eq!(target.read_record().unwrap().command(), Some(Command::Shutdown));
        let outcome = client.read_record().unwrap();
        assert_eq!(outcome.lookup_str(attr::ERROR_STRING), Some(SHUTTING_DOWN));
        assert_eq!(fx.broker.target_count(), 0);
    }

    fn send_alives(target: &mut Connection, count: usize) {
        for _ in 0..count {
            target.send_record(&Record::with_command(Command::Alive)).unwrap();
        }
    }

    fn expect_acks(target: &mut Connection, count: usize) {
        for _ in 0..count {
            assert_eq!(target.read_record().unwrap().command(), Some(Command::Alive));
        }
    }

    #[test]
    fn test_chatty_target_deferred_then_drained() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let id = id_of(&reply);

        send_alives(&mut target, MAX_MESSAGES_PER_WAKEUP + 4);
        std::thread::sleep(Duration::from_millis(50));

        fx.broker.service_target(id);
        assert_eq!(fx.broker.deferred.len(), 1);
        assert!(fx.broker.deferred.contains(&id));
        assert_eq!(fx.broker.next_timeout(Instant::now()), Duration::ZERO);
        expect_acks(&mut target, MAX_MESSAGES_PER_WAKEUP);

        fx.broker.run_deferred();
        assert!(fx.broker.deferred.is_empty());
        expect_acks(&mut target, 4);
        assert!(fx.broker.targets.contains(id));
    }

    #[test]
    fn test_drained_target_leaves_deferred_queue() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (mut target, reply) = fx.register(None);
        let id = id_of(&reply);

        send_alives(&mut target, MAX_MESSAGES_PER_WAKEUP + 4);
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.service_target(id);
        assert!(fx.broker.deferred.contains(&id));

        // another readiness event drains the rest before the deferred pass
        fx.broker.service_target(id);
        assert!(fx.broker.deferred.is_empty());
        expect_acks(&mut target, MAX_MESSAGES_PER_WAKEUP + 4);

        // a stale queue entry must not block on the empty socket
        fx.broker.deferred.push_back(id);
        let started = Instant::now();
        fx.broker.run_deferred();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(fx.broker.deferred.is_empty());
        assert!(fx.broker.targets.contains(id));

        target.send_record(&Record::with_command(Command::Alive)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        fx.broker.service_target(id);
        expect_acks(&mut target, 1);
    }

    #[test]
    fn test_watcher_drain_is_bounded() {
        let mut fx = Fixture::new(PollMode::Auto);
        assert!(fx.broker.watcher.watches_all_targets());
        let mut targets: Vec<Connection> = (0..MAX_WATCHER_EVENTS + 1)
            .map(|_| fx.register(None).0)
            .collect();
        for target in targets.iter_mut() {
            send_alives(target, 1);
        }
        std::thread::sleep(Duration::from_millis(100));

        fx.broker.drain_watcher();
        assert!(fx.broker.watcher_backlog);
        assert_eq!(fx.broker.next_timeout(Instant::now()), Duration::ZERO);

        fx.broker.run_deferred();
        assert!(!fx.broker.watcher_backlog);
        for target in targets.iter_mut() {
            expect_acks(target, 1);
        }
        assert_eq!(fx.broker.target_count(), MAX_WATCHER_EVENTS + 1);
    }

    #[test]
    fn test_forward_failure_fails_only_the_request() {
        let mut fx = Fixture::new(PollMode::Scan);
        let (_target, reply) = fx.register(None);
        let contact = reply.lookup_str(attr::CCBID).unwrap().to_string();
        let id = id_of(&reply);
        fx.break_target(id);

        let mut client = fx.request(&contact, "S");
        let outcome = client.read_record().unwrap();
        assert_eq!(outcome.lookup_bool(attr::RESULT), Some(false));
        assert_eq!(outcome.lookup_str(attr::ERROR_STRING), Some(FORWARD_FAILED));

        assert_eq!(fx.broker.request_count(), 0);
        let target = fx.broker.targets.get(id).unwrap();
        assert_eq!(target.pending_results(), 0);
        assert!(target.active_token().is_none());
        assert!(fx
            .broker
            .endpoints
            .values()
            .all(|endpoint| !matches!(endpoint, Endpoint::Target(_))));
    }

    #[test]
    fn test_silent_connection_dropped_after_command_timeout() {
        let mut fx = Fixture::with_config(PollMode::Auto, |config| config.command_timeout_secs = 5);
        let mut silent = Connection::connect(fx.broker.local_addr().unwrap(), TIMEOUT).unwrap();
        fx.broker.accept_connections();
        assert_eq!(fx.broker.pending.len(), 1);

        let now = Instant::now();
        fx.broker.run_timers(now + Duration::from_secs(1));
        assert_eq!(fx.broker.pending.len(), 1);

        fx.broker.run_timers(now + Duration::from_secs(6));
        assert!(fx.broker.pending.is_empty());
        assert!(fx.broker.endpoints.is_empty());
        assert!(silent.read_record().is_err());
    }

    #[test]
    fn test_heartbeat_tick_drops_unreachable_targets() {
        let mut fx = Fixture::with_config(PollMode::Auto, |config| config.heartbeat_interval_secs = 10);
        let (mut healthy, healthy_reply) = fx.register(None);
        let (_broken, broken_reply) = fx.register(None);
        let healthy_id = id_of(&healthy_reply);
        let broken_id = id_of(&broken_reply);
        fx.break_target(broken_id);

        let now = Instant::now();
        fx.broker.run_timers(now);
        assert_eq!(fx.broker.target_count(), 2);

        let tick = now + Duration::from_secs(11);
        fx.broker.run_timers(tick);
        expect_acks(&mut healthy, 1);
        assert!(fx.broker.targets.contains(healthy_id));
        assert!(!fx.broker.targets.contains(broken_id));
        assert_eq!(fx.broker.next_heartbeat, Some(tick + Duration::from_secs(10)));
    }

    #[test]
    fn test_reconfigure_applies_live_settings() {
        let mut fx = Fixture::new(PollMode::Auto);
        let (_target, _reply) = fx.register(None);
        let listen = fx.broker.config.listen;
        let old_log = fx.broker.reconnect.path().unwrap().to_path_buf();
        fx.broker.reconnect.flush();
        assert!(old_log.exists());

        let before = Instant::now();
        fx.broker.reconfigure(BrokerConfig {
            listen: "127.0.0.1:1".parse().unwrap(),
            poll_mode: PollMode::Scan,
            reconnect_file: Some(fx.dir.path().join("moved")),
            sweep_interval_secs: 50,
            heartbeat_interval_secs: 60,
            reconnect_allow_any_ip: true,
            ..BrokerConfig::default()
        });

        assert_eq!(fx.broker.config.listen, listen);
        assert_eq!(fx.broker.config.poll_mode, PollMode::Auto);
        assert_eq!(fx.broker.watcher.name(), "epoll");
        assert_eq!(fx.broker.config.sweep_interval_secs, 50);
        assert!(fx.broker.config.reconnect_allow_any_ip);

        let new_log = fx.dir.path().join("moved.ccb_reconnect");
        assert_eq!(fx.broker.reconnect.path(), Some(new_log.as_path()));
        assert!(new_log.exists());
        assert!(!old_log.exists());
        assert!(fx.broker.next_heartbeat.unwrap() >= before + Duration::from_secs(60));
        assert_eq!(fx.broker.target_count(), 1);
    }
}
