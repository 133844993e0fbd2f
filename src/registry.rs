//! Live targets and outstanding client requests
//!
//! The registry maintains:
//! - TargetId → registered target daemon and the requests routed to it
//! - RequestId → client connection waiting for a rendezvous result
//!
//! Ids are the only links between the two maps; tearing down a target is
//! done explicitly by the broker, which walks the target's request set.

use std::collections::{HashMap, HashSet};

use mio::Token;

use crate::ccbid::{RequestId, TargetId};
use crate::connection::Connection;

// ============================================================================
// Target
// ============================================================================

/// A registered daemon and its persistent connection
#[derive(Debug)]
pub struct Target {
    id: TargetId,
    conn: Connection,
    /// Forwarded requests whose result has not arrived yet
    pending_results: u32,
    /// Requests currently routed to this target
    requests: HashSet<RequestId>,
    /// Reactor token while the connection is actively watched
    active_token: Option<Token>,
    /// Marked for graceful shutdown
    shutdown_pending: bool,
}

impl Target {
    pub fn new(id: TargetId, conn: Connection) -> Self {
        Target {
            id,
            conn,
            pending_results: 0,
            requests: HashSet::new(),
            active_token: None,
            shutdown_pending: false,
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn pending_results(&self) -> u32 {
        self.pending_results
    }

    pub fn requests(&self) -> &HashSet<RequestId> {
        &self.requests
    }

    /// Route a request to this target.
    ///
    /// Returns true when this is the first pending result, i.e. the
    /// connection should be promoted to active observation.
    pub fn add_request(&mut self, request_id: RequestId) -> bool {
        self.requests.insert(request_id);
        self.pending_results += 1;
        self.pending_results == 1
    }

    /// Forget a request (answered, abandoned, or its client left)
    pub fn remove_request(&mut self, request_id: RequestId) {
        self.requests.remove(&request_id);
    }

    /// Account for one result message.
    ///
    /// Returns true when no more results are expected, i.e. the connection
    /// can drop back to slow polling.
    pub fn result_received(&mut self) -> bool {
        self.pending_results = self.pending_results.saturating_sub(1);
        self.pending_results == 0
    }

    pub fn active_token(&self) -> Option<Token> {
        self.active_token
    }

    pub fn set_active_token(&mut self, token: Option<Token>) {
        self.active_token = token;
    }

    pub fn is_shutdown_pending(&self) -> bool {
        self.shutdown_pending
    }

    pub fn mark_shutdown(&mut self) {
        self.shutdown_pending = true;
    }
}

/// Live targets by TargetId
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: HashMap<TargetId, Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a target under its id.
    ///
    /// At most one live target per id: an occupied id hands the target back.
    pub fn insert(&mut self, target: Target) -> Result<(), Target> {
        if self.targets.contains_key(&target.id) {
            return Err(target);
        }
        log::debug!(
            "Registering target {} with ccbid {}",
            target.conn.peer_description(),
            target.id
        );
        self.targets.insert(target.id, target);
        Ok(())
    }

    pub fn remove(&mut self, id: TargetId) -> Option<Target> {
        self.targets.remove(&id)
    }

    pub fn get(&self, id: TargetId) -> Option<&Target> {
        self.targets.get(&id)
    }

    pub fn get_mut(&mut self, id: TargetId) -> Option<&mut Target> {
        self.targets.get_mut(&id)
    }

    pub fn contains(&self, id: TargetId) -> bool {
        self.targets.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<TargetId> {
        self.targets.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TargetId, &Target)> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

// ============================================================================
// Client requests
// ============================================================================

/// A client waiting for a reverse connection from a target
#[derive(Debug)]
pub struct ClientRequest {
    pub id: RequestId,
    pub target_id: TargetId,
    pub conn: Connection,
    /// Where the target should connect back to
    pub return_addr: String,
    /// Secret the target must echo back with its result
    pub connect_id: String,
    /// Reactor token watching the client for an early hangup
    pub token: Option<Token>,
}

impl ClientRequest {
    pub fn new(target_id: TargetId, conn: Connection, return_addr: String, connect_id: String) -> Self {
        ClientRequest {
            id: 0,
            target_id,
            conn,
            return_addr,
            connect_id,
            token: None,
        }
    }
}

/// Outstanding client requests by RequestId
#[derive(Debug, Default)]
pub struct RequestTable {
    requests: HashMap<RequestId, ClientRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: ClientRequest) -> Result<(), ClientRequest> {
        if self.requests.contains_key(&request.id) {
            return Err(request);
        }
        self.requests.insert(request.id, request);
        Ok(())
    }

    pub fn remove(&mut self, id: RequestId) -> Option<ClientRequest> {
        self.requests.remove(&id)
    }

    pub fn get(&self, id: RequestId) -> Option<&ClientRequest> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut ClientRequest> {
        self.requests.get_mut(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    fn make_conn(listener: &TcpListener) -> Connection {
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        Connection::new(stream, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_pending_results_promotion() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut target = Target::new(7, make_conn(&listener));

        assert!(target.add_request(1));
        assert!(!target.add_request(2));
        assert_eq!(target.pending_results(), 2);
        assert_eq!(target.requests().len(), 2);

        assert!(!target.result_received());
        target.remove_request(1);
        assert!(target.result_received());
        target.remove_request(2);
        assert!(target.requests().is_empty());

        // a stray result never underflows
        assert!(target.result_received());
        assert_eq!(target.pending_results(), 0);
    }

    #[test]
    fn test_one_target_per_id() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut registry = TargetRegistry::new();

        registry.insert(Target::new(7, make_conn(&listener))).unwrap();
        let rejected = registry.insert(Target::new(7, make_conn(&listener)));
        assert!(rejected.is_err());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(7).is_some());
        assert!(registry.is_empty());
        registry.insert(Target::new(7, make_conn(&listener))).unwrap();
        assert!(registry.contains(7));
    }

    #[test]
    fn test_request_table() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = RequestTable::new();

        let mut request = ClientRequest::new(7, make_conn(&listener), "1.2.3.4:9".into(), "S".into());
        request.id = 1;
        table.insert(request).unwrap();

        let mut dup = ClientRequest::new(7, make_conn(&listener), "1.2.3.4:9".into(), "T".into());
        dup.id = 1;
        assert!(table.insert(dup).is_err());

        assert_eq!(table.get(1).map(|r| r.connect_id.as_str()), Some("S"));
        assert_eq!(table.ids(), vec![1]);
        assert!(table.remove(1).is_some());
        assert!(table.is_empty());
    }
}
