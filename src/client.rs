//! Peer-side helpers for talking to a CCB broker
//!
//! - `TargetSession`: a daemon that registers and then waits for forwarded
//!   requests on its persistent connection.
//! - `request_reverse_connect`: a client asking a target (by contact string)
//!   to connect back to it.
//!
//! Both are blocking and use the same framed records as the broker.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::ccbid::{split_contact, target_id_from_contact, TargetId};
use crate::connection::Connection;
use crate::error::ClientError;
use crate::message::{attr, Command, Record};

/// What a target needs to remember to reclaim its ccbid later
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// `<broker-address>#<ccbid>`, handed out in place of the target's address
    pub ccb_contact: String,
    /// Reconnect cookie as sent by the broker
    pub cookie: String,
}

/// A request the broker forwarded to this target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRequest {
    /// Broker's id for the request, echoed back in the result
    pub request_id: String,
    /// Where the client waits for the reverse connection
    pub return_address: String,
    /// Secret to present to the client and echo back to the broker
    pub connect_id: String,
    pub requester: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Request(ForwardedRequest),
    /// Heartbeat ack or broker keepalive
    Alive,
    /// The broker is going away
    Shutdown,
}

// ============================================================================
// Target side
// ============================================================================

pub struct TargetSession {
    conn: Connection,
    registration: Registration,
}

impl TargetSession {
    /// Register with the broker at `broker`, optionally reclaiming a
    /// previous registration.
    pub fn register(
        broker: &str,
        name: &str,
        previous: Option<&Registration>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut conn = Connection::connect(resolve(broker)?, timeout)?;

        let mut msg = Record::with_command(Command::Register);
        msg.assign(attr::NAME, name);
        if let Some(prev) = previous {
            msg.assign(attr::CCBID, prev.ccb_contact.as_str())
                .assign(attr::CLAIM_ID, prev.cookie.as_str());
        }
        conn.send_record(&msg)?;

        let reply = conn.read_record()?;
        let (contact, cookie) = match (reply.lookup_str(attr::CCBID), reply.lookup_str(attr::CLAIM_ID)) {
            (Some(contact), Some(cookie)) => (contact.to_string(), cookie.to_string()),
            _ => {
                return Err(ClientError::Protocol(format!(
                    "registration reply missing ccbid or cookie: {}",
                    reply
                )))
            }
        };

        log::debug!("Registered with CCB broker {} as {}", broker, contact);
        Ok(TargetSession {
            conn,
            registration: Registration {
                ccb_contact: contact,
                cookie,
            },
        })
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// The ccbid part of the contact string
    pub fn target_id(&self) -> Option<TargetId> {
        target_id_from_contact(&self.registration.ccb_contact)
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        Ok(self.conn.set_timeout(timeout)?)
    }

    /// Wait for the next message from the broker
    pub fn next_event(&mut self) -> Result<TargetEvent, ClientError> {
        let msg = self.conn.read_record()?;
        match msg.command() {
            Some(Command::Alive) => Ok(TargetEvent::Alive),
            Some(Command::Shutdown) => Ok(TargetEvent::Shutdown),
            Some(Command::Request) => {
                let field = |key: &str| {
                    msg.lookup_str(key).map(str::to_string).ok_or_else(|| {
                        ClientError::Protocol(format!("forwarded request missing {}", key))
                    })
                };
                Ok(TargetEvent::Request(ForwardedRequest {
                    request_id: field(attr::REQUEST_ID)?,
                    return_address: field(attr::MY_ADDRESS)?,
                    connect_id: field(attr::CLAIM_ID)?,
                    requester: msg.lookup_str(attr::NAME).map(str::to_string),
                }))
            }
            _ => Err(ClientError::Protocol(format!("unexpected message from broker: {}", msg))),
        }
    }

    /// Tell the broker how a forwarded request went
    pub fn report_result(
        &mut self,
        request_id: &str,
        connect_id: &str,
        success: bool,
        error: &str,
    ) -> Result<(), ClientError> {
        let mut msg = Record::new();
        msg.assign(attr::RESULT, success)
            .assign(attr::ERROR_STRING, error)
            .assign(attr::REQUEST_ID, request_id)
            .assign(attr::CLAIM_ID, connect_id);
        self.send(&msg)
    }

    pub fn send_alive(&mut self) -> Result<(), ClientError> {
        self.send(&Record::with_command(Command::Alive))
    }

    /// Send an arbitrary record on the registration connection
    pub fn send(&mut self, msg: &Record) -> Result<(), ClientError> {
        Ok(self.conn.send_record(msg)?)
    }
}

// ============================================================================
// Requester side
// ============================================================================

/// How the broker says a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub success: bool,
    pub error: String,
}

/// A request sent to the broker, waiting for its reply
pub struct PendingReverseConnect {
    conn: Connection,
}

impl PendingReverseConnect {
    /// Block until the broker relays the target's result
    pub fn wait_reply(mut self) -> Result<RequestOutcome, ClientError> {
        let reply = self.conn.read_record()?;
        let success = reply.lookup_bool(attr::RESULT).ok_or_else(|| {
            ClientError::Protocol(format!("request reply missing result: {}", reply))
        })?;
        Ok(RequestOutcome {
            success,
            error: reply.lookup_str(attr::ERROR_STRING).unwrap_or("").to_string(),
        })
    }

    /// Give up on the request; the broker forgets it when the socket closes
    pub fn cancel(self) {}
}

/// Ask the target behind `contact` to connect to `my_address`, presenting
/// `connect_id`.
pub fn request_reverse_connect(
    contact: &str,
    my_address: &str,
    connect_id: &str,
    timeout: Duration,
) -> Result<PendingReverseConnect, ClientError> {
    let (broker, _) =
        split_contact(contact).ok_or_else(|| ClientError::BadContact(contact.to_string()))?;
    let mut conn = Connection::connect(resolve(broker)?, timeout)?;

    let mut msg = Record::with_command(Command::Request);
    msg.assign(attr::CCBID, contact)
        .assign(attr::MY_ADDRESS, my_address)
        .assign(attr::CLAIM_ID, connect_id);
    conn.send_record(&msg)?;

    log::debug!("Sent reverse connect request for {} to {}", contact, broker);
    Ok(PendingReverseConnect { conn })
}

fn resolve(address: &str) -> Result<SocketAddr, ClientError> {
    address
        .to_socket_addrs()
        .map_err(|_| ClientError::BadContact(address.to_string()))?
        .next()
        .ok_or_else(|| ClientError::BadContact(address.to_string()))
}
