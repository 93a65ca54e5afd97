//! MME GTP Path Management
//!
//! S11 transactions toward the SGW. Each outgoing request is wrapped in a
//! `GtpXact` that owns its sequence number, peer and encoded payload until
//! the response (or the final retransmission timeout) completes it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use ogs_core::{ogs_next_id, OgsPool, OgsPoolId, PoolError};
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::app::MmeApp;
use crate::context::{ContextError, EnbUeId, MmeUeId, SessId};
use crate::error::ErrorClass;
use crate::event::S11Response;
use crate::s11_build::{self, message_type, Gtp2Header, S11BuildError, GTP2_MAX_SEQUENCE_NUMBER};

/// Response timer per attempt
pub const GTP_T3_RESPONSE: Duration = Duration::from_secs(3);
/// Attempts before a transaction times out
pub const GTP_N3_REQUESTS: u8 = 3;

pub type GtpXactId = OgsPoolId<GtpXact>;

#[derive(Error, Debug)]
pub enum GtpPathError {
    #[error(transparent)]
    Build(#[from] S11BuildError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("no SGW selected for UE [{0}]")]
    NoSgw(String),
    #[error("GTP transaction {0:?} not found")]
    XactNotFound(GtpXactId),
    #[error("GTP transaction {0:?} already committed")]
    AlreadyCommitted(GtpXactId),
    #[error("send to {peer} failed: {source}")]
    Send {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type GtpPathResult<T> = Result<T, GtpPathError>;

impl GtpPathError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GtpPathError::Context(e) => e.class(),
            GtpPathError::XactNotFound(_) => ErrorClass::NotFound,
            _ => ErrorClass::Fatal,
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// What to do when the response arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtpXactAction {
    ModifyBearer {
        mme_ue: MmeUeId,
        sess: SessId,
    },
    ReleaseAccessBearers {
        enb_ue: EnbUeId,
        mme_ue: MmeUeId,
        sess: SessId,
    },
}

impl GtpXactAction {
    pub fn mme_ue(&self) -> MmeUeId {
        match self {
            GtpXactAction::ModifyBearer { mme_ue, .. }
            | GtpXactAction::ReleaseAccessBearers { mme_ue, .. } => *mme_ue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtpXactState {
    Initial,
    Committed,
}

/// Local (MME originated) GTP-C transaction
#[derive(Debug, Clone)]
pub struct GtpXact {
    /// Local S11 address
    pub local: SocketAddr,
    /// SGW
    pub peer: SocketAddr,
    pub header: Gtp2Header,
    pub payload: Bytes,
    pub action: GtpXactAction,
    pub state: GtpXactState,
    /// Transmissions so far
    pub attempts: u8,
    /// Next retransmission or timeout
    pub deadline: Option<Instant>,
}

/// Outcome of a timer poll
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GtpTimerPoll {
    pub retransmitted: Vec<GtpXactId>,
    pub timed_out: Vec<GtpXactId>,
}

/// Transaction pool indexed by sequence number
#[derive(Debug)]
pub struct GtpXactPool {
    pool: OgsPool<GtpXact>,
    sqn_hash: HashMap<u32, GtpXactId>,
    sequence_number: u32,
}

impl GtpXactPool {
    pub fn new(size: usize) -> Self {
        Self {
            pool: OgsPool::new("gtp_xact", size),
            sqn_hash: HashMap::new(),
            sequence_number: 0,
        }
    }

    /// Create a transaction, assigning the next sequence number
    pub fn local_create(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        mut header: Gtp2Header,
        payload: Bytes,
        action: GtpXactAction,
    ) -> GtpPathResult<GtpXactId> {
        let sqn = ogs_next_id!(self.sequence_number, 1, GTP2_MAX_SEQUENCE_NUMBER);
        header.sequence_number = sqn;

        let id = self.pool.alloc(GtpXact {
            local,
            peer,
            header,
            payload,
            action,
            state: GtpXactState::Initial,
            attempts: 0,
            deadline: None,
        })?;
        self.sequence_number = sqn;

        // A wrapped sequence number replaces the stale mapping
        if let Some(old) = self.sqn_hash.insert(sqn, id) {
            log::warn!("GTP sequence number {} reused, dropping {:?}", sqn, old);
            self.pool.free(old);
        }

        log::debug!(
            "[{}] LOCAL Create peer [{}] type [{}] sqn [{}]",
            id,
            peer,
            header.message_type,
            sqn
        );
        Ok(id)
    }

    /// Encode and transmit a new transaction
    pub fn commit(&mut self, id: GtpXactId, sender: &mut dyn GtpSender) -> GtpPathResult<()> {
        let xact = self.pool.get_mut(id).ok_or(GtpPathError::XactNotFound(id))?;
        if xact.state == GtpXactState::Committed {
            return Err(GtpPathError::AlreadyCommitted(id));
        }

        let buf = xact.header.encode(&xact.payload)?;
        sender.send(xact.peer, buf)?;

        xact.state = GtpXactState::Committed;
        xact.attempts = 1;
        xact.deadline = Some(Instant::now() + GTP_T3_RESPONSE);
        log::debug!("[{}] LOCAL Commit peer [{}] sqn [{}]", id, xact.peer, xact.header.sequence_number);
        Ok(())
    }

    /// Retransmit expired transactions; report the ones out of attempts
    pub fn poll_timers(&mut self, now: Instant, sender: &mut dyn GtpSender) -> GtpTimerPoll {
        let mut poll = GtpTimerPoll::default();

        for id in self.pool.ids() {
            let Some(xact) = self.pool.get_mut(id) else {
                continue;
            };
            if !xact.deadline.is_some_and(|d| d <= now) {
                continue;
            }

            if xact.attempts >= GTP_N3_REQUESTS {
                xact.deadline = None;
                poll.timed_out.push(id);
                continue;
            }

            match xact.header.encode(&xact.payload) {
                Ok(buf) => {
                    if let Err(e) = sender.send(xact.peer, buf) {
                        log::error!("[{}] retransmit failed: {}", id, e);
                    }
                }
                Err(e) => log::error!("[{}] retransmit encode failed: {}", id, e),
            }
            xact.attempts += 1;
            xact.deadline = Some(now + GTP_T3_RESPONSE);
            poll.retransmitted.push(id);
        }
        poll
    }

    pub fn find_by_sqn(&self, sqn: u32) -> Option<GtpXactId> {
        self.sqn_hash.get(&sqn).copied()
    }

    pub fn get(&self, id: GtpXactId) -> Option<&GtpXact> {
        self.pool.get(id)
    }

    pub fn remove(&mut self, id: GtpXactId) -> Option<GtpXact> {
        let xact = self.pool.free(id)?;
        if self.sqn_hash.get(&xact.header.sequence_number) == Some(&id) {
            self.sqn_hash.remove(&xact.header.sequence_number);
        }
        Some(xact)
    }

    /// Outstanding Release Access Bearers transactions of a UE
    pub fn release_access_bearers_pending(&self, mme_ue: MmeUeId) -> usize {
        self.pool
            .iter()
            .filter(|(_, x)| {
                matches!(x.action, GtpXactAction::ReleaseAccessBearers { mme_ue: m, .. } if m == mme_ue)
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Non-blocking S11 egress
pub trait GtpSender {
    fn send(&mut self, peer: SocketAddr, buf: Bytes) -> GtpPathResult<()>;
}

/// UDP socket bound to the MME S11 address
#[derive(Debug, Clone)]
pub struct UdpGtpSender {
    socket: Arc<UdpSocket>,
}

impl UdpGtpSender {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl GtpSender for UdpGtpSender {
    fn send(&mut self, peer: SocketAddr, buf: Bytes) -> GtpPathResult<()> {
        self.socket
            .try_send_to(&buf, peer)
            .map(|_| ())
            .map_err(|source| GtpPathError::Send { peer, source })
    }
}

/// Decode an S11 datagram into the response event the state machine expects
pub fn decode_s11_response(buf: Bytes) -> Option<S11Response> {
    let (header, ies) = Gtp2Header::decode(buf)?;
    Some(S11Response {
        message_type: header.message_type,
        sequence_number: header.sequence_number,
        teid: header.teid,
        cause: s11_build::find_cause(ies),
    })
}

// ============================================================================
// Send Functions
// ============================================================================

fn sgw_of(app: &MmeApp, mme_ue: MmeUeId) -> GtpPathResult<SocketAddr> {
    let ue = app
        .context
        .mme_ue(mme_ue)
        .ok_or(ContextError::MmeUeNotFound(mme_ue))?;
    ue.sgw.ok_or_else(|| GtpPathError::NoSgw(ue.imsi_bcd.clone()))
}

fn create_and_commit(
    app: &mut MmeApp,
    peer: SocketAddr,
    header: Gtp2Header,
    payload: Bytes,
    action: GtpXactAction,
) -> GtpPathResult<GtpXactId> {
    let xact = app
        .xact_pool
        .local_create(app.config.gtpc, peer, header, payload, action)?;
    if let Err(e) = app.xact_pool.commit(xact, app.gtp_sender.as_mut()) {
        app.xact_pool.remove(xact);
        return Err(e);
    }
    Ok(xact)
}

/// Modify Bearer Request carrying the default bearer's eNB S1-U endpoint
pub fn send_modify_bearer_request(app: &mut MmeApp, sess: SessId) -> GtpPathResult<GtpXactId> {
    let s = app.context.sess(sess).ok_or(ContextError::SessNotFound(sess))?;
    let mme_ue = s.mme_ue;
    let header = Gtp2Header::new(message_type::MODIFY_BEARER_REQUEST, s.sgw_s11_teid);
    let payload = s11_build::build_modify_bearer_request(s.default_bearer())?;
    let peer = sgw_of(app, mme_ue)?;

    log::debug!("[{}] Modify Bearer Request (TEID:0x{:x})", sess, header.teid);
    create_and_commit(app, peer, header, payload, GtpXactAction::ModifyBearer { mme_ue, sess })
}

/// Release Access Bearers Request for one session
pub fn send_release_access_bearers_request(
    app: &mut MmeApp,
    enb_ue: EnbUeId,
    sess: SessId,
) -> GtpPathResult<GtpXactId> {
    let s = app.context.sess(sess).ok_or(ContextError::SessNotFound(sess))?;
    let mme_ue = s.mme_ue;
    let header = Gtp2Header::new(message_type::RELEASE_ACCESS_BEARERS_REQUEST, s.sgw_s11_teid);
    let payload = s11_build::build_release_access_bearers_request();
    let peer = sgw_of(app, mme_ue)?;

    log::debug!("[{}] Release Access Bearers Request (TEID:0x{:x})", sess, header.teid);
    create_and_commit(
        app,
        peer,
        header,
        payload,
        GtpXactAction::ReleaseAccessBearers { enb_ue, mme_ue, sess },
    )
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MmeContext;
    use crate::test_support::RecordingGtpSender;

    fn local() -> SocketAddr {
        "127.0.0.1:2123".parse().unwrap()
    }

    fn sgw() -> SocketAddr {
        "127.0.0.2:2123".parse().unwrap()
    }

    fn action() -> GtpXactAction {
        let mut ctx = MmeContext::with_capacity(1, 4, vec![sgw()]);
        let mme_ue = ctx.mme_ue_add("001010000000001").unwrap();
        let sess = ctx.sess_add(mme_ue, 1, 5).unwrap();
        GtpXactAction::ModifyBearer { mme_ue, sess }
    }

    #[test]
    fn test_decode_s11_response() {
        let mut header = Gtp2Header::new(message_type::RELEASE_ACCESS_BEARERS_RESPONSE, 0x55);
        header.sequence_number = 0x1234;
        let buf = header.encode(&[2, 0, 2, 0, 16, 0]).unwrap();

        let resp = decode_s11_response(buf).unwrap();
        assert_eq!(resp.message_type, message_type::RELEASE_ACCESS_BEARERS_RESPONSE);
        assert_eq!(resp.sequence_number, 0x1234);
        assert_eq!(resp.teid, 0x55);
        assert_eq!(resp.cause, Some(s11_build::GtpCause::RequestAccepted));

        assert_eq!(decode_s11_response(Bytes::from_static(&[0x48, 35, 0])), None);
    }

    #[test]
    fn test_local_create_assigns_sequence() {
        let mut pool = GtpXactPool::new(8);
        let header = Gtp2Header::new(message_type::MODIFY_BEARER_REQUEST, 0x10);
        let a = pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();
        let b = pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();

        assert_eq!(pool.get(a).unwrap().header.sequence_number, 1);
        assert_eq!(pool.get(b).unwrap().header.sequence_number, 2);
        assert_eq!(pool.find_by_sqn(2), Some(b));
        assert_eq!(pool.get(a).unwrap().state, GtpXactState::Initial);
    }

    #[test]
    fn test_commit_sends_encoded_message() {
        let mut pool = GtpXactPool::new(8);
        let mut sender = RecordingGtpSender::default();
        let header = Gtp2Header::new(message_type::RELEASE_ACCESS_BEARERS_REQUEST, 0xabcd);
        let id = pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();

        pool.commit(id, &mut sender).unwrap();
        let sent = sender.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, sgw());
        assert_eq!(sent[0].1[1], message_type::RELEASE_ACCESS_BEARERS_REQUEST);
        assert_eq!(&sent[0].1[4..8], &[0, 0, 0xab, 0xcd]);
        drop(sent);

        assert_eq!(pool.get(id).unwrap().state, GtpXactState::Committed);
        assert!(matches!(
            pool.commit(id, &mut sender),
            Err(GtpPathError::AlreadyCommitted(_))
        ));
    }

    #[test]
    fn test_remove_clears_sequence_index() {
        let mut pool = GtpXactPool::new(8);
        let header = Gtp2Header::new(message_type::MODIFY_BEARER_REQUEST, 1);
        let id = pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();

        assert!(pool.remove(id).is_some());
        assert_eq!(pool.find_by_sqn(1), None);
        assert!(pool.remove(id).is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_exhausted() {
        let mut pool = GtpXactPool::new(1);
        let header = Gtp2Header::new(message_type::MODIFY_BEARER_REQUEST, 1);
        pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();
        let err = pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        // Failed create does not consume a sequence number
        assert_eq!(pool.sequence_number, 1);
    }

    #[test]
    fn test_poll_timers_retransmits_then_times_out() {
        let mut pool = GtpXactPool::new(8);
        let mut sender = RecordingGtpSender::default();
        let header = Gtp2Header::new(message_type::MODIFY_BEARER_REQUEST, 1);
        let id = pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();
        pool.commit(id, &mut sender).unwrap();

        let mut now = Instant::now();
        assert_eq!(pool.poll_timers(now, &mut sender), GtpTimerPoll::default());

        for _ in 1..GTP_N3_REQUESTS {
            now += GTP_T3_RESPONSE;
            let poll = pool.poll_timers(now, &mut sender);
            assert_eq!(poll.retransmitted, vec![id]);
        }
        now += GTP_T3_RESPONSE;
        let poll = pool.poll_timers(now, &mut sender);
        assert_eq!(poll.timed_out, vec![id]);
        assert_eq!(sender.sent.borrow().len(), GTP_N3_REQUESTS as usize);

        // Reported once
        now += GTP_T3_RESPONSE;
        assert_eq!(pool.poll_timers(now, &mut sender), GtpTimerPoll::default());
    }

    #[test]
    fn test_release_access_bearers_pending() {
        let mut ctx = MmeContext::with_capacity(1, 4, vec![sgw()]);
        let enb = ctx.enb_add("127.0.0.9:36412".parse().unwrap()).unwrap();
        let enb_ue = ctx.enb_ue_add(enb, 1).unwrap();
        ctx.mme_ue_add("001010000000001").unwrap();
        let mme_ue = ctx.mme_ue_add("001010000000002").unwrap();
        let sess = ctx.sess_add(mme_ue, 1, 5).unwrap();

        let mut pool = GtpXactPool::new(8);
        let header = Gtp2Header::new(message_type::RELEASE_ACCESS_BEARERS_REQUEST, 1);
        let rab = GtpXactAction::ReleaseAccessBearers { enb_ue, mme_ue, sess };
        let a = pool.local_create(local(), sgw(), header, Bytes::new(), rab).unwrap();
        pool.local_create(local(), sgw(), header, Bytes::new(), rab).unwrap();
        pool.local_create(local(), sgw(), header, Bytes::new(), action()).unwrap();

        assert_eq!(pool.release_access_bearers_pending(mme_ue), 2);
        pool.remove(a);
        assert_eq!(pool.release_access_bearers_pending(mme_ue), 1);
    }
}
