//! MME Event Definitions
//!
//! Everything the MME state machine consumes travels as one `MmeEvent`
//! over a single unbounded channel, so handlers run strictly one at a time.

use std::net::SocketAddr;

use ogs_core::OgsPkbuf;
use tokio::sync::mpsc;

use crate::context::{EnbUeId, MmeUeId, SessId};
use crate::gtp_path::GtpXactId;
use crate::nas_security::SecurityHeaderType;
use crate::s11_build::GtpCause;
use crate::s1ap_message::S1apMessage;

/// Event types for MME
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmeEventId {
    S1apMessage,
    S1apLoSctpCommUp,
    S1apLoConnRefused,
    EmmMessage,
    EsmMessage,
    S11Message,
    S11Timer,
    Paging,
}

impl MmeEventId {
    pub fn name(&self) -> &'static str {
        match self {
            MmeEventId::S1apMessage => "MME_EVT_S1AP_MESSAGE",
            MmeEventId::S1apLoSctpCommUp => "MME_EVT_S1AP_LO_SCTP_COMM_UP",
            MmeEventId::S1apLoConnRefused => "MME_EVT_S1AP_LO_CONNREFUSED",
            MmeEventId::EmmMessage => "MME_EVT_EMM_MESSAGE",
            MmeEventId::EsmMessage => "MME_EVT_ESM_MESSAGE",
            MmeEventId::S11Message => "MME_EVT_S11_MESSAGE",
            MmeEventId::S11Timer => "MME_EVT_S11_TIMER",
            MmeEventId::Paging => "MME_EVT_PAGING",
        }
    }
}

/// Decoded GTPv2-C response, reduced to what the S11 handler matches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S11Response {
    pub message_type: u8,
    pub sequence_number: u32,
    pub teid: u32,
    pub cause: Option<GtpCause>,
}

#[derive(Debug)]
pub enum MmeEvent {
    /// Decoded S1AP PDU from an eNB association
    S1apMessage {
        enb_addr: SocketAddr,
        message: S1apMessage,
    },
    /// New S1AP association
    S1apLinkUp { enb_addr: SocketAddr },
    /// S1AP association lost
    S1apLinkDown { enb_addr: SocketAddr },
    /// Plain NAS EMM message for the session layer
    EmmMessage {
        enb_ue: EnbUeId,
        security_header_type: SecurityHeaderType,
        pkbuf: OgsPkbuf,
    },
    /// Plain NAS ESM message for the session layer
    EsmMessage {
        sess: SessId,
        security_header_type: SecurityHeaderType,
        pkbuf: OgsPkbuf,
    },
    /// GTPv2-C response from the SGW
    S11Message(S11Response),
    /// GTP transaction out of retransmissions
    S11Timeout { xact: GtpXactId },
    /// Page an idle UE
    Paging { mme_ue: MmeUeId },
}

impl MmeEvent {
    pub fn id(&self) -> MmeEventId {
        match self {
            MmeEvent::S1apMessage { .. } => MmeEventId::S1apMessage,
            MmeEvent::S1apLinkUp { .. } => MmeEventId::S1apLoSctpCommUp,
            MmeEvent::S1apLinkDown { .. } => MmeEventId::S1apLoConnRefused,
            MmeEvent::EmmMessage { .. } => MmeEventId::EmmMessage,
            MmeEvent::EsmMessage { .. } => MmeEventId::EsmMessage,
            MmeEvent::S11Message(_) => MmeEventId::S11Message,
            MmeEvent::S11Timeout { .. } => MmeEventId::S11Timer,
            MmeEvent::Paging { .. } => MmeEventId::Paging,
        }
    }

    pub fn name(&self) -> &'static str {
        self.id().name()
    }
}

pub type MmeEventSender = mpsc::UnboundedSender<MmeEvent>;
pub type MmeEventReceiver = mpsc::UnboundedReceiver<MmeEvent>;

pub fn event_channel() -> (MmeEventSender, MmeEventReceiver) {
    mpsc::unbounded_channel()
}
