//! MME S1AP Path
//!
//! Egress toward eNBs. Sending is a non-blocking hand-off to the transport
//! layer; the association itself is managed outside the MME core.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// SCTP payload protocol identifier for S1AP
pub const OGS_SCTP_S1AP_PPID: u32 = 18;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S1apPathError {
    #[error("S1AP transport to eNB [{0}] closed")]
    TransportClosed(SocketAddr),
}

pub type S1apPathResult<T> = Result<T, S1apPathError>;

/// One encoded S1AP PDU for one association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S1apOutgoing {
    pub enb_addr: SocketAddr,
    pub ppid: u32,
    pub pkbuf: Bytes,
}

pub trait S1apPath {
    fn send_to_enb(&mut self, enb_addr: SocketAddr, pkbuf: Bytes) -> S1apPathResult<()>;
}

/// Hands PDUs to the SCTP task through an unbounded queue
#[derive(Debug, Clone)]
pub struct QueueS1apPath {
    tx: mpsc::UnboundedSender<S1apOutgoing>,
}

impl QueueS1apPath {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<S1apOutgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl S1apPath for QueueS1apPath {
    fn send_to_enb(&mut self, enb_addr: SocketAddr, pkbuf: Bytes) -> S1apPathResult<()> {
        log::trace!("S1AP send to eNB [{}] ({} octets)", enb_addr, pkbuf.len());
        self.tx
            .send(S1apOutgoing {
                enb_addr,
                ppid: OGS_SCTP_S1AP_PPID,
                pkbuf,
            })
            .map_err(|_| S1apPathError::TransportClosed(enb_addr))
    }
}
