//! S11 Message Building
//!
//! GTPv2-C header and the two requests the MME issues toward the SGW from
//! the S1AP side: Modify Bearer Request and Release Access Bearers Request.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::context::{IpAddr, MmeBearer};

// ============================================================================
// Constants
// ============================================================================

/// GTPv2-C version
pub const GTP2_VERSION: u8 = 2;
/// Fixed header length with TEID
pub const GTP2_HEADER_LEN: usize = 12;
/// Sequence numbers are 24 bits wide
pub const GTP2_MAX_SEQUENCE_NUMBER: u32 = 0x00ff_ffff;

/// GTPv2-C message types
pub mod message_type {
    pub const MODIFY_BEARER_REQUEST: u8 = 34;
    pub const MODIFY_BEARER_RESPONSE: u8 = 35;
    pub const RELEASE_ACCESS_BEARERS_REQUEST: u8 = 170;
    pub const RELEASE_ACCESS_BEARERS_RESPONSE: u8 = 171;
}

/// GTPv2-C IE types
pub mod ie_type {
    pub const CAUSE: u8 = 2;
    pub const EBI: u8 = 73;
    pub const F_TEID: u8 = 87;
    pub const BEARER_CONTEXT: u8 = 93;
}

/// F-TEID interface type for the eNodeB S1-U endpoint
pub const F_TEID_S1_U_ENODEB_GTP_U: u8 = 0;

/// GTP cause values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GtpCause {
    Reserved = 0,
    RequestAccepted = 16,
    RequestAcceptedPartially = 17,
    ContextNotFound = 64,
    MandatoryIeMissing = 70,
    SystemFailure = 72,
    NoResourcesAvailable = 73,
    Unknown = 255,
}

impl From<u8> for GtpCause {
    fn from(value: u8) -> Self {
        match value {
            0 => GtpCause::Reserved,
            16 => GtpCause::RequestAccepted,
            17 => GtpCause::RequestAcceptedPartially,
            64 => GtpCause::ContextNotFound,
            70 => GtpCause::MandatoryIeMissing,
            72 => GtpCause::SystemFailure,
            73 => GtpCause::NoResourcesAvailable,
            _ => GtpCause::Unknown,
        }
    }
}

impl GtpCause {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GtpCause::RequestAccepted | GtpCause::RequestAcceptedPartially)
    }
}

// ============================================================================
// Build Error
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S11BuildError {
    #[error("no eNB S1-U address on bearer (EBI:{ebi})")]
    MissingEnbS1uAddress { ebi: u8 },
    #[error("GTPv2-C payload too long ({0} octets)")]
    PayloadTooLong(usize),
}

pub type S11BuildResult<T> = Result<T, S11BuildError>;

// ============================================================================
// Header
// ============================================================================

/// GTPv2-C header (T=1 form only; every S11 message the MME sends carries a TEID)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtp2Header {
    pub message_type: u8,
    pub teid: u32,
    pub sequence_number: u32,
}

impl Gtp2Header {
    pub fn new(message_type: u8, teid: u32) -> Self {
        Self {
            message_type,
            teid,
            sequence_number: 0,
        }
    }

    /// Prepend the header to `payload`
    pub fn encode(&self, payload: &[u8]) -> S11BuildResult<Bytes> {
        // Length counts everything after the first 4 octets
        let length = u16::try_from(payload.len() + GTP2_HEADER_LEN - 4)
            .map_err(|_| S11BuildError::PayloadTooLong(payload.len()))?;

        let mut buf = BytesMut::with_capacity(GTP2_HEADER_LEN + payload.len());
        buf.put_u8((GTP2_VERSION << 5) | 0x08);
        buf.put_u8(self.message_type);
        buf.put_u16(length);
        buf.put_u32(self.teid);
        buf.put_u32((self.sequence_number & GTP2_MAX_SEQUENCE_NUMBER) << 8);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Parse a header, returning it with the IE area that follows
    pub fn decode(mut buf: Bytes) -> Option<(Self, Bytes)> {
        if buf.len() < GTP2_HEADER_LEN {
            return None;
        }
        let flags = buf.get_u8();
        if flags >> 5 != GTP2_VERSION || flags & 0x08 == 0 {
            return None;
        }
        let message_type = buf.get_u8();
        let length = buf.get_u16() as usize;
        let teid = buf.get_u32();
        let sequence_number = buf.get_u32() >> 8;

        let ie_len = length.checked_sub(GTP2_HEADER_LEN - 4)?;
        if ie_len > buf.len() {
            return None;
        }
        Some((
            Self {
                message_type,
                teid,
                sequence_number,
            },
            buf.split_to(ie_len),
        ))
    }
}

/// First Cause IE value in an IE area
pub fn find_cause(mut ies: Bytes) -> Option<GtpCause> {
    while ies.len() >= 4 {
        let ie = ies.get_u8();
        let len = ies.get_u16() as usize;
        let _instance = ies.get_u8();
        if len > ies.len() {
            return None;
        }
        let value = ies.split_to(len);
        if ie == ie_type::CAUSE && !value.is_empty() {
            return Some(GtpCause::from(value[0]));
        }
    }
    None
}

// ============================================================================
// IE Writer
// ============================================================================

/// IE writer over a growable buffer
#[derive(Debug, Default)]
struct GtpBuffer {
    data: BytesMut,
}

impl GtpBuffer {
    fn write_ie_header(&mut self, ie_type: u8, length: u16, instance: u8) {
        self.data.put_u8(ie_type);
        self.data.put_u16(length);
        self.data.put_u8(instance & 0x0f);
    }

    fn write_ebi(&mut self, ebi: u8, instance: u8) {
        self.write_ie_header(ie_type::EBI, 1, instance);
        self.data.put_u8(ebi & 0x0f);
    }

    fn write_f_teid(&mut self, interface_type: u8, teid: u32, addr: &IpAddr, instance: u8) {
        let mut flags = interface_type & 0x3f;
        let mut len = 5;
        if addr.ipv4.is_some() {
            flags |= 0x80;
            len += 4;
        }
        if addr.ipv6.is_some() {
            flags |= 0x40;
            len += 16;
        }

        self.write_ie_header(ie_type::F_TEID, len, instance);
        self.data.put_u8(flags);
        self.data.put_u32(teid);
        if let Some(v4) = addr.ipv4 {
            self.data.put_slice(&v4);
        }
        if let Some(v6) = addr.ipv6 {
            self.data.put_slice(&v6);
        }
    }

    /// Wrap `inner` as a grouped IE
    fn write_grouped(&mut self, ie_type: u8, instance: u8, inner: GtpBuffer) -> S11BuildResult<()> {
        let len = u16::try_from(inner.data.len())
            .map_err(|_| S11BuildError::PayloadTooLong(inner.data.len()))?;
        self.write_ie_header(ie_type, len, instance);
        self.data.put_slice(&inner.data);
        Ok(())
    }

    fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

// ============================================================================
// Build Functions
// ============================================================================

/// Modify Bearer Request payload: one Bearer Context carrying the eNB S1-U F-TEID
pub fn build_modify_bearer_request(bearer: &MmeBearer) -> S11BuildResult<Bytes> {
    let addr = bearer
        .enb_s1u_addr
        .as_ref()
        .ok_or(S11BuildError::MissingEnbS1uAddress { ebi: bearer.ebi })?;

    let mut bearer_context = GtpBuffer::default();
    bearer_context.write_ebi(bearer.ebi, 0);
    bearer_context.write_f_teid(F_TEID_S1_U_ENODEB_GTP_U, bearer.enb_s1u_teid, addr, 0);

    let mut buf = GtpBuffer::default();
    buf.write_grouped(ie_type::BEARER_CONTEXT, 0, bearer_context)?;
    Ok(buf.freeze())
}

/// Release Access Bearers Request payload. The request carries no
/// mandatory IE; the TEID in the header names the UE.
pub fn build_release_access_bearers_request() -> Bytes {
    Bytes::new()
}

// ============================================================================
// Unit Tests
// ============================================================================
