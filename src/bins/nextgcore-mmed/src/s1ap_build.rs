//! S1AP Message Building
//!
//! Outgoing S1AP PDUs. The `S1apBuild` trait is the seam toward the codec;
//! `IeS1apBuilder` lays every PDU out as
//!
//! ```text
//! PDU type | procedure code | criticality | IE container (lv16)
//! IE := id (u16) | criticality | value (lv16)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::config::MmeConfig;
use crate::context::{EpsTai, MmeUe, PlmnId};
use crate::s1ap_message::{procedure_code, S1apCause};

// ============================================================================
// Constants
// ============================================================================

/// S1AP Protocol IE IDs
pub mod protocol_ie_id {
    pub const MME_UE_S1AP_ID: u16 = 0;
    pub const CAUSE: u16 = 2;
    pub const ENB_UE_S1AP_ID: u16 = 8;
    pub const UE_PAGING_ID: u16 = 43;
    pub const TAI_LIST: u16 = 46;
    pub const MME_NAME: u16 = 61;
    pub const UE_IDENTITY_INDEX_VALUE: u16 = 80;
    pub const RELATIVE_MME_CAPACITY: u16 = 87;
    pub const UE_S1AP_IDS: u16 = 99;
    pub const SERVED_GUMMEIS: u16 = 105;
    pub const CN_DOMAIN: u16 = 109;
}

/// S1AP Criticality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Criticality {
    Reject = 0,
    Ignore = 1,
    Notify = 2,
}

/// S1AP PDU Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    InitiatingMessage = 0,
    SuccessfulOutcome = 1,
    UnsuccessfulOutcome = 2,
}

/// CNDomain
pub const CN_DOMAIN_PS: u8 = 0;

/// UE-S1AP-IDs CHOICE
const UE_S1AP_ID_PAIR: u8 = 0;
const MME_UE_S1AP_ID_ONLY: u8 = 1;

/// UEPagingID CHOICE
const UE_PAGING_ID_S_TMSI: u8 = 0;
const UE_PAGING_ID_IMSI: u8 = 1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum S1apBuildError {
    #[error("no served GUMMEI configured")]
    NoServedGummei,
    #[error("UE [{0}] has neither GUTI nor IMSI to page with")]
    NoPagingIdentity(String),
    #[error("IE {id} too long ({len} octets)")]
    IeTooLong { id: u16, len: usize },
}

pub type S1apBuildResult<T> = Result<T, S1apBuildError>;

// ============================================================================
// Builder trait
// ============================================================================

/// Outgoing S1AP messages the MME relay needs
pub trait S1apBuild {
    fn build_setup_response(&self, config: &MmeConfig) -> S1apBuildResult<Bytes>;

    fn build_ue_context_release_command(
        &self,
        enb_ue_s1ap_id: Option<u32>,
        mme_ue_s1ap_id: u32,
        cause: S1apCause,
    ) -> S1apBuildResult<Bytes>;

    fn build_paging(&self, mme_ue: &MmeUe) -> S1apBuildResult<Bytes>;
}

// ============================================================================
// S1AP Message Buffer
// ============================================================================

/// IE container under construction
#[derive(Debug, Default)]
struct S1apBuffer {
    data: BytesMut,
}

impl S1apBuffer {
    /// Append one protocol IE
    fn write_ie(&mut self, id: u16, criticality: Criticality, value: &[u8]) -> S1apBuildResult<()> {
        let len = u16::try_from(value.len()).map_err(|_| S1apBuildError::IeTooLong {
            id,
            len: value.len(),
        })?;
        self.data.put_u16(id);
        self.data.put_u8(criticality as u8);
        self.data.put_u16(len);
        self.data.put_slice(value);
        Ok(())
    }

    /// Wrap the IE container into a PDU
    fn finish(
        self,
        pdu_type: PduType,
        procedure_code: u8,
        criticality: Criticality,
    ) -> S1apBuildResult<Bytes> {
        let len = u16::try_from(self.data.len()).map_err(|_| S1apBuildError::IeTooLong {
            id: u16::from(procedure_code),
            len: self.data.len(),
        })?;
        let mut pdu = BytesMut::with_capacity(5 + self.data.len());
        pdu.put_u8(pdu_type as u8);
        pdu.put_u8(procedure_code);
        pdu.put_u8(criticality as u8);
        pdu.put_u16(len);
        pdu.put_slice(&self.data);
        Ok(pdu.freeze())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn encode_tai(tai: &EpsTai) -> [u8; 5] {
    let plmn = tai.plmn_id.to_octets();
    let tac = tai.tac.to_be_bytes();
    [plmn[0], plmn[1], plmn[2], tac[0], tac[1]]
}

/// Cause CHOICE index followed by the value
pub fn encode_cause(cause: &S1apCause) -> [u8; 2] {
    [cause.group(), cause.value() as u8]
}

fn encode_served_gummeis(config: &MmeConfig) -> S1apBuildResult<Vec<u8>> {
    if config.served_gummei.is_empty() {
        return Err(S1apBuildError::NoServedGummei);
    }

    let mut buf = Vec::new();
    buf.push(config.served_gummei.len() as u8);
    for gummei in &config.served_gummei {
        buf.push(gummei.plmn_id.len() as u8);
        for plmn in &gummei.plmn_id {
            buf.extend_from_slice(&plmn.to_octets());
        }
        buf.push(gummei.mme_gid.len() as u8);
        for gid in &gummei.mme_gid {
            buf.extend_from_slice(&gid.to_be_bytes());
        }
        buf.push(gummei.mme_code.len() as u8);
        buf.extend_from_slice(&gummei.mme_code);
    }
    Ok(buf)
}

/// IMSI digits as TBCD, filler 0xF on an odd count
fn encode_imsi_tbcd(imsi_bcd: &str) -> Vec<u8> {
    let digits: Vec<u8> = imsi_bcd
        .bytes()
        .filter(u8::is_ascii_digit)
        .map(|d| d - b'0')
        .collect();
    digits
        .chunks(2)
        .map(|pair| match pair {
            [lo, hi] => (hi << 4) | lo,
            [lo] => 0xf0 | lo,
            _ => 0xff,
        })
        .collect()
}

/// UE Identity Index Value: IMSI mod 1024
fn ue_identity_index(imsi_bcd: &str) -> u16 {
    let rem = imsi_bcd
        .bytes()
        .filter(u8::is_ascii_digit)
        .fold(0u32, |acc, d| (acc * 10 + u32::from(d - b'0')) % 1024);
    rem as u16
}

// ============================================================================
// IE-level builder
// ============================================================================

/// Builds the PDUs directly at the IE level
#[derive(Debug, Clone, Copy, Default)]
pub struct IeS1apBuilder;

impl S1apBuild for IeS1apBuilder {
    fn build_setup_response(&self, config: &MmeConfig) -> S1apBuildResult<Bytes> {
        let mut ies = S1apBuffer::default();

        if let Some(name) = &config.mme_name {
            ies.write_ie(protocol_ie_id::MME_NAME, Criticality::Ignore, name.as_bytes())?;
        }
        ies.write_ie(
            protocol_ie_id::SERVED_GUMMEIS,
            Criticality::Reject,
            &encode_served_gummeis(config)?,
        )?;
        ies.write_ie(
            protocol_ie_id::RELATIVE_MME_CAPACITY,
            Criticality::Ignore,
            &[config.relative_capacity],
        )?;

        ies.finish(PduType::SuccessfulOutcome, procedure_code::S1_SETUP, Criticality::Reject)
    }

    fn build_ue_context_release_command(
        &self,
        enb_ue_s1ap_id: Option<u32>,
        mme_ue_s1ap_id: u32,
        cause: S1apCause,
    ) -> S1apBuildResult<Bytes> {
        let mut ids = Vec::with_capacity(9);
        match enb_ue_s1ap_id {
            Some(enb_ue_s1ap_id) => {
                ids.push(UE_S1AP_ID_PAIR);
                ids.extend_from_slice(&mme_ue_s1ap_id.to_be_bytes());
                ids.extend_from_slice(&enb_ue_s1ap_id.to_be_bytes());
            }
            None => {
                ids.push(MME_UE_S1AP_ID_ONLY);
                ids.extend_from_slice(&mme_ue_s1ap_id.to_be_bytes());
            }
        }

        let mut ies = S1apBuffer::default();
        ies.write_ie(protocol_ie_id::UE_S1AP_IDS, Criticality::Reject, &ids)?;
        ies.write_ie(protocol_ie_id::CAUSE, Criticality::Ignore, &encode_cause(&cause))?;

        ies.finish(
            PduType::InitiatingMessage,
            procedure_code::UE_CONTEXT_RELEASE,
            Criticality::Reject,
        )
    }

    fn build_paging(&self, mme_ue: &MmeUe) -> S1apBuildResult<Bytes> {
        let paging_id = match &mme_ue.guti {
            Some(guti) => {
                let mut id = vec![UE_PAGING_ID_S_TMSI, guti.mme_code];
                id.extend_from_slice(&guti.m_tmsi.to_be_bytes());
                id
            }
            None if !mme_ue.imsi_bcd.is_empty() => {
                let mut id = vec![UE_PAGING_ID_IMSI];
                id.extend_from_slice(&encode_imsi_tbcd(&mme_ue.imsi_bcd));
                id
            }
            None => return Err(S1apBuildError::NoPagingIdentity(mme_ue.imsi_bcd.clone())),
        };

        let mut ies = S1apBuffer::default();
        ies.write_ie(
            protocol_ie_id::UE_IDENTITY_INDEX_VALUE,
            Criticality::Ignore,
            &ue_identity_index(&mme_ue.imsi_bcd).to_be_bytes(),
        )?;
        ies.write_ie(protocol_ie_id::UE_PAGING_ID, Criticality::Ignore, &paging_id)?;
        ies.write_ie(protocol_ie_id::CN_DOMAIN, Criticality::Ignore, &[CN_DOMAIN_PS])?;

        let mut tai_list = vec![1u8];
        tai_list.extend_from_slice(&encode_tai(&mme_ue.tai));
        ies.write_ie(protocol_ie_id::TAI_LIST, Criticality::Ignore, &tai_list)?;

        ies.finish(PduType::InitiatingMessage, procedure_code::PAGING, Criticality::Ignore)
    }
}

/// Decode a PLMN identity from its 3 TBCD octets
pub fn decode_plmn_id(octets: &[u8]) -> Option<PlmnId> {
    let octets: [u8; 3] = octets.try_into().ok()?;
    Some(PlmnId::from_octets(octets))
}

// ============================================================================
// Unit Tests
// ============================================================================
