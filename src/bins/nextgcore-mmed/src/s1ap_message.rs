//! Decoded S1AP messages
//!
//! The structures an S1AP codec hands to the MME. ASN.1 well-formedness is
//! already checked; presence and length of the fields the handlers use is
//! not, so optional IEs stay `Option` and fixed-size fields stay as the raw
//! octets received.

use std::fmt;

use bytes::Bytes;

/// S1AP procedure codes
pub mod procedure_code {
    pub const INITIAL_CONTEXT_SETUP: u8 = 9;
    pub const PAGING: u8 = 10;
    pub const INITIAL_UE_MESSAGE: u8 = 12;
    pub const UPLINK_NAS_TRANSPORT: u8 = 13;
    pub const S1_SETUP: u8 = 17;
    pub const UE_CONTEXT_RELEASE_REQUEST: u8 = 18;
    pub const UE_CAPABILITY_INFO_INDICATION: u8 = 22;
    pub const UE_CONTEXT_RELEASE: u8 = 23;
}

// ============================================================================
// Cause
// ============================================================================

/// Radio network layer causes
pub mod radio_network_cause {
    pub const UNSPECIFIED: i64 = 0;
    pub const RELEASE_DUE_TO_EUTRAN_GENERATED_REASON: i64 = 3;
    pub const UNKNOWN_MME_UE_S1AP_ID: i64 = 13;
    pub const UNKNOWN_ENB_UE_S1AP_ID: i64 = 14;
    pub const USER_INACTIVITY: i64 = 20;
    pub const RADIO_CONNECTION_WITH_UE_LOST: i64 = 21;
}

/// Transport layer causes
pub mod transport_cause {
    pub const TRANSPORT_RESOURCE_UNAVAILABLE: i64 = 0;
    pub const UNSPECIFIED: i64 = 1;
}

/// NAS causes
pub mod nas_cause {
    pub const NORMAL_RELEASE: i64 = 0;
    pub const AUTHENTICATION_FAILURE: i64 = 1;
    pub const DETACH: i64 = 2;
    pub const UNSPECIFIED: i64 = 3;
}

/// Protocol causes
pub mod protocol_cause {
    pub const TRANSFER_SYNTAX_ERROR: i64 = 0;
    pub const SEMANTIC_ERROR: i64 = 4;
    pub const UNSPECIFIED: i64 = 6;
}

/// Miscellaneous causes
pub mod misc_cause {
    pub const CONTROL_PROCESSING_OVERLOAD: i64 = 0;
    pub const OM_INTERVENTION: i64 = 3;
    pub const UNSPECIFIED: i64 = 4;
}

/// S1AP Cause, one variant per cause group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S1apCause {
    RadioNetwork(i64),
    Transport(i64),
    Nas(i64),
    Protocol(i64),
    Misc(i64),
}

impl S1apCause {
    /// CHOICE index on the wire
    pub fn group(&self) -> u8 {
        match self {
            S1apCause::RadioNetwork(_) => 0,
            S1apCause::Transport(_) => 1,
            S1apCause::Nas(_) => 2,
            S1apCause::Protocol(_) => 3,
            S1apCause::Misc(_) => 4,
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            S1apCause::RadioNetwork(v)
            | S1apCause::Transport(v)
            | S1apCause::Nas(v)
            | S1apCause::Protocol(v)
            | S1apCause::Misc(v) => *v,
        }
    }
}

impl fmt::Display for S1apCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = match self {
            S1apCause::RadioNetwork(_) => "RadioNetwork",
            S1apCause::Transport(_) => "Transport",
            S1apCause::Nas(_) => "NAS",
            S1apCause::Protocol(_) => "Protocol",
            S1apCause::Misc(_) => "Misc",
        };
        write!(f, "{}[{}]", group, self.value())
    }
}

// ============================================================================
// IEs
// ============================================================================

/// Global-ENB-ID (macro or home eNB id as a bit string)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalEnbId {
    pub plmn_identity: Vec<u8>,
    /// eNB-ID bit string octets
    pub enb_id: Vec<u8>,
    /// Unused trailing bits of the last octet
    pub bits_unused: u8,
}

impl GlobalEnbId {
    /// Numeric eNB id: big-endian bit string shifted past the unused bits
    pub fn enb_id_value(&self) -> Option<u32> {
        if self.enb_id.is_empty() || self.enb_id.len() > 4 || self.bits_unused > 7 {
            return None;
        }
        let value = self
            .enb_id
            .iter()
            .fold(0u32, |acc, octet| (acc << 8) | u32::from(*octet));
        Some(value >> self.bits_unused)
    }
}

/// SupportedTAs-Item: one TAC broadcast in one or more PLMNs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportedTaItem {
    /// TAC octets (big endian)
    pub tac: Vec<u8>,
    pub broadcast_plmns: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaiIe {
    pub plmn_identity: Vec<u8>,
    pub tac: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EutranCgiIe {
    pub plmn_identity: Vec<u8>,
    /// 28-bit cell identity, left aligned in 4 octets
    pub cell_id: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct STmsiIe {
    pub mme_code: Vec<u8>,
    pub m_tmsi: Vec<u8>,
}

/// E-RABSetupItemCtxtSURes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ERabSetupItem {
    pub e_rab_id: u8,
    pub transport_layer_address: Vec<u8>,
    pub gtp_teid: Vec<u8>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S1SetupRequest {
    pub global_enb_id: GlobalEnbId,
    pub enb_name: Option<String>,
    pub supported_tas: Vec<SupportedTaItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialUeMessage {
    pub enb_ue_s1ap_id: u32,
    pub nas_pdu: Option<Bytes>,
    pub tai: Option<TaiIe>,
    pub eutran_cgi: Option<EutranCgiIe>,
    pub s_tmsi: Option<STmsiIe>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UplinkNasTransport {
    pub mme_ue_s1ap_id: u32,
    pub enb_ue_s1ap_id: u32,
    pub nas_pdu: Option<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeCapabilityInfoIndication {
    pub mme_ue_s1ap_id: u32,
    pub enb_ue_s1ap_id: u32,
    pub ue_radio_capability: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitialContextSetupResponse {
    pub mme_ue_s1ap_id: u32,
    pub enb_ue_s1ap_id: u32,
    pub e_rab_setup_list: Vec<ERabSetupItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeContextReleaseRequest {
    pub mme_ue_s1ap_id: u32,
    pub enb_ue_s1ap_id: u32,
    pub cause: S1apCause,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UeContextReleaseComplete {
    pub mme_ue_s1ap_id: u32,
    pub enb_ue_s1ap_id: u32,
}

/// Inbound S1AP message handled by the MME
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S1apMessage {
    S1SetupRequest(S1SetupRequest),
    InitialUeMessage(InitialUeMessage),
    UplinkNasTransport(UplinkNasTransport),
    UeCapabilityInfoIndication(UeCapabilityInfoIndication),
    InitialContextSetupResponse(InitialContextSetupResponse),
    UeContextReleaseRequest(UeContextReleaseRequest),
    UeContextReleaseComplete(UeContextReleaseComplete),
}

impl S1apMessage {
    pub fn name(&self) -> &'static str {
        match self {
            S1apMessage::S1SetupRequest(_) => "S1SetupRequest",
            S1apMessage::InitialUeMessage(_) => "InitialUEMessage",
            S1apMessage::UplinkNasTransport(_) => "UplinkNASTransport",
            S1apMessage::UeCapabilityInfoIndication(_) => "UECapabilityInfoIndication",
            S1apMessage::InitialContextSetupResponse(_) => "InitialContextSetupResponse",
            S1apMessage::UeContextReleaseRequest(_) => "UEContextReleaseRequest",
            S1apMessage::UeContextReleaseComplete(_) => "UEContextReleaseComplete",
        }
    }

    pub fn procedure_code(&self) -> u8 {
        match self {
            S1apMessage::S1SetupRequest(_) => procedure_code::S1_SETUP,
            S1apMessage::InitialUeMessage(_) => procedure_code::INITIAL_UE_MESSAGE,
            S1apMessage::UplinkNasTransport(_) => procedure_code::UPLINK_NAS_TRANSPORT,
            S1apMessage::UeCapabilityInfoIndication(_) => procedure_code::UE_CAPABILITY_INFO_INDICATION,
            S1apMessage::InitialContextSetupResponse(_) => procedure_code::INITIAL_CONTEXT_SETUP,
            S1apMessage::UeContextReleaseRequest(_) => procedure_code::UE_CONTEXT_RELEASE_REQUEST,
            S1apMessage::UeContextReleaseComplete(_) => procedure_code::UE_CONTEXT_RELEASE,
        }
    }
}
