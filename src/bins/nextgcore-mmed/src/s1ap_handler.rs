//! S1AP Message Handling
//!
//! One handler per inbound S1AP procedure, plus paging. Handlers validate
//! every field they use before touching any context, so a rejected message
//! leaves no partial state behind.

use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use crate::app::MmeApp;
use crate::context::{ContextError, ECgi, EnbId, EnbUeId, EpsGuti, EpsTai, IpAddr, MmeUeId, PlmnId, SessId};
use crate::error::ErrorClass;
use crate::gtp_path::{self, GtpPathError};
use crate::nas_path;
use crate::nas_security::NasError;
use crate::s1ap_build::{decode_plmn_id, S1apBuildError};
use crate::s1ap_message::{
    nas_cause, radio_network_cause, InitialContextSetupResponse, InitialUeMessage, S1SetupRequest,
    S1apCause, UeCapabilityInfoIndication, UeContextReleaseComplete, UeContextReleaseRequest,
    UplinkNasTransport,
};
use crate::s1ap_path::S1apPathError;

// ============================================================================
// S1AP Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum S1apError {
    #[error("missing mandatory IE {0}")]
    MissingIe(&'static str),

    #[error("{ie} has {len} octets, expected {expected}")]
    InvalidIeLength {
        ie: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("invalid Global-ENB-ID")]
    InvalidGlobalEnbId,

    #[error("invalid transport layer address ({0} octets)")]
    InvalidTransportLayerAddress(usize),

    #[error("unknown eNB association [{0}]")]
    EnbNotFound(SocketAddr),

    #[error("no UE context for ENB_UE_S1AP_ID[{0}]")]
    UnknownEnbUeS1apId(u32),

    #[error("no UE context for MME_UE_S1AP_ID[{0}]")]
    UnknownMmeUeS1apId(u32),

    #[error("no MME UE context for ENB_UE_S1AP_ID[{0}]")]
    MmeUeNotAssociated(u32),

    #[error("no session for EBI[{0}]")]
    SessionNotFound(u8),

    #[error("not implemented ({0} cause)")]
    UnimplementedCause(S1apCause),

    #[error(transparent)]
    Nas(#[from] NasError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Build(#[from] S1apBuildError),

    #[error(transparent)]
    Path(#[from] S1apPathError),

    #[error(transparent)]
    GtpPath(#[from] GtpPathError),
}

pub type S1apResult<T> = Result<T, S1apError>;

impl S1apError {
    pub fn class(&self) -> ErrorClass {
        match self {
            S1apError::MissingIe(_)
            | S1apError::InvalidIeLength { .. }
            | S1apError::InvalidGlobalEnbId
            | S1apError::InvalidTransportLayerAddress(_) => ErrorClass::Malformed,
            S1apError::UnimplementedCause(_) => ErrorClass::Unimplemented,
            S1apError::EnbNotFound(_)
            | S1apError::UnknownEnbUeS1apId(_)
            | S1apError::UnknownMmeUeS1apId(_)
            | S1apError::MmeUeNotAssociated(_)
            | S1apError::SessionNotFound(_) => ErrorClass::NotFound,
            S1apError::Nas(e) => e.class(),
            S1apError::Context(e) => e.class(),
            S1apError::GtpPath(e) => e.class(),
            S1apError::Build(_) | S1apError::Path(_) => ErrorClass::Fatal,
        }
    }
}

// ============================================================================
// Field decoding
// ============================================================================

fn fixed<const N: usize>(octets: &[u8], ie: &'static str) -> S1apResult<[u8; N]> {
    octets.try_into().map_err(|_| S1apError::InvalidIeLength {
        ie,
        len: octets.len(),
        expected: N,
    })
}

fn plmn_id(octets: &[u8], ie: &'static str) -> S1apResult<PlmnId> {
    decode_plmn_id(octets).ok_or(S1apError::InvalidIeLength {
        ie,
        len: octets.len(),
        expected: 3,
    })
}

fn tac(octets: &[u8]) -> S1apResult<u16> {
    Ok(u16::from_be_bytes(fixed::<2>(octets, "tAC")?))
}

fn enb_addr(app: &MmeApp, enb: EnbId) -> S1apResult<SocketAddr> {
    Ok(app.context.enb(enb).ok_or(ContextError::EnbNotFound(enb))?.addr)
}

// ============================================================================
// S1AP Message Handling Functions
// ============================================================================

/// S1 Setup Request: record the eNB id and its supported TAs, answer with
/// S1 Setup Response
pub fn handle_s1_setup_request(app: &mut MmeApp, enb: EnbId, req: &S1SetupRequest) -> S1apResult<()> {
    let enb_id = req
        .global_enb_id
        .enb_id_value()
        .ok_or(S1apError::InvalidGlobalEnbId)?;

    // One TA per (TAC, broadcast PLMN) pair
    let mut supported_ta_list = Vec::new();
    for item in &req.supported_tas {
        let tac = tac(&item.tac)?;
        for plmn in &item.broadcast_plmns {
            supported_ta_list.push(EpsTai {
                plmn_id: plmn_id(plmn, "broadcastPLMN")?,
                tac,
            });
        }
    }

    let addr = enb_addr(app, enb)?;
    log::debug!(
        "[S1AP] S1SetupRequest : eNB[{}] eNB-id[0x{:x}] TAs[{}]",
        addr,
        enb_id,
        supported_ta_list.len()
    );
    if supported_ta_list.is_empty() {
        log::error!("No supported TA from eNB[{}]", addr);
    }

    app.context.enb_set_enb_id(enb, enb_id)?;
    if let Some(e) = app.context.enb_mut(enb) {
        e.supported_ta_list = supported_ta_list;
    }

    let pkbuf = app.s1ap_build.build_setup_response(&app.config)?;
    app.s1ap_path.send_to_enb(addr, pkbuf)?;
    Ok(())
}

/// Initial UE Message: find or create the eNB UE, resolve the UE by S-TMSI
/// and hand the NAS-PDU to the NAS layer
pub fn handle_initial_ue_message(app: &mut MmeApp, enb: EnbId, msg: &InitialUeMessage) -> S1apResult<()> {
    let addr = enb_addr(app, enb)?;

    let nas_pdu = msg.nas_pdu.as_ref().ok_or(S1apError::MissingIe("NAS-PDU"))?;
    nas_path::check_envelope(nas_pdu)?;
    let tai_ie = msg.tai.as_ref().ok_or(S1apError::MissingIe("TAI"))?;
    let cgi_ie = msg.eutran_cgi.as_ref().ok_or(S1apError::MissingIe("EUTRAN-CGI"))?;

    let tai = EpsTai {
        plmn_id: plmn_id(&tai_ie.plmn_identity, "TAI.pLMNidentity")?,
        tac: tac(&tai_ie.tac)?,
    };
    let e_cgi = ECgi {
        plmn_id: plmn_id(&cgi_ie.plmn_identity, "EUTRAN-CGI.pLMNidentity")?,
        cell_id: u32::from_be_bytes(fixed::<4>(&cgi_ie.cell_id, "cell-ID")?) >> 4,
    };
    let s_tmsi = match &msg.s_tmsi {
        Some(s) => Some((
            fixed::<1>(&s.mme_code, "S-TMSI.mMEC")?[0],
            u32::from_be_bytes(fixed::<4>(&s.m_tmsi, "S-TMSI.m-TMSI")?),
        )),
        None => None,
    };

    let (enb_ue, created) = app.context.enb_ue_find_or_add(enb, msg.enb_ue_s1ap_id)?;
    if created {
        if let Some((mme_code, m_tmsi)) = s_tmsi {
            let (plmn, mme_gid) = app
                .config
                .primary_plmn_gid()
                .ok_or(S1apBuildError::NoServedGummei)?;
            let guti = EpsGuti {
                plmn_id: plmn.clone(),
                mme_gid,
                mme_code,
                m_tmsi,
            };

            match app.context.mme_ue_find_by_guti(&guti) {
                Some(mme_ue) => {
                    log::debug!("Known UE by GUTI[{}]", guti);
                    app.context.associate(mme_ue, enb_ue)?;
                }
                None => log::warn!("Unknown UE by GUTI[{}]", guti),
            }
        }
    }

    if let Some(ue) = app.context.enb_ue_mut(enb_ue) {
        ue.tai = tai;
        ue.e_cgi = e_cgi;
    }

    log::debug!(
        "[S1AP] InitialUEMessage : UE[eNB-UE-S1AP-ID({})] --> eNB[{}]",
        msg.enb_ue_s1ap_id,
        addr
    );

    nas_path::s1ap_send_to_nas(app, enb_ue, nas_pdu)?;
    Ok(())
}

/// Uplink NAS Transport: hand the NAS-PDU to the NAS layer
pub fn handle_uplink_nas_transport(app: &mut MmeApp, enb: EnbId, msg: &UplinkNasTransport) -> S1apResult<()> {
    let addr = enb_addr(app, enb)?;
    let enb_ue = app
        .context
        .enb_ue_find_by_enb_ue_s1ap_id(enb, msg.enb_ue_s1ap_id)
        .ok_or(S1apError::UnknownEnbUeS1apId(msg.enb_ue_s1ap_id))?;
    let nas_pdu = msg.nas_pdu.as_ref().ok_or(S1apError::MissingIe("NAS-PDU"))?;

    log::debug!(
        "[S1AP] UplinkNASTransport : UE[eNB-UE-S1AP-ID({})] --> eNB[{}]",
        msg.enb_ue_s1ap_id,
        addr
    );

    nas_path::s1ap_send_to_nas(app, enb_ue, nas_pdu)?;
    Ok(())
}

/// UE Capability Info Indication: replace the stored radio capability
pub fn handle_ue_capability_info_indication(
    app: &mut MmeApp,
    enb: EnbId,
    msg: &UeCapabilityInfoIndication,
) -> S1apResult<()> {
    let addr = enb_addr(app, enb)?;
    let enb_ue = app
        .context
        .enb_ue_find_by_enb_ue_s1ap_id(enb, msg.enb_ue_s1ap_id)
        .ok_or(S1apError::UnknownEnbUeS1apId(msg.enb_ue_s1ap_id))?;

    if let Some(mme_ue) = app.context.mme_ue_of(enb_ue) {
        if let Some(ue) = app.context.mme_ue_mut(mme_ue) {
            ue.ue_radio_capability = Some(Bytes::copy_from_slice(&msg.ue_radio_capability));
        }
    }

    log::debug!(
        "[S1AP] UECapabilityInfoIndication : UE[eNB-UE-S1AP-ID({})] --> eNB[{}]",
        msg.enb_ue_s1ap_id,
        addr
    );
    Ok(())
}

/// Initial Context Setup Response: record the eNB S1-U endpoint of each
/// E-RAB and send Modify Bearer Request for its session
pub fn handle_initial_context_setup_response(
    app: &mut MmeApp,
    enb: EnbId,
    msg: &InitialContextSetupResponse,
) -> S1apResult<()> {
    let addr = enb_addr(app, enb)?;
    let enb_ue = app
        .context
        .enb_ue_find_by_enb_ue_s1ap_id(enb, msg.enb_ue_s1ap_id)
        .ok_or(S1apError::UnknownEnbUeS1apId(msg.enb_ue_s1ap_id))?;

    log::debug!(
        "[S1AP] InitialContextSetupResponse : UE[eNB-UE-S1AP-ID({})] --> eNB[{}]",
        msg.enb_ue_s1ap_id,
        addr
    );

    let mme_ue = app
        .context
        .mme_ue_of(enb_ue)
        .ok_or(S1apError::MmeUeNotAssociated(msg.enb_ue_s1ap_id))?;

    let mut updates: Vec<(SessId, u32, IpAddr)> = Vec::with_capacity(msg.e_rab_setup_list.len());
    for e_rab in &msg.e_rab_setup_list {
        let sess = app
            .context
            .sess_find_by_ebi(mme_ue, e_rab.e_rab_id)
            .ok_or(S1apError::SessionNotFound(e_rab.e_rab_id))?;
        let teid = u32::from_be_bytes(fixed::<4>(&e_rab.gtp_teid, "gTP-TEID")?);
        let ip = IpAddr::from_transport_layer_address(&e_rab.transport_layer_address).ok_or(
            S1apError::InvalidTransportLayerAddress(e_rab.transport_layer_address.len()),
        )?;
        updates.push((sess, teid, ip));
    }

    for (sess, teid, ip) in updates {
        if let Some(s) = app.context.sess_mut(sess) {
            let bearer = s.default_bearer_mut();
            bearer.enb_s1u_teid = teid;
            bearer.enb_s1u_addr = Some(ip);
        }
        gtp_path::send_modify_bearer_request(app, sess)?;
    }
    Ok(())
}

/// UE Context Release Request. Only radio network "user inactivity" is
/// acted on; every other cause is reported as not implemented and leaves
/// the UE untouched.
pub fn handle_ue_context_release_request(
    app: &mut MmeApp,
    enb: EnbId,
    msg: &UeContextReleaseRequest,
) -> S1apResult<()> {
    let addr = enb_addr(app, enb)?;
    let enb_ue = app
        .context
        .enb_ue_find_by_mme_ue_s1ap_id(msg.mme_ue_s1ap_id)
        .ok_or(S1apError::UnknownMmeUeS1apId(msg.mme_ue_s1ap_id))?;

    log::debug!(
        "[S1AP] UEContextReleaseRequest : UE[MME-UE-S1AP-ID({})] --> eNB[{}]",
        msg.mme_ue_s1ap_id,
        addr
    );

    match msg.cause {
        S1apCause::RadioNetwork(radio_network_cause::USER_INACTIVITY) => {
            let sessions = match app.context.mme_ue_of(enb_ue).and_then(|m| app.context.mme_ue_mut(m)) {
                Some(ue) => {
                    ue.release_access_bearers_failed = false;
                    ue.sess_list.clone()
                }
                None => Vec::new(),
            };

            if sessions.is_empty() {
                return handle_release_access_bearers_response(app, enb_ue);
            }
            for sess in sessions {
                gtp_path::send_release_access_bearers_request(app, enb_ue, sess)?;
            }
            Ok(())
        }
        // Not implemented for any other group or value
        cause @ (S1apCause::RadioNetwork(_)
        | S1apCause::Transport(_)
        | S1apCause::Nas(_)
        | S1apCause::Protocol(_)
        | S1apCause::Misc(_)) => Err(S1apError::UnimplementedCause(cause)),
    }
}

/// All access bearers of the UE are released: tell the eNB to release the
/// UE context
pub fn handle_release_access_bearers_response(app: &mut MmeApp, enb_ue: EnbUeId) -> S1apResult<()> {
    let ue = app.context.enb_ue(enb_ue).ok_or(ContextError::EnbUeNotFound(enb_ue))?;
    let (enb_ue_s1ap_id, mme_ue_s1ap_id, enb) = (ue.enb_ue_s1ap_id, ue.mme_ue_s1ap_id, ue.enb);
    let addr = enb_addr(app, enb)?;

    let pkbuf = app.s1ap_build.build_ue_context_release_command(
        Some(enb_ue_s1ap_id),
        mme_ue_s1ap_id,
        S1apCause::Nas(nas_cause::NORMAL_RELEASE),
    )?;
    log::debug!(
        "[S1AP] UEContextReleaseCommand : UE[MME-UE-S1AP-ID({})] <-- eNB[{}]",
        mme_ue_s1ap_id,
        addr
    );
    app.s1ap_path.send_to_enb(addr, pkbuf)?;
    Ok(())
}

/// UE Context Release Complete: drop the eNB UE
pub fn handle_ue_context_release_complete(
    app: &mut MmeApp,
    enb: EnbId,
    msg: &UeContextReleaseComplete,
) -> S1apResult<()> {
    let addr = enb_addr(app, enb)?;
    let enb_ue = app
        .context
        .enb_ue_find_by_mme_ue_s1ap_id(msg.mme_ue_s1ap_id)
        .ok_or(S1apError::UnknownMmeUeS1apId(msg.mme_ue_s1ap_id))?;

    log::debug!(
        "[S1AP] UEContextReleaseComplete : UE[MME-UE-S1AP-ID({})] --> eNB[{}]",
        msg.mme_ue_s1ap_id,
        addr
    );

    app.context.enb_ue_remove(enb_ue);
    Ok(())
}

/// Page `mme_ue` on every eNB serving its TAI. The Paging PDU is built on
/// the first match and reused until the cache is cleared.
pub fn handle_paging(app: &mut MmeApp, mme_ue: MmeUeId) -> S1apResult<()> {
    let tai = app
        .context
        .mme_ue(mme_ue)
        .ok_or(ContextError::MmeUeNotFound(mme_ue))?
        .tai
        .clone();

    // One Paging per matching (eNB, TA) pair
    let mut targets: Vec<SocketAddr> = Vec::new();
    for id in app.context.enb_ids() {
        if let Some(enb) = app.context.enb(id) {
            for supported in &enb.supported_ta_list {
                if *supported == tai {
                    targets.push(enb.addr);
                }
            }
        }
    }

    for addr in targets {
        let ue = app
            .context
            .mme_ue_mut(mme_ue)
            .ok_or(ContextError::MmeUeNotFound(mme_ue))?;
        let pkbuf = match ue.last_paging_msg.clone() {
            Some(cached) => cached,
            None => {
                let pkbuf = app.s1ap_build.build_paging(ue)?;
                ue.last_paging_msg = Some(pkbuf.clone());
                pkbuf
            }
        };
        log::debug!("[S1AP] Paging : UE[{}] <-- eNB[{}]", ue.imsi_bcd, addr);
        app.s1ap_path.send_to_enb(addr, pkbuf)?;
    }
    Ok(())
}

// ============================================================================
// Unit Tests
// ============================================================================
