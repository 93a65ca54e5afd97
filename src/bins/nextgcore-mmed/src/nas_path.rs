//! NAS Path Functions
//!
//! Uplink side of the NAS envelope: takes the NAS-PDU out of an S1AP
//! message, strips and verifies the security header and hands the plain
//! message to EMM or ESM.

use ogs_core::OgsPkbuf;

use crate::app::MmeApp;
use crate::context::EnbUeId;
use crate::event::MmeEvent;
use crate::nas_security::{
    NasError, NasResult, SecurityHeaderType, OGS_NAS_HEADROOM, OGS_NAS_PROTOCOL_DISCRIMINATOR_EMM,
    OGS_NAS_PROTOCOL_DISCRIMINATOR_ESM,
};

/// Check the outer envelope of `nas_pdu` without touching any context: a
/// known security header type followed by at least one message octet.
pub fn check_envelope(nas_pdu: &[u8]) -> NasResult<SecurityHeaderType> {
    let first = *nas_pdu.first().ok_or(NasError::EmptyPdu)?;
    let security_header_type = SecurityHeaderType::from_first_octet(first)?;
    let needed = security_header_type.header_len() + 1;
    if nas_pdu.len() < needed {
        return Err(NasError::Truncated {
            needed,
            available: nas_pdu.len(),
        });
    }
    Ok(security_header_type)
}

/// Decode the security envelope of `nas_pdu` received for `enb_ue` and
/// emit the resulting EMM or ESM event.
///
/// The working buffer is owned here until it is moved into the event; any
/// error drops it.
pub fn s1ap_send_to_nas(app: &mut MmeApp, enb_ue: EnbUeId, nas_pdu: &[u8]) -> NasResult<()> {
    let security_header_type = check_envelope(nas_pdu)?;
    if app.context.enb_ue(enb_ue).is_none() {
        return Err(NasError::EnbUeNotFound);
    }

    let mut pkbuf = OgsPkbuf::alloc(OGS_NAS_HEADROOM, nas_pdu);

    let strip = security_header_type.header_len();
    if strip > 0 && pkbuf.pull(strip).is_none() {
        return Err(NasError::Truncated {
            needed: strip,
            available: nas_pdu.len(),
        });
    }

    let mme_ue = app.context.mme_ue_of(enb_ue);
    if let Some(mme_ue) = mme_ue {
        let ue = app.context.mme_ue_mut(mme_ue).ok_or(NasError::MmeUeNotFound)?;
        app.nas_security
            .decode(&mut ue.security, security_header_type, &mut pkbuf)?;
    }

    let octet = *pkbuf.data().first().ok_or(NasError::Truncated {
        needed: strip + 1,
        available: nas_pdu.len(),
    })?;

    let event = match octet & 0x0f {
        OGS_NAS_PROTOCOL_DISCRIMINATOR_EMM => MmeEvent::EmmMessage {
            enb_ue,
            security_header_type,
            pkbuf,
        },
        OGS_NAS_PROTOCOL_DISCRIMINATOR_ESM => {
            let mme_ue = mme_ue.ok_or(NasError::MmeUeNotFound)?;
            let pti = *pkbuf.data().get(1).ok_or(NasError::Truncated {
                needed: strip + 2,
                available: nas_pdu.len(),
            })?;
            let sess = app.context.sess_find_by_pti(mme_ue, pti).ok_or_else(|| {
                NasError::SessionNotFound {
                    imsi_bcd: app
                        .context
                        .mme_ue(mme_ue)
                        .map(|ue| ue.imsi_bcd.clone())
                        .unwrap_or_default(),
                    pti,
                }
            })?;
            MmeEvent::EsmMessage {
                sess,
                security_header_type,
                pkbuf,
            }
        }
        pd => return Err(NasError::UnknownProtocolDiscriminator(pd)),
    };

    log::trace!("NAS {} (sh:{})", event.name(), security_header_type);
    app.event_tx
        .send(event)
        .map_err(|_| NasError::EventChannelClosed)
}
