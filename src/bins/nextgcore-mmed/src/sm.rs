//! MME State Machine
//!
//! The operational state consumes one `MmeEvent` at a time and routes it
//! to its handler. This is the only place handler errors are reported;
//! nothing propagates past it.

use std::fmt;
use std::net::SocketAddr;

use crate::app::MmeApp;
use crate::error::ErrorClass;
use crate::event::MmeEvent;
use crate::s11_handler;
use crate::s1ap_handler::{self, S1apError, S1apResult};
use crate::s1ap_message::S1apMessage;

fn report(class: ErrorClass, what: &str, err: &dyn fmt::Display) {
    log::log!(class.level(), "{} dropped ({}): {}", what, class, err);
}

fn s1ap_state_operational(app: &mut MmeApp, enb_addr: SocketAddr, message: &S1apMessage) -> S1apResult<()> {
    let enb = app
        .context
        .enb_find_by_addr(&enb_addr)
        .ok_or(S1apError::EnbNotFound(enb_addr))?;

    match message {
        S1apMessage::S1SetupRequest(m) => s1ap_handler::handle_s1_setup_request(app, enb, m),
        S1apMessage::InitialUeMessage(m) => s1ap_handler::handle_initial_ue_message(app, enb, m),
        S1apMessage::UplinkNasTransport(m) => s1ap_handler::handle_uplink_nas_transport(app, enb, m),
        S1apMessage::UeCapabilityInfoIndication(m) => {
            s1ap_handler::handle_ue_capability_info_indication(app, enb, m)
        }
        S1apMessage::InitialContextSetupResponse(m) => {
            s1ap_handler::handle_initial_context_setup_response(app, enb, m)
        }
        S1apMessage::UeContextReleaseRequest(m) => {
            s1ap_handler::handle_ue_context_release_request(app, enb, m)
        }
        S1apMessage::UeContextReleaseComplete(m) => {
            s1ap_handler::handle_ue_context_release_complete(app, enb, m)
        }
    }
}

/// MME operational state
pub fn mme_state_operational(app: &mut MmeApp, event: MmeEvent) {
    log::trace!("mme_state_operational(): {}", event.name());

    match event {
        MmeEvent::S1apLinkUp { enb_addr } => {
            if app.context.enb_find_by_addr(&enb_addr).is_some() {
                log::warn!("eNB [{}] already connected", enb_addr);
                return;
            }
            match app.context.enb_add(enb_addr) {
                Ok(enb) => log::info!("eNB-S1 accepted[{}] in master_sm module ({})", enb_addr, enb),
                Err(e) => report(e.class(), "S1AP association", &e),
            }
        }
        MmeEvent::S1apLinkDown { enb_addr } => match app.context.enb_find_by_addr(&enb_addr) {
            Some(enb) => {
                log::info!("eNB-S1[{}] connection refused", enb_addr);
                app.context.enb_remove(enb);
            }
            None => log::warn!("eNB-S1[{}] already removed", enb_addr),
        },
        MmeEvent::S1apMessage { enb_addr, message } => {
            if let Err(e) = s1ap_state_operational(app, enb_addr, &message) {
                report(e.class(), message.name(), &e);
            }
        }
        MmeEvent::EmmMessage {
            enb_ue,
            security_header_type,
            pkbuf,
        } => {
            log::debug!(
                "[{}] EMM message ({} octets, sh:{}) to session layer",
                enb_ue,
                pkbuf.len(),
                security_header_type
            );
        }
        MmeEvent::EsmMessage {
            sess,
            security_header_type,
            pkbuf,
        } => {
            log::debug!(
                "[{}] ESM message ({} octets, sh:{}) to session layer",
                sess,
                pkbuf.len(),
                security_header_type
            );
        }
        MmeEvent::S11Message(resp) => {
            if let Err(e) = s11_handler::handle_s11_message(app, &resp) {
                report(e.class(), "S11 response", &e);
            }
        }
        MmeEvent::S11Timeout { xact } => {
            if let Err(e) = s11_handler::handle_s11_timeout(app, xact) {
                report(e.class(), "S11 timeout", &e);
            }
        }
        MmeEvent::Paging { mme_ue } => {
            if let Err(e) = s1ap_handler::handle_paging(app, mme_ue) {
                report(e.class(), "Paging", &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EpsTai;
    use crate::s1ap_message::{
        radio_network_cause, GlobalEnbId, S1SetupRequest, S1apCause, SupportedTaItem,
        UeContextReleaseRequest,
    };
    use crate::test_support::{TestHarness, ENB_ADDR};

    fn enb_addr() -> SocketAddr {
        ENB_ADDR.parse().unwrap()
    }

    fn setup_request() -> S1apMessage {
        S1apMessage::S1SetupRequest(S1SetupRequest {
            global_enb_id: GlobalEnbId {
                plmn_identity: vec![0x00, 0xf1, 0x10],
                enb_id: vec![0x00, 0x01, 0x90],
                bits_unused: 4,
            },
            enb_name: Some("enb0".into()),
            supported_tas: vec![SupportedTaItem {
                tac: vec![0x00, 0x01],
                broadcast_plmns: vec![vec![0x00, 0xf1, 0x10]],
            }],
        })
    }

    #[test]
    fn test_link_up_then_setup() {
        let mut h = TestHarness::new();
        h.app.dispatch(MmeEvent::S1apLinkUp { enb_addr: enb_addr() });
        h.app.dispatch(MmeEvent::S1apLinkUp { enb_addr: enb_addr() });
        assert_eq!(h.app.context.enb_count(), 1);

        h.app.dispatch(MmeEvent::S1apMessage {
            enb_addr: enb_addr(),
            message: setup_request(),
        });
        assert_eq!(h.s1ap.sent.borrow().len(), 1);
        assert!(h.app.context.enb_find_by_enb_id(0x19).is_some());
    }

    #[test]
    fn test_message_from_unknown_enb_dropped() {
        let mut h = TestHarness::new();
        h.app.dispatch(MmeEvent::S1apMessage {
            enb_addr: enb_addr(),
            message: setup_request(),
        });
        assert_eq!(h.app.context.enb_count(), 0);
        assert!(h.s1ap.sent.borrow().is_empty());
    }

    #[test]
    fn test_link_down_drops_enb_ues() {
        let mut h = TestHarness::new();
        let enb = h.add_enb();
        h.app.context.enb_ue_add(enb, 1).unwrap();
        h.app.context.enb_ue_add(enb, 2).unwrap();

        h.app.dispatch(MmeEvent::S1apLinkDown { enb_addr: enb_addr() });
        assert_eq!(h.app.context.enb_count(), 0);
        assert_eq!(h.app.context.enb_ue_count(), 0);
    }

    #[test]
    fn test_handler_error_does_not_touch_other_ues() {
        let mut h = TestHarness::new();
        let enb = h.add_enb();
        let enb_ue = h.app.context.enb_ue_add(enb, 1).unwrap();

        h.app.dispatch(MmeEvent::S1apMessage {
            enb_addr: enb_addr(),
            message: S1apMessage::UeContextReleaseRequest(UeContextReleaseRequest {
                mme_ue_s1ap_id: 999,
                enb_ue_s1ap_id: 1,
                cause: S1apCause::RadioNetwork(radio_network_cause::USER_INACTIVITY),
            }),
        });
        assert!(h.app.context.enb_ue(enb_ue).is_some());
        assert!(h.s1ap.sent.borrow().is_empty());
    }

    #[test]
    fn test_paging_event() {
        let mut h = TestHarness::new();
        let enb = h.add_enb();
        let tai = EpsTai::default();
        h.app.context.enb_mut(enb).unwrap().supported_ta_list = vec![tai];
        let mme_ue = h.app.context.mme_ue_add("001010000000001").unwrap();

        h.app.dispatch(MmeEvent::Paging { mme_ue });
        assert_eq!(h.s1ap.sent.borrow().len(), 1);
        assert_eq!(h.build.paging_builds.get(), 1);
    }
}
