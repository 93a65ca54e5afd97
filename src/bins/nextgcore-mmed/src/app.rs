//! MME application state
//!
//! Everything a handler may touch, passed explicitly as `&mut MmeApp`.

use std::sync::Arc;
use std::time::Instant;

use crate::config::MmeConfig;
use crate::context::{MmeContext, OGS_MAX_NUM_OF_SESS};
use crate::event::{MmeEvent, MmeEventSender};
use crate::gtp_path::{GtpSender, GtpXactPool};
use crate::nas_security::{NasSecurityEngine, NullNasSecurity};
use crate::s1ap_build::{IeS1apBuilder, S1apBuild};
use crate::s1ap_path::S1apPath;
use crate::sm;

pub struct MmeApp {
    pub config: Arc<MmeConfig>,
    pub context: MmeContext,
    /// Egress toward eNBs
    pub s1ap_path: Box<dyn S1apPath>,
    pub s1ap_build: Box<dyn S1apBuild>,
    pub nas_security: Box<dyn NasSecurityEngine>,
    /// Outstanding S11 transactions
    pub xact_pool: GtpXactPool,
    pub gtp_sender: Box<dyn GtpSender>,
    /// Events for the state machine and the session layer
    pub event_tx: MmeEventSender,
}

impl MmeApp {
    pub fn new(
        config: Arc<MmeConfig>,
        event_tx: MmeEventSender,
        s1ap_path: Box<dyn S1apPath>,
        gtp_sender: Box<dyn GtpSender>,
    ) -> Self {
        Self {
            context: MmeContext::new(&config),
            xact_pool: GtpXactPool::new(config.max_ue * OGS_MAX_NUM_OF_SESS),
            config,
            s1ap_path,
            s1ap_build: Box::new(IeS1apBuilder),
            nas_security: Box::new(NullNasSecurity),
            gtp_sender,
            event_tx,
        }
    }

    pub fn with_s1ap_build(mut self, s1ap_build: Box<dyn S1apBuild>) -> Self {
        self.s1ap_build = s1ap_build;
        self
    }

    pub fn with_nas_security(mut self, nas_security: Box<dyn NasSecurityEngine>) -> Self {
        self.nas_security = nas_security;
        self
    }

    /// Run one event through the MME state machine
    pub fn dispatch(&mut self, event: MmeEvent) {
        sm::mme_state_operational(self, event);
    }

    /// Retransmit due S11 requests and queue a timeout event for each
    /// transaction out of attempts
    pub fn poll_timers(&mut self, now: Instant) {
        let poll = self.xact_pool.poll_timers(now, self.gtp_sender.as_mut());
        for xact in poll.timed_out {
            if self.event_tx.send(MmeEvent::S11Timeout { xact }).is_err() {
                log::error!("Event channel closed, dropping S11 timeout [{}]", xact);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MmeEventId;
    use crate::gtp_path::{self, GTP_N3_REQUESTS, GTP_T3_RESPONSE};
    use crate::test_support::TestHarness;

    #[test]
    fn test_poll_timers_emits_timeout_after_n3() {
        let mut h = TestHarness::new();
        let mme_ue = h.app.context.mme_ue_add("001010000000001").unwrap();
        let sess = h.app.context.sess_add(mme_ue, 1, 5).unwrap();
        h.set_enb_s1u(sess);
        gtp_path::send_modify_bearer_request(&mut h.app, sess).unwrap();

        let mut now = Instant::now();
        for _ in 0..GTP_N3_REQUESTS {
            now += GTP_T3_RESPONSE;
            h.app.poll_timers(now);
        }

        assert_eq!(h.gtp.sent.borrow().len(), usize::from(GTP_N3_REQUESTS));
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id(), MmeEventId::S11Timer);
    }
}
