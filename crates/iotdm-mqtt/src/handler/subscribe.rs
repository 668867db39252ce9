use super::TransportHandler;
use crate::codec::{OutboundFrame, SubscribeFrame, SubscriptionGrant, UnsubscribeFrame};
use tracing::{debug, warn};

impl TransportHandler {
    /// Opts the device into capability topics. Each entry is answered on its
    /// own, so one SUBSCRIBE may partially succeed.
    pub(super) async fn handle_subscribe(&mut self, subscribe: SubscribeFrame) {
        let Some(identity) = self.connected_identity("SUBSCRIBE") else {
            return;
        };

        let mut grants = Vec::with_capacity(subscribe.entries.len());
        let mut matched = false;
        for (topic, requested_qos) in &subscribe.entries {
            if let Some(capability) = self.ctx.config.topics.capability(topic) {
                self.session.set_capability(capability, true);
                matched = true;
                debug!(
                    session_id = %self.session.id(),
                    device_id = %identity.device_id,
                    topic = %topic,
                    ?capability,
                    "Capability enabled"
                );
                grants.push(SubscriptionGrant::Granted);
            } else {
                warn!(
                    session_id = %self.session.id(),
                    device_id = %identity.device_id,
                    topic = %topic,
                    requested_qos,
                    "Subscription to unknown topic refused"
                );
                grants.push(SubscriptionGrant::Failure);
            }
        }

        self.session.connection().send(OutboundFrame::SubAck {
            packet_id: subscribe.packet_id,
            grants,
        });

        if !matched {
            self.ctx
                .events
                .on_activity(self.session.id(), &identity.device_id)
                .await;
        }
    }

    /// Opts the device out of capability topics. Unknown topics are skipped
    /// and the UNSUBACK is sent regardless.
    pub(super) async fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribeFrame) {
        let Some(identity) = self.connected_identity("UNSUBSCRIBE") else {
            return;
        };

        let mut matched = false;
        for topic in &unsubscribe.topics {
            if let Some(capability) = self.ctx.config.topics.capability(topic) {
                self.session.set_capability(capability, false);
                matched = true;
                debug!(
                    session_id = %self.session.id(),
                    device_id = %identity.device_id,
                    ?capability,
                    "Capability disabled"
                );
            } else {
                warn!(
                    session_id = %self.session.id(),
                    device_id = %identity.device_id,
                    topic = %topic,
                    "Unsubscribe from unknown topic skipped"
                );
            }
        }

        self.session.connection().send(OutboundFrame::UnsubAck {
            packet_id: unsubscribe.packet_id,
            entries: unsubscribe.topics.len(),
        });

        if !matched {
            self.ctx
                .events
                .on_activity(self.session.id(), &identity.device_id)
                .await;
        }
    }
}
