use super::TransportHandler;
use crate::codec::{OutboundFrame, PublishFrame};
use crate::error::{Result, TransportError};
use crate::events::UplinkMessage;
use crate::payload;
use crate::topics::PublishRoute;
use std::sync::Arc;
use tracing::{debug, error, warn};

impl TransportHandler {
    /// Routes an uplink PUBLISH to the business layer.
    ///
    /// Delivery is awaited before the next frame is read so PUBACKs go out
    /// in the order the device published. A PUBACK is only sent for QoS 1
    /// publishes and only after delivery succeeded.
    pub(super) async fn handle_publish(&mut self, publish: PublishFrame) -> Result<()> {
        let Some(identity) = self.connected_identity("PUBLISH") else {
            return Ok(());
        };

        let kind = match self.ctx.config.topics.route_publish(&publish.topic) {
            PublishRoute::Uplink(kind) => kind,
            PublishRoute::Unrecognized => {
                warn!(
                    session_id = %self.session.id(),
                    device_id = %identity.device_id,
                    topic = %publish.topic,
                    "Publish to unrecognized topic"
                );
                return Err(TransportError::ProtocolViolation(format!(
                    "publish to unrecognized topic {}",
                    publish.topic
                )));
            }
        };

        let payload = kind
            .carries_payload()
            .then(|| payload::decode(identity.data_format, &publish.payload));
        let device_id: Arc<str> = identity.device_id.as_str().into();
        let message = UplinkMessage {
            session_id: self.session.id(),
            device_id: Arc::clone(&device_id),
            product_id: identity.product_id.as_str().into(),
            kind,
            data_format: identity.data_format,
            payload,
        };

        debug!(
            session_id = %self.session.id(),
            device_id = %device_id,
            kind = %kind,
            packet_id = publish.packet_id,
            payload_len = publish.payload.len(),
            "Delivering uplink"
        );

        if let Err(e) = self.ctx.events.deliver(message).await {
            error!(
                session_id = %self.session.id(),
                device_id = %device_id,
                kind = %kind,
                error = %e,
                "Uplink delivery failed"
            );
            return Err(e.into());
        }

        if publish.packet_id != 0 {
            self.session.connection().send(OutboundFrame::PubAck {
                packet_id: publish.packet_id,
            });
        }

        if kind.reports_activity() {
            self.ctx.events.on_activity(self.session.id(), &device_id).await;
        }
        Ok(())
    }
}
