//! Topic classification for device frames.

use crate::config::TopicConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of device-to-platform messages carried on PUBLISH frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UplinkKind {
    PropertyReport,
    MessageReport,
    ConfigResponse,
    OtaResponse,
    ControlResponse,
    ControlRequest,
    Warning,
}

impl UplinkKind {
    /// Whether frames of this kind carry a payload the business layer reads.
    #[must_use]
    pub fn carries_payload(self) -> bool {
        !matches!(self, Self::Warning)
    }

    /// Whether a successfully handled frame of this kind counts as device
    /// activity.
    #[must_use]
    pub fn reports_activity(self) -> bool {
        matches!(self, Self::PropertyReport | Self::MessageReport)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PropertyReport => "property_report",
            Self::MessageReport => "message_report",
            Self::ConfigResponse => "config_response",
            Self::OtaResponse => "ota_response",
            Self::ControlResponse => "control_response",
            Self::ControlRequest => "control_request",
            Self::Warning => "warning",
        }
    }
}

impl fmt::Display for UplinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a PUBLISH topic routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishRoute {
    Uplink(UplinkKind),
    Unrecognized,
}

/// Subscribe-only feature channels a device opts into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ConfigPull,
    Ota,
    Control,
}

impl TopicConfig {
    /// Exact-match routing of a PUBLISH topic name.
    #[must_use]
    pub fn route_publish(&self, topic: &str) -> PublishRoute {
        let kind = if topic == self.property_report {
            UplinkKind::PropertyReport
        } else if topic == self.message_report {
            UplinkKind::MessageReport
        } else if topic == self.config_response {
            UplinkKind::ConfigResponse
        } else if topic == self.ota_response {
            UplinkKind::OtaResponse
        } else if topic == self.control_response {
            UplinkKind::ControlResponse
        } else if topic == self.control_request {
            UplinkKind::ControlRequest
        } else if topic == self.warning {
            UplinkKind::Warning
        } else {
            return PublishRoute::Unrecognized;
        };
        PublishRoute::Uplink(kind)
    }

    /// Exact-match lookup of a SUBSCRIBE/UNSUBSCRIBE entry.
    #[must_use]
    pub fn capability(&self, topic: &str) -> Option<Capability> {
        if topic == self.config_pull {
            Some(Capability::ConfigPull)
        } else if topic == self.ota_request {
            Some(Capability::Ota)
        } else if topic == self.control_request {
            Some(Capability::Control)
        } else {
            None
        }
    }

    /// Topic used for platform-to-device commands of the given capability.
    #[must_use]
    pub fn capability_topic(&self, capability: Capability) -> &str {
        match capability {
            Capability::ConfigPull => &self.config_pull,
            Capability::Ota => &self.ota_request,
            Capability::Control => &self.control_request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_publish_known_topics() {
        let topics = TopicConfig::default();
        assert_eq!(
            topics.route_publish("$iotdm/property/up"),
            PublishRoute::Uplink(UplinkKind::PropertyReport)
        );
        assert_eq!(
            topics.route_publish("$iotdm/warn/up"),
            PublishRoute::Uplink(UplinkKind::Warning)
        );
        assert_eq!(
            topics.route_publish("$iotdm/control/req"),
            PublishRoute::Uplink(UplinkKind::ControlRequest)
        );
    }

    #[test]
    fn test_route_publish_is_exact_match() {
        let topics = TopicConfig::default();
        assert_eq!(
            topics.route_publish("$iotdm/property/up/extra"),
            PublishRoute::Unrecognized
        );
        assert_eq!(topics.route_publish("$IOTDM/property/up"), PublishRoute::Unrecognized);
        assert_eq!(topics.route_publish(""), PublishRoute::Unrecognized);
    }

    #[test]
    fn test_capability_lookup() {
        let topics = TopicConfig::default();
        assert_eq!(topics.capability("$iotdm/config/get"), Some(Capability::ConfigPull));
        assert_eq!(topics.capability("$iotdm/ota/req"), Some(Capability::Ota));
        assert_eq!(topics.capability("$iotdm/control/req"), Some(Capability::Control));
        assert_eq!(topics.capability("$iotdm/property/up"), None);
        assert_eq!(topics.capability_topic(Capability::Ota), "$iotdm/ota/req");
    }

    #[test]
    fn test_uplink_kind_flags() {
        assert!(!UplinkKind::Warning.carries_payload());
        assert!(UplinkKind::OtaResponse.carries_payload());
        assert!(UplinkKind::PropertyReport.reports_activity());
        assert!(UplinkKind::MessageReport.reports_activity());
        assert!(!UplinkKind::ControlResponse.reports_activity());
    }
}
