//! Transport configuration
//!
//! Listener settings, resource limits and the protocol topic strings the
//! engine matches device frames against.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Transport engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP listener address
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent device connections
    pub max_connections: usize,

    /// Maximum frame size in bytes, fixed header included
    pub max_packet_size: usize,

    /// Upper bound on the CONNECT authentication round trip.
    ///
    /// `None` waits for the auth service indefinitely; the session stays
    /// unauthenticated until the peer goes away.
    #[serde(with = "humantime_serde")]
    pub auth_timeout: Option<Duration>,

    /// Capacity of the per-connection outbound frame queue
    pub outbound_queue_capacity: usize,

    /// Upper bound on writing one batch of frames to the socket. A peer that
    /// stops reading is disconnected once it is exceeded.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    pub topics: TopicConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 1883)),
            max_connections: 10_000,
            max_packet_size: 256 * 1024,
            auth_timeout: None,
            outbound_queue_capacity: 1024,
            write_timeout: Duration::from_secs(30),
            topics: TopicConfig::default(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_bind_address(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.bind_address = addr.into();
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    #[must_use]
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }

    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is zero or the topic table is inconsistent
    pub fn validate(&self) -> Result<&Self> {
        if self.max_connections == 0 {
            return Err(TransportError::Config(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.max_packet_size < 1024 {
            return Err(TransportError::Config(
                "max_packet_size must be at least 1024 bytes".to_string(),
            ));
        }

        if self.outbound_queue_capacity == 0 {
            return Err(TransportError::Config(
                "outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.write_timeout.is_zero() {
            return Err(TransportError::Config(
                "write_timeout must be greater than 0".to_string(),
            ));
        }

        if self.auth_timeout.is_some_and(|t| t.is_zero()) {
            return Err(TransportError::Config(
                "auth_timeout must be non-zero when set".to_string(),
            ));
        }

        self.topics.validate()?;
        Ok(self)
    }
}

/// Protocol topic strings.
///
/// Uplink topics are matched against PUBLISH topic names; capability topics
/// against SUBSCRIBE and UNSUBSCRIBE entries. `control_request` is both: a
/// device may publish requests on it and subscribe to receive them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub property_report: String,
    pub message_report: String,
    pub config_response: String,
    pub ota_response: String,
    pub control_response: String,
    pub control_request: String,
    pub warning: String,
    pub config_pull: String,
    pub ota_request: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            property_report: "$iotdm/property/up".to_string(),
            message_report: "$iotdm/message/up".to_string(),
            config_response: "$iotdm/config/resp".to_string(),
            ota_response: "$iotdm/ota/resp".to_string(),
            control_response: "$iotdm/control/resp".to_string(),
            control_request: "$iotdm/control/req".to_string(),
            warning: "$iotdm/warn/up".to_string(),
            config_pull: "$iotdm/config/get".to_string(),
            ota_request: "$iotdm/ota/req".to_string(),
        }
    }
}

impl TopicConfig {
    fn uplink_topics(&self) -> [&str; 7] {
        [
            &self.property_report,
            &self.message_report,
            &self.config_response,
            &self.ota_response,
            &self.control_response,
            &self.control_request,
            &self.warning,
        ]
    }

    /// # Errors
    ///
    /// Returns an error if a topic is empty, or if two uplink topics (or two
    /// capability topics) share the same string
    pub fn validate(&self) -> Result<()> {
        let uplink = self.uplink_topics();
        let capability = [
            self.config_pull.as_str(),
            self.ota_request.as_str(),
            self.control_request.as_str(),
        ];

        for (set, topics) in [("uplink", &uplink[..]), ("capability", &capability[..])] {
            let mut seen = HashSet::new();
            for topic in topics {
                if topic.is_empty() {
                    return Err(TransportError::Config(format!("empty {set} topic")));
                }
                if !seen.insert(*topic) {
                    return Err(TransportError::Config(format!(
                        "duplicate {set} topic: {topic}"
                    )));
                }
            }
        }

        Ok(())
    }
}
