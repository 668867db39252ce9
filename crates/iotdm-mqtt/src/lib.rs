//! Device transport engine for the IoT device-management platform.
//!
//! Devices connect over MQTT (v3.1.1 or v5), authenticate with a shared
//! secret, report properties and events on fixed uplink topics, and opt into
//! server-pushed capabilities by subscribing to capability topics. This crate
//! terminates those connections and reports everything it learns to a
//! [`DeviceEventHandler`].
//!
//! ```no_run
//! use iotdm_mqtt::{
//!     DeviceDirectoryAuthService, LoggingEventHandler, SessionRegistry, TransportConfig,
//!     TransportContext, TransportServer,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> iotdm_mqtt::Result<()> {
//! let auth = DeviceDirectoryAuthService::from_file("devices.json").await?;
//! let ctx = TransportContext::new(
//!     Arc::new(TransportConfig::default()),
//!     Arc::new(auth),
//!     Arc::new(SessionRegistry::new()),
//!     Arc::new(LoggingEventHandler),
//! );
//! TransportServer::bind(ctx).await?.run().await
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fatal;
pub mod handler;
pub mod payload;
pub mod registry;
pub mod server;
pub mod session;
pub mod topics;

pub use auth::{
    AuthError, AuthResult, ConnectReturnCode, DeviceAuthService, DeviceDirectoryAuthService,
    DeviceDirectoryFile, DeviceRecord, ProtocolType, SecretCredentials,
};
pub use config::{TopicConfig, TransportConfig};
pub use error::{DeliveryError, PushError, RegistrationError, Result, TransportError};
pub use events::{
    DeliveryResult, DeviceEventHandler, DisconnectEvent, LoggingEventHandler, SessionInfo,
    SessionLogEvent, UplinkMessage,
};
pub use fatal::{FatalErrorPolicy, ProcessExitPolicy, RecordingPolicy};
pub use handler::{TransportContext, TransportHandler};
pub use registry::SessionRegistry;
pub use server::{ShutdownHandle, TransportServer};
pub use session::{
    CapabilityFlags, ConnectionState, DataFormat, DeviceIdentity, NodeType, Session, SessionId,
};
pub use topics::{Capability, PublishRoute, UplinkKind};
