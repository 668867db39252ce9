//! Shared fixtures for the transport integration tests: a running server
//! with a small device directory, an event recorder, and a raw TCP device
//! client that writes hand-built MQTT frames.

#![allow(dead_code, clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use bytes::{BufMut, BytesMut};
use iotdm_mqtt::{
    DataFormat, DeliveryResult, DeviceDirectoryAuthService, DeviceEventHandler, DeviceRecord,
    DisconnectEvent, Session, SessionId, SessionInfo, SessionLogEvent, SessionRegistry, ShutdownHandle,
    TransportConfig, TransportContext, TransportServer, UplinkMessage,
};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(3);

pub const PROPERTY_TOPIC: &str = "$iotdm/property/up";
pub const WARNING_TOPIC: &str = "$iotdm/warn/up";
pub const CONFIG_PULL_TOPIC: &str = "$iotdm/config/get";
pub const OTA_TOPIC: &str = "$iotdm/ota/req";
pub const CONTROL_TOPIC: &str = "$iotdm/control/req";

pub const JSON_CLIENT: &str = "meter-01";
pub const JSON_DEVICE: &str = "dev-meter-01";
pub const BINARY_CLIENT: &str = "sensor-02";
pub const BINARY_DEVICE: &str = "dev-sensor-02";
pub const SECRET: &str = "s3cret";

#[derive(Debug, Clone)]
pub enum Recorded {
    Connected(SessionInfo),
    Disconnected(DisconnectEvent),
    Activity(SessionId),
    SessionClosed(SessionLogEvent),
    Uplink(UplinkMessage),
    CommandAck(u16),
}

pub struct ChannelEvents {
    tx: flume::Sender<Recorded>,
}

impl DeviceEventHandler for ChannelEvents {
    fn on_connect_success<'a>(
        &'a self,
        info: &'a SessionInfo,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(Recorded::Connected(info.clone()));
            Ok(())
        })
    }

    fn on_disconnect<'a>(
        &'a self,
        event: DisconnectEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(Recorded::Disconnected(event));
        })
    }

    fn on_activity<'a>(
        &'a self,
        session_id: SessionId,
        _device_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(Recorded::Activity(session_id));
        })
    }

    fn on_session_closed<'a>(
        &'a self,
        event: SessionLogEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(Recorded::SessionClosed(event));
        })
    }

    fn deliver<'a>(
        &'a self,
        message: UplinkMessage,
    ) -> Pin<Box<dyn Future<Output = DeliveryResult> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(Recorded::Uplink(message));
            Ok(())
        })
    }

    fn on_command_ack<'a>(
        &'a self,
        _session_id: SessionId,
        _device_id: &'a str,
        packet_id: u16,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.tx.send(Recorded::CommandAck(packet_id));
        })
    }
}

fn device(client_id: &str, device_id: &str, format: DataFormat) -> DeviceRecord {
    DeviceRecord {
        client_id: client_id.to_string(),
        username: None,
        secret_hash: DeviceDirectoryAuthService::hash_secret(SECRET).unwrap(),
        device_id: device_id.to_string(),
        product_id: "prod-01".to_string(),
        data_format: format,
        device_code: None,
        tenant_id: None,
        node_type: None,
    }
}

/// A transport server on an ephemeral localhost port.
pub struct TestTransport {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    pub events: flume::Receiver<Recorded>,
    shutdown: ShutdownHandle,
    task: JoinHandle<iotdm_mqtt::Result<()>>,
}

impl TestTransport {
    pub async fn start() -> Self {
        Self::start_with(TransportConfig::default()).await
    }

    pub async fn start_with(config: TransportConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();

        let auth = DeviceDirectoryAuthService::new();
        auth.add_device(device(JSON_CLIENT, JSON_DEVICE, DataFormat::Json));
        auth.add_device(device(BINARY_CLIENT, BINARY_DEVICE, DataFormat::Binary));

        let (tx, events) = flume::unbounded();
        let registry = Arc::new(SessionRegistry::new());
        let config = config.with_bind_address(([127, 0, 0, 1], 0));
        let ctx = TransportContext::new(
            Arc::new(config),
            Arc::new(auth),
            Arc::clone(&registry),
            Arc::new(ChannelEvents { tx }),
        );

        let server = TransportServer::bind(ctx).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        Self {
            addr,
            registry,
            events,
            shutdown,
            task,
        }
    }

    /// Waits for the first recorded event `pick` accepts, skipping others.
    pub async fn wait_event<T>(&self, mut pick: impl FnMut(Recorded) -> Option<T>) -> T {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv_async())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    }

    /// Waits until the device's session is registered and CONNECTED.
    pub async fn wait_connected(&self, device_id: &str) -> Arc<Session> {
        for _ in 0..600 {
            if let Some(session) = self.registry.lookup_device(device_id).await {
                if session.is_connected() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("device {device_id} never reached CONNECTED");
    }

    pub async fn stop(self) {
        self.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Device-side TCP client that writes raw bytes and reads whole frames.
pub struct RawDeviceClient {
    stream: TcpStream,
}

impl RawDeviceClient {
    pub async fn connect_tcp(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    pub async fn send_raw(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Reads one frame as `(first_byte, body)`. `None` on timeout or close.
    pub async fn read_frame(&mut self, timeout_dur: Duration) -> Option<(u8, Vec<u8>)> {
        tokio::time::timeout(timeout_dur, async {
            let first = self.stream.read_u8().await.ok()?;
            let mut remaining: u32 = 0;
            let mut shift = 0;
            loop {
                let byte = self.stream.read_u8().await.ok()?;
                remaining |= u32::from(byte & 0x7F) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
                if shift > 21 {
                    return None;
                }
            }
            let mut body = vec![0u8; remaining as usize];
            self.stream.read_exact(&mut body).await.ok()?;
            Some((first, body))
        })
        .await
        .ok()
        .flatten()
    }

    /// `true` once the server closed the connection.
    pub async fn expect_closed(&mut self, timeout_dur: Duration) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match tokio::time::timeout(timeout_dur, self.stream.read(&mut buf)).await {
                Ok(Ok(0) | Err(_)) => return true,
                Ok(Ok(_)) => {}
                Err(_) => return false,
            }
        }
    }

    /// Return code of a CONNACK (v3.1.1 return code or v5 reason code).
    pub async fn expect_connack(&mut self, timeout_dur: Duration) -> Option<u8> {
        let (first, body) = self.read_frame(timeout_dur).await?;
        (first == 0x20 && body.len() >= 2).then(|| body[1])
    }

    /// Sends a v5 CONNECT with the shared secret and waits for CONNACK.
    pub async fn connect_and_establish(&mut self, client_id: &str, timeout_dur: Duration) {
        self.send_raw(&RawPacketBuilder::connect_v5(client_id, SECRET))
            .await
            .unwrap();
        assert_eq!(self.expect_connack(timeout_dur).await, Some(0x00));
    }

    pub async fn expect_puback(&mut self, timeout_dur: Duration) -> Option<u16> {
        let (first, body) = self.read_frame(timeout_dur).await?;
        (first == 0x40 && body.len() >= 2).then(|| u16::from_be_bytes([body[0], body[1]]))
    }

    /// v5 SUBACK as `(packet_id, reason_codes)`.
    pub async fn expect_suback(&mut self, timeout_dur: Duration) -> Option<(u16, Vec<u8>)> {
        let (first, body) = self.read_frame(timeout_dur).await?;
        if first != 0x90 || body.len() < 3 {
            return None;
        }
        let packet_id = u16::from_be_bytes([body[0], body[1]]);
        let props_len = body[2] as usize;
        Some((packet_id, body[3 + props_len..].to_vec()))
    }

    pub async fn expect_unsuback(&mut self, timeout_dur: Duration) -> Option<u16> {
        let (first, body) = self.read_frame(timeout_dur).await?;
        (first == 0xB0 && body.len() >= 2).then(|| u16::from_be_bytes([body[0], body[1]]))
    }

    pub async fn expect_pingresp(&mut self, timeout_dur: Duration) -> bool {
        matches!(self.read_frame(timeout_dur).await, Some((0xD0, body)) if body.is_empty())
    }

    /// v5 QoS 1 PUBLISH as `(packet_id, topic, payload)`.
    pub async fn expect_publish(&mut self, timeout_dur: Duration) -> Option<(u16, String, Vec<u8>)> {
        let (first, body) = self.read_frame(timeout_dur).await?;
        if first & 0xF0 != 0x30 {
            return None;
        }
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).ok()?;
        let mut idx = 2 + topic_len;
        let packet_id = u16::from_be_bytes([body[idx], body[idx + 1]]);
        idx += 2;
        let props_len = body[idx] as usize;
        idx += 1 + props_len;
        Some((packet_id, topic, body[idx..].to_vec()))
    }
}

/// Hand-built device frames.
pub struct RawPacketBuilder;

impl RawPacketBuilder {
    /// v5 CONNECT with clean start, keepalive 60s, no properties and the
    /// secret as password.
    pub fn connect_v5(client_id: &str, secret: &str) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(4);
        body.put_slice(b"MQTT");
        body.put_u8(5);
        body.put_u8(0xC2);
        body.put_u16(60);
        body.put_u8(0);
        put_mqtt_string(&mut body, client_id);
        put_mqtt_string(&mut body, "device");
        put_mqtt_string(&mut body, secret);
        wrap_fixed_header(0x10, &body)
    }

    /// v3.1.1 CONNECT with the secret as password.
    pub fn connect_v311(client_id: &str, secret: &str) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(4);
        body.put_slice(b"MQTT");
        body.put_u8(4);
        body.put_u8(0xC2);
        body.put_u16(60);
        put_mqtt_string(&mut body, client_id);
        put_mqtt_string(&mut body, "device");
        put_mqtt_string(&mut body, secret);
        wrap_fixed_header(0x10, &body)
    }

    pub fn connect_with_protocol_version(version: u8) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(4);
        body.put_slice(b"MQTT");
        body.put_u8(version);
        body.put_u8(0x02);
        body.put_u16(60);
        put_mqtt_string(&mut body, JSON_CLIENT);
        wrap_fixed_header(0x10, &body)
    }

    pub fn publish_qos0(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = BytesMut::new();
        put_mqtt_string(&mut body, topic);
        body.put_u8(0);
        body.put_slice(payload);
        wrap_fixed_header(0x30, &body)
    }

    pub fn publish_qos1(topic: &str, payload: &[u8], packet_id: u16) -> Vec<u8> {
        let mut body = BytesMut::new();
        put_mqtt_string(&mut body, topic);
        body.put_u16(packet_id);
        body.put_u8(0);
        body.put_slice(payload);
        wrap_fixed_header(0x32, &body)
    }

    pub fn subscribe(packet_id: u16, topics: &[&str]) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(packet_id);
        body.put_u8(0);
        for topic in topics {
            put_mqtt_string(&mut body, topic);
            body.put_u8(0x01);
        }
        wrap_fixed_header(0x82, &body)
    }

    /// v3.1.1 SUBSCRIBE for one topic at QoS 0; no properties section.
    pub fn subscribe_v311(packet_id: u16, topic: &str) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(packet_id);
        put_mqtt_string(&mut body, topic);
        body.put_u8(0x00);
        wrap_fixed_header(0x82, &body)
    }

    pub fn unsubscribe(packet_id: u16, topics: &[&str]) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(packet_id);
        body.put_u8(0);
        for topic in topics {
            put_mqtt_string(&mut body, topic);
        }
        wrap_fixed_header(0xA2, &body)
    }

    pub fn puback(packet_id: u16) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u16(packet_id);
        wrap_fixed_header(0x40, &body)
    }

    pub fn pingreq() -> Vec<u8> {
        vec![0xC0, 0x00]
    }

    pub fn disconnect() -> Vec<u8> {
        vec![0xE0, 0x00]
    }
}

fn put_mqtt_string(buf: &mut BytesMut, s: &str) {
    let bytes = s.as_bytes();
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn encode_variable_int(buf: &mut BytesMut, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

fn wrap_fixed_header(first_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = BytesMut::new();
    packet.put_u8(first_byte);
    encode_variable_int(&mut packet, body.len() as u32);
    packet.put_slice(body);
    packet.to_vec()
}
