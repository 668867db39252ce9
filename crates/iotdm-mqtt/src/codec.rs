//! Frame codec
//!
//! Adapts `mqtt5-protocol` packets to the closed set of frames the transport
//! engine understands, and encodes the engine's replies in the protocol
//! version negotiated at CONNECT.

use crate::auth::ConnectReturnCode;
use crate::error::{Result, TransportError};
use bytes::{BufMut, Bytes, BytesMut};
use mqtt5_protocol::packet::connack::ConnAckPacket;
use mqtt5_protocol::packet::puback::PubAckPacket;
use mqtt5_protocol::packet::publish::PublishPacket;
use mqtt5_protocol::packet::suback::{SubAckPacket, SubAckReasonCode};
use mqtt5_protocol::packet::unsuback::{UnsubAckPacket, UnsubAckReasonCode};
use mqtt5_protocol::packet::{FixedHeader, MqttPacket, Packet};
use mqtt5_protocol::QoS;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

pub const MQTT_V311: u8 = 4;
pub const MQTT_V5: u8 = 5;

const CONNACK_HEADER: u8 = 0x20;

const CONNECT_PACKET_TYPE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFrame {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub protocol_version: u8,
    pub keep_alive: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFrame {
    pub topic: String,
    /// Packet identifier; 0 for QoS 0 frames, which are never acknowledged.
    pub packet_id: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFrame {
    pub packet_id: u16,
    /// Topic filters with their requested QoS, in request order.
    pub entries: Vec<(String, u8)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeFrame {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

/// One decoded device-to-server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect(ConnectFrame),
    Publish(PublishFrame),
    Subscribe(SubscribeFrame),
    Unsubscribe(UnsubscribeFrame),
    PingReq,
    Disconnect,
    PubAck { packet_id: u16 },
    /// QoS 2 flow and AUTH frames; devices of this platform never need them.
    Unsupported(&'static str),
}

impl Frame {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT",
            Self::Publish(_) => "PUBLISH",
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::PingReq => "PINGREQ",
            Self::Disconnect => "DISCONNECT",
            Self::PubAck { .. } => "PUBACK",
            Self::Unsupported(kind) => kind,
        }
    }
}

/// Per-entry SUBACK result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionGrant {
    /// Granted at QoS 0.
    Granted,
    /// Wire value 0x80.
    Failure,
}

/// One server-to-device frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    ConnAck { return_code: ConnectReturnCode },
    SubAck { packet_id: u16, grants: Vec<SubscriptionGrant> },
    UnsubAck { packet_id: u16, entries: usize },
    PingResp,
    PubAck { packet_id: u16 },
    Publish { packet_id: u16, topic: String, payload: Bytes },
}

/// Converts a decoded protocol packet into a [`Frame`].
///
/// # Errors
///
/// Returns [`TransportError::UnexpectedFrame`] for packets only a server may
/// send
pub fn frame_from_packet(packet: Packet) -> Result<Frame> {
    let frame = match packet {
        Packet::Connect(connect) => {
            let connect = *connect;
            Frame::Connect(ConnectFrame {
                client_id: connect.client_id,
                username: connect.username,
                password: connect.password,
                protocol_version: connect.protocol_version,
                keep_alive: connect.keep_alive,
            })
        }
        Packet::Publish(publish) => Frame::Publish(PublishFrame {
            topic: publish.topic_name,
            packet_id: publish.packet_id.unwrap_or(0),
            payload: Bytes::copy_from_slice(&publish.payload[..]),
        }),
        Packet::Subscribe(subscribe) => Frame::Subscribe(SubscribeFrame {
            packet_id: subscribe.packet_id,
            entries: subscribe
                .filters
                .into_iter()
                .map(|f| (f.filter, f.options.qos as u8))
                .collect(),
        }),
        Packet::Unsubscribe(unsubscribe) => Frame::Unsubscribe(UnsubscribeFrame {
            packet_id: unsubscribe.packet_id,
            topics: unsubscribe.filters,
        }),
        Packet::PingReq => Frame::PingReq,
        Packet::Disconnect(_) => Frame::Disconnect,
        Packet::PubAck(puback) => Frame::PubAck {
            packet_id: puback.packet_id,
        },
        Packet::PubRec(_) => Frame::Unsupported("PUBREC"),
        Packet::PubRel(_) => Frame::Unsupported("PUBREL"),
        Packet::PubComp(_) => Frame::Unsupported("PUBCOMP"),
        Packet::Auth(_) => Frame::Unsupported("AUTH"),
        _ => {
            return Err(TransportError::UnexpectedFrame(
                "server-to-client packet received from device".to_string(),
            ))
        }
    };
    Ok(frame)
}

/// Incremental frame reader over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_packet_size: usize,
    protocol_version: Option<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_packet_size,
            protocol_version: None,
        }
    }

    /// Fixes the version used for frames after CONNECT.
    pub fn set_protocol_version(&mut self, version: u8) {
        self.protocol_version = Some(version);
    }

    /// Reads the next frame. `Ok(None)` means the peer closed the stream on a
    /// frame boundary.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure, truncated input, oversized or
    /// malformed frames
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.decode()? {
                return Ok(Some(frame));
            }

            if reader.read_buf(&mut self.buffer).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Malformed(format!(
                    "stream ended inside a frame ({} bytes buffered)",
                    self.buffer.len()
                )));
            }
        }
    }

    /// Decodes one complete frame from the internal buffer, if present.
    ///
    /// # Errors
    ///
    /// Returns an error for oversized or malformed frames
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        let Some((header_len, remaining_length)) = self.frame_length()? else {
            return Ok(None);
        };

        let total_len = header_len + remaining_length;
        if total_len > self.max_packet_size {
            return Err(TransportError::FrameTooLarge {
                size: total_len,
                max: self.max_packet_size,
            });
        }
        if self.buffer.len() < total_len {
            self.buffer.reserve(total_len - self.buffer.len());
            return Ok(None);
        }

        if self.protocol_version.is_none() && self.buffer[0] >> 4 == CONNECT_PACKET_TYPE {
            if let Some(level) = connect_protocol_level(&self.buffer[header_len..total_len]) {
                if level != MQTT_V311 && level != MQTT_V5 {
                    // surfaced undecoded so the handler can refuse the version
                    let _ = self.buffer.split_to(total_len);
                    return Ok(Some(Frame::Connect(ConnectFrame {
                        client_id: String::new(),
                        username: None,
                        password: None,
                        protocol_version: level,
                        keep_alive: 0,
                    })));
                }
            }
        }

        let mut packet_bytes = self.buffer.split_to(total_len).freeze();
        let fixed_header = FixedHeader::decode(&mut packet_bytes)?;
        trace!(
            packet_type = ?fixed_header.packet_type,
            remaining_length,
            "Decoding frame"
        );

        let packet = match self.protocol_version {
            Some(version) => Packet::decode_from_body_with_version(
                fixed_header.packet_type,
                &fixed_header,
                &mut packet_bytes,
                version,
            )?,
            None => Packet::decode_from_body(
                fixed_header.packet_type,
                &fixed_header,
                &mut packet_bytes,
            )?,
        };

        frame_from_packet(packet).map(Some)
    }

    fn frame_length(&self) -> Result<Option<(usize, usize)>> {
        let mut remaining_length = 0usize;
        let mut multiplier = 1usize;

        for i in 1..5 {
            let Some(&byte) = self.buffer.get(i) else {
                return Ok(None);
            };
            remaining_length += usize::from(byte & 0x7F) * multiplier;
            multiplier *= 128;

            if byte & 0x80 == 0 {
                return Ok(Some((i + 1, remaining_length)));
            }
        }

        Err(TransportError::Malformed(
            "invalid remaining length encoding".to_string(),
        ))
    }
}

/// Protocol level byte of a CONNECT body, after the protocol name.
fn connect_protocol_level(body: &[u8]) -> Option<u8> {
    let name_len = usize::from(u16::from_be_bytes([*body.first()?, *body.get(1)?]));
    body.get(2 + name_len).copied()
}

/// Encodes a reply frame for a device speaking `protocol_version`.
///
/// # Errors
///
/// Returns an error if the protocol encoder rejects the frame
pub fn encode_frame(frame: &OutboundFrame, protocol_version: u8, buf: &mut BytesMut) -> Result<()> {
    match frame {
        OutboundFrame::ConnAck { return_code } if protocol_version != MQTT_V5 => {
            // 3.1.1 return codes are not reason codes
            buf.put_slice(&[CONNACK_HEADER, 0x02, 0x00, return_code.as_u8()]);
        }
        OutboundFrame::ConnAck { return_code } => {
            let mut connack = ConnAckPacket::new(false, return_code.reason_code());
            connack.protocol_version = protocol_version;
            connack.encode(buf)?;
        }
        OutboundFrame::SubAck { packet_id, grants } => {
            let mut suback = SubAckPacket::new(*packet_id);
            suback.reason_codes = grants
                .iter()
                .map(|grant| match grant {
                    SubscriptionGrant::Granted => SubAckReasonCode::from_qos(QoS::AtMostOnce),
                    SubscriptionGrant::Failure => SubAckReasonCode::UnspecifiedError,
                })
                .collect();
            suback.protocol_version = protocol_version;
            suback.encode(buf)?;
        }
        OutboundFrame::UnsubAck { packet_id, entries } => {
            let mut unsuback = UnsubAckPacket::new(*packet_id);
            unsuback.reason_codes = vec![UnsubAckReasonCode::Success; *entries];
            unsuback.protocol_version = protocol_version;
            unsuback.encode(buf)?;
        }
        OutboundFrame::PingResp => {
            mqtt5_protocol::packet::pingresp::PingRespPacket::default().encode(buf)?;
        }
        OutboundFrame::PubAck { packet_id } => {
            PubAckPacket::new(*packet_id).encode(buf)?;
        }
        OutboundFrame::Publish {
            packet_id,
            topic,
            payload,
        } => {
            let mut publish = PublishPacket::new(topic.clone(), payload.to_vec(), QoS::AtLeastOnce);
            publish.packet_id = Some(*packet_id);
            publish.protocol_version = protocol_version;
            publish.encode(buf)?;
        }
    }
    Ok(())
}
