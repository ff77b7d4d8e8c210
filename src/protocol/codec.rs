//! MQTT v3.1.1 wire codec
//!
//! Stateless encode/decode of control packets. Every call works on the buffer
//! it is handed and nothing else, so independent buffers may be processed
//! concurrently.
//!
//! Framing: one fixed-header byte (packet type in the high nibble, flags in
//! the low nibble), then the remaining length as a variable byte integer of
//! 1 to 4 bytes carrying 7 bits each with the high bit as continuation.

use super::packet::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PacketType, ProtocolVersion, Publish,
    QoS, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe,
};
use super::topics::{validate_topic_filter, validate_topic_name};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest value the 4-byte remaining-length field can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest complete packet: fixed header byte + 4 length bytes + body
pub const MAX_PACKET_SIZE: usize = MAX_REMAINING_LENGTH + 5;

/// Codec failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Incomplete packet: more bytes required")]
    Incomplete,
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Packet of {size} bytes exceeds limit of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },
}

fn malformed(message: impl Into<String>) -> CodecError {
    CodecError::Malformed(message.into())
}

/// Encode a packet and return the framed bytes
pub fn encode_to_bytes(packet: &Packet) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode(packet, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the framed encoding of `packet` to `buf`
pub fn encode(packet: &Packet, buf: &mut BytesMut) -> Result<(), CodecError> {
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0
        }
        Packet::ConnAck(connack) => {
            body.put_u8(u8::from(connack.session_present));
            body.put_u8(connack.code.as_u8());
            0
        }
        Packet::Publish(publish) => {
            encode_publish(publish, &mut body)?;
            (u8::from(publish.dup) << 3) | ((publish.qos as u8) << 1) | u8::from(publish.retain)
        }
        Packet::PubAck(id) | Packet::PubRec(id) | Packet::PubComp(id) | Packet::UnsubAck(id) => {
            body.put_u16(non_zero_id(*id)?);
            0
        }
        Packet::PubRel(id) => {
            body.put_u16(non_zero_id(*id)?);
            0b0010
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(malformed("SUBSCRIBE requires at least one topic filter"));
            }
            body.put_u16(non_zero_id(subscribe.packet_id)?);
            for (filter, qos) in &subscribe.filters {
                put_string(&mut body, filter)?;
                body.put_u8(*qos as u8);
            }
            0b0010
        }
        Packet::SubAck(suback) => {
            body.put_u16(non_zero_id(suback.packet_id)?);
            for code in &suback.return_codes {
                body.put_u8(code.as_u8());
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(malformed("UNSUBSCRIBE requires at least one topic filter"));
            }
            body.put_u16(non_zero_id(unsubscribe.packet_id)?);
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter)?;
            }
            0b0010
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    if body.len() > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge {
            size: body.len(),
            max: MAX_REMAINING_LENGTH,
        });
    }

    buf.reserve(body.len() + 5);
    buf.put_u8(((packet.packet_type() as u8) << 4) | flags);
    encode_remaining_length(body.len(), buf)?;
    buf.extend_from_slice(&body);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), CodecError> {
    put_string(body, connect.protocol.protocol_name())?;
    body.put_u8(connect.protocol.level());

    let mut flags = 0u8;
    if connect.username.is_some() {
        flags |= 0x80;
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if let Some(will) = &connect.last_will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.clean_session {
        flags |= 0x02;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_string(body, &connect.client_id)?;
    if let Some(will) = &connect.last_will {
        put_string(body, &will.topic)?;
        put_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(())
}

fn encode_publish(publish: &Publish, body: &mut BytesMut) -> Result<(), CodecError> {
    put_string(body, &publish.topic)?;
    match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, None) => {
            if publish.dup {
                return Err(malformed("QoS 0 PUBLISH must not set the DUP flag"));
            }
        }
        (QoS::AtMostOnce, Some(_)) => {
            return Err(malformed("QoS 0 PUBLISH must not carry a packet identifier"));
        }
        (_, Some(id)) => body.put_u16(non_zero_id(id)?),
        (_, None) => return Err(malformed("QoS 1/2 PUBLISH requires a packet identifier")),
    }
    body.extend_from_slice(&publish.payload);
    Ok(())
}

fn non_zero_id(id: u16) -> Result<u16, CodecError> {
    if id == 0 {
        Err(malformed("packet identifier must be non-zero"))
    } else {
        Ok(id)
    }
}

fn put_string(body: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    put_binary(body, value.as_bytes())
}

fn put_binary(body: &mut BytesMut, value: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(value.len())
        .map_err(|_| malformed(format!("field of {} bytes exceeds 65535", value.len())))?;
    body.put_u16(len);
    body.extend_from_slice(value);
    Ok(())
}

/// Write `len` as a variable byte integer
pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PacketTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Read a variable byte integer, returning `(value, bytes_used)`
pub fn decode_remaining_length(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in buf.iter().enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        if index == 3 {
            return Err(malformed("remaining length exceeds four bytes"));
        }
        multiplier *= 128;
    }
    Err(CodecError::Incomplete)
}

/// Decode one packet from the front of `buf`
///
/// Returns the packet and the number of bytes it occupied. Fails with
/// [`CodecError::Incomplete`] when the buffer holds only part of a packet.
pub fn decode(buf: &[u8]) -> Result<(Packet, usize), CodecError> {
    decode_with_limit(buf, MAX_PACKET_SIZE)
}

/// Like [`decode`], rejecting packets larger than `max_packet_size` bytes
/// before their body has been buffered
pub fn decode_with_limit(buf: &[u8], max_packet_size: usize) -> Result<(Packet, usize), CodecError> {
    let Some(&header) = buf.first() else {
        return Err(CodecError::Incomplete);
    };

    let packet_type = PacketType::from_nibble(header >> 4)
        .ok_or_else(|| malformed(format!("reserved packet type {}", header >> 4)))?;
    let flags = header & 0x0F;
    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(malformed(format!(
                "{packet_type:?} fixed header flags must be {required:#06b}, got {flags:#06b}"
            )));
        }
    }

    let (remaining, len_bytes) = decode_remaining_length(&buf[1..])?;
    let total = 1 + len_bytes + remaining;
    if total > max_packet_size {
        return Err(CodecError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if buf.len() < total {
        return Err(CodecError::Incomplete);
    }

    let mut reader = Reader::new(&buf[1 + len_bytes..total]);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut reader)?),
        PacketType::ConnAck => {
            let ack_flags = reader.u8()?;
            if ack_flags & 0xFE != 0 {
                return Err(malformed("CONNACK acknowledge flags reserved bits set"));
            }
            let code = reader.u8()?;
            let code = ConnectReturnCode::from_u8(code)
                .ok_or_else(|| malformed(format!("reserved CONNACK return code {code}")))?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 == 1,
                code,
            })
        }
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut reader)?),
        PacketType::PubAck => Packet::PubAck(reader.packet_id()?),
        PacketType::PubRec => Packet::PubRec(reader.packet_id()?),
        PacketType::PubRel => Packet::PubRel(reader.packet_id()?),
        PacketType::PubComp => Packet::PubComp(reader.packet_id()?),
        PacketType::Subscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while !reader.is_empty() {
                let filter = reader.string()?;
                validate_topic_filter(&filter).map_err(|e| malformed(e.to_string()))?;
                let options = reader.u8()?;
                if options & 0xFC != 0 {
                    return Err(malformed("SUBSCRIBE requested QoS reserved bits set"));
                }
                let qos = QoS::try_from(options).map_err(malformed)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(malformed("SUBSCRIBE without topic filters"));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::SubAck => {
            let packet_id = reader.packet_id()?;
            let mut return_codes = Vec::new();
            while !reader.is_empty() {
                let code = reader.u8()?;
                return_codes.push(
                    SubscribeReturnCode::from_u8(code)
                        .ok_or_else(|| malformed(format!("invalid SUBACK return code {code:#04x}")))?,
                );
            }
            if return_codes.is_empty() {
                return Err(malformed("SUBACK without return codes"));
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while !reader.is_empty() {
                let filter = reader.string()?;
                validate_topic_filter(&filter).map_err(|e| malformed(e.to_string()))?;
                filters.push(filter);
            }
            if filters.is_empty() {
                return Err(malformed("UNSUBSCRIBE without topic filters"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        PacketType::UnsubAck => Packet::UnsubAck(reader.packet_id()?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if !reader.is_empty() {
        return Err(malformed(format!(
            "{packet_type:?} has {} unexpected trailing bytes",
            reader.remaining()
        )));
    }
    Ok((packet, total))
}

fn decode_connect(reader: &mut Reader<'_>) -> Result<Connect, CodecError> {
    let name = reader.string()?;
    let level = reader.u8()?;
    let protocol = match ProtocolVersion::from_level(level) {
        Some(version) if version.protocol_name() == name => version,
        _ => {
            return Err(malformed(format!(
                "unsupported protocol {name:?} level {level}"
            )))
        }
    };

    let flags = reader.u8()?;
    if flags & 0x01 != 0 {
        return Err(malformed("CONNECT reserved flag set"));
    }
    let has_username = flags & 0x80 != 0;
    let has_password = flags & 0x40 != 0;
    let will_retain = flags & 0x20 != 0;
    let will_qos = (flags >> 3) & 0x03;
    let has_will = flags & 0x04 != 0;
    let clean_session = flags & 0x02 != 0;

    if !has_will && (will_retain || will_qos != 0) {
        return Err(malformed("will QoS/retain set without will flag"));
    }
    if has_password && !has_username && protocol == ProtocolVersion::V311 {
        return Err(malformed("password flag set without user name flag"));
    }

    let keep_alive = reader.u16()?;
    let client_id = reader.string()?;
    let last_will = if has_will {
        let topic = reader.string()?;
        let payload = Bytes::copy_from_slice(reader.binary()?);
        Some(LastWill {
            topic,
            payload,
            qos: QoS::try_from(will_qos).map_err(malformed)?,
            retain: will_retain,
        })
    } else {
        None
    };
    let username = if has_username {
        Some(reader.string()?)
    } else {
        None
    };
    let password = if has_password {
        Some(Bytes::copy_from_slice(reader.binary()?))
    } else {
        None
    };

    Ok(Connect {
        protocol,
        client_id,
        clean_session,
        keep_alive,
        last_will,
        username,
        password,
    })
}

fn decode_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Publish, CodecError> {
    let dup = flags & 0b1000 != 0;
    let qos = QoS::try_from((flags >> 1) & 0b11).map_err(malformed)?;
    let retain = flags & 0b0001 != 0;
    if qos == QoS::AtMostOnce && dup {
        return Err(malformed("QoS 0 PUBLISH with DUP flag set"));
    }

    let topic = reader.string()?;
    validate_topic_name(&topic).map_err(|e| malformed(e.to_string()))?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(reader.packet_id()?),
    };
    let payload = Bytes::copy_from_slice(reader.rest());

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    })
}

/// Cursor over the body of a single packet
///
/// The body length is already known, so running short here means the
/// declared remaining length lied: malformed, never incomplete.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(malformed(format!(
                "packet body truncated: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn packet_id(&mut self) -> Result<u16, CodecError> {
        non_zero_id(self.u16()?)
    }

    fn binary(&mut self) -> Result<&'a [u8], CodecError> {
        let len = usize::from(self.u16()?);
        self.take(len)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let raw = self.binary()?;
        let value = std::str::from_utf8(raw).map_err(|_| malformed("string is not valid UTF-8"))?;
        if value.contains('\u{0}') {
            return Err(malformed("string contains U+0000"));
        }
        Ok(value.to_string())
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
