//! miIO wire protocol implementation.
//! Handles packet framing, the discovery probe, checksums and the
//! encrypted JSON command/response encoding.

use crate::crypto::CipherContext;
use crate::error::{MiioError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;

pub const MAGIC: u16 = 0x2131;
pub const HEADER_LEN: usize = 32;

/// Filler used by the discovery probe for every unknown header field.
const HELLO_FILL: u32 = 0xFFFF_FFFF;

/// miIO packet header (32 bytes, big-endian)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiioHeader {
    /// Total packet length, header included
    pub length: u16,
    /// Zero on regular packets, 0xFFFFFFFF on the probe
    pub reserved: u32,
    /// Device identifier learned during discovery
    pub device_id: u32,
    /// Device-reported counter, seconds since device boot
    pub stamp: u32,
    /// MD5 checksum (or token/filler on discovery packets)
    pub checksum: [u8; 16],
}

impl MiioHeader {
    fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u16::<BigEndian>(MAGIC)?;
        out.write_u16::<BigEndian>(self.length)?;
        out.write_u32::<BigEndian>(self.reserved)?;
        out.write_u32::<BigEndian>(self.device_id)?;
        out.write_u32::<BigEndian>(self.stamp)?;
        out.extend_from_slice(&self.checksum);
        Ok(())
    }
}

/// miIO packet: header followed by the encrypted payload
#[derive(Debug, Clone)]
pub struct MiioPacket {
    pub header: MiioHeader,
    pub data: Vec<u8>,
}

impl MiioPacket {
    /// The header-only discovery probe.
    pub fn hello() -> Self {
        Self {
            header: MiioHeader {
                length: HEADER_LEN as u16,
                reserved: HELLO_FILL,
                device_id: HELLO_FILL,
                stamp: HELLO_FILL,
                checksum: [0xFF; 16],
            },
            data: Vec::new(),
        }
    }

    pub fn is_hello(&self) -> bool {
        self.data.is_empty() && self.header.reserved == HELLO_FILL
    }

    /// Serialize the packet into wire bytes.
    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        self.header.write_to(&mut out)?;
        out.extend_from_slice(&self.data);
        Ok(out)
    }
}

/// Parse the 32-byte header from binary data.
pub fn parse_header(data: &[u8]) -> Result<MiioHeader> {
    if data.len() < HEADER_LEN {
        return Err(MiioError::DecodeError(format!(
            "Packet too short: {} bytes",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let magic = cursor.read_u16::<BigEndian>()?;
    if magic != MAGIC {
        return Err(MiioError::DecodeError(format!("Bad magic 0x{:04X}", magic)));
    }
    let length = cursor.read_u16::<BigEndian>()?;
    let reserved = cursor.read_u32::<BigEndian>()?;
    let device_id = cursor.read_u32::<BigEndian>()?;
    let stamp = cursor.read_u32::<BigEndian>()?;
    let mut checksum = [0u8; 16];
    checksum.copy_from_slice(&data[16..HEADER_LEN]);

    Ok(MiioHeader {
        length,
        reserved,
        device_id,
        stamp,
        checksum,
    })
}

/// Unpack binary data into a packet, honouring the header length field.
pub fn unpack_packet(data: &[u8]) -> Result<MiioPacket> {
    let header = parse_header(data)?;
    let total = header.length as usize;
    if total < HEADER_LEN || total > data.len() {
        return Err(MiioError::DecodeError(format!(
            "Length field {} does not fit datagram of {} bytes",
            total,
            data.len()
        )));
    }
    Ok(MiioPacket {
        data: data[HEADER_LEN..total].to_vec(),
        header,
    })
}

/// A command sent to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiioRequest {
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
}

/// A verified and decrypted message.
#[derive(Debug, Clone)]
pub struct MiioFrame {
    pub device_id: u32,
    pub stamp: u32,
    /// Decrypted JSON bytes without the NUL terminator
    pub payload: Vec<u8>,
    pub body: Value,
}

impl MiioFrame {
    pub fn id(&self) -> Option<u64> {
        self.body.get("id").and_then(Value::as_u64)
    }

    /// The error object of a failed command, if any.
    pub fn device_error(&self) -> Option<MiioError> {
        let err = self.body.get("error")?;
        Some(MiioError::DeviceError {
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Encode any JSON document as an encrypted packet.
/// The plaintext is NUL-terminated like the device's own messages.
pub fn encode_message<T: Serialize>(ctx: &CipherContext, body: &T) -> Result<Vec<u8>> {
    let mut plaintext = serde_json::to_vec(body)?;
    plaintext.push(0);
    let data = ctx.encrypt(&plaintext);

    let total = HEADER_LEN + data.len();
    let length = u16::try_from(total).map_err(|_| MiioError::EncryptionFailed)?;

    // The checksum is computed with the token standing in for the checksum field
    let mut header = MiioHeader {
        length,
        reserved: 0,
        device_id: ctx.device_id(),
        stamp: ctx.fresh_stamp(),
        checksum: *ctx.token(),
    };
    let mut head = Vec::with_capacity(HEADER_LEN);
    header.write_to(&mut head)?;
    header.checksum = ctx.checksum(&head, &data);

    MiioPacket { header, data }.pack()
}

/// Encode a command request.
pub fn encode_request(ctx: &CipherContext, request: &MiioRequest) -> Result<Vec<u8>> {
    encode_message(ctx, request)
}

/// Verify, decrypt and parse an inbound packet.
///
/// The checksum is checked before anything is decrypted so forged or
/// corrupted datagrams are rejected cheaply.
pub fn decode_message(ctx: &CipherContext, data: &[u8]) -> Result<MiioFrame> {
    let packet = unpack_packet(data)?;
    if packet.data.is_empty() {
        return Err(MiioError::DecodeError("Packet has no payload".into()));
    }

    ctx.verify(&data[..HEADER_LEN], &packet.data, &packet.header.checksum)?;

    let mut payload = ctx.decrypt(&packet.data)?;
    if payload.last() == Some(&0) {
        payload.pop();
    }
    let body: Value = serde_json::from_slice(&payload)?;

    Ok(MiioFrame {
        device_id: packet.header.device_id,
        stamp: packet.header.stamp,
        payload,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKEN: &[u8; 16] = b"0123456789abcdef";

    fn context() -> CipherContext {
        CipherContext::new(TOKEN, 0x0042_1337, 4000).unwrap()
    }

    #[test]
    fn hello_is_header_only_and_ff_filled() {
        let bytes = MiioPacket::hello().pack().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..4], &[0x21, 0x31, 0x00, 0x20]);
        assert!(bytes[4..].iter().all(|&b| b == 0xFF));
        assert!(unpack_packet(&bytes).unwrap().is_hello());
    }

    #[test]
    fn request_round_trips_through_codec() {
        let ctx = context();
        let request = MiioRequest {
            id: 1_700_000_000,
            method: "app_zoned_clean".into(),
            params: vec![json!([25000, 25000, 27000, 27000, 1])],
        };
        let bytes = encode_request(&ctx, &request).unwrap();

        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.length as usize, bytes.len());
        assert_eq!(header.reserved, 0);
        assert_eq!(header.device_id, 0x0042_1337);
        assert_eq!((bytes.len() - HEADER_LEN) % 16, 0);

        let frame = decode_message(&ctx, &bytes).unwrap();
        let decoded: MiioRequest = serde_json::from_value(frame.body).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(frame.payload.last(), Some(&b'}'));
    }

    #[test]
    fn empty_params_are_omitted() {
        let request = MiioRequest {
            id: 7,
            method: "get_status".into(),
            params: vec![],
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"id":7,"method":"get_status"}"#
        );
    }

    #[test]
    fn corrupted_checksum_fails_verification() {
        let ctx = context();
        let bytes = encode_message(&ctx, &json!({"id": 1, "result": ["ok"]})).unwrap();
        for offset in [16, 23, 31] {
            let mut corrupt = bytes.clone();
            corrupt[offset] ^= 0x01;
            assert_eq!(
                decode_message(&ctx, &corrupt).unwrap_err(),
                MiioError::ChecksumMismatch
            );
        }
    }

    #[test]
    fn corrupted_payload_fails_verification_before_decrypt() {
        let ctx = context();
        let mut bytes = encode_message(&ctx, &json!({"id": 1, "result": ["ok"]})).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert_eq!(
            decode_message(&ctx, &bytes).unwrap_err(),
            MiioError::ChecksumMismatch
        );
    }

    #[test]
    fn foreign_token_is_rejected() {
        let ours = context();
        let theirs = CipherContext::new(b"fedcba9876543210", 0x0042_1337, 4000).unwrap();
        let bytes = encode_message(&theirs, &json!({"id": 1})).unwrap();
        assert_eq!(
            decode_message(&ours, &bytes).unwrap_err(),
            MiioError::ChecksumMismatch
        );
    }

    #[test]
    fn short_or_misframed_datagrams_are_decode_errors() {
        let ctx = context();
        assert!(matches!(
            decode_message(&ctx, &[0x21, 0x31, 0x00]),
            Err(MiioError::DecodeError(_))
        ));

        let mut bad_magic = MiioPacket::hello().pack().unwrap();
        bad_magic[0] = 0x00;
        assert!(matches!(
            parse_header(&bad_magic),
            Err(MiioError::DecodeError(_))
        ));

        let mut truncated = encode_message(&ctx, &json!({"id": 1})).unwrap();
        truncated.truncate(40);
        assert!(matches!(
            decode_message(&ctx, &truncated),
            Err(MiioError::DecodeError(_))
        ));
    }

    #[test]
    fn device_error_is_extracted() {
        let ctx = context();
        let bytes = encode_message(
            &ctx,
            &json!({"id": 3, "error": {"code": -10000, "message": "method not found"}}),
        )
        .unwrap();
        let frame = decode_message(&ctx, &bytes).unwrap();
        assert_eq!(frame.id(), Some(3));
        assert_eq!(
            frame.device_error(),
            Some(MiioError::DeviceError {
                code: -10000,
                message: "method not found".into()
            })
        );
    }
}
