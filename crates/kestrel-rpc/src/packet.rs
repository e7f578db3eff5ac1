//! RPC packet encoding and decoding.
//!
//! A packet is a self-describing TLV frame with a small fixed field set:
//! type(1), channel_id(2), service_id(3), method_id(4), payload(5),
//! status(6), call_id(8). All six low-numbered fields are always emitted;
//! `call_id` is elided when zero so legacy peers that never assign call ids
//! see the frames they expect.

use crate::wire::{self, FieldReader, FieldWriter};
use crate::{Result, Status};

const TAG_TYPE: u32 = 1;
const TAG_CHANNEL_ID: u32 = 2;
const TAG_SERVICE_ID: u32 = 3;
const TAG_METHOD_ID: u32 = 4;
const TAG_PAYLOAD: u32 = 5;
const TAG_STATUS: u32 = 6;
const TAG_CALL_ID: u32 = 8;

/// Minimum encoded size of a packet: the six required fields at two bytes
/// each (key byte plus a one-byte value or zero length). Channels reserve
/// exactly this much headroom ahead of staged payloads.
pub const MIN_ENCODED_SIZE: usize = 12;

/// Kind of an RPC packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    /// Client-initiated request; opens a call on the server.
    Request = 0,
    /// Terminal server response carrying the final payload and status.
    Response = 1,
    /// One client-to-server stream payload.
    ClientStream = 2,
    /// One server-to-client stream payload.
    ServerStream = 3,
    /// Client-side terminal error (cancellation included).
    ClientError = 4,
    /// Server-side terminal error.
    ServerError = 5,
    /// Client half-close: no further client stream payloads will be sent.
    ClientRequestCompletion = 6,
}

impl PacketType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::ClientStream),
            3 => Some(Self::ServerStream),
            4 => Some(Self::ClientError),
            5 => Some(Self::ServerError),
            6 => Some(Self::ClientRequestCompletion),
            _ => None,
        }
    }

    /// True for the packet kinds that close a call when received.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Response | Self::ClientError | Self::ServerError)
    }

    /// True for the two error kinds.
    pub fn is_error(self) -> bool {
        matches!(self, Self::ClientError | Self::ServerError)
    }
}

/// A borrowed view of one RPC packet.
///
/// Packets never own their payload; encode writes into a caller-provided
/// buffer and decode borrows from the inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    packet_type: PacketType,
    channel_id: u32,
    service_id: u32,
    method_id: u32,
    call_id: u32,
    payload: &'a [u8],
    status: Status,
}

impl<'a> Packet<'a> {
    pub const fn new(
        packet_type: PacketType,
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        payload: &'a [u8],
        status: Status,
    ) -> Self {
        Self {
            packet_type,
            channel_id,
            service_id,
            method_id,
            call_id,
            payload,
            status,
        }
    }

    pub const fn request(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        payload: &'a [u8],
    ) -> Self {
        Self::new(
            PacketType::Request,
            channel_id,
            service_id,
            method_id,
            call_id,
            payload,
            Status::Ok,
        )
    }

    pub const fn response(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        payload: &'a [u8],
        status: Status,
    ) -> Self {
        Self::new(
            PacketType::Response,
            channel_id,
            service_id,
            method_id,
            call_id,
            payload,
            status,
        )
    }

    pub const fn client_stream(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        payload: &'a [u8],
    ) -> Self {
        Self::new(
            PacketType::ClientStream,
            channel_id,
            service_id,
            method_id,
            call_id,
            payload,
            Status::Ok,
        )
    }

    pub const fn server_stream(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        payload: &'a [u8],
    ) -> Self {
        Self::new(
            PacketType::ServerStream,
            channel_id,
            service_id,
            method_id,
            call_id,
            payload,
            Status::Ok,
        )
    }

    pub const fn client_error(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        status: Status,
    ) -> Self {
        Self::new(
            PacketType::ClientError,
            channel_id,
            service_id,
            method_id,
            call_id,
            &[],
            status,
        )
    }

    pub const fn server_error(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        status: Status,
    ) -> Self {
        Self::new(
            PacketType::ServerError,
            channel_id,
            service_id,
            method_id,
            call_id,
            &[],
            status,
        )
    }

    pub const fn client_request_completion(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
    ) -> Self {
        Self::new(
            PacketType::ClientRequestCompletion,
            channel_id,
            service_id,
            method_id,
            call_id,
            &[],
            Status::Ok,
        )
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    pub fn method_id(&self) -> u32 {
        self.method_id
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn with_payload(self, payload: &'a [u8]) -> Self {
        Self { payload, ..self }
    }

    /// Decodes a packet from `input`, borrowing the payload.
    ///
    /// Total over malformed input: truncation, a missing required field, or
    /// an out-of-range type enum yield `DataLoss`. Unknown tags are skipped.
    pub fn decode(input: &'a [u8]) -> Result<Self> {
        let mut packet_type = None;
        let mut channel_id = None;
        let mut service_id = None;
        let mut method_id = None;
        let mut call_id = 0;
        let mut payload = None;
        let mut status = None;

        let mut reader = FieldReader::new(input);
        while let Some((tag, value)) = reader.next_field()? {
            match tag {
                TAG_TYPE => {
                    packet_type =
                        Some(PacketType::from_u32(value.varint_u32()?).ok_or(Status::DataLoss)?);
                }
                TAG_CHANNEL_ID => channel_id = Some(value.varint_u32()?),
                TAG_SERVICE_ID => service_id = Some(value.varint_u32()?),
                TAG_METHOD_ID => method_id = Some(value.varint_u32()?),
                TAG_PAYLOAD => payload = Some(value.bytes()?),
                TAG_STATUS => {
                    status = Some(Status::from_u32(value.varint_u32()?).ok_or(Status::DataLoss)?);
                }
                TAG_CALL_ID => call_id = value.varint_u32()?,
                _ => {}
            }
        }

        Ok(Self {
            packet_type: packet_type.ok_or(Status::DataLoss)?,
            channel_id: channel_id.ok_or(Status::DataLoss)?,
            service_id: service_id.ok_or(Status::DataLoss)?,
            method_id: method_id.ok_or(Status::DataLoss)?,
            call_id,
            payload: payload.ok_or(Status::DataLoss)?,
            status: status.ok_or(Status::DataLoss)?,
        })
    }

    /// Exact size `encode` will produce.
    pub fn encoded_size(&self) -> usize {
        let mut size = wire::varint_field_size(self.packet_type as u64)
            + wire::varint_field_size(u64::from(self.channel_id))
            + wire::varint_field_size(u64::from(self.service_id))
            + wire::varint_field_size(u64::from(self.method_id))
            + wire::bytes_field_size(self.payload.len())
            + wire::varint_field_size(self.status as u64);
        if self.call_id != 0 {
            size += wire::varint_field_size(u64::from(self.call_id));
        }
        size
    }

    /// Encodes the packet into `out`, returning the number of bytes written.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize> {
        if out.len() < self.encoded_size() {
            return Err(Status::ResourceExhausted);
        }
        let mut writer = FieldWriter::new(out);
        self.encode_header(&mut writer, self.payload.len())?;
        let payload_at = writer.written();
        out[payload_at..payload_at + self.payload.len()].copy_from_slice(self.payload);
        let mut writer = FieldWriter::at_offset(out, payload_at + self.payload.len());
        self.encode_trailer(&mut writer)?;
        Ok(writer.written())
    }

    /// Encodes around a payload already staged inside `buf`.
    ///
    /// The payload occupies `buf[payload_at..payload_at + payload_len]` and
    /// is shifted to sit immediately after the header fields, which may be
    /// shorter or longer than the reserved headroom.
    pub(crate) fn encode_in_place(
        &self,
        buf: &mut [u8],
        payload_at: usize,
        payload_len: usize,
    ) -> Result<usize> {
        debug_assert!(payload_at + payload_len <= buf.len());

        let header_len = wire::varint_field_size(self.packet_type as u64)
            + wire::varint_field_size(u64::from(self.channel_id))
            + wire::varint_field_size(u64::from(self.service_id))
            + wire::varint_field_size(u64::from(self.method_id))
            + 1
            + wire::varint_size(payload_len as u64);
        let trailer_len = wire::varint_field_size(self.status as u64)
            + if self.call_id != 0 {
                wire::varint_field_size(u64::from(self.call_id))
            } else {
                0
            };
        if header_len + payload_len + trailer_len > buf.len() {
            return Err(Status::Internal);
        }

        buf.copy_within(payload_at..payload_at + payload_len, header_len);

        let mut writer = FieldWriter::new(buf);
        self.encode_header(&mut writer, payload_len)?;
        debug_assert_eq!(writer.written(), header_len);

        let mut writer = FieldWriter::at_offset(buf, header_len + payload_len);
        self.encode_trailer(&mut writer)?;
        Ok(writer.written())
    }

    fn encode_header(&self, writer: &mut FieldWriter<'_>, payload_len: usize) -> Result<()> {
        writer.varint_field(TAG_TYPE, self.packet_type as u64)?;
        writer.varint_field(TAG_CHANNEL_ID, u64::from(self.channel_id))?;
        writer.varint_field(TAG_SERVICE_ID, u64::from(self.service_id))?;
        writer.varint_field(TAG_METHOD_ID, u64::from(self.method_id))?;
        writer.delimited_header(TAG_PAYLOAD, payload_len)
    }

    fn encode_trailer(&self, writer: &mut FieldWriter<'_>) -> Result<()> {
        writer.varint_field(TAG_STATUS, self.status as u64)?;
        if self.call_id != 0 {
            writer.varint_field(TAG_CALL_ID, u64::from(self.call_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = &[0xab, 0xcd, 0xef];

    fn test_packet() -> Packet<'static> {
        Packet::new(
            PacketType::ServerStream,
            23,
            42,
            100,
            7,
            PAYLOAD,
            Status::Ok,
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = test_packet();
        let mut buf = [0u8; 64];
        let len = packet.encode(&mut buf).unwrap();
        assert_eq!(len, packet.encoded_size());
        assert_eq!(Packet::decode(&buf[..len]).unwrap(), packet);
    }

    #[test]
    fn round_trips_every_type_and_status() {
        let mut buf = [0u8; 64];
        for ty in 0..7 {
            let ty = PacketType::from_u32(ty).unwrap();
            for status in [Status::Ok, Status::Cancelled, Status::DataLoss] {
                let packet = Packet::new(ty, 1, 2, 3, 4, b"x", status);
                let len = packet.encode(&mut buf).unwrap();
                assert_eq!(Packet::decode(&buf[..len]).unwrap(), packet);
            }
        }
    }

    #[test]
    fn every_truncation_is_data_loss() {
        // Zero call id so the encoding ends in a required field and every
        // proper prefix is malformed.
        let packet = Packet::new(PacketType::ServerStream, 23, 42, 100, 0, PAYLOAD, Status::Ok);
        let mut buf = [0u8; 64];
        let len = packet.encode(&mut buf).unwrap();
        for cut in 0..len {
            assert_eq!(
                Packet::decode(&buf[..cut]),
                Err(Status::DataLoss),
                "truncation at {cut} must fail"
            );
        }
    }

    #[test]
    fn zero_call_id_is_elided() {
        let legacy = Packet::request(1, 2, 3, 0, &[]);
        let assigned = Packet::request(1, 2, 3, 9, &[]);
        assert_eq!(legacy.encoded_size() + 2, assigned.encoded_size());

        let mut buf = [0u8; 32];
        let len = legacy.encode(&mut buf).unwrap();
        let decoded = Packet::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.call_id(), 0);
    }

    #[test]
    fn min_encoded_size_matches_smallest_packet() {
        let packet = Packet::new(PacketType::Request, 1, 42, 100, 0, &[], Status::Ok);
        assert_eq!(packet.encoded_size(), MIN_ENCODED_SIZE);
    }

    #[test]
    fn invalid_type_enum_is_data_loss() {
        let mut buf = [0u8; 32];
        let packet = test_packet();
        let len = packet.encode(&mut buf).unwrap();
        // Type is the first field; its value byte is at index 1.
        buf[1] = 99;
        assert_eq!(Packet::decode(&buf[..len]), Err(Status::DataLoss));
    }

    #[test]
    fn unknown_tags_are_skipped() {
        let packet = test_packet();
        let mut buf = [0u8; 64];
        let len = packet.encode(&mut buf).unwrap();
        // Append tag 15, varint 1.
        buf[len] = (15 << 3) | 0;
        buf[len + 1] = 1;
        assert_eq!(Packet::decode(&buf[..len + 2]).unwrap(), packet);
    }

    #[test]
    fn encode_in_place_shifts_staged_payload() {
        let packet = test_packet();
        let mut buf = [0u8; 64];
        buf[MIN_ENCODED_SIZE..MIN_ENCODED_SIZE + PAYLOAD.len()].copy_from_slice(PAYLOAD);
        let len = packet
            .encode_in_place(&mut buf, MIN_ENCODED_SIZE, PAYLOAD.len())
            .unwrap();
        assert_eq!(Packet::decode(&buf[..len]).unwrap(), packet);
    }
}
