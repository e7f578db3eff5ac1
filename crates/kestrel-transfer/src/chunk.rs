//! Transfer chunk encoding and decoding.
//!
//! A chunk is one transfer-protocol message, carried as the payload of a
//! streaming RPC on the transfer service. The codec shares the TLV varint
//! primitives with the packet codec and is equally total over malformed
//! input.

use bytes::Bytes;
use kestrel_rpc::wire::{FieldReader, FieldWriter};
use kestrel_rpc::{Result, Status};

const TAG_TRANSFER_ID: u32 = 1;
const TAG_PENDING_BYTES: u32 = 2;
const TAG_MAX_CHUNK_SIZE: u32 = 3;
const TAG_MIN_DELAY_MICROSECONDS: u32 = 4;
const TAG_OFFSET: u32 = 5;
const TAG_DATA: u32 = 6;
const TAG_REMAINING_BYTES: u32 = 7;
const TAG_STATUS: u32 = 8;
const TAG_WINDOW_END_OFFSET: u32 = 9;
const TAG_TYPE: u32 = 10;
const TAG_RESOURCE_ID: u32 = 11;
const TAG_SESSION_ID: u32 = 12;
const TAG_PROTOCOL_VERSION: u32 = 13;
const TAG_DESIRED_SESSION_ID: u32 = 14;

/// Kind of a transfer chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkType {
    /// Data carried from transmitter to receiver.
    Data = 0,
    /// Opens a transfer.
    Start = 1,
    /// Receiver parameters that rewind the transmitter to `offset`.
    ParametersRetransmit = 2,
    /// Receiver parameters that extend the window without rewinding.
    ParametersContinue = 3,
    /// Terminates a transfer with a status.
    Completion = 4,
    /// Acknowledges a completion.
    CompletionAck = 5,
    /// Server response to `Start` in the versioned handshake.
    StartAck = 6,
    /// Client confirmation of `StartAck`.
    StartAckConfirmation = 7,
}

impl ChunkType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Start),
            2 => Some(Self::ParametersRetransmit),
            3 => Some(Self::ParametersContinue),
            4 => Some(Self::Completion),
            5 => Some(Self::CompletionAck),
            6 => Some(Self::StartAck),
            7 => Some(Self::StartAckConfirmation),
            _ => None,
        }
    }

    /// True for the two parameter kinds.
    pub fn is_parameters(self) -> bool {
        matches!(self, Self::ParametersRetransmit | Self::ParametersContinue)
    }
}

/// Protocol revision negotiated per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ProtocolVersion {
    /// Pre-handshake protocol: sessions are identified by resource id and
    /// chunks carry the legacy `transfer_id`/`pending_bytes` fields.
    Legacy = 1,
    /// Adds the Start/StartAck/StartAckConfirmation handshake and explicit
    /// window offsets.
    V2 = 2,
}

impl ProtocolVersion {
    /// The most recent version this implementation speaks.
    pub const LATEST: Self = Self::V2;

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Legacy),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

/// One transfer-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_type: ChunkType,
    pub session_id: u32,
    pub desired_session_id: Option<u32>,
    pub resource_id: Option<u32>,
    pub offset: u64,
    pub window_end_offset: u64,
    pub max_chunk_size: Option<u32>,
    /// Carried for legacy peers; this implementation never delays sends.
    pub min_delay_microseconds: Option<u32>,
    pub data: Bytes,
    /// Zero on the final data chunk of a write transfer.
    pub remaining_bytes: Option<u64>,
    pub status: Option<Status>,
    pub protocol_version: Option<ProtocolVersion>,
}

impl Chunk {
    pub fn new(chunk_type: ChunkType, session_id: u32) -> Self {
        Self {
            chunk_type,
            session_id,
            desired_session_id: None,
            resource_id: None,
            offset: 0,
            window_end_offset: 0,
            max_chunk_size: None,
            min_delay_microseconds: None,
            data: Bytes::new(),
            remaining_bytes: None,
            status: None,
            protocol_version: None,
        }
    }

    /// Decodes a chunk from an RPC payload.
    ///
    /// `data` is sliced out of `payload` without copying. When a peer sends
    /// both the legacy `transfer_id` and a `session_id`, the session id is
    /// authoritative; when it omits `window_end_offset` but provides legacy
    /// `pending_bytes`, the window end is derived from the offset.
    pub fn decode(payload: &Bytes) -> Result<Self> {
        let mut chunk_type = None;
        let mut transfer_id = None;
        let mut session_id = None;
        let mut desired_session_id = None;
        let mut resource_id = None;
        let mut offset = 0;
        let mut window_end_offset = None;
        let mut pending_bytes = None;
        let mut max_chunk_size = None;
        let mut min_delay_microseconds = None;
        let mut data = Bytes::new();
        let mut remaining_bytes = None;
        let mut status = None;
        let mut protocol_version = None;

        let mut reader = FieldReader::new(payload);
        while let Some((tag, value)) = reader.next_field()? {
            match tag {
                TAG_TRANSFER_ID => transfer_id = Some(value.varint_u32()?),
                TAG_PENDING_BYTES => pending_bytes = Some(value.varint()?),
                TAG_MAX_CHUNK_SIZE => max_chunk_size = Some(value.varint_u32()?),
                TAG_MIN_DELAY_MICROSECONDS => {
                    min_delay_microseconds = Some(value.varint_u32()?)
                }
                TAG_OFFSET => offset = value.varint()?,
                TAG_DATA => data = payload.slice_ref(value.bytes()?),
                TAG_REMAINING_BYTES => remaining_bytes = Some(value.varint()?),
                TAG_STATUS => {
                    status = Some(Status::from_u32(value.varint_u32()?).ok_or(Status::DataLoss)?)
                }
                TAG_WINDOW_END_OFFSET => window_end_offset = Some(value.varint()?),
                TAG_TYPE => {
                    chunk_type =
                        Some(ChunkType::from_u32(value.varint_u32()?).ok_or(Status::DataLoss)?)
                }
                TAG_RESOURCE_ID => resource_id = Some(value.varint_u32()?),
                TAG_SESSION_ID => session_id = Some(value.varint_u32()?),
                TAG_PROTOCOL_VERSION => {
                    protocol_version =
                        Some(ProtocolVersion::from_u32(value.varint_u32()?).ok_or(Status::DataLoss)?)
                }
                TAG_DESIRED_SESSION_ID => desired_session_id = Some(value.varint_u32()?),
                _ => {}
            }
        }

        if let (Some(session), Some(transfer)) = (session_id, transfer_id) {
            if session != transfer {
                tracing::warn!(
                    session_id = session,
                    transfer_id = transfer,
                    "chunk carries both session and transfer ids; using session id"
                );
            }
        }
        let session_id = session_id.or(transfer_id).ok_or(Status::DataLoss)?;
        let window_end_offset = window_end_offset
            .or_else(|| pending_bytes.map(|pending| offset.saturating_add(pending)))
            .unwrap_or(0);

        Ok(Self {
            chunk_type: chunk_type.ok_or(Status::DataLoss)?,
            session_id,
            desired_session_id,
            resource_id,
            offset,
            window_end_offset,
            max_chunk_size,
            min_delay_microseconds,
            data,
            remaining_bytes,
            status,
            protocol_version,
        })
    }

    /// Encodes the chunk into `out`, returning the bytes written.
    ///
    /// Legacy sessions see their id in the `transfer_id` field and the
    /// window as `pending_bytes`; versioned sessions use `session_id` and
    /// `window_end_offset`.
    pub fn encode(&self, version: ProtocolVersion, out: &mut [u8]) -> Result<usize> {
        let mut writer = FieldWriter::new(out);
        match version {
            ProtocolVersion::Legacy => {
                writer.varint_field(TAG_TRANSFER_ID, u64::from(self.session_id))?;
                if self.window_end_offset > self.offset {
                    writer.varint_field(TAG_PENDING_BYTES, self.window_end_offset - self.offset)?;
                }
            }
            ProtocolVersion::V2 => {
                writer.varint_field(TAG_SESSION_ID, u64::from(self.session_id))?;
                if self.window_end_offset != 0 {
                    writer.varint_field(TAG_WINDOW_END_OFFSET, self.window_end_offset)?;
                }
            }
        }
        if let Some(max_chunk_size) = self.max_chunk_size {
            writer.varint_field(TAG_MAX_CHUNK_SIZE, u64::from(max_chunk_size))?;
        }
        if let Some(delay) = self.min_delay_microseconds {
            writer.varint_field(TAG_MIN_DELAY_MICROSECONDS, u64::from(delay))?;
        }
        if self.offset != 0 || self.chunk_type.is_parameters() || self.chunk_type == ChunkType::Data
        {
            writer.varint_field(TAG_OFFSET, self.offset)?;
        }
        if !self.data.is_empty() {
            writer.bytes_field(TAG_DATA, &self.data)?;
        }
        if let Some(remaining) = self.remaining_bytes {
            writer.varint_field(TAG_REMAINING_BYTES, remaining)?;
        }
        if let Some(status) = self.status {
            writer.varint_field(TAG_STATUS, status as u64)?;
        }
        writer.varint_field(TAG_TYPE, self.chunk_type as u64)?;
        if let Some(resource_id) = self.resource_id {
            writer.varint_field(TAG_RESOURCE_ID, u64::from(resource_id))?;
        }
        if let Some(version) = self.protocol_version {
            writer.varint_field(TAG_PROTOCOL_VERSION, version as u64)?;
        }
        if let Some(desired) = self.desired_session_id {
            writer.varint_field(TAG_DESIRED_SESSION_ID, u64::from(desired))?;
        }
        Ok(writer.written())
    }

    /// Encodes into a fresh buffer (control paths and tests).
    pub fn encode_to_vec(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut out = vec![0; 128 + self.data.len()];
        let len = self
            .encode(version, &mut out)
            .expect("staged buffer sized for chunk");
        out.truncate(len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_round_trip() {
        let chunk = Chunk {
            chunk_type: ChunkType::Data,
            session_id: 9,
            desired_session_id: None,
            resource_id: Some(7),
            offset: 512,
            window_end_offset: 1024,
            max_chunk_size: Some(256),
            min_delay_microseconds: None,
            data: Bytes::from_static(&[1, 2, 3, 4]),
            remaining_bytes: Some(0),
            status: None,
            protocol_version: Some(ProtocolVersion::V2),
        };
        let encoded = Bytes::from(chunk.encode_to_vec(ProtocolVersion::V2));
        let decoded = Chunk::decode(&encoded).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn legacy_encoding_uses_transfer_id_and_pending_bytes() {
        let mut chunk = Chunk::new(ChunkType::ParametersRetransmit, 7);
        chunk.offset = 128;
        chunk.window_end_offset = 640;

        let encoded = Bytes::from(chunk.encode_to_vec(ProtocolVersion::Legacy));
        let decoded = Chunk::decode(&encoded).unwrap();
        assert_eq!(decoded.session_id, 7);
        assert_eq!(decoded.offset, 128);
        assert_eq!(decoded.window_end_offset, 640);
    }

    #[test]
    fn session_id_wins_over_transfer_id() {
        let chunk = Chunk::new(ChunkType::Start, 11);
        let mut encoded = chunk.encode_to_vec(ProtocolVersion::V2);
        // Append a conflicting legacy transfer_id field.
        encoded.push((1 << 3) | 0);
        encoded.push(99);
        let decoded = Chunk::decode(&Bytes::from(encoded)).unwrap();
        assert_eq!(decoded.session_id, 11);
    }

    #[test]
    fn truncation_is_data_loss() {
        let mut chunk = Chunk::new(ChunkType::Data, 3);
        chunk.data = Bytes::from_static(b"payload");
        chunk.offset = 4;
        let encoded = chunk.encode_to_vec(ProtocolVersion::V2);
        for cut in [1, encoded.len() / 2, encoded.len() - 1] {
            let truncated = Bytes::from(encoded[..cut].to_vec());
            assert_eq!(Chunk::decode(&truncated), Err(Status::DataLoss));
        }
    }

    #[test]
    fn missing_type_is_data_loss() {
        let chunk = Chunk::new(ChunkType::Start, 3);
        let encoded = chunk.encode_to_vec(ProtocolVersion::V2);
        // Strip the trailing type field (key + value).
        let stripped = Bytes::from(encoded[..encoded.len() - 2].to_vec());
        assert_eq!(Chunk::decode(&stripped), Err(Status::DataLoss));
    }
}
