/*!
 * @file wire_protocol.rs
 * @brief MongoDB wire protocol framing and message codecs
 */

use crate::error::{MirageError, Result};
use bson::{Bson, Document};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const HEADER_LEN: usize = 16;
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;
pub const MAX_BSON_OBJECT_SIZE: i32 = 16_777_216;

const FLAG_CHECKSUM_PRESENT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Compressed = 2012,
    Msg = 2013,
}

impl OpCode {
    pub fn from_u32(value: u32) -> Option<OpCode> {
        match value {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            2012 => Some(OpCode::Compressed),
            2013 => Some(OpCode::Msg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub message_length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: u32,
}

impl MessageHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < HEADER_LEN {
            return Err(MirageError::WireProtocol("message too short".to_string()));
        }
        Ok(Self {
            message_length: u32::from_le_bytes(buffer[0..4].try_into().expect("4 bytes")),
            request_id: u32::from_le_bytes(buffer[4..8].try_into().expect("4 bytes")),
            response_to: u32::from_le_bytes(buffer[8..12].try_into().expect("4 bytes")),
            op_code: u32::from_le_bytes(buffer[12..16].try_into().expect("4 bytes")),
        })
    }
}

#[derive(Debug, Clone)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// Read one framed message. `Ok(None)` is a clean EOF between messages.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<WireMessage>> {
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MirageError::Network(e)),
    }

    let header = MessageHeader::parse(&header_buf)?;
    let total = header.message_length as usize;
    if total < HEADER_LEN || total > MAX_MESSAGE_SIZE {
        return Err(MirageError::WireProtocol(format!(
            "invalid message length: {}",
            total
        )));
    }

    let mut payload = vec![0u8; total - HEADER_LEN];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(MirageError::Network)?;

    Ok(Some(WireMessage { header, payload }))
}

/// A parsed OP_MSG command: the body document with any kind-1 document
/// sequences folded back in under their identifier keys.
pub fn parse_op_msg(payload: &[u8]) -> Result<Document> {
    if payload.len() < 5 {
        return Err(MirageError::WireProtocol(
            "OP_MSG payload too short".to_string(),
        ));
    }
    let flags = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
    let mut end = payload.len();
    if flags & FLAG_CHECKSUM_PRESENT != 0 {
        if end < 4 + 4 {
            return Err(MirageError::WireProtocol(
                "OP_MSG checksum flag without checksum".to_string(),
            ));
        }
        end -= 4;
    }

    let mut body: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Bson>)> = Vec::new();
    let mut offset = 4;
    while offset < end {
        let kind = payload[offset];
        offset += 1;
        match kind {
            0 => {
                let (doc, len) = read_bson_document(&payload[offset..end])?;
                offset += len;
                if body.is_some() {
                    return Err(MirageError::WireProtocol(
                        "OP_MSG has more than one body section".to_string(),
                    ));
                }
                body = Some(doc);
            }
            1 => {
                if offset + 4 > end {
                    return Err(MirageError::WireProtocol(
                        "OP_MSG sequence section truncated".to_string(),
                    ));
                }
                let section_len = u32::from_le_bytes(
                    payload[offset..offset + 4].try_into().expect("4 bytes"),
                ) as usize;
                let section_end = offset + section_len;
                if section_len < 5 || section_end > end {
                    return Err(MirageError::WireProtocol(
                        "OP_MSG sequence section overruns message".to_string(),
                    ));
                }
                let mut cursor = offset + 4;
                let identifier_end = payload[cursor..section_end]
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| {
                        MirageError::WireProtocol(
                            "OP_MSG sequence identifier not terminated".to_string(),
                        )
                    })?;
                let identifier =
                    String::from_utf8_lossy(&payload[cursor..cursor + identifier_end]).to_string();
                cursor += identifier_end + 1;

                let mut documents = Vec::new();
                while cursor < section_end {
                    let (doc, len) = read_bson_document(&payload[cursor..section_end])?;
                    cursor += len;
                    documents.push(Bson::Document(doc));
                }
                sequences.push((identifier, documents));
                offset = section_end;
            }
            other => {
                return Err(MirageError::WireProtocol(format!(
                    "unknown OP_MSG section kind: {}",
                    other
                )))
            }
        }
    }

    let mut command = body.ok_or_else(|| {
        MirageError::WireProtocol("OP_MSG has no body section".to_string())
    })?;
    for (identifier, documents) in sequences {
        command.insert(identifier, Bson::Array(documents));
    }
    Ok(command)
}

/// Legacy OP_QUERY: flags, full collection name, skip/return, query doc.
pub fn parse_op_query(payload: &[u8]) -> Result<(String, Document)> {
    if payload.len() < 12 {
        return Err(MirageError::WireProtocol(
            "OP_QUERY payload too short".to_string(),
        ));
    }
    let mut offset = 4;
    let name_end = payload[offset..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| {
            MirageError::WireProtocol("OP_QUERY collection name not terminated".to_string())
        })?;
    let collection = String::from_utf8_lossy(&payload[offset..offset + name_end]).to_string();
    offset += name_end + 1;

    // numberToSkip + numberToReturn
    offset += 8;
    if offset >= payload.len() {
        return Err(MirageError::WireProtocol(
            "OP_QUERY has no query document".to_string(),
        ));
    }
    let (query, _) = read_bson_document(&payload[offset..])?;
    Ok((collection, query))
}

fn read_bson_document(buffer: &[u8]) -> Result<(Document, usize)> {
    if buffer.len() < 5 {
        return Err(MirageError::WireProtocol(
            "BSON document truncated".to_string(),
        ));
    }
    let len = u32::from_le_bytes(buffer[0..4].try_into().expect("4 bytes")) as usize;
    if len < 5 || len > buffer.len() {
        return Err(MirageError::WireProtocol(format!(
            "invalid BSON document length: {}",
            len
        )));
    }
    let doc = bson::from_slice::<Document>(&buffer[..len])
        .map_err(|e| MirageError::WireProtocol(format!("failed to parse BSON: {}", e)))?;
    Ok((doc, len))
}

/// Encode an OP_MSG response with a single body section.
pub fn encode_op_msg(request_id: u32, response_to: u32, body: &Document) -> Result<Vec<u8>> {
    let body_bytes = bson::to_vec(body)?;
    let message_length = HEADER_LEN + 4 + 1 + body_bytes.len();

    let mut buffer = BytesMut::with_capacity(message_length);
    buffer.put_u32_le(message_length as u32);
    buffer.put_u32_le(request_id);
    buffer.put_u32_le(response_to);
    buffer.put_u32_le(OpCode::Msg as u32);
    buffer.put_u32_le(0); // flags
    buffer.put_u8(0); // section kind: body
    buffer.put_slice(&body_bytes);
    Ok(buffer.to_vec())
}

/// Encode a legacy OP_REPLY carrying one document (handshake traffic).
pub fn encode_op_reply(request_id: u32, response_to: u32, body: &Document) -> Result<Vec<u8>> {
    let body_bytes = bson::to_vec(body)?;
    let message_length = HEADER_LEN + 20 + body_bytes.len();

    let mut buffer = BytesMut::with_capacity(message_length);
    buffer.put_u32_le(message_length as u32);
    buffer.put_u32_le(request_id);
    buffer.put_u32_le(response_to);
    buffer.put_u32_le(OpCode::Reply as u32);
    buffer.put_u32_le(0); // response flags
    buffer.put_u64_le(0); // cursor id
    buffer.put_u32_le(0); // starting from
    buffer.put_u32_le(1); // number returned
    buffer.put_slice(&body_bytes);
    Ok(buffer.to_vec())
}
