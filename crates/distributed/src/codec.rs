//! Wire encoding of [`QueryMessage`] for transports that leave the process.
//!
//! Frame layout:
//! - 4 bytes magic `TSQM`
//! - u32 LE format version
//! - u32 LE header length
//! - JSON header
//! - Arrow IPC stream with the page rows (empty when the message has none)

use std::io::Cursor;

use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tsq_common::{RequestId, Result, TopologyVersion, TsqError};

use crate::messages::{
    CancelRequest, FailResponse, NextPageRequest, NextPageResponse, QueryMessage, QueryRequest,
};

const FRAME_MAGIC: &[u8; 4] = b"TSQM";
const FRAME_VERSION: u32 = 1;
const FRAME_HEADER_LEN: usize = 12;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WireHeader {
    Request(QueryRequest),
    NextPageRequest(NextPageRequest),
    NextPageResponse(PageHeader),
    Fail(FailResponse),
    Cancel(CancelRequest),
}

#[derive(Debug, Serialize, Deserialize)]
struct PageHeader {
    request_id: RequestId,
    query: usize,
    page: u32,
    all_rows: Option<u64>,
    last: bool,
    retry: Option<TopologyVersion>,
}

pub fn encode_message(msg: &QueryMessage) -> Result<Vec<u8>> {
    let (header, payload) = match msg {
        QueryMessage::Request(req) => (WireHeader::Request(wire_request(req)?), Vec::new()),
        QueryMessage::NextPageRequest(req) => (WireHeader::NextPageRequest(*req), Vec::new()),
        QueryMessage::NextPageResponse(resp) => {
            let payload = match &resp.rows {
                Some(batch) => encode_record_batches_ipc(std::slice::from_ref(batch))?,
                None => Vec::new(),
            };
            (
                WireHeader::NextPageResponse(PageHeader {
                    request_id: resp.request_id,
                    query: resp.query,
                    page: resp.page,
                    all_rows: resp.all_rows,
                    last: resp.last,
                    retry: resp.retry,
                }),
                payload,
            )
        }
        QueryMessage::Fail(fail) => (WireHeader::Fail(fail.clone()), Vec::new()),
        QueryMessage::Cancel(cancel) => (WireHeader::Cancel(*cancel), Vec::new()),
    };

    let header = serde_json::to_vec(&header)
        .map_err(|e| TsqError::Codec(format!("header encode failed: {e}")))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| TsqError::Codec("header exceeds u32 length".to_string()))?;

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + header.len() + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_message(bytes: &[u8]) -> Result<QueryMessage> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(TsqError::Codec("frame is too small to contain header".to_string()));
    }
    if &bytes[0..4] != FRAME_MAGIC {
        return Err(TsqError::Codec("invalid frame magic".to_string()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FRAME_VERSION {
        return Err(TsqError::Codec(format!("unsupported frame version {version}")));
    }
    let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if bytes.len() < FRAME_HEADER_LEN + len {
        return Err(TsqError::Codec("frame header length is invalid".to_string()));
    }
    let header: WireHeader =
        serde_json::from_slice(&bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])
            .map_err(|e| TsqError::Codec(format!("header decode failed: {e}")))?;
    let payload = &bytes[FRAME_HEADER_LEN + len..];

    Ok(match header {
        WireHeader::Request(mut req) => {
            for q in &mut req.queries {
                q.unmarshal_params()?;
            }
            QueryMessage::Request(req)
        }
        WireHeader::NextPageRequest(req) => QueryMessage::NextPageRequest(req),
        WireHeader::NextPageResponse(h) => {
            let rows = if payload.is_empty() {
                None
            } else {
                let mut batches = decode_ipc_bytes(payload)?;
                if batches.len() != 1 {
                    return Err(TsqError::Codec(format!(
                        "page must carry exactly one batch, got {}",
                        batches.len()
                    )));
                }
                batches.pop()
            };
            QueryMessage::NextPageResponse(NextPageResponse {
                request_id: h.request_id,
                query: h.query,
                page: h.page,
                all_rows: h.all_rows,
                rows,
                last: h.last,
                retry: h.retry,
            })
        }
        WireHeader::Fail(fail) => QueryMessage::Fail(fail),
        WireHeader::Cancel(cancel) => QueryMessage::Cancel(cancel),
    })
}

// Remote participants only ever see marshalled parameters.
fn wire_request(req: &QueryRequest) -> Result<QueryRequest> {
    if let Some(parts) = &req.partitions {
        if parts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TsqError::Codec(format!(
                "request {} partitions must be strictly ascending",
                req.request_id
            )));
        }
    }
    let mut wire = req.clone();
    for q in &mut wire.queries {
        if !q.is_marshalled() {
            return Err(TsqError::Codec(format!(
                "request {} carries unmarshalled parameters",
                req.request_id
            )));
        }
        q.params.clear();
    }
    Ok(wire)
}

/// Encode record batches as Arrow IPC stream bytes.
pub fn encode_record_batches_ipc(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    if batches.is_empty() {
        return Ok(Vec::new());
    }
    let schema = batches[0].schema();
    let mut out = Vec::<u8>::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| TsqError::Codec(format!("ipc writer init failed: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| TsqError::Codec(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| TsqError::Codec(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

fn decode_ipc_bytes(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let cur = Cursor::new(bytes.to_vec());
    let reader = arrow::ipc::reader::StreamReader::try_new(cur, None)
        .map_err(|e| TsqError::Codec(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| TsqError::Codec(format!("ipc read failed: {e}")))
}
