//! Pre-encoded pod frames for the relay path.
//!
//! A relayed pod travels as a `NewPodRequest` whose first 5 bytes are a
//! fixed-layout `request_id` field (tag byte 0x0d, then the id as a
//! little-endian u32) followed by the length-delimited pod payload. The
//! prefix is written with an explicit writer so a frame can be re-stamped
//! with a fresh id (once per destination) without touching the payload,
//! and a frame received from upstream can be forwarded by re-slicing its
//! payload bytes. The pod itself is encoded exactly once, at ingestion.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use crate::error::Result;
use crate::proto::PodSpec;

/// Length of the request-id prefix: 1 tag byte + 4 id bytes.
pub const REQUEST_ID_PREFIX_LEN: usize = 5;

/// Field 1, wire type fixed32.
const REQUEST_ID_TAG: u8 = 0x0d;

/// Field 2, wire type length-delimited.
const POD_FIELD_TAG: u8 = 0x12;

/// An encoded pod ready for fan-out, minus the per-send request id.
#[derive(Debug, Clone)]
pub struct WireImage {
    /// Everything after the request-id prefix: the pod field of the frame.
    payload: Bytes,
    pub pod_name: String,
    pub namespace: String,
}

impl WireImage {
    /// Encode a locally-ingested pod.
    pub fn from_pod(pod: &PodSpec) -> Self {
        let encoded = pod.encode_to_vec();
        Self {
            payload: pod_field(&encoded),
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
        }
    }

    /// Wrap the already-encoded pod bytes of a received frame, so relaying
    /// onward never re-marshals the pod.
    pub fn from_encoded(pod_bytes: Bytes, pod: &PodSpec) -> Self {
        Self {
            payload: pod_field(&pod_bytes),
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }

    /// Produce the full frame for one send, stamped with `request_id`.
    pub fn frame(&self, request_id: u32) -> Bytes {
        let mut frame = BytesMut::with_capacity(REQUEST_ID_PREFIX_LEN + self.payload.len());
        frame.put_u8(REQUEST_ID_TAG);
        frame.put_u32_le(request_id);
        frame.extend_from_slice(&self.payload);
        frame.freeze()
    }
}

fn pod_field(pod_bytes: &[u8]) -> Bytes {
    let mut field =
        BytesMut::with_capacity(1 + prost::encoding::encoded_len_varint(pod_bytes.len() as u64) + pod_bytes.len());
    field.put_u8(POD_FIELD_TAG);
    prost::encoding::encode_varint(pod_bytes.len() as u64, &mut field);
    field.extend_from_slice(pod_bytes);
    field.freeze()
}

/// Decode a frame back into its parts. The receive side uses the prost
/// message directly; this helper exists for diagnostics and tests.
pub fn decode_frame(frame: Bytes) -> Result<(u32, PodSpec)> {
    let request = crate::proto::NewPodRequest::decode(frame)?;
    let pod = PodSpec::decode(request.pod)?;
    Ok((request.request_id, pod))
}
