//! gRPC codec for the relay send path.
//!
//! Outbound messages are pre-encoded frames produced by
//! [`super::wire::WireImage`]; the encoder copies them into the transport
//! buffer untouched instead of running prost over a message struct.
//! Responses are ordinary protobuf and decode with prost.

use bytes::{BufMut, Bytes};
use prost::Message;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

use crate::proto::NewPodResponse;

#[derive(Debug, Default, Clone)]
pub struct RawFrameCodec;

impl Codec for RawFrameCodec {
    type Encode = Bytes;
    type Decode = NewPodResponse;
    type Encoder = RawFrameEncoder;
    type Decoder = PodResponseDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawFrameEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        PodResponseDecoder
    }
}

#[derive(Debug)]
pub struct RawFrameEncoder;

impl Encoder for RawFrameEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

#[derive(Debug)]
pub struct PodResponseDecoder;

impl Decoder for PodResponseDecoder {
    type Item = NewPodResponse;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let response = NewPodResponse::decode(src)
            .map_err(|err| Status::internal(format!("failed to decode relay response: {err}")))?;
        Ok(Some(response))
    }
}
