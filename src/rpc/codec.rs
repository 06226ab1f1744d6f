//! Serde-driven message codec for tonic.
//!
//! Messages are bincode-encoded; tonic still owns gRPC framing, compression
//! flags and length prefixes.

use std::marker::PhantomData;

use bincode::Options;
use bytes::{Buf, BufMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Codec encoding `E` and decoding `D`.
///
/// Clients use `BincodeCodec<Request, Response>`, servers the reverse.
pub struct BincodeCodec<E, D>(PhantomData<fn(E) -> D>);

impl<E, D> Default for BincodeCodec<E, D> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<E, D> Codec for BincodeCodec<E, D>
where
    E: Serialize + Send + 'static,
    D: DeserializeOwned + Send + 'static,
{
    type Encode = E;
    type Decode = D;
    type Encoder = BincodeEncoder<E>;
    type Decoder = BincodeDecoder<D>;

    fn encoder(&mut self) -> Self::Encoder {
        BincodeEncoder(PhantomData)
    }

    fn decoder(&mut self) -> Self::Decoder {
        BincodeDecoder(PhantomData)
    }
}

pub struct BincodeEncoder<T>(PhantomData<fn(T)>);

impl<T: Serialize> Encoder for BincodeEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        bincode::serialize_into(dst.writer(), &item)
            .map_err(|e| Status::internal(format!("failed to encode message: {}", e)))
    }
}

pub struct BincodeDecoder<T>(PhantomData<fn() -> T>);

impl<T: DeserializeOwned> Decoder for BincodeDecoder<T> {
    type Item = T;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        // DecodeBuf holds exactly one framed message, possibly zero bytes long.
        let frame = src.copy_to_bytes(src.remaining());
        decode_frame(&frame).map(Some)
    }
}

/// Decode one message, never reading past the end of `frame`.
///
/// Length prefixes are checked against the frame size before anything is
/// allocated, so a peer cannot claim more memory than it actually sent.
fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, Status> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(frame.len() as u64)
        .deserialize(frame)
        .map_err(|e| Status::invalid_argument(format!("failed to decode message: {}", e)))
}
