//! Contains the [Serde] compatible implementation using the Protobuf wire
//! format and Proto3 JSON mapping, through the [protobuf] crate.

use std::marker::PhantomData;

use protobuf::{Message, MessageFull};

use crate::serde::Serde;

/// Implements [Serde] by encoding/decoding `T` as binary Protobuf through the
/// [Message] trait.
#[derive(Debug, Clone, Copy)]
pub struct ProtobufSerde<T>(PhantomData<T>)
where
    T: Message;

impl<T> Default for ProtobufSerde<T>
where
    T: Message,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serde<T> for ProtobufSerde<T>
where
    T: Message,
{
    type Error = protobuf::Error;

    fn serialize(&self, value: T) -> Vec<u8> {
        value
            .write_to_bytes()
            .expect("serialization from rust type to protobuf format should be successful")
    }

    fn deserialize(&self, data: Vec<u8>) -> Result<T, Self::Error> {
        T::parse_from_bytes(&data)
    }
}

/// Implements [Serde] by encoding/decoding `T` as Proto3 JSON mapping through
/// [protobuf_json_mapping].
#[derive(Debug, Clone, Copy)]
pub struct ProtoJsonSerde<T>(PhantomData<T>)
where
    T: MessageFull;

impl<T> Default for ProtoJsonSerde<T>
where
    T: MessageFull,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

/// Errors surfaced by [ProtoJsonSerde::deserialize].
#[derive(Debug, thiserror::Error)]
pub enum ProtoJsonDeserializeError {
    /// The input bytes were not valid UTF-8.
    #[error("failed to convert input data from bytes to utf-8 string: {0}")]
    Utf8Conversion(#[source] std::str::Utf8Error),
    /// The input string was not a valid Proto3 JSON mapping of `T`.
    #[error("failed to parse protobuf message from input string: {0}")]
    ProtobufParse(#[source] protobuf_json_mapping::ParseError),
}

impl<T> Serde<T> for ProtoJsonSerde<T>
where
    T: MessageFull,
{
    type Error = ProtoJsonDeserializeError;

    fn serialize(&self, value: T) -> Vec<u8> {
        protobuf_json_mapping::print_to_string(&value)
            .expect("serialization from rust type to protojson should be successful")
            .into_bytes()
    }

    fn deserialize(&self, data: Vec<u8>) -> Result<T, Self::Error> {
        let json = std::str::from_utf8(&data).map_err(ProtoJsonDeserializeError::Utf8Conversion)?;

        protobuf_json_mapping::parse_from_str(json).map_err(ProtoJsonDeserializeError::ProtobufParse)
    }
}
