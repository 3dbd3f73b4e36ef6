use std::marker::PhantomData;

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;

use crate::kafka::types::RawRecord;

/// Turns a raw record payload into the value a pipeline carries.
pub trait PayloadDecoder<T>: Send + Sync {
    fn decode(&self, record: &RawRecord) -> anyhow::Result<T>;
}

/// Decodes JSON payloads with serde. Tombstones (no payload) are rejected.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> PayloadDecoder<T> for JsonDecoder<T> {
    fn decode(&self, record: &RawRecord) -> anyhow::Result<T> {
        let payload = record
            .payload
            .as_deref()
            .ok_or_else(|| anyhow!("record has no payload"))?;
        serde_json::from_slice(payload).with_context(|| {
            format!(
                "failed to decode JSON payload at {}:{}",
                record.partition, record.offset
            )
        })
    }
}

/// Passes the payload through as text. A tombstone decodes to an empty string.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8Decoder;

impl PayloadDecoder<String> for Utf8Decoder {
    fn decode(&self, record: &RawRecord) -> anyhow::Result<String> {
        let payload = record.payload.clone().unwrap_or_default();
        String::from_utf8(payload).with_context(|| {
            format!(
                "payload at {}:{} is not valid UTF-8",
                record.partition, record.offset
            )
        })
    }
}
