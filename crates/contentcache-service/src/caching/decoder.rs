use bytes::Bytes;

use crate::types::LoadOptions;

use super::CacheKey;

/// Turns cached or fetched bytes into a usable value.
///
/// This is the only place that knows about the format of the content. Implementations run on the
/// blocking thread pool and may be slow.
pub trait Decoder<T>: Send + Sync + 'static {
    /// Decodes `payload`, or returns `None` if it is not valid content.
    fn decode(&self, payload: &Bytes, key: &CacheKey, options: &LoadOptions) -> Option<T>;

    /// Encodes a value that was stored without its bytes, so it can be written to disk.
    ///
    /// The default cannot encode anything, and such values are only kept in memory.
    fn encode(&self, _value: &T) -> Option<Bytes> {
        None
    }

    /// The cost of keeping `value` in the memory tier.
    fn cost(&self, value: &T) -> u64 {
        std::mem::size_of_val(value) as u64
    }
}

/// Serves the raw bytes as the decoded value.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl Decoder<Bytes> for BytesDecoder {
    fn decode(&self, payload: &Bytes, _key: &CacheKey, _options: &LoadOptions) -> Option<Bytes> {
        Some(payload.clone())
    }

    fn encode(&self, value: &Bytes) -> Option<Bytes> {
        Some(value.clone())
    }

    fn cost(&self, value: &Bytes) -> u64 {
        value.len() as u64
    }
}

impl<T, F> Decoder<T> for F
where
    F: Fn(&Bytes, &CacheKey, &LoadOptions) -> Option<T> + Send + Sync + 'static,
{
    fn decode(&self, payload: &Bytes, key: &CacheKey, options: &LoadOptions) -> Option<T> {
        self(payload, key, options)
    }
}
