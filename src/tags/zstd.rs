//! zstd compression tag.
//!
//! Settings: `zstd.level` (integer, default 3).

use std::io::{self, Read};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use super::{Tag, TagSettings, TAG_ZSTD};
use crate::error::{GofastError, Result};

/// Registration name.
pub(super) const NAME: &str = "zstd";

/// Compression id reported in the flag word.
pub const COMPRESSION_ZSTD: u8 = 3;

/// Default compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// zstd payload compression.
#[derive(Debug, Clone, Copy)]
pub struct ZstdTag {
    level: i32,
}

impl ZstdTag {
    /// Create with an explicit level.
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Factory for [`TagRegistry`](super::TagRegistry).
    pub fn factory(settings: &TagSettings) -> Result<Arc<dyn Tag>> {
        let level = match settings.get("zstd.level") {
            None => DEFAULT_LEVEL,
            Some(value) => value
                .as_i64()
                .and_then(|l| i32::try_from(l).ok())
                .filter(|l| zstd::compression_level_range().contains(l))
                .ok_or_else(|| GofastError::Config(format!("invalid zstd.level: {value}")))?,
        };
        Ok(Arc::new(Self::new(level)))
    }

    fn failed(err: io::Error) -> GofastError {
        GofastError::Tag {
            tag: NAME,
            reason: err.to_string(),
        }
    }
}

impl Tag for ZstdTag {
    fn id(&self) -> u64 {
        TAG_ZSTD
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn compression(&self) -> u8 {
        COMPRESSION_ZSTD
    }

    fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<usize> {
        if input.is_empty() {
            return Ok(0);
        }
        let start = out.len();
        let writer = (&mut *out).writer();
        zstd::stream::copy_encode(input, writer, self.level).map_err(Self::failed)?;
        Ok(out.len() - start)
    }

    fn decode(&self, input: &[u8], out: &mut BytesMut, limit: usize) -> Result<usize> {
        if input.is_empty() {
            return Ok(0);
        }
        let start = out.len();
        let decoder = zstd::stream::read::Decoder::new(input).map_err(Self::failed)?;
        // One byte past the limit is enough to tell an oversized frame.
        let mut bounded = decoder.take((limit as u64).saturating_add(1));
        let mut writer = (&mut *out).writer();
        io::copy(&mut bounded, &mut writer).map_err(Self::failed)?;

        let n = out.len() - start;
        if n > limit {
            out.truncate(start);
            return Err(GofastError::Tag {
                tag: NAME,
                reason: format!("decoded payload exceeds {limit} bytes"),
            });
        }
        Ok(n)
    }
}
