//! Argument slots carrying one literal string.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use conduit_core::{ChunkStream, Error, Result};
use futures::StreamExt;

use crate::lock;

#[derive(Default)]
struct ArgValue {
    buffer: BytesMut,
    consumed: bool,
}

/// A literal value that can be consumed exactly once.
#[derive(Default)]
pub struct ArgSlot {
    value: Mutex<ArgValue>,
}

impl ArgSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, data: &[u8]) -> Result<()> {
        let mut value = lock(&self.value);
        if value.consumed {
            return Err(Error::invalid_state("argument was already consumed"));
        }
        value.buffer.extend_from_slice(data);
        Ok(())
    }

    fn consume(&self) -> Option<Bytes> {
        let mut value = lock(&self.value);
        if value.consumed {
            return None;
        }
        value.consumed = true;
        Some(value.buffer.split().freeze())
    }

    pub(crate) fn read(&self, offset: u64) -> Result<ChunkStream> {
        let value = self
            .consume()
            .ok_or_else(|| Error::invalid_state("argument was already consumed"))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(value.len());
        let rest = value.slice(start..);

        let chunks: Vec<Result<Bytes>> = if rest.is_empty() { vec![] } else { vec![Ok(rest)] };
        Ok(futures::stream::iter(chunks).boxed())
    }

    pub(crate) fn take_value(&self) -> Option<String> {
        self.consume()
            .map(|value| String::from_utf8_lossy(&value).into_owned())
    }
}
