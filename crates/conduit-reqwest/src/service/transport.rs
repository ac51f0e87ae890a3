//! Streaming `openOutputSlot` against remote peers.

use std::io;

use async_trait::async_trait;
use conduit_core::{ChunkStream, OpenOutputSlotRequest, SlotFrameCodec, SlotRef, SlotUri};
use conduit_slots::{SlotTransport, chunks_from_frames};
use futures::{StreamExt, TryStreamExt};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::connect::{PeerEndpoint, ReqwestClient, TRACING_TARGET, send_leased};

#[async_trait]
impl SlotTransport for ReqwestClient {
    async fn open_output(&self, uri: &SlotUri, offset: u64) -> conduit_core::Result<ChunkStream> {
        let endpoint = PeerEndpoint::for_slot(uri)?;
        let lease = self.peers().acquire(endpoint.authority())?;
        let url = endpoint.url("slots/open")?;
        let request = OpenOutputSlotRequest {
            slot: SlotRef::from(uri),
            offset,
        };

        tracing::debug!(
            target: TRACING_TARGET,
            uri = %uri,
            offset,
            peer = %endpoint.authority(),
            "Opening remote output slot"
        );

        let response = send_leased(&lease, |client| client.post(url).json(&request)).await?;
        let body = response.bytes_stream().map_err(io::Error::other);
        let mut framed = FramedRead::new(StreamReader::new(body), SlotFrameCodec::new());

        let source = uri.to_string();
        let frames = async_stream::stream! {
            // The lease keeps the peer connection alive while the body streams.
            let _lease = lease;
            while let Some(frame) = framed.next().await {
                yield frame.map_err(|e| {
                    conduit_core::Error::transient(format!("broken frame stream: {e}"))
                        .with_source(e)
                });
            }
        };

        Ok(chunks_from_frames(frames, source))
    }
}
