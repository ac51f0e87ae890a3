#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
mod frame;
mod operation;
mod progress;
mod relay;
mod request;
mod slot;
mod uri;

pub use error::{BoxedError, Error, ErrorKind, Result};
pub use frame::{DEFAULT_MAX_FRAME_LEN, SlotFrame, SlotFrameCodec};
pub use operation::{Operation, OperationError};
pub use progress::SlotProgress;
pub use relay::{CommandResult, DataFrame, RelayReply, RelayRequest, SlotCommand};
pub use request::{
    ConnectSlotRequest, CreateSlotRequest, OpenOutputSlotRequest, SlotRef, SlotStatusList,
};
pub use slot::{
    CHANNEL_BINDING_PREFIX, LOCAL_SCHEME, SNAPSHOT_BINDING_PREFIX, SNAPSHOT_SCHEME, SlotDirection,
    SlotInstance, SlotMedia, SlotSpec, SlotState, SlotStatus, normalize_binding, snapshot_binding,
};
pub use uri::{PEER_SCHEME, RELAY_SCHEME, SESSION_QUERY, STORAGE_SCHEMES, SlotUri, UriKind};

/// Default size of a streamed chunk in bytes.
pub const CHUNK_SIZE: usize = 4096;

/// Lazy, finite sequence of byte chunks read from a slot or storage object.
pub type ChunkStream = futures::stream::BoxStream<'static, Result<bytes::Bytes>>;
