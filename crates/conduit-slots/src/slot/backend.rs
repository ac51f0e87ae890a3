//! Slot backends and the factory selecting them.

use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use conduit_core::{
    ChunkStream, Error, LOCAL_SCHEME, Result, SNAPSHOT_SCHEME, SlotDirection, SlotMedia,
    SlotSpec, SlotState,
};

use super::arg::ArgSlot;
use super::file::{FileInput, FileOutput, LocalFileOutput};
use super::pipe::{PipeInput, PipeOutput};
use super::snapshot::{SnapshotInput, SnapshotOutput, parse_snapshot_name};
use crate::snapshooter::SnapshotStore;

/// Names of output pipes that are emitted line by line.
const LINE_PIPES: &[&str] = &["/dev/stdout", "/dev/stderr", "stdout", "stderr"];

/// Resources shared by all backends created by one registry.
#[derive(Debug, Clone)]
pub struct BackendContext {
    tmp_dir: PathBuf,
    snapshots: Option<SnapshotStore>,
}

impl BackendContext {
    /// Creates a context spooling files under `tmp_dir`.
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            snapshots: None,
        }
    }

    /// Enables snapshot slots.
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Returns the snapshot store, if snapshot slots are enabled.
    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    /// Returns the spool file of a slot: `<tmp>/<taskId>/<slotName>`.
    fn spool_path(&self, task_id: &str, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if task_id.is_empty() || task_id.contains('/') || escapes || name.is_empty() {
            return Err(Error::invalid_input(format!(
                "slot '{name}' of task '{task_id}' does not map to a spool file"
            )));
        }
        Ok(self.tmp_dir.join(task_id).join(relative))
    }

    fn require_snapshots(&self, name: &str) -> Result<SnapshotStore> {
        self.snapshots.clone().ok_or_else(|| {
            Error::invalid_input(format!(
                "slot '{name}' needs snapshot storage, which is not configured"
            ))
        })
    }
}

/// Backend of a slot, selected by media, direction and name scheme.
pub enum SlotBackend {
    /// Received bytes are written to a spool file.
    FileInput(FileInput),
    /// The producer writes a spool file served to readers once closed.
    FileOutput(FileOutput),
    /// An existing local file named by a `local://` slot name.
    LocalFileOutput(LocalFileOutput),
    /// Received bytes are forwarded to a process.
    PipeInput(PipeInput),
    /// A sequential stream, line-buffered for stdout and stderr.
    PipeOutput(PipeOutput),
    /// A literal argument consumed once.
    Arg(ArgSlot),
    /// Received bytes are uploaded to a snapshot on destroy.
    SnapshotInput(SnapshotInput),
    /// Serves a snapshot object.
    SnapshotOutput(SnapshotOutput),
}

impl SlotBackend {
    /// Creates the backend of `spec` for `task_id`.
    pub fn create(task_id: &str, spec: &SlotSpec, ctx: &BackendContext) -> Result<Self> {
        use SlotDirection::{Input, Output};

        let backend = match (spec.media, spec.direction, spec.name_scheme()) {
            (SlotMedia::File, Output, Some(LOCAL_SCHEME)) => {
                let path = PathBuf::from(spec.name_path());
                if !path.is_absolute() {
                    return Err(Error::invalid_input(format!(
                        "local slot '{}' must name an absolute path",
                        spec.name
                    )));
                }
                Self::LocalFileOutput(LocalFileOutput::new(path))
            }
            (_, direction, Some(SNAPSHOT_SCHEME)) => {
                let store = ctx.require_snapshots(&spec.name)?;
                let (snapshot_id, slot_path) = parse_snapshot_name(spec.name_path())?;
                match direction {
                    Input => {
                        let spool = ctx.spool_path(task_id, spec.name_path())?;
                        let input = SnapshotInput::new(store, snapshot_id, slot_path, spool);
                        Self::SnapshotInput(input)
                    }
                    Output => {
                        Self::SnapshotOutput(SnapshotOutput::new(store, snapshot_id, slot_path))
                    }
                }
            }
            (_, _, Some(scheme)) => {
                return Err(Error::invalid_input(format!(
                    "unsupported scheme '{scheme}' in slot name '{}'",
                    spec.name
                )));
            }
            (SlotMedia::File, Input, None) => {
                Self::FileInput(FileInput::new(ctx.spool_path(task_id, &spec.name)?))
            }
            (SlotMedia::File, Output, None) => {
                Self::FileOutput(FileOutput::new(ctx.spool_path(task_id, &spec.name)?))
            }
            (SlotMedia::Pipe, Input, None) => Self::PipeInput(PipeInput::new()),
            (SlotMedia::Pipe, Output, None) => {
                Self::PipeOutput(PipeOutput::new(LINE_PIPES.contains(&spec.name.as_str())))
            }
            (SlotMedia::Arg, _, None) => Self::Arg(ArgSlot::new()),
        };

        Ok(backend)
    }

    /// Returns the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileInput(_) => "file_input",
            Self::FileOutput(_) => "file_output",
            Self::LocalFileOutput(_) => "local_file_output",
            Self::PipeInput(_) => "pipe_input",
            Self::PipeOutput(p) if p.is_line_mode() => "line_output",
            Self::PipeOutput(_) => "pipe_output",
            Self::Arg(_) => "arg",
            Self::SnapshotInput(_) => "snapshot_input",
            Self::SnapshotOutput(_) => "snapshot_output",
        }
    }

    /// Returns the snapshot entry written by a snapshot input.
    pub fn snapshot_entry(&self) -> Option<(&str, &str)> {
        match self {
            Self::SnapshotInput(s) => Some((s.snapshot_id(), s.slot_path())),
            _ => None,
        }
    }

    pub(crate) fn local_path(&self) -> Option<&Path> {
        match self {
            Self::FileInput(f) => Some(f.path()),
            Self::FileOutput(f) => Some(f.path()),
            Self::LocalFileOutput(f) => Some(f.path()),
            Self::SnapshotInput(s) => Some(s.path()),
            _ => None,
        }
    }

    /// State of a freshly created slot; complete sources are open immediately.
    pub(crate) fn initial_state(&self) -> SlotState {
        match self {
            Self::LocalFileOutput(_) | Self::SnapshotOutput(_) => SlotState::Open,
            _ => SlotState::Unbound,
        }
    }

    /// State reached once the producer starts writing.
    pub(crate) fn producing_state(&self) -> SlotState {
        match self {
            Self::PipeOutput(_) => SlotState::Open,
            _ => SlotState::Preparing,
        }
    }

    pub(crate) async fn write(&self, data: Bytes) -> Result<()> {
        match self {
            Self::FileOutput(f) => f.write(data).await,
            Self::PipeOutput(p) => p.write(data).await,
            Self::Arg(a) => a.append(&data),
            _ => Err(Error::invalid_state(format!(
                "{} slots do not accept producer writes",
                self.kind()
            ))),
        }
    }

    pub(crate) async fn close_writer(&self) -> Result<()> {
        match self {
            Self::FileOutput(f) => f.close().await,
            Self::PipeOutput(p) => {
                p.close();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub(crate) async fn read(&self, offset: u64) -> Result<ChunkStream> {
        match self {
            Self::FileOutput(f) => f.read(offset).await,
            Self::LocalFileOutput(f) => f.read(offset).await,
            Self::PipeOutput(p) => p.read(offset),
            Self::Arg(a) => a.read(offset),
            Self::SnapshotOutput(s) => s.read(offset).await,
            _ => Err(Error::invalid_state(format!(
                "{} slots cannot be read",
                self.kind()
            ))),
        }
    }

    pub(crate) async fn accept(&self, data: Bytes) -> Result<()> {
        match self {
            Self::FileInput(f) => f.accept(data).await,
            Self::PipeInput(p) => p.accept(data).await,
            Self::Arg(a) => a.append(&data),
            Self::SnapshotInput(s) => s.accept(data).await,
            _ => Err(Error::invalid_state(format!(
                "{} slots cannot be connected",
                self.kind()
            ))),
        }
    }

    pub(crate) async fn finish_input(&self) -> Result<()> {
        match self {
            Self::FileInput(f) => f.finish().await,
            Self::PipeInput(p) => p.finish().await,
            Self::SnapshotInput(s) => s.finish().await,
            _ => Ok(()),
        }
    }

    /// Flushes buffered producer or consumer state when the slot is suspended.
    pub(crate) async fn flush(&self) -> Result<()> {
        match self {
            Self::FileInput(f) => f.finish().await,
            Self::FileOutput(f) => f.close().await,
            Self::PipeInput(p) => p.finish().await,
            Self::PipeOutput(p) => {
                p.close();
                Ok(())
            }
            Self::SnapshotInput(s) => s.finish().await,
            _ => Ok(()),
        }
    }

    pub(crate) async fn release(&self) -> Result<()> {
        match self {
            Self::FileInput(f) => f.release().await,
            Self::FileOutput(f) => f.release().await,
            Self::PipeInput(p) => p.finish().await,
            Self::PipeOutput(p) => {
                p.release();
                Ok(())
            }
            Self::SnapshotInput(s) => s.release().await,
            Self::LocalFileOutput(_) | Self::Arg(_) | Self::SnapshotOutput(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(spec: SlotSpec) -> Result<&'static str> {
        let ctx = BackendContext::new("/tmp/conduit-test");
        SlotBackend::create("t1", &spec, &ctx).map(|b| b.kind())
    }

    #[test]
    fn factory_selects_by_media_direction_and_scheme() -> Result<()> {
        use SlotDirection::{Input, Output};

        assert_eq!(kind_of(SlotSpec::new("/in", SlotMedia::File, Input))?, "file_input");
        assert_eq!(kind_of(SlotSpec::new("/out", SlotMedia::File, Output))?, "file_output");
        assert_eq!(
            kind_of(SlotSpec::new("local:///data/in.csv", SlotMedia::File, Output))?,
            "local_file_output"
        );
        assert_eq!(kind_of(SlotSpec::new("/dev/stdin", SlotMedia::Pipe, Input))?, "pipe_input");
        assert_eq!(kind_of(SlotSpec::new("/dev/stdout", SlotMedia::Pipe, Output))?, "line_output");
        assert_eq!(kind_of(SlotSpec::new("/fifo", SlotMedia::Pipe, Output))?, "pipe_output");
        assert_eq!(kind_of(SlotSpec::new("/arg", SlotMedia::Arg, Input))?, "arg");
        Ok(())
    }

    #[test]
    fn factory_rejects_bad_names() {
        use SlotDirection::{Input, Output};

        // snapshot slots without configured storage
        assert!(kind_of(SlotSpec::new("snapshot://s1/out", SlotMedia::File, Output)).is_err());
        assert!(kind_of(SlotSpec::new("ftp://host/out", SlotMedia::File, Input)).is_err());
        assert!(kind_of(SlotSpec::new("/../../etc/passwd", SlotMedia::File, Input)).is_err());
        assert!(kind_of(SlotSpec::new("local://relative", SlotMedia::File, Output)).is_err());
    }

    #[test]
    fn local_sources_start_open() -> Result<()> {
        let ctx = BackendContext::new("/tmp/conduit-test");
        let spec = SlotSpec::new("local:///data/in.csv", SlotMedia::File, SlotDirection::Output);
        let backend = SlotBackend::create("t1", &spec, &ctx)?;
        assert_eq!(backend.initial_state(), SlotState::Open);
        assert_eq!(backend.local_path(), Some(Path::new("/data/in.csv")));
        Ok(())
    }
}
