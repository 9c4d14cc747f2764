//! File transfers between the local machine and a terminal.
//!
//! A download runs the readiness gate, creates an instance, marks it in use,
//! streams the data and deletes the instance. An upload skips the gate and
//! the marking. Either way the instance is deleted exactly once.

pub mod instance;
pub mod stream;

use std::path::{Path, PathBuf};

use tracing::instrument;

use crate::context::OpContext;
use crate::device::DevicePaths;
use crate::device::paths::file_name;
use crate::error::{Error, ResourceKind, Result};
use crate::remote;
use crate::transport::CipTransport;

pub use instance::{Direction, InstanceState, TransferDescriptor, TransferInstance, check_ready};
pub use stream::{read_stream, write_stream};

/// One file moved by a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub overwrite_requested: bool,
    overwrite_required: bool,
    pub size: u64,
}

impl FileRecord {
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        overwrite_requested: bool,
    ) -> Self {
        let remote_path = remote_path.into();
        Self {
            name: file_name(&remote_path).to_string(),
            local_path: local_path.into(),
            remote_path,
            overwrite_requested,
            overwrite_required: false,
            size: 0,
        }
    }

    /// True only when a conflicting destination exists and overwrite was
    /// requested.
    pub fn overwrite_required(&self) -> bool {
        self.overwrite_required
    }

    /// Records whether the destination already exists.
    pub fn resolve_conflict(&mut self, destination_exists: bool) -> Result<()> {
        if destination_exists && !self.overwrite_requested {
            return Err(Error::AlreadyExists {
                path: self.remote_path.clone(),
            });
        }
        self.overwrite_required = destination_exists && self.overwrite_requested;
        Ok(())
    }
}

/// Chunk size for the transport's communication path.
pub fn negotiated_chunk_size<T: CipTransport + ?Sized>(ctx: &OpContext<'_, T>) -> Result<u16> {
    Ok(ctx.transport.path().chunk_size()?)
}

/// Streams `data` into a new remote file.
#[instrument(skip(ctx, data), fields(len = data.len()))]
pub fn download_bytes<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    data: &[u8],
    remote_path: &str,
    overwrite: bool,
) -> Result<()> {
    let file_size = u32::try_from(data.len()).map_err(|_| Error::SizeMismatch {
        file: remote_path.to_string(),
        declared: u32::MAX as u64,
        actual: data.len() as u64,
    })?;
    let chunk_size = negotiated_chunk_size(ctx)?;
    check_ready(ctx)?;

    let description = format!("Downloading {}", file_name(remote_path));
    let mut instance = TransferInstance::new(ctx);
    let result = (|| -> Result<_> {
        instance.create_download(remote_path, file_size, overwrite, chunk_size)?;
        instance.mark_in_use()?;
        let descriptor = instance.begin_streaming()?;
        write_stream(instance.ctx(), &descriptor, data, &description)
    })();
    instance.finish(result)?;
    ctx.report
        .info(format!("Downloaded {} bytes to {}", data.len(), remote_path));
    Ok(())
}

/// Reads a whole remote file.
///
/// Fails before creating any instance when the file does not exist.
#[instrument(skip(ctx, paths))]
pub fn upload_bytes<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &DevicePaths,
    remote_path: &str,
) -> Result<Vec<u8>> {
    if !remote::file_exists(ctx, &paths.helper_dll, remote_path)? {
        ctx.report.error(format!("{} does not exist", remote_path));
        return Err(Error::not_found(ResourceKind::RemoteFile, remote_path));
    }
    let chunk_size = negotiated_chunk_size(ctx)?;

    let description = format!("Uploading {}", file_name(remote_path));
    let mut instance = TransferInstance::new(ctx);
    let result = (|| -> Result<_> {
        instance.create_upload(remote_path, chunk_size)?;
        let descriptor = instance.begin_streaming()?;
        read_stream(instance.ctx(), &descriptor, &description)
    })();
    let data = instance.finish(result)?;
    ctx.report
        .info(format!("Uploaded {} bytes from {}", data.len(), remote_path));
    Ok(data)
}

/// Downloads a local file to `remote_path`.
pub fn download_file<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &DevicePaths,
    local_path: &Path,
    remote_path: &str,
    overwrite: bool,
) -> Result<FileRecord> {
    let mut record = FileRecord::new(local_path, remote_path, overwrite);
    let data = read_local(local_path)?;
    record.size = data.len() as u64;
    let exists = remote::file_exists(ctx, &paths.helper_dll, remote_path)?;
    record.resolve_conflict(exists).inspect_err(|e| ctx.report.error(e.to_string()))?;
    if record.overwrite_required() {
        ctx.report.info(format!("Overwriting {}", remote_path));
    }
    download_bytes(ctx, &data, remote_path, record.overwrite_required())?;
    Ok(record)
}

/// Uploads `remote_path` into a local file.
pub fn upload_file<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &DevicePaths,
    remote_path: &str,
    local_path: &Path,
    overwrite: bool,
) -> Result<FileRecord> {
    let mut record = FileRecord::new(local_path, remote_path, overwrite);
    record
        .resolve_conflict(local_path.exists())
        .map_err(|_| Error::AlreadyExists {
            path: local_path.display().to_string(),
        })?;
    let data = upload_bytes(ctx, paths, remote_path)?;
    std::fs::write(local_path, &data)?;
    record.size = data.len() as u64;
    Ok(record)
}

pub(crate) fn read_local(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::not_found(ResourceKind::LocalFile, path.display().to_string()),
        _ => Error::Io(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_log::DeviceLog;
    use crate::events::{FnObserver, HmiEvent, NullObserver};
    use crate::protocol::*;
    use crate::transport::{MockFault, MockTransport};
    use std::sync::Mutex;

    const REMOTE: &str = "\\Application Data\\Rockwell Software\\RSViewME\\Runtime\\App.mer";

    fn paths() -> DevicePaths {
        DevicePaths::for_major(11)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_sizes() {
        let chunk = 1984usize;
        for len in [0, 1, chunk - 1, chunk, chunk + 1, 3 * 1024 * 1024 + 17] {
            let mut mock = MockTransport::new();
            mock.open().unwrap();
            let mut log = DeviceLog::new();
            let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
            let data = pattern(len);

            download_bytes(&mut ctx, &data, REMOTE, false).unwrap();
            let back = upload_bytes(&mut ctx, &paths(), REMOTE).unwrap();
            assert_eq!(back.len(), len);
            assert!(back == data, "round trip of {} bytes", len);
            drop(ctx);
            assert_eq!(mock.open_transfers(), 0);
        }
    }

    #[test]
    fn test_5000_bytes_chunking() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        download_bytes(&mut ctx, &pattern(5000), REMOTE, false).unwrap();
        drop(ctx);

        let logged = mock.requests_for(CLASS_FILE_EXCHANGE, SVC_WRITE_CHUNK);
        let parsed: Vec<(u32, usize)> = logged
            .iter()
            .map(|r| {
                let w = WriteChunkRequest::from_bytes(&r.data).unwrap();
                (w.chunk_number, w.data.len())
            })
            .collect();
        assert_eq!(parsed, vec![(1, 1984), (2, 1984), (3, 1032), (0, 2)]);
        assert!(WriteChunkRequest::from_bytes(&logged[3].data).unwrap().is_end_of_file());
    }

    #[test]
    fn test_empty_download_still_sends_sentinel() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        download_bytes(&mut ctx, &[], REMOTE, false).unwrap();
        drop(ctx);
        let logged = mock.requests_for(CLASS_FILE_EXCHANGE, SVC_WRITE_CHUNK);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].data, vec![0, 0, 0, 0, 2, 0, 0xFF, 0xFF]);
        assert_eq!(mock.file(REMOTE), Some(Vec::new()));
    }

    #[test]
    fn test_cleanup_once_when_mark_in_use_fails() {
        let mut mock = MockTransport::new().with_fault(MockFault::status(
            CLASS_FILE_EXCHANGE,
            SVC_SET_ATTRIBUTE_SINGLE,
            1,
        ));
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = download_bytes(&mut ctx, &pattern(10), REMOTE, false).unwrap_err();
        drop(ctx);

        assert!(matches!(err, Error::Transfer { .. }));
        assert!(matches!(err.root(), Error::Transport(_)));
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_DELETE).len(), 1);
        assert_eq!(mock.open_transfers(), 0);
    }

    #[test]
    fn test_cleanup_once_when_streaming_fails() {
        let mut mock = MockTransport::new().with_fault(MockFault::status(
            CLASS_FILE_EXCHANGE,
            SVC_WRITE_CHUNK,
            2,
        ));
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = download_bytes(&mut ctx, &pattern(5000), REMOTE, false).unwrap_err();
        drop(ctx);

        let Error::Transfer { instance, .. } = err else {
            panic!("expected transfer error, got {err:?}");
        };
        let deletes = mock.requests_for(CLASS_FILE_EXCHANGE, SVC_DELETE);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].instance, instance);
        assert!(mock.file(REMOTE).is_none());
    }

    #[test]
    fn test_bad_chunk_echo_is_fatal() {
        let mut mock = MockTransport::new().with_fault(MockFault::WriteEchoOffset(1));
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = download_bytes(&mut ctx, &pattern(100), REMOTE, false).unwrap_err();
        drop(ctx);
        assert!(matches!(err.root(), Error::Protocol(ProtocolError::FieldMismatch { .. })));
        // no retry of the rejected chunk
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_WRITE_CHUNK).len(), 1);
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_DELETE).len(), 1);
    }

    #[test]
    fn test_chunk_size_echo_mismatch_deletes_instance_once() {
        let mut mock = MockTransport::new().with_fault(MockFault::ChunkSizeEcho(512));
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = download_bytes(&mut ctx, &pattern(100), REMOTE, false).unwrap_err();
        drop(ctx);

        assert!(matches!(err, Error::Transfer { .. }));
        assert!(matches!(
            err.root(),
            Error::Protocol(ProtocolError::ChunkSizeMismatch {
                requested: 1984,
                actual: 512
            })
        ));
        assert!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_WRITE_CHUNK).is_empty());
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_DELETE).len(), 1);
        assert_eq!(mock.open_transfers(), 0);
        assert!(mock.file(REMOTE).is_none());
    }

    #[test]
    fn test_upload_bad_read_echo_deletes_instance_once() {
        let mut mock = MockTransport::new()
            .with_file(REMOTE, pattern(5000))
            .with_fault(MockFault::ReadEchoOffset(1));
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = upload_bytes(&mut ctx, &paths(), REMOTE).unwrap_err();
        drop(ctx);

        assert!(matches!(err, Error::Transfer { .. }));
        assert!(matches!(
            err.root(),
            Error::Protocol(ProtocolError::FieldMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));
        // no retry of the rejected chunk
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_READ_CHUNK).len(), 1);
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_DELETE).len(), 1);
        assert_eq!(mock.open_transfers(), 0);
    }

    #[test]
    fn test_upload_large_declared_size_reserves_bounded_buffer() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        download_bytes(&mut ctx, &pattern(10), REMOTE, false).unwrap();
        let mut instance = TransferInstance::new(&mut ctx);
        let mut descriptor = instance.create_upload(REMOTE, 1984).unwrap();
        // a corrupt reply could claim up to 4 GiB
        descriptor.total_bytes = u32::MAX;
        let data = read_stream(instance.ctx(), &descriptor, "Uploading").unwrap();
        instance.finish(Ok(())).unwrap();
        assert_eq!(data, pattern(10));
        assert!(data.capacity() <= stream::MAX_INITIAL_CAPACITY);
    }

    #[test]
    fn test_stale_transfer_aborts_without_second_create() {
        let mut mock = MockTransport::new().with_stale_msg_instance(1);
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = download_bytes(&mut ctx, &pattern(10), REMOTE, false).unwrap_err();
        drop(ctx);
        assert!(err.is_stale_transfer());
        assert_eq!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_CREATE).len(), 1);
    }

    #[test]
    fn test_upload_missing_file_creates_nothing() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = upload_bytes(&mut ctx, &paths(), "\\nope.mer").unwrap_err();
        drop(ctx);
        assert!(err.is_not_found());
        assert!(mock.requests_for(CLASS_FILE_EXCHANGE, SVC_CREATE).is_empty());
    }

    #[test]
    fn test_routed_path_negotiates_smaller_chunks() {
        let mut mock = MockTransport::new().with_path("192.168.1.20,1,0,2,10.10.10.5".parse().unwrap());
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        download_bytes(&mut ctx, &pattern(1000), REMOTE, false).unwrap();
        drop(ctx);

        let create = &mock.requests_for(CLASS_FILE_EXCHANGE, SVC_CREATE)[0];
        let request = CreateDownloadRequest::from_bytes(&create.data).unwrap();
        assert_eq!(request.chunk_size, 466 - 2 - 3 - 12);
    }

    #[test]
    fn test_progress_reports_bytes() {
        let events = Mutex::new(Vec::new());
        let observer = FnObserver(|e: &HmiEvent| {
            if let HmiEvent::Progress { total, current, unit, .. } = e {
                assert_eq!(*unit, "bytes");
                events.lock().unwrap().push((*total, *current));
            }
        });
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &observer, &mut log);
        download_bytes(&mut ctx, &pattern(5000), REMOTE, false).unwrap();
        drop(ctx);
        assert_eq!(
            *events.lock().unwrap(),
            vec![(5000, 1984), (5000, 3968), (5000, 5000)]
        );
    }

    #[test]
    fn test_download_file_overwrite_rules() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("App.mer");
        std::fs::write(&local, b"new contents").unwrap();

        let mut mock = MockTransport::new();
        mock.open().unwrap();
        mock.add_file(REMOTE, b"old".to_vec());
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);

        let err = download_file(&mut ctx, &paths(), &local, REMOTE, false).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));

        let record = download_file(&mut ctx, &paths(), &local, REMOTE, true).unwrap();
        assert!(record.overwrite_required());
        assert_eq!(record.name, "App.mer");
        assert_eq!(record.size, 12);
        drop(ctx);
        assert_eq!(mock.file(REMOTE).unwrap(), b"new contents".to_vec());

        let fresh = FileRecord::new(&local, "\\new.mer", true);
        assert!(!fresh.overwrite_required());
    }

    #[test]
    fn test_download_missing_local_file() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let err = download_file(&mut ctx, &paths(), Path::new("/no/such/App.mer"), REMOTE, false)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                kind: ResourceKind::LocalFile,
                ..
            }
        ));
    }

    #[test]
    fn test_upload_file_writes_local() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("out.mer");
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        mock.add_file(REMOTE, pattern(4000));
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);

        let record = upload_file(&mut ctx, &paths(), REMOTE, &local, false).unwrap();
        assert_eq!(record.size, 4000);
        assert_eq!(std::fs::read(&local).unwrap(), pattern(4000));
        assert!(upload_file(&mut ctx, &paths(), REMOTE, &local, false).is_err());
    }
}
