//! Terminal session - one object per terminal driving whole operations.
//!
//! Every operation starts a fresh device log, opens the transport, queries
//! and validates the terminal, runs, and closes the transport again. The
//! device log stays readable afterwards whether the operation succeeded or
//! not.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::context::OpContext;
use crate::device::{self, DeviceInfo};
use crate::device_log::{DeviceLog, Reporter};
use crate::error::Result;
use crate::events::{HmiEvent, Observer, Phase, TracingObserver};
use crate::firmware::{self, FirmwareSource, FlashOptions};
use crate::protocol::CommPath;
use crate::remote::{self, RebootOutcome};
use crate::transfer::{self, FileRecord};
use crate::transport::{self, CipTransport};

pub struct TerminalSession<T: CipTransport, O: Observer> {
    config: SessionConfig,
    transport: T,
    observer: Arc<O>,
    log: DeviceLog,
}

impl TerminalSession<Box<dyn CipTransport>, TracingObserver> {
    /// Session over the configured backend with the tracing observer.
    pub fn connect(config: SessionConfig, path: CommPath) -> Self {
        let transport = transport::connect(&config, path);
        Self::with_observer(config, transport, Arc::new(TracingObserver))
    }
}

impl<T: CipTransport, O: Observer + 'static> TerminalSession<T, O> {
    pub fn with_observer(config: SessionConfig, transport: T, observer: Arc<O>) -> Self {
        Self {
            config,
            transport,
            observer,
            log: DeviceLog::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Log of the last operation.
    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Identity, versions and paths of the terminal.
    pub fn info(&mut self) -> Result<DeviceInfo> {
        self.run("info", |_, info, _| Ok(info.clone()))
    }

    /// Downloads a local file into the terminal's runtime folder.
    #[instrument(skip(self))]
    pub fn download(&mut self, local: &Path, overwrite: bool) -> Result<FileRecord> {
        self.run("download", |ctx, info, _| {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let remote = info.paths.runtime_file(&name);
            transfer::download_file(ctx, &info.paths, local, &remote, overwrite)
        })
    }

    /// Uploads a file from the terminal's runtime folder.
    #[instrument(skip(self))]
    pub fn upload(&mut self, name: &str, destination: &Path, overwrite: bool) -> Result<FileRecord> {
        self.run("upload", |ctx, info, _| {
            let remote = info.paths.runtime_file(name);
            transfer::upload_file(ctx, &info.paths, &remote, destination, overwrite)
        })
    }

    /// Names of the files in the terminal's runtime folder.
    pub fn list_files(&mut self) -> Result<Vec<String>> {
        self.run("list", |ctx, info, _| {
            let files = remote::list_folder(ctx, &info.paths, &info.paths.runtime)?;
            ctx.report.info(format!("{} file(s) in {}", files.len(), info.paths.runtime));
            Ok(files)
        })
    }

    /// Reboots the terminal.
    ///
    /// A dropped connection is the expected answer. A normal reply is
    /// returned as `Acknowledged`; anything else is an error.
    pub fn reboot(&mut self) -> Result<RebootOutcome> {
        self.run("reboot", |ctx, info, _| {
            ctx.report.phase(Phase::Rebooting);
            match remote::reboot(ctx, &info.paths.helper_dll) {
                RebootOutcome::UnexpectedError(e) => Err(e),
                RebootOutcome::Acknowledged => {
                    ctx.report.warn("Reboot status: unconfirmed");
                    Ok(RebootOutcome::Acknowledged)
                }
                outcome => {
                    ctx.report.info(format!("Reboot status: {}", outcome.status()));
                    Ok(outcome)
                }
            }
        })
    }

    /// Flashes firmware.
    ///
    /// The package is opened and checked before the terminal is contacted.
    #[instrument(skip(self, source, options), fields(source = %source))]
    pub fn flash(&mut self, source: &FirmwareSource, options: &FlashOptions) -> Result<()> {
        self.log.begin("flash");
        let mut firmware = match source.prepare() {
            Ok(firmware) => firmware,
            Err(e) => {
                let mut report = Reporter::new(self.observer.as_ref(), &mut self.log);
                report.error(format!("Firmware package {}: {}", source, e));
                report.phase(Phase::Error);
                return Err(e);
            }
        };
        self.execute(|ctx, info, _| firmware::flash_firmware(ctx, info, &mut firmware, options))
    }

    fn run<R, F>(&mut self, operation: &str, body: F) -> Result<R>
    where
        F: FnOnce(&mut OpContext<'_, T>, &mut DeviceInfo, &SessionConfig) -> Result<R>,
    {
        self.log.begin(operation);
        self.execute(body)
    }

    fn execute<R, F>(&mut self, body: F) -> Result<R>
    where
        F: FnOnce(&mut OpContext<'_, T>, &mut DeviceInfo, &SessionConfig) -> Result<R>,
    {
        let config = &self.config;
        let mut ctx = OpContext::new(&mut self.transport, self.observer.as_ref(), &mut self.log);

        let result = (|| -> Result<R> {
            ctx.report.phase(Phase::Connecting);
            ctx.transport.open()?;
            ctx.report.emit(HmiEvent::Connected {
                path: ctx.transport.path().to_string(),
            });
            let mut info = device::query_device_info(&mut ctx)?;
            device::validate(&mut ctx, &info, &config.catalog, config.ignore_invalid)?;
            body(&mut ctx, &mut info, config)
        })();

        if let Err(e) = ctx.transport.close() {
            warn!(error = %e, "Closing the transport failed");
            ctx.report.warn(format!("Closing the connection failed: {}", e));
        }
        match &result {
            Ok(_) => {
                ctx.report.phase(Phase::Complete);
                ctx.report.emit(HmiEvent::Complete);
                info!(path = %ctx.transport.path(), "Operation complete");
            }
            Err(e) => {
                ctx.report.error(e.to_string());
                ctx.report.phase(Phase::Error);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Generation;
    use crate::error::Error;
    use crate::events::{FnObserver, NullObserver};
    use crate::firmware::dmk::CONTENTS_HEADER;
    use crate::transport::MockTransport;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    fn session(mock: &MockTransport) -> TerminalSession<MockTransport, NullObserver> {
        TerminalSession::with_observer(SessionConfig::default(), mock.clone(), Arc::new(NullObserver))
    }

    #[test]
    fn test_info_closes_transport() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        let info = session.info().unwrap();
        assert_eq!(info.generation(), Generation::Modern);
        assert_eq!(mock.open_count(), 1);
        assert_eq!(mock.close_count(), 1);
        assert_eq!(session.log().entries()[0], "Starting info");
    }

    #[test]
    fn test_download_upload_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("Line1.mer");
        std::fs::write(&local, vec![3u8; 4000]).unwrap();
        let mock = MockTransport::new();
        let mut session = session(&mock);

        let record = session.download(&local, false).unwrap();
        assert_eq!(record.size, 4000);
        assert!(matches!(
            session.download(&local, false),
            Err(Error::AlreadyExists { .. })
        ));
        assert!(session.log().entries().iter().any(|l| l.starts_with("ERROR")));
        session.download(&local, true).unwrap();

        assert_eq!(session.list_files().unwrap(), vec!["Line1.mer"]);

        let back = dir.path().join("copy.mer");
        session.upload("Line1.mer", &back, false).unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), vec![3u8; 4000]);
    }

    #[test]
    fn test_invalid_terminal_is_refused_unless_ignored() {
        let mock = MockTransport::new()
            .with_product_code(999)
            .with_file("\\Application Data\\Rockwell Software\\RSViewME\\Runtime\\A.mer", vec![1]);
        let mut session = session(&mock);
        assert!(matches!(session.list_files(), Err(Error::Validation(_))));
        assert!(mock.function_calls().iter().all(|(f, _)| f != "GetFolderContents"));

        let config = SessionConfig {
            ignore_invalid: true,
            ..Default::default()
        };
        let mut lenient = TerminalSession::with_observer(config, mock.clone(), Arc::new(NullObserver));
        assert_eq!(lenient.list_files().unwrap(), vec!["A.mer"]);
        assert!(lenient.log().entries().iter().any(|l| l.starts_with("WARN")));
    }

    #[test]
    fn test_reboot_expects_disconnect() {
        let mock = MockTransport::new();
        let mut session = session(&mock);
        assert!(session.reboot().unwrap().is_success());
        assert_eq!(mock.reboot_count(), 1);
    }

    #[test]
    fn test_acknowledged_reboot_is_logged_as_unconfirmed() {
        let mock = MockTransport::new().with_reboot_acknowledged();
        let mut session = session(&mock);
        let outcome = session.reboot().unwrap();
        assert!(!outcome.is_success());
        assert!(session
            .log()
            .entries()
            .iter()
            .any(|l| l.starts_with("WARN") && l.contains("Reboot status: unconfirmed")));
    }

    #[test]
    fn test_events_and_failure_log() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let observer = FnObserver(move |e: &HmiEvent| sink.lock().unwrap().push(e.clone()));
        let mock = MockTransport::new();
        let mut session = TerminalSession::with_observer(SessionConfig::default(), mock, Arc::new(observer));

        let err = session.upload("missing.mer", Path::new("/tmp/never-written.mer"), true);
        assert!(err.unwrap_err().is_not_found());
        assert!(session.log().entries().last().unwrap().starts_with("ERROR"));

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(HmiEvent::PhaseChanged { to: Phase::Connecting, .. })));
        assert!(events.iter().any(|e| matches!(e, HmiEvent::Connected { .. })));
        assert!(matches!(events.last(), Some(HmiEvent::PhaseChanged { to: Phase::Error, .. })));
        assert!(!events.iter().any(|e| matches!(e, HmiEvent::Complete)));
    }

    #[test]
    fn test_dmk_size_mismatch_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.dmk");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file(CONTENTS_HEADER, options).unwrap();
        writer
            .write_all(b"[ContentsHeader]\n[Catalog1]\nVendorID=1\nProductType=24\nProductCode=200\n")
            .unwrap();
        writer.start_file("fw.nvs", options).unwrap();
        writer
            .write_all(b"[Header]\nNumberOfUpdates=1\n[Update1]\nInstance=3\nFileSize=1000\nFileName=fw.bin\n")
            .unwrap();
        writer.start_file("fw.bin", options).unwrap();
        writer.write_all(&[0u8; 999]).unwrap();
        writer.finish().unwrap();

        let mock = MockTransport::new();
        let mut session = session(&mock);
        let err = session
            .flash(&FirmwareSource::Dmk(path), &FlashOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { .. }));
        assert_eq!(mock.open_count(), 0);
        assert!(mock.requests().is_empty());
        assert!(session.log().entries().iter().any(|l| l.contains("1000")));
    }

    #[test]
    fn test_dmk_flash_through_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("update.dmk");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file(CONTENTS_HEADER, options).unwrap();
        writer
            .write_all(b"[ContentsHeader]\n[Catalog1]\nVendorID=1\nProductType=24\nProductCode=200\n")
            .unwrap();
        writer.start_file("fw.nvs", options).unwrap();
        writer
            .write_all(b"[Header]\nNumberOfUpdates=1\n[Update1]\nInstance=3\nFileSize=600\nFileName=fw.bin\nResetDevice=yes\n")
            .unwrap();
        writer.start_file("fw.bin", options).unwrap();
        writer.write_all(&[0xA5u8; 600]).unwrap();
        writer.finish().unwrap();

        let mock = MockTransport::new().with_file("\\Windows\\FUWhelper.dll", b"MZ".to_vec());
        let mut session = session(&mock);
        let options = FlashOptions {
            flash_timeout: Duration::from_secs(300),
            ..FlashOptions::default()
        };
        session.flash(&FirmwareSource::Dmk(path), &options).unwrap();

        assert_eq!(mock.flashed().len(), 1);
        assert_eq!(mock.flashed()[0].data, vec![0xA5u8; 600]);
        assert_eq!(mock.reset_count(), 1);
        assert_eq!(mock.timeout_history().last(), Some(&Duration::from_secs(10)));
        assert_eq!(session.log().entries()[0], "Starting flash");
    }
}
