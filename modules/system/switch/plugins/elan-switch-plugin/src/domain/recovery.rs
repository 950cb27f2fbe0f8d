//! Recovery file handling for [`LibraryState`].
//!
//! The state is written to a scratch file in the target directory and renamed
//! over the recovery file, so a crash mid-write leaves the previous copy
//! intact. Reads and writes loop on `Interrupted`.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;

use tracing::{error, info, warn};

use super::error::LibStateError;
use super::libstate::LibraryState;
use crate::config::ContextRange;

const READ_CHUNK: usize = 1024;

/// How `restore` obtained its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Decoded from the recovery file.
    Recovered { outstanding: usize },
    /// No recovery file; started clean.
    Missing,
    /// The file was unusable and was ignored; started clean.
    Discarded(String),
}

/// Write `state` to `dir/file_name`.
///
/// # Errors
///
/// `Io` naming the path that failed, or `Encode`.
pub fn save(state: &LibraryState, dir: &Path, file_name: &str) -> Result<(), LibStateError> {
    let blob = state.encode()?;
    let path = dir.join(file_name);

    let mut scratch = tempfile::Builder::new()
        .prefix(".qsw_state")
        .tempfile_in(dir)
        .map_err(|e| LibStateError::io(dir, e))?;
    write_fully(scratch.as_file_mut(), &blob).map_err(|e| LibStateError::io(scratch.path(), e))?;
    scratch
        .as_file()
        .sync_all()
        .map_err(|e| LibStateError::io(scratch.path(), e))?;
    scratch
        .persist(&path)
        .map_err(|e| LibStateError::io(&path, e.error))?;

    info!(
        path = %path.display(),
        bytes = blob.len(),
        outstanding = state.outstanding_count(),
        "saved switch state"
    );
    Ok(())
}

/// Load state from `dir/file_name`.
///
/// A missing or undecodable file yields fresh state; stale allocation data is
/// worse than none.
///
/// # Errors
///
/// `Io` when the file exists but cannot be read.
pub fn restore(
    dir: &Path,
    file_name: &str,
    contexts: ContextRange,
) -> Result<(LibraryState, RestoreOutcome), LibStateError> {
    let path = dir.join(file_name);
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "no switch state file, starting with clean state");
            return Ok((LibraryState::fresh(contexts), RestoreOutcome::Missing));
        }
        Err(e) => return Err(LibStateError::io(&path, e)),
    };

    let data = read_fully(&mut file).map_err(|e| LibStateError::io(&path, e))?;
    match LibraryState::decode(&data, contexts) {
        Ok(state) => {
            let outstanding = state.outstanding_count();
            info!(path = %path.display(), outstanding, "recovered switch state");
            Ok((state, RestoreOutcome::Recovered { outstanding }))
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "discarding switch state file");
            Ok((
                LibraryState::fresh(contexts),
                RestoreOutcome::Discarded(e.to_string()),
            ))
        }
    }
}

/// Write all of `buf`, retrying interrupted writes.
///
/// # Errors
///
/// Any non-interrupt I/O error, or `WriteZero` if the writer stops accepting
/// data.
pub fn write_fully<W: Write + ?Sized>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "state file stopped accepting data",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

/// Read until end of input, retrying interrupted reads.
///
/// # Errors
///
/// Any non-interrupt I/O error.
pub fn read_fully<R: Read + ?Sized>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(data),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTEXTS: ContextRange = ContextRange {
        low: 0x20,
        high: 0x7ff,
    };

    /// Fails every other call with `Interrupted` and moves at most three
    /// bytes at a time.
    struct Flaky<T> {
        inner: T,
        interrupt: bool,
    }

    impl<T> Flaky<T> {
        fn new(inner: T) -> Self {
            Self {
                inner,
                interrupt: true,
            }
        }

        fn tick(&mut self) -> io::Result<()> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                Ok(())
            } else {
                Err(ErrorKind::Interrupted.into())
            }
        }
    }

    impl Write for Flaky<Vec<u8>> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tick()?;
            let n = buf.len().min(3);
            self.inner.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Flaky<&[u8]> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.tick()?;
            let n = buf.len().min(3);
            self.inner.read(&mut buf[..n])
        }
    }

    #[test]
    fn write_fully_survives_interrupts_and_short_writes() {
        let mut writer = Flaky::new(Vec::new());
        write_fully(&mut writer, b"recovery data").unwrap();
        assert_eq!(writer.inner, b"recovery data");
    }

    #[test]
    fn read_fully_survives_interrupts_and_short_reads() {
        let mut reader = Flaky::new(&b"recovery data"[..]);
        assert_eq!(read_fully(&mut reader).unwrap(), b"recovery data");
    }

    #[test]
    fn write_fully_reports_stalled_writer() {
        let mut full = [0u8; 4];
        let mut slice = &mut full[..];
        let err = write_fully(&mut slice, b"too long").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
    }

    #[test]
    fn save_then_restore_recovers_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LibraryState::fresh(CONTEXTS);
        state.allocate(4).unwrap();
        state.allocate(2).unwrap();

        save(&state, dir.path(), "qsw_state").unwrap();
        let (restored, outcome) = restore(dir.path(), "qsw_state", CONTEXTS).unwrap();
        assert_eq!(restored, state);
        assert_eq!(outcome, RestoreOutcome::Recovered { outstanding: 2 });
    }

    #[test]
    fn save_replaces_previous_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = LibraryState::fresh(CONTEXTS);
        save(&state, dir.path(), "qsw_state").unwrap();
        state.allocate(1).unwrap();
        save(&state, dir.path(), "qsw_state").unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, ["qsw_state"]);
        let (restored, _) = restore(dir.path(), "qsw_state", CONTEXTS).unwrap();
        assert_eq!(restored.outstanding_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        save(&LibraryState::fresh(CONTEXTS), dir.path(), "qsw_state").unwrap();
        let mode = std::fs::metadata(dir.path().join("qsw_state"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (state, outcome) = restore(dir.path(), "qsw_state", CONTEXTS).unwrap();
        assert_eq!(outcome, RestoreOutcome::Missing);
        assert_eq!(state.outstanding_count(), 0);
    }

    #[test]
    fn corrupt_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("qsw_state"), b"\x00\x00\x00\x05garbage").unwrap();
        let (state, outcome) = restore(dir.path(), "qsw_state", CONTEXTS).unwrap();
        assert!(matches!(outcome, RestoreOutcome::Discarded(_)));
        assert_eq!(state.outstanding_count(), 0);
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("gone");
        let err = save(&LibraryState::fresh(CONTEXTS), &gone, "qsw_state").unwrap_err();
        assert!(matches!(err, LibStateError::Io { .. }));
        assert!(err.to_string().contains("gone"), "{err}");
    }
}
