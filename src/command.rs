//! Value types accepted by transports: runnable commands and copy sources.

use std::io;
use std::io::Cursor;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use camino::Utf8Path;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// Anything that renders to a single shell string at invocation time.
///
/// Transports never inspect the structure of a command; they hand the
/// rendered string to the remote shell unchanged.
pub trait Command: Send + Sync {
    /// Renders the command to the string passed to the remote shell.
    fn render(&self) -> String;
}

impl Command for &str {
    fn render(&self) -> String {
        (*self).to_owned()
    }
}

impl Command for String {
    fn render(&self) -> String {
        self.clone()
    }
}

/// Raised when a command argument cannot be rendered safely.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error(
    "command arguments must not contain control characters (ASCII 0x00-0x1F or 0x7F, \
     e.g. newline, carriage return, tab, NUL)"
)]
pub struct InvalidArgument {
    /// Offending argument as supplied by the caller.
    pub argument: String,
}

/// Argument vector rendered with POSIX shell quoting.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShellCommand {
    args: Vec<String>,
}

impl ShellCommand {
    /// Builds a command from an argument vector, rejecting arguments that
    /// carry control characters.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidArgument`] for the first argument containing an ASCII
    /// control character.
    pub fn new<I, S>(args: I) -> Result<Self, InvalidArgument>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let collected = args.into_iter().map(Into::into).collect::<Vec<String>>();
        if let Some(bad) = collected.iter().find(|arg| has_control_characters(arg)) {
            return Err(InvalidArgument {
                argument: bad.clone(),
            });
        }
        Ok(Self { args: collected })
    }

    /// Returns the unescaped arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Command for ShellCommand {
    fn render(&self) -> String {
        self.args
            .iter()
            .map(|arg| escape(arg.as_str().into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn has_control_characters(arg: &str) -> bool {
    arg.chars()
        .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
}

/// A sized, seekable byte source consumed by the copy protocol.
///
/// The size must be exact: it is written into the archive header before any
/// content is streamed, and the remote unarchiver relies on it.
pub trait Copyable: AsyncRead + AsyncSeek + Send + Unpin {
    /// Number of bytes the source will yield from the start.
    fn size(&self) -> u64;
}

/// A local file opened for copying.
#[derive(Debug)]
pub struct CopyableFile {
    file: File,
    size: u64,
}

impl CopyableFile {
    /// Opens `path` and records its current length.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the file cannot be opened or its
    /// metadata cannot be read.
    pub async fn open(path: &Utf8Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file, size })
    }
}

impl AsyncRead for CopyableFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl AsyncSeek for CopyableFile {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.file).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.file).poll_complete(cx)
    }
}

impl Copyable for CopyableFile {
    fn size(&self) -> u64 {
        self.size
    }
}

/// An in-memory buffer exposed as a copy source.
#[derive(Clone, Debug)]
pub struct CopyableBytes {
    inner: Cursor<Vec<u8>>,
}

impl CopyableBytes {
    /// Wraps `bytes` as a copy source.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Cursor::new(bytes.into()),
        }
    }
}

impl AsyncRead for CopyableBytes {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for CopyableBytes {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

impl Copyable for CopyableBytes {
    fn size(&self) -> u64 {
        u64::try_from(self.inner.get_ref().len()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    #[rstest]
    fn shell_command_escapes_arguments() {
        let command = ShellCommand::new(["echo", "a b", "c'd"]).expect("valid arguments");
        assert_eq!(command.render(), "echo 'a b' 'c'\\''d'");
    }

    #[rstest]
    #[case("echo\tbad")]
    #[case("line\nbreak")]
    #[case("nul\u{0000}")]
    #[case("del\u{007F}")]
    fn shell_command_rejects_control_characters(#[case] argument: &str) {
        let err = ShellCommand::new(["echo", argument]).expect_err("should reject");
        assert_eq!(err.argument, argument);
        assert!(err.to_string().contains("control characters"));
    }

    #[rstest]
    fn plain_strings_render_verbatim() {
        let raw = "for i in 1 2; do echo $i; done";
        assert_eq!(raw.render(), raw);
        assert_eq!(String::from(raw).render(), raw);
    }

    #[tokio::test]
    async fn copyable_bytes_reports_size_and_content() {
        let mut source = CopyableBytes::new(b"payload".to_vec());
        assert_eq!(source.size(), 7);
        let mut read = String::new();
        source.read_to_string(&mut read).await.expect("read bytes");
        assert_eq!(read, "payload");
    }

    #[tokio::test]
    async fn copyable_file_reads_size_from_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "hello file").expect("write fixture");
        let utf8 = camino::Utf8PathBuf::from_path_buf(path).expect("utf8 path");

        let source = CopyableFile::open(&utf8).await.expect("open file");
        assert_eq!(source.size(), 10);
    }
}
