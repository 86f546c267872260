//! Tar copy protocol.
//!
//! A file is moved to the remote unit by running `tar -xf -` there and
//! streaming a single-entry archive into its standard input. The archive
//! writer runs as a background task so the remote unarchiver and the local
//! encoder make progress together through the shared pipe.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use shell_escape::unix::escape;
use tar::{EntryType, Header};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::debug;

use crate::command::Copyable;
use crate::exec::{ExecResponse, TransportError};

/// Permission bits applied to every copied file.
pub const COPY_MODE: u32 = 0o644;

const BLOCK_SIZE: u64 = 512;
const END_OF_ARCHIVE: [u8; 1024] = [0; 1024];

/// Builds the remote command that unpacks the archive into the parent
/// directory of `destination`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidDestination`] when `destination` has no
/// file name.
pub fn unarchive_command(destination: &Utf8Path) -> Result<String, TransportError> {
    file_name(destination)?;
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .map_or(".", Utf8Path::as_str);
    Ok(format!("tar -xf - -C {}", escape(parent.into())))
}

fn file_name(destination: &Utf8Path) -> Result<&str, TransportError> {
    destination
        .file_name()
        .ok_or_else(|| TransportError::InvalidDestination {
            path: destination.to_path_buf(),
            message: String::from("destination must name a file"),
        })
}

/// Writes `source` into `writer` as a single-entry ustar archive.
///
/// The source is rewound first and exactly `source.size()` bytes are copied.
/// When the source fails or runs short, the function returns before the
/// end-of-archive marker is written so the remote side observes a truncated
/// archive.
///
/// # Errors
///
/// Returns the I/O error from the source, the header encoder, or the writer.
pub async fn write_archive<W>(
    writer: &mut W,
    source: &mut dyn Copyable,
    name: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let size = source.size();
    source.rewind().await?;

    let header = entry_header(name, size)?;
    writer.write_all(header.as_bytes()).await?;

    let mut limited = (&mut *source).take(size);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {copied} of {size} bytes"),
        ));
    }

    let padding = size.next_multiple_of(BLOCK_SIZE).saturating_sub(size);
    if let Some(zeros) = END_OF_ARCHIVE.get(..usize::try_from(padding).unwrap_or_default()) {
        writer.write_all(zeros).await?;
    }
    writer.write_all(&END_OF_ARCHIVE).await?;
    writer.flush().await?;
    writer.shutdown().await
}

fn entry_header(name: &str, size: u64) -> io::Result<Header> {
    let mut header = Header::new_ustar();
    header.set_path(name)?;
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(COPY_MODE);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs()),
    );
    header.set_cksum();
    Ok(header)
}

/// Copies `source` to `destination` using an exec that reads stdin.
///
/// `exec` receives the unarchive command and must return the response of an
/// exec whose standard input is fed by the returned writer. The final error
/// joins the archive writer failure, any remote stderr text, and the exec
/// error, so none of them hides the others.
pub(crate) async fn copy_with<F>(
    source: Box<dyn Copyable>,
    destination: &Utf8Path,
    exec: F,
) -> Result<(), TransportError>
where
    F: FnOnce(&str) -> (ExecResponse, Option<DuplexStream>),
{
    let name = file_name(destination)?.to_owned();
    let command = unarchive_command(destination)?;
    let (response, stdin) = exec(&command);

    let writer = stdin.map(|pipe| tokio::spawn(encode(source, pipe, name)));
    let output = response.wait_for_results().await;

    let writer_result = match writer {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(join) => Err(io::Error::other(join.to_string())),
        },
        None => Ok(()),
    };

    let path = destination.to_path_buf();
    let mut errors = Vec::new();
    if let Err(err) = writer_result {
        errors.push(TransportError::Archive {
            path: path.clone(),
            source: err,
        });
    }
    if !output.stderr.trim().is_empty() {
        errors.push(TransportError::RemoteStderr {
            path: path.clone(),
            stderr: output.stderr,
        });
    }
    errors.extend(output.result.err());

    match TransportError::join(errors) {
        Some(err) => Err(err),
        None => {
            debug!(destination = %path, "copy complete");
            Ok(())
        }
    }
}

async fn encode(
    mut source: Box<dyn Copyable>,
    mut stdin: DuplexStream,
    name: String,
) -> io::Result<()> {
    write_archive(&mut stdin, source.as_mut(), &name).await
}
