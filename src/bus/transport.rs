//! Cross-platform transport for the private bus
//!
//! Abstracts Unix domain sockets (Unix/macOS) and named pipes (Windows)
//! using the interprocess crate.

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::protocol::Envelope;
use crate::common::paths;

/// Maximum message size (10 MB)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

// Platform-specific imports and type aliases
#[cfg(unix)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericFilePath, ListenerOptions};
}

#[cfg(windows)]
pub mod platform {
    pub use interprocess::local_socket::tokio::{prelude::*, Listener, Stream};
    pub use interprocess::local_socket::{GenericNamespaced, ListenerOptions};
}

use platform::*;

pub use platform::{Listener, Stream};

/// Create the listener of a private bus at `address`
pub fn create_listener(address: &str) -> io::Result<Listener> {
    paths::ensure_runtime_dir()?;
    paths::remove_bus_socket(address)?;

    #[cfg(unix)]
    let listener = {
        let name = address.to_fs_name::<GenericFilePath>()?;
        ListenerOptions::new().name(name).create_tokio()?
    };

    #[cfg(windows)]
    let listener = {
        let name = address.to_ns_name::<GenericNamespaced>()?;
        ListenerOptions::new().name(name).create_tokio()?
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(address, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Connect to the private bus at `address`
pub async fn connect(address: &str) -> io::Result<Stream> {
    #[cfg(unix)]
    let stream = {
        let name = address.to_fs_name::<GenericFilePath>()?;
        Stream::connect(name).await?
    };

    #[cfg(windows)]
    let stream = {
        let name = address.to_ns_name::<GenericNamespaced>()?;
        Stream::connect(name).await?
    };

    Ok(stream)
}

/// Send a length-prefixed message
pub async fn send_message<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Message too large"));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed message
pub async fn recv_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

/// Send one envelope
pub async fn send_envelope<W: AsyncWriteExt + Unpin>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let data = envelope
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    send_message(writer, &data).await
}

/// Receive one envelope
///
/// Returns None on a clean end of stream.
pub async fn recv_envelope<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Option<Envelope>> {
    let data = match recv_message(reader).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    Envelope::decode(&data)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
