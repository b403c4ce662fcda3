//! Versioned handshake exchanged before the frame codec takes over the
//! connection (`spec.md` §6, §8 scenario 1).
//!
//! Both sides exchange a fixed ASCII banner `PJRMI_<major>.<minor>`
//! byte-for-byte; the client then sends its command string, PID, and
//! instance ID, and the server replies with either its name and a feature
//! flags byte or a short UTF-8 error message. Shaped after the teacher's
//! `protocol::parse_handshake`/`write_handshake_reply` pair, adapted from a
//! fixed-binary handshake to this protocol's banner-plus-fields form.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::EngineConfig;

/// Protocol major version this crate implements.
pub const PROTOCOL_MAJOR: u16 = 1;
/// Protocol minor version this crate implements. Bumps on wire-format
/// change.
pub const PROTOCOL_MINOR: u16 = 13;

/// Render the banner this version of the protocol expects, e.g.
/// `"PJRMI_1.13"`.
#[must_use]
pub fn banner() -> String { format!("PJRMI_{PROTOCOL_MAJOR}.{PROTOCOL_MINOR}") }

/// Errors that can occur while performing the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer's banner did not match ours byte-for-byte.
    #[error("banner mismatch: expected {expected:?}, got {actual:?}")]
    BannerMismatch {
        /// Our own banner.
        expected: String,
        /// The banner the peer sent.
        actual: String,
    },
    /// The client's command string was not valid UTF-16.
    #[error("invalid UTF-16 in client command string")]
    InvalidCommandString,
    /// Underlying I/O failure.
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Information the client sends immediately after the banner exchange
/// (`spec.md` §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientGreeting {
    /// Client-supplied command string (often empty).
    pub command: String,
    /// Client process ID.
    pub pid: u32,
    /// Client-assigned instance ID.
    pub instance_id: u64,
}

/// Read and verify the client's banner, sending ours first as the spec's
/// scenario 1 shows the server doing (`spec.md` §8 scenario 1: "client
/// sends `PJRMI_1.13`; server replies `PJRMI_1.13`").
///
/// # Errors
/// Returns [`HandshakeError::Io`] on any I/O failure, or
/// [`HandshakeError::BannerMismatch`] if the client's banner bytes differ
/// from ours; on mismatch a negative-length error is written to `writer`
/// (`spec.md` §8 scenario 1) before the error is returned.
pub async fn exchange_banner<R, W>(reader: &mut R, writer: &mut W) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let ours = banner();
    let mut buf = vec![0_u8; ours.len()];
    reader.read_exact(&mut buf).await?;
    let theirs = String::from_utf8_lossy(&buf).into_owned();
    if theirs != ours {
        write_error_reply(writer, "unsupported protocol banner").await?;
        return Err(HandshakeError::BannerMismatch {
            expected: ours,
            actual: theirs,
        });
    }
    writer.write_all(ours.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the client greeting that follows a successful banner exchange:
/// a 4-byte UTF-16 byte length, the UTF-16 command string, a 4-byte PID,
/// and an 8-byte instance ID (`spec.md` §6).
///
/// # Errors
/// Returns [`HandshakeError::Io`] on a short read or
/// [`HandshakeError::InvalidCommandString`] if the command bytes are not
/// valid UTF-16.
pub async fn read_client_greeting<R>(reader: &mut R) -> Result<ClientGreeting, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let command_len = reader.read_u32().await? as usize;
    let mut command_bytes = vec![0_u8; command_len];
    reader.read_exact(&mut command_bytes).await?;
    let units: Vec<u16> = command_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let command = String::from_utf16(&units).map_err(|_| HandshakeError::InvalidCommandString)?;
    let pid = reader.read_u32().await?;
    let instance_id = reader.read_u64().await?;
    Ok(ClientGreeting {
        command,
        pid,
        instance_id,
    })
}

/// Write the success reply: a positive 1-byte length, the server's UTF-8
/// name, and one feature-flags byte (`spec.md` §6).
///
/// # Errors
/// Returns [`HandshakeError::Io`] on any I/O failure, including a server
/// name too long to fit the 1-byte positive length.
pub async fn write_success_reply<W>(writer: &mut W, cfg: &EngineConfig) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let name_bytes = cfg.server_name.as_bytes();
    let len = i8::try_from(name_bytes.len()).map_err(|_| {
        HandshakeError::Io(std::io::Error::other("server name too long for handshake reply"))
    })?;
    writer.write_i8(len).await?;
    writer.write_all(name_bytes).await?;
    writer.write_u8(cfg.dispatch_mode.feature_flags()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an error reply: a negative 1-byte length followed by that many
/// UTF-8 error message bytes, truncated to fit (`spec.md` §6).
///
/// # Errors
/// Returns [`HandshakeError::Io`] on any I/O failure.
pub async fn write_error_reply<W>(writer: &mut W, message: &str) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let truncated: Vec<u8> = message.bytes().take(127).collect();
    let len = i8::try_from(truncated.len()).unwrap_or(i8::MAX);
    writer.write_i8(-len).await?;
    writer.write_all(&truncated[..len as usize]).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::{
        ClientGreeting, EngineConfig, banner, exchange_banner, read_client_greeting,
        write_error_reply, write_success_reply,
    };

    #[tokio::test]
    async fn matching_banners_succeed() {
        let (client_side, server_side) = duplex(256);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);
        let (mut server_read, mut server_write) = tokio::io::split(server_side);
        let client_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client_write.write_all(banner().as_bytes()).await.expect("write succeeds");
            let mut reply = vec![0_u8; banner().len()];
            tokio::io::AsyncReadExt::read_exact(&mut client_read, &mut reply)
                .await
                .expect("reads echoed banner");
            reply
        });
        exchange_banner(&mut server_read, &mut server_write).await.expect("banner matches");
        let reply = client_task.await.expect("client task join");
        assert_eq!(String::from_utf8(reply).expect("utf8"), banner());
    }

    #[tokio::test]
    async fn greeting_round_trips_empty_command() {
        let (mut a, mut b) = duplex(256);
        let writer_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_u32(0).await.expect("len");
            a.write_u32(4321).await.expect("pid");
            a.write_u64(99).await.expect("instance id");
        });
        let greeting = read_client_greeting(&mut b).await.expect("greeting parses");
        writer_task.await.expect("writer task join");
        assert_eq!(
            greeting,
            ClientGreeting {
                command: String::new(),
                pid: 4321,
                instance_id: 99,
            }
        );
    }

    #[tokio::test]
    async fn success_reply_carries_name_and_flags() {
        let (mut a, mut b) = duplex(256);
        let cfg = EngineConfig::default();
        write_success_reply(&mut a, &cfg).await.expect("writes reply");
        drop(a);
        let mut len = [0_u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut len).await.expect("len byte");
        assert!((len[0] as i8) > 0);
        let mut name = vec![0_u8; len[0] as usize];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut name).await.expect("name bytes");
        assert_eq!(String::from_utf8(name).expect("utf8"), cfg.server_name);
    }

    #[tokio::test]
    async fn error_reply_uses_negative_length() {
        let (mut a, mut b) = duplex(256);
        write_error_reply(&mut a, "nope").await.expect("writes error");
        drop(a);
        let mut len = [0_u8; 1];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut len).await.expect("len byte");
        assert!((len[0] as i8) < 0);
    }
}
