//! Length-prefixed JSON frame codec over any async byte stream.
//!
//! Each frame is: `[u32 big-endian length][UTF-8 JSON payload]`.

use std::io;

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame payload (16 MiB).
///
/// Large enough for captured output of a `RUN --wait`, small enough to
/// bound memory against a misbehaving peer.
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Encodes `msg` as a length-prefixed JSON frame and writes it to `w`.
pub async fn send<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await
}

/// Reads one length-prefixed frame from `r` and decodes it as `T`.
pub async fn recv<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_payload(r).await?;
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Reads one frame as a raw JSON value.
///
/// Used by the helper so that a frame with an unknown `type` can still be
/// answered with an `ERROR` carrying the original correlation id.
pub async fn recv_value<R>(r: &mut R) -> io::Result<serde_json::Value>
where
    R: AsyncRead + Unpin,
{
    let payload = read_payload(r).await?;
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn read_payload<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Frame, PROTOCOL_VERSION};

    #[tokio::test]
    async fn roundtrip_hello() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send(
            &mut a,
            &Frame::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
            },
        )
        .await
        .unwrap();

        let decoded: Frame = recv(&mut b).await.unwrap();
        match decoded {
            Frame::Hello { id, version } => {
                assert_eq!(id, 0);
                assert_eq!(version, PROTOCOL_VERSION);
            }
            other => panic!("expected HELLO, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn roundtrip_run_result() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let run = Frame::Run {
            id: 7,
            argv: vec!["/bin/echo".into(), "hi".into()],
            env: [("K".to_string(), "V".to_string())].into(),
            wait: true,
            attach_stdio: false,
        };
        send(&mut a, &run).await.unwrap();
        send(
            &mut a,
            &Frame::Result {
                id: 7,
                code: 0,
                stdout: "hi\n".into(),
                stderr: String::new(),
            },
        )
        .await
        .unwrap();

        let decoded: Frame = recv(&mut b).await.unwrap();
        match decoded {
            Frame::Run { id, argv, wait, .. } => {
                assert_eq!(id, 7);
                assert_eq!(argv[0], "/bin/echo");
                assert!(wait);
            }
            other => panic!("expected RUN, got {other:?}"),
        }
        let decoded: Frame = recv(&mut b).await.unwrap();
        assert_eq!(decoded.id(), 7);
    }

    #[tokio::test]
    async fn wire_is_tagged_json() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        send(&mut a, &Frame::Ping { id: 3 }).await.unwrap();

        let value = recv_value(&mut b).await.unwrap();
        assert_eq!(value["type"], "PING");
        assert_eq!(value["id"], 3);
    }

    #[tokio::test]
    async fn unknown_type_still_decodes_as_value() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let raw = serde_json::json!({"type": "FROBNICATE", "id": 9});
        send(&mut a, &raw).await.unwrap();

        let value = recv_value(&mut b).await.unwrap();
        assert_eq!(value["id"].as_u64(), Some(9));
        assert!(serde_json::from_value::<Frame>(value).is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Header claiming 32 MiB.
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &header)
            .await
            .unwrap();

        let result: io::Result<Frame> = recv(&mut b).await;
        assert!(result.is_err());
    }
}
