// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Out-of-process build worker: framed request in, framed reply out.
//!
//! The parent writes one `build_request` packet and closes its end; the
//! worker answers each request with one `build_reply` packet and exits on
//! end of input. Both sides use the same reader, so a short read can never
//! desynchronize framing.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Result};
use scenehook_proto::wire::{decode_message, encode_message, payload_len, CHECKSUM_BYTES, HEADER_BYTES};
use scenehook_proto::{Message, SceneQuery, WorkerResponse};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::library::SceneLibrary;
use crate::runner::execute;
use crate::tracker::TrackerConfig;

/// Read one packet. Returns `Ok(None)` when the stream closes before any
/// byte of a new packet was read.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; HEADER_BYTES];
    let mut read = 0usize;
    while read < header.len() {
        let n = reader.read(&mut header[read..]).await?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated packet header: read {read} of {HEADER_BYTES} bytes"),
            )
            .into());
        }
        read += n;
    }
    let len = payload_len(&header)?;
    let mut packet = Vec::with_capacity(HEADER_BYTES + len + CHECKSUM_BYTES);
    packet.extend_from_slice(&header);
    packet.resize(HEADER_BYTES + len + CHECKSUM_BYTES, 0);
    reader.read_exact(&mut packet[HEADER_BYTES..]).await?;
    let (msg, _) = decode_message(&packet)?;
    Ok(Some(msg))
}

/// Parent side: send `query`, close the request stream, await the reply.
/// `Ok(None)` means the worker closed its output without answering.
pub async fn exchange<R, W>(mut reader: R, mut writer: W, query: &SceneQuery) -> Result<Option<WorkerResponse>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let packet = encode_message(&Message::BuildRequest(query.clone()))?;
    writer.write_all(&packet).await?;
    writer.flush().await?;
    drop(writer);
    match read_packet(&mut reader).await? {
        Some(Message::BuildReply(response)) => Ok(Some(response)),
        Some(Message::BuildRequest(_)) => bail!("worker sent a build_request"),
        None => Ok(None),
    }
}

/// Worker side: answer every request on `reader` until end of input.
pub async fn serve<R, W>(
    library: Arc<SceneLibrary>,
    config: TrackerConfig,
    mut reader: R,
    mut writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = read_packet(&mut reader).await? {
        let Message::BuildRequest(query) = msg else {
            bail!("worker received a build_reply");
        };
        debug!(kind = ?query.kind, module = ?query.target, "worker build request");
        let library = Arc::clone(&library);
        let config = config.clone();
        let response =
            tokio::task::spawn_blocking(move || execute(&library, &config, query).into_response())
                .await?;
        writer
            .write_all(&encode_message(&Message::BuildReply(response))?)
            .await?;
        writer.flush().await?;
    }
    info!("worker input closed");
    Ok(())
}

/// [`serve`] over this process's stdin and stdout.
pub async fn serve_stdio(library: Arc<SceneLibrary>, config: TrackerConfig) -> Result<()> {
    serve(library, config, tokio::io::stdin(), tokio::io::stdout()).await
}
