//! Bridge protocol over a byte stream pair, one JSON message per line.
//!
//! `serve` posts each input line on the channel and writes every response
//! seen on the channel to the output. When the input ends, requests already
//! accepted are answered before it returns. When `shutdown` fires instead,
//! pending device I/O is failed and those failures are still written.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::bridge::MessageBridge;
use crate::channel::{MessageChannel, Subscription};
use crate::connection::ConnectionManager;
use crate::protocol::Response;
use crate::tracing::prelude::*;

/// Upper bound on waiting for handlers once devices are shut down. Only a
/// driver whose open never returns can hold a handler this long.
const HANDLER_GRACE: Duration = Duration::from_secs(2);

/// Serve requests from `input` until it ends or `shutdown` is cancelled,
/// then close every device.
pub async fn serve<R, W>(
    manager: Arc<ConnectionManager>,
    channel: MessageChannel,
    default_baud_rate: u32,
    input: R,
    output: W,
    shutdown: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let stop_output = CancellationToken::new();
    let writer = tokio::spawn(write_responses(
        channel.subscribe(),
        output,
        stop_output.clone(),
    ));

    let bridge = MessageBridge::new(manager.clone(), channel.clone(), default_baud_rate);
    let handlers = bridge.handlers();
    let stop_bridge = CancellationToken::new();
    let bridge = tokio::spawn(bridge.run(stop_bridge.clone()));

    let input_ended = tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = read_requests(input, &channel) => true,
    };
    debug!(input_ended, "No longer accepting requests");

    stop_bridge.cancel();
    if let Err(e) = bridge.await {
        error!(error = %e, "Message bridge task failed");
    }

    if input_ended {
        tokio::select! {
            _ = handlers.wait() => trace!("Accepted requests answered"),
            _ = shutdown.cancelled() => debug!("Shutdown while answering requests"),
        }
    }

    // Fails device I/O still pending, which settles its handlers
    manager.shutdown().await;
    if tokio::time::timeout(HANDLER_GRACE, handlers.wait()).await.is_err() {
        warn!(in_flight = handlers.len(), "Request handlers did not finish");
    }
    // Devices opened by handlers that finished after the first pass
    manager.shutdown().await;

    stop_output.cancel();
    if let Err(e) = writer.await {
        error!(error = %e, "Response writer task failed");
    }
}

/// Post input lines on the channel until the input ends.
async fn read_requests<R: AsyncRead + Unpin>(input: R, channel: &MessageChannel) {
    let mut lines = FramedRead::new(input, LinesCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                channel.post(line);
            }
            Err(e) => {
                error!(error = %e, "Failed to read requests");
                break;
            }
        }
    }
}

/// Write responses to `output` until `stop`, then write those already
/// posted.
async fn write_responses<W>(mut rx: Subscription, output: W, stop: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut out = FramedWrite::new(output, LinesCodec::new());
    loop {
        let text = tokio::select! {
            _ = stop.cancelled() => break,
            text = rx.recv() => text,
        };
        let Some(text) = text else { return };
        if !forward(&mut out, text).await {
            return;
        }
    }
    while let Ok(text) = rx.try_recv() {
        if !forward(&mut out, text).await {
            return;
        }
    }
}

// Requests share the channel with responses; only responses go out.
async fn forward<W>(out: &mut FramedWrite<W, LinesCodec>, text: String) -> bool
where
    W: AsyncWrite + Unpin,
{
    if Response::parse(&text).is_none() {
        return true;
    }
    match out.send(text).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Failed to write response");
            false
        }
    }
}
