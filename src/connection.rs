use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use crate::{
    registry::{OUTBOUND_QUEUE_DEPTH, Peer},
    router::Router,
};

/// Longest accepted input line in bytes; anything bigger is a protocol
/// violation that costs the offender its connection.
pub const MAX_FRAME_LEN: usize = 8192;

/// Drives one client connection from accept to close.
///
/// The lifecycle is a straight line: split the socket and start the writer
/// task (Connecting), register with the router which announces the join
/// (Active), relay framed lines until EOF, an error, or cancellation
/// (Active -> Closing), then deregister, announce the departure, and let the
/// writer drain and release the socket (Closed).
pub async fn handle(
    stream: TcpStream,
    addr: SocketAddr,
    router: Arc<Router>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LEN));

    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let writer = tokio::spawn(write_outbound(write_half, queue, shutdown.clone()));

    let peer = router
        .register(addr.to_string(), outbound, shutdown.clone())
        .await;

    let result = read_loop(lines, &peer, &router, &shutdown).await;

    router.disconnect(peer.id).await;
    // Dropping the last sender lets the writer task flush what is queued,
    // shut the socket down, and exit.
    drop(peer);
    let _ = writer.await;

    result
}

async fn read_loop(
    mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
    peer: &Peer,
    router: &Router,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = lines.next() => match frame {
                Some(Ok(text)) => router.relay(peer, &text).await,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(peer = %peer.addr, limit = MAX_FRAME_LEN, "oversized line, closing connection");
                    return Ok(());
                }
                Some(Err(LinesCodecError::Io(err))) => return Err(err.into()),
                None => {
                    debug!(peer = %peer.addr, "client hung up");
                    return Ok(());
                }
            },
        }
    }
}

/// Owns the socket write half and serves the peer's outbound queue. Runs
/// until the queue closes, a write fails, or the connection token is
/// cancelled; cancellation interrupts even a write that is blocked on a full
/// socket buffer, so a reaped peer's teardown never waits on the peer. A
/// failed write cancels the token so the read side stops promptly too.
async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    let serve = async {
        while let Some(line) = queue.recv().await {
            let failed = writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err();
            if failed {
                shutdown.cancel();
                break;
            }
        }
    };
    select! {
        _ = shutdown.cancelled() => {}
        _ = serve => {}
    }
    let _ = writer.shutdown().await;
}
