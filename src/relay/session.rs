//! One relay session: a browser socket paired with a provider socket.
//!
//! The session starts in the connecting phase, where browser frames are
//! queued while the upstream handshake runs, then forwards both ways until
//! either side goes away. Each direction writes through its own [`Outbox`],
//! so a sink stalled on backpressure never stops the session from reading
//! the other side or noticing a close. Generic over the socket halves so the
//! state machine can be driven by channels in tests.

use std::collections::VecDeque;
use std::future::{Future, poll_fn};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::relay::error::{RelayError, RelayResult};
use crate::relay::frame::{CLOSE_ABNORMAL, CLOSE_NO_STATUS, CloseInfo, ProxyEvent, RelayFrame};

/// How long a closing side gets to deliver its remaining frames.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The browser left; the upstream was closed or abandoned.
    DownstreamClosed,
    /// The provider closed or dropped the connection.
    UpstreamClosed {
        /// Close code reported downstream.
        code: u16,
    },
    /// The provider could not be reached.
    UpstreamUnavailable,
}

/// Drive a session to completion.
///
/// `connect` is started immediately; dropping it abandons the attempt.
pub async fn run_session<D, DR, C, U, UR>(down_tx: D, mut down_rx: DR, connect: C) -> SessionEnd
where
    D: Sink<RelayFrame, Error = RelayError> + Unpin,
    DR: Stream<Item = RelayResult<RelayFrame>> + Unpin,
    C: Future<Output = RelayResult<(U, UR)>>,
    U: Sink<RelayFrame, Error = RelayError> + Unpin,
    UR: Stream<Item = RelayResult<RelayFrame>> + Unpin,
{
    let mut down = Outbox::new(down_tx);
    let mut queued = VecDeque::new();
    let connect = std::pin::pin!(connect);

    let connected = tokio::select! {
        connected = connect => connected,
        () = collect_early_frames(&mut down_rx, &mut queued) => {
            info!("downstream left before the upstream was ready");
            return SessionEnd::DownstreamClosed;
        }
    };

    let (up_tx, mut up_rx) = match connected {
        Ok(pair) => pair,
        Err(err) => {
            warn!("upstream connect failed: {err}");
            down.notify(ProxyEvent::Error {
                message: err.to_string(),
            });
            down.notify(ProxyEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "upstream connect failed".to_string(),
            });
            down.shut().await;
            return SessionEnd::UpstreamUnavailable;
        }
    };

    info!("upstream ready, flushing {} queued frames", queued.len());
    let mut up = Outbox::new(up_tx);
    up.pending = queued;

    loop {
        tokio::select! {
            frame = down_rx.next() => match frame {
                Some(Ok(RelayFrame::Close(_))) | None => {
                    info!("downstream closed");
                    up.shut().await;
                    return SessionEnd::DownstreamClosed;
                }
                Some(Err(err)) => {
                    debug!("downstream error: {err}");
                    up.shut().await;
                    return SessionEnd::DownstreamClosed;
                }
                Some(Ok(frame)) => up.push(frame),
            },
            frame = up_rx.next() => match frame {
                Some(Ok(RelayFrame::Close(info))) => {
                    let CloseInfo { code, reason } = info.unwrap_or(CloseInfo {
                        code: CLOSE_NO_STATUS,
                        reason: String::new(),
                    });
                    info!("upstream closed: {code} {reason}");
                    down.notify(ProxyEvent::Closed { code, reason });
                    down.shut().await;
                    return SessionEnd::UpstreamClosed { code };
                }
                Some(Ok(frame)) => down.push(frame),
                Some(Err(err)) => {
                    warn!("upstream error: {err}");
                    down.notify(ProxyEvent::Error {
                        message: err.to_string(),
                    });
                }
                None => {
                    info!("upstream connection lost");
                    return upstream_lost(&mut down).await;
                }
            },
            err = up.pump() => {
                warn!("upstream send failed: {err}");
                down.notify(ProxyEvent::Error {
                    message: err.to_string(),
                });
                return upstream_lost(&mut down).await;
            }
            err = down.pump() => {
                debug!("downstream send failed: {err}");
                up.shut().await;
                return SessionEnd::DownstreamClosed;
            }
        }
    }
}

/// Queue browser frames until the browser closes, errors or ends.
async fn collect_early_frames<DR>(down_rx: &mut DR, queued: &mut VecDeque<RelayFrame>)
where
    DR: Stream<Item = RelayResult<RelayFrame>> + Unpin,
{
    while let Some(Ok(frame)) = down_rx.next().await {
        if matches!(frame, RelayFrame::Close(_)) {
            return;
        }
        queued.push_back(frame);
    }
}

async fn upstream_lost<D>(down: &mut Outbox<D>) -> SessionEnd
where
    D: Sink<RelayFrame, Error = RelayError> + Unpin,
{
    down.notify(ProxyEvent::Closed {
        code: CLOSE_ABNORMAL,
        reason: "upstream connection lost".to_string(),
    });
    down.shut().await;
    SessionEnd::UpstreamClosed {
        code: CLOSE_ABNORMAL,
    }
}

/// Frames waiting for one sink, in order.
///
/// A frame leaves the queue only once the sink has accepted it, so dropping
/// a [`Outbox::pump`] or [`Outbox::drain`] future mid-way loses nothing.
struct Outbox<S> {
    sink: S,
    pending: VecDeque<RelayFrame>,
    unflushed: bool,
}

impl<S> Outbox<S>
where
    S: Sink<RelayFrame, Error = RelayError> + Unpin,
{
    const fn new(sink: S) -> Self {
        Self {
            sink,
            pending: VecDeque::new(),
            unflushed: false,
        }
    }

    fn push(&mut self, frame: RelayFrame) {
        self.pending.push_back(frame);
    }

    /// Queue a best-effort notification.
    fn notify(&mut self, event: ProxyEvent) {
        match event.to_frame() {
            Ok(frame) => self.push(frame),
            Err(err) => warn!("failed to encode relay notification: {err}"),
        }
    }

    /// Hand every queued frame to the sink and flush it.
    async fn drain(&mut self) -> RelayResult<()> {
        while !self.pending.is_empty() {
            poll_fn(|cx| self.sink.poll_ready_unpin(cx)).await?;
            if let Some(frame) = self.pending.pop_front() {
                self.sink.start_send_unpin(frame)?;
                self.unflushed = true;
            }
        }
        if self.unflushed {
            poll_fn(|cx| self.sink.poll_flush_unpin(cx)).await?;
            self.unflushed = false;
        }
        Ok(())
    }

    /// Keep the sink fed; resolves only when it fails.
    async fn pump(&mut self) -> RelayError {
        match self.drain().await {
            Err(err) => err,
            Ok(()) => std::future::pending().await,
        }
    }

    /// Queue a normal close and give the sink [`CLOSE_GRACE`] to take it.
    async fn shut(&mut self) {
        self.push(RelayFrame::Close(Some(CloseInfo::normal())));
        let delivered = tokio::time::timeout(CLOSE_GRACE, async {
            self.drain().await?;
            self.sink.close().await
        })
        .await;

        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!("close frame not delivered: {err}"),
            Err(_) => debug!("close frame not delivered within {CLOSE_GRACE:?}"),
        }
    }
}
