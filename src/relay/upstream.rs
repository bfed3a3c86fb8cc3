//! Socket adapters: both sides expressed as `RelayFrame` sinks and streams.

use axum::extract::ws::WebSocket;
use futures::future;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tracing::debug;

use crate::relay::credentials::UpstreamRequest;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::frame::RelayFrame;

/// Open the provider connection described by `plan`.
///
/// # Errors
/// Returns an error if the handshake fails.
pub async fn connect_upstream(
    plan: UpstreamRequest,
) -> RelayResult<(
    impl Sink<RelayFrame, Error = RelayError> + Unpin + Send,
    impl Stream<Item = RelayResult<RelayFrame>> + Unpin + Send,
)> {
    let UpstreamRequest { url, protocols, .. } = plan;
    let mut request = String::from(url).into_client_request()?;
    if !protocols.is_empty() {
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&protocols.join(", "))?,
        );
    }

    let (socket, response) = connect_async(request).await?;
    debug!("upstream handshake complete: {}", response.status());

    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(RelayError::from)
        .with(|frame: RelayFrame| future::ready(Ok::<_, RelayError>(frame.into_upstream())));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => RelayFrame::from_upstream(message).map(Ok),
            Err(err) => Some(Err(RelayError::from(err))),
        })
    });

    Ok((sink, stream))
}

/// Split an upgraded browser socket into relay halves.
pub fn split_downstream(
    socket: WebSocket,
) -> (
    impl Sink<RelayFrame, Error = RelayError> + Unpin + Send,
    impl Stream<Item = RelayResult<RelayFrame>> + Unpin + Send,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(RelayError::from)
        .with(|frame: RelayFrame| future::ready(Ok::<_, RelayError>(frame.into_downstream())));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => RelayFrame::from_downstream(message).map(Ok),
            Err(err) => Some(Err(RelayError::from(err))),
        })
    });

    (sink, stream)
}
