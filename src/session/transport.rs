//! Client-side transport to the relay.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::tungstenite;

use crate::voice::Frame;

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = anyhow::Result<Frame>> + Send>>;

/// Opens the duplex channel a [`super::VoiceSession`] talks over.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<(FrameSink, FrameStream)>;
}

/// WebSocket connection to the gateway's live endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// `ws://host:port/api/voice/live?user_id=...` for a gateway base URL.
    pub fn for_gateway(base: &str, user_id: &str) -> Self {
        let base = base.trim_end_matches('/');
        let base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
            .unwrap_or_else(|| base.to_string());
        Self::new(format!("{base}/api/voice/live?user_id={user_id}"))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self) -> anyhow::Result<(FrameSink, FrameStream)> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {e}", self.url))?;
        tracing::info!(url = %self.url, "Voice transport connected");

        let (sink, stream) = ws_stream.split();
        let sink = sink
            .with(|frame: Frame| {
                futures_util::future::ready(Ok::<_, tungstenite::Error>(frame.into_ws()))
            })
            .sink_map_err(anyhow::Error::from);
        let stream = stream.filter_map(|msg| {
            futures_util::future::ready(match msg {
                Ok(msg) => Frame::from_ws(msg).map(Ok),
                Err(e) => Some(Err(anyhow::Error::from(e))),
            })
        });
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
