use crate::{
    error::FeedError,
    feed::{subscription::SubscriptionRequest, timeout::TimeoutStream},
    instrument::Instrument,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt, stream::BoxStream};
use std::time::Duration;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, info};
use url::Url;

/// Default upstream market data feed endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://api.upstox.com/v3/feed/market-data-feed";

/// Frame received from the feed transport.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum FeedFrame {
    /// Protobuf encoded `FeedResponse`.
    Binary(Bytes),
    /// Informational text frame, logged and ignored.
    Text(String),
}

/// Stream of transport frames for a single connection. Any `Err` ends the session.
pub type FeedStream = BoxStream<'static, Result<FeedFrame, FeedError>>;

/// Opens an authenticated transport and subscribes to the provided instruments.
///
/// A successful return means the subscription request has been sent.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self, token: &str, instruments: &[Instrument])
    -> Result<FeedStream, FeedError>;
}

/// [`FeedConnector`] for the Upstox v3 market data WebSocket.
#[derive(Debug, Clone)]
pub struct UpstoxConnector {
    url: Url,
    read_timeout: Duration,
}

impl UpstoxConnector {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            read_timeout: crate::feed::timeout::DEFAULT_FEED_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl FeedConnector for UpstoxConnector {
    async fn connect(
        &self,
        token: &str,
        instruments: &[Instrument],
    ) -> Result<FeedStream, FeedError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|error| FeedError::Socket(format!("invalid auth header: {error}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (mut websocket, _) = connect_async(request).await?;
        info!(url = %self.url, "connected to market data feed");

        let subscription = SubscriptionRequest::full(instruments.iter().map(|i| &i.key));
        let payload = serde_json::to_vec(&subscription)
            .map_err(|error| FeedError::Subscription(error.to_string()))?;

        websocket.send(Message::Binary(payload.into())).await?;
        info!(
            guid = %subscription.guid,
            instruments = instruments.len(),
            "sent feed subscription"
        );

        let frames = websocket.filter_map(|message| {
            futures::future::ready(match message {
                Ok(Message::Binary(payload)) => Some(Ok(FeedFrame::Binary(payload))),
                Ok(Message::Text(text)) => Some(Ok(FeedFrame::Text(text.as_str().to_owned()))),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "feed transport sent close frame");
                    Some(Err(FeedError::Socket(format!("ConnectionClosed: {frame:?}"))))
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
                Err(error) => Some(Err(FeedError::from(error))),
            })
        });

        Ok(TimeoutStream::new(frames, self.read_timeout).boxed())
    }
}
