use crate::config::InferenceServiceConfig;
use crate::normalizer::NormalizedImage;
use crate::protocol::{
    parse_server_message, ClientMessage, ModelSelector, PredictionVector, ServerEvent,
};
use crate::telemetry::Metrics;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{sleep, timeout, Duration, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Failed to connect to inference backend: {0}")]
    ConnectionFailed(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    Throttled,
    Disconnected,
    Backpressure,
}

impl SendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::Accepted => "accepted",
            SendOutcome::Throttled => "throttled",
            SendOutcome::Disconnected => "disconnected",
            SendOutcome::Backpressure => "backpressure",
        }
    }
}

/// Minimum spacing between accepted requests, measured from the last one.
#[derive(Debug)]
pub struct Throttle {
    window: Duration,
    last_accepted: Option<Instant>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
        }
    }

    pub fn is_open(&self, now: Instant) -> bool {
        match self.last_accepted {
            Some(last) => now.saturating_duration_since(last) > self.window,
            None => true,
        }
    }

    /// Restarts the window at `now`, replacing any earlier mark.
    pub fn record(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }
}

/// Client side of the backend connection for one drawing surface.
///
/// Sends are fire-and-forget: they are either queued for the socket task or
/// dropped, never retried. Predictions are delivered in arrival order with no
/// link to the request that caused them.
pub struct InferenceChannel {
    outbound: mpsc::Sender<ClientMessage>,
    inbound: mpsc::Receiver<PredictionVector>,
    state: watch::Receiver<ConnectionState>,
    throttle: Throttle,
}

impl InferenceChannel {
    /// Spawns the socket task and returns immediately, the first connection
    /// attempt happens in the background.
    pub fn connect(
        config: &InferenceServiceConfig,
        metrics: Arc<Metrics>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let connection = BackendConnection {
            url: config.url.clone(),
            policy: ReconnectPolicy {
                initial_delay: config.get_initial_backoff(),
                max_delay: config.get_max_backoff(),
                connect_timeout: config.get_connect_timeout(),
            },
            outbound: outbound_rx,
            inbound: inbound_tx,
            state: state_tx,
            metrics,
        };
        tokio::spawn(connection.run(shutdown_rx));

        Self::from_parts(
            outbound_tx,
            inbound_rx,
            state_rx,
            config.get_throttle_window(),
        )
    }

    pub(crate) fn from_parts(
        outbound: mpsc::Sender<ClientMessage>,
        inbound: mpsc::Receiver<PredictionVector>,
        state: watch::Receiver<ConnectionState>,
        throttle_window: Duration,
    ) -> Self {
        Self {
            outbound,
            inbound,
            state,
            throttle: Throttle::new(throttle_window),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_until_connected(&mut self) -> bool {
        self.state
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .is_ok()
    }

    pub fn send(&mut self, image: &NormalizedImage, model: ModelSelector) -> SendOutcome {
        self.send_at(image, model, Instant::now())
    }

    pub fn send_at(
        &mut self,
        image: &NormalizedImage,
        model: ModelSelector,
        now: Instant,
    ) -> SendOutcome {
        self.submit(image, model, now, false)
    }

    /// Sends without waiting for the throttle window, used when the user
    /// switches models. An accepted resend restarts the window.
    pub fn resend(&mut self, image: &NormalizedImage, model: ModelSelector) -> SendOutcome {
        self.resend_at(image, model, Instant::now())
    }

    pub fn resend_at(
        &mut self,
        image: &NormalizedImage,
        model: ModelSelector,
        now: Instant,
    ) -> SendOutcome {
        self.submit(image, model, now, true)
    }

    fn submit(
        &mut self,
        image: &NormalizedImage,
        model: ModelSelector,
        now: Instant,
        bypass_throttle: bool,
    ) -> SendOutcome {
        if self.state() != ConnectionState::Connected {
            return SendOutcome::Disconnected;
        }
        if !bypass_throttle && !self.throttle.is_open(now) {
            return SendOutcome::Throttled;
        }
        match self.outbound.try_send(ClientMessage::draw_data(image, model)) {
            Ok(()) => {
                self.throttle.record(now);
                SendOutcome::Accepted
            }
            Err(TrySendError::Full(_)) => SendOutcome::Backpressure,
            Err(TrySendError::Closed(_)) => SendOutcome::Disconnected,
        }
    }

    /// Next valid prediction from the backend. `None` once the socket task
    /// has stopped for good.
    pub async fn next_prediction(&mut self) -> Option<PredictionVector> {
        self.inbound.recv().await
    }
}

#[derive(Debug, Clone)]
struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    connect_timeout: Duration,
}

enum SocketEnd {
    Dropped,
    Finished,
}

struct BackendConnection {
    url: String,
    policy: ReconnectPolicy,
    outbound: mpsc::Receiver<ClientMessage>,
    inbound: mpsc::Sender<PredictionVector>,
    state: watch::Sender<ConnectionState>,
    metrics: Arc<Metrics>,
}

impl BackendConnection {
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let socket = tokio::select! {
                socket = self.connect_with_backoff() => socket,
                _ = shutdown_rx.recv() => None,
            };
            let Some(socket) = socket else {
                break;
            };

            // anything still queued was accepted against the previous socket
            while self.outbound.try_recv().is_ok() {}

            tracing::info!(url = %self.url, "Connected to inference backend");
            self.set_state(ConnectionState::Connected);
            let end = self.serve(socket, &mut shutdown_rx).await;
            self.set_state(ConnectionState::Disconnected);

            match end {
                SocketEnd::Dropped => tracing::warn!("Inference backend connection lost"),
                SocketEnd::Finished => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Inference connection stopped");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        match (previous, state) {
            (ConnectionState::Connected, ConnectionState::Connected) => {}
            (_, ConnectionState::Connected) => self.metrics.record_connection(true),
            (ConnectionState::Connected, _) => self.metrics.record_connection(false),
            _ => {}
        }
    }

    async fn connect_once(&self) -> Result<BackendSocket, ChannelError> {
        match timeout(self.policy.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(ChannelError::from(e)),
            Err(_) => Err(ChannelError::Timeout(self.policy.connect_timeout)),
        }
    }

    // Retries until connected. Returns None once every InferenceChannel
    // handle is gone, since nobody is left to send or receive.
    async fn connect_with_backoff(&mut self) -> Option<BackendSocket> {
        let mut retry_delay = self.policy.initial_delay;
        loop {
            match self.connect_once().await {
                Ok(socket) => return Some(socket),
                Err(e) => tracing::error!("Failed to connect to inference backend: {}", e),
            }

            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            let wait = sleep(retry_delay.mul_f32(jitter));
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    request = self.outbound.recv() => match request {
                        Some(_) => tracing::debug!("Dropping request queued while disconnected"),
                        None => return None,
                    },
                }
            }
            retry_delay = (retry_delay * 2).min(self.policy.max_delay);
        }
    }

    async fn serve(
        &mut self,
        socket: BackendSocket,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> SocketEnd {
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                request = self.outbound.recv() => {
                    let Some(request) = request else {
                        let _ = write.send(Message::Close(None)).await;
                        return SocketEnd::Finished;
                    };
                    let text = match request.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("Failed to serialize request: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::text(text)).await {
                        tracing::warn!("Failed to send request: {}", e);
                        return SocketEnd::Dropped;
                    }
                },
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Inference backend closed the connection: {:?}", frame);
                        return SocketEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Inference socket error: {}", e);
                        return SocketEnd::Dropped;
                    }
                    None => return SocketEnd::Dropped,
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Inference connection received shutdown signal");
                    let _ = write.send(Message::Close(None)).await;
                    return SocketEnd::Finished;
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        match parse_server_message(text) {
            Ok(ServerEvent::Prediction(vector)) => {
                self.metrics.record_prediction("valid");
                // a closed receiver means the channel is being dropped,
                // the outbound side notices on the next poll
                let _ = self.inbound.send(vector).await;
            }
            Ok(ServerEvent::Other(event)) => {
                tracing::debug!("Ignoring backend event {}", event);
            }
            Err(e) => {
                self.metrics.record_prediction("malformed");
                tracing::warn!("Discarding malformed prediction: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounding_box::BoundingBox;
    use crate::normalizer::normalize;
    use image::{GrayImage, Luma};

    const WINDOW: Duration = Duration::from_millis(1000);

    struct Harness {
        channel: InferenceChannel,
        requests: mpsc::Receiver<ClientMessage>,
        state: watch::Sender<ConnectionState>,
        predictions: mpsc::Sender<PredictionVector>,
    }

    fn harness(capacity: usize) -> Harness {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        Harness {
            channel: InferenceChannel::from_parts(outbound_tx, inbound_rx, state_rx, WINDOW),
            requests: outbound_rx,
            state: state_tx,
            predictions: inbound_tx,
        }
    }

    fn image() -> NormalizedImage {
        let mut bitmap = GrayImage::new(28, 28);
        bitmap.put_pixel(14, 14, Luma([255]));
        let bbox = BoundingBox {
            left: 0,
            top: 0,
            right: 28,
            bottom: 28,
        };
        normalize(&bitmap, &bbox).unwrap()
    }

    fn drain(requests: &mut mpsc::Receiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut drained = Vec::new();
        while let Ok(request) = requests.try_recv() {
            drained.push(request);
        }
        drained
    }

    #[test]
    fn test_throttle_window_is_strict() {
        let start = Instant::now();
        let mut throttle = Throttle::new(WINDOW);

        assert!(throttle.is_open(start));
        throttle.record(start);
        assert!(!throttle.is_open(start + Duration::from_millis(999)));
        assert!(!throttle.is_open(start + WINDOW));
        assert!(throttle.is_open(start + Duration::from_millis(1001)));
    }

    #[tokio::test]
    async fn test_at_most_one_send_per_window() {
        let mut h = harness(16);
        let image = image();
        let start = Instant::now();

        let outcomes: Vec<SendOutcome> = (0..10)
            .map(|i| {
                h.channel
                    .send_at(&image, ModelSelector::Cnn, start + Duration::from_millis(i * 90))
            })
            .collect();

        assert_eq!(outcomes[0], SendOutcome::Accepted);
        assert!(outcomes[1..].iter().all(|o| *o == SendOutcome::Throttled));
        assert_eq!(drain(&mut h.requests).len(), 1);

        let later = h
            .channel
            .send_at(&image, ModelSelector::Cnn, start + Duration::from_millis(1001));
        assert_eq!(later, SendOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_resend_bypasses_and_restarts_window() {
        let mut h = harness(16);
        let image = image();
        let start = Instant::now();

        h.channel.send_at(&image, ModelSelector::Cnn, start);
        let first = h
            .channel
            .resend_at(&image, ModelSelector::Svm, start + Duration::from_millis(100));
        let second = h
            .channel
            .resend_at(&image, ModelSelector::Cnn, start + Duration::from_millis(200));
        assert_eq!(first, SendOutcome::Accepted);
        assert_eq!(second, SendOutcome::Accepted);

        // window now runs from the last resend
        let throttled = h
            .channel
            .send_at(&image, ModelSelector::Cnn, start + Duration::from_millis(1100));
        assert_eq!(throttled, SendOutcome::Throttled);

        let models: Vec<ModelSelector> = drain(&mut h.requests)
            .into_iter()
            .map(|ClientMessage::DrawData { model, .. }| model)
            .collect();
        assert_eq!(
            models,
            vec![ModelSelector::Cnn, ModelSelector::Svm, ModelSelector::Cnn]
        );
    }

    #[tokio::test]
    async fn test_disconnected_sends_are_dropped_without_using_the_window() {
        let mut h = harness(16);
        let image = image();
        let start = Instant::now();

        h.state.send_replace(ConnectionState::Disconnected);
        assert_eq!(
            h.channel.send_at(&image, ModelSelector::Cnn, start),
            SendOutcome::Disconnected
        );
        assert_eq!(
            h.channel.resend_at(&image, ModelSelector::Svm, start),
            SendOutcome::Disconnected
        );
        assert!(drain(&mut h.requests).is_empty());

        h.state.send_replace(ConnectionState::Connected);
        assert_eq!(
            h.channel
                .send_at(&image, ModelSelector::Cnn, start + Duration::from_millis(10)),
            SendOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_full_queue_reports_backpressure() {
        let mut h = harness(1);
        let image = image();
        let start = Instant::now();

        assert_eq!(
            h.channel.resend_at(&image, ModelSelector::Cnn, start),
            SendOutcome::Accepted
        );
        assert_eq!(
            h.channel.resend_at(&image, ModelSelector::Cnn, start),
            SendOutcome::Backpressure
        );
    }

    #[tokio::test]
    async fn test_request_carries_image_and_model() {
        let mut h = harness(4);
        let image = image();

        h.channel.send(&image, ModelSelector::Svm);

        let ClientMessage::DrawData {
            image: payload,
            model,
        } = h.requests.recv().await.unwrap();
        assert_eq!(model, ModelSelector::Svm);
        assert_eq!(payload, image.to_data_url());
    }

    #[tokio::test]
    async fn test_predictions_arrive_in_order() {
        let mut h = harness(4);
        let first = PredictionVector::uniform();
        let mut values = vec![0.0; 10];
        values[7] = 1.0;
        let second = PredictionVector::try_from(values).unwrap();

        h.predictions.send(first.clone()).await.unwrap();
        h.predictions.send(second.clone()).await.unwrap();

        assert_eq!(h.channel.next_prediction().await, Some(first));
        assert_eq!(h.channel.next_prediction().await, Some(second));
    }
}
