use crate::bounding_box::locate;
use crate::config::CanvasConfig;
use crate::normalizer::{normalize, NormalizedImage};
use crate::prediction::{InferenceChannel, SendOutcome};
use crate::protocol::{ModelSelector, PredictionVector};
use crate::ranking::{self, RankedPrediction};
use crate::stroke::{Point, StrokeEnd, StrokeRecorder};
use crate::telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// Input from the presentation layer. Coordinates are local to the canvas.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasEvent {
    PointerDown { x: f32, y: f32 },
    PointerMove { x: f32, y: f32 },
    PointerUp,
    PointerLeave,
    BrushSize { size: u32 },
    SelectModel { model: ModelSelector },
    Clear,
}

/// Output for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasUpdate {
    Predictions { predictions: Vec<RankedPrediction> },
    Baseline { predictions: Vec<RankedPrediction> },
    BrushSize { size: u32 },
}

impl CanvasUpdate {
    pub fn baseline() -> Self {
        CanvasUpdate::Baseline {
            predictions: ranking::baseline(),
        }
    }
}

/// One drawing surface: its raster, its backend channel and what is
/// currently displayed.
pub struct DrawingSession {
    recorder: StrokeRecorder,
    channel: InferenceChannel,
    padding: u32,
    model: ModelSelector,
    last_image: Option<NormalizedImage>,
    ranking: Vec<RankedPrediction>,
    metrics: Arc<Metrics>,
}

impl DrawingSession {
    pub fn new(canvas: &CanvasConfig, channel: InferenceChannel, metrics: Arc<Metrics>) -> Self {
        Self {
            recorder: StrokeRecorder::new(canvas.size, canvas.brush_size),
            channel,
            padding: canvas.padding,
            model: canvas.default_model,
            last_image: None,
            ranking: ranking::baseline(),
            metrics,
        }
    }

    pub fn recorder(&self) -> &StrokeRecorder {
        &self.recorder
    }

    pub fn model(&self) -> ModelSelector {
        self.model
    }

    pub fn ranking(&self) -> &[RankedPrediction] {
        &self.ranking
    }

    pub fn brush_size(&self) -> CanvasUpdate {
        CanvasUpdate::BrushSize {
            size: self.recorder.brush_size(),
        }
    }

    pub fn handle(&mut self, event: CanvasEvent, now: Instant) -> Option<CanvasUpdate> {
        match event {
            CanvasEvent::PointerDown { x, y } => {
                self.recorder.begin(Point::new(x, y));
                None
            }
            CanvasEvent::PointerMove { x, y } => {
                self.recorder.extend(Point::new(x, y));
                None
            }
            CanvasEvent::PointerUp | CanvasEvent::PointerLeave => self.complete_stroke(now),
            CanvasEvent::BrushSize { size } => {
                self.recorder.set_brush_size(size);
                Some(self.brush_size())
            }
            CanvasEvent::SelectModel { model } => {
                self.select_model(model, now);
                None
            }
            CanvasEvent::Clear => {
                self.recorder.clear();
                self.last_image = None;
                Some(self.show_baseline())
            }
        }
    }

    /// Replaces the displayed ranking with a freshly received vector.
    pub fn accept_prediction(&mut self, vector: PredictionVector) -> CanvasUpdate {
        self.ranking = ranking::rank(&vector);
        CanvasUpdate::Predictions {
            predictions: self.ranking.clone(),
        }
    }

    pub async fn next_prediction(&mut self) -> Option<PredictionVector> {
        self.channel.next_prediction().await
    }

    fn show_baseline(&mut self) -> CanvasUpdate {
        self.ranking = ranking::baseline();
        CanvasUpdate::baseline()
    }

    fn complete_stroke(&mut self, now: Instant) -> Option<CanvasUpdate> {
        match self.recorder.end() {
            StrokeEnd::Idle => None,
            StrokeEnd::Empty => Some(self.show_baseline()),
            StrokeEnd::Drawn => {
                let started = Instant::now();
                let Some(bbox) = locate(self.recorder.bitmap(), self.padding) else {
                    return Some(self.show_baseline());
                };
                let image = match normalize(self.recorder.bitmap(), &bbox) {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::error!("Failed to normalize drawing: {}", e);
                        return None;
                    }
                };
                self.metrics
                    .record_normalize_duration(started.elapsed().as_micros() as u64);

                let outcome = self.channel.send_at(&image, self.model, now);
                self.record_outcome(outcome);
                self.last_image = Some(image);
                None
            }
        }
    }

    fn select_model(&mut self, model: ModelSelector, now: Instant) {
        self.model = model;
        let Some(image) = self.last_image.as_ref() else {
            return;
        };
        let outcome = self.channel.resend_at(image, model, now);
        self.record_outcome(outcome);
    }

    fn record_outcome(&self, outcome: SendOutcome) {
        self.metrics.record_draw_request(outcome.as_str());
        if outcome != SendOutcome::Accepted {
            tracing::debug!(
                "Drawing not sent to {} model: {}",
                self.model.as_str(),
                outcome.as_str()
            );
        }
    }
}
