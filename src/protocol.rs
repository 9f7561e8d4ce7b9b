use crate::normalizer::NormalizedImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DIGIT_CLASSES: usize = 10;

const PREDICTION_EVENT: &str = "prediction";

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Expected {expected} probabilities, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("Probability for digit {0} is not a finite number")]
    NonFinite(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSelector {
    #[default]
    Cnn,
    Svm,
}

impl ModelSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSelector::Cnn => "cnn",
            ModelSelector::Svm => "svm",
        }
    }
}

/// Ten class probabilities, index = digit. Values are trusted to lie in
/// `[0, 1]`, only their count and finiteness are checked.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionVector([f64; DIGIT_CLASSES]);

impl PredictionVector {
    pub fn uniform() -> Self {
        Self([1.0 / DIGIT_CLASSES as f64; DIGIT_CLASSES])
    }

    pub fn probabilities(&self) -> &[f64; DIGIT_CLASSES] {
        &self.0
    }
}

impl TryFrom<Vec<f64>> for PredictionVector {
    type Error = ProtocolError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        let actual = values.len();
        let probabilities: [f64; DIGIT_CLASSES] =
            values.try_into().map_err(|_| ProtocolError::WrongLength {
                expected: DIGIT_CLASSES,
                actual,
            })?;
        if let Some(digit) = probabilities.iter().position(|p| !p.is_finite()) {
            return Err(ProtocolError::NonFinite(digit));
        }
        Ok(Self(probabilities))
    }
}

/// Messages sent to the inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    DrawData { image: String, model: ModelSelector },
}

impl ClientMessage {
    pub fn draw_data(image: &NormalizedImage, model: ModelSelector) -> Self {
        ClientMessage::DrawData {
            image: image.to_data_url(),
            model,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages emitted by the inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Prediction { probabilities: Vec<f64> },
}

#[derive(Debug, PartialEq)]
pub enum ServerEvent {
    Prediction(PredictionVector),
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct PredictionPayload {
    probabilities: Vec<f64>,
}

pub fn parse_server_message(text: &str) -> Result<ServerEvent, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.event != PREDICTION_EVENT {
        return Ok(ServerEvent::Other(envelope.event));
    }
    let payload: PredictionPayload = serde_json::from_value(envelope.data)?;
    Ok(ServerEvent::Prediction(payload.probabilities.try_into()?))
}
