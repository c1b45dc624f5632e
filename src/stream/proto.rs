use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Frames sent by the SDK to the stream service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Subscribe {
        symbols: Vec<String>,
        channels: Vec<String>,
    },
}

/// Frames received from the stream service.
///
/// Kinds this SDK does not know decode to [`ServerMessage::Unknown`] rather
/// than failing, so only structurally broken frames are parse errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk(AuthOkMsg),
    AuthError(ErrorMsg),
    Data(DataMsg),
    Error(ErrorMsg),
    Pong,
    #[serde(other)]
    Unknown,
}

/// Successful authentication reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthOkMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Error reply, used both for authentication rejection and in-stream errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ErrorMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataMsg {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

/// Routing class of a data channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel<'a> {
    Tick,
    /// Any `candle` prefixed channel, e.g. `candle:60` or `candle:300`.
    Candle,
    Signal,
    OptionsSignal,
    Other(&'a str),
}

impl<'a> Channel<'a> {
    pub fn classify(name: &'a str) -> Self {
        match name {
            "tick" => Self::Tick,
            "signal" => Self::Signal,
            "options_signal" => Self::OptionsSignal,
            _ if name.starts_with("candle") => Self::Candle,
            other => Self::Other(other),
        }
    }
}

/// Payload of a routed `data` channel.
///
/// Payloads are opaque to the SDK: every field is optional, numbers sent as
/// strings are parsed, and anything unrecognized stays in `fields`. Decoding
/// never fails, so every routed frame reaches its handler.
pub trait Payload: DeserializeOwned + Default {
    /// Decodes the `data` member of a frame.
    ///
    /// A missing payload decodes to the default value; a non-object payload
    /// is kept under the `value` key of `fields`.
    fn from_data(data: Value) -> Self {
        let object = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        serde_json::from_value(Value::Object(object)).unwrap_or_default()
    }
}

/// Trade tick payload of the `tick` channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    #[serde(default, deserialize_with = "lenient_string")]
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// OHLCV payload of the `candle:<interval>` channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    #[serde(default, deserialize_with = "lenient_string")]
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Value>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub open: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub close: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Candle {
    /// Close-over-open change in percent, when both prices are present and
    /// the open is non-zero.
    pub fn change_pct(&self) -> Option<f64> {
        match (self.open, self.close) {
            (Some(open), Some(close)) if open != 0.0 => Some((close - open) / open * 100.0),
            _ => None,
        }
    }
}

/// Realtime BUY/SELL/HOLD signal payload of the `signal` channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalUpdate {
    #[serde(default, deserialize_with = "lenient_string")]
    pub symbol: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub signal: String,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Options environment payload of the `options_signal` channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OptionsSignal {
    #[serde(default, deserialize_with = "lenient_string")]
    pub underlying: String,
    #[serde(default, deserialize_with = "lenient_opt_string", skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_string", skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub iv: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub iv_rank: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub vega: Option<f64>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Payload for Tick {}
impl Payload for Candle {}
impl Payload for SignalUpdate {}
impl Payload for OptionsSignal {}

/// Number or numeric string; anything else reads as absent.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::Bool(flag)) => Some(flag.to_string()),
        _ => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

impl ClientMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the message kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthOk(_) => "auth_ok",
            Self::AuthError(_) => "auth_error",
            Self::Data(_) => "data",
            Self::Error(_) => "error",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}
