//! Inbound frame classification and handler routing.

use serde_json::Value;
use tracing::{debug, warn};

use crate::stream::handlers::{invoke, CallbackRegistry, Category, Handler};
use crate::stream::proto::{Channel, Payload, ServerMessage};

/// What happened to a single inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// A registered handler ran to completion.
    Delivered(Category),
    /// A registered handler panicked; the panic was contained.
    HandlerPanicked(Category),
    /// The frame was classified but no handler is registered for it.
    Unhandled(Category),
    /// Heartbeat acknowledgement.
    Pong,
    /// A kind or channel this SDK does not route.
    Ignored,
    /// The frame is not valid JSON or has no known envelope.
    Malformed,
}

/// Routes raw frames to the handlers of a [`CallbackRegistry`].
///
/// Dispatch is synchronous: handlers run on the caller's task, in frame
/// arrival order, with no buffering.
#[derive(Clone, Debug, Default)]
pub struct Dispatcher {
    callbacks: CallbackRegistry,
}

impl Dispatcher {
    pub fn new(callbacks: CallbackRegistry) -> Self {
        Self { callbacks }
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// Parses and routes one raw text frame.
    pub fn dispatch(&self, raw: &str) -> Dispatch {
        match ServerMessage::from_text(raw) {
            Ok(message) => self.dispatch_message(message),
            Err(err) => {
                debug!(event = "stream_frame_malformed", error = %err);
                Dispatch::Malformed
            }
        }
    }

    /// Routes an already decoded server message.
    pub fn dispatch_message(&self, message: ServerMessage) -> Dispatch {
        match message {
            ServerMessage::Data(data) => match Channel::classify(&data.channel) {
                Channel::Tick => deliver(Category::Tick, self.callbacks.tick(), data.data),
                Channel::Candle => deliver(Category::Candle, self.callbacks.candle(), data.data),
                Channel::Signal => deliver(Category::Signal, self.callbacks.signal(), data.data),
                Channel::OptionsSignal => deliver(
                    Category::OptionsSignal,
                    self.callbacks.options_signal(),
                    data.data,
                ),
                Channel::Other(_) => Dispatch::Ignored,
            },
            ServerMessage::Error(error) => {
                warn!(
                    event = "stream_server_error",
                    message = error.message.as_deref().unwrap_or("")
                );
                match self.callbacks.error() {
                    Some(handler) => outcome(Category::Error, invoke(Category::Error, &handler, &error)),
                    None => Dispatch::Unhandled(Category::Error),
                }
            }
            ServerMessage::Pong => Dispatch::Pong,
            ServerMessage::AuthOk(_) | ServerMessage::AuthError(_) | ServerMessage::Unknown => {
                Dispatch::Ignored
            }
        }
    }
}

/// Hands the payload to `handler`, if any. The payload is only decoded when
/// a handler is registered.
fn deliver<T>(category: Category, handler: Option<Handler<T>>, payload: Value) -> Dispatch
where
    T: Payload,
{
    let Some(handler) = handler else {
        return Dispatch::Unhandled(category);
    };
    let value = T::from_data(payload);
    outcome(category, invoke(category, &handler, &value))
}

fn outcome(category: Category, completed: bool) -> Dispatch {
    if completed {
        Dispatch::Delivered(category)
    } else {
        Dispatch::HandlerPanicked(category)
    }
}
