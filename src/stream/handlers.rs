//! Callback registry with one optional handler slot per message category.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

use crate::stream::proto::{AuthOkMsg, Candle, ErrorMsg, OptionsSignal, SignalUpdate, Tick};

/// Shared handler stored in a registry slot.
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Message category a handler can be registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Tick,
    Candle,
    Signal,
    OptionsSignal,
    Connect,
    Disconnect,
    Error,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::Candle => "candle",
            Self::Signal => "signal",
            Self::OptionsSignal => "options_signal",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Slots {
    tick: Option<Handler<Tick>>,
    candle: Option<Handler<Candle>>,
    signal: Option<Handler<SignalUpdate>>,
    options_signal: Option<Handler<OptionsSignal>>,
    connect: Option<Handler<AuthOkMsg>>,
    disconnect: Option<Handler<str>>,
    error: Option<Handler<ErrorMsg>>,
}

/// Handlers invoked by the stream client.
///
/// Cloning yields another handle to the same slots, so handlers can be set
/// or replaced while a stream is running. Setting a slot twice keeps only
/// the latest handler.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    slots: Arc<RwLock<Slots>>,
}

macro_rules! slot_accessors {
    ($(#[$doc:meta] $setter:ident, $getter:ident, $field:ident: $ty:ty;)*) => {
        $(
            #[$doc]
            pub fn $setter<F>(&self, handler: F) -> &Self
            where
                F: Fn(&$ty) + Send + Sync + 'static,
            {
                self.write().$field = Some(Arc::new(handler));
                self
            }

            pub(crate) fn $getter(&self) -> Option<Handler<$ty>> {
                self.read().$field.clone()
            }
        )*
    };
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    slot_accessors! {
        /// Handler for `tick` channel payloads.
        on_tick, tick, tick: Tick;
        /// Handler for any `candle:*` channel payload.
        on_candle, candle, candle: Candle;
        /// Handler for `signal` channel payloads.
        on_signal, signal, signal: SignalUpdate;
        /// Handler for `options_signal` channel payloads.
        on_options_signal, options_signal, options_signal: OptionsSignal;
        /// Handler called with the `auth_ok` reply after each successful authentication.
        on_connect, connect, connect: AuthOkMsg;
        /// Handler called with a human-readable reason whenever a session ends.
        on_disconnect, disconnect, disconnect: str;
        /// Handler for `error` frames sent by the server.
        on_error, error, error: ErrorMsg;
    }

    /// Removes the handler for `category`.
    pub fn clear(&self, category: Category) {
        let mut slots = self.write();
        match category {
            Category::Tick => slots.tick = None,
            Category::Candle => slots.candle = None,
            Category::Signal => slots.signal = None,
            Category::OptionsSignal => slots.options_signal = None,
            Category::Connect => slots.connect = None,
            Category::Disconnect => slots.disconnect = None,
            Category::Error => slots.error = None,
        }
    }

    pub fn is_registered(&self, category: Category) -> bool {
        let slots = self.read();
        match category {
            Category::Tick => slots.tick.is_some(),
            Category::Candle => slots.candle.is_some(),
            Category::Signal => slots.signal.is_some(),
            Category::OptionsSignal => slots.options_signal.is_some(),
            Category::Connect => slots.connect.is_some(),
            Category::Disconnect => slots.disconnect.is_some(),
            Category::Error => slots.error.is_some(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.read();
        f.debug_struct("CallbackRegistry")
            .field("tick", &slots.tick.is_some())
            .field("candle", &slots.candle.is_some())
            .field("signal", &slots.signal.is_some())
            .field("options_signal", &slots.options_signal.is_some())
            .field("connect", &slots.connect.is_some())
            .field("disconnect", &slots.disconnect.is_some())
            .field("error", &slots.error.is_some())
            .finish()
    }
}

/// Runs `handler`, isolating a panic so it cannot take the stream down.
///
/// Returns `false` when the handler panicked.
pub(crate) fn invoke<T: ?Sized>(category: Category, handler: &Handler<T>, value: &T) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(value))) {
        Ok(()) => true,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(
                event = "stream_handler_panicked",
                category = category.as_str(),
                detail
            );
            false
        }
    }
}
