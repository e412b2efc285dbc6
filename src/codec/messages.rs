use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

const EMPTY_SOT_WARNING: &str = "Empty SOT marker detected: Psot=12.";
const TRAILING_BOX_WARNING: &str =
    "JP2 box which are after the codestream will not be read by this function.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Debug,
    Warning,
    Failure,
}

type MessageCallbackType = dyn FnMut(MessageLevel, &str) + 'static + Send;

/// Static variable that holds the current message callback function
static MESSAGE_CALLBACK: Lazy<Mutex<Option<Box<MessageCallbackType>>>> =
    Lazy::new(Default::default);

/// Process-wide suppression state for known benign codec warnings.
struct WarningState {
    empty_sot_emitted: AtomicBool,
}

impl WarningState {
    const fn new() -> Self {
        WarningState {
            empty_sot_emitted: AtomicBool::new(false),
        }
    }

    /// Returns `true` the first time it is called after a reset.
    fn claim_empty_sot(&self) -> bool {
        !self.empty_sot_emitted.swap(true, Ordering::SeqCst)
    }

    fn reset(&self) {
        self.empty_sot_emitted.store(false, Ordering::SeqCst);
    }
}

static WARNING_STATE: WarningState = WarningState::new();

/// Re-arm the one-time warnings, so the next occurrence is emitted again.
pub fn reset_warning_state() {
    WARNING_STATE.reset();
}

/// Set a custom handler for codec messages.
///
/// The handler sees every message that is emitted, after suppression rules
/// were applied. The function must be `Send` since it is potentially called
/// from prefetch worker threads.
pub fn set_message_handler<F>(callback: F)
where
    F: FnMut(MessageLevel, &str) + 'static + Send,
{
    MESSAGE_CALLBACK.lock().replace(Box::new(callback));
}

/// Remove a custom message handler.
pub fn remove_message_handler() {
    MESSAGE_CALLBACK.lock().take();
}

fn forward(level: MessageLevel, msg: &str) {
    if let Some(callback) = MESSAGE_CALLBACK.lock().as_mut() {
        callback(level, msg);
    }
}

/// Sink for the info, warning and error callbacks of a codec session.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecMessages;

impl CodecMessages {
    pub fn info(&self, msg: &str) {
        let msg = msg.trim_end_matches('\n');
        debug!(target: "openjpeg", "info: {}", msg);
        forward(MessageLevel::Debug, msg);
    }

    /// Report a codec warning. Returns whether it was emitted.
    pub fn warning(&self, msg: &str) -> bool {
        let msg = msg.trim_end_matches('\n');
        if msg == TRAILING_BOX_WARNING {
            return false;
        }
        if msg == EMPTY_SOT_WARNING && !WARNING_STATE.claim_empty_sot() {
            return false;
        }
        warn!(target: "openjpeg", "{}", msg);
        forward(MessageLevel::Warning, msg);
        true
    }

    pub fn error(&self, msg: &str) {
        let msg = msg.trim_end_matches('\n');
        error!(target: "openjpeg", "{}", msg);
        forward(MessageLevel::Failure, msg);
    }
}
