//! Ops exposed to the headless preview context.
//!
//! This is the complete capability surface of an isolated context: the
//! parent message port, console capture, random values and base64. No fs,
//! net or env ops exist.

use crate::protocol::EventPort;
use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use tracing::{debug, warn};

/// Lines a single context may write to the console
const MAX_CONSOLE_LINES: usize = 1000;

/// Longest console line kept
const MAX_CONSOLE_LINE: usize = 4096;

/// Remaining console allowance for one context
#[derive(Debug)]
pub struct ConsoleBudget {
    remaining: usize,
}

impl ConsoleBudget {
    /// Consume one line of allowance. False once exhausted.
    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            warn!(target: "preview::console", "console limit reached, further output dropped");
        }
        true
    }
}

impl Default for ConsoleBudget {
    fn default() -> Self {
        Self {
            remaining: MAX_CONSOLE_LINES,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Log,
    Warn,
    Error,
}

fn console(state: &mut OpState, level: Level, msg: &str) {
    let Some(budget) = state.try_borrow_mut::<ConsoleBudget>() else {
        return;
    };
    if !budget.take() {
        return;
    }

    let line = match msg.char_indices().nth(MAX_CONSOLE_LINE) {
        Some((cut, _)) => &msg[..cut],
        None => msg,
    };
    match level {
        Level::Log => debug!(target: "preview::console", "{}", line),
        Level::Warn => warn!(target: "preview::console", "{}", line),
        Level::Error => warn!(target: "preview::console", error = true, "{}", line),
    }
}

// ============================================================================
// Parent Channel
// ============================================================================

#[op2(fast)]
pub fn op_preview_post_message(state: &mut OpState, #[string] message: &str, #[string] target_origin: &str) {
    if let Some(port) = state.try_borrow::<EventPort>() {
        port.post(message, target_origin);
    }
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    console(state, Level::Log, msg);
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    console(state, Level::Warn, msg);
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    console(state, Level::Error, msg);
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_crypto_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_crypto_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    preview_runtime,
    ops = [
        op_preview_post_message,
        op_console_log,
        op_console_warn,
        op_console_error,
        op_crypto_random_uuid,
        op_crypto_get_random_values,
        op_btoa,
        op_atob,
    ],
);
