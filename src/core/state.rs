//! Process-wide shutdown state.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Shutdown has been requested (Ctrl+C received)
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Token cancelled on shutdown, shared with the engine
static SHUTDOWN_TOKEN: OnceLock<CancellationToken> = OnceLock::new();

/// Setup the global Ctrl+C handler. Call once at program start.
///
/// The first Ctrl+C cancels the engine token for a graceful stop; a second
/// one exits immediately.
pub fn setup_shutdown_handler(token: CancellationToken) -> anyhow::Result<()> {
    let _ = SHUTDOWN_TOKEN.set(token);
    ctrlc::set_handler(|| {
        if SHUTDOWN.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        crate::log!("serve"; "shutting down...");
        if let Some(token) = SHUTDOWN_TOKEN.get() {
            token.cancel();
        }
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {}", e))
}
