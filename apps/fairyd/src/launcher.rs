//! Interface to the external browser launcher. Launching and terminating
//! the browser process is not the engine's job; it only needs the debug
//! endpoint and a way to learn when the browser is gone.

use async_trait::async_trait;

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Debug endpoint of the running browser (`host:port` or a URL).
    fn debug_endpoint(&self) -> String;

    /// Resolves when the browser process exits; the engine then shuts down.
    async fn wait_exit(&self);
}
