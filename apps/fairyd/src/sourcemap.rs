//! Interface to the external source-map resolver. Resolution itself lives
//! outside the engine; implementations must be side-effect-free and
//! time-bounded.

use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct OriginalLocation {
    pub file: String,
    pub line: u64,
    pub column: u64,
    pub name: Option<String>,
}

#[async_trait]
pub trait SourceMapResolver: Send + Sync {
    /// Map a generated location back to its original source, or `None` when
    /// no source map covers the script.
    async fn resolve(&self, script_url: &str, line: u64, column: u64) -> Option<OriginalLocation>;
}

/// Default when no resolver is wired in: every frame stays unchanged.
pub struct NoopSourceMapResolver;

#[async_trait]
impl SourceMapResolver for NoopSourceMapResolver {
    async fn resolve(&self, _script_url: &str, _line: u64, _column: u64) -> Option<OriginalLocation> {
        None
    }
}
