use std::fmt;
use std::sync::Arc;

use crate::signer::{KeyPair, Signer};
use crate::SignableFormat;

/// Options for [`Core::open`](crate::Core::open).
#[derive(Clone)]
pub struct CoreOptions {
    /// Writer identity. A fresh pair is generated when creating a core
    /// without one.
    pub key_pair: Option<KeyPair>,
    /// Replaces the default Ed25519 signer built from `key_pair`
    pub signer: Option<Arc<dyn Signer>>,
    pub create_if_missing: bool,
    /// Discard any stored state on open
    pub overwrite: bool,
    /// Sign the legacy signable layout
    pub legacy: bool,
    pub max_reorg_hints: usize,
    /// Oplog entries to accumulate before folding them into the header
    pub flush_interval: u64,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            signer: None,
            create_if_missing: true,
            overwrite: false,
            legacy: false,
            max_reorg_hints: 4,
            flush_interval: 4,
        }
    }
}

impl CoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_create_if_missing(mut self, create_if_missing: bool) -> Self {
        self.create_if_missing = create_if_missing;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_legacy(mut self, legacy: bool) -> Self {
        self.legacy = legacy;
        self
    }

    pub fn with_max_reorg_hints(mut self, max: usize) -> Self {
        self.max_reorg_hints = max;
        self
    }

    pub fn with_flush_interval(mut self, interval: u64) -> Self {
        self.flush_interval = interval.max(1);
        self
    }

    pub(crate) fn signable_format(&self) -> SignableFormat {
        if self.legacy {
            SignableFormat::Legacy
        } else {
            SignableFormat::Current
        }
    }
}

impl fmt::Debug for CoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreOptions")
            .field("key_pair", &self.key_pair)
            .field("signer", &self.signer.as_ref().map(|_| "<custom>"))
            .field("create_if_missing", &self.create_if_missing)
            .field("overwrite", &self.overwrite)
            .field("legacy", &self.legacy)
            .field("max_reorg_hints", &self.max_reorg_hints)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}
