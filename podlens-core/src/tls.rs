use rustls::crypto::{aws_lc_rs, CryptoProvider};
use std::sync::OnceLock;
use tracing::debug;

static PROVIDER: OnceLock<bool> = OnceLock::new();

/// Both the kube client and the Prometheus HTTP client negotiate TLS through
/// rustls, which refuses to pick a crypto provider on its own. Returns true
/// when a process-wide provider is in place afterwards.
pub(crate) fn install_rustls_provider() -> bool {
    *PROVIDER.get_or_init(|| {
        if CryptoProvider::get_default().is_some() {
            debug!("rustls crypto provider already installed");
            return true;
        }
        match aws_lc_rs::default_provider().install_default() {
            Ok(()) => {
                debug!("Installed aws-lc-rs as the rustls crypto provider");
                true
            }
            // Lost a race with another installer; whatever won is usable.
            Err(_) => CryptoProvider::get_default().is_some(),
        }
    })
}
