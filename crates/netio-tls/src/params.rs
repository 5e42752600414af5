//! TLS/DTLS connection and config-building parameters (§6's builder
//! surface, the `TlsParams` part of it).

/// Parameters shared by both the TLS-over-TCP and DTLS-over-UDP engines:
/// ALPN preference list, client-side SNI names, a minimum TLS minor-version
/// floor, and an opt-in weak-cipher filter.
///
/// Mirrors the teacher's `with_*` builder idiom (`TcpSocketConfig::with_linger`).
#[derive(Clone, Debug)]
pub struct TlsParams {
    alpn: Vec<Vec<u8>>,
    sni: Vec<String>,
    min_minor_version: u8,
    disable_weak_ciphers: bool,
}

/// Default minimum TLS minor version: 2, i.e. TLS 1.2.
pub const DEFAULT_MIN_MINOR_VERSION: u8 = 2;

impl Default for TlsParams {
    fn default() -> Self {
        Self {
            alpn: Vec::new(),
            sni: Vec::new(),
            min_minor_version: DEFAULT_MIN_MINOR_VERSION,
            disable_weak_ciphers: false,
        }
    }
}

impl TlsParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn = protocols;
        self
    }

    pub fn with_sni(mut self, names: Vec<String>) -> Self {
        self.sni = names;
        self
    }

    pub fn with_min_minor_version(mut self, minor: u8) -> Self {
        self.min_minor_version = minor;
        self
    }

    pub fn with_disable_weak_ciphers(mut self, disable: bool) -> Self {
        self.disable_weak_ciphers = disable;
        self
    }

    pub fn alpn(&self) -> &[Vec<u8>] {
        &self.alpn
    }

    pub fn sni(&self) -> &[String] {
        &self.sni
    }

    pub fn min_minor_version(&self) -> u8 {
        self.min_minor_version
    }

    pub fn disable_weak_ciphers(&self) -> bool {
        self.disable_weak_ciphers
    }
}

/// Coarse substring heuristic for "weak" cipher-suite names (spec §9: "a
/// coarse policy... treat the substring list as an opaque parameter to
/// preserve behavior rather than redesigning it").
pub fn is_weak_cipher_name(name: &str) -> bool {
    name.contains("CBC")
        || name.contains("ECDH_")
        || name.contains("RENEGOTIATION")
        || name.starts_with("TLS_RSA_WITH_AES_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_cipher_heuristic_matches_documented_substrings() {
        assert!(is_weak_cipher_name("TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA"));
        assert!(is_weak_cipher_name("TLS_RSA_WITH_AES_128_GCM_SHA256"));
        assert!(!is_weak_cipher_name("TLS13_AES_128_GCM_SHA256"));
    }

    #[test]
    fn builder_defaults_match_spec() {
        let params = TlsParams::new();
        assert_eq!(params.min_minor_version(), DEFAULT_MIN_MINOR_VERSION);
        assert!(!params.disable_weak_ciphers());
        assert!(params.alpn().is_empty());
    }
}
