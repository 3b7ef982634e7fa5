//! Request signing for private Kraken Futures endpoints.
//!
//! `Authent = base64(HMAC-SHA512(base64decode(secret), SHA256(postData + nonce + path)))`
//! where `path` is the endpoint path with the `/derivatives` prefix removed.

use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::domain::Timestamp;
use crate::SyncError;

type HmacSha512 = Hmac<Sha512>;

/// Nonce counter wraps at this value; five decimal digits are appended to the millis.
const NONCE_COUNTER_MODULUS: u32 = 100_000;

/// API key pair. `Debug` never prints either half.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    public_key: String,
    secret_key: String,
}

impl Credentials {
    pub fn new(public_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("public_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Headers attached to a signed request.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub api_key: String,
    pub authent: String,
    pub nonce: String,
}

impl AuthHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("APIKey", self.api_key.as_str()),
            ("Authent", self.authent.as_str()),
            ("Nonce", self.nonce.as_str()),
        ]
    }
}

impl Debug for AuthHeaders {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeaders")
            .field("api_key", &"<redacted>")
            .field("authent", &"<redacted>")
            .field("nonce", &self.nonce)
            .finish()
    }
}

type MillisClock = Box<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Default)]
struct NonceState {
    issued: bool,
    base_millis: i64,
    counter: u32,
}

/// Produces strictly increasing nonces of the form `<millis><counter:05>`.
///
/// Safe to share across tasks: issuance is serialized by an internal mutex. When the
/// counter wraps within one millisecond the millis component is advanced past the last
/// issued value, so ordering holds even under a frozen clock.
pub struct NonceGenerator {
    clock: MillisClock,
    state: Mutex<NonceState>,
}

impl NonceGenerator {
    pub fn system() -> Self {
        Self::with_clock(|| Timestamp::now().as_millis())
    }

    pub fn with_clock(clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            state: Mutex::new(NonceState::default()),
        }
    }

    pub fn next_nonce(&self) -> String {
        let now = (self.clock)();
        let mut state = self
            .state
            .lock()
            .expect("nonce state should not be poisoned");

        if !state.issued {
            state.issued = true;
            state.base_millis = now;
            state.counter = 0;
        } else if state.counter + 1 >= NONCE_COUNTER_MODULUS {
            state.counter = 0;
            state.base_millis = now.max(state.base_millis + 1);
        } else {
            state.counter += 1;
            state.base_millis = now.max(state.base_millis);
        }

        format!("{}{:05}", state.base_millis, state.counter)
    }
}

impl Debug for NonceGenerator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceGenerator").finish_non_exhaustive()
    }
}

/// Signs private requests with a decoded secret and a shared nonce generator.
pub struct Signer {
    api_key: String,
    secret: Vec<u8>,
    nonces: NonceGenerator,
}

impl Signer {
    pub fn new(credentials: &Credentials) -> Result<Self, SyncError> {
        Self::with_nonce_generator(credentials, NonceGenerator::system())
    }

    pub fn with_nonce_generator(
        credentials: &Credentials,
        nonces: NonceGenerator,
    ) -> Result<Self, SyncError> {
        if credentials.public_key.trim().is_empty() {
            return Err(SyncError::AuthConfiguration(String::from(
                "API key cannot be empty",
            )));
        }

        let secret = STANDARD
            .decode(credentials.secret_key.trim())
            .map_err(|_| {
                SyncError::AuthConfiguration(String::from("API secret is not valid base64"))
            })?;
        if secret.is_empty() {
            return Err(SyncError::AuthConfiguration(String::from(
                "API secret decodes to zero bytes",
            )));
        }

        Ok(Self {
            api_key: credentials.public_key.clone(),
            secret,
            nonces,
        })
    }

    /// Signs `post_data` for `path`, consuming one nonce.
    pub fn sign(&self, post_data: &str, path: &str) -> AuthHeaders {
        let nonce = self.nonces.next_nonce();
        let authent = self.signature(post_data, &nonce, path);
        AuthHeaders {
            api_key: self.api_key.clone(),
            authent,
            nonce,
        }
    }

    /// Deterministic signature for an explicit nonce.
    pub fn signature(&self, post_data: &str, nonce: &str, path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(post_data.as_bytes());
        hasher.update(nonce.as_bytes());
        hasher.update(signing_path(path).as_bytes());
        let digest = hasher.finalize();

        let mut mac =
            HmacSha512::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(&digest);
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

impl Debug for Signer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Path used in the signature: the request path without its `/derivatives` prefix.
pub fn signing_path(path: &str) -> &str {
    path.strip_prefix("/derivatives").unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";

    fn signer() -> Signer {
        Signer::with_nonce_generator(
            &Credentials::new("public", SECRET),
            NonceGenerator::with_clock(|| 1_700_000_000_000),
        )
        .expect("valid credentials")
    }

    #[test]
    fn when_inputs_repeat_signature_is_identical() {
        let signer = signer();
        let first = signer.signature("count=500", "170000000000000000", "/api/history/v2/executions");
        let second = signer.signature("count=500", "170000000000000000", "/api/history/v2/executions");

        assert_eq!(first, second);
        let decoded = STANDARD.decode(&first).expect("base64 output");
        assert_eq!(decoded.len(), 64);
    }

    #[test]
    fn when_any_input_changes_signature_changes() {
        let signer = signer();
        let base = signer.signature("count=500", "1", "/api/v3/openpositions");

        assert_ne!(base, signer.signature("count=501", "1", "/api/v3/openpositions"));
        assert_ne!(base, signer.signature("count=500", "2", "/api/v3/openpositions"));
        assert_ne!(base, signer.signature("count=500", "1", "/api/v3/tickers"));
    }

    #[test]
    fn derivatives_prefix_is_not_part_of_the_signed_path() {
        let signer = signer();

        assert_eq!(signing_path("/derivatives/api/v3/openpositions"), "/api/v3/openpositions");
        assert_eq!(
            signer.signature("", "7", "/derivatives/api/v3/openpositions"),
            signer.signature("", "7", "/api/v3/openpositions")
        );
    }

    #[test]
    fn when_secret_is_not_base64_signer_is_rejected() {
        let err = Signer::new(&Credentials::new("public", "not base64!!")).expect_err("must fail");
        assert!(matches!(err, SyncError::AuthConfiguration(_)));

        let err = Signer::new(&Credentials::new("public", "")).expect_err("must fail");
        assert!(matches!(err, SyncError::AuthConfiguration(_)));

        let err = Signer::new(&Credentials::new("  ", SECRET)).expect_err("must fail");
        assert!(matches!(err, SyncError::AuthConfiguration(_)));
    }

    #[test]
    fn sign_attaches_key_and_fresh_nonce() {
        let signer = signer();
        let first = signer.sign("", "/api/v3/openpositions");
        let second = signer.sign("", "/api/v3/openpositions");

        assert_eq!(first.api_key, "public");
        assert_eq!(first.nonce, "170000000000000000");
        assert_eq!(second.nonce, "170000000000000001");
        assert_eq!(
            first.authent,
            signer.signature("", &first.nonce, "/api/v3/openpositions")
        );
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let credentials = Credentials::new("public-key-value", SECRET);
        let rendered = format!("{credentials:?} {:?}", signer());

        assert!(!rendered.contains("public-key-value"));
        assert!(!rendered.contains(SECRET));
    }

    #[test]
    fn frozen_clock_nonces_stay_strictly_increasing_across_counter_wrap() {
        let generator = NonceGenerator::with_clock(|| 1_700_000_000_000);
        let mut previous: u128 = 0;

        for _ in 0..(NONCE_COUNTER_MODULUS as usize + 10) {
            let nonce: u128 = generator.next_nonce().parse().expect("numeric nonce");
            assert!(nonce > previous, "nonce {nonce} must exceed {previous}");
            previous = nonce;
        }
    }

    #[test]
    fn clock_moving_backwards_does_not_reorder_nonces() {
        let ticks = std::sync::atomic::AtomicI64::new(1_700_000_000_500);
        let generator = NonceGenerator::with_clock(move || {
            ticks.fetch_sub(100, std::sync::atomic::Ordering::SeqCst)
        });

        let first: u128 = generator.next_nonce().parse().expect("numeric");
        let second: u128 = generator.next_nonce().parse().expect("numeric");
        assert!(second > first);
    }

    #[test]
    fn concurrent_signers_never_share_a_nonce() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 20_000;
        let generator = std::sync::Arc::new(NonceGenerator::with_clock(|| 1_700_000_000_000));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let generator = std::sync::Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| generator.next_nonce().parse::<u128>().expect("numeric nonce"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            let nonces = handle.join().expect("signing thread panicked");
            assert!(nonces.windows(2).all(|pair| pair[0] < pair[1]));
            seen.extend(nonces);
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}
