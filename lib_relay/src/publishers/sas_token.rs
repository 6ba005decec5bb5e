//! Shared access signature tokens for the event hub REST endpoint.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of a locally signed token.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Signing failures.
#[derive(Debug, Error)]
pub enum SasError {
    /// The key could not initialise the MAC.
    #[error("shared access key cannot be used as an HMAC key")]
    InvalidKey,
}

/// Signs `resource_uri` with a policy key.
///
/// Produces
/// `SharedAccessSignature sr=<enc uri>&sig=<enc b64 hmac>&se=<expiry>&skn=<key name>`
/// where the MAC covers `<enc uri>\n<expiry>` and `expiry` is in Unix seconds.
pub fn generate_sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expiry: i64,
) -> Result<String, SasError> {
    let encoded_uri = encode(&resource_uri.to_lowercase());
    let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| SasError::InvalidKey)?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
        encoded_uri,
        encode(&signature),
        expiry,
        encode(key_name)
    ))
}

/// Expiry for a token issued at `now_unix`.
pub fn expiry_from(now_unix: i64, lifetime: Duration) -> i64 {
    now_unix + lifetime.as_secs() as i64
}

fn encode(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
