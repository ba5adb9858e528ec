//! HMAC-signed transfer URLs for backends served by this process.
//!
//! A URL authorizes exactly one method on one key until its expiry. The
//! signature covers the method, bucket, key, expiry and (for uploads) the
//! content type, so none of them can be altered by the holder.

use crate::services::gateway::PresignMethod;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use urlencoding::encode;

type HmacSha256 = Hmac<Sha256>;

/// Route prefix under which presigned transfers are accepted.
pub const PRESIGNED_ROUTE: &str = "/_presigned";

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    bucket: String,
    base_url: String,
}

/// Query parameters carried by a presigned URL.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SignedParams {
    pub method: String,
    pub exp: i64,
    #[serde(default)]
    pub ct: Option<String>,
    pub sig: String,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, bucket: impl Into<String>, base_url: &str) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            bucket: bucket.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn sign(
        &self,
        key: &str,
        method: PresignMethod,
        ttl: Duration,
        content_type: Option<&str>,
    ) -> (String, DateTime<Utc>) {
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        let exp = expires_at.timestamp();
        let ct = content_type.unwrap_or("");
        let sig = URL_SAFE_NO_PAD.encode(self.mac(method.as_str(), key, exp, ct).finalize().into_bytes());

        let mut url = format!(
            "{}{}/{}?method={}&exp={exp}",
            self.base_url,
            PRESIGNED_ROUTE,
            encode_key(key),
            method.as_str()
        );
        if !ct.is_empty() {
            url.push_str("&ct=");
            url.push_str(&encode(ct));
        }
        url.push_str("&sig=");
        url.push_str(&sig);
        (url, expires_at)
    }

    /// Check signature and expiry. `method` is the HTTP method actually used.
    pub fn verify(&self, key: &str, method: PresignMethod, params: &SignedParams) -> bool {
        if PresignMethod::parse(&params.method) != Some(method) {
            return false;
        }
        if Utc::now().timestamp() > params.exp {
            return false;
        }
        let Ok(sig) = URL_SAFE_NO_PAD.decode(params.sig.as_bytes()) else {
            return false;
        };
        let ct = params.ct.as_deref().unwrap_or("");
        self.mac(method.as_str(), key, params.exp, ct)
            .verify_slice(&sig)
            .is_ok()
    }

    fn mac(&self, method: &str, key: &str, exp: i64, content_type: &str) -> HmacSha256 {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(
            format!("{method}\n{}\n{key}\n{exp}\n{content_type}", self.bucket).as_bytes(),
        );
        mac
    }
}

/// Percent-encode each key segment while keeping `/` separators readable.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
