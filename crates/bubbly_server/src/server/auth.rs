#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bubbly_domain::UserId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use crate::config::SecretString;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Numeric user id.
	pub sub: String,
	/// Expiry, Unix seconds.
	pub exp: u64,
}

impl AuthClaims {
	pub fn user_id(&self) -> anyhow::Result<UserId> {
		self.sub.parse().context("token subject is not a user id")
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Resolve the caller; anything short of a valid token is anonymous.
pub fn authenticate(token: Option<&str>, secret: Option<&SecretString>) -> Option<UserId> {
	let token = token.map(str::trim).filter(|t| !t.is_empty())?;
	let secret = secret?;

	match verify_hmac_token(token, secret.expose()).and_then(|claims| claims.user_id()) {
		Ok(user) => Some(user),
		Err(e) => {
			debug!(error = %e, "rejecting access token");
			None
		}
	}
}

/// Mint a token; issuance belongs to the accounts service, this is for local tooling and tests.
pub fn issue_hmac_token(user: UserId, exp: u64, secret: &str) -> anyhow::Result<String> {
	let claims = AuthClaims {
		sub: user.to_string(),
		exp,
	};
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).context("encode token claims")?);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
