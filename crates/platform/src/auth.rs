//! Tenant access-token cache.
//!
//! Outbound platform calls authenticate with a short-lived bearer token.
//! The cache refreshes it ahead of expiry behind a double-checked write
//! lock so at most one refresh is ever in flight, and degrades to a stale
//! (but not yet hard-expired) token when the refresh endpoint misbehaves.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use cf_domain::error::{Error, Result};

use crate::util::from_reqwest;

/// Refresh this long before the stored expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
/// Safety margin subtracted when storing the upstream-reported expiry.
const STORE_MARGIN_SECS: u64 = 300;
/// Floor for the upstream-reported lifetime.
const MIN_REPORTED_SECS: u64 = 7200;

#[derive(Clone)]
struct TokenEntry {
    token: String,
    expires_at: Instant,
}

impl TokenEntry {
    /// Fresh enough to hand out without I/O.
    fn is_fresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN < self.expires_at
    }

    /// Past the refresh margin but still before the hard expiry, so it
    /// remains usable when a refresh fails.
    fn is_usable(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Compute the stored lifetime from the upstream-reported one.
fn stored_lifetime(reported_secs: u64) -> Duration {
    Duration::from_secs(reported_secs.max(MIN_REPORTED_SECS) - STORE_MARGIN_SECS)
}

#[derive(Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default)]
    expire: u64,
}

pub struct TokenCache {
    endpoint: String,
    app_id: String,
    app_secret: String,
    client: reqwest::Client,
    entry: RwLock<Option<TokenEntry>>,
}

impl TokenCache {
    pub fn new(base_url: &str, app_id: &str, app_secret: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            endpoint: format!(
                "{}/auth/v3/tenant_access_token/internal",
                base_url.trim_end_matches('/')
            ),
            app_id: app_id.to_owned(),
            app_secret: app_secret.to_owned(),
            client,
            entry: RwLock::new(None),
        })
    }

    /// Return a valid bearer token, refreshing if needed.
    ///
    /// Readers take the shared lock; the refresh path takes the exclusive
    /// lock and re-validates before issuing I/O, so concurrent callers
    /// trigger exactly one refresh.
    pub async fn get_token(&self) -> Result<String> {
        {
            let entry = self.entry.read().await;
            if let Some(cached) = entry.as_ref() {
                if cached.is_fresh() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let mut entry = self.entry.write().await;
        if let Some(cached) = entry.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.token.clone());
            }
        }

        match self.refresh().await {
            Ok(fresh) => {
                let token = fresh.token.clone();
                *entry = Some(fresh);
                Ok(token)
            }
            Err(err) => {
                // The endpoint failed but the old token has not hard-
                // expired yet: keep serving it and log.
                if let Some(cached) = entry.as_ref() {
                    if cached.is_usable() {
                        tracing::warn!(error = %err, "token refresh failed, serving stale token");
                        return Ok(cached.token.clone());
                    }
                }
                Err(err)
            }
        }
    }

    async fn refresh(&self) -> Result<TokenEntry> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret,
            }))
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("token endpoint status {status}: {body}")));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| Error::Auth(format!("token response decode: {e}")))?;
        if parsed.code != 0 {
            return Err(Error::Auth(format!(
                "token endpoint code {}: {}",
                parsed.code, parsed.msg
            )));
        }

        tracing::debug!(expire = parsed.expire, "access token refreshed");
        Ok(TokenEntry {
            token: parsed.tenant_access_token,
            expires_at: Instant::now() + stored_lifetime(parsed.expire),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_lifetime_applies_margin_and_floor() {
        // Reported lifetimes below the floor are raised to it first.
        assert_eq!(stored_lifetime(0), Duration::from_secs(7200 - 300));
        assert_eq!(stored_lifetime(3600), Duration::from_secs(7200 - 300));
        assert_eq!(stored_lifetime(86400), Duration::from_secs(86400 - 300));
    }

    #[test]
    fn freshness_windows() {
        let fresh = TokenEntry {
            token: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        };
        assert!(fresh.is_fresh());
        assert!(fresh.is_usable());

        // Inside the refresh margin: stale but still usable.
        let stale = TokenEntry {
            token: "t".into(),
            expires_at: Instant::now() + Duration::from_secs(60),
        };
        assert!(!stale.is_fresh());
        assert!(stale.is_usable());

        let expired = TokenEntry {
            token: "t".into(),
            expires_at: Instant::now(),
        };
        assert!(!expired.is_fresh());
        assert!(!expired.is_usable());
    }

    #[test]
    fn token_response_decodes() {
        let parsed: TokenResponse = serde_json::from_str(
            r#"{"code":0,"msg":"ok","tenant_access_token":"t-abc","expire":7200}"#,
        )
        .unwrap();
        assert_eq!(parsed.code, 0);
        assert_eq!(parsed.tenant_access_token, "t-abc");
        assert_eq!(parsed.expire, 7200);
    }

    #[tokio::test]
    async fn unreachable_endpoint_with_no_cache_is_an_error() {
        let cache = TokenCache::new("http://127.0.0.1:1", "app", "secret").unwrap();
        assert!(cache.get_token().await.is_err());
    }
}
