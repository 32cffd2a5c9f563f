//! Authentication Module
//!
//! Phone-number login with one-time passwords. Codes are six digits, kept
//! only as SHA-256 digests until they expire or are used, and handed to an
//! [`SmsGateway`] for delivery.

use crate::clock::Clock;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix used for numbers supplied without a country code.
pub const DEFAULT_COUNTRY_CODE: &str = "+91";

/// Outbound SMS delivery.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<()>;
}

/// Writes codes to the log instead of sending them. Development only.
#[derive(Debug, Default)]
pub struct LogSmsGateway;

#[async_trait]
impl SmsGateway for LogSmsGateway {
    async fn send(&self, to: &str, body: &str) -> Result<()> {
        info!("[SMS] to {}: {}", to, body);
        Ok(())
    }
}

/// The number an SMS is actually sent to.
pub fn sms_destination(phone: &str) -> String {
    let phone = phone.trim();
    if phone.starts_with('+') {
        phone.to_string()
    } else {
        format!("{}{}", DEFAULT_COUNTRY_CODE, phone)
    }
}

/// Display name from the optional name parts, skipping empty ones.
pub fn display_name(first: Option<&str>, middle: Option<&str>, last: Option<&str>) -> String {
    [first, middle, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn digest(code: &str) -> String {
    format!("{:x}", Sha256::digest(code.as_bytes()))
}

struct PendingOtp {
    digest: String,
    expires_at: DateTime<Utc>,
}

pub struct OtpManager {
    gateway: Arc<dyn SmsGateway>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    /// phone -> outstanding code
    pending: Mutex<HashMap<String, PendingOtp>>,
}

impl OtpManager {
    pub fn new(gateway: Arc<dyn SmsGateway>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            gateway,
            clock,
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a code for `phone` and send it. A new code replaces any
    /// outstanding one.
    pub async fn issue(&self, phone: &str) -> Result<()> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(Error::ValidationFailed("phone is required".into()));
        }

        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.pending.lock().insert(
            phone.to_string(),
            PendingOtp {
                digest: digest(&code),
                expires_at,
            },
        );

        let body = format!("Your verification code is {}", code);
        if let Err(e) = self.gateway.send(&sms_destination(phone), &body).await {
            warn!("OTP delivery to {} failed: {}", phone, e);
            self.pending.lock().remove(phone);
            return Err(match e {
                Error::SmsUnavailable(_) => e,
                other => Error::SmsUnavailable(other.to_string()),
            });
        }
        debug!("OTP issued for {}, expires {}", phone, expires_at);
        Ok(())
    }

    /// Check `code` for `phone`. A correct code is consumed; a wrong one
    /// leaves the outstanding code in place until it expires.
    pub fn verify(&self, phone: &str, code: &str) -> Result<()> {
        let phone = phone.trim();
        let now = self.clock.now();
        let mut pending = self.pending.lock();

        let Some(entry) = pending.get(phone) else {
            return Err(Error::InvalidOtp);
        };
        if entry.expires_at <= now {
            pending.remove(phone);
            return Err(Error::InvalidOtp);
        }
        if entry.digest != digest(code.trim()) {
            return Err(Error::InvalidOtp);
        }

        pending.remove(phone);
        info!("OTP verified for {}", phone);
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Outbox {
        fn last_code(&self) -> String {
            let sent = self.sent.lock();
            let (_, body) = sent.last().unwrap();
            body.rsplit(' ').next().unwrap().to_string()
        }
    }

    #[async_trait]
    impl SmsGateway for Outbox {
        async fn send(&self, to: &str, body: &str) -> Result<()> {
            self.sent.lock().push((to.to_string(), body.to_string()));
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl SmsGateway for Down {
        async fn send(&self, _to: &str, _body: &str) -> Result<()> {
            Err(Error::SmsUnavailable("provider down".into()))
        }
    }

    fn manager(gateway: Arc<dyn SmsGateway>) -> (OtpManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let otp = OtpManager::new(gateway, clock.clone(), Duration::seconds(300));
        (otp, clock)
    }

    #[test]
    fn test_destination_and_display_name() {
        assert_eq!(sms_destination("9876543210"), "+919876543210");
        assert_eq!(sms_destination("+15550001111"), "+15550001111");
        assert_eq!(
            display_name(Some("Asha"), Some(" "), Some("Rao")),
            "Asha Rao"
        );
        assert_eq!(display_name(Some("Asha"), None, None), "Asha");
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let outbox = Arc::new(Outbox::default());
        let (otp, _) = manager(outbox.clone());

        otp.issue("9876543210").await.unwrap();
        let code = outbox.last_code();
        assert_eq!(code.len(), 6);
        assert_eq!(outbox.sent.lock()[0].0, "+919876543210");

        assert!(matches!(otp.verify("9876543210", "not-it"), Err(Error::InvalidOtp)));
        otp.verify("9876543210", &code).unwrap();
        assert!(matches!(otp.verify("9876543210", &code), Err(Error::InvalidOtp)));
    }

    #[tokio::test]
    async fn test_expired_code_is_rejected() {
        let outbox = Arc::new(Outbox::default());
        let (otp, clock) = manager(outbox.clone());

        otp.issue("555").await.unwrap();
        let code = outbox.last_code();
        clock.advance(Duration::seconds(300));
        assert!(matches!(otp.verify("555", &code), Err(Error::InvalidOtp)));
        assert_eq!(otp.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow_expiry() {
        let outbox = Arc::new(Outbox::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let otp = OtpManager::new(outbox.clone(), clock.clone(), Duration::milliseconds(i64::MAX));

        otp.issue("555").await.unwrap();
        clock.advance(Duration::days(365));
        otp.verify("555", &outbox.last_code()).unwrap();
    }

    #[tokio::test]
    async fn test_failed_delivery_discards_code() {
        let (otp, _) = manager(Arc::new(Down));
        assert!(matches!(otp.issue("555").await, Err(Error::SmsUnavailable(_))));
        assert_eq!(otp.outstanding(), 0);
        assert!(matches!(otp.issue("  ").await, Err(Error::ValidationFailed(_))));
    }
}
