use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use sqlx::SqlitePool;

use crate::db::models::{Application, Channel, Notification, Priority, User};
use crate::db::repository::NotificationRepository;

/// Reasons a notification can be rejected by policy, in evaluation order.
/// Every rejection is terminal: it does not consume a retry attempt, it
/// moves the record straight to `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRejection {
    UserDisabledChannel,
    UserDND,
    QuietHours,
    CategoryDisabled,
    UserDailyLimit,
    AppEmailLimit,
    RateLimit,
}

impl PolicyRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyRejection::UserDisabledChannel => "UserDisabledChannel",
            PolicyRejection::UserDND => "UserDND",
            PolicyRejection::QuietHours => "QuietHours",
            PolicyRejection::CategoryDisabled => "CategoryDisabled",
            PolicyRejection::UserDailyLimit => "UserDailyLimit",
            PolicyRejection::AppEmailLimit => "AppEmailLimit",
            PolicyRejection::RateLimit => "RateLimit",
        }
    }
}

/// Per-app-per-hour token bucket. Process-wide, lifecycle tied to process
/// start/stop — no cross-process coordination.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_second: f64,
    last_refill: std::time::Instant,
}

impl TokenBucket {
    fn new(capacity_per_hour: u32) -> Self {
        let capacity = capacity_per_hour as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_second: capacity / 3600.0,
            last_refill: std::time::Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = std::time::Instant::now();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

static RATE_LIMIT_BUCKETS: Lazy<Mutex<HashMap<String, TokenBucket>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn channel_explicitly_disabled(prefs: &crate::db::models::UserPreferences, channel: Channel) -> bool {
    let flag = match channel {
        Channel::Email => prefs.email_enabled,
        Channel::Push => prefs.push_enabled,
        Channel::Sms => prefs.sms_enabled,
        Channel::Webhook => prefs.webhook_enabled,
        Channel::Sse => prefs.sse_enabled,
        Channel::InApp => prefs.in_app_enabled,
    };
    flag == Some(false)
}

/// Parses "HH:MM" into a `NaiveTime`; malformed config is treated as
/// disabling quiet hours rather than panicking.
fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

fn is_within_quiet_hours(start: NaiveTime, end: NaiveTime, now: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        // Wraps across midnight, e.g. 22:00-06:00.
        now >= start || now < end
    }
}

pub struct PolicyEvaluator;

impl PolicyEvaluator {
    /// Runs the full ordered gate: channel toggle, DND, quiet hours,
    /// category, per-user daily cap, app email cap, app rate limit.
    /// Returns `Ok(())` if admitted, `Err(rejection)` with the first rule
    /// that rejected it.
    pub async fn evaluate(
        pool: &SqlitePool,
        app: &Application,
        user: &User,
        notification: &Notification,
    ) -> Result<(), PolicyRejection> {
        let prefs = user.preferences();
        let channel = notification.channel();
        let priority = notification.priority();

        // 1. Channel toggle.
        if channel_explicitly_disabled(&prefs, channel) {
            return Err(PolicyRejection::UserDisabledChannel);
        }

        // 2. DND, exempting critical priority.
        if prefs.dnd && priority != Priority::Critical {
            return Err(PolicyRejection::UserDND);
        }

        // 3. Quiet hours, exempting critical priority.
        if prefs.quiet_hours.enabled && priority != Priority::Critical {
            if let (Some(start), Some(end)) = (
                parse_hhmm(&prefs.quiet_hours.start),
                parse_hhmm(&prefs.quiet_hours.end),
            ) {
                let tz: Tz = user.timezone.parse().unwrap_or(chrono_tz::UTC);
                let local_now = Utc::now().with_timezone(&tz).time();
                if is_within_quiet_hours(start, end, local_now) {
                    return Err(PolicyRejection::QuietHours);
                }
            }
        }

        // 4. Category gate, if the notification metadata carries one.
        if let Some(category) = notification.metadata().get("category").and_then(|v| v.as_str()) {
            if let Some(pref) = prefs.categories.get(category) {
                if !pref.enabled || !pref.channels.iter().any(|c| c == channel.as_str()) {
                    return Err(PolicyRejection::CategoryDisabled);
                }
            }
        }

        // 5. Per-user daily cap (0 means no cap).
        if prefs.daily_limit > 0 {
            let sent_today = NotificationRepository::count_sent_today(pool, &user.id)
                .await
                .unwrap_or(0);
            if sent_today >= prefs.daily_limit {
                return Err(PolicyRejection::UserDailyLimit);
            }
        }

        // 6. App daily email cap (email channel only).
        if channel == Channel::Email {
            let settings = app.settings();
            let sent_today = NotificationRepository::count_emails_sent_today(pool, &app.id)
                .await
                .unwrap_or(0);
            if sent_today >= settings.daily_email_limit {
                return Err(PolicyRejection::AppEmailLimit);
            }
        }

        // 7. App rate limit: token bucket per app per hour.
        let settings = app.settings();
        let mut buckets = RATE_LIMIT_BUCKETS.lock().unwrap();
        let bucket = buckets
            .entry(app.id.clone())
            .or_insert_with(|| TokenBucket::new(settings.rate_limit_per_hour));
        if !bucket.try_take() {
            return Err(PolicyRejection::RateLimit);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_hours_wraps_midnight() {
        let start = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        let at_2330 = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        assert!(is_within_quiet_hours(start, end, at_2330));

        let at_noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert!(!is_within_quiet_hours(start, end, at_noon));
    }

    #[test]
    fn quiet_hours_non_wrapping_window() {
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        let at_noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        assert!(is_within_quiet_hours(start, end, at_noon));

        let at_evening = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        assert!(!is_within_quiet_hours(start, end, at_evening));
    }

    #[test]
    fn token_bucket_exhausts_then_refills() {
        let mut bucket = TokenBucket::new(1);
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }
}
