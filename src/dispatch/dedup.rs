//! Ingest-time duplicate detection.
//!
//! Exactly one strategy applies to a submission. Without an image reference
//! the phone number is the identity and any earlier record with that phone
//! makes the new one a duplicate. With an image reference the
//! platform/platform-id pair is the identity, but those pairs get recycled,
//! so only a prior record at most [`PLATFORM_REPEAT_WINDOW_DAYS`] old counts.

use chrono::NaiveDateTime;

use crate::models::Platform;

pub const PLATFORM_REPEAT_WINDOW_DAYS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStrategy<'a> {
    Phone(&'a str),
    PlatformId {
        platform: Platform,
        platform_id: &'a str,
    },
    Unchecked,
}

impl<'a> DedupStrategy<'a> {
    pub fn choose(
        image_url: Option<&str>,
        phone: Option<&'a str>,
        platform: Platform,
        platform_id: Option<&'a str>,
    ) -> Self {
        let present = |value: Option<&'a str>| value.filter(|v| !v.trim().is_empty());
        let has_image = image_url.is_some_and(|url| !url.trim().is_empty());

        if !has_image {
            match present(phone) {
                Some(phone) => DedupStrategy::Phone(phone),
                None => DedupStrategy::Unchecked,
            }
        } else {
            match present(platform_id) {
                Some(platform_id) => DedupStrategy::PlatformId {
                    platform,
                    platform_id,
                },
                None => DedupStrategy::Unchecked,
            }
        }
    }

    /// Key used to serialise concurrent submissions that could collide.
    pub fn lock_key(&self) -> Option<String> {
        match self {
            DedupStrategy::Phone(phone) => Some(format!("phone:{phone}")),
            DedupStrategy::PlatformId {
                platform,
                platform_id,
            } => Some(format!("platform:{platform}:{platform_id}")),
            DedupStrategy::Unchecked => None,
        }
    }

    /// Decides the duplicate flag given the creation time of the most recent
    /// matching record, if any.
    pub fn is_duplicate(
        &self,
        prior_created_at: Option<NaiveDateTime>,
        now: NaiveDateTime,
    ) -> bool {
        match (self, prior_created_at) {
            (DedupStrategy::Unchecked, _) | (_, None) => false,
            (DedupStrategy::Phone(_), Some(_)) => true,
            (DedupStrategy::PlatformId { .. }, Some(prior)) => {
                age_in_whole_days(prior, now) <= PLATFORM_REPEAT_WINDOW_DAYS
            }
        }
    }
}

fn age_in_whole_days(earlier: NaiveDateTime, now: NaiveDateTime) -> i64 {
    (now - earlier).num_days().abs()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 20)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    #[test]
    fn phone_strategy_without_image() {
        let strategy = DedupStrategy::choose(None, Some("13800000001"), Platform::Douyin, None);
        assert_eq!(strategy, DedupStrategy::Phone("13800000001"));
    }

    #[test]
    fn platform_strategy_with_image_ignores_phone() {
        let strategy = DedupStrategy::choose(
            Some("https://img.example/a.jpg"),
            Some("13800000001"),
            Platform::Taobao,
            Some("X1"),
        );
        assert_eq!(
            strategy,
            DedupStrategy::PlatformId {
                platform: Platform::Taobao,
                platform_id: "X1"
            }
        );
    }

    #[test]
    fn blank_values_count_as_absent() {
        let strategy = DedupStrategy::choose(Some("  "), Some(""), Platform::Xianyu, Some("X1"));
        assert_eq!(strategy, DedupStrategy::Unchecked);
        let strategy = DedupStrategy::choose(
            Some("https://a/b.png"),
            None,
            Platform::Xianyu,
            Some(" "),
        );
        assert_eq!(strategy, DedupStrategy::Unchecked);
    }

    #[test]
    fn any_prior_phone_record_is_a_duplicate() {
        let strategy = DedupStrategy::Phone("13800000001");
        assert!(strategy.is_duplicate(Some(now()), now()));
        assert!(strategy.is_duplicate(Some(now() - Duration::days(400)), now()));
        assert!(!strategy.is_duplicate(None, now()));
    }

    #[test]
    fn platform_repeat_counts_only_inside_window() {
        let strategy = DedupStrategy::PlatformId {
            platform: Platform::Taobao,
            platform_id: "X1",
        };
        assert!(strategy.is_duplicate(Some(now() - Duration::days(2)), now()));
        let edge = now() - Duration::days(3) - Duration::hours(23);
        assert!(strategy.is_duplicate(Some(edge), now()));
        assert!(!strategy.is_duplicate(Some(now() - Duration::days(4)), now()));
        assert!(!strategy.is_duplicate(Some(now() - Duration::days(5)), now()));
    }

    #[test]
    fn unchecked_is_never_duplicate() {
        assert!(!DedupStrategy::Unchecked.is_duplicate(Some(now()), now()));
        assert_eq!(DedupStrategy::Unchecked.lock_key(), None);
    }

    #[test]
    fn lock_keys_separate_strategies() {
        assert_eq!(
            DedupStrategy::Phone("13800000001").lock_key().as_deref(),
            Some("phone:13800000001")
        );
        assert_eq!(
            DedupStrategy::PlatformId {
                platform: Platform::Douyin,
                platform_id: "abc"
            }
            .lock_key()
            .as_deref(),
            Some("platform:douyin:abc")
        );
    }
}
