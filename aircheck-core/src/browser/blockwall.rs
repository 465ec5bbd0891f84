use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ChallengeSection;

use super::launcher::SessionPage;

/// Why a page was judged blocked. The category feeds session metadata so
/// operators can tell a captcha wall from a plain 403 page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    CaptchaChallenge,
    HumanCheck,
    AccessDenied,
    RateLimited,
    ChallengeMarker,
}

impl BlockCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockCategory::CaptchaChallenge => "captcha_challenge",
            BlockCategory::HumanCheck => "human_check",
            BlockCategory::AccessDenied => "access_denied",
            BlockCategory::RateLimited => "rate_limited",
            BlockCategory::ChallengeMarker => "challenge_marker",
        }
    }
}

impl fmt::Display for BlockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockVerdict {
    pub category: BlockCategory,
    pub detail: String,
}

const CAPTCHA_PHRASES: &[&str] = &["captcha", "recaptcha", "hcaptcha", "prove you're not a robot"];

const HUMAN_CHECK_PHRASES: &[&str] = &[
    "verify you are human",
    "are you a robot",
    "checking your browser",
    "just a moment",
    "enable javascript and cookies",
];

const ACCESS_DENIED_PHRASES: &[&str] = &[
    "access denied",
    "attention required",
    "forbidden",
    "not available in your region",
];

const RATE_LIMIT_PHRASES: &[&str] = &["unusual traffic", "too many requests", "rate limit"];

/// Pure content classifier: phrase matching over the page title and visible
/// body text. Returns `None` when nothing looks like a block wall.
pub fn classify_content(title: &str, body: &str) -> Option<BlockVerdict> {
    let haystack = format!("{} {}", title.to_lowercase(), body.to_lowercase());
    let groups: [(&[&str], BlockCategory); 4] = [
        (CAPTCHA_PHRASES, BlockCategory::CaptchaChallenge),
        (HUMAN_CHECK_PHRASES, BlockCategory::HumanCheck),
        (RATE_LIMIT_PHRASES, BlockCategory::RateLimited),
        (ACCESS_DENIED_PHRASES, BlockCategory::AccessDenied),
    ];
    for (phrases, category) in groups {
        for phrase in phrases {
            if haystack.contains(phrase) {
                return Some(BlockVerdict {
                    category,
                    detail: format!("matched phrase '{phrase}'"),
                });
            }
        }
    }
    None
}

/// Inspects a live page for block walls. Read failures count as blocked:
/// a page that will not yield its title or body is treated as hostile
/// rather than silently recorded.
pub async fn scan_page(page: &dyn SessionPage, challenge: &ChallengeSection) -> Option<BlockVerdict> {
    let title = match page.title().await {
        Ok(title) => title,
        Err(err) => {
            return Some(BlockVerdict {
                category: BlockCategory::ChallengeMarker,
                detail: format!("title read failed: {err}"),
            })
        }
    };
    let body = match page.body_text().await {
        Ok(body) => body,
        Err(err) => {
            return Some(BlockVerdict {
                category: BlockCategory::ChallengeMarker,
                detail: format!("body read failed: {err}"),
            })
        }
    };

    if let Some(verdict) = classify_content(&title, &body) {
        return Some(verdict);
    }

    for selector in challenge
        .frame_selectors
        .iter()
        .chain(challenge.marker_selectors.iter())
    {
        if page.has_element(selector).await {
            debug!(selector, "challenge marker present");
            return Some(BlockVerdict {
                category: BlockCategory::ChallengeMarker,
                detail: format!("matched selector '{selector}'"),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_pages_pass() {
        assert_eq!(classify_content("Live Stream", "Now playing: morning show"), None);
        assert_eq!(classify_content("", ""), None);
    }

    #[test]
    fn captcha_pages_are_flagged() {
        let verdict =
            classify_content("Verification", "please solve the reCAPTCHA below").expect("verdict");
        assert_eq!(verdict.category, BlockCategory::CaptchaChallenge);
    }

    #[test]
    fn human_checks_are_flagged_from_title_alone() {
        let verdict = classify_content("Just a moment...", "").expect("verdict");
        assert_eq!(verdict.category, BlockCategory::HumanCheck);
    }

    #[test]
    fn rate_limits_win_over_access_denied_wording() {
        let verdict = classify_content(
            "Error",
            "unusual traffic detected from your network, access denied",
        )
        .expect("verdict");
        assert_eq!(verdict.category, BlockCategory::RateLimited);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let verdict = classify_content("ACCESS DENIED", "").expect("verdict");
        assert_eq!(verdict.category, BlockCategory::AccessDenied);
    }
}
