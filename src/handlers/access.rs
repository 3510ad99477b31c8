use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::{info, warn};

use crate::config::CONFIG;

static GENERATE_LIMITER: Lazy<RateLimiter> =
    Lazy::new(|| RateLimiter::new(Duration::from_secs(CONFIG.rate_limit_seconds)));
static WHITELIST: Lazy<Option<Whitelist>> = Lazy::new(|| Whitelist::load(&CONFIG.whitelist_file_path));

/// Per-user cooldown. A rejected attempt does not restart the window.
pub struct RateLimiter {
    window: Duration,
    last_seen: Mutex<HashMap<i64, Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        RateLimiter {
            window,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_at(&self, user_id: i64, now: Instant) -> bool {
        let mut last_seen = self.last_seen.lock();
        if let Some(last) = last_seen.get(&user_id) {
            if now.duration_since(*last) < self.window {
                return true;
            }
        }
        last_seen.insert(user_id, now);
        false
    }

    pub fn is_limited(&self, user_id: i64) -> bool {
        self.check_at(user_id, Instant::now())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whitelist {
    ids: HashSet<String>,
}

impl Whitelist {
    /// One id per line; blank lines and `#` comments are ignored.
    pub fn parse(content: &str) -> Self {
        let ids = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Whitelist { ids }
    }

    fn load(path: &str) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let whitelist = Whitelist::parse(&content);
                info!("Loaded whitelist file {} ({} entries)", path, whitelist.ids.len());
                Some(whitelist)
            }
            Err(err) => {
                warn!("Whitelist file {} not found or failed to read: {}", path, err);
                None
            }
        }
    }

    pub fn allows(&self, user_id: i64, chat_id: i64) -> bool {
        self.ids.contains(&user_id.to_string()) || self.ids.contains(&chat_id.to_string())
    }
}

pub fn load_whitelist() {
    Lazy::force(&WHITELIST);
}

pub fn is_rate_limited(user_id: i64) -> bool {
    GENERATE_LIMITER.is_limited(user_id)
}

fn command_is_controlled(controlled: &[String], command: &str) -> bool {
    controlled.iter().any(|entry| entry == command)
}

pub fn message_user_id(message: &Message) -> i64 {
    message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
        .unwrap_or_default()
}

/// Without a whitelist file every chat is allowed.
pub fn is_access_allowed(command: &str, user_id: i64, chat_id: i64) -> bool {
    if !command_is_controlled(&CONFIG.access_controlled_commands, command) {
        return true;
    }
    match WHITELIST.as_ref() {
        None => true,
        Some(whitelist) => whitelist.allows(user_id, chat_id),
    }
}

pub async fn check_access_control(bot: &Bot, message: &Message, command: &str) -> bool {
    if is_access_allowed(command, message_user_id(message), message.chat.id.0) {
        return true;
    }

    let _ = bot
        .send_message(
            message.chat.id,
            "You are not authorized to use this command. Please contact the administrator.",
        )
        .reply_parameters(ReplyParameters::new(message.id))
        .await;
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_ignores_comments_and_blank_lines() {
        let whitelist = Whitelist::parse("# admins\n12345\n\n  -100200 \n");

        assert!(whitelist.allows(12345, 1));
        assert!(whitelist.allows(1, -100200));
        assert!(!whitelist.allows(1, 2));
    }

    #[test]
    fn rate_limiter_blocks_within_window() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let start = Instant::now();

        assert!(!limiter.check_at(7, start));
        assert!(limiter.check_at(7, start + Duration::from_secs(3)));
        assert!(!limiter.check_at(8, start + Duration::from_secs(3)));
        assert!(!limiter.check_at(7, start + Duration::from_secs(11)));
    }

    #[test]
    fn only_listed_commands_are_controlled() {
        let controlled = vec!["generate".to_string()];

        assert!(command_is_controlled(&controlled, "generate"));
        assert!(!command_is_controlled(&controlled, "items"));
        assert!(!command_is_controlled(&[], "generate"));
    }
}
