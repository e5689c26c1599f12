//! Short per-user tokens standing in for post slugs in button data.
//!
//! Telegram caps callback data at 64 bytes while a slug may be 128 characters,
//! so list-row buttons carry a token and the slug is looked up on press.

use std::collections::HashMap;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Bidirectional slug/token map for one user.
#[derive(Debug, Default, Clone)]
pub struct SlugTokens {
    by_slug: HashMap<String, String>,
    by_token: HashMap<String, String>,
    next: u64,
}

impl SlugTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `slug`, issuing a new one the first time it is seen.
    pub fn token_for(&mut self, slug: &str) -> String {
        if let Some(token) = self.by_slug.get(slug) {
            return token.clone();
        }
        self.next += 1;
        let token = base36(self.next);
        self.by_slug.insert(slug.to_string(), token.clone());
        self.by_token.insert(token.clone(), slug.to_string());
        token
    }

    pub fn slug(&self, token: &str) -> Option<&str> {
        self.by_token.get(token).map(String::as_str)
    }
}

fn base36(mut n: u64) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(DIGITS[(n % 36) as usize] as char);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    digits.iter().rev().collect()
}
