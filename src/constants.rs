// Runtime constants, loaded from the environment with sensible defaults.

use std::env;

// Use lazy_static to initialize static variables safely.
lazy_static::lazy_static! {
    pub static ref ENV_DIR: String = env::var("EASYPROMPT_ENV_DIR").unwrap_or_else(|_| "env".to_string());
    // EASYPROMPT_SESSIONS_DIR and EASYPROMPT_LANG are read by the CLI parser

    // OpenAI-compatible defaults point at DeepSeek
    pub static ref OPENAI_BASE_URL: String = env::var("EASYPROMPT_BASE_URL").unwrap_or_else(|_| "https://api.deepseek.com/v1".to_string());
    pub static ref OPENAI_MODEL: String = env::var("EASYPROMPT_MODEL").unwrap_or_else(|_| "deepseek-chat".to_string());
    pub static ref GEMINI_BASE_URL: String = env::var("EASYPROMPT_GEMINI_BASE_URL").unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());
    pub static ref GEMINI_MODEL: String = env::var("EASYPROMPT_GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());

    // A profile scoring at or above this is ready for the writer
    pub static ref SCORE_THRESHOLD: f32 = parse_or("EASYPROMPT_SCORE_THRESHOLD", 8.0);
    pub static ref EVALUATOR_CONCURRENCY: usize = parse_or("EASYPROMPT_EVALUATOR_CONCURRENCY", 4);
    pub static ref REQUEST_TIMEOUT_SECS: u64 = parse_or("EASYPROMPT_REQUEST_TIMEOUT_SECS", 120);
}

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
pub const DEFAULT_PORT: u16 = 8000;

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_on_missing_or_garbage() {
        assert_eq!(parse_or("EASYPROMPT_TEST_UNSET_KEY", 3u64), 3);
        std::env::set_var("EASYPROMPT_TEST_GARBAGE_KEY", "not-a-number");
        assert_eq!(parse_or("EASYPROMPT_TEST_GARBAGE_KEY", 7.5f32), 7.5);
        std::env::set_var("EASYPROMPT_TEST_GOOD_KEY", " 9 ");
        assert_eq!(parse_or("EASYPROMPT_TEST_GOOD_KEY", 1usize), 9);
    }
}
