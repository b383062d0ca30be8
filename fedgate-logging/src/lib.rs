use std::fmt;

use fedgate_core::err::Result;
pub use env_logger::{init, init_from_env};
pub use log::*;

/// Configures the logger for this gateway node
pub fn init_logging() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    Ok(())
}

/// Logging init function for tests
pub fn init_for_tests() {
    let res = env_logger::builder()
        .filter_module("fedgate", LevelFilter::Trace)
        .is_test(true)
        .try_init();
    if let Err(err) = res {
        eprintln!("Failed to init logging: {}", err);
    }
}

/// Runs a teardown-style operation where failure must not propagate.
/// The failure is logged against the caller-supplied context string.
pub fn best_effort<T>(what: &str, res: Result<T>) -> Option<T> {
    match res {
        Ok(val) => Some(val),
        Err(err) => {
            warn!("{}: {:?}", what, err);
            None
        }
    }
}

/// Abbreviates text for a log line, keeping at most `max_chars` characters.
///
/// Rewritten queries and payload previews can run to megabytes; log lines
/// must not. Truncation counts characters, so multi-byte text is never cut
/// mid-sequence.
pub fn abbrev(text: &str, max_chars: usize) -> Abbreviated<'_> {
    Abbreviated { text, max_chars }
}

pub struct Abbreviated<'a> {
    text: &'a str,
    max_chars: usize,
}

impl fmt::Display for Abbreviated<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.text.char_indices().nth(self.max_chars) {
            Some((cut, _)) => {
                let omitted = self.text[cut..].chars().count();
                write!(f, "{} ...({} more chars)", &self.text[..cut], omitted)
            }
            None => write!(f, "{}", self.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging() {
        let res = init_logging();

        assert!(res.is_ok());
    }

    #[test]
    fn test_best_effort_swallows_errors() {
        let ok = best_effort("should pass", Ok(1));
        assert_eq!(ok, Some(1));

        let failed: Option<()> =
            best_effort("should log", Err(fedgate_core::err::anyhow!("boom")));
        assert_eq!(failed, None);
    }

    #[test]
    fn test_abbrev_within_bounds() {
        assert_eq!(abbrev("SELECT 1", 50).to_string(), "SELECT 1");
        assert_eq!(abbrev("SELECT 1", 8).to_string(), "SELECT 1");
    }

    #[test]
    fn test_abbrev_truncates() {
        assert_eq!(
            abbrev("SELECT * FROM t WHERE x = 1", 8).to_string(),
            "SELECT * ...(19 more chars)"
        );
    }

    #[test]
    fn test_abbrev_never_splits_multibyte_text() {
        // the limit lands in the middle of the accented characters
        let text = "SELECT * FROM 'mcp://café/données.csv'";
        let out = abbrev(text, 22).to_string();

        assert!(out.starts_with("SELECT * FROM 'mcp://c"));
        assert!(out.contains("more chars"));

        // every cut point is safe
        for limit in 0..text.chars().count() + 1 {
            let _ = abbrev(text, limit).to_string();
        }
    }

    #[test]
    fn test_abbrev_zero_limit() {
        assert_eq!(abbrev("abc", 0).to_string(), " ...(3 more chars)");
    }
}
