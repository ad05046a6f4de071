//! Deterministic classification of automation-session crashes.
//!
//! The automation server reports an instrumentation crash only through its
//! error text, so classification is a case-insensitive substring match against
//! a fixed signature list. An error that matches none of them is treated as an
//! ordinary step failure and does not trigger a session restart.

/// Lowercase fragments of known automation-session crash messages.
pub const CRASH_SIGNATURES: &[&str] = &[
    "instrumentation process is not running",
    "instrumentation process crashed",
    "cannot be proxied to uiautomator2 server",
    "uiautomator2 server is not running",
    "could not proxy command to the remote server",
    "a session is either terminated or not started",
    "uiautomation not connected",
    "socket hang up",
    "econnrefused",
    "econnreset",
];

/// Returns true iff the error text contains a known crash signature.
pub fn is_crash(error: &str) -> bool {
    let lowered = error.to_lowercase();
    CRASH_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

/// The signature matched by `error`, if any.
pub fn matched_signature(error: &str) -> Option<&'static str> {
    let lowered = error.to_lowercase();
    CRASH_SIGNATURES
        .iter()
        .copied()
        .find(|signature| lowered.contains(signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_signature_is_lowercase() {
        for signature in CRASH_SIGNATURES {
            assert_eq!(*signature, signature.to_lowercase());
        }
    }

    #[test]
    fn classify_matches_case_insensitively() {
        assert!(is_crash(concat!(
            "An unknown server-side error occurred: ",
            "'Instrumentation process is not running (probably crashed)'"
        )));
        assert!(is_crash("connect ECONNREFUSED 127.0.0.1:8200"));
        assert_eq!(
            matched_signature("Socket Hang Up while tapping"),
            Some("socket hang up")
        );
    }

    #[test]
    fn classify_ignores_ordinary_failures() {
        assert!(!is_crash("element not found"));
        assert!(!is_crash(""));
        assert_eq!(matched_signature("tap timed out"), None);
    }
}
