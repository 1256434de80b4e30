//! Delimiter tokens spoken by the helper and payload-cleaning helpers.

/// End of a helper response.
pub const EOO: &str = "!!EOO!!";

/// Helper-reported error inside a response.
pub const ERR: &str = "!!ERR!!";

/// The helper is blocked on a stdin read and asks for a newline.
pub const SENTINEL: &str = "!!__SENTINEL__!!";

/// The helper failed to parse a streamed JSON frame; benign notice.
pub const JSON_DECODE_ERROR: &str = "!!JSONDecodeError!!";

/// Prefix marking a single-candidate tab completion.
pub const SIMPLE_AUTO_COMP: &str = "!!SIMPLE_AUTO_COMP!!";

/// Banner printed by the helper right before it dies on an uncaught error.
pub const EXCEPTION: &str = "!!Exception!!";

/// Longest token that may straddle a chunk boundary while output is being
/// streamed to a follow callback. Streaming emitters hold back this many
/// bytes minus one so a split token is never delivered to a caller.
pub const MAX_TOKEN_LEN: usize = SIMPLE_AUTO_COMP.len();

const CLEANED_TOKENS: [&str; 4] = [EOO, ERR, SENTINEL, JSON_DECODE_ERROR];

/// Strip every delimiter token from a payload destined for a caller.
///
/// Callers must never observe `!!EOO!!`, `!!ERR!!`, `!!__SENTINEL__!!` or
/// `!!JSONDecodeError!!` in returned text.
pub fn clean_payload(payload: &str) -> String {
    let mut cleaned = payload.to_string();
    for token in CLEANED_TOKENS {
        if cleaned.contains(token) {
            cleaned = cleaned.replace(token, "");
        }
    }
    cleaned
}

/// Remove every occurrence of `token` from `buffer`, returning how many
/// were removed.
pub fn strip_token(buffer: &mut String, token: &str) -> usize {
    let mut count = 0;
    while let Some(pos) = buffer.find(token) {
        buffer.replace_range(pos..pos + token.len(), "");
        count += 1;
    }
    count
}

/// Lines the helper prints while waiting for the device to reappear after a
/// reset. These are noise and skipped during the post-reset listen phase.
pub fn is_boot_wait_notice(line: &str) -> bool {
    line.contains("Waiting") && line.contains("seconds for pyboard")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_removes_all_delimiters() {
        let raw = format!("hello{ERR}\nworld{EOO}{SENTINEL}{JSON_DECODE_ERROR}!");
        assert_eq!(clean_payload(&raw), "hello\nworld!");
    }

    #[test]
    fn clean_leaves_ordinary_bangs_alone() {
        assert_eq!(clean_payload("print('hi!!')"), "print('hi!!')");
    }

    #[test]
    fn strip_token_counts_occurrences() {
        let mut buf = format!("a{SENTINEL}b{SENTINEL}c");
        assert_eq!(strip_token(&mut buf, SENTINEL), 2);
        assert_eq!(buf, "abc");
    }

    #[test]
    fn boot_wait_notice_requires_both_fragments() {
        assert!(is_boot_wait_notice("Waiting 5 seconds for pyboard to boot"));
        assert!(!is_boot_wait_notice("Waiting for input"));
        assert!(!is_boot_wait_notice("3 seconds for pyboard"));
    }
}
