//! Heuristic detection of GCC dependency files.
//!
//! Make-style depfiles carry absolute paths, so serving one written on
//! another machine poisons the build. A body counts as a depfile when it is
//! small enough to plausibly be one and contains the make-rule fragment
//! `.o: \`. Both the 100000-byte threshold and the literal pattern are part
//! of the proxy's contract with its clients.

const MAX_DEPFILE_LEN: usize = 100_000;
const RULE_FRAGMENT: &[u8] = b".o: \\";

/// Whether a response body should be treated as a GCC depfile.
pub fn is_gcc_depfile(body: &[u8]) -> bool {
    body.len() <= MAX_DEPFILE_LEN
        && body
            .windows(RULE_FRAGMENT.len())
            .any(|window| window == RULE_FRAGMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_body_with_rule_fragment_matches() {
        assert!(is_gcc_depfile(b".o: \\\nmain.c"));
        assert!(is_gcc_depfile(b"out/main.o: \\\n  /usr/include/stdio.h"));
    }

    #[test]
    fn fragment_must_be_exact() {
        assert!(!is_gcc_depfile(b"main.o:\\"));
        assert!(!is_gcc_depfile(b"main.o: /usr/include/stdio.h"));
        assert!(!is_gcc_depfile(b""));
    }

    #[test]
    fn threshold_is_one_hundred_thousand_bytes() {
        let mut body = vec![b'x'; MAX_DEPFILE_LEN - RULE_FRAGMENT.len()];
        body.extend_from_slice(RULE_FRAGMENT);
        assert_eq!(body.len(), 100_000);
        assert!(is_gcc_depfile(&body));

        body.push(b'x');
        assert!(!is_gcc_depfile(&body));
    }

    #[test]
    fn fragment_is_found_anywhere_in_the_body() {
        assert!(is_gcc_depfile(b"prefix junk main.o: \\"));
    }
}
