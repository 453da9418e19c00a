//! Glob matching for variable and application name patterns: `*` matches any (possibly empty)
//!  sequence, `?` matches exactly one character. Everything else matches literally.

pub fn wildcard_match(pattern: &str, s: &str) -> bool {
    let pattern = pattern.as_bytes();
    let s = s.as_bytes();

    let mut p_idx = 0;
    let mut s_idx = 0;

    // position after the most recent '*' in the pattern, and the position in `s` to retry from
    let mut backtrack: Option<(usize, usize)> = None;

    while s_idx < s.len() {
        if p_idx < pattern.len() && (pattern[p_idx] == b'?' || pattern[p_idx] == s[s_idx]) {
            p_idx += 1;
            s_idx += 1;
        }
        else if p_idx < pattern.len() && pattern[p_idx] == b'*' {
            p_idx += 1;
            if p_idx == pattern.len() {
                return true;
            }
            backtrack = Some((p_idx, s_idx + 1));
        }
        else if let Some((star_p, star_s)) = backtrack {
            p_idx = star_p;
            s_idx = star_s;
            backtrack = Some((star_p, star_s + 1));
        }
        else {
            return false;
        }
    }

    pattern[p_idx..].iter().all(|&c| c == b'*')
}
