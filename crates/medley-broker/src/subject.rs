//! Dot-token subject matching with `*` (one token) and `>` (tail) wildcards.

/// Does `subject` match `filter`?
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens
/// and is only meaningful as the final filter token.
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let mut filter_tokens = filter.split('.');
    let mut subject_tokens = subject.split('.').peekable();

    loop {
        match (filter_tokens.next(), subject_tokens.peek()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {
                subject_tokens.next();
            }
            (Some(want), Some(&have)) => {
                if want != have {
                    return false;
                }
                subject_tokens.next();
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(subject_matches("playback.plex.start", "playback.plex.start"));
        assert!(!subject_matches("playback.plex.start", "playback.plex.stop"));
    }

    #[test]
    fn tail_wildcard() {
        assert!(subject_matches("playback.>", "playback.plex.start"));
        assert!(subject_matches("playback.>", "playback.poison.analytics"));
        assert!(!subject_matches("playback.>", "playback"));
        assert!(!subject_matches("playback.>", "library.plex.scan"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(subject_matches("playback.*.start", "playback.plex.start"));
        assert!(!subject_matches("playback.*.start", "playback.plex.child.start"));
        assert!(!subject_matches("playback.*.start", "playback.start"));
    }

    #[test]
    fn filter_longer_than_subject() {
        assert!(!subject_matches("playback.plex.start.extra", "playback.plex.start"));
    }
}
