//! Environment variable interpolation for config values.
//!
//! Server `env` maps and HTTP `headers` may reference the parent
//! process environment with either `${VAR}` or the PowerShell-style
//! `$env:VAR`. Unresolved references become empty strings.

/// Interpolate `${VAR}` and `$env:VAR` references in `input`.
///
/// The `lookup` closure supplies variable values, which keeps the
/// function pure for tests; production callers pass
/// `|name| std::env::var(name).ok()`.
pub fn interpolate<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            let ch = input[i..].chars().next().unwrap_or('\u{fffd}');
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }

        // ${VAR}
        if input[i..].starts_with("${") {
            if let Some(end) = input[i + 2..].find('}') {
                let name = &input[i + 2..i + 2 + end];
                out.push_str(&lookup(name).unwrap_or_default());
                i += 2 + end + 1;
                continue;
            }
            // Unterminated brace: emit literally.
            out.push('$');
            i += 1;
            continue;
        }

        // $env:VAR
        if input[i..].starts_with("$env:") {
            let rest = &input[i + 5..];
            let len = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .map(|c| c.len_utf8())
                .sum::<usize>();
            if len > 0 {
                let name = &rest[..len];
                out.push_str(&lookup(name).unwrap_or_default());
                i += 5 + len;
                continue;
            }
        }

        out.push('$');
        i += 1;
    }

    out
}

/// Interpolate against the real process environment.
pub fn interpolate_os(input: &str) -> String {
    interpolate(input, |name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "HOME" => Some("/home/pi".into()),
            "TOKEN" => Some("s3cret".into()),
            _ => None,
        }
    }

    #[test]
    fn braced_form() {
        assert_eq!(interpolate("${HOME}/bin", lookup), "/home/pi/bin");
        assert_eq!(interpolate("a=${TOKEN};b=${TOKEN}", lookup), "a=s3cret;b=s3cret");
    }

    #[test]
    fn powershell_form() {
        assert_eq!(interpolate("$env:HOME/bin", lookup), "/home/pi/bin");
        assert_eq!(interpolate("Bearer $env:TOKEN", lookup), "Bearer s3cret");
    }

    #[test]
    fn unresolved_becomes_empty() {
        assert_eq!(interpolate("${MISSING}", lookup), "");
        assert_eq!(interpolate("x$env:MISSINGy", lookup), "x");
        assert_eq!(interpolate("pre-${MISSING}-post", lookup), "pre--post");
    }

    #[test]
    fn literal_dollar_passthrough() {
        assert_eq!(interpolate("$5.00", lookup), "$5.00");
        assert_eq!(interpolate("a$", lookup), "a$");
        assert_eq!(interpolate("${unterminated", lookup), "${unterminated");
    }

    #[test]
    fn no_substitution_needed() {
        assert_eq!(interpolate("plain value", lookup), "plain value");
        assert_eq!(interpolate("", lookup), "");
    }

    #[test]
    fn env_name_stops_at_non_word_char() {
        assert_eq!(interpolate("$env:TOKEN:extra", lookup), "s3cret:extra");
    }
}
