//! Small helpers.

pub fn sanitize_symbol(sym: &str) -> String {
    sym.trim().to_uppercase()
}

/// Show only the first few characters of a credential.
pub fn mask_secret(s: &str) -> String {
    let head: String = s.chars().take(4).collect();
    format!("{head}***")
}

/// Truncate long text for logs and diagnostics.
pub fn snippet(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Float comparison for money assertions.
#[cfg(test)]
pub(crate) fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_trims_and_uppercases() {
        assert_eq!(sanitize_symbol("  brk.b "), "BRK.B");
    }

    #[test]
    fn mask_keeps_prefix_only() {
        assert_eq!(mask_secret("sk-abcdef123"), "sk-a***");
        assert_eq!(mask_secret("ab"), "ab***");
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        assert_eq!(snippet("héllo", 10), "héllo");
        assert_eq!(snippet("héllo", 2), "hé…");
    }
}
