//! `${VAR}` expansion in raw config text, applied before parsing.

/// Replace `${ENV_VAR}` placeholders in config text.
///
/// Unresolvable variables are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Replace `${ENV_VAR}` placeholders using a custom lookup function.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();
        let mut name = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            name.push(c);
        }
        match (closed, lookup(&name)) {
            (true, Some(value)) if !name.is_empty() => result.push_str(&value),
            (true, _) => {
                result.push_str("${");
                result.push_str(&name);
                result.push('}');
            },
            (false, _) => {
                result.push_str("${");
                result.push_str(&name);
            },
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home(name: &str) -> Option<String> {
        (name == "HOME_FOR_TEST").then(|| "/home/ci".to_string())
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_env_with("dir = \"${HOME_FOR_TEST}/creds\"", home),
            "dir = \"/home/ci/creds\""
        );
    }

    #[test]
    fn leaves_unknown_and_unterminated() {
        assert_eq!(substitute_env_with("${NOPE} and ${", home), "${NOPE} and ${");
        assert_eq!(substitute_env_with("${}", home), "${}");
    }

    #[test]
    fn plain_dollars_untouched() {
        assert_eq!(substitute_env("cost = \"$5\""), "cost = \"$5\"");
    }
}
