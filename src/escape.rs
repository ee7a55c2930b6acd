/// Characters that force a token into single quotes before it may appear in a
/// composed shell command line.
const SHELL_METACHARACTERS: &[char] = &[
    '|', '(', ')', '[', ']', '{', '}', ';', '\'', '"', '\\', '$', '`', '<', '>', '&', '*', '?',
];

/// Quote a single token so the shell treats it as one literal word.
///
/// Tokens without whitespace or metacharacters pass through unchanged. Everything
/// else is wrapped in single quotes; an embedded single quote closes the quote,
/// emits an escaped quote, and reopens it (`'\''`).
pub fn shell_escape(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }

    let needs_quoting = token
        .chars()
        .any(|c| c.is_whitespace() || SHELL_METACHARACTERS.contains(&c));
    if !needs_quoting {
        return token.to_string();
    }

    let mut escaped = String::with_capacity(token.len() + 2);
    escaped.push('\'');
    for c in token.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');
    escaped
}

/// Compose one shell command line from a program and its arguments.
///
/// Only the synchronous runner uses this; the streaming runner passes argument
/// vectors directly and never goes through a shell.
pub fn compose_command_line(program: &str, args: &[String]) -> String {
    let mut line = shell_escape(program);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_escape(arg));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::{compose_command_line, shell_escape};

    #[test]
    fn plain_tokens_pass_through() {
        assert_eq!(shell_escape("hello"), "hello");
        assert_eq!(shell_escape("--print"), "--print");
        assert_eq!(shell_escape("a/b/c.txt"), "a/b/c.txt");
    }

    #[test]
    fn whitespace_forces_quoting() {
        assert_eq!(shell_escape("two words"), "'two words'");
        assert_eq!(shell_escape("tab\there"), "'tab\there'");
    }

    #[test]
    fn embedded_single_quote_closes_and_reopens() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn empty_token_becomes_empty_quotes() {
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn metacharacters_round_trip_through_posix_splitter() {
        let tokens = [
            "plain",
            "two words",
            "semi;colon",
            "pipe|pipe",
            "dollar$HOME",
            "back`tick`",
            "red(parens)",
            "glob*?",
            "braces{a,b}",
            "brackets[0]",
            "it's quoted",
            "double\"quote",
            "back\\slash",
            "redirect<out>",
            "amper&sand",
        ];
        for token in tokens {
            let line = format!("echo {}", shell_escape(token));
            let split = shell_words::split(&line).expect("splittable line");
            assert_eq!(split, vec!["echo".to_string(), token.to_string()], "token: {token}");
        }
    }

    #[test]
    fn composed_line_preserves_argument_boundaries() {
        let args = vec!["--print".to_string(), "check the 'login' page".to_string()];
        let line = compose_command_line("claude", &args);
        let split = shell_words::split(&line).expect("splittable line");
        assert_eq!(
            split,
            vec![
                "claude".to_string(),
                "--print".to_string(),
                "check the 'login' page".to_string()
            ]
        );
    }
}
