//! Command-line assembly for Windows process creation.
//!
//! `CreateProcessW` takes a single string which the child splits back into
//! arguments with the MSVCRT rules. [`join_windows`] produces a string that
//! round-trips through those rules. On Unix arguments are passed as a vector
//! and none of this applies, but the quoting is also what the launcher logs.

/// Quotes and joins arguments the way `CommandLineToArgvW` will split them.
pub fn join_windows<'a, I>(args: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut line = String::new();
    for (i, arg) in args.into_iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        append_arg(&mut line, arg);
    }
    line
}

fn needs_quotes(arg: &str) -> bool {
    arg.is_empty() || arg.contains(|ch| matches!(ch, ' ' | '\t' | '\n' | '\x0b' | '"'))
}

fn append_arg(line: &mut String, arg: &str) {
    if !needs_quotes(arg) {
        line.push_str(arg);
        return;
    }

    line.push('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                // every preceding backslash and the quote itself get escaped
                push_backslashes(line, backslashes * 2 + 1);
                line.push('"');
                backslashes = 0;
            }
            other => {
                push_backslashes(line, backslashes);
                line.push(other);
                backslashes = 0;
            }
        }
    }
    // trailing backslashes would escape the closing quote
    push_backslashes(line, backslashes * 2);
    line.push('"');
}

fn push_backslashes(line: &mut String, count: usize) {
    line.extend(std::iter::repeat('\\').take(count));
}

#[cfg(test)]
mod tests {
    use super::join_windows;

    #[test]
    fn plain_arguments_are_untouched() {
        assert_eq!(
            join_windows(vec!["java.exe", "-Xmx2g", "-cp", "a.jar;b.jar"]),
            r"java.exe -Xmx2g -cp a.jar;b.jar"
        );
    }

    #[test]
    fn arguments_with_whitespace_are_quoted() {
        assert_eq!(
            join_windows(vec![r"C:\Program Files\Java\bin\java.exe", "hello world"]),
            r#""C:\Program Files\Java\bin\java.exe" "hello world""#
        );
        assert_eq!(join_windows(vec!["a\tb"]), "\"a\tb\"");
    }

    #[test]
    fn empty_argument_is_kept() {
        assert_eq!(join_windows(vec!["-cp", "", "Main"]), r#"-cp "" Main"#);
    }

    #[test]
    fn embedded_quotes_are_escaped() {
        assert_eq!(join_windows(vec![r#"say "hi""#]), r#""say \"hi\"""#);
        assert_eq!(join_windows(vec![r#"a\"b"#]), r#""a\\\"b""#);
    }

    #[test]
    fn trailing_backslashes_are_doubled_only_when_quoted() {
        assert_eq!(join_windows(vec![r"C:\dir\"]), r"C:\dir\");
        assert_eq!(join_windows(vec![r"C:\my dir\"]), r#""C:\my dir\\""#);
    }
}
