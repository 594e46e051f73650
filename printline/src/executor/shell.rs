//! POSIX shell quoting for commands sent to the worker.

/// Quotes one argument for a POSIX shell.
///
/// Every argument is wrapped in single quotes; embedded single quotes become
/// `'\''`.
#[must_use]
pub fn quote_arg(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Quotes and joins a program and its arguments.
#[must_use]
pub fn quote_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_simple() {
        assert_eq!(quote_arg("ls"), "'ls'");
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn test_quote_metacharacters_are_inert() {
        assert_eq!(quote_arg("a b; rm -rf $HOME"), "'a b; rm -rf $HOME'");
    }

    #[test]
    fn test_quote_embedded_single_quote() {
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_quote_command() {
        let args = vec!["-c".to_string(), "ls OpenScan/scans".to_string()];
        assert_eq!(
            quote_command("smbclient", &args),
            "'smbclient' '-c' 'ls OpenScan/scans'"
        );
    }
}
