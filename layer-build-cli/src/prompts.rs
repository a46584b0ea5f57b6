use std::io::{self, BufRead, IsTerminal, Write};

use crate::commands::CliError;

/// Fail unless questions can be answered on a terminal.
pub fn require_terminal() -> Result<(), CliError> {
    if !io::stdin().is_terminal() {
        return Err(CliError::NotATerminal);
    }
    Ok(())
}

/// Ask `question` on the terminal. An empty answer takes `default`.
pub fn ask(question: &str, default: Option<&str>) -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    ask_with(&mut input, &mut io::stderr(), question, default)
}

pub fn ask_with(
    input: &mut impl BufRead,
    output: &mut impl Write,
    question: &str,
    default: Option<&str>,
) -> Result<Option<String>, CliError> {
    match default {
        Some(default) => write!(output, "{} [{}]: ", question, default)?,
        None => write!(output, "{}: ", question)?,
    }
    output.flush()?;

    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        return Err(CliError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("no answer to '{}'", question),
        )));
    }
    let answer = answer.trim();
    if answer.is_empty() {
        Ok(default.map(str::to_string))
    } else {
        Ok(Some(answer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn answer_wins_over_default() {
        let mut out = Vec::new();
        let answer =
            ask_with(&mut Cursor::new("vendor\n"), &mut out, "Layer", Some("oss")).unwrap();
        assert_eq!(answer.as_deref(), Some("vendor"));
        assert_eq!(String::from_utf8(out).unwrap(), "Layer [oss]: ");
    }

    #[test]
    fn empty_answer_takes_default() {
        let mut out = Vec::new();
        assert_eq!(
            ask_with(
                &mut Cursor::new("  \n"),
                &mut out,
                "Target",
                Some("raspberrypi4-64"),
            )
            .unwrap(),
            Some("raspberrypi4-64".to_string())
        );
        assert_eq!(
            ask_with(&mut Cursor::new("\n"), &mut out, "Manifest branch", None).unwrap(),
            None
        );
    }

    #[test]
    fn closed_input_is_an_error() {
        let mut out = Vec::new();
        assert!(matches!(
            ask_with(&mut Cursor::new(""), &mut out, "Layer", None),
            Err(CliError::Io(_))
        ));
    }
}
