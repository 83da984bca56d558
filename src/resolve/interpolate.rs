//! Expansion of `{{ ... }}` actions embedded in configuration strings.

use thiserror::Error;

use super::ResolveContext;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Errors raised while expanding a configuration string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum InterpolateError {
    /// An action was opened but never closed.
    #[error("unclosed action in \"{0}\"")]
    Unclosed(String),
    /// An action contained nothing but whitespace.
    #[error("empty action")]
    EmptyAction,
    /// The action names a function that does not exist.
    #[error("function \"{0}\" not defined")]
    UnknownFunction(String),
    /// The function was called with a missing or malformed argument.
    #[error("function \"{0}\" called with invalid arguments")]
    InvalidArguments(String),
    /// `user` referenced a variable missing from the context.
    #[error("user variable \"{0}\" is not defined")]
    UndefinedVariable(String),
}

/// Expands every action in `input` against the resolution context.
///
/// Supported actions are ``{{user `name`}}`` (also `{{user "name"}}`) and
/// `{{timestamp}}`.
///
/// # Errors
///
/// Returns [`InterpolateError`] for unclosed or empty actions, unknown
/// functions, malformed arguments, and undefined user variables.
pub fn interpolate(input: &str, context: &ResolveContext) -> Result<String, InterpolateError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(OPEN) {
        let (literal, tail) = rest.split_at(start);
        output.push_str(literal);

        let body = tail.strip_prefix(OPEN).unwrap_or(tail);
        let Some(end) = body.find(CLOSE) else {
            return Err(InterpolateError::Unclosed(input.to_owned()));
        };
        let (action, after) = body.split_at(end);
        output.push_str(&evaluate(action.trim(), context)?);
        rest = after.strip_prefix(CLOSE).unwrap_or(after);
    }

    output.push_str(rest);
    Ok(output)
}

fn evaluate(action: &str, context: &ResolveContext) -> Result<String, InterpolateError> {
    let (function, argument) = match action.split_once(char::is_whitespace) {
        Some((function, argument)) => (function, Some(argument.trim())),
        None => (action, None),
    };

    match (function, argument) {
        ("", _) => Err(InterpolateError::EmptyAction),
        ("timestamp", None) => Ok(context.timestamp().to_string()),
        ("user", Some(argument)) => {
            let name = unquote(argument)
                .ok_or_else(|| InterpolateError::InvalidArguments(String::from("user")))?;
            context
                .user_var(name)
                .map(str::to_owned)
                .ok_or_else(|| InterpolateError::UndefinedVariable(name.to_owned()))
        }
        ("timestamp" | "user", _) => Err(InterpolateError::InvalidArguments(function.to_owned())),
        (other, _) => Err(InterpolateError::UnknownFunction(other.to_owned())),
    }
}

fn unquote(argument: &str) -> Option<&str> {
    ['`', '"'].into_iter().find_map(|quote| {
        argument
            .strip_prefix(quote)
            .and_then(|inner| inner.strip_suffix(quote))
            .filter(|inner| !inner.contains(quote))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn context() -> ResolveContext {
        ResolveContext::new(1_700_000_000)
            .with_user_var("region", "dal05")
            .with_user_var("empty", "")
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("{{user `region`}}", "dal05")]
    #[case("{{ user \"region\" }}", "dal05")]
    #[case("dc-{{user `region`}}-x", "dc-dal05-x")]
    #[case("img-{{timestamp}}", "img-1700000000")]
    #[case("{{user `empty`}}", "")]
    #[case("a }} b", "a }} b")]
    fn expands_supported_actions(
        context: ResolveContext,
        #[case] input: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(interpolate(input, &context).as_deref(), Ok(expected));
    }

    #[rstest]
    #[case("{{user `missing`}}", InterpolateError::UndefinedVariable(String::from("missing")))]
    #[case("{{uuid}}", InterpolateError::UnknownFunction(String::from("uuid")))]
    #[case("{{  }}", InterpolateError::EmptyAction)]
    #[case("{{user}}", InterpolateError::InvalidArguments(String::from("user")))]
    #[case("{{user region}}", InterpolateError::InvalidArguments(String::from("user")))]
    #[case("{{timestamp 1}}", InterpolateError::InvalidArguments(String::from("timestamp")))]
    #[case("x {{user `region`", InterpolateError::Unclosed(String::from("x {{user `region`")))]
    fn rejects_invalid_actions(
        context: ResolveContext,
        #[case] input: &str,
        #[case] expected: InterpolateError,
    ) {
        assert_eq!(interpolate(input, &context), Err(expected));
    }
}
