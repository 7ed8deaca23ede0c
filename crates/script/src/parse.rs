use sandpool::CallKind;
use serde_json::{Map, Value};

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("unknown statement `{0}`")]
    UnknownStatement(String),

    #[error("expected {0}")]
    Expected(&'static str),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Declare(CallKind, String),
    Globals(Expr),
    Let(String, Expr),
    Expr(Expr),
    Return(Option<Expr>),
    Throw(Expr),
    Sleep(u64),
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// JSON text, `$name` placeholders still in place.
    Literal(String),
    /// One capability call; `args` is an argument-list literal.
    Call { target: String, args: String },
    /// Concurrent calls; `args` is a literal list of argument lists.
    All { target: String, args: String },
}

pub fn statement(line: &str) -> Result<Statement, ParseError> {
    let (head, rest) = split_word(line);
    Ok(match head {
        "declare" => {
            let (kind, name) = split_word(rest);
            let kind = match kind {
                "sync" => CallKind::Sync,
                "async" => CallKind::Async,
                _ => return Err(ParseError::Expected("`sync` or `async`")),
            };
            Statement::Declare(kind, identifier(name)?.to_string())
        }
        "globals" => Statement::Globals(expr(rest)?),
        "let" => {
            let Some((name, value)) = rest.split_once('=') else {
                return Err(ParseError::Expected("`=`"));
            };
            Statement::Let(identifier(name.trim())?.to_string(), expr(value)?)
        }
        "return" if rest.is_empty() => Statement::Return(None),
        "return" => Statement::Return(Some(expr(rest)?)),
        "throw" => Statement::Throw(expr(rest)?),
        "sleep" => Statement::Sleep(
            rest.parse()
                .map_err(|_| ParseError::Expected("milliseconds"))?,
        ),
        "abort" if rest.is_empty() => Statement::Abort,
        _ => Statement::Expr(expr(line)?),
    })
}

pub fn expr(text: &str) -> Result<Expr, ParseError> {
    let text = text.trim();
    let (head, rest) = split_word(text);
    match head {
        "call" | "all" => {
            let (target, args) = split_word(rest);
            let target = identifier(target)?.to_string();
            let args = if args.is_empty() { "[]" } else { args }.to_string();
            Ok(if head == "call" {
                Expr::Call { target, args }
            } else {
                Expr::All { target, args }
            })
        }
        "" => Err(ParseError::Expected("an expression")),
        _ if looks_like_json(text) => Ok(Expr::Literal(text.to_string())),
        _ => Err(ParseError::UnknownStatement(head.to_string())),
    }
}

/// Replace `$name` outside string literals with the JSON of `vars[name]`,
/// or `null` when unbound, then parse.
pub fn literal(text: &str, vars: &Map<String, Value>) -> Result<Value, ParseError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '$' => {
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    out.push('$');
                } else {
                    out.push_str(&vars.get(&name).map_or_else(|| "null".to_string(), Value::to_string));
                }
            }
            _ => out.push(c),
        }
    }
    Ok(serde_json::from_str(&out)?)
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    text.split_once(char::is_whitespace)
        .map_or((text, ""), |(head, rest)| (head, rest.trim()))
}

fn identifier(name: &str) -> Result<&str, ParseError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(ParseError::Expected("a name"))
    }
}

fn looks_like_json(text: &str) -> bool {
    text.starts_with(['{', '[', '"', '-', '$'])
        || text.starts_with(|c: char| c.is_ascii_digit())
        || matches!(text, "true" | "false" | "null")
}

#[cfg(test)]
mod tests {
    use sandpool::CallKind;
    use serde_json::{Map, json};

    use super::{Expr, Statement, literal, statement};

    #[test]
    fn statements() {
        assert_eq!(
            statement("declare async fetch").expect("declare"),
            Statement::Declare(CallKind::Async, "fetch".to_string())
        );
        assert_eq!(
            statement("let sum = call add [2, 3]").expect("let"),
            Statement::Let(
                "sum".to_string(),
                Expr::Call {
                    target: "add".to_string(),
                    args: "[2, 3]".to_string()
                }
            )
        );
        assert_eq!(statement("return").expect("return"), Statement::Return(None));
        assert_eq!(statement("sleep 25").expect("sleep"), Statement::Sleep(25));
        assert!(statement("frobnicate 1").is_err());
        assert!(statement("declare maybe x").is_err());
    }

    #[test]
    fn substitution_skips_strings() {
        let mut vars = Map::new();
        vars.insert("a".to_string(), json!({"b": [1]}));
        let value = literal(r#"[$a, "$a", $missing, "q\"$a"]"#, &vars).expect("literal");
        assert_eq!(value, json!([{"b": [1]}, "$a", null, "q\"$a"]));
        assert_eq!(literal("$a", &vars).expect("bare"), json!({"b": [1]}));
    }
}
