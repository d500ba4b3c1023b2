//! Tokenizer for the expression language.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    Comma,
    Dot,
}

/// Tokenize an expression source string.
///
/// # Errors
///
/// Returns [`ExprError::Lex`] on unexpected characters, unterminated
/// strings, or malformed numbers.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        match ch {
            c if c.is_whitespace() => pos += 1,
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                pos += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                pos += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    pos += 2;
                } else {
                    return Err(lex_error(pos, "expected '==' (assignment is not supported)"));
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    pos += 2;
                } else {
                    tokens.push(Token::Bang);
                    pos += 1;
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Lte);
                    pos += 2;
                } else {
                    tokens.push(Token::Lt);
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Gte);
                    pos += 2;
                } else {
                    tokens.push(Token::Gt);
                    pos += 1;
                }
            }
            '&' => {
                if chars.get(pos + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    pos += 2;
                } else {
                    return Err(lex_error(pos, "expected '&&'"));
                }
            }
            '|' => {
                if chars.get(pos + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    pos += 2;
                } else {
                    return Err(lex_error(pos, "expected '||'"));
                }
            }
            '\'' | '"' => {
                let (text, consumed) = read_string(&chars, pos, ch)?;
                tokens.push(Token::Str(text));
                pos += consumed;
            }
            c if c.is_ascii_digit() => {
                let (number, consumed) = read_number(&chars, pos)?;
                tokens.push(Token::Number(number));
                pos += consumed;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(lex_error(pos, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

fn lex_error(position: usize, message: impl Into<String>) -> ExprError {
    ExprError::Lex {
        position,
        message: message.into(),
    }
}

fn read_string(chars: &[char], start: usize, quote: char) -> Result<(String, usize), ExprError> {
    let mut text = String::new();
    let mut pos = start + 1;
    while pos < chars.len() {
        match chars[pos] {
            c if c == quote => return Ok((text, pos - start + 1)),
            '\\' => {
                let escaped = chars
                    .get(pos + 1)
                    .ok_or_else(|| lex_error(pos, "dangling escape"))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                pos += 2;
            }
            other => {
                text.push(other);
                pos += 1;
            }
        }
    }
    Err(lex_error(start, "unterminated string literal"))
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), ExprError> {
    let mut pos = start;
    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    // Fractional part: a dot followed by a digit. A bare dot is path syntax.
    if pos < chars.len()
        && chars[pos] == '.'
        && chars.get(pos + 1).is_some_and(char::is_ascii_digit)
    {
        pos += 1;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    let text: String = chars[start..pos].iter().collect();
    let number = text
        .parse::<f64>()
        .map_err(|_| lex_error(start, format!("malformed number '{text}'")))?;
    Ok((number, pos - start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_arithmetic() {
        let tokens = tokenize("price * 1.2 + 5").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("price".into()),
                Token::Star,
                Token::Number(1.2),
                Token::Plus,
                Token::Number(5.0),
            ]
        );
    }

    #[test]
    fn tokenizes_comparison_and_logic() {
        let tokens = tokenize("qty >= 10 && status != 'done' || !archived").unwrap();
        assert!(tokens.contains(&Token::Gte));
        assert!(tokens.contains(&Token::AndAnd));
        assert!(tokens.contains(&Token::NotEq));
        assert!(tokens.contains(&Token::OrOr));
        assert!(tokens.contains(&Token::Bang));
        assert!(tokens.contains(&Token::Str("done".into())));
    }

    #[test]
    fn tokenizes_dotted_paths_and_calls() {
        let tokens = tokenize("upper(customer.name)").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("upper".into()),
                Token::LParen,
                Token::Ident("customer".into()),
                Token::Dot,
                Token::Ident("name".into()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""a\"b\nc""#).unwrap();
        assert_eq!(tokens, vec![Token::Str("a\"b\nc".into())]);
    }

    #[test]
    fn rejects_unterminated_string_and_bad_chars() {
        assert!(tokenize("'open").is_err());
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("a = b").is_err());
        assert!(tokenize("a & b").is_err());
    }

    #[test]
    fn number_followed_by_dot_path_is_not_a_float() {
        // "3.x" is not valid, but the dot must not be swallowed by the number.
        let tokens = tokenize("3.5 > limit").unwrap();
        assert_eq!(tokens[0], Token::Number(3.5));
    }
}
