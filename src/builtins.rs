//! Built-in functions.
//!
//! One flat namespace, dispatched by uppercased name. `call_builtin` returns
//! `None` for an unknown name so the evaluator can fall through to library
//! functions before deciding the call is unresolvable. String positions are
//! 1-based throughout, as everywhere else in the language.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use rand::Rng;

use crate::error::{Diagnostic, ErrorKind, RexxResult};
use crate::value::Value;

pub fn call_builtin(name: &str, args: &[Value]) -> Option<RexxResult<Value>> {
    let result = match name {
        "UPPER" => upper(args),
        "LOWER" => lower(args),
        "LENGTH" => length(args),
        "SUBSTR" => substr(args),
        "POS" => pos(args),
        "WORD" => word(args),
        "WORDS" => words(args),
        "STRIP" => strip(args),
        "SPACE" => space(args),
        "COPIES" => copies(args),
        "REVERSE" => reverse(args),
        "ABS" => abs(args),
        "MAX" => max_min(args, "MAX", true),
        "MIN" => max_min(args, "MIN", false),
        "TRUNC" => trunc(args),
        "SIGN" => sign(args),
        "RANDOM" => random(args),
        "COPY" => copy(args),
        "JSON_PARSE" => json_parse(args),
        "JSON_STRINGIFY" => json_stringify(args),
        _ => return None,
    };
    Some(result)
}

fn wrong_args(name: &str, expected: &str, got: usize) -> Diagnostic {
    Diagnostic::new(
        ErrorKind::Eval,
        format!("{name}: expected {expected} argument(s), got {got}"),
    )
}

fn one_string(name: &str, args: &[Value]) -> RexxResult<String> {
    if args.len() != 1 {
        return Err(wrong_args(name, "1", args.len()));
    }
    Ok(args[0].to_string())
}

fn number_arg(name: &str, args: &[Value], idx: usize) -> RexxResult<BigDecimal> {
    args[idx].require_number(name)
}

/// 1-based integer position argument; anything below 1 is an error.
fn position_arg(name: &str, args: &[Value], idx: usize) -> RexxResult<usize> {
    let n = number_arg(name, args, idx)?;
    n.to_usize().filter(|&v| v >= 1).ok_or_else(|| {
        Diagnostic::new(
            ErrorKind::Eval,
            format!("{name}: position must be a whole number >= 1, got '{}'", args[idx]),
        )
    })
}

fn upper(args: &[Value]) -> RexxResult<Value> {
    Ok(Value::string(one_string("UPPER", args)?.to_uppercase()))
}

fn lower(args: &[Value]) -> RexxResult<Value> {
    Ok(Value::string(one_string("LOWER", args)?.to_lowercase()))
}

fn length(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 1 {
        return Err(wrong_args("LENGTH", "1", args.len()));
    }
    let n = match &args[0] {
        Value::List(items) => items.borrow().len(),
        Value::Map(entries) => entries.borrow().len(),
        other => other.to_string().chars().count(),
    };
    Ok(Value::from(n as i64))
}

fn substr(args: &[Value]) -> RexxResult<Value> {
    if args.len() < 2 || args.len() > 4 {
        return Err(wrong_args("SUBSTR", "2 to 4", args.len()));
    }
    let chars: Vec<char> = args[0].to_string().chars().collect();
    let start = position_arg("SUBSTR", args, 1)?;
    let taken: Vec<char> = chars.iter().skip(start - 1).copied().collect();

    let len = if args.len() >= 3 {
        number_arg("SUBSTR", args, 2)?.to_usize().ok_or_else(|| {
            Diagnostic::new(ErrorKind::Eval, "SUBSTR: length must be a whole number >= 0")
        })?
    } else {
        taken.len()
    };

    let pad = if args.len() == 4 {
        args[3].to_string().chars().next().unwrap_or(' ')
    } else {
        ' '
    };

    let mut out: String = taken.iter().take(len).collect();
    while out.chars().count() < len {
        out.push(pad);
    }
    Ok(Value::string(out))
}

fn pos(args: &[Value]) -> RexxResult<Value> {
    if args.len() < 2 || args.len() > 3 {
        return Err(wrong_args("POS", "2 or 3", args.len()));
    }
    let needle = args[0].to_string();
    let haystack: Vec<char> = args[1].to_string().chars().collect();
    let start = if args.len() == 3 {
        position_arg("POS", args, 2)?
    } else {
        1
    };
    if needle.is_empty() {
        return Ok(Value::from(0));
    }
    let needle_chars: Vec<char> = needle.chars().collect();
    let mut i = start - 1;
    while i + needle_chars.len() <= haystack.len() {
        if haystack[i..i + needle_chars.len()] == needle_chars[..] {
            return Ok(Value::from((i + 1) as i64));
        }
        i += 1;
    }
    Ok(Value::from(0))
}

fn word(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 2 {
        return Err(wrong_args("WORD", "2", args.len()));
    }
    let text = args[0].to_string();
    let n = position_arg("WORD", args, 1)?;
    Ok(Value::string(
        text.split_whitespace().nth(n - 1).unwrap_or(""),
    ))
}

fn words(args: &[Value]) -> RexxResult<Value> {
    let text = one_string("WORDS", args)?;
    Ok(Value::from(text.split_whitespace().count() as i64))
}

fn strip(args: &[Value]) -> RexxResult<Value> {
    if args.is_empty() || args.len() > 3 {
        return Err(wrong_args("STRIP", "1 to 3", args.len()));
    }
    let text = args[0].to_string();
    let option = if args.len() >= 2 {
        args[1].to_string().to_uppercase()
    } else {
        "B".to_string()
    };
    let strip_char = if args.len() == 3 {
        args[2].to_string().chars().next().unwrap_or(' ')
    } else {
        ' '
    };

    let stripped = match option.chars().next() {
        Some('L') => text.trim_start_matches(strip_char).to_string(),
        Some('T') => text.trim_end_matches(strip_char).to_string(),
        Some('B') => text.trim_matches(strip_char).to_string(),
        _ => {
            return Err(Diagnostic::new(
                ErrorKind::Eval,
                format!("STRIP: option must be B, L, or T, got '{option}'"),
            ))
        }
    };
    Ok(Value::string(stripped))
}

fn space(args: &[Value]) -> RexxResult<Value> {
    if args.is_empty() || args.len() > 3 {
        return Err(wrong_args("SPACE", "1 to 3", args.len()));
    }
    let text = args[0].to_string();
    let n = if args.len() >= 2 {
        number_arg("SPACE", args, 1)?.to_usize().ok_or_else(|| {
            Diagnostic::new(ErrorKind::Eval, "SPACE: count must be a whole number >= 0")
        })?
    } else {
        1
    };
    let pad = if args.len() == 3 {
        args[2].to_string().chars().next().unwrap_or(' ')
    } else {
        ' '
    };
    let joiner: String = std::iter::repeat(pad).take(n).collect();
    Ok(Value::string(
        text.split_whitespace().collect::<Vec<_>>().join(&joiner),
    ))
}

fn copies(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 2 {
        return Err(wrong_args("COPIES", "2", args.len()));
    }
    let text = args[0].to_string();
    let n = number_arg("COPIES", args, 1)?.to_usize().ok_or_else(|| {
        Diagnostic::new(ErrorKind::Eval, "COPIES: count must be a whole number >= 0")
    })?;
    Ok(Value::string(text.repeat(n)))
}

fn reverse(args: &[Value]) -> RexxResult<Value> {
    let text = one_string("REVERSE", args)?;
    Ok(Value::string(text.chars().rev().collect::<String>()))
}

fn abs(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 1 {
        return Err(wrong_args("ABS", "1", args.len()));
    }
    Ok(Value::from_decimal(&number_arg("ABS", args, 0)?.abs()))
}

fn max_min(args: &[Value], name: &str, want_max: bool) -> RexxResult<Value> {
    if args.is_empty() {
        return Err(wrong_args(name, "at least 1", 0));
    }
    let mut best = number_arg(name, args, 0)?;
    for i in 1..args.len() {
        let candidate = number_arg(name, args, i)?;
        if (want_max && candidate > best) || (!want_max && candidate < best) {
            best = candidate;
        }
    }
    Ok(Value::from_decimal(&best))
}

fn trunc(args: &[Value]) -> RexxResult<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(wrong_args("TRUNC", "1 or 2", args.len()));
    }
    let n = number_arg("TRUNC", args, 0)?;
    let places = if args.len() == 2 {
        number_arg("TRUNC", args, 1)?.to_i64().ok_or_else(|| {
            Diagnostic::new(ErrorKind::Eval, "TRUNC: places must be a whole number >= 0")
        })?
    } else {
        0
    };
    let truncated = n.with_scale_round(places, bigdecimal::RoundingMode::Down);
    Ok(Value::from_decimal(&truncated))
}

fn sign(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 1 {
        return Err(wrong_args("SIGN", "1", args.len()));
    }
    let n = number_arg("SIGN", args, 0)?;
    let s = if n.is_zero() {
        0
    } else if n < BigDecimal::zero() {
        -1
    } else {
        1
    };
    Ok(Value::from(s))
}

fn random(args: &[Value]) -> RexxResult<Value> {
    let (min, max) = match args.len() {
        0 => (0, 999),
        1 => {
            let max = number_arg("RANDOM", args, 0)?.to_i64().ok_or_else(|| {
                Diagnostic::new(ErrorKind::Eval, "RANDOM: bound must be a whole number")
            })?;
            (0, max)
        }
        2 => {
            let min = number_arg("RANDOM", args, 0)?.to_i64().ok_or_else(|| {
                Diagnostic::new(ErrorKind::Eval, "RANDOM: bound must be a whole number")
            })?;
            let max = number_arg("RANDOM", args, 1)?.to_i64().ok_or_else(|| {
                Diagnostic::new(ErrorKind::Eval, "RANDOM: bound must be a whole number")
            })?;
            (min, max)
        }
        n => return Err(wrong_args("RANDOM", "0 to 2", n)),
    };
    if min > max {
        return Err(Diagnostic::new(
            ErrorKind::Eval,
            format!("RANDOM: min {min} exceeds max {max}"),
        ));
    }
    let n = rand::thread_rng().gen_range(min..=max);
    Ok(Value::from(n))
}

fn copy(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 1 {
        return Err(wrong_args("COPY", "1", args.len()));
    }
    Ok(args[0].deep_copy())
}

fn json_parse(args: &[Value]) -> RexxResult<Value> {
    let text = one_string("JSON_PARSE", args)?;
    let parsed: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        Diagnostic::new(ErrorKind::Eval, format!("JSON_PARSE: invalid JSON: {e}"))
    })?;
    Ok(Value::from_json(&parsed))
}

fn json_stringify(args: &[Value]) -> RexxResult<Value> {
    if args.len() != 1 {
        return Err(wrong_args("JSON_STRINGIFY", "1", args.len()));
    }
    let text = serde_json::to_string(&args[0].to_json()).map_err(|e| {
        Diagnostic::new(ErrorKind::Eval, format!("JSON_STRINGIFY: {e}"))
    })?;
    Ok(Value::string(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        call_builtin(name, args).unwrap().unwrap()
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(call_builtin("NO_SUCH_FN", &[]).is_none());
    }

    #[test]
    fn substr_is_one_based() {
        let s = Value::string("abcdef");
        assert_eq!(call("SUBSTR", &[s.clone(), Value::from(2), Value::from(3)]).to_string(), "bcd");
        assert_eq!(call("SUBSTR", &[s, Value::from(1)]).to_string(), "abcdef");
    }

    #[test]
    fn substr_pads_past_the_end() {
        let s = Value::string("ab");
        let padded = call(
            "SUBSTR",
            &[s, Value::from(1), Value::from(5), Value::string("*")],
        );
        assert_eq!(padded.to_string(), "ab***");
    }

    #[test]
    fn pos_returns_one_based_or_zero() {
        let hay = Value::string("hello world");
        assert_eq!(call("POS", &[Value::string("world"), hay.clone()]).to_string(), "7");
        assert_eq!(call("POS", &[Value::string("xyz"), hay]).to_string(), "0");
    }

    #[test]
    fn word_and_words() {
        let s = Value::string("  alpha   beta gamma ");
        assert_eq!(call("WORD", &[s.clone(), Value::from(2)]).to_string(), "beta");
        assert_eq!(call("WORD", &[s.clone(), Value::from(9)]).to_string(), "");
        assert_eq!(call("WORDS", &[s]).to_string(), "3");
    }

    #[test]
    fn strip_options() {
        let s = Value::string("  mid  ");
        assert_eq!(call("STRIP", &[s.clone()]).to_string(), "mid");
        assert_eq!(call("STRIP", &[s.clone(), Value::string("L")]).to_string(), "mid  ");
        assert_eq!(call("STRIP", &[s, Value::string("T")]).to_string(), "  mid");
    }

    #[test]
    fn space_normalizes_blanks() {
        let s = Value::string("a   b    c");
        assert_eq!(call("SPACE", &[s.clone()]).to_string(), "a b c");
        assert_eq!(call("SPACE", &[s, Value::from(0)]).to_string(), "abc");
    }

    #[test]
    fn length_counts_elements_for_collections() {
        let list = Value::list(vec![Value::from(1), Value::from(2)]);
        assert_eq!(call("LENGTH", &[list]).to_string(), "2");
        assert_eq!(call("LENGTH", &[Value::string("héllo")]).to_string(), "5");
    }

    #[test]
    fn trunc_toward_zero() {
        assert_eq!(call("TRUNC", &[Value::string("3.99")]).to_string(), "3");
        assert_eq!(call("TRUNC", &[Value::string("-3.99")]).to_string(), "-3");
        assert_eq!(
            call("TRUNC", &[Value::string("2.789"), Value::from(2)]).to_string(),
            "2.78"
        );
    }

    #[test]
    fn numeric_argument_errors_are_typed() {
        let err = call_builtin("ABS", &[Value::string("pear")]).unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Eval);
        assert!(err.message.contains("pear"));
    }

    #[test]
    fn random_respects_bounds() {
        for _ in 0..50 {
            let n: i64 = call("RANDOM", &[Value::from(3), Value::from(5)])
                .to_string()
                .parse()
                .unwrap();
            assert!((3..=5).contains(&n));
        }
    }

    #[test]
    fn copy_is_deep() {
        let original = Value::list(vec![Value::from(1)]);
        let copied = call("COPY", &[original.clone()]);
        if let Value::List(items) = &original {
            items.borrow_mut().push(Value::from(2));
        }
        if let Value::List(items) = &copied {
            assert_eq!(items.borrow().len(), 1);
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn json_parse_and_stringify() {
        let v = call("JSON_PARSE", &[Value::string(r#"{"a":[1,2]}"#)]);
        assert!(matches!(v, Value::Map(_)));
        let text = call("JSON_STRINGIFY", &[v]);
        assert_eq!(text.to_string(), r#"{"a":[1,2]}"#);
    }
}
