//! Minimal printf-style rendering for label format strings
//!
//! Supports `%d`, `%i`, `%f`, `%s` and `%%` with optional zero padding,
//! width and precision (`%02d`, `%5.1f`). Missing arguments render empty.

use serde_json::Value;

#[derive(Debug, Default)]
struct Spec {
    zero: bool,
    left: bool,
    width: usize,
    precision: Option<usize>,
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or_default(),
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn pad(body: String, spec: &Spec, numeric: bool) -> String {
    let len = body.chars().count();
    if len >= spec.width {
        return body;
    }
    let fill = spec.width - len;
    if spec.left {
        format!("{body}{}", " ".repeat(fill))
    } else if spec.zero && numeric {
        match body.strip_prefix('-') {
            Some(rest) => format!("-{}{rest}", "0".repeat(fill)),
            None => format!("{}{body}", "0".repeat(fill)),
        }
    } else {
        format!("{}{body}", " ".repeat(fill))
    }
}

/// Render `fmt` with `args`
pub fn sprintf(fmt: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(fmt.len() + 8);
    let mut chars = fmt.chars().peekable();
    let mut next_arg = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = Spec::default();
        loop {
            match chars.peek() {
                Some('0') if spec.width == 0 && !spec.zero => {
                    spec.zero = true;
                    chars.next();
                }
                Some('-') => {
                    spec.left = true;
                    chars.next();
                }
                _ => break,
            }
        }
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            spec.width = spec.width * 10 + d as usize;
            chars.next();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = 0;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                precision = precision * 10 + d as usize;
                chars.next();
            }
            spec.precision = Some(precision);
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') | Some('i') => {
                let v = next_arg.next().map(as_f64).unwrap_or_default();
                out.push_str(&pad(format!("{}", v.trunc() as i64), &spec, true));
            }
            Some('f') => {
                let v = next_arg.next().map(as_f64).unwrap_or_default();
                let precision = spec.precision.unwrap_or(6);
                out.push_str(&pad(format!("{v:.precision$}"), &spec, true));
            }
            Some('s') => {
                let mut text = next_arg.next().map(as_text).unwrap_or_default();
                if let Some(p) = spec.precision {
                    text = text.chars().take(p).collect();
                }
                out.push_str(&pad(text, &spec, false));
            }
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}
