//! Number formatting and parsing with Lua's conventions

/// Format a number the way Lua's `%.14g` does
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan".into() } else { "nan".into() };
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0".into() } else { "0".into() };
    }
    if n.fract() == 0.0 && n.abs() < 1e14 {
        return format!("{}", n as i64);
    }

    // Round to 14 significant digits first; the exponent after rounding decides the style
    let sci = format!("{:.13e}", n);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    if !(-4..14).contains(&exp) {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (13 - exp).max(0) as usize;
        let fixed = format!("{:.*}", decimals, n);
        trim_fraction(&fixed).to_string()
    }
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn is_lua_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Convert a string to a number the way the Lua lexer and `tonumber` do
///
/// Accepts surrounding whitespace, decimal notation with optional exponent
/// and hexadecimal integers with a `0x` prefix.
pub fn parse_number(bytes: &[u8]) -> Option<f64> {
    let start = bytes.iter().position(|b| !is_lua_space(*b))?;
    let end = bytes.iter().rposition(|b| !is_lua_space(*b))? + 1;
    let text = std::str::from_utf8(&bytes[start..end]).ok()?;

    let (negative, unsigned) = match text.as_bytes()[0] {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };
    if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let value = hex
            .bytes()
            .fold(0f64, |acc, b| acc * 16.0 + (b as char).to_digit(16).unwrap_or(0) as f64);
        return Some(if negative { -value } else { value });
    }

    // Rust also accepts "inf" and "nan", which Lua source never spells as numbers
    if !unsigned
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }
    if !unsigned.bytes().next().map_or(false, |b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    text.parse::<f64>().ok()
}

/// Parse an integer numeral in an arbitrary base between 2 and 36
pub fn parse_integer_base(bytes: &[u8], base: u32) -> Option<f64> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut value = 0f64;
    for c in digits.chars() {
        let d = c.to_digit(base)?;
        value = value * base as f64 + d as f64;
    }
    Some(if negative { -value } else { value })
}

/// Lua's modulo: the result takes the sign of the divisor
pub fn lua_mod(a: f64, b: f64) -> f64 {
    a - (a / b).floor() * b
}

/// Truncate a number toward zero into an integer, 0 when not representable
pub fn to_integer(n: f64) -> i64 {
    if n.is_nan() {
        0
    } else {
        n as i64
    }
}

/// Whether a number is an integral value that fits an array index
pub fn as_array_index(n: f64) -> Option<usize> {
    if n >= 1.0 && n.fract() == 0.0 && n <= (u32::MAX as f64) {
        Some(n as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_integers() {
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(-0.0), "-0");
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-7.0), "-7");
        assert_eq!(format_number(1e13), "10000000000000");
        assert_eq!(format_number(1e14), "1e+14");
    }

    #[test]
    fn test_format_fractions() {
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(3.14159), "3.14159");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(format_number(0.0001), "0.0001");
    }

    #[test]
    fn test_format_exponents() {
        assert_eq!(format_number(1e15), "1e+15");
        assert_eq!(format_number(1e100), "1e+100");
        assert_eq!(format_number(0.00001), "1e-05");
        assert_eq!(format_number(1.5e-7), "1.5e-07");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(b"10"), Some(10.0));
        assert_eq!(parse_number(b"  3.5  "), Some(3.5));
        assert_eq!(parse_number(b"1e3"), Some(1000.0));
        assert_eq!(parse_number(b".5"), Some(0.5));
        assert_eq!(parse_number(b"0x1F"), Some(31.0));
        assert_eq!(parse_number(b"-0x10"), Some(-16.0));
        assert_eq!(parse_number(b"-2"), Some(-2.0));
        assert_eq!(parse_number(b""), None);
        assert_eq!(parse_number(b"abc"), None);
        assert_eq!(parse_number(b"1e"), None);
        assert_eq!(parse_number(b"inf"), None);
        assert_eq!(parse_number(b"nan"), None);
        assert_eq!(parse_number(b"0x"), None);
    }

    #[test]
    fn test_parse_integer_base() {
        assert_eq!(parse_integer_base(b"ff", 16), Some(255.0));
        assert_eq!(parse_integer_base(b"101", 2), Some(5.0));
        assert_eq!(parse_integer_base(b"zz", 36), Some(1295.0));
        assert_eq!(parse_integer_base(b"19", 8), None);
    }

    #[test]
    fn test_mod_sign() {
        assert_eq!(lua_mod(5.0, 3.0), 2.0);
        assert_eq!(lua_mod(-5.0, 3.0), 1.0);
        assert_eq!(lua_mod(5.0, -3.0), -1.0);
    }

    #[test]
    fn test_to_integer() {
        assert_eq!(to_integer(3.9), 3);
        assert_eq!(to_integer(-3.9), -3);
        assert_eq!(to_integer(f64::NAN), 0);
        assert_eq!(as_array_index(2.0), Some(2));
        assert_eq!(as_array_index(2.5), None);
        assert_eq!(as_array_index(0.0), None);
    }
}
