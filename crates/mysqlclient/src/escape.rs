//! Escaping of string literals.
//!
//! Without a connection the generic escaper treats input as single-byte.
//! A connection passes its character set so trail bytes of multibyte
//! characters are copied untouched, and switches to quote doubling when the
//! server runs with `NO_BACKSLASH_ESCAPES`.

use crate::charset::Charset;

/// A value to quote: text is encoded first, bytes are used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Literal<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a str> for Literal<'a> {
    fn from(s: &'a str) -> Self {
        Literal::Text(s)
    }
}

impl<'a> From<&'a String> for Literal<'a> {
    fn from(s: &'a String) -> Self {
        Literal::Text(s)
    }
}

impl<'a> From<&'a [u8]> for Literal<'a> {
    fn from(b: &'a [u8]) -> Self {
        Literal::Bytes(b)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Literal<'a> {
    fn from(b: &'a [u8; N]) -> Self {
        Literal::Bytes(b)
    }
}

impl<'a> From<&'a Vec<u8>> for Literal<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        Literal::Bytes(b)
    }
}

/// Escape special characters without knowledge of the character set.
pub fn escape_bytes(input: &[u8]) -> Vec<u8> {
    escape_with(input, None, false)
}

/// Escape and single-quote a value, encoding text as UTF-8.
pub fn quote_literal<'a>(value: impl Into<Literal<'a>>) -> Vec<u8> {
    let bytes = match value.into() {
        Literal::Text(s) => s.as_bytes(),
        Literal::Bytes(b) => b,
    };
    quote(&escape_bytes(bytes))
}

/// Wrap already-escaped bytes in single quotes.
pub(crate) fn quote(escaped: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(escaped.len() + 2);
    out.push(b'\'');
    out.extend_from_slice(escaped);
    out.push(b'\'');
    out
}

/// Escape `input` for embedding between single quotes.
///
/// With a multibyte `charset`, valid multibyte characters are copied as-is
/// and the lead byte of an incomplete one is escaped. With
/// `no_backslash_escapes` only `'` is special and it is doubled.
pub(crate) fn escape_with(
    input: &[u8],
    charset: Option<&Charset>,
    no_backslash_escapes: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * input.len() + 1);
    let multibyte = charset.filter(|cs| cs.is_multibyte());

    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if let Some(cs) = multibyte {
            let len = cs.mb_char_len(&input[i..]);
            if len > 0 {
                out.extend_from_slice(&input[i..i + len]);
                i += len;
                continue;
            }
            if cs.mb_lead_len(byte) > 1 {
                if no_backslash_escapes {
                    out.push(byte);
                } else {
                    out.extend_from_slice(&[b'\\', byte]);
                }
                i += 1;
                continue;
            }
        }

        if no_backslash_escapes {
            if byte == b'\'' {
                out.extend_from_slice(b"''");
            } else {
                out.push(byte);
            }
        } else {
            match byte {
                0 => out.extend_from_slice(b"\\0"),
                b'\n' => out.extend_from_slice(b"\\n"),
                b'\r' => out.extend_from_slice(b"\\r"),
                b'\\' => out.extend_from_slice(b"\\\\"),
                b'\'' => out.extend_from_slice(b"\\'"),
                b'"' => out.extend_from_slice(b"\\\""),
                0x1A => out.extend_from_slice(b"\\Z"),
                _ => out.push(byte),
            }
        }
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_special_characters() {
        assert_eq!(
            escape_bytes(b"a'b\"c\\d\ne\rf\0g\x1a"),
            b"a\\'b\\\"c\\\\d\\ne\\rf\\0g\\Z".to_vec()
        );
        assert_eq!(escape_bytes(b"plain"), b"plain".to_vec());
        assert!(escape_bytes(b"").is_empty());
    }

    #[test]
    fn test_escape_length_bound() {
        for input in [&b"''''"[..], b"\0\0\0", b"mixed 'x' \\ \n", b"", b"abc"] {
            assert!(escape_bytes(input).len() <= 2 * input.len() + 1);
        }
    }

    #[test]
    fn test_quote_literal_wraps_escaped_bytes() {
        for input in [&b"it's"[..], b"", b"\\\0", b"\xff\xfe"] {
            let escaped = escape_bytes(input);
            let quoted = quote_literal(input);
            assert_eq!(quoted.first(), Some(&b'\''));
            assert_eq!(quoted.last(), Some(&b'\''));
            assert_eq!(quoted.len(), escaped.len() + 2);
            assert_eq!(&quoted[1..quoted.len() - 1], escaped.as_slice());
        }
    }

    #[test]
    fn test_quote_text_and_bytes_alike() {
        assert_eq!(quote_literal("O'Reilly"), quote_literal(b"O'Reilly"));
        assert_eq!(quote_literal("O'Reilly"), b"'O\\'Reilly'".to_vec());
    }

    #[test]
    fn test_no_backslash_escapes_doubles_quotes() {
        let escaped = escape_with(b"it's a \\ path\n", None, true);
        assert_eq!(escaped, b"it''s a \\ path\n".to_vec());
    }

    #[test]
    fn test_multibyte_trail_byte_not_escaped() {
        // 0xBF 0x5C is one GBK character whose trail byte is '\'
        let gbk = Charset::new("gbk");
        let input = [0xBF, 0x5C, b'\''];
        assert_eq!(
            escape_with(&input, Some(&gbk), false),
            vec![0xBF, 0x5C, b'\\', b'\'']
        );
        // Without the charset the trail byte is escaped
        assert_eq!(escape_bytes(&input), vec![0xBF, b'\\', 0x5C, b'\\', b'\'']);
    }

    #[test]
    fn test_incomplete_multibyte_lead_is_escaped() {
        let gbk = Charset::new("gbk");
        assert_eq!(escape_with(&[0xBF], Some(&gbk), false), vec![b'\\', 0xBF]);
    }

    #[test]
    fn test_utf8_passes_through() {
        let utf8 = Charset::utf8mb4();
        let text = "na\u{ef}ve 'caf\u{e9}'";
        let escaped = escape_with(text.as_bytes(), Some(&utf8), false);
        assert_eq!(escaped, "na\u{ef}ve \\'caf\u{e9}\\'".as_bytes());
    }
}
