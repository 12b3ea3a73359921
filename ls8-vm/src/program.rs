//! Text-format program images
//!
//! An image is a sequence of lines, each holding at most one byte written as
//! a base-2 literal of up to eight digits. Content after a `#` is a comment;
//! blank lines are skipped. Bytes land at consecutive memory addresses
//! starting from 0, in file order.

use thiserror::Error;

/// Errors produced while parsing a program image
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A non-comment line did not parse as a base-2 byte
    #[error("line {line}: invalid binary literal {token:?}")]
    InvalidLiteral {
        /// 1-based line number
        line: usize,
        /// The offending token, with comments and whitespace stripped
        token: String,
    },

    /// The image holds more bytes than the machine has memory
    #[error("image is {len} bytes, but memory holds {max}")]
    TooLong {
        /// Number of bytes in the image
        len: usize,
        /// Size of machine memory
        max: usize,
    },
}

/// Parses a text-format program image into raw bytes
pub fn parse_image(text: &str) -> Result<Vec<u8>, ParseError> {
    let mut out = vec![];
    for (i, line) in text.lines().enumerate() {
        let token = line.split('#').next().unwrap_or("").trim();
        if token.is_empty() {
            continue;
        }
        let byte = u8::from_str_radix(token, 2).map_err(|_| {
            ParseError::InvalidLiteral {
                line: i + 1,
                token: token.to_owned(),
            }
        })?;
        out.push(byte);
    }
    if out.len() > crate::RAM_SIZE {
        return Err(ParseError::TooLong {
            len: out.len(),
            max: crate::RAM_SIZE,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let image = parse_image(
            "# print a value
             10000010 # LDI R0,65
             00000000
             01000001

             01000111 # PRN R0
             00000000
             00000001 # HLT
            ",
        )
        .unwrap();
        assert_eq!(
            image,
            [0b10000010, 0, 65, 0b01000111, 0, 0b00000001]
        );
    }

    #[test]
    fn malformed_literal_is_an_error() {
        assert_eq!(
            parse_image("00000001\n00000102\n"),
            Err(ParseError::InvalidLiteral {
                line: 2,
                token: "00000102".to_owned(),
            })
        );
    }

    #[test]
    fn literal_wider_than_a_byte_is_an_error() {
        assert_eq!(
            parse_image("100000000"),
            Err(ParseError::InvalidLiteral {
                line: 1,
                token: "100000000".to_owned(),
            })
        );
    }

    #[test]
    fn oversized_image_is_an_error() {
        let text = "00000000\n".repeat(crate::RAM_SIZE + 1);
        assert_eq!(
            parse_image(&text),
            Err(ParseError::TooLong {
                len: crate::RAM_SIZE + 1,
                max: crate::RAM_SIZE,
            })
        );
    }
}
