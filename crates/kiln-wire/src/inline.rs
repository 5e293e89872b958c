//! Inline commands: the short line-oriented form used during the
//! replication handshake (`PING`, `REPLCONF ...`, `PSYNC ...`, `SYNC`)
//! before a replica is `ONLINE`, and the single-line replies a replica
//! reads back at each handshake step.

/// Encodes a space-joined inline command line, e.g. `PSYNC ? -1`.
pub fn encode_inline(parts: &[&str]) -> Vec<u8> {
    let mut out = parts.join(" ").into_bytes();
    out.extend_from_slice(b"\r\n");
    out
}

/// Reads one line (tolerating both `\r\n` and a bare `\n` terminator) from
/// the start of `buf`, returning the line with its terminator stripped and
/// the number of bytes consumed. `None` means the line isn't complete yet.
pub fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    let mut end = nl;
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    Some((&buf[..end], nl + 1))
}

/// A decoded single-line handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineReply {
    Pong,
    Ok,
    FullResync { replid: String, offset: i64 },
    Continue { replid: Option<String> },
    BulkLength(u64),
    EofBulk { tag: [u8; 40] },
    Error(String),
    Other(String),
}

pub fn parse_inline_reply(line: &[u8]) -> InlineReply {
    let text = String::from_utf8_lossy(line).into_owned();
    if text == "+PONG" {
        return InlineReply::Pong;
    }
    if text == "+OK" {
        return InlineReply::Ok;
    }
    if let Some(rest) = text.strip_prefix("+FULLRESYNC ") {
        let mut parts = rest.split_whitespace();
        if let (Some(replid), Some(offset)) = (parts.next(), parts.next()) {
            if let Ok(offset) = offset.parse() {
                return InlineReply::FullResync {
                    replid: replid.to_string(),
                    offset,
                };
            }
        }
    }
    if let Some(rest) = text.strip_prefix("+CONTINUE") {
        let replid = rest.trim();
        return InlineReply::Continue {
            replid: if replid.is_empty() {
                None
            } else {
                Some(replid.to_string())
            },
        };
    }
    if let Some(rest) = text.strip_prefix('$') {
        if let Some(tag_hex) = rest.strip_prefix("EOF:") {
            let bytes = tag_hex.as_bytes();
            if bytes.len() == 40 {
                let mut tag = [0u8; 40];
                tag.copy_from_slice(bytes);
                return InlineReply::EofBulk { tag };
            }
        } else if let Ok(len) = rest.parse::<u64>() {
            return InlineReply::BulkLength(len);
        }
    }
    if let Some(rest) = text.strip_prefix('-') {
        return InlineReply::Error(rest.to_string());
    }
    InlineReply::Other(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_line_handles_crlf_and_bare_lf() {
        let (line, consumed) = read_line(b"PING\r\nrest").unwrap();
        assert_eq!(line, b"PING");
        assert_eq!(consumed, 6);

        let (line, consumed) = read_line(b"PING\nrest").unwrap();
        assert_eq!(line, b"PING");
        assert_eq!(consumed, 5);
    }

    #[test]
    fn read_line_returns_none_without_terminator() {
        assert_eq!(read_line(b"PING"), None);
    }

    #[test]
    fn parses_fullresync_reply() {
        let reply = parse_inline_reply(b"+FULLRESYNC abc123 5000");
        assert_eq!(
            reply,
            InlineReply::FullResync {
                replid: "abc123".to_string(),
                offset: 5000
            }
        );
    }

    #[test]
    fn parses_continue_reply_with_and_without_replid() {
        assert_eq!(
            parse_inline_reply(b"+CONTINUE newid"),
            InlineReply::Continue {
                replid: Some("newid".to_string())
            }
        );
        assert_eq!(
            parse_inline_reply(b"+CONTINUE"),
            InlineReply::Continue { replid: None }
        );
    }

    #[test]
    fn parses_error_and_bulk_length() {
        assert_eq!(
            parse_inline_reply(b"-NOAUTH Authentication required"),
            InlineReply::Error("NOAUTH Authentication required".to_string())
        );
        assert_eq!(parse_inline_reply(b"$12345"), InlineReply::BulkLength(12345));
    }

    #[test]
    fn encode_inline_joins_with_spaces_and_crlf() {
        assert_eq!(encode_inline(&["PSYNC", "?", "-1"]), b"PSYNC ? -1\r\n");
    }
}
