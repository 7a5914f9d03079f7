//! Raw MIME handling for SendRawEmail
//!
//! Headers are kept as the caller wrote them, folding included, so the
//! transmitted document differs from the input only in the headers we
//! strip or inject. Field boundaries and address lists come from
//! `mail_parser`; the bytes between those boundaries are copied untouched.

use chrono::{DateTime, Utc};
use mail_parser::{Addr, Address, HeaderName, HeaderValue, MessageParser};
use outpost_common::{Error, Result};
use regex::Regex;
use std::collections::HashSet;

/// One header field, possibly spanning folded lines
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderField {
    name: String,
    /// Raw bytes of the field including continuation lines and line endings
    raw: Vec<u8>,
}

impl HeaderField {
    /// Unfolded value with surrounding whitespace trimmed
    fn value(&self) -> String {
        let text = String::from_utf8_lossy(&self.raw);
        let value = text.split_once(':').map_or("", |(_, v)| v);
        value
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A parsed raw message
#[derive(Debug, Clone)]
pub struct RawMessage {
    headers: Vec<HeaderField>,
    from: Vec<String>,
    /// To, Cc and Bcc mailboxes in header order
    recipients: Vec<String>,
    /// Everything after the header block, blank separator line included
    body: Vec<u8>,
}

impl RawMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let message = MessageParser::default()
            .parse(data)
            .ok_or_else(|| Error::InvalidParameter("raw message could not be parsed".into()))?;

        let mut headers = Vec::new();
        let mut from = Vec::new();
        let mut recipients = Vec::new();
        let mut header_end = 0;

        for header in message.headers() {
            let start = header.offset_field as usize;
            let value_start = header.offset_start as usize;
            let end = field_end(data, header.offset_end as usize);

            let name = data
                .get(start..value_start)
                .map(|bytes| {
                    String::from_utf8_lossy(bytes)
                        .trim()
                        .trim_end_matches(':')
                        .trim()
                        .to_string()
                })
                .filter(|name| !name.is_empty() && !name.contains(char::is_whitespace))
                .ok_or_else(|| {
                    Error::InvalidParameter(format!("malformed header at offset {}", start))
                })?;
            let raw = data
                .get(start..end)
                .ok_or_else(|| {
                    Error::InvalidParameter(format!("malformed header {:?}", name))
                })?
                .to_vec();

            if let HeaderValue::Address(address) = &header.value {
                match header.name {
                    HeaderName::From => from.extend(mailboxes(address)),
                    HeaderName::To | HeaderName::Cc | HeaderName::Bcc => {
                        recipients.extend(mailboxes(address))
                    }
                    _ => {}
                }
            }

            header_end = header_end.max(end);
            headers.push(HeaderField { name, raw });
        }

        if headers.is_empty() {
            return Err(Error::InvalidParameter("raw message has no headers".into()));
        }

        Ok(Self {
            headers,
            from,
            recipients,
            body: data[header_end.min(data.len())..].to_vec(),
        })
    }

    /// Unfolded values of every header called `name`, case-insensitively
    pub fn header_values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(HeaderField::value)
            .collect()
    }

    /// First `From` mailbox
    pub fn from(&self) -> Option<String> {
        self.from.first().cloned()
    }

    /// Union of To, Cc and Bcc mailboxes, first occurrence wins
    pub fn recipients(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.recipients
            .iter()
            .filter(|addr| seen.insert(addr.to_lowercase()))
            .cloned()
            .collect()
    }

    /// Produce the bytes to transmit.
    ///
    /// Drops `X-SES-*-ARN`, `Bcc`, `Message-ID` and `Date` (every
    /// occurrence, any case), then prepends fresh `Message-ID` and `Date`.
    pub fn rewrite(&self, message_id: &str, date: DateTime<Utc>) -> Result<Vec<u8>> {
        let arn_header = Regex::new(r"(?i)^x-ses-.*-arn$")
            .map_err(|e| Error::Internal(format!("invalid header pattern: {}", e)))?;

        let mut out = Vec::with_capacity(self.body.len() + 1024);
        out.extend_from_slice(format!("Message-ID: {}\r\n", message_id).as_bytes());
        out.extend_from_slice(format!("Date: {}\r\n", date.to_rfc2822()).as_bytes());

        for header in &self.headers {
            let stripped = arn_header.is_match(&header.name)
                || header.name.eq_ignore_ascii_case("Message-ID")
                || header.name.eq_ignore_ascii_case("Date")
                || header.name.eq_ignore_ascii_case("Bcc");
            if stripped {
                continue;
            }
            out.extend_from_slice(&header.raw);
            if !header.raw.ends_with(b"\n") {
                out.extend_from_slice(b"\r\n");
            }
        }

        if self.body.is_empty() {
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(&self.body);
        }
        Ok(out)
    }
}

/// End of a header field: `offset` plus its line terminator, if the parser
/// left that outside the value
fn field_end(data: &[u8], offset: usize) -> usize {
    let mut end = offset.min(data.len());
    if data[..end].ends_with(b"\n") {
        return end;
    }
    if data.get(end) == Some(&b'\r') {
        end += 1;
    }
    if data.get(end) == Some(&b'\n') {
        end += 1;
    }
    end
}

/// Bare addresses of a list or of every group in it
fn mailboxes(address: &Address<'_>) -> Vec<String> {
    let addrs: Vec<&Addr<'_>> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    addrs
        .into_iter()
        .filter_map(|addr| addr.address.as_deref())
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_common::types::EmailAddress;
    use pretty_assertions::assert_eq;

    const RAW: &str = "From: \"Doe, Jane\" <jane@example.com>\r\n\
To: a@example.org, \"B, Bee\" <b@example.org>\r\n\
Cc: c@example.org\r\n\
Bcc: secret@example.org\r\n\
Message-ID: <caller@example.com>\r\n\
message-id: <second@example.com>\r\n\
DATE: Mon, 1 Jan 2024 00:00:00 +0000\r\n\
X-SES-SOURCE-ARN: arn:aws:ses:us-east-1:1:identity/example.com\r\n\
x-ses-from-arn: arn:aws:ses:us-east-1:1:identity/example.com\r\n\
X-Custom: keep\r\n\
Subject: A folded\r\n\
\x20subject line\r\n\
\r\n\
Body text\r\n";

    #[test]
    fn test_sender_and_recipients() {
        let message = RawMessage::parse(RAW.as_bytes()).unwrap();
        assert_eq!(message.from().as_deref(), Some("jane@example.com"));
        assert_eq!(
            message.recipients(),
            vec![
                "a@example.org".to_string(),
                "b@example.org".to_string(),
                "c@example.org".to_string(),
                "secret@example.org".to_string(),
            ]
        );
        assert_eq!(
            message.header_values("subject"),
            vec!["A folded subject line".to_string()]
        );
    }

    #[test]
    fn test_address_forms() {
        let raw = "From: Jane Doe (Billing) <jane@example.com>\r\n\
To: a@example.org (Alice), \"Smith, Bob\" <bob@example.org>\r\n\
Cc: Team: c@example.org, Dee <d@example.org>;\r\n\
Bcc: \"john.smith\"@example.org\r\n\
Subject: forms\r\n\
\r\n\
body\r\n";
        let message = RawMessage::parse(raw.as_bytes()).unwrap();

        assert_eq!(message.from().as_deref(), Some("jane@example.com"));
        let recipients = message.recipients();
        assert_eq!(
            recipients[..4],
            [
                "a@example.org".to_string(),
                "bob@example.org".to_string(),
                "c@example.org".to_string(),
                "d@example.org".to_string(),
            ]
        );
        for recipient in &recipients[..4] {
            assert!(EmailAddress::parse(recipient).is_some(), "{}", recipient);
        }
        // The quoted local part does not disturb the other fields
        assert!(recipients[4..].iter().all(|r| r.ends_with("example.org")));
    }

    #[test]
    fn test_empty_group_and_duplicates() {
        let raw = "From: a@example.com\r\n\
To: undisclosed-recipients:;\r\n\
Cc: b@example.org, B@Example.org\r\n\
\r\n\
x";
        let message = RawMessage::parse(raw.as_bytes()).unwrap();
        assert_eq!(message.recipients(), vec!["b@example.org".to_string()]);
    }

    #[test]
    fn test_rewrite_replaces_ids_and_strips_arns() {
        let message = RawMessage::parse(RAW.as_bytes()).unwrap();
        let out = message
            .rewrite("<fresh@mail.test>", Utc::now())
            .unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Message-ID: <fresh@mail.test>\r\nDate: "));
        assert!(!text.contains("caller@example.com"));
        assert!(!text.contains("second@example.com"));
        assert!(!text.contains("Mon, 1 Jan 2024"));
        assert!(!text.to_lowercase().contains("x-ses-"));
        assert!(!text.contains("secret@example.org"));
        assert!(text.contains("X-Custom: keep\r\n"));
        assert!(text.contains("Subject: A folded\r\n subject line\r\n"));
        assert!(text.ends_with("\r\n\r\nBody text\r\n"));

        let reparsed = RawMessage::parse(text.as_bytes()).unwrap();
        assert_eq!(reparsed.header_values("Message-ID").len(), 1);
        assert_eq!(reparsed.header_values("Date").len(), 1);
    }

    #[test]
    fn test_bare_lf_line_endings() {
        let raw = "From: a@example.com\nTo: b@example.org\nMessage-ID: <x@y>\n\nhello\n";
        let message = RawMessage::parse(raw.as_bytes()).unwrap();
        let text = String::from_utf8(message.rewrite("<new@z>", Utc::now()).unwrap()).unwrap();
        assert!(!text.contains("<x@y>"));
        assert!(text.contains("From: a@example.com\n"));
        assert!(text.ends_with("\n\nhello\n"));
    }

    #[test]
    fn test_no_headers() {
        assert!(RawMessage::parse(b"").is_err());
        assert!(RawMessage::parse(b"\r\nbody only").is_err());
    }

    #[test]
    fn test_headers_without_body() {
        let message = RawMessage::parse(b"Subject: hi").unwrap();
        let text = String::from_utf8(message.rewrite("<id@h>", Utc::now()).unwrap()).unwrap();
        assert!(text.ends_with("Subject: hi\r\n\r\n"));
    }
}
