//! Mail message parsing.
//!
//! Parses an RFC-5322-ish message buffer line by line. A header line is
//! `Name: value` with a name starting with an uppercase letter;
//! continuation lines are appended to the previous header's value with a
//! leading newline. The first `Envelope-To` header switches the parser
//! into body collection, where every subsequent line belongs to the body.

use std::collections::HashMap;

use crate::core::records::MailMessage;

/// Split a message buffer into its header map and body text.
pub fn split_header_and_body(buf: &[u8]) -> (HashMap<String, String>, String) {
    let mut header: HashMap<String, String> = HashMap::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut last_header = String::new();
    let mut collect_body = false;

    let text = String::from_utf8_lossy(buf);
    for line in text.lines() {
        if collect_body {
            body_lines.push(line);
            continue;
        }

        if line.is_empty() {
            continue;
        }

        let parsed = line.split_once(": ").and_then(|(name, value)| {
            let starts_upper = name
                .chars()
                .next()
                .map(|c| c.is_ascii_uppercase())
                .unwrap_or(false);
            starts_upper.then_some((name, value))
        });

        match parsed {
            Some((name, value)) => {
                if name == "Envelope-To" {
                    collect_body = true;
                }
                header.insert(name.to_string(), value.to_string());
                last_header = name.to_string();
            }
            None => {
                // continuation line of the previous header
                if let Some(value) = header.get_mut(&last_header) {
                    value.push('\n');
                    value.push_str(line);
                }
            }
        }
    }

    (header, body_lines.join("\n"))
}

/// Parse a message buffer into a `MailMessage`.
pub fn parse_mail(buf: &[u8]) -> MailMessage {
    let (header, body) = split_header_and_body(buf);
    let field = |name: &str| header.get(name).cloned().unwrap_or_default();

    MailMessage {
        return_path: field("Return-Path"),
        delivery_date: field("Delivery-Date"),
        from: field("From"),
        to: field("To"),
        cc: field("CC"),
        subject: field("Subject"),
        date: field("Date"),
        message_id: field("Message-ID"),
        references: field("References"),
        in_reply_to: field("In-Reply-To"),
        content_language: field("Content-Language"),
        x_originating_ip: field("X-Originating-IP"),
        content_type: field("Content-Type"),
        envelope_to: field("Envelope-To"),
        body,
    }
}
