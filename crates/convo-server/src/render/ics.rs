//! iCalendar (RFC 5545) entries for event invitations and cancellations.

use chrono::{DateTime, Duration, Utc};
use convo_shared::constants::{APP_NAME, EVENT_DURATION_SECS};
use convo_store::Event;

/// Octets per content line before folding.
const LINE_LIMIT: usize = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Request,
    Cancel,
}

pub struct Organizer<'a> {
    pub name: &'a str,
    pub email: &'a str,
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Escape a TEXT value.
fn text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Quote a parameter value when it contains separators.
fn param(value: &str) -> String {
    let value: String = value.chars().filter(|c| *c != '"').collect();
    if value.contains(&[':', ';', ','][..]) {
        format!("\"{value}\"")
    } else {
        value
    }
}

/// Fold `line` at [`LINE_LIMIT`] octets without splitting a UTF-8 sequence
/// and append it, CRLF-terminated.
fn push_line(out: &mut String, line: &str) {
    let mut rest = line;
    let mut limit = LINE_LIMIT;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push_str(&rest[..cut]);
        out.push_str("\r\n ");
        rest = &rest[cut..];
        // continuation lines start with the folding space
        limit = LINE_LIMIT - 1;
    }
    out.push_str(rest);
    out.push_str("\r\n");
}

pub fn calendar(event: &Event, organizer: &Organizer<'_>, method: Method, now: DateTime<Utc>) -> String {
    let uid = event.key.map(|k| k.encode()).unwrap_or_default();
    let end = event.timestamp + Duration::seconds(EVENT_DURATION_SECS);
    let (method, status) = match method {
        Method::Request => ("REQUEST", "CONFIRMED"),
        Method::Cancel => ("CANCEL", "CANCELLED"),
    };

    let mut out = String::new();
    push_line(&mut out, "BEGIN:VCALENDAR");
    push_line(&mut out, "VERSION:2.0");
    push_line(&mut out, &format!("PRODID:-//{APP_NAME}//{APP_NAME}//EN"));
    push_line(&mut out, &format!("METHOD:{method}"));
    push_line(&mut out, "BEGIN:VEVENT");
    push_line(&mut out, &format!("UID:{uid}"));
    push_line(&mut out, &format!("DTSTAMP:{}", stamp(now)));
    push_line(&mut out, &format!("DTSTART:{}", stamp(event.timestamp)));
    push_line(&mut out, &format!("DTEND:{}", stamp(end)));
    push_line(&mut out, &format!("SUMMARY:{}", text(&event.name)));
    if !event.address.is_empty() {
        push_line(&mut out, &format!("LOCATION:{}", text(&event.address)));
    }
    if !event.description.is_empty() {
        push_line(&mut out, &format!("DESCRIPTION:{}", text(&event.description)));
    }
    push_line(
        &mut out,
        &format!("ORGANIZER;CN={}:mailto:{}", param(organizer.name), organizer.email),
    );
    push_line(&mut out, &format!("STATUS:{status}"));
    push_line(&mut out, &format!("SEQUENCE:{}", event.updated_at.timestamp()));
    push_line(&mut out, "END:VEVENT");
    push_line(&mut out, "END:VCALENDAR");
    out
}
