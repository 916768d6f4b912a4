//! Outbound e-mail bodies.
//!
//! Every template returns a [`Rendered`] with a plain-text part and an HTML
//! part. Message bodies are markdown: the HTML part renders them with
//! pulldown-cmark, and raw HTML inside a body is shown as text, never passed
//! through.

pub mod ics;

use chrono::{DateTime, FixedOffset, Utc};
use convo_shared::constants::APP_NAME;
use convo_store::{Event, Link};
use pulldown_cmark::{html, Event as MdEvent, Options, Parser};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// A message as it appears in thread mail and the digest.
#[derive(Debug, Clone, Default)]
pub struct MailMessage {
    pub author: String,
    pub body: String,
    pub photos: Vec<String>,
    pub link: Option<Link>,
}

/// One unread thread or event in a digest.
#[derive(Debug, Clone)]
pub struct DigestSection {
    pub name: String,
    pub messages: Vec<MailMessage>,
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Render a markdown body to HTML. Raw HTML blocks and inline tags come out
/// escaped.
pub fn markdown(body: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TABLES);
    let parser = Parser::new_ext(body, options).map(|event| match event {
        MdEvent::Html(raw) | MdEvent::InlineHtml(raw) => MdEvent::Text(raw),
        other => other,
    });
    let mut out = String::with_capacity(body.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

/// Event time in the venue's local time when the venue is known.
pub fn event_time(event: &Event) -> String {
    let local = FixedOffset::east_opt(event.utc_offset * 60)
        .map(|offset| event.timestamp.with_timezone(&offset));
    match local {
        Some(t) if !event.place_id.is_empty() => t.format("%A, %B %-d at %-I:%M %p").to_string(),
        _ => format_utc(event.timestamp),
    }
}

fn format_utc(at: DateTime<Utc>) -> String {
    at.format("%A, %B %-d at %-I:%M %p UTC").to_string()
}

fn layout(title: &str, content: &str, footer: Option<&str>) -> String {
    let footer = footer
        .map(|f| format!(r#"<p style="color:#888;font-size:12px">{f}</p>"#))
        .unwrap_or_default();
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\
         <body style=\"font-family:sans-serif;max-width:600px\">{}{}</body></html>",
        escape(title),
        content,
        footer
    )
}

fn button(url: &str, label: &str) -> String {
    format!(
        r#"<p><a href="{}" style="padding:8px 16px;background:#3a7bd5;color:#fff;text-decoration:none">{}</a></p>"#,
        escape(url),
        escape(label)
    )
}

fn unsubscribe_footer(url: &str) -> String {
    format!(
        r#"You can <a href="{}">turn off these e-mails</a>."#,
        escape(url)
    )
}

fn message_html(message: &MailMessage) -> String {
    let mut out = format!("<div><p><strong>{}</strong></p>", escape(&message.author));
    out.push_str(&markdown(&message.body));
    for photo in &message.photos {
        out.push_str(&format!(
            r#"<p><img src="{}" style="max-width:100%"></p>"#,
            escape(photo)
        ));
    }
    if let Some(link) = &message.link {
        let title = if link.title.is_empty() { &link.url } else { &link.title };
        out.push_str(&format!(
            r#"<blockquote><a href="{}">{}</a><br>{}</blockquote>"#,
            escape(&link.url),
            escape(title),
            escape(&link.description)
        ));
    }
    out.push_str("</div><hr>");
    out
}

fn message_text(message: &MailMessage) -> String {
    let mut out = format!("{}:\n{}\n", message.author, message.body);
    for photo in &message.photos {
        out.push_str(&format!("[photo] {photo}\n"));
    }
    if let Some(link) = &message.link {
        if !message.body.contains(&link.url) {
            out.push_str(&format!("{}\n", link.url));
        }
    }
    out
}

/// Recent messages of a thread, oldest first. Replying to the e-mail posts
/// to the thread.
pub fn thread_mail(subject: &str, messages: &[MailMessage], unsubscribe_url: &str) -> Rendered {
    let mut content = String::new();
    let mut text = String::new();
    for message in messages {
        content.push_str(&message_html(message));
        text.push_str(&message_text(message));
        text.push_str("\n---\n\n");
    }
    content.push_str("<p>Reply to this e-mail to respond.</p>");
    text.push_str(&format!(
        "Reply to this e-mail to respond.\n\nTurn off these e-mails: {unsubscribe_url}\n"
    ));
    Rendered {
        subject: subject.to_string(),
        html: layout(subject, &content, Some(&unsubscribe_footer(unsubscribe_url))),
        text,
    }
}

pub fn invitation(
    event: &Event,
    inviter: &str,
    rsvp_url: &str,
    updated: bool,
    unsubscribe_url: &str,
) -> Rendered {
    let prefix = if updated {
        "Updated invitation to"
    } else {
        "Invitation to"
    };
    let subject = format!("{prefix} {}", event.name);
    let when = event_time(event);

    let mut content = format!(
        "<h2>{}</h2><p>{} invited you.</p><p><strong>When:</strong> {}</p>",
        escape(&event.name),
        escape(inviter),
        escape(&when)
    );
    let mut text = format!("{}\n\n{inviter} invited you.\nWhen: {when}\n", event.name);
    if !event.address.is_empty() {
        content.push_str(&format!("<p><strong>Where:</strong> {}</p>", escape(&event.address)));
        text.push_str(&format!("Where: {}\n", event.address));
    }
    if !event.description.is_empty() {
        content.push_str(&markdown(&event.description));
        text.push_str(&format!("\n{}\n", event.description));
    }
    content.push_str(&button(rsvp_url, "I'm going"));
    text.push_str(&format!("\nRSVP: {rsvp_url}\n\nTurn off these e-mails: {unsubscribe_url}\n"));

    Rendered {
        html: layout(&subject, &content, Some(&unsubscribe_footer(unsubscribe_url))),
        subject,
        text,
    }
}

/// Sent to participants when the owner deletes an event, with the owner's
/// optional note.
pub fn cancellation(event: &Event, owner: &str, note: &str) -> Rendered {
    let subject = format!("Cancelled: {}", event.name);
    let when = event_time(event);
    let mut content = format!(
        "<p>{} cancelled <strong>{}</strong>, planned for {}.</p>",
        escape(owner),
        escape(&event.name),
        escape(&when)
    );
    let mut text = format!("{owner} cancelled {}, planned for {when}.\n", event.name);
    if !note.trim().is_empty() {
        content.push_str("<blockquote>");
        content.push_str(&markdown(note.trim()));
        content.push_str("</blockquote>");
        text.push_str(&format!("\n{}\n", note.trim()));
    }
    Rendered {
        html: layout(&subject, &content, None),
        subject,
        text,
    }
}

pub fn verification(email: &str, url: &str) -> Rendered {
    let subject = format!("Verify your e-mail for {APP_NAME}");
    let content = format!(
        "<p>Confirm that {} belongs to you.</p>{}",
        escape(email),
        button(url, "Verify e-mail")
    );
    Rendered {
        html: layout(&subject, &content, None),
        text: format!("Confirm that {email} belongs to you:\n{url}\n"),
        subject,
    }
}

pub fn password_reset(url: &str) -> Rendered {
    let subject = format!("Reset your {APP_NAME} password");
    let content = format!(
        "<p>Someone asked to reset your password. Ignore this e-mail if it wasn't you.</p>{}",
        button(url, "Choose a new password")
    );
    Rendered {
        html: layout(&subject, &content, None),
        text: format!(
            "Someone asked to reset your password. Ignore this e-mail if it wasn't you.\n\n{url}\n"
        ),
        subject,
    }
}

pub fn magic_login(url: &str) -> Rendered {
    let subject = format!("Sign in to {APP_NAME}");
    let content = format!(
        "<p>Use this link to sign in. It works for 24 hours.</p>{}",
        button(url, "Sign in")
    );
    Rendered {
        html: layout(&subject, &content, None),
        text: format!("Use this link to sign in. It works for 24 hours.\n\n{url}\n"),
        subject,
    }
}

/// A reply arrived for a conversation that no longer exists.
pub fn try_again(original_subject: &str) -> Rendered {
    let subject = format!("Re: {original_subject}");
    let body = format!(
        "We couldn't deliver your reply: the conversation it belongs to is gone. \
         Please open {APP_NAME} and try again."
    );
    Rendered {
        html: layout(&subject, &format!("<p>{}</p>", escape(&body)), None),
        text: format!("{body}\n"),
        subject,
    }
}

/// A reply came from an address that is not part of the conversation.
pub fn unrecognized_sender(sender: &str, original_subject: &str) -> Rendered {
    let subject = format!("Re: {original_subject}");
    let body = format!(
        "We couldn't deliver your reply because {sender} is not part of this conversation. \
         Reply from the address the conversation was sent to, or add this address to \
         your {APP_NAME} account."
    );
    Rendered {
        html: layout(&subject, &format!("<p>{}</p>", escape(&body)), None),
        text: format!("{body}\n"),
        subject,
    }
}

pub fn digest(
    first_name: &str,
    upcoming: &[&Event],
    sections: &[DigestSection],
    unsubscribe_url: &str,
) -> Rendered {
    let subject = format!("Your {APP_NAME} digest");
    let greeting = if first_name.is_empty() {
        "Hi,".to_string()
    } else {
        format!("Hi {first_name},")
    };
    let mut content = format!("<p>{}</p>", escape(&greeting));
    let mut text = format!("{greeting}\n\n");

    if !upcoming.is_empty() {
        content.push_str("<h2>Coming up</h2><ul>");
        text.push_str("Coming up\n");
        for event in upcoming {
            let when = event_time(event);
            content.push_str(&format!(
                "<li><strong>{}</strong>, {}</li>",
                escape(&event.name),
                escape(&when)
            ));
            text.push_str(&format!("- {}, {when}\n", event.name));
        }
        content.push_str("</ul>");
        text.push('\n');
    }

    for section in sections {
        content.push_str(&format!("<h2>{}</h2>", escape(&section.name)));
        text.push_str(&format!("{}\n\n", section.name));
        for message in &section.messages {
            content.push_str(&message_html(message));
            text.push_str(&message_text(message));
            text.push('\n');
        }
    }
    text.push_str(&format!("Turn off the digest: {unsubscribe_url}\n"));

    Rendered {
        html: layout(&subject, &content, Some(&unsubscribe_footer(unsubscribe_url))),
        subject,
        text,
    }
}

pub const WELCOME_SUBJECT: &str = "Welcome to Convo";

/// Body of the first message in a new user's welcome thread.
pub fn welcome_body(first_name: &str) -> String {
    let name = if first_name.is_empty() { "there" } else { first_name };
    format!(
        "Hi {name}, welcome to **{APP_NAME}**!\n\n\
         This is a conversation. Start your own to talk with up to ten friends, \
         or create an event and invite as many as you like.\n\n\
         - Reply here any time if you have a question.\n\
         - Friends without the app can join in by e-mail.\n"
    )
}
