//! Replies by e-mail.
//!
//! The mail provider posts each message it receives for the reply domain.
//! Anything the sender got wrong is answered with an explainer and
//! acknowledged, so the provider never retries it; only server failures
//! surface as errors. The same envelope posted twice is stored twice.

use std::sync::OnceLock;

use convo_shared::address::{bare_address, parse_reply_address};
use convo_shared::{Key, Kind};
use convo_store::{Context, Named, Thread};
use regex::Regex;
use serde::Deserialize;

use super::worker::recipient;
use crate::clients::{Recipient, Verb};
use crate::error::{alarm, OpExt, ServerError};
use crate::render;
use crate::state::AppState;

/// SMTP envelope as posted by the provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub from: String,
}

/// The parts of the inbound webhook the ingest reads.
#[derive(Debug, Clone, Default)]
pub struct InboundEmail {
    pub envelope: Envelope,
    /// `From` header; the envelope sender is used when it is empty.
    pub from: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl InboundEmail {
    pub fn sender(&self) -> String {
        if self.from.trim().is_empty() {
            bare_address(&self.envelope.from)
        } else {
            bare_address(&self.from)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Posted(Key),
    /// Acknowledged without storing anything.
    Dropped(String),
}

impl Ingested {
    pub fn describe(&self) -> String {
        match self {
            Ingested::Posted(key) => format!("PASS: message {}", key.encode()),
            Ingested::Dropped(reason) => format!("DROP: {reason}"),
        }
    }
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|<[^>]+>").expect("valid regex"))
}

fn break_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>").expect("valid regex"))
}

/// Plain text out of an HTML part: line breaks kept, tags dropped, the
/// common entities decoded.
pub fn html_to_text(html: &str) -> String {
    let text = break_regex().replace_all(html, "\n");
    let text = tag_regex().replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Signature separators left behind by the stripper.
pub fn trim_trailing_dashes(body: &str) -> String {
    body.trim_end()
        .trim_end_matches(['-', '\u{2013}', '\u{2014}'])
        .trim_end()
        .to_string()
}

impl AppState {
    pub async fn ingest_email(&self, ctx: &Context, email: &InboundEmail) -> Result<Ingested, ServerError> {
        let sender = email.sender();
        if email.envelope.to.len() != 1 {
            tracing::info!(recipients = email.envelope.to.len(), "inbound mail needs exactly one recipient");
            return Ok(Ingested::Dropped("expected exactly one recipient".into()));
        }
        let to = &email.envelope.to[0];

        let thread = match parse_reply_address(to) {
            Some(id) => self.ds.get_opt::<Thread>(ctx, Key::new(Kind::Thread, id)).await?,
            None => None,
        };
        let Some(thread) = thread else {
            tracing::info!(to = %to, "inbound mail for unknown conversation");
            self.explain(&sender, render::try_again(&email.subject)).await;
            return Ok(Ingested::Dropped("unknown conversation".into()));
        };
        let key = thread.key.ok_or_else(ServerError::not_found)?;

        let author = self
            .ds
            .user_by_email(ctx, &sender)
            .await
            .op("inbound.sender")?
            .filter(|u| u.key.is_some_and(|k| thread.has_user(k)));
        let Some(author) = author else {
            alarm(
                "inbound.unrecognized_sender",
                &format!("{sender} is not part of thread {key}"),
            );
            self.explain(&sender, render::unrecognized_sender(&sender, &email.subject))
                .await;
            return Ok(Ingested::Dropped("unrecognized sender".into()));
        };
        let author_key = author.key.ok_or_else(ServerError::not_found)?;

        let body = if email.text.trim().is_empty() {
            html_to_text(&email.html)
        } else {
            email.text.clone()
        };
        let body = self
            .clients
            .stripper
            .strip(&body, &sender)
            .await
            .op("inbound.strip")?;
        let body = trim_trailing_dashes(&body);
        if body.is_empty() {
            tracing::info!(thread = %key, "inbound reply was empty after stripping");
            return Ok(Ingested::Dropped("empty reply".into()));
        }

        let draft = self.prepare_message(key, &body, None).await?;
        let draft = &draft;
        let (message, thread) = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut thread: Thread = self.load_member(&ctx, key, author_key).await?;
                let message = self.append_message(&ctx, &mut thread, author_key, draft).await?;
                Ok::<_, ServerError>((message, thread))
            })
            .await
            .op(format!("inbound.append(thread={key})"))?;
        let message_key = message.key.ok_or_else(|| ServerError::Internal("message without key".into()))?;
        tracing::info!(thread = %key, message = %message_key, "reply ingested");

        self.push(ctx, &author, &thread.users, Verb::NewMessage, key, &thread.name());
        if let Err(e) = self.send_thread_mail(ctx, &thread, &[]).await {
            alarm("inbound.thread_mail", &e);
        }
        Ok(Ingested::Posted(message_key))
    }

    async fn explain(&self, sender: &str, rendered: render::Rendered) {
        if sender.is_empty() {
            return;
        }
        let to = match self.ds.user_by_email(&Context::background(), sender).await {
            Ok(Some(user)) => recipient(&user),
            _ => Recipient {
                name: String::new(),
                email: sender.to_string(),
            },
        };
        if let Err(e) = self.send_system_mail(to, rendered).await {
            alarm("inbound.explain", &e);
        }
    }
}
