//! E-mail job worker.
//!
//! Jobs arrive from the queue (`POST /tasks/emails` or the in-process
//! consumer). A failure to reach one recipient is logged and the batch goes
//! on; the job itself fails only when its aggregate cannot be loaded.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use convo_shared::address::reply_address;
use convo_shared::constants::{APP_NAME, THREAD_MAIL_MESSAGES};
use convo_shared::magic::{rsvp_salt, token_salt, Action};
use convo_shared::{Key, Kind};
use convo_store::{Context, Event, Message, Named, Readable, Thread, User, UserPartial};

use super::messages::Draft;
use crate::clients::{Attachment, EmailJob, JobAction, JobType, OutboundEmail, Recipient};
use crate::error::{alarm, OpExt, ServerError};
use crate::render::{self, ics, MailMessage, Rendered};
use crate::state::AppState;

/// Which subscription a mail belongs to; carried on unsubscribe links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Threads,
    Events,
    Digest,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Threads => "threads",
            Channel::Events => "events",
            Channel::Digest => "digest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "threads" => Some(Channel::Threads),
            "events" => Some(Channel::Events),
            "digest" => Some(Channel::Digest),
            _ => None,
        }
    }
}

pub(crate) fn display_name(partial: &UserPartial) -> String {
    if partial.full_name.is_empty() {
        partial.email.clone()
    } else {
        partial.full_name.clone()
    }
}

pub(crate) fn mail_message(message: &Message, names: &HashMap<Key, String>) -> MailMessage {
    MailMessage {
        author: names
            .get(&message.author)
            .cloned()
            .unwrap_or_else(|| "Someone".to_string()),
        body: message.body.clone(),
        photos: message.photos.clone(),
        link: message.link.clone(),
    }
}

pub(crate) fn recipient(user: &User) -> Recipient {
    Recipient {
        name: user.name(),
        email: user.email.clone(),
    }
}

/// `ids[1..]` decoded as user keys; empty means everyone.
fn recipient_filter(job: &EmailJob) -> Result<Vec<Key>, ServerError> {
    job.ids
        .iter()
        .skip(1)
        .map(|id| Key::decode_kind(id, Kind::User).map_err(ServerError::from))
        .collect()
}

impl AppState {
    pub async fn handle_email_job(&self, ctx: &Context, job: &EmailJob) -> Result<(), ServerError> {
        job.validate()?;
        tracing::debug!(kind = ?job.kind, action = ?job.action, ids = job.ids.len(), "running email job");
        match (job.kind, job.action) {
            (JobType::User, JobAction::SendWelcome) => {
                for id in &job.ids {
                    let key = Key::decode_kind(id, Kind::User)?;
                    if let Err(e) = self.send_welcome(ctx, key).await {
                        alarm("worker.welcome", &e);
                    }
                }
                Ok(())
            }
            (JobType::Event, action) => {
                let key = Key::decode_kind(&job.ids[0], Kind::Event)?;
                let only = recipient_filter(job)?;
                let updated = action == JobAction::SendUpdatedInvites;
                self.send_invites(ctx, key, &only, updated)
                    .await
                    .op(format!("worker.invites(event={key})"))
            }
            (JobType::Thread, _) => {
                let key = Key::decode_kind(&job.ids[0], Kind::Thread)?;
                let only = recipient_filter(job)?;
                let Some(thread) = self.ds.get_opt::<Thread>(ctx, key).await? else {
                    tracing::info!(thread = %key, "thread gone, no mail sent");
                    return Ok(());
                };
                self.send_thread_mail(ctx, &thread, &only)
                    .await
                    .op(format!("worker.thread(thread={key})"))
            }
            _ => Err(ServerError::bad_request("unsupported job")),
        }
    }

    pub fn unsubscribe_url(&self, user: &User, channel: Channel) -> String {
        let id = user.key.map(|k| k.encode()).unwrap_or_default();
        self.signer
            .mint(Action::Unsubscribe, &id, &token_salt(&user.token))
            .url_with(&self.config.app_host, "channel", channel.as_str())
    }

    /// Send to one user from `from`. Returns false after alarming when the
    /// gateway refuses it.
    async fn deliver(
        &self,
        user: &User,
        from_name: &str,
        from: &str,
        reply_to: Option<&str>,
        rendered: Rendered,
        attachments: Vec<Attachment>,
    ) -> bool {
        let email = OutboundEmail {
            from_name: from_name.to_string(),
            from: from.to_string(),
            reply_to: reply_to.map(str::to_string),
            to: vec![recipient(user)],
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
            attachments,
        };
        match self.clients.mail.send(&email).await {
            Ok(()) => true,
            Err(e) => {
                alarm("worker.deliver", &format!("{}: {e}", user.email));
                false
            }
        }
    }

    /// Mail from the service itself (links, explainers).
    pub async fn send_system_mail(&self, to: Recipient, rendered: Rendered) -> Result<(), ServerError> {
        let email = OutboundEmail {
            from_name: APP_NAME.to_string(),
            from: format!("no-reply@{}", self.config.mail_domain),
            reply_to: None,
            to: vec![to],
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
            attachments: Vec::new(),
        };
        self.clients.mail.send(&email).await
    }

    /// The last messages of `thread` to every participant who reads it by
    /// e-mail: not registered, subscribed to thread mail, and behind on it.
    pub async fn send_thread_mail(&self, ctx: &Context, thread: &Thread, only: &[Key]) -> Result<(), ServerError> {
        let key = thread.key.ok_or_else(ServerError::not_found)?;
        let candidates: Vec<Key> = thread
            .users
            .iter()
            .copied()
            .filter(|u| only.is_empty() || only.contains(u))
            .filter(|u| !thread.is_read(*u))
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let recipients: Vec<User> = self
            .ds
            .get_multi_opt::<User>(ctx, &candidates)
            .await?
            .into_iter()
            .flatten()
            .filter(|u| !u.registered && u.send_threads && !u.locked)
            .collect();
        if recipients.is_empty() {
            return Ok(());
        }

        let names: HashMap<Key, String> = thread
            .user_partials
            .iter()
            .map(|p| (p.id, display_name(p)))
            .collect();
        let messages = self.ds.recent_messages(ctx, key, THREAD_MAIL_MESSAGES).await?;
        let mut mail: Vec<MailMessage> = messages.iter().map(|m| mail_message(m, &names)).collect();

        // A short window is padded with the thread preview as the opening message.
        if mail.len() < THREAD_MAIL_MESSAGES {
            if let Some(preview) = &thread.preview {
                let first = messages.first().map(|m| m.body.as_str());
                if first != Some(preview.body.as_str()) {
                    mail.insert(
                        0,
                        MailMessage {
                            author: names.get(&thread.owner).cloned().unwrap_or_default(),
                            body: preview.body.clone(),
                            photos: preview.photos.clone(),
                            link: preview.link.clone(),
                        },
                    );
                }
            }
        }
        if mail.is_empty() {
            return Ok(());
        }

        let address = reply_address(&thread.subject, key.id, &self.config.mail_domain);
        let from_name = mail
            .last()
            .map(|m| m.author.clone())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| APP_NAME.to_string());
        let subject = if thread.subject.is_empty() {
            format!("A conversation on {APP_NAME}")
        } else {
            thread.name()
        };

        let mut sent = 0;
        for user in &recipients {
            let rendered = render::thread_mail(
                &subject,
                &mail,
                &self.unsubscribe_url(user, Channel::Threads),
            );
            if self
                .deliver(user, &from_name, &address, Some(&address), rendered, Vec::new())
                .await
            {
                sent += 1;
            }
        }
        tracing::info!(thread = %key, sent, "thread mail sent");
        Ok(())
    }

    /// Invitation with calendar entry and RSVP link to every guest who takes
    /// event mail.
    async fn send_invites(&self, ctx: &Context, key: Key, only: &[Key], updated: bool) -> Result<(), ServerError> {
        let Some(event) = self.ds.get_opt::<Event>(ctx, key).await? else {
            tracing::info!(event = %key, "event gone, no invitations sent");
            return Ok(());
        };
        let now = Utc::now();
        if event.is_past(now) {
            return Ok(());
        }
        let guests: Vec<Key> = event
            .users
            .iter()
            .copied()
            .filter(|u| *u != event.owner)
            .filter(|u| only.is_empty() || only.contains(u))
            .collect();
        let recipients: Vec<User> = self
            .ds
            .get_multi_opt::<User>(ctx, &guests)
            .await?
            .into_iter()
            .flatten()
            .filter(|u| u.send_events && !u.locked)
            .collect();

        let owner = event
            .user_partials
            .iter()
            .find(|p| p.id == event.owner)
            .map(display_name)
            .unwrap_or_else(|| APP_NAME.to_string());
        let address = reply_address(&event.name, key.id, &self.config.mail_domain);
        let calendar = ics::calendar(
            &event,
            &ics::Organizer {
                name: &owner,
                email: &address,
            },
            ics::Method::Request,
            now,
        );
        let attachment = Attachment {
            filename: "invite.ics".into(),
            content_type: "text/calendar; method=REQUEST".into(),
            content: STANDARD.encode(calendar),
        };
        let salt = rsvp_salt(&event.invite_token, false);

        let mut sent = 0;
        for user in &recipients {
            let Some(user_key) = user.key else { continue };
            let rsvp_url = self
                .signer
                .mint(Action::Rsvp, &user_key.encode(), &salt)
                .url_with(&self.config.app_host, "event", &key.encode());
            let rendered = render::invitation(
                &event,
                &owner,
                &rsvp_url,
                updated,
                &self.unsubscribe_url(user, Channel::Events),
            );
            if self
                .deliver(user, &owner, &address, Some(&address), rendered, vec![attachment.clone()])
                .await
            {
                sent += 1;
            }
        }
        tracing::info!(event = %key, sent, updated, "invitations sent");
        Ok(())
    }

    /// Tell every participant but `actor` that `event` is off. Runs after the
    /// event is gone, so it works from the deleted copy.
    pub async fn send_cancellation(&self, ctx: &Context, actor: &User, event: &Event, note: &str) {
        let Some(key) = event.key else { return };
        let guests: Vec<Key> = event
            .users
            .iter()
            .copied()
            .filter(|u| Some(*u) != actor.key)
            .collect();
        let recipients = match self.ds.get_multi_opt::<User>(ctx, &guests).await {
            Ok(users) => users,
            Err(e) => {
                alarm("worker.cancellation", &e);
                return;
            }
        };
        let address = reply_address(&event.name, key.id, &self.config.mail_domain);
        let owner = actor.name();
        let calendar = ics::calendar(
            event,
            &ics::Organizer {
                name: &owner,
                email: &address,
            },
            ics::Method::Cancel,
            Utc::now(),
        );
        let attachment = Attachment {
            filename: "cancel.ics".into(),
            content_type: "text/calendar; method=CANCEL".into(),
            content: STANDARD.encode(calendar),
        };

        for user in recipients.into_iter().flatten().filter(|u| u.send_events && !u.locked) {
            let rendered = render::cancellation(event, &owner, note);
            self.deliver(&user, &owner, &address, None, rendered, vec![attachment.clone()])
                .await;
        }
    }

    /// The support account, created on first use. It owns welcome threads and
    /// never receives mail.
    async fn support_user(&self, ctx: &Context) -> Result<User, ServerError> {
        if let Some(user) = self.user_by_email(ctx, &self.config.support_email).await? {
            return Ok(user);
        }
        let mut user = User::new(&self.config.support_email);
        user.first_name = APP_NAME.to_string();
        user.add_email(&self.config.support_email);
        user.send_digest = false;
        user.send_threads = false;
        user.send_events = false;
        self.commit_user(ctx, &mut user)
            .await
            .op("worker.support_user")?;
        tracing::info!(user = ?user.key, "support user created");
        Ok(user)
    }

    /// Open a welcome thread from the support account unless `user` already
    /// has one, then mail it.
    async fn send_welcome(&self, ctx: &Context, key: Key) -> Result<(), ServerError> {
        let Some(user) = self.ds.get_opt::<User>(ctx, key).await? else {
            return Ok(());
        };
        let support = self.support_user(ctx).await?;
        let support_key = support.key.ok_or_else(ServerError::not_found)?;
        if support_key == key {
            return Ok(());
        }
        let existing = self.ds.threads_for_user(ctx, key).await?;
        if existing.iter().any(|t| t.owner_is(support_key)) {
            return Ok(());
        }

        let thread_key = self
            .ds
            .allocate(ctx, Kind::Thread, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ServerError::Internal("no key allocated".into()))?;
        let draft = Draft {
            body: render::welcome_body(&user.first_name),
            ..Draft::default()
        };
        let (user, support, draft) = (&user, &support, &draft);
        let thread = self
            .ds
            .run_in_transaction(ctx, |ctx| async move {
                let mut thread = Thread::new(support, render::WELCOME_SUBJECT)?;
                thread.key = Some(thread_key);
                thread.add_user(user)?;
                thread.mark_read(support_key, Utc::now());
                self.ds.put(&ctx, &mut thread).await?;
                self.append_message(&ctx, &mut thread, support_key, draft).await?;
                Ok::<_, ServerError>(thread)
            })
            .await
            .op(format!("worker.welcome(user={key})"))?;
        tracing::info!(user = %key, thread = %thread_key, "welcome thread created");
        self.send_thread_mail(ctx, &thread, &[key]).await
    }
}
