//! Fan-out: push notifications and queued e-mail.
//!
//! Both sinks are best effort. Failures go to the alarm log and never reach
//! the request that triggered them. A cancelled request queues nothing.

use convo_shared::{Key, Kind};
use convo_store::{Context, Named, User};
use futures::future::join_all;

use crate::clients::{EmailJob, JobAction, JobType, PushNotification, Verb};
use crate::error::alarm;
use crate::state::AppState;

impl AppState {
    /// Push `verb` on `target` to every recipient except the actor. Does not
    /// wait for delivery.
    pub fn push(
        &self,
        ctx: &Context,
        actor: &User,
        recipients: &[Key],
        verb: Verb,
        target: Key,
        target_name: &str,
    ) {
        if ctx.check().is_err() {
            return;
        }
        let recipients: Vec<String> = recipients
            .iter()
            .filter(|k| Some(**k) != actor.key)
            .map(Key::encode)
            .collect();
        if recipients.is_empty() {
            return;
        }
        let notification = PushNotification {
            actor_name: actor.name(),
            verb,
            target: match target.kind {
                Kind::Event => "event",
                _ => "thread",
            }
            .to_string(),
            target_id: target.encode(),
            target_name: target_name.to_string(),
        };

        let push = self.clients.push.clone();
        tokio::spawn(async move {
            let sends = recipients.iter().map(|r| push.send(r, &notification));
            for (recipient, result) in recipients.iter().zip(join_all(sends).await) {
                if let Err(e) = result {
                    alarm("notify.push", &format!("{recipient}: {e}"));
                }
            }
        });
    }

    /// Queue an e-mail job.
    pub async fn enqueue(&self, ctx: &Context, kind: JobType, action: JobAction, ids: Vec<String>) {
        if ctx.check().is_err() {
            return;
        }
        let job = match EmailJob::new(kind, action, ids) {
            Ok(job) => job,
            Err(e) => {
                alarm("notify.enqueue", &e);
                return;
            }
        };
        if let Err(e) = self.clients.queue.enqueue(&job).await {
            alarm("notify.enqueue", &e);
        } else {
            tracing::debug!(kind = ?job.kind, action = ?job.action, ids = job.ids.len(), "job queued");
        }
    }

    pub async fn enqueue_welcome(&self, ctx: &Context, created: &[Key]) {
        if created.is_empty() {
            return;
        }
        let ids = created.iter().map(Key::encode).collect();
        self.enqueue(ctx, JobType::User, JobAction::SendWelcome, ids).await;
    }

    /// Thread mail for `thread`, narrowed to `only` when it is non-empty.
    pub async fn enqueue_thread_mail(&self, ctx: &Context, thread: Key, only: &[Key]) {
        let mut ids = vec![thread.encode()];
        ids.extend(only.iter().map(Key::encode));
        self.enqueue(ctx, JobType::Thread, JobAction::SendThread, ids).await;
    }

    pub async fn enqueue_invites(&self, ctx: &Context, event: Key, only: &[Key], updated: bool) {
        let action = if updated {
            JobAction::SendUpdatedInvites
        } else {
            JobAction::SendInvites
        };
        let mut ids = vec![event.encode()];
        ids.extend(only.iter().map(Key::encode));
        self.enqueue(ctx, JobType::Event, action, ids).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::clients::{JobAction, JobType, Verb};
    use crate::state::testing::TestApp;
    use convo_shared::{Key, Kind};
    use convo_store::Context;

    #[tokio::test]
    async fn test_push_skips_actor() {
        let app = TestApp::new().await;
        let a = app.registered_user("a@x.com", "Ann").await;
        let b = app.registered_user("b@x.com", "Bob").await;
        let thread = Key::new(Kind::Thread, 77);

        app.state.push(
            &Context::background(),
            &a,
            &[a.key.unwrap(), b.key.unwrap()],
            Verb::NewMessage,
            thread,
            "Hi",
        );
        app.settle().await;

        let sent = app.push.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b.key.unwrap().encode());
        assert_eq!(sent[0].1.actor_name, "Ann");
        assert_eq!(sent[0].1.target, "thread");
    }

    #[tokio::test]
    async fn test_cancelled_request_queues_nothing() {
        let mut app = TestApp::new().await;
        let ctx = Context::background();
        ctx.cancel();
        app.state
            .enqueue(&ctx, JobType::Thread, JobAction::SendThread, vec!["x".into()])
            .await;
        assert!(app.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_job_is_not_queued() {
        let mut app = TestApp::new().await;
        app.state
            .enqueue(
                &Context::background(),
                JobType::User,
                JobAction::SendThread,
                vec!["x".into()],
            )
            .await;
        assert!(app.jobs.try_recv().is_err());
    }
}
