//! Status notification batching and delivery
//!
//! Notification is an observability side channel, never part of the
//! correctness contract: a transport failure is logged and swallowed. The
//! runner instantiates one [`Notifier`] per batch run and passes it by
//! reference, so concurrent runners on different devices stay isolated.
//!
//! The once-per-experiment versus per-event behavior is an injected
//! [`NotifyPolicy`], not branches scattered through stage code. With
//! `email_verbose = false` only start-of-batch and end-of-batch events are
//! ever emitted; with `true`, every stage transition additionally emits an
//! event, coalesced per descriptor when the policy says so.

use crate::config::EmailConfig;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Email delivery failure. Logged and swallowed, never fatal.
#[derive(Debug, Error)]
#[error("email transport: {0}")]
pub struct TransportError(pub String);

/// Email transport capability.
pub trait EmailTransport: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;
}

/// Transport that prints messages to stdout instead of dialing SMTP.
/// The default for CLI runs; a real transport is injected through the
/// library API.
pub struct LogTransport;

impl EmailTransport for LogTransport {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        println!("[email to {to}] {subject}");
        if !body.is_empty() {
            println!("{body}");
        }
        Ok(())
    }
}

/// One delivered message, as captured by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Transport that buffers messages in memory. Used in tests and dry runs.
#[derive(Default)]
pub struct MemoryTransport {
    messages: Mutex<Vec<SentMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<SentMessage> {
        self.messages.lock().expect("transport lock poisoned").clone()
    }
}

impl EmailTransport for MemoryTransport {
    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        self.messages
            .lock()
            .map_err(|_| TransportError("transport lock poisoned".into()))?
            .push(SentMessage {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}

/// Outbound message granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
    /// Send each event as it occurs.
    Immediate,
    /// Coalesce all of one descriptor's events into a single message.
    Coalesced,
}

/// Pending status lines plus the countdown of remaining experiments.
/// Scoped to one full batch run.
#[derive(Debug, Default)]
pub struct NotificationBatch {
    pending: Vec<String>,
    remaining: usize,
}

/// Batches and sends status updates per the configured verbosity.
pub struct Notifier {
    transport: Option<Arc<dyn EmailTransport>>,
    reciever: String,
    policy: NotifyPolicy,
    batch: NotificationBatch,
}

impl Notifier {
    pub fn new(
        transport: Option<Arc<dyn EmailTransport>>,
        reciever: impl Into<String>,
        policy: NotifyPolicy,
    ) -> Self {
        Self {
            transport,
            reciever: reciever.into(),
            policy,
            batch: NotificationBatch::default(),
        }
    }

    /// Build a notifier from the config surface. Sending is silently
    /// disabled when the transport settings are incomplete or the secret is
    /// unreadable.
    pub fn from_email_config(config: &EmailConfig) -> Self {
        let policy = if config.once_per_experiment {
            NotifyPolicy::Coalesced
        } else {
            NotifyPolicy::Immediate
        };
        let transport: Option<Arc<dyn EmailTransport>> =
            if config.can_send() && config.read_password().is_some() {
                Some(Arc::new(LogTransport))
            } else {
                if config.send && !config.can_send() {
                    eprintln!(
                        "warning: email sender, reciever, or pw not fully specified, \
                         will not send any emails"
                    );
                }
                None
            };
        Self::new(transport, config.reciever.clone().unwrap_or_default(), policy)
    }

    /// A notifier that never sends anything.
    pub fn disabled() -> Self {
        Self::new(None, "", NotifyPolicy::Coalesced)
    }

    pub fn policy(&self) -> NotifyPolicy {
        self.policy
    }

    /// Start-of-batch event; always emitted.
    pub fn batch_started(&mut self, total: usize) {
        self.batch.remaining = total;
        self.batch.pending.clear();
        self.send("Experiment batch started", &format!("{total} experiment(s) queued"));
    }

    /// Experiment-start transition; emitted only in verbose mode.
    pub fn experiment_started(&mut self, name: &str, verbose: bool) {
        if !verbose {
            return;
        }
        match self.policy {
            NotifyPolicy::Immediate => {
                self.send(&format!("Experiment started for {name}"), "");
            }
            NotifyPolicy::Coalesced => {
                self.batch.pending.push(format!("started {name}"));
            }
        }
    }

    /// Stage transition; emitted only in verbose mode.
    pub fn stage_event(&mut self, name: &str, stage: &str, outcome: &str, verbose: bool) {
        if !verbose {
            return;
        }
        let line = format!("{stage} {outcome} for {name}");
        match self.policy {
            NotifyPolicy::Immediate => self.send(&format!("{name}: {stage} {outcome}"), &line),
            NotifyPolicy::Coalesced => self.batch.pending.push(line),
        }
    }

    /// End-of-experiment transition. In coalesced mode this flushes the
    /// descriptor's buffered events as one message.
    pub fn experiment_ended(&mut self, name: &str, summary: &str, verbose: bool) {
        self.batch.remaining = self.batch.remaining.saturating_sub(1);
        if !verbose {
            self.batch.pending.clear();
            return;
        }
        let footer = format!("{} experiment(s) remaining", self.batch.remaining);
        match self.policy {
            NotifyPolicy::Immediate => {
                self.send(
                    &format!("Experiment ended for {name}"),
                    &format!("{summary}\n{footer}"),
                );
            }
            NotifyPolicy::Coalesced => {
                let mut lines: Vec<String> = self.batch.pending.drain(..).collect();
                lines.push(summary.to_string());
                lines.push(footer);
                self.send(&format!("Experiment ended for {name}"), &lines.join("\n"));
            }
        }
    }

    /// End-of-batch event; always emitted.
    pub fn batch_ended(&mut self, summary: &str) {
        self.send("Experiment batch ended", summary);
        self.batch.pending.clear();
    }

    fn send(&self, subject: &str, body: &str) {
        let Some(transport) = &self.transport else { return };
        if let Err(e) = transport.send(&self.reciever, subject, body) {
            eprintln!("warning: error while trying to send email: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(policy: NotifyPolicy) -> (Notifier, Arc<MemoryTransport>) {
        let transport = MemoryTransport::new();
        let notifier = Notifier::new(Some(transport.clone()), "dev@example.com", policy);
        (notifier, transport)
    }

    fn drive_descriptor(notifier: &mut Notifier, name: &str, verbose: bool) {
        notifier.experiment_started(name, verbose);
        for stage in ["train", "prune", "finetune", "attack"] {
            notifier.stage_event(name, stage, "completed", verbose);
        }
        notifier.experiment_ended(name, "completed", verbose);
    }

    #[test]
    fn test_coalesced_verbose_sends_one_message_per_descriptor() {
        let (mut notifier, transport) = notifier(NotifyPolicy::Coalesced);
        notifier.batch_started(2);
        drive_descriptor(&mut notifier, "resnet20_a", true);
        drive_descriptor(&mut notifier, "resnet20_b", true);
        notifier.batch_ended("2 completed");

        let messages = transport.messages();
        // batch start + one per descriptor + batch end
        assert_eq!(messages.len(), 4);
        assert!(messages[1].subject.contains("resnet20_a"));
        assert!(messages[1].body.contains("prune completed"));
        assert!(messages[1].body.contains("1 experiment(s) remaining"));
        assert!(messages[2].body.contains("0 experiment(s) remaining"));
    }

    #[test]
    fn test_immediate_verbose_sends_per_event() {
        let (mut notifier, transport) = notifier(NotifyPolicy::Immediate);
        notifier.batch_started(1);
        drive_descriptor(&mut notifier, "vgg", true);
        notifier.batch_ended("done");

        // batch start + started + 4 stages + ended + batch end
        assert_eq!(transport.messages().len(), 8);
    }

    #[test]
    fn test_quiet_mode_only_emits_batch_events() {
        for policy in [NotifyPolicy::Coalesced, NotifyPolicy::Immediate] {
            let (mut notifier, transport) = notifier(policy);
            notifier.batch_started(1);
            drive_descriptor(&mut notifier, "vgg", false);
            notifier.batch_ended("done");

            let messages = transport.messages();
            assert_eq!(messages.len(), 2, "policy {policy:?}");
            assert!(messages[0].subject.contains("batch started"));
            assert!(messages[1].subject.contains("batch ended"));
        }
    }

    #[test]
    fn test_transport_failure_is_swallowed() {
        struct FailingTransport;
        impl EmailTransport for FailingTransport {
            fn send(&self, _: &str, _: &str, _: &str) -> Result<(), TransportError> {
                Err(TransportError("smtp refused".into()))
            }
        }
        let mut notifier =
            Notifier::new(Some(Arc::new(FailingTransport)), "dev@example.com", NotifyPolicy::Immediate);
        notifier.batch_started(1);
        drive_descriptor(&mut notifier, "vgg", true);
        notifier.batch_ended("done");
    }

    #[test]
    fn test_incomplete_email_config_disables_sending() {
        let config = EmailConfig { sender: Some("a@example.com".into()), ..Default::default() };
        let notifier = Notifier::from_email_config(&config);
        assert!(notifier.transport.is_none());
        assert_eq!(notifier.policy(), NotifyPolicy::Coalesced);
    }

    #[test]
    fn test_policy_follows_once_per_experiment() {
        let config = EmailConfig { once_per_experiment: false, ..Default::default() };
        assert_eq!(Notifier::from_email_config(&config).policy(), NotifyPolicy::Immediate);
    }
}
