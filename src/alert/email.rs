//! Alert email composition and the background send worker.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use crate::config::SmtpSettings;
use crate::error::PipelineError;
use crate::logbook::{EmailLogEntry, EmailStatus, Logbook};
use crate::Category;

/// Content id the HTML body uses to reference the inline snapshot.
pub const INLINE_IMAGE_CID: &str = "detection_img";

const WEAPON_TEMPLATE: &str = r#"
<html>
<body>
    <h2 style="color: #BF616A;">Weapon Detection Alert!</h2>
    <p>A potential weapon has been detected by the surveillance system.</p>
    <p><b>Time of Detection:</b> {timestamp}</p>
    <p><b>Video Source:</b> {source}</p>
    <p>Please review the attached image immediately and take appropriate action.</p>
    <br>
    <img src="cid:detection_img">
</body>
</html>
"#;

const FIRE_TEMPLATE: &str = r#"
<html>
<body>
    <h2 style="color: #D08770;">Fire Detection Alert!</h2>
    <p>A potential fire has been detected.</p>
    <p><b>Time of Detection:</b> {timestamp}</p>
    <p><b>Video Source:</b> {source}</p>
    <p>Immediate attention is required. Please verify the situation and contact emergency services if necessary.</p>
    <br>
    <img src="cid:detection_img">
</body>
</html>
"#;

const ACCIDENT_TEMPLATE: &str = r#"
<html>
<body>
    <h2 style="color: #EBCB8B;">Accident Detection Alert!</h2>
    <p>A potential traffic accident has been detected.</p>
    <p><b>Time of Detection:</b> {timestamp}</p>
    <p><b>Video Source:</b> {source}</p>
    <p>Please review the attached image and dispatch help if needed.</p>
    <br>
    <img src="cid:detection_img">
</body>
</html>
"#;

const OBJECT_TEMPLATE: &str = r#"
<html>
<body>
    <h2 style="color: #A3BE8C;">Object Detection Alert!</h2>
    <p>A specific object of interest has been detected.</p>
    <p><b>Time of Detection:</b> {timestamp}</p>
    <p><b>Video Source:</b> {source}</p>
    <br>
    <img src="cid:detection_img">
</body>
</html>
"#;

fn template(category: Category) -> &'static str {
    match category {
        Category::Weapon => WEAPON_TEMPLATE,
        Category::Fire => FIRE_TEMPLATE,
        Category::Accident => ACCIDENT_TEMPLATE,
        Category::Object => OBJECT_TEMPLATE,
    }
}

pub fn subject(category: Category) -> String {
    format!("\u{2757} {} Detection Alert!", category.display_name())
}

pub fn render_body(category: Category, timestamp: &str, source: &str) -> String {
    template(category)
        .replace("{timestamp}", timestamp)
        .replace("{source}", source)
}

/// One alert send request, as handed from the alert path to the worker.
#[derive(Clone, Debug, PartialEq)]
pub struct EmailJob {
    pub category: Category,
    pub image_path: PathBuf,
    pub timestamp: String,
    pub source: String,
    pub recipient: String,
}

/// A fully composed alert message.
#[derive(Clone, Debug)]
pub struct AlertEmail {
    pub recipient: String,
    pub subject: String,
    pub html: String,
    pub image_path: PathBuf,
}

impl AlertEmail {
    pub fn compose(job: &EmailJob) -> Self {
        Self {
            recipient: job.recipient.clone(),
            subject: subject(job.category),
            html: render_body(job.category, &job.timestamp, &job.source),
            image_path: job.image_path.clone(),
        }
    }
}

/// Outbound mail submission.
pub trait MailTransport: Send + Sync {
    fn send(&self, email: &AlertEmail) -> Result<()>;
}

/// SMTP submission over implicit TLS with login credentials.
pub struct SmtpMailer {
    settings: SmtpSettings,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn build_message(&self, email: &AlertEmail) -> Result<Message> {
        let from: Mailbox = self
            .settings
            .sender
            .parse()
            .map_err(|e| anyhow!("invalid sender address '{}': {}", self.settings.sender, e))?;
        let to: Mailbox = email
            .recipient
            .parse()
            .map_err(|e| anyhow!("invalid recipient address '{}': {}", email.recipient, e))?;
        let image = std::fs::read(&email.image_path)
            .with_context(|| format!("failed to read snapshot {}", email.image_path.display()))?;
        let jpeg = ContentType::parse("image/jpeg").map_err(|e| anyhow!("{}", e))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(email.subject.clone())
            .multipart(
                MultiPart::related()
                    .singlepart(SinglePart::html(email.html.clone()))
                    .singlepart(
                        Attachment::new_inline(INLINE_IMAGE_CID.to_string()).body(image, jpeg),
                    ),
            )
            .map_err(|e| anyhow!("failed to build message: {}", e))?;
        Ok(message)
    }
}

impl MailTransport for SmtpMailer {
    fn send(&self, email: &AlertEmail) -> Result<()> {
        let message = self.build_message(email)?;
        let mailer = SmtpTransport::relay(&self.settings.host)
            .with_context(|| format!("failed to configure SMTP relay {}", self.settings.host))?
            .port(self.settings.port)
            .credentials(Credentials::new(
                self.settings.username.clone(),
                self.settings.password.clone(),
            ))
            .build();
        mailer
            .send(&message)
            .map_err(|e| anyhow!("SMTP submission failed: {}", e))?;
        Ok(())
    }
}

/// Perform one send and record its outcome. Never retries.
///
/// A panicking transport is recorded as a failed send; the worker keeps running.
pub fn deliver(transport: &dyn MailTransport, logbook: &Logbook, job: &EmailJob) {
    if job.recipient.is_empty() {
        return;
    }
    let email = AlertEmail::compose(job);
    let sent = panic::catch_unwind(AssertUnwindSafe(|| transport.send(&email)))
        .unwrap_or_else(|_| Err(anyhow!("mail transport panicked")));
    let status = match sent {
        Ok(()) => {
            log::info!(
                "{} alert email sent to {}",
                job.category.display_name(),
                job.recipient
            );
            EmailStatus::Success
        }
        Err(err) => {
            let failure = PipelineError::EmailSendFailure(format!("{:#}", err));
            log::warn!("{}", failure);
            EmailStatus::Failed(format!("{:#}", err))
        }
    };
    let entry = EmailLogEntry::new(job.category, &job.timestamp, &job.recipient, status);
    if let Err(err) = logbook.append_email(entry) {
        log::error!("{}", err);
    }
}

/// Single background consumer over a bounded job queue.
///
/// `dispatch` never blocks: when the queue is full the job is dropped, a warning is
/// logged, and a failed row is written to the email log.
pub struct EmailDispatcher {
    tx: Mutex<Option<Sender<EmailJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    logbook: Arc<Logbook>,
}

impl EmailDispatcher {
    pub fn spawn(
        transport: Arc<dyn MailTransport>,
        logbook: Arc<Logbook>,
        queue_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<EmailJob>(queue_depth.max(1));
        let worker_logbook = Arc::clone(&logbook);
        let handle = std::thread::Builder::new()
            .name("email-worker".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    deliver(transport.as_ref(), &worker_logbook, &job);
                }
            })
            .context("failed to spawn email worker")?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            logbook,
        })
    }

    pub fn dispatch(&self, job: EmailJob) {
        if job.recipient.is_empty() {
            return;
        }
        let sent = match lock(&self.tx).as_ref() {
            Some(tx) => tx.try_send(job),
            None => Err(TrySendError::Disconnected(job)),
        };
        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                log::warn!(
                    "email queue full; dropping {} alert email to {}",
                    job.category.display_name(),
                    job.recipient
                );
                self.record_drop(&job, "dropped: email queue full");
            }
            Err(TrySendError::Disconnected(job)) => {
                log::warn!("email worker stopped; dropping alert email to {}", job.recipient);
                self.record_drop(&job, "dropped: email worker stopped");
            }
        }
    }

    fn record_drop(&self, job: &EmailJob, reason: &str) {
        let entry = EmailLogEntry::new(
            job.category,
            &job.timestamp,
            &job.recipient,
            EmailStatus::Failed(reason.to_string()),
        );
        if let Err(err) = self.logbook.append_email(entry) {
            log::error!("{}", err);
        }
    }

    /// Stop accepting jobs, finish the queued ones, and join the worker.
    pub fn close(&self) {
        lock(&self.tx).take();
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for EmailDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
