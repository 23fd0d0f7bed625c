use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use watchpost::{
    AlertEmail, Category, EmailDispatcher, EmailJob, EmailStatus, Logbook, MailTransport,
};

/// Transport that records every message and optionally fails with a fixed reason.
#[derive(Default)]
struct ScriptedMailer {
    sent: Mutex<Vec<AlertEmail>>,
    failure: Option<String>,
}

impl MailTransport for ScriptedMailer {
    fn send(&self, email: &AlertEmail) -> Result<()> {
        self.sent.lock().unwrap().push(email.clone());
        match &self.failure {
            Some(reason) => Err(anyhow!("{}", reason)),
            None => Ok(()),
        }
    }
}

/// Transport that blocks inside `send` until released.
struct GatedMailer {
    started: Sender<()>,
    gate: Receiver<()>,
}

impl MailTransport for GatedMailer {
    fn send(&self, _email: &AlertEmail) -> Result<()> {
        let _ = self.started.send(());
        let _ = self.gate.recv_timeout(Duration::from_secs(10));
        Ok(())
    }
}

/// Transport whose first send panics; later sends succeed.
#[derive(Default)]
struct PanicOnceMailer {
    calls: AtomicUsize,
}

impl MailTransport for PanicOnceMailer {
    fn send(&self, _email: &AlertEmail) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("relay connection reset mid-handshake");
        }
        Ok(())
    }
}

fn job(category: Category, recipient: &str, timestamp: &str) -> EmailJob {
    EmailJob {
        category,
        image_path: PathBuf::from("fire_alert_20240309_140507.jpg"),
        timestamp: timestamp.to_string(),
        source: "Webcam 0".to_string(),
        recipient: recipient.to_string(),
    }
}

#[test]
fn empty_recipient_sends_nothing_and_logs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let mailer = Arc::new(ScriptedMailer::default());
    let dispatcher = EmailDispatcher::spawn(mailer.clone(), Arc::clone(&logbook), 4).unwrap();

    dispatcher.dispatch(job(Category::Fire, "", "2024-03-09 14:05:07"));
    dispatcher.close();

    assert!(mailer.sent.lock().unwrap().is_empty());
    assert!(logbook.emails().is_empty());
}

#[test]
fn successful_send_is_logged_with_alert_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let mailer = Arc::new(ScriptedMailer::default());
    let dispatcher = EmailDispatcher::spawn(mailer.clone(), Arc::clone(&logbook), 4).unwrap();

    dispatcher.dispatch(job(Category::Accident, "ops@example.com", "2024-03-09 14:05:07"));
    dispatcher.close();

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "\u{2757} Accident Detection Alert!");
    assert!(sent[0].html.contains("<b>Video Source:</b> Webcam 0"));

    let rows = logbook.emails();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, "2024-03-09 14:05:07");
    assert_eq!(rows[0].category, "Accident");
    assert_eq!(rows[0].recipient, "ops@example.com");
    assert_eq!(rows[0].status, EmailStatus::Success);
}

#[test]
fn failed_send_is_logged_with_reason() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let mailer = Arc::new(ScriptedMailer {
        sent: Mutex::new(Vec::new()),
        failure: Some("535 authentication rejected".to_string()),
    });
    let dispatcher = EmailDispatcher::spawn(mailer.clone(), Arc::clone(&logbook), 4).unwrap();

    dispatcher.dispatch(job(Category::Weapon, "ops@example.com", "2024-03-09 14:05:07"));
    dispatcher.close();

    let rows = logbook.emails();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].status,
        EmailStatus::Failed("535 authentication rejected".to_string())
    );
    assert_eq!(rows[0].status.to_string(), "Failed: 535 authentication rejected");

    let raw = std::fs::read_to_string(logbook.email_log_path()).unwrap();
    assert!(raw.contains("Failed: 535 authentication rejected"));
}

#[test]
fn full_queue_drops_the_job_and_records_it() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let (started_tx, started_rx) = bounded(4);
    let (gate_tx, gate_rx) = bounded(4);
    let dispatcher = EmailDispatcher::spawn(
        Arc::new(GatedMailer {
            started: started_tx,
            gate: gate_rx,
        }),
        Arc::clone(&logbook),
        1,
    )
    .unwrap();

    dispatcher.dispatch(job(Category::Fire, "ops@example.com", "2024-03-09 14:05:07"));
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // One job waits in the queue, the next finds it full.
    dispatcher.dispatch(job(Category::Weapon, "ops@example.com", "2024-03-09 14:05:08"));
    dispatcher.dispatch(job(Category::Accident, "ops@example.com", "2024-03-09 14:05:09"));

    let rows = logbook.emails();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].category, "Accident");
    assert_eq!(
        rows[0].status,
        EmailStatus::Failed("dropped: email queue full".to_string())
    );

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    dispatcher.close();

    let rows = logbook.emails();
    assert_eq!(rows.len(), 3);
    let delivered = rows
        .iter()
        .filter(|row| row.status == EmailStatus::Success)
        .count();
    assert_eq!(delivered, 2);
}

#[test]
fn closed_dispatcher_records_late_jobs_as_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let dispatcher =
        EmailDispatcher::spawn(Arc::new(ScriptedMailer::default()), Arc::clone(&logbook), 2)
            .unwrap();

    dispatcher.close();
    dispatcher.dispatch(job(Category::Fire, "ops@example.com", "2024-03-09 14:05:07"));

    let rows = logbook.emails();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].status,
        EmailStatus::Failed("dropped: email worker stopped".to_string())
    );
}

#[test]
fn panicking_transport_is_logged_and_worker_survives() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let mailer = Arc::new(PanicOnceMailer::default());
    let dispatcher = EmailDispatcher::spawn(mailer.clone(), Arc::clone(&logbook), 4).unwrap();

    dispatcher.dispatch(job(Category::Fire, "ops@example.com", "2024-03-09 14:05:07"));
    dispatcher.dispatch(job(Category::Weapon, "ops@example.com", "2024-03-09 14:05:08"));
    dispatcher.close();

    assert_eq!(mailer.calls.load(Ordering::SeqCst), 2);
    let rows = logbook.emails();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].category, "Fire");
    assert_eq!(
        rows[0].status,
        EmailStatus::Failed("mail transport panicked".to_string())
    );
    assert_eq!(rows[1].category, "Weapon");
    assert_eq!(rows[1].status, EmailStatus::Success);
}
