use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use watchpost::{
    AlertCoordinator, AlertEmail, AlertFlags, Annotator, BoundingBox, Category, DetectionResult,
    Detector, EmailDispatcher, EmailStatus, Frame, FrameProcessor, Logbook, MailTransport,
    ModelRegistry, ModelSet, PipelineSettings, RunGate, SilentSound, StubDetector,
    SuppressionTimer,
};

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<AlertEmail>>,
}

impl MailTransport for RecordingMailer {
    fn send(&self, email: &AlertEmail) -> Result<()> {
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    logbook: Arc<Logbook>,
    mailer: Arc<RecordingMailer>,
    coordinator: Arc<AlertCoordinator>,
    flags: Arc<AlertFlags>,
    processor: FrameProcessor,
}

fn harness(detectors: Vec<StubDetector>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let mailer = Arc::new(RecordingMailer::default());
    let email = EmailDispatcher::spawn(mailer.clone(), Arc::clone(&logbook), 8).unwrap();
    let coordinator = Arc::new(AlertCoordinator::new(
        Arc::clone(&logbook),
        Box::new(SilentSound),
        email,
    ));

    let mut set: BTreeMap<Category, Box<dyn Detector>> = BTreeMap::new();
    for detector in detectors {
        set.insert(detector.category(), Box::new(detector));
    }
    let flags = Arc::new(AlertFlags::new());
    let processor = FrameProcessor::new(
        ModelRegistry::with_models(ModelSet::new(set)),
        Arc::clone(&flags),
        Arc::clone(&coordinator),
        Annotator::boxes_only(),
    );
    Harness {
        _dir: dir,
        logbook,
        mailer,
        coordinator,
        flags,
        processor,
    }
}

fn settings(recipient: &str) -> PipelineSettings {
    PipelineSettings {
        active: Category::ALL.into_iter().collect::<BTreeSet<_>>(),
        email_recipient: recipient.to_string(),
        sound_enabled: false,
        source_label: "Webcam 0".to_string(),
    }
}

fn black_frame(index: u64) -> Frame {
    Frame::new(RgbImage::new(64, 48), index)
}

fn scored(category: Category, label: &str, confidence: f32) -> StubDetector {
    StubDetector::constant(
        category,
        vec![DetectionResult::new(
            category,
            label,
            confidence,
            BoundingBox::new(8.0, 8.0, 40.0, 32.0),
        )],
    )
}

#[test]
fn sustained_detection_alerts_once_per_window() {
    let h = harness(vec![StubDetector::always(Category::Fire)]);
    let settings = settings("ops@example.com");

    let alerts: usize = (0..30)
        .map(|i| h.processor.process(&black_frame(i), &settings).alerts.len())
        .sum();
    assert_eq!(alerts, 1);
    assert!(h.flags.is_armed(Category::Fire));

    h.coordinator.shutdown();
    let rows = h.logbook.detections();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].category, "Fire");
    assert_eq!(rows[0].details, "Source: Webcam 0");

    let sent = h.mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "ops@example.com");
    assert!(sent[0].image_path.exists());
    assert_eq!(h.logbook.emails()[0].status, EmailStatus::Success);
    assert_eq!(h.logbook.emails()[0].timestamp, rows[0].timestamp);
}

#[test]
fn suppression_timer_allows_one_alert_per_window() {
    let h = harness(vec![StubDetector::always(Category::Accident)]);
    let window = Duration::from_millis(400);
    let timer = SuppressionTimer::spawn(Arc::clone(&h.flags), window).unwrap();
    let settings = settings("");

    let started = Instant::now();
    let mut fired_at = Vec::new();
    let mut index = 0;
    while started.elapsed() < Duration::from_millis(1000) {
        let processed = h.processor.process(&black_frame(index), &settings);
        if !processed.alerts.is_empty() {
            fired_at.push(started.elapsed());
        }
        index += 1;
        std::thread::sleep(Duration::from_millis(5));
    }
    drop(timer);

    // Windows end at 400ms and 800ms.
    assert_eq!(fired_at.len(), 3, "alerts at {:?}", fired_at);
    assert!(fired_at
        .windows(2)
        .all(|pair| pair[1] - pair[0] >= Duration::from_millis(350)));
    assert_eq!(h.logbook.detections().len(), 3);
}

#[test]
fn closed_run_gate_skips_detection_and_alerts() {
    let h = harness(vec![StubDetector::always(Category::Weapon)]);
    let settings = settings("ops@example.com");
    let gate = RunGate::new();
    gate.close();

    let processed = h
        .processor
        .process_within(&black_frame(0), &settings, &gate);
    assert!(processed.alerts.is_empty());
    assert!(processed.labels.is_empty());
    assert!(!h.flags.is_armed(Category::Weapon));

    h.coordinator.shutdown();
    assert!(h.logbook.detections().is_empty());
    assert!(h.mailer.sent.lock().unwrap().is_empty());
}

#[test]
fn clearing_flags_rearms_every_category() {
    let h = harness(vec![
        StubDetector::always(Category::Fire),
        StubDetector::always(Category::Weapon),
    ]);
    let settings = settings("");

    let first = h.processor.process(&black_frame(0), &settings);
    assert_eq!(first.alerts, vec![Category::Fire, Category::Weapon]);
    assert!(h.processor.process(&black_frame(1), &settings).alerts.is_empty());

    h.flags.reset_all();
    let again = h.processor.process(&black_frame(2), &settings);
    assert_eq!(again.alerts, vec![Category::Fire, Category::Weapon]);
    assert_eq!(h.logbook.detections().len(), 4);
}

#[test]
fn thresholds_apply_at_the_boundary() {
    let h = harness(vec![
        scored(Category::Weapon, "knife", 0.4),
        scored(Category::Fire, "fire", 0.5),
        scored(Category::Accident, "crash", 0.51),
    ]);

    let out = h.processor.process(&black_frame(0), &settings(""));
    assert_eq!(out.alerts, vec![Category::Accident, Category::Weapon]);
    assert_eq!(out.label_set(), vec!["Accident".to_string(), "knife".to_string()]);
}

#[test]
fn failing_detector_does_not_block_the_others() {
    let h = harness(vec![
        StubDetector::failing(Category::Fire, "tensor shape mismatch"),
        StubDetector::always(Category::Weapon),
    ]);

    let out = h.processor.process(&black_frame(0), &settings(""));
    assert_eq!(out.alerts, vec![Category::Weapon]);
    assert_eq!(out.labels, vec!["Weapon".to_string()]);
}

#[test]
fn object_detections_are_drawn_but_never_alert() {
    let h = harness(vec![scored(Category::Object, "person", 0.05)]);
    let input = black_frame(0);

    let out = h.processor.process(&input, &settings("ops@example.com"));
    assert!(out.alerts.is_empty());
    assert_eq!(out.labels, vec!["person".to_string()]);
    assert_ne!(out.display.image(), input.image());
    assert_eq!(out.display.image(), out.email.image());

    h.coordinator.shutdown();
    assert!(h.logbook.detections().is_empty());
    assert!(h.mailer.sent.lock().unwrap().is_empty());
}

#[test]
fn inactive_categories_are_skipped() {
    let h = harness(vec![StubDetector::always(Category::Accident)]);
    let mut settings = settings("");
    settings.active.remove(&Category::Accident);

    let input = black_frame(0);
    let out = h.processor.process(&input, &settings);
    assert!(out.labels.is_empty());
    assert_eq!(out.display.image(), input.image());
    assert!(!h.flags.is_armed(Category::Accident));
}

#[test]
fn frames_pass_through_until_models_are_ready() {
    let dir = tempfile::tempdir().unwrap();
    let logbook = Arc::new(Logbook::open(dir.path()).unwrap());
    let email = EmailDispatcher::spawn(
        Arc::new(RecordingMailer::default()),
        Arc::clone(&logbook),
        1,
    )
    .unwrap();
    let coordinator = Arc::new(AlertCoordinator::new(logbook, Box::new(SilentSound), email));
    let processor = FrameProcessor::new(
        ModelRegistry::new(),
        Arc::new(AlertFlags::new()),
        coordinator,
        Annotator::boxes_only(),
    );

    let input = black_frame(3);
    let out = processor.process(&input, &settings(""));
    assert_eq!(out.display.image(), input.image());
    assert_eq!(out.display.index(), 3);
    assert!(out.labels.is_empty());
}

#[test]
fn frame_dependent_detector_sees_the_unannotated_frame() {
    // The weapon detector runs after fire; it must not see the fire overlay.
    let h = harness(vec![
        StubDetector::always(Category::Fire),
        StubDetector::from_fn(Category::Weapon, |frame| {
            if frame.image().pixels().any(|p| p.0 != [0, 0, 0]) {
                Err(anyhow!("frame was modified before detection"))
            } else {
                Ok(Vec::new())
            }
        }),
    ]);

    let out = h.processor.process(&black_frame(0), &settings(""));
    assert_eq!(out.labels, vec!["Fire".to_string()]);
}
