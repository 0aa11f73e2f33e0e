use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use crux_core::testing::AppTester;

use cdss_core::capabilities::{HttpError, HttpHeaders, HttpResponse, StorageEntry, StorageOutput};
use cdss_core::demo::DemoModePolicy;
use cdss_core::session::{self, AuthTokens, HandoffSlot, SessionKeys, UserProfile};
use cdss_core::vitals::PatientVitals;
use cdss_core::{
    get_current_time_ms, AnalysisData, AnalysisPhase, AnalysisSource, App, AppState, Effect,
    ErrorKind, Event, FinalDiagnosis, Model, Prediction, Severity, ToastKind,
};

fn ok_json(body: &serde_json::Value) -> HttpResponse {
    HttpResponse::new(
        200,
        HttpHeaders::new(),
        serde_json::to_vec(body).unwrap(),
        "req-test".to_string(),
        12,
    )
}

fn response(status: u16, body: &[u8]) -> HttpResponse {
    HttpResponse::new(
        status,
        HttpHeaders::new(),
        body.to_vec(),
        "req-test".to_string(),
        12,
    )
}

fn fresh_jwt() -> String {
    let iat = get_current_time_ms() / 1000;
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"iat":{iat}}}"#));
    format!("header.{payload}.signature")
}

/// Enough of a PNG for format sniffing; the core never decodes pixels.
fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}

fn profile() -> UserProfile {
    UserProfile {
        id: Some(7),
        username: "jsmith".to_string(),
        email: "jsmith@example.com".to_string(),
        first_name: String::new(),
        last_name: String::new(),
    }
}

fn signed_in_model(app: &AppTester<App, Effect>) -> Model {
    let keys = SessionKeys::load().unwrap();
    let tokens = AuthTokens {
        access: fresh_jwt(),
        refresh: "refresh-token".to_string(),
    };
    let entries = vec![
        StorageEntry {
            key: keys.tokens,
            value: Some(session::encode_tokens(&tokens).unwrap()),
        },
        StorageEntry {
            key: keys.user,
            value: Some(session::encode_profile(&profile()).unwrap()),
        },
    ];

    let mut model = Model::default();
    app.update(
        Event::SessionRestored(Box::new(Ok(StorageOutput::Multi { entries }))),
        &mut model,
    );
    assert_eq!(model.state, AppState::Ready);
    model
}

fn demo_model(app: &AppTester<App, Effect>) -> Model {
    let mut model = Model::default();
    app.update(Event::DemoLoginRequested, &mut model);
    assert!(model.session_is_demo());
    model
}

fn analyze(image_bytes: Vec<u8>, vitals: PatientVitals) -> Event {
    Event::AnalyzeRequested {
        image_bytes,
        vitals: Box::new(vitals),
    }
}

fn analysis_phase(model: &Model) -> Option<AnalysisPhase> {
    model.analysis.as_ref().map(|a| a.phase)
}

fn scan_response_body(image_id: &str) -> serde_json::Value {
    serde_json::json!({
        "predictions": { "Pneumonia": 0.91, "Normal": 0.09 },
        "severity": "Moderate",
        "imageId": image_id
    })
}

#[test]
fn test_demo_session_serves_mock_after_latency() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);

    // 1. A demo session resolves to the mock path without any probe.
    let update = app.update(analyze(Vec::new(), PatientVitals::default()), &mut model);
    assert_eq!(model.state, AppState::Analyzing);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::MockLatency));

    let has_http = update.effects.iter().any(|e| matches!(e, Effect::Http(_)));
    assert!(!has_http, "demo analysis must not touch the network");
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Timer(_))));

    // 2. The latency timer fires and the canned result lands.
    let generation = model.latency_generation;
    let update = app.update(Event::MockLatencyElapsed { generation }, &mut model);

    assert_eq!(model.state, AppState::Ready);
    assert!(model.analysis.is_none());
    let result = model.last_result.as_ref().expect("mock result");
    assert_eq!(result.analysis.source, AnalysisSource::Demo);
    assert_eq!(result.analysis.top_prediction.label, "Pneumonia");
    // No vitals were given, so no per-condition estimates either.
    assert!(result.condition_likelihoods.is_empty());

    // 3. The result is handed off to storage for the result surface.
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Storage(_))));
}

#[test]
fn test_stale_latency_timer_is_ignored() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);

    app.update(analyze(Vec::new(), PatientVitals::default()), &mut model);
    let generation = model.latency_generation;

    app.update(
        Event::MockLatencyElapsed {
            generation: generation.wrapping_sub(1),
        },
        &mut model,
    );

    assert_eq!(model.state, AppState::Analyzing);
    assert!(model.last_result.is_none());
}

#[test]
fn test_demo_analysis_folds_in_vitals() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);

    let vitals = PatientVitals {
        temperature: Some(39.0),
        has_cough: Some(true),
        ..PatientVitals::default()
    };
    app.update(analyze(Vec::new(), vitals), &mut model);
    let generation = model.latency_generation;
    app.update(Event::MockLatencyElapsed { generation }, &mut model);

    let result = model.last_result.as_ref().expect("mock result");
    assert_eq!(result.risk_level, Severity::High);
    assert!(result.narrative.contains("High fever"));
    assert!(result.narrative.contains("cough"));
    assert!(!result.treatments.is_empty());
    assert!(!result.condition_likelihoods.is_empty());
}

#[test]
fn test_auto_mode_probes_then_uploads() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);

    // 1. No fresh probe answer yet: the analysis waits on a health check.
    let update = app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    assert_eq!(model.state, AppState::Analyzing);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::CheckingBackend));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Http(_))));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Timer(_))));

    // 2. The backend answers healthy and the scan goes up.
    let generation = model.probe.generation();
    let update = app.update(
        Event::ProbeResponse {
            generation,
            result: Box::new(Ok(response(200, b"{\"status\":\"ok\"}"))),
        },
        &mut model,
    );
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Http(_))));

    // 3. The analysis response resolves the run.
    let update = app.update(
        Event::UploadResponse(Box::new(Ok(ok_json(&scan_response_body("scan-42"))))),
        &mut model,
    );

    assert_eq!(model.state, AppState::Ready);
    assert!(model.analysis.is_none());
    let result = model.last_result.as_ref().expect("server result");
    assert_eq!(result.analysis.source, AnalysisSource::Server);
    assert_eq!(result.analysis.top_prediction.label, "Pneumonia");
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Storage(_))));
}

#[test]
fn test_cached_probe_skips_second_health_check() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);

    app.update(Event::BackendProbeRequested, &mut model);
    let generation = model.probe.generation();
    app.update(
        Event::ProbeResponse {
            generation,
            result: Box::new(Ok(response(200, b"{}"))),
        },
        &mut model,
    );

    // With a fresh cached answer, the analysis starts uploading directly.
    let update = app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));

    let http_count = update
        .effects
        .iter()
        .filter(|e| matches!(e, Effect::Http(_)))
        .count();
    assert_eq!(http_count, 1, "only the upload, no second health check");
}

#[test]
fn test_probe_requests_coalesce_while_in_flight() {
    let app = AppTester::<App, Effect>::default();
    let mut model = Model::default();

    let update = app.update(Event::BackendProbeRequested, &mut model);
    let first = update
        .effects
        .iter()
        .filter(|e| matches!(e, Effect::Http(_)))
        .count();
    assert_eq!(first, 1);
    assert!(model.probe.is_in_flight());

    let update = app.update(Event::BackendProbeRequested, &mut model);
    let second = update
        .effects
        .iter()
        .filter(|e| matches!(e, Effect::Http(_)))
        .count();
    assert_eq!(second, 0, "a probe already in flight is reused");
}

#[test]
fn test_probe_wait_bound_degrades_to_demo() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);

    app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::CheckingBackend));

    // 1. The bounded wait expires before the probe answers.
    let generation = model.probe.generation();
    let update = app.update(Event::ProbeWaitElapsed { generation }, &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::MockLatency));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Timer(_))));

    // 2. The late probe answer must not restart the analysis.
    let update = app.update(
        Event::ProbeResponse {
            generation,
            result: Box::new(Ok(response(200, b"{}"))),
        },
        &mut model,
    );
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::MockLatency));
    let has_http = update.effects.iter().any(|e| matches!(e, Effect::Http(_)));
    assert!(!has_http);
}

#[test]
fn test_probe_timeout_counts_as_unavailable() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);

    app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::CheckingBackend));

    let generation = model.probe.generation();
    let error = HttpError::Timeout {
        timeout_ms: 2000,
        request_id: "req-test".to_string(),
    };
    app.update(
        Event::ProbeResponse {
            generation,
            result: Box::new(Err(error)),
        },
        &mut model,
    );

    // An unanswered health check reads as unreachable and the waiting
    // analysis proceeds on the mock path.
    assert_eq!(model.probe.availability(), Some(false));
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::MockLatency));
}

#[test]
fn test_upload_network_failure_falls_back_to_demo() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::Auto;

    app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    let generation = model.probe.generation();
    app.update(
        Event::ProbeResponse {
            generation,
            result: Box::new(Ok(response(200, b"{}"))),
        },
        &mut model,
    );
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));

    let error = HttpError::Connection {
        host: "localhost".to_string(),
        message: "connection refused".to_string(),
    };
    let update = app.update(Event::UploadResponse(Box::new(Err(error))), &mut model);

    // The run still completes, served by the mock generator.
    assert_eq!(model.state, AppState::Ready);
    let result = model.last_result.as_ref().expect("fallback result");
    assert_eq!(result.analysis.source, AnalysisSource::Demo);

    // The override flips on and is persisted so the next run skips the server.
    assert!(model.force_demo);
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Storage(_))));
    assert_eq!(
        model.active_toast.as_ref().map(|t| t.kind),
        Some(ToastKind::Warning)
    );
}

#[test]
fn test_malformed_success_body_falls_back_to_demo() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOff;

    app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));

    // 200 OK with a body that carries no predictions at all.
    app.update(
        Event::UploadResponse(Box::new(Ok(response(200, b"{\"unexpected\":true}")))),
        &mut model,
    );

    assert_eq!(model.state, AppState::Ready);
    let result = model.last_result.as_ref().expect("fallback result");
    assert_eq!(result.analysis.source, AnalysisSource::Demo);
    assert!(model.force_demo);
}

#[test]
fn test_upload_rejection_fails_the_run() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOff;

    app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));

    let body = br#"{"detail":"Scan quality too low"}"#;
    app.update(
        Event::UploadResponse(Box::new(Ok(response(500, body)))),
        &mut model,
    );

    // A reachable server that rejects the scan is a real failure, not a
    // reason to show fabricated results.
    assert_eq!(model.state, AppState::Ready);
    assert!(model.analysis.is_none());
    assert!(model.last_result.is_none());
    assert!(!model.force_demo);
    let error = model.active_error.as_ref().expect("server error");
    assert_eq!(error.kind, ErrorKind::Server);
    assert_eq!(error.message, "Scan quality too low");
}

#[test]
fn test_forced_on_policy_never_probes() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOn;

    let update = app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);

    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::MockLatency));
    let has_http = update.effects.iter().any(|e| matches!(e, Effect::Http(_)));
    assert!(!has_http);
}

#[test]
fn test_forced_off_policy_beats_manual_override() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOff;
    model.force_demo = true;

    let update = app.update(analyze(png_bytes(), PatientVitals::default()), &mut model);

    // Forced-off goes straight to the server, ignoring the manual override.
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Http(_))));
}

#[test]
fn test_second_analysis_request_is_rejected() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);

    app.update(analyze(Vec::new(), PatientVitals::default()), &mut model);
    let generation = model.latency_generation;

    app.update(analyze(Vec::new(), PatientVitals::default()), &mut model);

    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::MockLatency));
    assert_eq!(model.latency_generation, generation);
    let toast = model.active_toast.as_ref().expect("busy toast");
    assert_eq!(toast.kind, ToastKind::Warning);
    assert!(toast.message.contains("already running"));
}

#[test]
fn test_invalid_vitals_block_the_run() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);

    let vitals = PatientVitals {
        temperature: Some(60.0),
        ..PatientVitals::default()
    };
    app.update(analyze(Vec::new(), vitals), &mut model);

    assert_eq!(model.state, AppState::Ready);
    assert!(model.analysis.is_none());
    let error = model.active_error.as_ref().expect("vitals error");
    assert_eq!(error.kind, ErrorKind::Validation);
}

#[test]
fn test_missing_image_fails_only_the_server_path() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOff;

    app.update(analyze(Vec::new(), PatientVitals::default()), &mut model);

    assert!(model.analysis.is_none());
    assert_eq!(model.state, AppState::Ready);
    let error = model.active_error.as_ref().expect("image error");
    assert_eq!(error.kind, ErrorKind::Validation);
    assert!(error.message.contains("X-ray image"));
}

#[test]
fn test_vitals_endpoint_enriches_the_result() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOff;

    let vitals = PatientVitals {
        temperature: Some(38.0),
        ..PatientVitals::default()
    };
    app.update(analyze(png_bytes(), vitals), &mut model);
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::Uploading));

    // 1. The scan result names an image id, so vitals go out as well.
    let update = app.update(
        Event::UploadResponse(Box::new(Ok(ok_json(&scan_response_body("scan-42"))))),
        &mut model,
    );
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::AssessingVitals));
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Http(_))));

    // 2. The vitals-aware response replaces the narrative and severity.
    let body = serde_json::json!({
        "predictions": { "Pneumonia": 0.91, "Normal": 0.09 },
        "severity": "High",
        "diagnosisWithVitals": "Fever alongside the radiological findings."
    });
    app.update(Event::VitalsResponse(Box::new(Ok(ok_json(&body)))), &mut model);

    assert_eq!(model.state, AppState::Ready);
    let result = model.last_result.as_ref().expect("combined result");
    assert_eq!(result.risk_level, Severity::High);
    assert_eq!(
        result.narrative,
        "Fever alongside the radiological findings."
    );
    assert!(!result.condition_likelihoods.is_empty());
}

#[test]
fn test_vitals_endpoint_failure_keeps_scan_result() {
    let app = AppTester::<App, Effect>::default();
    let mut model = signed_in_model(&app);
    model.config.demo_policy = DemoModePolicy::ForcedOff;

    let vitals = PatientVitals {
        temperature: Some(38.0),
        ..PatientVitals::default()
    };
    app.update(analyze(png_bytes(), vitals), &mut model);
    app.update(
        Event::UploadResponse(Box::new(Ok(ok_json(&scan_response_body("scan-42"))))),
        &mut model,
    );
    assert_eq!(analysis_phase(&model), Some(AnalysisPhase::AssessingVitals));

    let error = HttpError::Timeout {
        timeout_ms: 10_000,
        request_id: "req-test".to_string(),
    };
    app.update(Event::VitalsResponse(Box::new(Err(error))), &mut model);

    // The scan-level result still lands; only the enrichment is lost.
    assert_eq!(model.state, AppState::Ready);
    let result = model.last_result.as_ref().expect("scan result");
    assert_eq!(result.analysis.source, AnalysisSource::Server);
    assert_eq!(result.analysis.top_prediction.label, "Pneumonia");
    assert!(!model.force_demo);
    assert!(model.active_error.is_none());
}

#[test]
fn test_results_reopen_loads_stored_handoff() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);
    assert!(model.last_result.is_none());

    // 1. Opening the result surface with nothing in memory asks storage.
    let update = app.update(Event::ResultsOpened, &mut model);
    assert!(update.effects.iter().any(|e| matches!(e, Effect::Storage(_))));

    // 2. The stored record from a previous run comes back.
    let analysis = AnalysisData::from_predictions(
        None,
        vec![
            Prediction {
                label: "Pneumonia".to_string(),
                probability: 0.89,
            },
            Prediction {
                label: "Normal".to_string(),
                probability: 0.11,
            },
        ],
        Severity::Moderate,
        None,
        None,
        AnalysisSource::Demo,
        1_700_000_000_000,
    )
    .unwrap();
    let diagnosis = FinalDiagnosis {
        analysis,
        vitals: PatientVitals::default(),
        risk_level: Severity::Moderate,
        narrative: "Stored narrative".to_string(),
        treatments: Vec::new(),
        condition_likelihoods: Vec::new(),
        finalized_at_ms: 1_700_000_000_000,
    };
    let entries = vec![StorageEntry {
        key: HandoffSlot::FinalResult.storage_key().unwrap(),
        value: Some(session::encode_handoff(HandoffSlot::FinalResult, &diagnosis).unwrap()),
    }];
    app.update(
        Event::HandoffLoaded(Box::new(Ok(StorageOutput::Multi { entries }))),
        &mut model,
    );

    let result = model.last_result.as_ref().expect("reloaded result");
    assert_eq!(result.narrative, "Stored narrative");
}

#[test]
fn test_reopen_with_no_stored_result_stays_empty() {
    let app = AppTester::<App, Effect>::default();
    let mut model = demo_model(&app);

    app.update(Event::ResultsOpened, &mut model);
    app.update(
        Event::HandoffLoaded(Box::new(Ok(StorageOutput::Multi {
            entries: Vec::new(),
        }))),
        &mut model,
    );

    assert!(model.last_result.is_none());
}
