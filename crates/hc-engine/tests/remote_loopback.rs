//! RemoteEngineBinding driven through the full wire encoding against an
//! in-process worker host.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use hc_engine::testing::{ApiCall, EngineScript, LoopbackTransport, ScriptedEngine};
use hc_engine::{
    BackendKind, DisposeOutcome, EngineError, EngineHandle, EngineOffsets, EngineSettings,
    EngineState, LocalEngineBinding, LogLevel, LogLevels, RemoteEngineBinding, ReturnCode,
    VarValues,
};

fn remote(script: EngineScript, levels: LogLevels) -> (RemoteEngineBinding, hc_engine::testing::CallLog) {
    let (engine, calls) = ScriptedEngine::new(script);
    let local = LocalEngineBinding::with_api(Box::new(engine), LogLevels::default());
    let settings = EngineSettings {
        log_levels: levels,
        ..EngineSettings::default()
    };
    let binding =
        RemoteEngineBinding::attach(Box::new(LoopbackTransport::new(local)), &settings).unwrap();
    (binding, calls)
}

fn config(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("dimr.xml");
    std::fs::write(&path, "<dimrConfig/>").unwrap();
    path
}

fn script() -> EngineScript {
    EngineScript {
        offsets: EngineOffsets {
            start: 100.0,
            end: 160.0,
            step: 20.0,
            current: 100.0,
        },
        messages_on_update: vec!["step done".to_string()],
        variables: BTreeMap::from([(
            "Flow1/weirs/w1/crest_level".to_string(),
            VarValues::Double(vec![1.25]),
        )]),
        ..EngineScript::default()
    }
}

#[test]
fn log_levels_are_forwarded_at_construction() {
    let temp = tempfile::tempdir().unwrap();
    let levels = LogLevels {
        feedback: LogLevel::Warning,
        debug: LogLevel::Debug,
    };
    let (mut binding, calls) = remote(script(), levels);
    assert_eq!(binding.kind(), BackendKind::Remote);

    assert!(binding.initialize(&config(&temp)).is_success());
    let calls = calls.lock();
    assert_eq!(
        calls[0],
        ApiCall::SetLevel("feedbackLevel".to_string(), LogLevel::Warning)
    );
    assert_eq!(
        calls[1],
        ApiCall::SetLevel("debugLevel".to_string(), LogLevel::Debug)
    );
}

#[test]
fn lifecycle_and_timeline_cross_the_boundary() {
    let temp = tempfile::tempdir().unwrap();
    let (mut binding, _) = remote(script(), LogLevels::default());

    assert_eq!(binding.initialize(&config(&temp)), ReturnCode::SUCCESS);
    assert_eq!(binding.state(), EngineState::Initialized);
    assert_eq!(binding.timeline().relative_start_offset(), 100.0);
    assert_eq!(binding.timeline().fraction_complete(), 0.0);

    assert!(binding.update(20.0).is_success());
    assert_eq!(binding.timeline().current_offset(), 120.0);
    assert_eq!(binding.drain_messages(), vec!["step done".to_string()]);
    assert_eq!(binding.drain_messages(), vec![String::new()]);

    assert_eq!(
        binding.get_values("Flow1/weirs/w1/crest_level").unwrap(),
        VarValues::Double(vec![1.25])
    );
    binding
        .set_values("Flow1/weirs/w1/crest_level", &VarValues::Double(vec![2.0]))
        .unwrap();
    assert_eq!(
        binding.get_values("Flow1/weirs/w1/crest_level").unwrap(),
        VarValues::Double(vec![2.0])
    );

    assert!(binding.finish().is_success());
    assert_eq!(binding.dispose(), DisposeOutcome::Clean);
    assert_eq!(binding.dispose(), DisposeOutcome::AlreadyDisposed);
}

#[test]
fn engine_codes_pass_through_unchanged() {
    let temp = tempfile::tempdir().unwrap();
    let (mut binding, _) = remote(
        EngineScript {
            update_codes: vec![0, 7],
            ..script()
        },
        LogLevels::default(),
    );
    binding.initialize(&config(&temp));
    assert_eq!(binding.update(20.0), ReturnCode::SUCCESS);
    assert_eq!(binding.update(20.0), ReturnCode(7));
    assert_eq!(binding.timeline().current_offset(), 120.0);
}

#[test]
fn remote_variable_errors_surface_as_remote() {
    let temp = tempfile::tempdir().unwrap();
    let (mut binding, _) = remote(script(), LogLevels::default());
    binding.initialize(&config(&temp));

    let err = binding.get_values("Flow1/weirs/w9/crest_level").unwrap_err();
    let EngineError::Remote { message } = err else {
        panic!("expected remote error, got {err:?}");
    };
    assert!(message.contains("w9"));

    let err = binding
        .set_values("Flow1/weirs/w1/crest_level", &VarValues::Int(vec![1]))
        .unwrap_err();
    assert!(matches!(err, EngineError::Remote { .. }));
}

#[test]
fn live_logger_is_refused() {
    let (mut binding, _) = remote(script(), LogLevels::default());
    let err = binding
        .attach_live_logger(Arc::new(|_, _| {}))
        .unwrap_err();
    assert!(matches!(err, EngineError::LiveChannelUnavailable));
}

#[test]
fn calls_after_dispose_are_invalid_state() {
    let temp = tempfile::tempdir().unwrap();
    let (mut binding, _) = remote(script(), LogLevels::default());
    binding.initialize(&config(&temp));
    binding.dispose();

    assert_eq!(binding.update(20.0), ReturnCode::INVALID_STATE);
    let messages = binding.drain_messages();
    assert!(messages[0].contains("update"), "{messages:?}");
}
