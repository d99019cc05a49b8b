//! LocalEngineBinding over a real shared library built from a C stub engine.
#![cfg(unix)]

use std::ffi::c_int;
use std::path::PathBuf;

use chrono::NaiveDate;
use hc_engine::testing::build_stub_engine;
use hc_engine::{
    DisposeOutcome, EngineError, EngineHandle, EngineSettings, EngineState, LocalEngineBinding,
    LogLevel, ReturnCode, VarType, VarValues,
};
use libloading::Library;
use tempfile::TempDir;

const LEVEL: &str = "Flow1/nodes/n1/water_level";
const FLAGS: &str = "Flow1/nodes/n1/flags";

/// One compiled copy per test so each gets its own library state.
struct StubEngine {
    dir: TempDir,
    library_path: PathBuf,
    hooks: Library,
}

impl StubEngine {
    fn build() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let library_path = build_stub_engine(dir.path(), false).unwrap();
        let hooks = unsafe { Library::new(&library_path) }.unwrap();
        Self {
            dir,
            library_path,
            hooks,
        }
    }

    fn binding(&self) -> LocalEngineBinding {
        LocalEngineBinding::new(&EngineSettings {
            library_path: self.library_path.clone(),
            ..EngineSettings::default()
        })
    }

    fn config(&self) -> PathBuf {
        let path = self.dir.path().join("dimr.xml");
        std::fs::write(&path, "<dimrConfig/>").unwrap();
        path
    }

    fn hook(&self, name: &str) -> c_int {
        unsafe {
            let f = self
                .hooks
                .get::<unsafe extern "C" fn() -> c_int>(name.as_bytes())
                .unwrap();
            f()
        }
    }
}

fn initialized(stub: &StubEngine) -> LocalEngineBinding {
    let mut binding = stub.binding();
    assert_eq!(binding.initialize(&stub.config()), ReturnCode::SUCCESS);
    binding
}

#[test]
fn initialize_forwards_levels_and_captures_offsets() {
    let stub = StubEngine::build();
    let mut binding = stub.binding();
    let reference = NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    binding.set_reference_date(reference);

    assert_eq!(binding.initialize(&stub.config()), ReturnCode::SUCCESS);
    assert_eq!(binding.state(), EngineState::Initialized);
    assert_eq!(stub.hook("stub_feedback_level"), LogLevel::Info.code());
    assert_eq!(stub.hook("stub_debug_level"), LogLevel::Info.code());

    let timeline = binding.timeline();
    assert_eq!(timeline.step_offset(), 2.0);
    assert_eq!(timeline.relative_start_offset(), 3600.0);
    assert_eq!(timeline.start_time(), reference);

    let messages = binding.drain_messages();
    assert!(
        messages.iter().any(|m| m.contains("stub engine initialized")),
        "{messages:?}"
    );
}

#[test]
fn update_advances_engine_time() {
    let stub = StubEngine::build();
    let mut binding = initialized(&stub);

    assert_eq!(binding.update(2.0), ReturnCode::SUCCESS);
    assert_eq!(binding.timeline().current_offset(), 3602.0);
    assert_eq!(binding.finish(), ReturnCode::SUCCESS);
}

#[test]
fn typed_values_round_trip_through_the_library() {
    let stub = StubEngine::build();
    let mut binding = initialized(&stub);

    assert_eq!(
        binding.get_values(LEVEL).unwrap(),
        VarValues::Double(vec![1.0, 2.0, 3.0])
    );
    binding
        .set_values(LEVEL, &VarValues::Double(vec![4.0, 5.0, 6.0]))
        .unwrap();
    assert_eq!(
        binding.get_values(LEVEL).unwrap(),
        VarValues::Double(vec![4.0, 5.0, 6.0])
    );

    assert_eq!(binding.get_values(FLAGS).unwrap(), VarValues::Int(vec![7]));
    binding.set_values(FLAGS, &VarValues::Int(vec![11])).unwrap();
    assert_eq!(binding.get_values(FLAGS).unwrap(), VarValues::Int(vec![11]));
}

#[test]
fn mismatched_writes_are_rejected_before_the_call() {
    let stub = StubEngine::build();
    let mut binding = initialized(&stub);

    let err = binding
        .set_values(LEVEL, &VarValues::Int(vec![1, 2, 3]))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TypeMismatch {
            actual: VarType::Double,
            given: VarType::Int,
            ..
        }
    ));

    let err = binding
        .set_values(LEVEL, &VarValues::Double(vec![1.0]))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::LengthMismatch {
            expected: 3,
            given: 1,
            ..
        }
    ));

    // Untouched by the rejected writes.
    assert_eq!(
        binding.get_values(LEVEL).unwrap(),
        VarValues::Double(vec![1.0, 2.0, 3.0])
    );
}

#[test]
fn unknown_and_unsupported_variables_are_errors() {
    let stub = StubEngine::build();
    let mut binding = initialized(&stub);

    let err = binding.get_values("Flow1/nodes/missing").unwrap_err();
    assert!(matches!(err, EngineError::UnknownVariable { code: 1, .. }));

    let err = binding.get_values("Flow1/nodes/n1/label").unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedType { code: 9, .. }));
}

#[test]
fn missing_config_returns_engine_code() {
    let stub = StubEngine::build();
    let mut binding = stub.binding();

    let code = binding.initialize(&stub.dir.path().join("absent.xml"));
    assert_eq!(code, ReturnCode(2));
    assert_ne!(binding.state(), EngineState::Initialized);
    let messages = binding.drain_messages();
    assert!(
        messages.iter().any(|m| m.contains("config file not found")),
        "{messages:?}"
    );
}

#[test]
fn dispose_unregisters_the_logger() {
    let stub = StubEngine::build();
    let mut binding = initialized(&stub);
    assert_eq!(stub.hook("stub_logger_registered"), 1);

    assert_eq!(binding.dispose(), DisposeOutcome::Clean);
    assert_eq!(stub.hook("stub_logger_registered"), 0);
    assert_eq!(binding.dispose(), DisposeOutcome::AlreadyDisposed);
}
