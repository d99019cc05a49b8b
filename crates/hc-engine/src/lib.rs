//! Engine bindings: drive a time-stepped native engine in-process or through
//! a worker process behind one [`EngineHandle`] interface.

pub mod api;
pub mod error;
pub mod factory;
pub mod ffi;
pub mod handle;
pub mod local;
pub mod protocol;
pub mod relay;
pub mod remote;
pub mod settings;
pub mod values;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use api::{EngineApi, EngineOffsets};
pub use error::{EngineError, EngineResult};
pub use factory::{BackendFactory, BackendProvider, Platform, select_backend};
pub use handle::{BackendKind, DisposeOutcome, EngineHandle, EngineState, ReturnCode};
pub use local::LocalEngineBinding;
pub use protocol::{ProtocolError, Request, Response};
pub use relay::{LiveLogger, MessageRelay};
pub use remote::{RemoteEngineBinding, SocketTransport, Transport, WorkerProcess};
pub use settings::{EngineSettings, LogLevel, LogLevels, WorkerCommand};
pub use values::{MAX_VAR_LEN, VarType, VarValues};
pub use worker::WorkerHost;
