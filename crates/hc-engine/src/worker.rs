//! Worker side of the remote binding.

use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};

use tracing::{debug, info, warn};

use crate::handle::EngineHandle;
use crate::protocol::{self, PROTOCOL_VERSION, ProtocolError, Request, Response};

/// Serves protocol requests against an engine handle.
pub struct WorkerHost<H: EngineHandle> {
    handle: H,
}

impl<H: EngineHandle> WorkerHost<H> {
    pub fn new(handle: H) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Answer one request.
    pub fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(client = version, worker = PROTOCOL_VERSION, "protocol version mismatch");
                }
                Response::Hello {
                    version: PROTOCOL_VERSION,
                }
            }
            Request::SetLogLevels { levels } => match self.handle.set_log_levels(levels) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(e),
            },
            Request::Initialize { config_path } => Response::Code {
                code: self.handle.initialize(&config_path).raw(),
            },
            Request::Update { dt } => Response::Code {
                code: self.handle.update(dt).raw(),
            },
            Request::Finish => Response::Code {
                code: self.handle.finish().raw(),
            },
            Request::Offsets => {
                let timeline = self.handle.timeline();
                Response::Offsets {
                    offsets: crate::api::EngineOffsets {
                        start: timeline.start_offset(),
                        end: timeline.end_offset(),
                        step: timeline.step_offset(),
                        current: timeline.current_offset(),
                    },
                }
            }
            Request::GetValues { name } => match self.handle.get_values(&name) {
                Ok(values) => Response::Values { values },
                Err(e) => error_response(e),
            },
            Request::SetValues { name, values } => match self.handle.set_values(&name, &values) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(e),
            },
            Request::DrainMessages => Response::Messages {
                lines: self.handle.drain_messages(),
            },
            Request::Dispose => {
                let outcome = self.handle.dispose();
                debug!(?outcome, "engine disposed on request");
                Response::Ok
            }
        }
    }

    /// Connect back to the binding listening at `address` and serve on that socket.
    pub fn serve_connection(&mut self, address: SocketAddr) -> Result<(), ProtocolError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        info!(%address, "connected to engine binding");
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        self.serve(&mut reader, &mut writer)
    }

    /// Serve until a `Dispose` request or EOF. EOF disposes the engine too.
    pub fn serve<R: Read, W: Write>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(), ProtocolError> {
        info!("engine worker serving");
        loop {
            let frame = match protocol::read_message(reader) {
                Ok(frame) => frame,
                Err(ProtocolError::ConnectionClosed) => {
                    info!("client closed connection");
                    self.handle.dispose();
                    return Ok(());
                }
                Err(e) => {
                    self.handle.dispose();
                    return Err(e);
                }
            };

            let request: Request = match protocol::decode(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "malformed request");
                    protocol::send(
                        writer,
                        &Response::Error {
                            message: format!("malformed request: {e}"),
                        },
                    )?;
                    continue;
                }
            };

            let done = matches!(request, Request::Dispose);
            debug!(request = request.name(), "handling request");
            let response = self.handle_request(request);
            protocol::send(writer, &response)?;
            if done {
                info!("engine worker finished");
                return Ok(());
            }
        }
    }
}

fn error_response(err: crate::error::EngineError) -> Response {
    Response::Error {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EngineOffsets;
    use crate::handle::EngineState;
    use crate::local::LocalEngineBinding;
    use crate::settings::LogLevels;
    use crate::testing::{EngineScript, ScriptedEngine};
    use crate::values::VarValues;
    use std::io::Cursor;

    fn host(script: EngineScript) -> WorkerHost<LocalEngineBinding> {
        let (engine, _) = ScriptedEngine::new(script);
        WorkerHost::new(LocalEngineBinding::with_api(
            Box::new(engine),
            LogLevels::default(),
        ))
    }

    #[test]
    fn serve_runs_a_script_of_requests() {
        let temp = tempfile::tempdir().unwrap();
        let config = temp.path().join("dimr.xml");
        std::fs::write(&config, "<dimrConfig/>").unwrap();

        let mut input = Vec::new();
        for request in [
            Request::Hello {
                version: PROTOCOL_VERSION,
            },
            Request::Initialize {
                config_path: config,
            },
            Request::Update { dt: 2.0 },
            Request::Offsets,
            Request::Dispose,
            Request::Finish,
        ] {
            protocol::send(&mut input, &request).unwrap();
        }

        let mut host = host(EngineScript {
            offsets: EngineOffsets {
                start: 0.0,
                end: 10.0,
                step: 2.0,
                current: 0.0,
            },
            ..EngineScript::default()
        });
        let mut output = Vec::new();
        host.serve(&mut Cursor::new(input), &mut output).unwrap();

        let mut reader = Cursor::new(output);
        let mut responses = Vec::new();
        while let Ok(response) = protocol::receive::<_, Response>(&mut reader) {
            responses.push(response);
        }
        // Finish after Dispose is never read.
        assert_eq!(responses.len(), 5);
        assert_eq!(responses[1], Response::Code { code: 0 });
        assert_eq!(
            responses[3],
            Response::Offsets {
                offsets: EngineOffsets {
                    start: 0.0,
                    end: 10.0,
                    step: 2.0,
                    current: 2.0,
                }
            }
        );
        assert_eq!(responses[4], Response::Ok);
        assert_eq!(host.handle().state(), EngineState::Disposed);
    }

    #[test]
    fn malformed_frame_gets_error_response() {
        let mut input = Vec::new();
        protocol::write_message(&mut input, b"{not json").unwrap();
        let mut output = Vec::new();
        let mut host = host(EngineScript::default());
        host.serve(&mut Cursor::new(input), &mut output).unwrap();

        let response: Response = protocol::receive(&mut Cursor::new(output)).unwrap();
        assert!(matches!(response, Response::Error { .. }));
        // EOF after the bad frame disposes the engine.
        assert_eq!(host.handle().state(), EngineState::Disposed);
    }

    #[test]
    fn variable_errors_are_reported_not_fatal() {
        let mut host = host(EngineScript::default());
        let response = host.handle_request(Request::GetValues {
            name: "Flow1/weirs/w1/crest_level".to_string(),
        });
        let Response::Error { message } = response else {
            panic!("expected error, got {response:?}");
        };
        assert!(message.contains("get_values"));

        let response = host.handle_request(Request::SetValues {
            name: "x".to_string(),
            values: VarValues::Int(vec![1]),
        });
        assert!(matches!(response, Response::Error { .. }));
    }

    #[test]
    fn drain_keeps_the_empty_sentinel() {
        let mut host = host(EngineScript::default());
        assert_eq!(
            host.handle_request(Request::DrainMessages),
            Response::Messages {
                lines: vec![String::new()]
            }
        );
    }
}
