// sdp-test-utils: Shared test doubles for the fan-out workspace.
//
// Provides a mock gateway websocket server and a scripted responder for
// driving the coordinator end-to-end over a MemoryBus.

pub mod mock_gateway;
pub mod responder;

pub use mock_gateway::MockGateway;
pub use responder::{ResponderBehaviour, ResponderScript, ScriptedResponder};
