// sdp-fanout: Facade over the fan-out workspace crates.
//
// Pulls the member crates together under one name so callers can depend on
// a single crate.  The end-to-end scenario suites under tests/integration/
// exercise the full stack through these re-exports.

pub use sdp_bus as bus;
pub use sdp_engine as engine;
pub use sdp_gateway as gateway;
pub use sdp_protocol as protocol;
