// gw-test-utils: shared test utilities for the gateway workspace.
//
// Provides a mock WebSocket client for driving a running gateway in
// integration tests, and re-exports `gw_bus::InMemoryBus` as the bus fixture
// every test spins up its own instance of.

pub mod mock_ws_client;

pub use gw_bus::InMemoryBus;
pub use mock_ws_client::MockWsClient;
