//! # Composable Epics Testing
//!
//! Testing utilities for Epic-based middleware.
//!
//! This crate provides:
//! - [`InMemoryWatchService`]: push-driven fake of the external resource
//! - [`EpicHarness`]: run one Epic without a store and control its input,
//!   state and polling
//! - [`ReducerTest`]: Given-When-Then reducer tests
//! - [`init_test_tracing`]: log output for failing tests
//!
//! ## Example
//!
//! ```ignore
//! use composable_epics_testing::{EpicHarness, InMemoryWatchService};
//!
//! #[tokio::test]
//! async fn stop_closes_the_watch() {
//!     let service = InMemoryWatchService::new();
//!     let mut harness = EpicHarness::new(&WatchEpic::new(Arc::new(service.clone())), CounterState::default());
//!
//!     harness.send(CounterAction::StartWatch(key.clone()));
//!     harness.drain_ready().await;
//!     harness.send(CounterAction::StopWatch(key.clone()));
//!     harness.drain_ready().await;
//!
//!     assert_eq!(service.active_subscriptions(&key), 0);
//! }
//! ```

pub mod epic_harness;
pub mod watch_service;

/// Test helpers and utilities
pub mod helpers {
    /// Install a `tracing` subscriber that writes through the test harness.
    ///
    /// Honours `RUST_LOG`. Safe to call from every test; only the first call
    /// installs anything.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use epic_harness::{EpicDiverged, EpicHarness};
pub use helpers::init_test_tracing;
pub use reducer_test::ReducerTest;
pub use reducer_test::assertions;
pub use watch_service::InMemoryWatchService;
