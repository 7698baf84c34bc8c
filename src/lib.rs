// src/lib.rs
pub mod ports {
    pub mod price_provider;
    pub mod replay;
    pub mod synthetic;
}
pub mod trade {
    pub mod execution {
        pub mod broker;
        pub mod paper_broker;
    }
}
pub mod alert_notifier;
pub mod config;
pub mod discovery;
pub mod email_client;
pub mod error;
pub mod live;
pub mod logging;
pub mod model;
pub mod portfolio;
pub mod scheduler;
pub mod signal;
pub mod spread;
pub mod state_store;
pub mod stats;
