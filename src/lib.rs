//! Workflow backend for equipment maintenance.
//!
//! The crate coordinates the lifecycle of maintenance work: a requester
//! reports a broken device, coordinators create repair or renewal tasks
//! against the request, tasks consume spare parts or replacement devices
//! from the warehouse, and completion feeds back into the originating
//! request.
//!
//! The interesting part is the cross-entity orchestration: requests,
//! tasks, issues and export tickets are interdependent state machines that
//! must stay mutually consistent under concurrent staff actions. Every
//! multi-record rule (duplicate-request gate, single-active-export gate,
//! cancellation cascade, device relocation) runs inside one transaction on
//! the same connection that performs the write.
//!
//! HTTP routing, authentication, notification transport and reporting are
//! external adapters around this library; [`errors::ServiceError`] carries
//! the HTTP mapping they share.

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod services;

pub use config::AppConfig;
pub use db::DbPool;
pub use errors::ServiceError;
pub use events::{Event, EventSender};
pub use services::AppServices;
