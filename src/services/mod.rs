// Workflow services
pub mod exports;
pub mod requests;
pub mod tasks;

// Warehouse and catalogue services
pub mod devices;
pub mod inventory;
pub mod issues;

use crate::{config::AppConfig, db::DbPool, events::EventSender};
use std::sync::Arc;

use devices::DeviceService;
use exports::ExportService;
use inventory::InventoryService;
use issues::IssueService;
use requests::RequestService;
use tasks::TaskService;

/// Bundle of all workflow services sharing one pool, event channel and
/// workflow configuration. The adapter layer (HTTP shell, schedulers,
/// tests) constructs this once and hands out clones.
#[derive(Clone)]
pub struct AppServices {
    pub requests: RequestService,
    pub tasks: TaskService,
    pub exports: ExportService,
    pub inventory: InventoryService,
    pub issues: IssueService,
    pub devices: DeviceService,
}

impl AppServices {
    pub fn new(db_pool: Arc<DbPool>, event_sender: EventSender, config: &AppConfig) -> Self {
        let requests = RequestService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.workflow.clone(),
        );
        let tasks = TaskService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.workflow.clone(),
            requests.clone(),
        );
        let exports = ExportService::new(db_pool.clone(), event_sender.clone());
        let inventory = InventoryService::new(db_pool.clone(), event_sender);
        let issues = IssueService::new(db_pool.clone());
        let devices = DeviceService::new(db_pool);

        Self {
            requests,
            tasks,
            exports,
            inventory,
            issues,
            devices,
        }
    }
}
