#![allow(dead_code)]

use chrono::Utc;
use fixflow_api::{
    config::AppConfig,
    db::{self, DbPool},
    entities::{
        account::{self, Role},
        device,
        issue::FixType,
        request::{self, RequestStatus},
        spare_part,
    },
    events::{self, EventSender},
    services::issues::{CreateIssueInput, SparePartRequirement},
    services::AppServices,
};
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseBackend, EntityTrait, Set, Statement};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Test harness backed by an in-memory SQLite database.
///
/// SQLite requires a single pooled connection here: every pool connection
/// would otherwise get its own private in-memory database.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: AppServices,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::new("sqlite::memory:", "test")).await
    }

    pub async fn with_config(mut cfg: AppConfig) -> Self {
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");

        for sql in SCHEMA {
            pool.execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                sql.to_string(),
            ))
            .await
            .expect("failed to create test schema");
        }

        let db = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(cfg.event_buffer_size);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(db.clone(), event_sender, &cfg);

        Self {
            db,
            services,
            _event_task: event_task,
        }
    }

    pub async fn seed_account(&self, name: &str, role: Role) -> account::Model {
        let model = account::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            role: Set(role),
            deleted_at: Set(None),
            created_at: Set(Utc::now()),
        };
        model.insert(&*self.db).await.expect("seed account")
    }

    pub async fn seed_deleted_account(&self, name: &str, role: Role) -> account::Model {
        let model = account::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            role: Set(role),
            deleted_at: Set(Some(Utc::now())),
            created_at: Set(Utc::now()),
        };
        model.insert(&*self.db).await.expect("seed account")
    }

    pub async fn seed_device(&self, area_id: Uuid, x: i32, y: i32) -> device::Model {
        let model = device::ActiveModel {
            id: Set(Uuid::new_v4()),
            area_id: Set(Some(area_id)),
            position_x: Set(Some(x)),
            position_y: Set(Some(y)),
            active: Set(true),
            deleted_at: Set(None),
            created_at: Set(Utc::now()),
        };
        model.insert(&*self.db).await.expect("seed device")
    }

    pub async fn seed_unpositioned_device(&self) -> device::Model {
        let model = device::ActiveModel {
            id: Set(Uuid::new_v4()),
            area_id: Set(None),
            position_x: Set(None),
            position_y: Set(None),
            active: Set(true),
            deleted_at: Set(None),
            created_at: Set(Utc::now()),
        };
        model.insert(&*self.db).await.expect("seed device")
    }

    pub async fn seed_deleted_device(&self) -> device::Model {
        let model = device::ActiveModel {
            id: Set(Uuid::new_v4()),
            area_id: Set(None),
            position_x: Set(None),
            position_y: Set(None),
            active: Set(false),
            deleted_at: Set(Some(Utc::now())),
            created_at: Set(Utc::now()),
        };
        model.insert(&*self.db).await.expect("seed device")
    }

    pub async fn seed_spare_part(&self, name: &str, quantity: i32) -> spare_part::Model {
        let model = spare_part::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            quantity: Set(quantity),
            updated_at: Set(Some(Utc::now())),
        };
        model.insert(&*self.db).await.expect("seed spare part")
    }

    /// Creates an issue on a request through the service, with the given
    /// part demand.
    pub async fn seed_issue(
        &self,
        request_id: Uuid,
        fix_type: FixType,
        parts: &[(Uuid, i32)],
    ) -> fixflow_api::entities::issue::Model {
        self.services
            .issues
            .create_issue(CreateIssueInput {
                request_id,
                type_error_id: Uuid::new_v4(),
                fix_type,
                description: None,
                spare_parts: parts
                    .iter()
                    .map(|(spare_part_id, quantity)| SparePartRequirement {
                        spare_part_id: *spare_part_id,
                        quantity: *quantity,
                    })
                    .collect(),
            })
            .await
            .expect("seed issue")
    }

    /// Forces a request into a given status directly, bypassing the
    /// workflow. Used to park a request where a test needs it.
    pub async fn force_request_status(&self, request_id: Uuid, status: RequestStatus) {
        let found = request::Entity::find_by_id(request_id)
            .one(&*self.db)
            .await
            .expect("find request")
            .expect("request exists");
        let mut active: request::ActiveModel = found.into();
        active.status = Set(status);
        active.update(&*self.db).await.expect("force status");
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        role TEXT NOT NULL,
        deleted_at TEXT,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY NOT NULL,
        area_id TEXT,
        position_x INTEGER,
        position_y INTEGER,
        active INTEGER NOT NULL DEFAULT 1,
        deleted_at TEXT,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS requests (
        id TEXT PRIMARY KEY NOT NULL,
        requester_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        requester_note TEXT,
        status TEXT NOT NULL,
        checker_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT
    );"#,
    r#"CREATE TABLE IF NOT EXISTS feedbacks (
        id TEXT PRIMARY KEY NOT NULL,
        request_id TEXT NOT NULL,
        requester_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS issues (
        id TEXT PRIMARY KEY NOT NULL,
        request_id TEXT NOT NULL,
        task_id TEXT,
        type_error_id TEXT NOT NULL,
        description TEXT,
        fix_type TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS issue_spare_parts (
        id TEXT PRIMARY KEY NOT NULL,
        issue_id TEXT NOT NULL,
        spare_part_id TEXT NOT NULL,
        quantity INTEGER NOT NULL
    );"#,
    r#"CREATE TABLE IF NOT EXISTS spare_parts (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        updated_at TEXT
    );"#,
    r#"CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY NOT NULL,
        request_id TEXT NOT NULL,
        device_id TEXT NOT NULL,
        device_renew_id TEXT,
        fixer_id TEXT,
        fixer_date TEXT,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL,
        cancel_by TEXT,
        last_issues_data TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT
    );"#,
    r#"CREATE TABLE IF NOT EXISTS export_tickets (
        id TEXT PRIMARY KEY NOT NULL,
        task_id TEXT NOT NULL,
        export_type TEXT NOT NULL,
        detail TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT
    );"#,
];
