//! Integration tests for the export workflow and the spare part ledger:
//! ticket lifecycle, the all-or-nothing debit batch on fulfilment, and
//! the stock guards that keep quantities non-negative.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use fixflow_api::{
    entities::account::Role,
    entities::export_ticket::{ExportStatus, ExportType},
    entities::issue::FixType,
    entities::task::TaskType,
    services::requests::CreateRequestInput,
    services::tasks::{AssignFixerInput, CreateTaskInput},
    ServiceError,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// Builds a request with one assigned task whose single issue demands
/// `required` units of a fresh part stocked at `stock`. Returns (task id,
/// part id, issue id).
async fn seed_assigned_task(app: &TestApp, stock: i32, required: i32) -> (Uuid, Uuid, Uuid) {
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;
    let fixer = app.seed_account("fixer", Role::Staff).await;
    let part = app.seed_spare_part("fan motor", stock).await;

    let request = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .expect("request");
    let issue = app
        .seed_issue(request.id, FixType::Other, &[(part.id, required)])
        .await;

    let task = app
        .services
        .tasks
        .create_task(CreateTaskInput {
            request_id: request.id,
            issue_ids: vec![issue.id],
            task_type: TaskType::Repair,
        })
        .await
        .expect("task");
    app.services
        .tasks
        .assign_fixer(
            task.id,
            AssignFixerInput {
                fixer_id: fixer.id,
                scheduled_date: Utc::now(),
            },
        )
        .await
        .expect("assign");

    (task.id, part.id, issue.id)
}

/// The waiting ticket opened for a task by fixer assignment.
async fn waiting_ticket(app: &TestApp, task_id: Uuid) -> fixflow_api::entities::export_ticket::Model {
    let detail = app.services.tasks.get_task(task_id).await.expect("detail");
    detail
        .export_tickets
        .into_iter()
        .find(|t| t.status == ExportStatus::Waiting)
        .expect("waiting ticket")
}

#[tokio::test]
async fn fulfilment_debits_stock_and_closes_the_ticket() {
    let app = TestApp::new().await;
    let (task_id, part_id, issue_id) = seed_assigned_task(&app, 5, 3).await;
    let ticket = waiting_ticket(&app, task_id).await;
    assert_eq!(ticket.export_type, ExportType::SparePart);
    assert_eq!(ticket.issue_detail(), Some(vec![issue_id]));

    let ticket = app
        .services
        .exports
        .mark_exported(ticket.id)
        .await
        .expect("export");

    assert_eq!(ticket.status, ExportStatus::Exported);
    let part = app
        .services
        .inventory
        .get_spare_part(part_id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 2);
}

#[tokio::test]
async fn shortfall_aborts_the_whole_batch() {
    let app = TestApp::new().await;
    let (task_id, part_id, _) = seed_assigned_task(&app, 2, 3).await;
    let ticket = waiting_ticket(&app, task_id).await;

    let err = app
        .services
        .exports
        .mark_exported(ticket.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    // The ticket stays open and no stock moved.
    let ticket = app
        .services
        .exports
        .get_export(ticket.id)
        .await
        .expect("ticket");
    assert_eq!(ticket.status, ExportStatus::Waiting);

    let part = app
        .services
        .inventory
        .get_spare_part(part_id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 2);

    // A restock unblocks the same ticket.
    app.services
        .inventory
        .restock(part_id, 1)
        .await
        .expect("restock");
    let ticket = app
        .services
        .exports
        .mark_exported(ticket.id)
        .await
        .expect("export after restock");
    assert_eq!(ticket.status, ExportStatus::Exported);

    let part = app
        .services
        .inventory
        .get_spare_part(part_id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 0);
}

#[tokio::test]
async fn one_shortfall_rolls_back_the_other_debits() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 2, 2).await;
    let fixer = app.seed_account("fixer", Role::Staff).await;
    let plentiful = app.seed_spare_part("filter", 10).await;
    let scarce = app.seed_spare_part("gasket", 1).await;

    let request = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .expect("request");
    let covered = app
        .seed_issue(request.id, FixType::Other, &[(plentiful.id, 4)])
        .await;
    let short = app
        .seed_issue(request.id, FixType::Other, &[(scarce.id, 2)])
        .await;

    let task = app
        .services
        .tasks
        .create_task(CreateTaskInput {
            request_id: request.id,
            issue_ids: vec![covered.id, short.id],
            task_type: TaskType::Repair,
        })
        .await
        .expect("task");
    app.services
        .tasks
        .assign_fixer(
            task.id,
            AssignFixerInput {
                fixer_id: fixer.id,
                scheduled_date: Utc::now(),
            },
        )
        .await
        .expect("assign");
    let ticket = waiting_ticket(&app, task.id).await;

    let err = app
        .services
        .exports
        .mark_exported(ticket.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    // The filter debit happened in the same transaction and was undone.
    let part = app
        .services
        .inventory
        .get_spare_part(plentiful.id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 10);
    let part = app
        .services
        .inventory
        .get_spare_part(scarce.id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 1);
}

#[tokio::test]
async fn a_task_holds_at_most_one_active_ticket() {
    let app = TestApp::new().await;
    let (task_id, _, issue_id) = seed_assigned_task(&app, 5, 3).await;

    let err = app
        .services
        .exports
        .open_export(task_id, ExportType::SparePart, json!([issue_id]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    // An exported ticket still counts as active; only a cancelled one
    // frees the slot.
    let ticket = waiting_ticket(&app, task_id).await;
    app.services
        .exports
        .mark_exported(ticket.id)
        .await
        .expect("export");
    let err = app
        .services
        .exports
        .open_export(task_id, ExportType::SparePart, json!([issue_id]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn cancelling_a_waiting_ticket_frees_the_task_for_a_new_one() {
    let app = TestApp::new().await;
    let (task_id, part_id, issue_id) = seed_assigned_task(&app, 5, 3).await;
    let ticket = waiting_ticket(&app, task_id).await;

    let ticket = app
        .services
        .exports
        .cancel_export(ticket.id)
        .await
        .expect("cancel");
    assert_eq!(ticket.status, ExportStatus::Cancel);

    // Nothing was debited while the ticket waited, so nothing comes back.
    let part = app
        .services
        .inventory
        .get_spare_part(part_id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 5);

    let reopened = app
        .services
        .exports
        .open_export(task_id, ExportType::SparePart, json!([issue_id]))
        .await
        .expect("reopen");
    assert_eq!(reopened.status, ExportStatus::Waiting);
}

#[tokio::test]
async fn cancel_is_idempotent_and_exported_is_absorbing() {
    let app = TestApp::new().await;
    let (task_id, _, _) = seed_assigned_task(&app, 5, 3).await;
    let ticket = waiting_ticket(&app, task_id).await;

    app.services
        .exports
        .cancel_export(ticket.id)
        .await
        .expect("cancel");
    // Re-cancelling is a no-op, not an error: the task cancellation
    // cascade cancels blindly.
    let again = app
        .services
        .exports
        .cancel_export(ticket.id)
        .await
        .expect("re-cancel");
    assert_eq!(again.status, ExportStatus::Cancel);

    // A cancelled ticket can never be fulfilled.
    let err = app
        .services
        .exports
        .mark_exported(ticket.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidState(_));
}

#[tokio::test]
async fn an_exported_ticket_survives_a_cancel_attempt() {
    let app = TestApp::new().await;
    let (task_id, _, _) = seed_assigned_task(&app, 5, 3).await;
    let ticket = waiting_ticket(&app, task_id).await;

    app.services
        .exports
        .mark_exported(ticket.id)
        .await
        .expect("export");

    let unchanged = app
        .services
        .exports
        .cancel_export(ticket.id)
        .await
        .expect("cancel is a no-op");
    assert_eq!(unchanged.status, ExportStatus::Exported);

    let err = app
        .services
        .exports
        .mark_exported(ticket.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidState(_));
}

#[tokio::test]
async fn opening_an_export_for_a_missing_task_fails() {
    let app = TestApp::new().await;
    let err = app
        .services
        .exports
        .open_export(Uuid::new_v4(), ExportType::Device, json!(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn listing_exports_filters_by_status() {
    let app = TestApp::new().await;
    let (task_id, _, _) = seed_assigned_task(&app, 5, 3).await;
    let ticket = waiting_ticket(&app, task_id).await;

    let (waiting, total) = app
        .services
        .exports
        .list_exports(1, 20, Some(ExportStatus::Waiting))
        .await
        .expect("list");
    assert_eq!(total, 1);
    assert_eq!(waiting[0].id, ticket.id);

    app.services
        .exports
        .mark_exported(ticket.id)
        .await
        .expect("export");

    let (waiting, total) = app
        .services
        .exports
        .list_exports(1, 20, Some(ExportStatus::Waiting))
        .await
        .expect("list");
    assert_eq!(total, 0);
    assert!(waiting.is_empty());
}

#[tokio::test]
async fn restock_and_debit_round_trip() {
    let app = TestApp::new().await;
    let part = app.seed_spare_part("belt", 0).await;

    app.services
        .inventory
        .restock(part.id, 7)
        .await
        .expect("restock");
    assert!(app
        .services
        .inventory
        .is_in_stock(part.id, 7)
        .await
        .expect("check"));

    // Debiting the exact remainder leaves zero, never negative.
    let remaining = app
        .services
        .inventory
        .debit(part.id, 7)
        .await
        .expect("debit");
    assert_eq!(remaining, 0);

    let err = app.services.inventory.debit(part.id, 1).await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));
    let part = app
        .services
        .inventory
        .get_spare_part(part.id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 0);
}

#[tokio::test]
async fn ledger_rejects_non_positive_movements() {
    let app = TestApp::new().await;
    let part = app.seed_spare_part("screw", 4).await;

    let err = app.services.inventory.debit(part.id, 0).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
    let err = app
        .services
        .inventory
        .restock(part.id, -2)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = app
        .services
        .inventory
        .debit(Uuid::new_v4(), 1)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn concurrent_debits_never_drive_stock_negative() {
    let app = TestApp::new().await;
    let part = app.seed_spare_part("hose", 5).await;

    // Five workers each try to take 2 units; at most two can succeed.
    let mut handles = Vec::new();
    for _ in 0..5 {
        let inventory = app.services.inventory.clone();
        let part_id = part.id;
        handles.push(tokio::spawn(
            async move { inventory.debit(part_id, 2).await },
        ));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.expect("join").is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 2);

    let part = app
        .services
        .inventory
        .get_spare_part(part.id)
        .await
        .expect("part");
    assert_eq!(part.quantity, 1);
}
