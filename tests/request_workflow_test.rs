//! Integration tests for the request workflow: intake with the
//! duplicate-device gate, requester confirmation and cancellation, and
//! coordinator rejection.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use fixflow_api::{
    entities::account::Role,
    entities::feedback,
    entities::request::RequestStatus,
    services::requests::{ConfirmRequestInput, CreateRequestInput},
    ServiceError,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use uuid::Uuid;

#[tokio::test]
async fn create_request_succeeds_for_idle_device() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

    let request = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: device.id,
            requester_note: Some("screen flickers".to_string()),
        })
        .await
        .expect("request should be created");

    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.requester_id, head.id);
    assert_eq!(request.device_id, device.id);
}

#[tokio::test]
async fn second_request_for_same_device_is_a_conflict() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let other = app.seed_account("other-head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

    app.services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .expect("first request");

    let err = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: other.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::Conflict(_));
}

#[tokio::test]
async fn terminal_requests_do_not_block_new_intake() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

    let first = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .expect("first request");

    app.services
        .requests
        .cancel_request(first.id, head.id)
        .await
        .expect("cancel first");

    // The device is free again once its request reached a terminal state.
    let second = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .expect("second request after cancellation");

    assert_eq!(second.status, RequestStatus::Pending);
}

#[tokio::test]
async fn create_request_rejects_unknown_or_deleted_references() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let deleted_device = app.seed_deleted_device().await;

    let err = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: head.id,
            device_id: deleted_device.id,
            requester_note: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));

    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;
    let err = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: Uuid::new_v4(),
            device_id: device.id,
            requester_note: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn create_request_requires_a_head_account() {
    let app = TestApp::new().await;
    let staff = app.seed_account("fixer", Role::Staff).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

    let err = app
        .services
        .requests
        .create_request(CreateRequestInput {
            requester_id: staff.id,
            device_id: device.id,
            requester_note: None,
        })
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn confirm_closes_request_and_records_feedback_atomically() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

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
    app.force_request_status(request.id, RequestStatus::HeadConfirm)
        .await;

    let (request, recorded) = app
        .services
        .requests
        .confirm_request(
            request.id,
            head.id,
            ConfirmRequestInput {
                content: "works again, thanks".to_string(),
            },
        )
        .await
        .expect("confirm");

    assert_eq!(request.status, RequestStatus::Closed);
    assert_eq!(recorded.request_id, request.id);
    assert_eq!(recorded.content, "works again, thanks");
}

#[tokio::test]
async fn confirm_by_non_owner_is_forbidden_and_writes_nothing() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let intruder = app.seed_account("other", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

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
    app.force_request_status(request.id, RequestStatus::HeadConfirm)
        .await;

    let err = app
        .services
        .requests
        .confirm_request(
            request.id,
            intruder.id,
            ConfirmRequestInput {
                content: "not mine".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Forbidden(_));

    let reloaded = app
        .services
        .requests
        .get_request(request.id)
        .await
        .expect("request still there");
    assert_eq!(reloaded.status, RequestStatus::HeadConfirm);

    let feedbacks = feedback::Entity::find()
        .filter(feedback::Column::RequestId.eq(request.id))
        .all(&*app.db)
        .await
        .expect("query feedbacks");
    assert!(feedbacks.is_empty());
}

#[tokio::test]
async fn confirm_is_only_legal_from_awaiting_confirmation() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

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

    let err = app
        .services
        .requests
        .confirm_request(
            request.id,
            head.id,
            ConfirmRequestInput {
                content: "too early".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::InvalidState(_));
}

#[tokio::test]
async fn cancelled_requests_are_absorbing() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

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

    let cancelled = app
        .services
        .requests
        .cancel_request(request.id, head.id)
        .await
        .expect("cancel");
    assert_eq!(cancelled.status, RequestStatus::HeadCancel);

    let err = app
        .services
        .requests
        .cancel_request(request.id, head.id)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidState(_));
}

#[tokio::test]
async fn rejection_records_the_checker_and_blocks_tasks() {
    let app = TestApp::new().await;
    let head = app.seed_account("head", Role::Head).await;
    let checker = app.seed_account("coordinator", Role::HeadStaff).await;
    let device = app.seed_device(Uuid::new_v4(), 1, 1).await;

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
        .seed_issue(request.id, fixflow_api::entities::issue::FixType::Other, &[])
        .await;

    let rejected = app
        .services
        .requests
        .reject_request(request.id, checker.id)
        .await
        .expect("reject");
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.checker_id, Some(checker.id));

    assert_matches!(
        app.services
            .tasks
            .create_task(fixflow_api::services::tasks::CreateTaskInput {
                request_id: request.id,
                issue_ids: vec![issue.id],
                task_type: fixflow_api::entities::task::TaskType::Repair,
            })
            .await
            .unwrap_err(),
        ServiceError::InvalidState(_)
    );
}
