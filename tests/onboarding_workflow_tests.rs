// End-to-end workflow scenarios over in-memory stores

mod fixtures;

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use fixtures::{provision_window, request, t0, Harness, HangingStep, ScriptedStep};
use tenant_onboarding::clock::ManualClock;
use tenant_onboarding::events::detail_types;
use tenant_onboarding::store::{CallbackRegistry, ExecutionStore, TenantStore};
use tenant_onboarding::workflow::{
    FailureReason, OnboardingError, OnboardingRequest, ResumeRejection, ResumeResponse,
    StepName, StepOutcome, TenantStatus, TokenId, TokenStatus, WorkflowState,
};
use tenant_onboarding::TimeoutWatchdog;

#[tokio::test]
async fn test_t1_successful_onboarding() {
    let h = Harness::new();
    let id = h.orchestrator.start(request("T1")).await.unwrap();

    let suspended = h.execution(&id).await;
    assert_eq!(suspended.state, WorkflowState::RunningProvision);
    assert_eq!(suspended.version, 2);
    assert_eq!(suspended.history.len(), 1);

    // The application plane was asked to provision with the same token.
    let token = h.token(&id).await;
    let requests = h
        .events(&h.event_config.provisioning_request_detail_type)
        .await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].detail["taskToken"], json!(token.as_str()));
    assert_eq!(requests[0].detail["tenantId"], json!("T1"));

    h.clock.advance(Duration::minutes(10));
    let response = h
        .orchestrator
        .resume(&token, StepOutcome::Success, json!({ "stackId": "stack-T1" }))
        .await
        .unwrap();
    assert_eq!(response, ResumeResponse::accepted());

    let done = h.execution(&id).await;
    assert_eq!(done.state, WorkflowState::Succeeded);
    assert_eq!(done.version, 4);
    assert_eq!(done.active_callback_token_id, None);
    assert_eq!(done.output["provisioning"]["stackId"], json!("stack-T1"));

    let steps: Vec<_> = done.history.iter().map(|r| r.step_name).collect();
    assert_eq!(
        steps,
        vec![StepName::Initiate, StepName::Provision, StepName::Complete]
    );
    assert!(done
        .history
        .iter()
        .all(|r| r.outcome == StepOutcome::Success));

    let tenant = h.orchestrator.tenant("T1").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Active);

    assert_eq!(h.events(detail_types::ONBOARDING_SUCCEEDED).await.len(), 1);
    assert_eq!(h.events(detail_types::ONBOARDING_FAILED).await.len(), 0);
    assert_eq!(h.events(detail_types::ONBOARDING_INITIATED).await.len(), 1);
    assert_eq!(h.events(detail_types::ONBOARDING_PROVISIONED).await.len(), 1);
}

#[tokio::test]
async fn test_t2_provision_timeout() {
    let h = Harness::new();
    let id = h.orchestrator.start(request("T2")).await.unwrap();
    let token = h.token(&id).await;

    h.clock.advance(provision_window());
    assert!(h.orchestrator.fire_timeout(&id).await.unwrap());

    let failed = h.execution(&id).await;
    assert_eq!(failed.state, WorkflowState::Failed);
    assert_eq!(failed.version, 3);
    assert_eq!(failed.failure_reason, Some(FailureReason::StepTimeout));
    assert_eq!(failed.history.len(), 2);
    let last = failed.history.last().unwrap();
    assert_eq!(last.step_name, StepName::Provision);
    assert_eq!(last.outcome, StepOutcome::Failure);
    let detail = last.error_detail.as_ref().unwrap();
    assert_eq!(detail["reason"], json!("StepTimeout"));
    assert_eq!(detail["handledBy"], json!("ErrorHandler"));

    let tenant = h.orchestrator.tenant("T2").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Failed);

    let failures = h.events(detail_types::ONBOARDING_FAILED).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].detail["reason"], json!("StepTimeout"));
    assert_eq!(failures[0].detail["executionId"], json!(id.as_str()));

    // A late callback is rejected and changes nothing.
    h.clock.advance(Duration::minutes(1));
    let late = h
        .orchestrator
        .resume(&token, StepOutcome::Success, json!({}))
        .await
        .unwrap();
    assert_eq!(late, ResumeResponse::rejected(ResumeRejection::TokenInvalid));
    assert_eq!(h.execution(&id).await, failed);
}

#[tokio::test]
async fn test_timeout_fires_exactly_once() {
    let h = Harness::new();
    let id = h.orchestrator.start(request("t-once")).await.unwrap();

    h.clock.advance(provision_window() - Duration::seconds(1));
    assert!(!h.orchestrator.fire_timeout(&id).await.unwrap());
    assert_eq!(h.execution(&id).await.version, 2);

    h.clock.advance(Duration::seconds(1));
    assert!(h.orchestrator.fire_timeout(&id).await.unwrap());
    assert!(!h.orchestrator.fire_timeout(&id).await.unwrap());
    assert!(h.orchestrator.expire_overdue().await.unwrap().is_empty());

    assert_eq!(h.execution(&id).await.version, 3);
    assert_eq!(h.events(detail_types::ONBOARDING_FAILED).await.len(), 1);
}

#[tokio::test]
async fn test_token_is_single_use() {
    let h = Harness::new();
    let id = h.orchestrator.start(request("t-single")).await.unwrap();
    let token = h.token(&id).await;

    let first = h
        .orchestrator
        .resume(&token, StepOutcome::Success, json!({ "stackId": "s-1" }))
        .await
        .unwrap();
    assert!(first.accepted);
    let after_first = h.execution(&id).await;
    let tenant_after_first = h.orchestrator.tenant("t-single").await.unwrap();

    let second = h
        .orchestrator
        .resume(&token, StepOutcome::Failure, json!({ "error": "duplicate" }))
        .await
        .unwrap();
    assert_eq!(
        second,
        ResumeResponse::rejected(ResumeRejection::AlreadyConsumed)
    );
    assert_eq!(h.execution(&id).await, after_first);
    assert_eq!(
        h.orchestrator.tenant("t-single").await.unwrap(),
        tenant_after_first
    );
    assert_eq!(h.events(detail_types::ONBOARDING_SUCCEEDED).await.len(), 1);
}

#[tokio::test]
async fn test_token_redeemed_after_execution_moved_on_stays_invalid() {
    let h = Harness::new();
    let id = h.orchestrator.start(request("t-moved")).await.unwrap();
    let token = h.token(&id).await;

    // Another writer wins the version while the token is still outstanding.
    let suspended = h.execution(&id).await;
    let mut failed = suspended.clone();
    failed.state = WorkflowState::Failed;
    failed.version = suspended.version + 1;
    failed.active_callback_token_id = None;
    failed.failure_reason = Some(FailureReason::StepTimeout);
    assert!(h
        .stores
        .executions
        .swap_execution(suspended.version, &failed)
        .await
        .unwrap());

    for _ in 0..2 {
        let response = h
            .orchestrator
            .resume(&token, StepOutcome::Success, json!({}))
            .await
            .unwrap();
        assert_eq!(
            response,
            ResumeResponse::rejected(ResumeRejection::TokenInvalid)
        );
    }

    let stored = h.stores.callbacks.load_token(&token).await.unwrap().unwrap();
    assert_eq!(stored.status, TokenStatus::Invalidated);
    assert_eq!(h.execution(&id).await, failed);
    assert!(h.events(detail_types::ONBOARDING_SUCCEEDED).await.is_empty());
}

#[tokio::test]
async fn test_unknown_token_is_invalid() {
    let h = Harness::new();
    let response = h
        .orchestrator
        .resume(&TokenId::from("cbt_forged"), StepOutcome::Success, json!({}))
        .await
        .unwrap();
    assert_eq!(
        response,
        ResumeResponse::rejected(ResumeRejection::TokenInvalid)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resume_and_timeout_race_has_one_winner() {
    let mut resume_wins = 0;
    let mut timeout_wins = 0;

    for round in 0..25 {
        let h = Harness::new();
        let tenant_id = format!("t-race-{round}");
        let id = h.orchestrator.start(request(&tenant_id)).await.unwrap();
        let token = h.token(&id).await;
        let suspended = h.execution(&id).await;

        // One instance still inside the window, another already past it.
        let deadline = t0() + provision_window();
        h.clock.set(deadline - Duration::seconds(1));
        let late_instance = h.sibling(ManualClock::new(deadline + Duration::seconds(1)));

        let (resumed, fired) = tokio::join!(
            h.orchestrator
                .resume(&token, StepOutcome::Success, json!({ "stackId": "s" })),
            late_instance.fire_timeout(&id)
        );
        let resumed = resumed.unwrap();
        let fired = fired.unwrap();
        assert_ne!(resumed.accepted, fired, "exactly one path must win");

        let end = h.execution(&id).await;
        let provision_entries = end
            .history
            .iter()
            .filter(|r| r.step_name == StepName::Provision)
            .count();
        assert_eq!(provision_entries, 1);

        if resumed.accepted {
            resume_wins += 1;
            assert_eq!(end.state, WorkflowState::Succeeded);
            assert_eq!(end.version, suspended.version + 2);
            assert_eq!(end.history.len(), suspended.history.len() + 2);
        } else {
            timeout_wins += 1;
            assert_eq!(resumed.reason, Some(ResumeRejection::TokenInvalid));
            assert_eq!(end.state, WorkflowState::Failed);
            assert_eq!(end.version, suspended.version + 1);
            assert_eq!(end.history.len(), suspended.history.len() + 1);

            // The losing callback redeemed the token first; redelivery must
            // still see it as invalid, not consumed.
            let redelivered = h
                .orchestrator
                .resume(&token, StepOutcome::Success, json!({ "stackId": "s" }))
                .await
                .unwrap();
            assert_eq!(
                redelivered,
                ResumeResponse::rejected(ResumeRejection::TokenInvalid)
            );
            assert_eq!(h.execution(&id).await, end);
        }

        let terminal_events = h.events(detail_types::ONBOARDING_SUCCEEDED).await.len()
            + h.events(detail_types::ONBOARDING_FAILED).await.len();
        assert_eq!(terminal_events, 1);
    }

    assert_eq!(resume_wins + timeout_wins, 25);
}

#[tokio::test]
async fn test_initiate_failure_fails_tenant() {
    let h = Harness::with_handlers(|handlers| {
        handlers.with_initiate(ScriptedStep::failing(StepName::Initiate, "QuotaExceeded"))
    });
    let id = h.orchestrator.start(request("t-init")).await.unwrap();

    let failed = h.execution(&id).await;
    assert_eq!(failed.state, WorkflowState::Failed);
    assert_eq!(failed.version, 2);
    assert_eq!(failed.failure_reason, Some(FailureReason::StepFailure));
    assert_eq!(failed.history.len(), 1);
    assert_eq!(failed.history[0].step_name, StepName::Initiate);
    assert_eq!(
        failed.history[0].error_detail.as_ref().unwrap()["detail"]["error"],
        json!("QuotaExceeded")
    );

    let tenant = h.orchestrator.tenant("t-init").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Failed);
    assert_eq!(h.events(detail_types::ONBOARDING_FAILED).await.len(), 1);
    assert!(h
        .events(&h.event_config.provisioning_request_detail_type)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_provision_dispatch_failure_invalidates_token() {
    let h = Harness::with_handlers(|handlers| {
        handlers.with_provision(ScriptedStep::failing(StepName::Provision, "BusDown"))
    });
    let id = h.orchestrator.start(request("t-prov")).await.unwrap();

    let failed = h.execution(&id).await;
    assert_eq!(failed.state, WorkflowState::Failed);
    assert_eq!(failed.version, 3);
    assert_eq!(failed.history.len(), 2);
    assert_eq!(failed.history[1].step_name, StepName::Provision);
    assert_eq!(failed.active_callback_token_id, None);

    let outstanding = h.stores.callbacks.outstanding_tokens(&id).await.unwrap();
    assert!(outstanding.is_empty());

    let tenant = h.orchestrator.tenant("t-prov").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Failed);
    assert_eq!(h.events(detail_types::ONBOARDING_FAILED).await.len(), 1);
}

#[tokio::test]
async fn test_provision_failure_callback_fails_workflow() {
    let h = Harness::new();
    let id = h.orchestrator.start(request("t-cb-fail")).await.unwrap();
    let token = h.token(&id).await;

    let response = h
        .orchestrator
        .resume(
            &token,
            StepOutcome::Failure,
            json!({ "error": "StackRollback" }),
        )
        .await
        .unwrap();
    assert!(response.accepted);

    let failed = h.execution(&id).await;
    assert_eq!(failed.state, WorkflowState::Failed);
    assert_eq!(failed.version, 3);
    assert_eq!(failed.failure_reason, Some(FailureReason::StepFailure));
    let tenant = h.orchestrator.tenant("t-cb-fail").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Failed);

    let stored_token = h.stores.callbacks.load_token(&token).await.unwrap().unwrap();
    assert_eq!(stored_token.status, TokenStatus::Consumed);
    assert_eq!(h.events(detail_types::ONBOARDING_FAILED).await.len(), 1);
}

#[tokio::test]
async fn test_complete_failure_after_valid_resume() {
    let h = Harness::with_handlers(|handlers| {
        handlers.with_complete(ScriptedStep::failing(StepName::Complete, "DnsNotReady"))
    });
    let id = h.orchestrator.start(request("t-complete")).await.unwrap();
    let token = h.token(&id).await;

    let response = h
        .orchestrator
        .resume(&token, StepOutcome::Success, json!({}))
        .await
        .unwrap();
    assert!(response.accepted);

    let failed = h.execution(&id).await;
    assert_eq!(failed.state, WorkflowState::Failed);
    assert_eq!(failed.version, 4);
    let outcomes: Vec<_> = failed
        .history
        .iter()
        .map(|r| (r.step_name, r.outcome))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            (StepName::Initiate, StepOutcome::Success),
            (StepName::Provision, StepOutcome::Success),
            (StepName::Complete, StepOutcome::Failure),
        ]
    );

    let tenant = h.orchestrator.tenant("t-complete").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Failed);
    assert_eq!(h.events(detail_types::ONBOARDING_FAILED).await.len(), 1);
    assert!(h.events(detail_types::ONBOARDING_SUCCEEDED).await.is_empty());
}

#[tokio::test]
async fn test_invalid_request_persists_nothing() {
    let h = Harness::new();
    let result = h
        .orchestrator
        .start(OnboardingRequest::new("t-bad", "  ", json!({})))
        .await;
    assert!(matches!(result, Err(OnboardingError::Validation { .. })));

    assert!(h
        .stores
        .executions
        .executions_for_tenant("t-bad")
        .await
        .unwrap()
        .is_empty());
    assert!(h.stores.tenants.load_tenant("t-bad").await.unwrap().is_none());
    assert!(h.bus.published().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_hanging_initiate_is_bounded_by_its_deadline() {
    let h = Harness::with_handlers(|handlers| {
        handlers.with_initiate(Arc::new(HangingStep(StepName::Initiate)))
    });
    let id = h.orchestrator.start(request("t-hang")).await.unwrap();

    let failed = h.execution(&id).await;
    assert_eq!(failed.state, WorkflowState::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::StepTimeout));
    assert_eq!(failed.history.len(), 1);
    assert_eq!(failed.history[0].step_name, StepName::Initiate);

    let tenant = h.orchestrator.tenant("t-hang").await.unwrap().unwrap();
    assert_eq!(tenant.status, TenantStatus::Failed);
}

#[tokio::test]
async fn test_synchronous_provision_completes_without_callback() {
    let h = Harness::with_handlers(|handlers| {
        handlers.with_provision(ScriptedStep::succeeding(
            StepName::Provision,
            json!({ "stackId": "inline" }),
        ))
    });
    let id = h.orchestrator.start(request("t-sync")).await.unwrap();

    let done = h.execution(&id).await;
    assert_eq!(done.state, WorkflowState::Succeeded);
    assert_eq!(done.version, 4);
    assert_eq!(done.output["provisioning"]["stackId"], json!("inline"));
    assert_eq!(h.events(detail_types::ONBOARDING_SUCCEEDED).await.len(), 1);
}

#[tokio::test]
async fn test_failed_tenant_can_be_resubmitted() {
    let h = Harness::new();
    let first = h.orchestrator.start(request("t-again")).await.unwrap();
    h.clock.advance(provision_window());
    assert!(h.orchestrator.fire_timeout(&first).await.unwrap());

    let second = h.orchestrator.start(request("t-again")).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(
        h.orchestrator.tenant("t-again").await.unwrap().unwrap().status,
        TenantStatus::Pending
    );

    let token = h.token(&second).await;
    h.orchestrator
        .resume(&token, StepOutcome::Success, json!({}))
        .await
        .unwrap();
    assert_eq!(
        h.orchestrator.tenant("t-again").await.unwrap().unwrap().status,
        TenantStatus::Active
    );

    let executions = h.orchestrator.executions_for_tenant("t-again").await.unwrap();
    let states: Vec<_> = executions.iter().map(|e| e.state).collect();
    assert_eq!(states, vec![WorkflowState::Failed, WorkflowState::Succeeded]);
}

#[tokio::test]
async fn test_active_tenant_is_not_onboarded_twice() {
    let h = Harness::new();
    let first = h.orchestrator.start(request("t-live")).await.unwrap();
    let token = h.token(&first).await;
    h.orchestrator
        .resume(&token, StepOutcome::Success, json!({}))
        .await
        .unwrap();

    let second = h.orchestrator.start(request("t-live")).await.unwrap();
    let refused = h.execution(&second).await;
    assert_eq!(refused.state, WorkflowState::Failed);
    assert_eq!(refused.history[0].step_name, StepName::Initiate);

    // The catch-all never clobbers an ACTIVE tenant.
    assert_eq!(
        h.orchestrator.tenant("t-live").await.unwrap().unwrap().status,
        TenantStatus::Active
    );
}

#[tokio::test]
async fn test_watchdog_sweep_expires_only_overdue_executions() {
    let h = Harness::new();
    let early = h.orchestrator.start(request("t-early")).await.unwrap();
    h.clock.advance(Duration::hours(1));
    let later = h.orchestrator.start(request("t-later")).await.unwrap();

    h.clock.advance(Duration::hours(1));
    let watchdog = TimeoutWatchdog::new(
        Arc::new(h.orchestrator.clone()),
        &tenant_onboarding::config::WatchdogConfig::default(),
    );
    let expired = watchdog.sweep_once().await.unwrap();

    assert_eq!(expired, vec![early.clone()]);
    assert_eq!(h.execution(&early).await.state, WorkflowState::Failed);
    assert_eq!(
        h.execution(&later).await.state,
        WorkflowState::RunningProvision
    );
}
