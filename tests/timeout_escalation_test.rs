//! Retry exhaustion escalates a step to the ledger without ending the scan.

mod common;

use common::*;
use spectro_scan::network::{Message, MessageKind, StepOutcome};
use spectro_scan::scan::{RetryLedger, ScanRunner, ScanStep, StepQueue};

#[tokio::test]
async fn unanswered_trigger_is_sent_four_times_then_escalated() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("failed_steps.jsonl");
    let (a, b) = link_pair();

    let mut scripted = ScriptedAnalyzer::new(b);
    let analyzer = tokio::spawn(async move {
        scripted.ready().await;
        let first = scripted.expect_step().await;
        assert_eq!(first.step_index, 0);
        scripted.ack(MessageKind::Step, 0).await;
        assert_eq!(scripted.recv().await, Message::Arm);
        scripted.ack(MessageKind::Arm, 0).await;

        // Swallow every TRIG for step 0.
        let mut sent_at = Vec::new();
        for _ in 0..4 {
            match scripted.recv().await {
                Message::Trig(trig) => sent_at.push(trig.sent_at_ms),
                other => panic!("expected TRIG, got {other:?}"),
            }
        }

        // The controller moves on without waiting for READY.
        let second = scripted.expect_step().await;
        assert_eq!(second.step_index, 1);
        scripted.ack(MessageKind::Step, 1).await;
        assert_eq!(scripted.recv().await, Message::Arm);
        scripted.ack(MessageKind::Arm, 1).await;
        assert!(matches!(scripted.recv().await, Message::Trig(_)));
        scripted.ack(MessageKind::Trig, 1).await;
        scripted.report(1, 0.01).await;
        scripted.ready().await;
        sent_at
    });

    let mut runner = ScanRunner::new(controller(a, controller_settings()), gate(), &ledger_path);
    let queue = StepQueue::new(vec![ScanStep::new(0, 0.5), ScanStep::new(1, 1.0)]).unwrap();
    let report = runner.run_pass(queue, false).await.unwrap();

    let sent_at = analyzer.await.unwrap();
    assert_eq!(sent_at.len(), 4);
    assert!(sent_at.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].step_index, 1);
    assert!(report.results[0].valid);

    let ledger = RetryLedger::load(&ledger_path).unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].step_index, 0);
    assert_eq!(ledger[0].voltage, 0.5);
    assert_eq!(ledger[0].reason, "protocol-timeout");
}

#[tokio::test]
async fn unanswered_step_reports_its_phase() {
    let (a, b) = link_pair();
    let mut scripted = ScriptedAnalyzer::new(b);
    let mut session = controller(a, controller_settings());

    scripted.ready().await;
    let outcome = session.run_step(ScanStep::new(2, 0.0), false).await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::TimedOut {
            phase: MessageKind::Step
        }
    );

    let mut steps = 0;
    while let Some(message) = scripted
        .link
        .recv_timeout(std::time::Duration::from_millis(20))
        .await
        .unwrap()
    {
        assert_eq!(message.kind(), MessageKind::Step);
        steps += 1;
    }
    assert_eq!(steps, 4);
}

#[tokio::test]
async fn repeated_step_is_accepted_and_arm_can_still_time_out() {
    let (a, b) = link_pair();
    let mut scripted = ScriptedAnalyzer::new(b);
    let mut settings = controller_settings();
    settings.ready_timeout = std::time::Duration::from_millis(100);
    let mut session = controller(a, settings);

    let analyzer = tokio::spawn(async move {
        scripted.ready().await;
        // First STEP goes unanswered, the repeat is acknowledged.
        scripted.expect_step().await;
        let again = scripted.expect_step().await;
        scripted.ack(MessageKind::Step, again.step_index).await;
        assert_eq!(scripted.recv().await, Message::Arm);
        scripted
    });

    // With ARM unanswered the step ends in the ARM phase.
    let outcome = session.run_step(ScanStep::new(3, 0.0), false).await.unwrap();
    assert_eq!(
        outcome,
        StepOutcome::TimedOut {
            phase: MessageKind::Arm
        }
    );
    let _scripted = analyzer.await.unwrap();
}
