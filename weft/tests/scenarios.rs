//! End-to-end scenarios driven through the public executor API.
//!
//! Verifies that:
//! 1. A simple tree runs to completion and reports its outputs
//! 2. A bookmark suspends the workflow until the host resumes it
//! 3. Canceling before the first turn ends the root as canceled
//! 4. A fault three levels down reaches its grandparent's handler
//! 5. Same-named bookmarks in two scopes are resumed independently
//! 6. A secondary root hears once that the main root finished
//! 7. A delegate hands every output back to its caller

mod common;

use common::*;
use serde_json::json;
use std::collections::BTreeMap;
use weft::prelude::*;

#[test]
fn test_simple_root_completes() {
    let log = new_log();
    let definition = definition(|b| {
        let first = b.add(Record {
            text: "first",
            log: log.clone(),
        });
        let second = b.add(Record {
            text: "second",
            log: log.clone(),
        });
        b.add(Sequence::new("Main", vec![first, second]))
    });
    let host = RecordingHost::new();
    let executor = ActivityExecutor::new(definition, host.clone());

    start(&executor);

    assert_eq!(entries(&log), vec!["first", "second"]);
    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert!(executor.is_idle());
    assert!(!executor.is_running());
    assert_eq!(host.paused_count(), 1);
    assert!(host.unhandled().is_empty());
}

#[test]
fn test_root_arguments_and_outputs() {
    let definition = definition(|b| b.add(Echo::new(ArgumentBinding::None)));
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    let mut arguments = BTreeMap::new();
    arguments.insert("Value".to_string(), json!({ "order": 7 }));
    executor
        .schedule_root_activity(arguments, BTreeMap::new())
        .unwrap();
    executor.run().unwrap();

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert_eq!(executor.workflow_outputs()["Result"], json!({ "order": 7 }));
}

#[test]
fn test_unknown_root_argument_is_rejected() {
    let definition = definition(|b| b.add(Echo::new(ArgumentBinding::None)));
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    let mut arguments = BTreeMap::new();
    arguments.insert("Missing".to_string(), json!(1));
    let err = executor
        .schedule_root_activity(arguments, BTreeMap::new())
        .unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidOperation(_)));
}

#[test]
fn test_bookmark_wait_and_resume() {
    let definition = definition(|b| b.add(WaitForBookmark { name: "approve" }));
    let host = RecordingHost::new();
    let executor = ActivityExecutor::new(definition, host.clone());

    start(&executor);

    assert_eq!(executor.state(), ActivityInstanceState::Executing);
    assert!(executor.is_idle());
    let bookmarks = executor.get_all_bookmarks();
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].name, "approve");
    assert_eq!(bookmarks[0].owner_display_name, "Wait(approve)");

    let result = executor.try_resume_host_bookmark(&Bookmark::new("approve"), json!(42));
    assert_eq!(result, BookmarkResumptionResult::Success);
    executor.run().unwrap();

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert_eq!(executor.workflow_outputs()["Result"], json!(42));
    assert!(executor.get_all_bookmarks().is_empty());
    assert_eq!(host.paused_count(), 2);

    let again = executor.try_resume_host_bookmark(&Bookmark::new("approve"), json!(43));
    assert_eq!(again, BookmarkResumptionResult::NotFound);
}

#[test]
fn test_cancel_before_start() {
    let log = new_log();
    let definition = definition(|b| {
        let step = b.add(Record {
            text: "never",
            log: log.clone(),
        });
        b.add(Sequence::new("Main", vec![step]))
    });
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    executor
        .schedule_root_activity(BTreeMap::new(), BTreeMap::new())
        .unwrap();
    assert!(executor.cancel_root_activity());
    executor.run().unwrap();

    assert_eq!(executor.state(), ActivityInstanceState::Canceled);
    assert!(entries(&log).is_empty());
}

#[test]
fn test_cancel_while_waiting_uses_default_cancelation() {
    let definition = definition(|b| {
        let wait = b.add(WaitForBookmark { name: "approve" });
        b.add(Sequence::new("Main", vec![wait]))
    });
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    start(&executor);
    assert_eq!(executor.get_all_bookmarks().len(), 1);

    assert!(executor.cancel_root_activity());
    executor.run().unwrap();

    assert_eq!(executor.state(), ActivityInstanceState::Canceled);
    assert!(executor.get_all_bookmarks().is_empty());
    assert!(executor.workflow_outputs().is_empty());
}

#[test]
fn test_fault_reaches_grandparent_handler() {
    let log = new_log();
    let mut catcher = None;
    let mut ids = None;
    let definition = definition(|b| {
        let thrower = b.add(Thrower { message: "boom" });
        let after = b.add(Record {
            text: "after",
            log: log.clone(),
        });
        let body = b.add(Sequence::new("Body", vec![thrower, after]));
        let try_catch = TryCatch::new(body, true);
        catcher = Some(try_catch.seen.clone());
        ids = Some((thrower, body));
        b.add(try_catch)
    });
    let (thrower, body) = ids.unwrap();
    let seen = catcher.unwrap();
    let host = RecordingHost::new();
    let executor = ActivityExecutor::new(definition, host.clone());

    start(&executor);

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert!(entries(&log).is_empty());
    assert!(host.unhandled().is_empty());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        CallbackArgs::Faulted {
            fault,
            propagated_from,
            original_source,
        } => {
            assert_eq!(fault.message(), "boom");
            assert_eq!(propagated_from.activity, body);
            let source = original_source.unwrap();
            assert_eq!(source.activity, thrower);
            assert_eq!(source.state, ActivityInstanceState::Faulted);
        }
        other => panic!("expected a fault delivery, got {other:?}"),
    }
}

/// Catches a fault from its body and raises it again from itself.
struct Rethrow {
    body: ActivityId,
}

impl Activity for Rethrow {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Rethrow")
            .with_child(self.body)
            .with_callback("faulted")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.schedule_activity(self.body, None, Some("faulted"))?;
        Ok(())
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        if let CallbackArgs::Faulted {
            fault,
            original_source,
            ..
        } = args
        {
            ctx.rethrow(fault, original_source);
        }
        Ok(())
    }
}

#[test]
fn test_rethrow_keeps_original_source() {
    let log = new_log();
    let mut catcher = None;
    let mut ids = None;
    let definition = definition(|b| {
        let thrower = b.add(Thrower { message: "boom" });
        let after = b.add(Record {
            text: "after",
            log: log.clone(),
        });
        let body = b.add(Sequence::new("Body", vec![thrower, after]));
        let rethrow = b.add(Rethrow { body });
        let try_catch = TryCatch::new(rethrow, true);
        catcher = Some(try_catch.seen.clone());
        ids = Some((thrower, rethrow));
        b.add(try_catch)
    });
    let (thrower, rethrow) = ids.unwrap();
    let seen = catcher.unwrap();
    let host = RecordingHost::new();
    let executor = ActivityExecutor::new(definition, host.clone());

    start(&executor);

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert!(entries(&log).is_empty());
    assert!(host.unhandled().is_empty());

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        CallbackArgs::Faulted {
            fault,
            propagated_from,
            original_source,
        } => {
            assert_eq!(fault.message(), "boom");
            assert_eq!(propagated_from.activity, rethrow);
            assert_eq!(original_source.unwrap().activity, thrower);
        }
        other => panic!("expected a fault delivery, got {other:?}"),
    }
}

#[test]
fn test_same_bookmark_name_in_two_scopes() {
    let log = new_log();
    let first_scope = Uuid::new_v4();
    let second_scope = Uuid::new_v4();
    let definition = definition(|b| {
        b.add(ScopedWaiter {
            scopes: vec![first_scope, second_scope],
            log: log.clone(),
        })
    });
    let host = RecordingHost::new();
    let executor = ActivityExecutor::new(definition, host.clone());

    start(&executor);

    let all = executor.get_all_bookmarks();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|b| b.name == "reply"));
    assert!(executor.get_bookmarks(None).is_empty());
    assert_eq!(
        executor
            .get_bookmarks(Some(&BookmarkScope::new(first_scope)))
            .len(),
        1
    );
    assert_eq!(*host.associated.lock().unwrap(), vec![first_scope, second_scope]);

    // Non-scoped lookups do not see scoped bookmarks.
    assert_eq!(
        executor.try_resume_host_bookmark(&Bookmark::new("reply"), json!("x")),
        BookmarkResumptionResult::NotFound
    );

    let reply = Bookmark::new("reply");
    assert_eq!(
        executor.try_resume_bookmark(&reply, json!("second"), Some(&BookmarkScope::new(second_scope))),
        BookmarkResumptionResult::Success
    );
    executor.run().unwrap();
    assert_eq!(executor.state(), ActivityInstanceState::Executing);
    assert_eq!(entries(&log), vec![format!("{second_scope}=\"second\"")]);

    // A bookmark value that carries its scope routes the same way.
    let scoped = Bookmark::new("reply").with_scope(BookmarkScope::new(first_scope));
    assert_eq!(
        executor.try_resume_host_bookmark(&scoped, json!("first")),
        BookmarkResumptionResult::Success
    );
    executor.run().unwrap();

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert_eq!(entries(&log).len(), 2);
    let mut disassociated = host.disassociated.lock().unwrap().clone();
    disassociated.sort();
    let mut expected = vec![first_scope, second_scope];
    expected.sort();
    assert_eq!(disassociated, expected);
}

#[test]
fn test_uninitialized_scope_is_promoted_on_resume() {
    let log = new_log();
    let definition = definition(|b| b.add(LateScopeWaiter { log: log.clone() }));
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    start(&executor);
    let correlation = Uuid::new_v4();
    let result = executor.try_resume_bookmark(
        &Bookmark::new("reply"),
        json!(1),
        Some(&BookmarkScope::new(correlation)),
    );
    assert_eq!(result, BookmarkResumptionResult::Success);
    executor.run().unwrap();

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert_eq!(entries(&log), vec![format!("{correlation}=1")]);
}

#[test]
fn test_variable_and_expression_bindings() {
    let log = new_log();
    let definition = definition(|b| {
        let sum = b.add(Sum {
            left: "a",
            right: "b",
        });
        let echo = b.add(Echo::new(ArgumentBinding::Expression(sum)).into_variable("total"));
        let copy = b.add(Echo::new(ArgumentBinding::Variable("total".into())).into_variable("copy"));
        let capture = b.add(Capture {
            name: "copy",
            log: log.clone(),
        });
        b.add(
            Sequence::new("Main", vec![echo, copy, capture])
                .with_variable("a", json!(2))
                .with_variable("b", json!(3))
                .with_variable("total", json!(0))
                .with_variable("copy", json!(0)),
        )
    });
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    start(&executor);

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert_eq!(entries(&log), vec!["copy=5"]);
}

#[test]
fn test_slow_expression_runs_as_child_instance() {
    let definition = definition(|b| {
        let constant = b.add(Constant { value: json!("hi") });
        b.add(Echo::new(ArgumentBinding::Expression(constant)))
    });
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    start(&executor);

    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert_eq!(executor.workflow_outputs()["Result"], json!("hi"));
}

/// Registers one initialized scope per id and waits on "reply" in each.
struct ScopedWaiter {
    scopes: Vec<Uuid>,
    log: Log,
}

impl Activity for ScopedWaiter {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("ScopedWaiter").with_callback("resumed")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        for id in &self.scopes {
            let scope = ctx.register_bookmark_scope(*id)?;
            ctx.create_bookmark_in_scope("reply", Some("resumed"), &scope, BookmarkOptions::NONE)?;
        }
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        if let CallbackArgs::BookmarkResumed { bookmark, value } = args {
            let scope = bookmark
                .scope()
                .and_then(|s| s.id())
                .map(|id| id.to_string())
                .unwrap_or_default();
            self.log.lock().unwrap().push(format!("{scope}={value}"));
        }
        Ok(())
    }
}

/// Waits on "reply" in a scope whose correlation id is not known yet.
struct LateScopeWaiter {
    log: Log,
}

impl Activity for LateScopeWaiter {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("LateScopeWaiter").with_callback("resumed")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let scope = ctx.create_bookmark_scope();
        ctx.create_bookmark_in_scope("reply", Some("resumed"), &scope, BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        if let CallbackArgs::BookmarkResumed { bookmark, value } = args {
            let scope = bookmark
                .scope()
                .and_then(|s| s.id())
                .map(|id| id.to_string())
                .unwrap_or_default();
            self.log.lock().unwrap().push(format!("{scope}={value}"));
        }
        Ok(())
    }
}

/// Starts `side` as a secondary root, then finishes right away.
struct Spawner {
    side: ActivityId,
}

impl Activity for Spawner {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Spawner").with_child(self.side)
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.schedule_secondary_root(self.side, BTreeMap::new())?;
        Ok(())
    }
}

/// Outlives the main root: waits on `side` and logs the main root's end.
struct Side {
    log: Log,
}

impl Activity for Side {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Side")
            .with_callback("main_done")
            .with_callback("resumed")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.register_main_root_complete_callback("main_done")?;
        ctx.create_bookmark("side", Some("resumed"), BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        let entry = match args {
            CallbackArgs::BookmarkResumed { value, .. } => format!("{handler}={value}"),
            _ => handler.to_string(),
        };
        self.log.lock().unwrap().push(entry);
        Ok(())
    }
}

#[test]
fn test_secondary_root_hears_main_root_complete() {
    let log = new_log();
    let definition = definition(|b| {
        let side = b.add(Side { log: log.clone() });
        b.add(Spawner { side })
    });
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    start(&executor);

    // The root closed before the secondary root registered its callback.
    assert_eq!(entries(&log), vec![r#"main_done="Closed""#]);
    assert_eq!(executor.state(), ActivityInstanceState::Executing);
    assert_eq!(executor.get_all_bookmarks().len(), 1);

    assert_eq!(
        executor.try_resume_host_bookmark(&Bookmark::new("side"), json!("go")),
        BookmarkResumptionResult::Success
    );
    executor.run().unwrap();

    assert_eq!(
        entries(&log),
        vec![r#"main_done="Closed""#, r#"resumed="go""#]
    );
    assert_eq!(executor.state(), ActivityInstanceState::Closed);
    assert!(executor.get_all_bookmarks().is_empty());
}

/// Adds one to `X` and writes it to `Y`.
struct Increment;

impl Activity for Increment {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Increment")
            .with_in_argument("X", ArgumentBinding::None)
            .with_out_argument("Y", ArgumentBinding::None)
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let x: i64 = ctx.get_as("X")?;
        ctx.set("Y", json!(x + 1))
    }
}

/// Invokes `handler` as a delegate and logs the outputs it returns.
struct Invoke {
    handler: ActivityId,
    log: Log,
}

impl Activity for Invoke {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Invoke")
            .with_child(self.handler)
            .with_callback("done")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let mut inputs = BTreeMap::new();
        inputs.insert("X".to_string(), json!(41));
        ctx.schedule_delegate(self.handler, inputs, Some("done"), None)?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        if let CallbackArgs::Completed { outputs, .. } = args {
            self.log.lock().unwrap().push(json!(outputs).to_string());
        }
        Ok(())
    }
}

#[test]
fn test_delegate_gathers_outputs() {
    let log = new_log();
    let definition = definition(|b| {
        let handler = b.add(Increment);
        b.add(Invoke {
            handler,
            log: log.clone(),
        })
    });
    let executor = ActivityExecutor::new(definition, RecordingHost::new());

    start(&executor);

    assert_eq!(entries(&log), vec![r#"{"Y":42}"#]);
    assert_eq!(executor.state(), ActivityInstanceState::Closed);
}
