//! Order Approval Example - Unload While Waiting, Resume Later
//!
//! An order workflow validates the order, checkpoints, and then waits for a
//! manager's decision on a bookmark. While it waits, the host saves the
//! instance to a store and drops the executor. The decision arrives later and
//! a fresh executor is restored from the stored snapshot to finish the order.
//!
//! ## Scenario
//!
//! - Validate: reads the order id from a host property
//! - Checkpoint: asks the host to persist before waiting
//! - Approval: waits on the `approval` bookmark
//! - Ship: runs once the approval callback returned
//!
//! ## Run
//!
//! ```bash
//! cargo run --example order_approval
//! ```

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use weft::prelude::*;
use weft::storage::{persist_to_store, StoredInstance};

// =============================================================================
// Activities
// =============================================================================

struct Validate;

impl Activity for Validate {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Validate")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let order = ctx
            .find_property("order")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkflowFault::activity("no order id"))?
            .to_string();
        println!("[validate] order {order} looks fine");
        Ok(())
    }
}

struct Checkpoint;

impl Activity for Checkpoint {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Checkpoint").with_callback("persisted")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.request_persist(Some("persisted"))?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        println!("[checkpoint] instance persisted");
        Ok(())
    }
}

struct Approval;

impl Activity for Approval {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Approval")
            .with_result()
            .with_callback("decided")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.create_bookmark("approval", Some("decided"), BookmarkOptions::NONE)?;
        println!("[approval] waiting for a manager");
        Ok(())
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        _handler: &str,
        args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        let CallbackArgs::BookmarkResumed { value, .. } = args else {
            return Ok(());
        };
        if value["approved"] != json!(true) {
            return Err(WorkflowFault::activity("order rejected"));
        }
        println!("[approval] approved by {}", value["by"]);
        ctx.set_result(value)
    }
}

struct Ship;

impl Activity for Ship {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Ship")
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        println!("[ship] label printed");
        Ok(())
    }
}

struct Sequence {
    children: Vec<ActivityId>,
}

impl Sequence {
    fn schedule_next(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let index: usize = ctx.get_as("index")?;
        if let Some(child) = self.children.get(index) {
            ctx.set("index", json!(index + 1))?;
            ctx.schedule_activity(*child, Some("next"), None)?;
        }
        Ok(())
    }
}

impl Activity for Sequence {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Order")
            .with_children(self.children.iter().copied())
            .with_variable("index", json!(0))
            .with_callback("next")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        self.schedule_next(ctx)
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        _handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        if ctx.is_cancellation_requested() {
            return Ok(());
        }
        self.schedule_next(ctx)
    }
}

// =============================================================================
// Host
// =============================================================================

struct StoreHost {
    id: Uuid,
    store: Arc<InMemoryInstanceStore>,
    handle: Handle,
}

impl WorkflowHost for StoreHost {
    fn instance_id(&self) -> Uuid {
        self.id
    }

    fn on_begin_persist(&self, snapshot: ExecutorSnapshot, completion: PersistCompletion) {
        persist_to_store(self.store.clone(), &self.handle, snapshot, completion);
    }

    fn notify_unhandled_exception(&self, fault: &WorkflowFault, _source: Option<ActivityInstanceRef>) {
        println!("[host] unhandled fault: {fault}");
    }
}

fn order_workflow() -> Result<Arc<WorkflowDefinition>, Box<dyn std::error::Error>> {
    let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("order-approval", "1"));
    let children = vec![
        builder.add(Validate),
        builder.add(Checkpoint),
        builder.add(Approval),
        builder.add(Ship),
    ];
    let root = builder.add(Sequence { children });
    Ok(Arc::new(builder.build(root)?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let store = Arc::new(InMemoryInstanceStore::new());
    let host = Arc::new(StoreHost {
        id: Uuid::new_v4(),
        store: store.clone(),
        handle: Handle::current(),
    });

    println!("\n=== Order Approval ===\n");

    let sync = Arc::new(TokioSynchronizationContext::current());
    let executor = ActivityExecutor::new(order_workflow()?, host.clone());
    executor.open(sync.clone());

    let mut properties = BTreeMap::new();
    properties.insert("order".to_string(), json!("A-1001"));
    executor.schedule_root_activity(BTreeMap::new(), properties)?;
    executor.run()?;
    sync.wait_for_idle().await;

    for bookmark in executor.get_all_bookmarks() {
        println!("[host] waiting on {:?} owned by {}", bookmark.name, bookmark.owner_display_name);
    }

    // Save the idle instance and unload it.
    let snapshot = executor.prepare_for_serialization()?;
    let version = store.save(StoredInstance::from_snapshot(&snapshot)?).await?;
    drop(executor);
    println!("[host] unloaded instance {} at version {version}\n", host.id);

    // Later: the decision arrives.
    let snapshot = store.load_snapshot(host.id).await?;
    let restored = ActivityExecutor::on_deserialized(order_workflow()?, host.clone(), snapshot)?;
    restored.open(sync.clone());
    let decision = json!({ "approved": true, "by": "dana" });
    let result = restored.try_resume_host_bookmark(&Bookmark::new("approval"), decision);
    println!("[host] resumption: {result}");
    restored.run()?;
    sync.wait_for_idle().await;

    println!("\n[host] workflow finished as {}", restored.state());
    store.delete(host.id).await?;
    Ok(())
}
