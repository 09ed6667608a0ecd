//! Property tests: random operation sequences keep the timeline and the
//! store in agreement.

mod common;

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::runtime::Runtime;

use mandre_scheduler::{
    MemoryStore, RetryPolicy, Scheduler, SchedulerConfig, TaskSpec, TaskState, TaskStore,
};

use common::{Harness, t};

#[derive(Debug, Clone)]
enum Op {
    RegisterOnce { delay: i64, max_attempts: u32 },
    RegisterInterval { seconds: u64, max_attempts: u32 },
    Tick { advance: i64, failures: usize },
    Cancel(usize),
    Suspend(usize),
    Resume(usize),
    Restart,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..60, 1u32..4).prop_map(|(delay, max_attempts)| Op::RegisterOnce {
            delay,
            max_attempts
        }),
        (1u64..30, 1u32..4).prop_map(|(seconds, max_attempts)| Op::RegisterInterval {
            seconds,
            max_attempts
        }),
        (0i64..40, 0usize..3).prop_map(|(advance, failures)| Op::Tick { advance, failures }),
        any::<usize>().prop_map(Op::Cancel),
        any::<usize>().prop_map(Op::Suspend),
        any::<usize>().prop_map(Op::Resume),
        Just(Op::Restart),
    ]
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_secs(1),
        2.0,
        Duration::from_secs(30),
    )
}

async fn check_invariants(scheduler: &Scheduler, store: &MemoryStore) -> Result<(), String> {
    let tasks = scheduler.list().await;
    let mut earliest = None;

    for task in &tasks {
        if !task.is_consistent() {
            return Err(format!("inconsistent task {task:?}"));
        }
        if task.attempt_count > task.retry_policy.max_attempts {
            return Err(format!("attempts over budget for {}", task.id));
        }
        if task.state == TaskState::Firing {
            return Err(format!("task {} left firing after tick", task.id));
        }
        let stored = store.get(&task.id).await.map_err(|e| e.to_string())?;
        if stored.as_ref() != Some(task) {
            return Err(format!("memory and store disagree on {}", task.id));
        }
        if task.state == TaskState::Pending {
            earliest = earliest.min(task.next_fire_at).or(task.next_fire_at);
        }
    }

    if store.len() != tasks.len() {
        return Err("store holds records the scheduler does not know".to_string());
    }
    let peek = scheduler.peek_next().await;
    if peek != earliest {
        return Err(format!("peek_next {peek:?} != earliest pending {earliest:?}"));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn timeline_matches_store(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = Runtime::new().unwrap();
        let result: Result<(), String> = rt.block_on(async {
            let h = Harness::new(0).await;
            let mut scheduler: Arc<Scheduler> = Arc::clone(&h.scheduler);
            let mut ids = Vec::new();
            let mut now = 0i64;

            for op in &ops {
                match op {
                    Op::RegisterOnce { delay, max_attempts } => {
                        let spec = TaskSpec::once("once", t(now + delay))
                            .with_retry_policy(policy(*max_attempts));
                        ids.push(scheduler.register(spec).await.map_err(|e| e.to_string())?.id);
                    }
                    Op::RegisterInterval { seconds, max_attempts } => {
                        let spec = TaskSpec::interval("every", *seconds)
                            .with_retry_policy(policy(*max_attempts));
                        ids.push(scheduler.register(spec).await.map_err(|e| e.to_string())?.id);
                    }
                    Op::Tick { advance, failures } => {
                        now += advance;
                        h.clock.set(t(now));
                        h.sink.fail_next(*failures);
                        scheduler.tick(t(now)).await;
                    }
                    Op::Cancel(i) if !ids.is_empty() => {
                        scheduler.cancel(&ids[i % ids.len()]).await.map_err(|e| e.to_string())?;
                    }
                    Op::Suspend(i) if !ids.is_empty() => {
                        scheduler.suspend(&ids[i % ids.len()]).await.map_err(|e| e.to_string())?;
                    }
                    Op::Resume(i) if !ids.is_empty() => {
                        scheduler.resume(&ids[i % ids.len()]).await.map_err(|e| e.to_string())?;
                    }
                    Op::Restart => {
                        scheduler = h.restart(SchedulerConfig::default()).await;
                    }
                    _ => {}
                }
                check_invariants(&scheduler, &h.store).await?;
            }
            Ok(())
        });
        prop_assert!(result.is_ok(), "{:?}", result);
    }
}
