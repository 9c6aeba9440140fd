mod support;

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::*;
use tendril_core::config::DispatcherSettings;
use tendril_core::{assemble, assemble_with, AssembleOptions, Dispatcher, RunOutcome};
use tendril_kernel::parse_ts;

async fn pg_strand(h: &Harness, synchronous: bool) -> String {
    assemble_with::<PgServer>(
        &h.kernel,
        frame(json!({"synchronous": synchronous})),
        AssembleOptions {
            label: Some(PgLabel::WaitCatchUp),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn wait_catch_up_naps_until_the_replica_catches_up() {
    let caught_up = Arc::new(AtomicBool::new(false));
    let h = harness(|r| {
        r.register(PgServer {
            lsn_caught_up: caught_up.clone(),
        });
    });
    let sync_id = pg_strand(&h, true).await;
    let async_id = pg_strand(&h, false).await;

    let out = h.runner.run(&sync_id).await.unwrap();
    let RunOutcome::Napped { label, until } = out else {
        panic!("expected a nap, got {out:?}");
    };
    assert_eq!(label, "wait_catch_up");
    assert!(parse_ts(&until).unwrap() > Utc::now() + chrono::Duration::seconds(25));
    assert!(h.kernel.semaphores(&sync_id).unwrap().is_empty());

    caught_up.store(true, Ordering::SeqCst);
    for (id, next) in [(&sync_id, "wait_synchronization"), (&async_id, "wait")] {
        let out = h.runner.tick(id).await.unwrap();
        assert_eq!(out, RunOutcome::Continued { label: next.into() });
        let row = h.kernel.get_strand(id).unwrap().unwrap();
        assert_eq!(row.label, next);
        assert_eq!(row.stack[0]["synchronization_status"], json!("ready"));
        assert_eq!(h.kernel.semaphores(id).unwrap(), vec!["configure"]);
    }
}

#[tokio::test]
async fn destroy_waits_for_children_before_cleanup() {
    let h = harness(|r| {
        r.register(Resource).register(Member);
    });
    let resource = assemble::<Resource>(&h.kernel, frame(json!({}))).await.unwrap();
    let out = h.runner.run(&resource.id).await.unwrap();
    assert!(matches!(out, RunOutcome::Napped { ref label, .. } if label == "wait"));
    let members = h.kernel.children(&resource.id).unwrap();
    assert_eq!(members.len(), 2);
    for m in &members {
        h.runner.run(&m.id).await.unwrap();
    }

    h.kernel.incr_semaphore(&resource.id, "destroy").unwrap();
    assert_eq!(h.kernel.due_strands(10, &[]).unwrap(), vec![resource.id.clone()]);

    // before_run redirects, then destroy signals both members
    let out = h.runner.tick(&resource.id).await.unwrap();
    assert_eq!(out, RunOutcome::Continued { label: "destroy".into() });
    let out = h.runner.tick(&resource.id).await.unwrap();
    assert_eq!(
        out,
        RunOutcome::Continued {
            label: "wait_children_destroy".into()
        }
    );
    assert!(h.kernel.semaphores(&resource.id).unwrap().is_empty());
    for m in &members {
        assert_eq!(h.kernel.semaphores(&m.id).unwrap(), vec!["destroy"]);
    }

    // members are still alive: the parent donates and they exit
    let out = h.runner.tick(&resource.id).await.unwrap();
    assert_eq!(out, RunOutcome::Donated { children: 2 });
    let row = h.kernel.get_strand(&resource.id).unwrap().unwrap();
    assert_eq!(row.label, "wait_children_destroy");

    let out = h.runner.tick(&resource.id).await.unwrap();
    assert_eq!(out, RunOutcome::Continued { label: "cleanup".into() });
    assert!(h.kernel.children(&resource.id).unwrap().is_empty());

    let out = h.runner.tick(&resource.id).await.unwrap();
    assert_eq!(
        out,
        RunOutcome::Exited(frame(json!({"msg": "resource destroyed"})))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatcher_drives_due_strands_to_completion() {
    let h = harness(|r| {
        r.register(Counter).register(Parent).register(Child);
    });
    let mut ids = Vec::new();
    for limit in 0..3 {
        let s = assemble::<Counter>(&h.kernel, frame(json!({"limit": limit})))
            .await
            .unwrap();
        ids.push(s.id);
    }
    ids.push(assemble::<Parent>(&h.kernel, frame(json!({}))).await.unwrap().id);

    let settings = DispatcherSettings {
        pool_size: 2,
        scan_interval: Duration::from_millis(10),
        ..DispatcherSettings::default()
    };
    let dispatcher = Dispatcher::new(
        h.kernel.clone(),
        h.registry.clone(),
        h.bus.clone(),
        settings.clone(),
    );
    let kernel = h.kernel.clone();
    let watched = ids.clone();
    let all_done = async move {
        loop {
            let done = watched.iter().all(|id| {
                kernel
                    .get_strand(id)
                    .ok()
                    .flatten()
                    .map(|s| s.is_finished())
                    .unwrap_or(false)
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), dispatcher.run(all_done))
        .await
        .expect("dispatcher finished in time")
        .unwrap();

    assert_eq!(dispatcher.in_flight().await, 0);
    let parent = h.kernel.get_strand(&ids[3]).unwrap().unwrap();
    assert_eq!(parent.exitval, Some(frame(json!({"sum": 3, "reaped": 2}))));

    assert_eq!(dispatcher.collect_garbage().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let eager = Dispatcher::new(
        h.kernel.clone(),
        h.registry.clone(),
        h.bus.clone(),
        DispatcherSettings {
            finished_retention: Duration::ZERO,
            ..settings
        },
    );
    assert_eq!(eager.collect_garbage().await.unwrap(), 4);
    assert!(h.kernel.get_strand(&ids[0]).unwrap().is_none());
}
